use anyhow::{Result, bail};
use byteorder::{LE, ReadBytesExt, WriteBytesExt};
use std::io::{Read, Seek, SeekFrom, Write};
use tracing::instrument;

pub trait Readable {
    fn de<S: Read>(stream: &mut S) -> Result<Self>
    where
        Self: Sized;
    fn de_vec<S: Read>(len: usize, stream: &mut S) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        read_array(len, stream, Self::de)
    }
    fn de_array<S: Read, const N: usize>(stream: &mut S) -> Result<[Self; N]>
    where
        Self: Sized + Copy + Default,
    {
        let mut buf = [Default::default(); N];
        for i in buf.iter_mut() {
            *i = Self::de(stream)?;
        }
        Ok(buf)
    }
}
pub trait Writeable {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()>;
    fn ser_array<S: Write, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()>
    where
        Self: Sized,
    {
        for i in this.as_ref() {
            Self::ser(i, stream)?;
        }
        Ok(())
    }
}
pub trait ReadableCtx<C> {
    fn de<S: Read>(stream: &mut S, ctx: C) -> Result<Self>
    where
        Self: Sized;
}

impl<T> ReadExt for T where T: Read {}
pub trait ReadExt: Read {
    #[instrument(skip_all)]
    fn de<T: Readable>(&mut self) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self)
    }
    #[instrument(skip_all)]
    fn de_ctx<T: ReadableCtx<C>, C>(&mut self, ctx: C) -> Result<T>
    where
        Self: Sized,
    {
        T::de(self, ctx)
    }
}
impl<T> WriteExt for T where T: Write {}
pub trait WriteExt: Write {
    #[instrument(skip_all)]
    fn ser<T: Writeable>(&mut self, value: &T) -> Result<()>
    where
        Self: Sized,
    {
        value.ser(self)
    }
    /// Serialize &[T] without length prefix
    #[instrument(skip_all)]
    fn ser_no_length<T: Writeable, S: AsRef<[T]>>(&mut self, value: &S) -> Result<()>
    where
        Self: Sized,
    {
        T::ser_array(value.as_ref(), self)
    }
}

impl<const N: usize, T: Readable + Default + Copy> Readable for [T; N] {
    #[instrument(skip_all, name = "read_fixed_slice")]
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        T::de_array(stream)
    }
}
impl<const N: usize, T: Writeable> Writeable for [T; N] {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        T::ser_array(self, stream)
    }
}

impl Readable for String {
    fn de<S: Read>(s: &mut S) -> Result<Self> {
        read_string_data(s.de()?, s)
    }
}
impl Writeable for String {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}
impl Writeable for &str {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        write_string(stream, self)
    }
}

impl<T: Readable> Readable for Vec<T> {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        T::de_vec(stream.read_u32::<LE>()? as usize, stream)
    }
}
impl<T: Readable> ReadableCtx<usize> for Vec<T> {
    fn de<S: Read>(stream: &mut S, ctx: usize) -> Result<Self> {
        T::de_vec(ctx, stream)
    }
}
impl<T: Writeable> Writeable for Vec<T> {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.write_u32::<LE>(self.len() as u32)?;
        T::ser_array(self, stream)
    }
}

impl Readable for bool {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u32::<LE>()? != 0)
    }
}
impl Writeable for bool {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u32::<LE>(if *self { 1 } else { 0 })?)
    }
}
impl Readable for u8 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u8()?)
    }
    fn de_vec<S: Read>(len: usize, stream: &mut S) -> Result<Vec<Self>>
    where
        Self: Sized,
    {
        // length comes from untrusted input, so don't allocate it up front
        let mut buf = vec![];
        stream.take(len as u64).read_to_end(&mut buf)?;
        if buf.len() != len {
            bail!("unexpected end of stream: wanted {len} bytes, got {}", buf.len());
        }
        Ok(buf)
    }
    fn de_array<S: Read, const N: usize>(stream: &mut S) -> Result<[Self; N]>
    where
        Self: Sized + Copy + Default,
    {
        let mut buf = [0; N];
        stream.read_exact(&mut buf)?;
        Ok(buf)
    }
}
impl Writeable for u8 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u8(*self)?)
    }
    fn ser_array<S: Write, T: AsRef<[Self]>>(this: T, stream: &mut S) -> Result<()>
    where
        Self: Sized,
    {
        Ok(stream.write_all(this.as_ref())?)
    }
}
impl Readable for u32 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u32::<LE>()?)
    }
}
impl Writeable for u32 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u32::<LE>(*self)?)
    }
}
impl Readable for i32 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_i32::<LE>()?)
    }
}
impl Writeable for i32 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_i32::<LE>(*self)?)
    }
}
impl Readable for u64 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_u64::<LE>()?)
    }
}
impl Writeable for u64 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_u64::<LE>(*self)?)
    }
}
impl Readable for i64 {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(stream.read_i64::<LE>()?)
    }
}
impl Writeable for i64 {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        Ok(stream.write_i64::<LE>(*self)?)
    }
}

#[instrument(skip_all)]
pub fn read_array<S: Read, T, F>(len: usize, stream: &mut S, mut f: F) -> Result<Vec<T>>
where
    F: FnMut(&mut S) -> Result<T>,
{
    let mut array = Vec::with_capacity(len.min(0x10000));
    for _ in 0..len {
        array.push(f(stream)?);
    }
    Ok(array)
}

/// FString payload. Positive length is a null terminated ANSI string, negative is UTF-16.
#[instrument(skip_all)]
pub fn read_string_data<S: Read>(len: i32, stream: &mut S) -> Result<String> {
    if len < 0 {
        let chars = read_array(len.unsigned_abs() as usize, stream, |r| Ok(r.read_u16::<LE>()?))?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        Ok(String::from_utf16(&chars[..length])?)
    } else {
        let chars: Vec<u8> = stream.de_ctx(len as usize)?;
        let length = chars.iter().position(|&c| c == 0).unwrap_or(chars.len());
        Ok(String::from_utf8_lossy(&chars[..length]).into_owned())
    }
}

pub fn write_string<S: Write>(stream: &mut S, value: &str) -> Result<()> {
    if value.is_empty() {
        stream.write_u32::<LE>(0)?;
    } else if value.is_ascii() {
        stream.write_u32::<LE>(value.len() as u32 + 1)?;
        stream.write_all(value.as_bytes())?;
        stream.write_u8(0)?;
    } else {
        let chars: Vec<u16> = value.encode_utf16().collect();
        stream.write_i32::<LE>(-(chars.len() as i32 + 1))?;
        for c in chars {
            stream.write_u16::<LE>(c)?;
        }
        stream.write_u16::<LE>(0)?;
    }
    Ok(())
}

/// Size of the `u32` length + `u8` version prefix carried by every manifest sub-structure.
pub const BLOCK_HEADER_SIZE: u32 = 5;

/// Writes a versioned block. The declared size includes the block header itself.
pub fn write_block<S: Write, F>(stream: &mut S, version: u8, f: F) -> Result<()>
where
    F: FnOnce(&mut Vec<u8>) -> Result<()>,
{
    let mut body = vec![];
    f(&mut body)?;
    stream.ser(&(body.len() as u32 + BLOCK_HEADER_SIZE))?;
    stream.ser(&version)?;
    stream.write_all(&body)?;
    Ok(())
}

/// Reads a versioned block and leaves the stream at `start + declared size`, skipping any
/// trailing fields written by a newer data version.
pub fn read_block<S: Read + Seek, T, F>(stream: &mut S, f: F) -> Result<T>
where
    F: FnOnce(&mut S, u8) -> Result<T>,
{
    let start = stream.stream_position()?;
    let data_size: u32 = stream.de()?;
    let version: u8 = stream.de()?;
    if data_size < BLOCK_HEADER_SIZE {
        bail!("invalid block size {data_size}");
    }
    let value = f(stream, version)?;
    let end = start + data_size as u64;
    let position = stream.stream_position()?;
    if position > end {
        bail!("block overran its declared size: read {} bytes, expected at most {data_size}", position - start);
    }
    stream.seek(SeekFrom::Start(end))?;
    Ok(value)
}

#[cfg(test)]
mod test {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_string_roundtrip() -> Result<()> {
        for value in ["", "Engine/Binaries/Win64/Game.exe", "Données/ファイル.pak"] {
            let mut buf = vec![];
            write_string(&mut buf, value)?;
            let read: String = Cursor::new(buf).de()?;
            assert_eq!(value, read);
        }
        Ok(())
    }

    #[test]
    fn test_block_skips_unknown_tail() -> Result<()> {
        let mut buf = vec![];
        write_block(&mut buf, 3, |s| {
            s.ser(&7u32)?;
            // field only a newer reader knows about
            s.ser(&0xdeadbeefu64)?;
            Ok(())
        })?;
        42u32.ser(&mut buf)?;

        let mut cur = Cursor::new(buf);
        let (version, value) = read_block(&mut cur, |s, version| Ok((version, s.de::<u32>()?)))?;
        assert_eq!((3, 7), (version, value));
        assert_eq!(42, cur.de::<u32>()?);
        Ok(())
    }

    #[test]
    fn test_block_overrun_is_rejected() -> Result<()> {
        let mut buf = vec![];
        write_block(&mut buf, 0, |s| s.ser(&1u32))?;
        0u64.ser(&mut buf)?;
        let mut cur = Cursor::new(buf);
        assert!(read_block(&mut cur, |s, _| s.de::<u64>()).is_err());
        Ok(())
    }
}
