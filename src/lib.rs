pub mod block_structure;
pub mod chunk_data;
pub mod chunk_database;
pub mod chunk_reference_tracker;
pub mod compression;
pub mod diff_manifests;
pub mod logging;
pub mod manifest;
pub mod manifest_builder;
pub mod manifest_data;
pub mod manifest_json;
pub mod manifest_legacy;
pub mod merge_manifests;
pub mod optimised_delta;
pub mod package_chunk_data;
pub mod rolling_hash;
pub mod ser;
pub mod version;

pub use manifest::BuildPatchAppManifest;
pub use version::EFeatureLevel;

use anyhow::{Context as _, Result, bail};
use fs_err as fs;
use ser::*;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;
use sha1::{Digest as _, Sha1};
use std::fmt::{Display, Formatter};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;

/// Access to manifests, deltas and chunk files by relative URI.
pub trait DataFetcher: Send + Sync {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>>;
    fn fetch_opt(&self, uri: &str) -> Result<Option<Vec<u8>>>;
}
pub struct FSDataFetcher {
    dir: PathBuf,
}
impl FSDataFetcher {
    pub fn new<P: Into<PathBuf>>(dir: P) -> Self {
        Self { dir: dir.into() }
    }
}
impl DataFetcher for FSDataFetcher {
    fn fetch(&self, uri: &str) -> Result<Vec<u8>> {
        Ok(fs::read(self.dir.join(uri))?)
    }
    fn fetch_opt(&self, uri: &str) -> Result<Option<Vec<u8>>> {
        read_file_opt(self.dir.join(uri))
    }
}

fn read_file_opt<P: AsRef<Path>>(path: P) -> Result<Option<Vec<u8>>> {
    match fs::read(path.as_ref()) {
        Ok(data) => Ok(Some(data)),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

/// Size of a file on disk, `None` if it does not exist.
pub(crate) fn file_size_on_disk<P: AsRef<Path>>(path: P) -> Result<Option<u64>> {
    match fs::metadata(path.as_ref()) {
        Ok(meta) => Ok(Some(meta.len())),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err.into()),
    }
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FGuid {
    pub a: u32,
    pub b: u32,
    pub c: u32,
    pub d: u32,
}
impl FGuid {
    pub const fn new(a: u32, b: u32, c: u32, d: u32) -> Self {
        Self { a, b, c, d }
    }
    pub fn is_valid(&self) -> bool {
        (self.a | self.b | self.c | self.d) != 0
    }
    pub fn to_bytes(&self) -> [u8; 16] {
        let mut bytes = [0; 16];
        for (dst, part) in bytes.chunks_mut(4).zip([self.a, self.b, self.c, self.d]) {
            dst.copy_from_slice(&part.to_le_bytes());
        }
        bytes
    }
}
impl Display for FGuid {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08X}{:08X}{:08X}{:08X}", self.a, self.b, self.c, self.d)
    }
}
impl FromStr for FGuid {
    type Err = anyhow::Error;
    /// Accepts plain digits as well as the hyphenated and braced forms.
    fn from_str(s: &str) -> Result<Self> {
        let digits: String = s.trim_matches(|c| c == '{' || c == '}' || c == '(' || c == ')').chars().filter(|&c| c != '-').collect();
        if digits.len() != 32 || !digits.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("invalid GUID: {s:?}");
        }
        let part = |i: usize| u32::from_str_radix(&digits[i * 8..i * 8 + 8], 16).with_context(|| format!("invalid GUID: {s:?}"));
        Ok(Self::new(part(0)?, part(1)?, part(2)?, part(3)?))
    }
}
impl Readable for FGuid {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self {
            a: stream.de()?,
            b: stream.de()?,
            c: stream.de()?,
            d: stream.de()?,
        })
    }
}
impl Writeable for FGuid {
    fn ser<S: Write>(&self, stream: &mut S) -> Result<()> {
        stream.ser(&self.a)?;
        stream.ser(&self.b)?;
        stream.ser(&self.c)?;
        stream.ser(&self.d)?;
        Ok(())
    }
}

#[serde_as]
#[derive(Default, Clone, Copy, PartialEq, Eq, Hash, Ord, PartialOrd, Serialize, Deserialize)]
pub struct FSHAHash(#[serde_as(as = "serde_with::hex::Hex")] pub [u8; 20]);
impl FSHAHash {
    pub fn from_data(data: &[u8]) -> Self {
        Self(Sha1::digest(data).into())
    }
    pub fn is_zero(&self) -> bool {
        self.0.iter().all(|&b| b == 0)
    }
}
impl Readable for FSHAHash {
    fn de<S: Read>(stream: &mut S) -> Result<Self> {
        Ok(Self(stream.de()?))
    }
}
impl Writeable for FSHAHash {
    fn ser<S: Write>(&self, s: &mut S) -> Result<()> {
        s.ser(&self.0)
    }
}
impl std::fmt::Debug for FSHAHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "FSHAHash({self})")
    }
}
impl Display for FSHAHash {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(&hex::encode_upper(self.0))
    }
}
impl FromStr for FSHAHash {
    type Err = anyhow::Error;
    fn from_str(s: &str) -> Result<Self> {
        let mut hash = [0; 20];
        hex::decode_to_slice(s, &mut hash).with_context(|| format!("invalid SHA1 hex string: {s:?}"))?;
        Ok(Self(hash))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_guid_string() -> Result<()> {
        let guid = FGuid::new(0x7574140E, 0xFC034A67, 0x9D90154A, 0x1B7F37C3);
        assert_eq!("7574140EFC034A679D90154A1B7F37C3", guid.to_string());
        assert_eq!(guid, "7574140EFC034A679D90154A1B7F37C3".parse()?);
        assert_eq!(guid, "{7574140E-FC03-4A67-9D90-154A1B7F37C3}".parse()?);
        assert!("7574140E".parse::<FGuid>().is_err());
        assert!("7574140EFC034A679D90154A1B7F37CZ".parse::<FGuid>().is_err());
        Ok(())
    }

    #[test]
    fn test_sha_hash() -> Result<()> {
        let hash = FSHAHash::from_data(b"abc");
        assert_eq!("A9993E364706816ABA3E25717850C26C9CD0D89D", hash.to_string());
        assert_eq!(hash, hash.to_string().parse()?);
        assert!(FSHAHash::default().is_zero());
        Ok(())
    }
}
