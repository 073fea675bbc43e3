use anyhow::{Context as _, Result, bail};
use std::io::{Read as _, Write};

pub fn compress<S: Write>(input: &[u8], output: S) -> Result<()> {
    let mut encoder = flate2::write::ZlibEncoder::new(output, flate2::Compression::best());
    encoder.write_all(input)?;
    encoder.finish()?;
    Ok(())
}

/// Compresses `input`, returning `None` when the result would not be smaller.
pub fn compress_if_smaller(input: &[u8]) -> Result<Option<Vec<u8>>> {
    let mut output = vec![];
    compress(input, &mut output)?;
    Ok((output.len() < input.len()).then_some(output))
}

pub fn decompress(input: &[u8], uncompressed_size: usize) -> Result<Vec<u8>> {
    let mut output = vec![0; uncompressed_size];
    let mut decoder = flate2::read::ZlibDecoder::new(input);
    decoder
        .read_exact(&mut output)
        .with_context(|| format!("zlib decompression failed: expected {uncompressed_size} output bytes"))?;
    if decoder.read(&mut [0])? != 0 {
        bail!("zlib stream inflates to more than the declared {uncompressed_size} bytes");
    }
    Ok(output)
}
