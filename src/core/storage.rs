//! Chunked little-endian image primitives.
//!
//! An image is `MAGIC`, a u32 version, then a sequence of chunks, each a
//! 4-byte tag, a u32 payload length and the payload. Readers skip tags they
//! do not know, so new chunks can be added without a version bump.

use std::io::{self, Read, Write};

pub const MAGIC: &[u8; 8] = b"LOOMTOP1";
pub const VERSION_V1: u32 = 1;
pub const VERSION_CURRENT: u32 = VERSION_V1;

pub fn compress_lz4(input: &[u8]) -> Vec<u8> {
    lz4_flex::compress(input)
}

pub fn decompress_lz4(input: &[u8], expected_size: usize) -> io::Result<Vec<u8>> {
    lz4_flex::decompress(input, expected_size).map_err(|_| invalid("lz4 decompression failed"))
}

pub(crate) fn invalid(msg: &'static str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

pub(crate) fn invalid_owned(msg: String) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

/// Sink that only counts bytes; used to size an image without buffering it.
pub struct CountingWriter {
    written: usize,
}

impl CountingWriter {
    pub fn new() -> Self {
        Self { written: 0 }
    }

    pub fn written(&self) -> usize {
        self.written
    }
}

impl Default for CountingWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl Write for CountingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.written = self.written.saturating_add(buf.len());
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub fn write_u32_le<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_u64_le<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_f32_le<W: Write>(w: &mut W, v: f32) -> io::Result<()> {
    w.write_all(&v.to_le_bytes())
}

pub fn write_bytes<W: Write>(w: &mut W, bytes: &[u8]) -> io::Result<()> {
    write_u32_le(w, bytes.len() as u32)?;
    w.write_all(bytes)
}

pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    write_bytes(w, s.as_bytes())
}

pub fn read_exact<const N: usize, R: Read>(r: &mut R) -> io::Result<[u8; N]> {
    let mut buf = [0u8; N];
    r.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn read_u32_le<R: Read>(r: &mut R) -> io::Result<u32> {
    Ok(u32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_u64_le<R: Read>(r: &mut R) -> io::Result<u64> {
    Ok(u64::from_le_bytes(read_exact::<8, _>(r)?))
}

pub fn read_f32_le<R: Read>(r: &mut R) -> io::Result<f32> {
    Ok(f32::from_le_bytes(read_exact::<4, _>(r)?))
}

pub fn read_bytes<R: Read>(r: &mut R) -> io::Result<Vec<u8>> {
    let n = read_u32_le(r)? as usize;
    let mut buf = Vec::new();
    r.by_ref().take(n as u64).read_to_end(&mut buf)?;
    if buf.len() != n {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated byte string",
        ));
    }
    Ok(buf)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    String::from_utf8(read_bytes(r)?).map_err(|_| invalid("invalid utf-8 string"))
}

pub fn write_chunk<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let len = u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    w.write_all(&tag)?;
    write_u32_le(w, len)?;
    w.write_all(payload)
}

/// Write an LZ4 chunk: the payload is compressed and preceded by its
/// uncompressed length.
///
/// Layout:
/// - tag: [u8;4]
/// - len: u32 (bytes following, including the 4-byte uncompressed length)
/// - uncompressed_len: u32
/// - compressed payload bytes
pub fn write_chunk_lz4<W: Write>(w: &mut W, tag: [u8; 4], payload: &[u8]) -> io::Result<()> {
    let compressed = compress_lz4(payload);
    let uncompressed_len = u32::try_from(payload.len()).map_err(|_| invalid("chunk too large"))?;
    let total_len = u32::try_from(compressed.len())
        .ok()
        .and_then(|n| n.checked_add(4))
        .ok_or_else(|| invalid("chunk too large"))?;

    w.write_all(&tag)?;
    write_u32_le(w, total_len)?;
    write_u32_le(w, uncompressed_len)?;
    w.write_all(&compressed)
}

/// Read the body of an LZ4 chunk whose header declared `len` bytes.
pub fn read_lz4_payload<R: Read>(r: &mut R, len: u32) -> io::Result<Vec<u8>> {
    if len < 4 {
        return Err(invalid("lz4 chunk too short"));
    }
    let uncompressed_len = read_u32_le(r)? as usize;
    let mut compressed = Vec::new();
    r.by_ref().take(u64::from(len - 4)).read_to_end(&mut compressed)?;
    if compressed.len() != (len - 4) as usize {
        return Err(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "truncated lz4 chunk",
        ));
    }
    // LZ4 cannot expand a block by more than 255x.
    if uncompressed_len > compressed.len().saturating_mul(255).saturating_add(16) {
        return Err(invalid("lz4 chunk declares an impossible size"));
    }
    decompress_lz4(&compressed, uncompressed_len)
}

pub fn read_chunk_header<R: Read>(r: &mut R) -> io::Result<([u8; 4], u32)> {
    let tag = read_exact::<4, _>(r)?;
    let len = read_u32_le(r)?;
    Ok((tag, len))
}
