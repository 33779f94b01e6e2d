//! Gzip helpers: synchronous flate2 for files and in-memory WAL segments,
//! async-compression for streaming restores into tool stdin.

use async_compression::tokio::bufread::GzipDecoder;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compress `src` into `dst`, returning the compressed size
pub fn gzip_file(src: &Path, dst: &Path, level: u32) -> io::Result<u64> {
    let mut reader = BufReader::new(File::open(src)?);
    let writer = BufWriter::new(File::create(dst)?);
    let mut encoder = GzEncoder::new(writer, Compression::new(level.min(9)));
    io::copy(&mut reader, &mut encoder)?;
    let mut writer = encoder.finish()?;
    writer.flush()?;
    let file = writer.into_inner().map_err(|e| e.into_error())?;
    file.sync_all()?;
    Ok(file.metadata()?.len())
}

/// Decompress `src` into `dst`, returning the decompressed size
pub fn gunzip_file(src: &Path, dst: &Path) -> io::Result<u64> {
    let mut decoder = GzDecoder::new(BufReader::new(File::open(src)?));
    let mut writer = BufWriter::new(File::create(dst)?);
    let written = io::copy(&mut decoder, &mut writer)?;
    writer.flush()?;
    Ok(written)
}

pub fn gzip_bytes(data: &[u8], level: u32) -> io::Result<Vec<u8>> {
    let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2), Compression::new(level.min(9)));
    encoder.write_all(data)?;
    encoder.finish()
}

pub fn gunzip_bytes(data: &[u8]) -> io::Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut out = Vec::with_capacity(data.len() * 2);
    decoder.read_to_end(&mut out)?;
    Ok(out)
}

pub fn is_gzip(data: &[u8]) -> bool {
    data.len() >= 2 && data[..2] == GZIP_MAGIC
}

/// Streaming decompressor over a file, for piping into a tool's stdin
pub async fn open_gzip_reader(
    path: &Path,
) -> io::Result<GzipDecoder<tokio::io::BufReader<tokio::fs::File>>> {
    let file = tokio::fs::File::open(path).await?;
    let mut decoder = GzipDecoder::new(tokio::io::BufReader::with_capacity(64 * 1024, file));
    decoder.multiple_members(true);
    Ok(decoder)
}

/// Output path for a plain-SQL dump that is piped through a compressor:
/// `.dump` becomes `.sql.gz`, `.sql` gains `.gz`, anything else gains `.gz`.
pub fn compressed_output_path(requested: &Path) -> PathBuf {
    let name = requested
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_default();
    let renamed = if let Some(stem) = name.strip_suffix(".dump") {
        format!("{}.sql.gz", stem)
    } else if name.ends_with(".gz") {
        name
    } else {
        format!("{}.gz", name)
    };
    requested.with_file_name(renamed)
}
