//! Snapshot archive decompression
//!
//! Each snapshot object wraps exactly one XML document. The container is
//! recognized from its leading magic bytes:
//!
//! - **Zip**: the first non-directory member is the payload
//! - **Gzip**: the single compressed stream is the payload

use anyhow::{anyhow, bail, Context, Result};
use flate2::read::GzDecoder;
use std::io::{Cursor, Read};
use tracing::debug;

const ZIP_MAGIC: &[u8] = b"PK\x03\x04";
const GZIP_MAGIC: &[u8] = &[0x1f, 0x8b];

/// Container formats accepted for snapshot objects
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArchiveFormat {
    Zip,
    Gzip,
}

impl ArchiveFormat {
    pub fn detect(data: &[u8]) -> Option<Self> {
        if data.starts_with(ZIP_MAGIC) {
            Some(Self::Zip)
        } else if data.starts_with(GZIP_MAGIC) {
            Some(Self::Gzip)
        } else {
            None
        }
    }
}

/// Unpack the single payload carried by a snapshot archive
pub fn extract_payload(data: &[u8]) -> Result<Vec<u8>> {
    match ArchiveFormat::detect(data) {
        Some(ArchiveFormat::Zip) => extract_first_zip_entry(data),
        Some(ArchiveFormat::Gzip) => decompress_gzip(data),
        None => Err(anyhow!(
            "unrecognized archive format ({} bytes, expected zip or gzip)",
            data.len()
        )),
    }
}

/// Read the first file member of a zip archive
pub fn extract_first_zip_entry(data: &[u8]) -> Result<Vec<u8>> {
    let mut archive = zip::ZipArchive::new(Cursor::new(data)).context("Failed to read zip archive")?;

    for i in 0..archive.len() {
        let mut file = archive
            .by_index(i)
            .with_context(|| format!("Failed to read zip entry at index {}", i))?;

        if file.is_dir() {
            continue;
        }

        // The declared size comes from the archive itself and is not trusted
        let name = file.name().to_string();
        let mut contents = Vec::new();
        file.read_to_end(&mut contents)
            .with_context(|| format!("Failed to read zip entry: {}", name))?;
        debug!(entry = %name, bytes = contents.len(), "Extracted zip entry");
        return Ok(contents);
    }

    bail!("zip archive contains no file entries")
}

/// Decompress a gzip stream
pub fn decompress_gzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut decoder = GzDecoder::new(data);
    let mut decompressed = Vec::new();
    decoder
        .read_to_end(&mut decompressed)
        .context("Failed to decompress gzip data")?;
    debug!("Decompressed {} -> {} bytes", data.len(), decompressed.len());
    Ok(decompressed)
}
