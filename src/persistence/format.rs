//! On-disk snapshot encoding.
//!
//! Layout:
//!
//! ```text
//! [magic "VSGS"][version u32 LE][body_len u64 LE][bincode body][crc32 u32 LE]
//! ```
//!
//! The checksum covers only the body. Imports verify magic, version, length
//! and checksum before decoding anything.

use std::fs::File;
use std::io::{BufReader, BufWriter, Read, Write};
use std::path::Path;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::IndexVariantConfig;
use crate::error::{EngineError, Result};
use crate::store::EmbeddingRecord;

pub const MAGIC: [u8; 4] = *b"VSGS";
pub const FORMAT_VERSION: u32 = 1;

/// Everything needed to reconstruct an engine: store contents plus the
/// index configuration (including the training seed).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub format_version: u32,
    pub dimension: usize,
    pub norm_epsilon: f32,
    pub index: IndexVariantConfig,
    pub next_embedding_id: u64,
    pub records: Vec<EmbeddingRecord>,
}

/// Write a snapshot atomically: encode to `<path>.tmp`, fsync, rename.
pub fn write_snapshot(path: &Path, snapshot: &Snapshot) -> Result<()> {
    let body = bincode::serialize(snapshot)
        .map_err(|e| EngineError::Snapshot(format!("encode failed: {e}")))?;
    let checksum = crc32fast::hash(&body);

    let tmp_path = path.with_extension("tmp");
    {
        let file = File::create(&tmp_path)?;
        let mut writer = BufWriter::new(file);
        writer.write_all(&MAGIC)?;
        writer.write_all(&FORMAT_VERSION.to_le_bytes())?;
        writer.write_all(&(body.len() as u64).to_le_bytes())?;
        writer.write_all(&body)?;
        writer.write_all(&checksum.to_le_bytes())?;
        writer.flush()?;
        writer.get_ref().sync_all()?;
    }
    std::fs::rename(&tmp_path, path)?;

    debug!(
        path = %path.display(),
        records = snapshot.records.len(),
        bytes = body.len(),
        "snapshot written"
    );
    Ok(())
}

/// Bytes surrounding the body: magic + version + length header, crc footer.
const ENVELOPE_LEN: u64 = 4 + 4 + 8 + 4;

pub fn read_snapshot(path: &Path) -> Result<Snapshot> {
    let file = File::open(path)?;
    let file_len = file.metadata()?.len();
    let mut reader = BufReader::new(file);

    let mut magic = [0u8; 4];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(EngineError::Snapshot(format!(
            "bad magic bytes {magic:02x?}"
        )));
    }

    let mut version_bytes = [0u8; 4];
    reader.read_exact(&mut version_bytes)?;
    let version = u32::from_le_bytes(version_bytes);
    if version != FORMAT_VERSION {
        return Err(EngineError::Snapshot(format!(
            "unsupported format version {version}, expected {FORMAT_VERSION}"
        )));
    }

    let mut len_bytes = [0u8; 8];
    reader.read_exact(&mut len_bytes)?;
    let body_len = u64::from_le_bytes(len_bytes);
    // A corrupted header must not drive the allocation below.
    if body_len != file_len.saturating_sub(ENVELOPE_LEN) {
        return Err(EngineError::Snapshot(format!(
            "body length {body_len} inconsistent with file size {file_len}"
        )));
    }
    let body_len = body_len as usize;

    let mut body = vec![0u8; body_len];
    reader.read_exact(&mut body)?;

    let mut checksum_bytes = [0u8; 4];
    reader.read_exact(&mut checksum_bytes)?;
    let expected = u32::from_le_bytes(checksum_bytes);
    let actual = crc32fast::hash(&body);
    if expected != actual {
        return Err(EngineError::ChecksumMismatch { expected, actual });
    }

    let snapshot: Snapshot = bincode::deserialize(&body)
        .map_err(|e| EngineError::Snapshot(format!("decode failed: {e}")))?;
    if snapshot.format_version != version {
        return Err(EngineError::Snapshot(format!(
            "header version {version} disagrees with body version {}",
            snapshot.format_version
        )));
    }
    Ok(snapshot)
}
