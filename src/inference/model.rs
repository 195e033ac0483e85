//! Model file preflight
//!
//! Checks a GGUF header before handing the path to llama.cpp, which reports
//! unreadable files with little more than a null pointer.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use thiserror::Error;

/// GGUF magic bytes (little-endian: "GGUF")
pub const GGUF_MAGIC: u32 = 0x4655_4747;

/// magic(4) + version(4) + tensor_count(8) + metadata_kv_count(8)
const HEADER_LEN: u64 = 24;

#[derive(Debug, Error)]
pub enum ModelFileError {
    #[error("Model path is empty")]
    EmptyPath,

    #[error("Model file not found: {0}")]
    NotFound(String),

    #[error("Failed to read model file: {0}")]
    Io(#[from] std::io::Error),

    #[error("Model file too small to be GGUF ({0} bytes)")]
    TooSmall(u64),

    #[error("Not a GGUF file: magic 0x{0:08X}")]
    BadMagic(u32),

    #[error("Unsupported GGUF version: {0}")]
    UnsupportedVersion(u32),
}

/// Header fields of a GGUF model file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModelFileInfo {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata_kv_count: u64,
    pub size_bytes: u64,
}

/// Reads and checks the GGUF header of `path`. Versions 2 and 3 are accepted.
pub fn inspect_model_file(path: &Path) -> Result<ModelFileInfo, ModelFileError> {
    if path.as_os_str().is_empty() {
        return Err(ModelFileError::EmptyPath);
    }
    if !path.is_file() {
        return Err(ModelFileError::NotFound(path.display().to_string()));
    }

    let mut file = File::open(path)?;
    let size_bytes = file.seek(SeekFrom::End(0))?;
    if size_bytes < HEADER_LEN {
        return Err(ModelFileError::TooSmall(size_bytes));
    }
    file.seek(SeekFrom::Start(0))?;

    let mut header = [0u8; HEADER_LEN as usize];
    file.read_exact(&mut header)?;

    let magic = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
    if magic != GGUF_MAGIC {
        return Err(ModelFileError::BadMagic(magic));
    }

    let version = u32::from_le_bytes([header[4], header[5], header[6], header[7]]);
    if !(2..=3).contains(&version) {
        return Err(ModelFileError::UnsupportedVersion(version));
    }

    let mut word = [0u8; 8];
    word.copy_from_slice(&header[8..16]);
    let tensor_count = u64::from_le_bytes(word);
    word.copy_from_slice(&header[16..24]);
    let metadata_kv_count = u64::from_le_bytes(word);

    tracing::debug!(
        "GGUF v{} header: {} tensors, {} metadata entries, {} bytes",
        version,
        tensor_count,
        metadata_kv_count,
        size_bytes
    );

    Ok(ModelFileInfo {
        version,
        tensor_count,
        metadata_kv_count,
        size_bytes,
    })
}
