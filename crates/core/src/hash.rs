//! BLAKE3 checksums for backup integrity

use crate::error::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::Path;
use std::thread::sleep;
use std::time::Duration;

/// A BLAKE3 hash (32 bytes)
#[derive(Copy, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
pub struct Blake3Hash([u8; 32]);

impl Blake3Hash {
    /// Create a new Blake3Hash from bytes
    pub const fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Get the hash as a byte slice
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Lowercase hex form, as written to `.meta` files
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse the hex form back
    pub fn from_hex(text: &str) -> std::result::Result<Self, String> {
        let raw = hex::decode(text.trim()).map_err(|e| format!("invalid checksum: {e}"))?;
        let bytes: [u8; 32] = raw
            .try_into()
            .map_err(|v: Vec<u8>| format!("invalid checksum length: {} bytes", v.len()))?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Blake3Hash({})", self.to_hex())
    }
}

impl std::fmt::Display for Blake3Hash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

/// Hash bytes using BLAKE3
pub fn hash_bytes(data: &[u8]) -> Blake3Hash {
    let hash = blake3::hash(data);
    Blake3Hash::from_bytes(*hash.as_bytes())
}

/// Hash a file using BLAKE3 (streaming)
pub fn hash_file(path: &Path) -> Result<Blake3Hash> {
    let mut file = std::fs::File::open(path).map_err(|e| EngineError::io(path, e))?;
    let mut hasher = blake3::Hasher::new();

    let mut buffer = [0u8; 8192];
    loop {
        let n = file.read(&mut buffer).map_err(|e| EngineError::io(path, e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(Blake3Hash::from_bytes(*hasher.finalize().as_bytes()))
}

/// Read a file whose contents are not changing underneath us.
///
/// Stats the file before and after the read; if size or mtime moved, the
/// read is retried with exponential backoff (50ms, 100ms, 200ms, ...).
/// Configuration files can be rewritten by package hooks while a backup is
/// being taken; a torn snapshot must never be recorded.
pub fn read_stable(path: &Path, max_retries: u8) -> std::io::Result<Vec<u8>> {
    let attempts = max_retries.max(1);

    for attempt in 0..attempts {
        let before = std::fs::metadata(path)?;
        let data = std::fs::read(path)?;
        let after = std::fs::metadata(path)?;

        if before.len() == after.len()
            && before.modified()? == after.modified()?
            && data.len() as u64 == after.len()
        {
            return Ok(data);
        }

        if attempt + 1 < attempts {
            sleep(Duration::from_millis(50 << attempt));
        }
    }

    Err(std::io::Error::new(
        std::io::ErrorKind::Other,
        format!(
            "{} is unstable after {} read attempts (file changing too rapidly)",
            path.display(),
            attempts
        ),
    ))
}
