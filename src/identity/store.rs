//! Durable identity record storage.
//!
//! A member's identity pair and bootstrap phase are always written together
//! as one [`IdentityRecord`]. The file store writes a framed record to a
//! temporary sibling, syncs it, and renames it over the target, so a crash
//! mid-write leaves either the previous complete record or nothing.
//!
//! # On-disk frame
//!
//! ```text
//! magic "LNID" | version u16 | payload length u32 | xxhash64(payload) u64 | payload (JSON)
//! ```

use super::types::{ClusterIdentity, IdentityRecord, StoreIdentity};
use crate::core::error::PersistenceError;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::hash::Hasher;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use twox_hash::XxHash64;

const RECORD_MAGIC: &[u8; 4] = b"LNID";
const RECORD_VERSION: u16 = 1;
const HEADER_LEN: usize = 4 + 2 + 4 + 8;

/// Default identity file name inside the cluster-state directory.
pub const IDENTITY_FILE_NAME: &str = "identity.state";

/// Single-writer durable identity record.
pub trait IdentityStore: Send + Sync {
    /// Load the persisted record, if any.
    fn load(&self) -> Result<Option<IdentityRecord>, PersistenceError>;

    /// Atomically replace the persisted record.
    fn save_record(&self, record: &IdentityRecord) -> Result<(), PersistenceError>;

    /// Wipe the local identity.
    fn clear(&self) -> Result<(), PersistenceError>;

    /// Persist a bootstrapped identity pair.
    fn save(
        &self,
        cluster_id: ClusterIdentity,
        store_id: StoreIdentity,
    ) -> Result<(), PersistenceError> {
        self.save_record(&IdentityRecord::bootstrapped(cluster_id, store_id))
    }
}

/// File-backed identity store with atomic replace semantics.
#[derive(Debug)]
pub struct FileIdentityStore {
    path: PathBuf,
}

impl FileIdentityStore {
    /// Create a store that keeps its record at `path`.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Create a store inside `dir` using the default file name.
    pub fn in_dir(dir: impl AsRef<Path>) -> Self {
        Self::new(dir.as_ref().join(IDENTITY_FILE_NAME))
    }

    /// Record path.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn temp_path(&self) -> PathBuf {
        self.path.with_extension("tmp")
    }

    fn io_err(&self, source: std::io::Error) -> PersistenceError {
        PersistenceError::Io {
            path: self.path.display().to_string(),
            source,
        }
    }

    fn corrupt(&self, reason: impl Into<String>) -> PersistenceError {
        PersistenceError::Corrupt {
            path: self.path.display().to_string(),
            reason: reason.into(),
        }
    }

    fn sync_parent(&self) -> Result<(), PersistenceError> {
        let Some(parent) = parent_dir(&self.path) else {
            return Ok(());
        };
        File::open(parent)
            .and_then(|dir| dir.sync_all())
            .map_err(|e| self.io_err(e))
    }

    fn decode(&self, bytes: &[u8]) -> Result<IdentityRecord, PersistenceError> {
        if bytes.len() < HEADER_LEN {
            return Err(self.corrupt(format!("truncated header ({} bytes)", bytes.len())));
        }
        if &bytes[0..4] != RECORD_MAGIC {
            return Err(self.corrupt("bad magic"));
        }
        let version = u16::from_le_bytes([bytes[4], bytes[5]]);
        if version != RECORD_VERSION {
            return Err(self.corrupt(format!("unsupported version {}", version)));
        }
        let len = u32::from_le_bytes([bytes[6], bytes[7], bytes[8], bytes[9]]) as usize;
        let mut checksum_bytes = [0u8; 8];
        checksum_bytes.copy_from_slice(&bytes[10..18]);
        let expected = u64::from_le_bytes(checksum_bytes);

        let payload = &bytes[HEADER_LEN..];
        if payload.len() != len {
            return Err(self.corrupt(format!(
                "payload length {} does not match header {}",
                payload.len(),
                len
            )));
        }
        let actual = checksum(payload);
        if actual != expected {
            return Err(self.corrupt(format!(
                "checksum mismatch: expected {:016x}, computed {:016x}",
                expected, actual
            )));
        }

        serde_json::from_slice(payload).map_err(|e| self.corrupt(e.to_string()))
    }
}

impl IdentityStore for FileIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, PersistenceError> {
        let temp = self.temp_path();
        if temp.exists() {
            tracing::warn!(
                path = %temp.display(),
                "discarding incomplete identity write"
            );
            std::fs::remove_file(&temp).map_err(|e| self.io_err(e))?;
        }

        let bytes = match std::fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(self.io_err(e)),
        };

        self.decode(&bytes).map(Some)
    }

    fn save_record(&self, record: &IdentityRecord) -> Result<(), PersistenceError> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| self.io_err(e))?;
        }

        let frame = encode(record)?;
        let temp = self.temp_path();
        {
            let mut file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&temp)
                .map_err(|e| self.io_err(e))?;
            file.write_all(&frame).map_err(|e| self.io_err(e))?;
            file.sync_all().map_err(|e| self.io_err(e))?;
        }
        std::fs::rename(&temp, &self.path).map_err(|e| self.io_err(e))?;
        self.sync_parent()?;

        tracing::debug!(
            path = %self.path.display(),
            cluster_id = %record.cluster_id,
            phase = %record.phase,
            "identity record saved"
        );
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => self.sync_parent(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}

/// In-memory identity store with optional write-failure injection.
#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    record: Mutex<Option<IdentityRecord>>,
    fail_writes: AtomicBool,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make subsequent writes fail with an I/O error.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::Release);
    }

    fn check_writable(&self) -> Result<(), PersistenceError> {
        if self.fail_writes.load(Ordering::Acquire) {
            return Err(PersistenceError::Io {
                path: "<memory>".to_string(),
                source: std::io::Error::new(std::io::ErrorKind::Other, "injected write failure"),
            });
        }
        Ok(())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn load(&self) -> Result<Option<IdentityRecord>, PersistenceError> {
        Ok(self.record.lock().clone())
    }

    fn save_record(&self, record: &IdentityRecord) -> Result<(), PersistenceError> {
        self.check_writable()?;
        *self.record.lock() = Some(record.clone());
        Ok(())
    }

    fn clear(&self) -> Result<(), PersistenceError> {
        self.check_writable()?;
        *self.record.lock() = None;
        Ok(())
    }
}

fn checksum(payload: &[u8]) -> u64 {
    let mut hasher = XxHash64::with_seed(0);
    hasher.write(payload);
    hasher.finish()
}

fn encode(record: &IdentityRecord) -> Result<Vec<u8>, PersistenceError> {
    let payload =
        serde_json::to_vec(record).map_err(|e| PersistenceError::Encoding(e.to_string()))?;
    let mut frame = Vec::with_capacity(HEADER_LEN + payload.len());
    frame.extend_from_slice(RECORD_MAGIC);
    frame.extend_from_slice(&RECORD_VERSION.to_le_bytes());
    frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    frame.extend_from_slice(&checksum(&payload).to_le_bytes());
    frame.extend_from_slice(&payload);
    Ok(frame)
}

/// Directory containing `path`; a bare file name lives in `.`.
fn parent_dir(path: &Path) -> Option<&Path> {
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() => Some(Path::new(".")),
        parent => parent,
    }
}
