//! Storage collaborator traits and host-filesystem implementations.
//!
//! The logger talks to three external stores through these seams: the SD
//! card, a non-volatile key/value store for critical entries, and the RTC
//! for timestamps. `DirStorage` backs the SD contract with a host
//! directory; `MemNvs` keeps blobs in memory.

use canmon_common::clock::Clock;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tracing::debug;

/// Error type for storage operations.
#[derive(Debug, Clone, Error)]
pub enum StorageError {
    /// The store has not been initialised (or was deinitialised).
    #[error("storage not mounted")]
    NotMounted,

    /// The requested path does not exist.
    #[error("path not found: {0}")]
    NotFound(String),

    /// Underlying I/O failure.
    #[error("storage I/O error: {0}")]
    Io(String),

    /// Encoding or decoding a persisted blob failed.
    #[error("serialization failed: {0}")]
    Serde(String),
}

/// SD card contract.
///
/// Paths are relative to the card root; `write_with_rotation` starts a new
/// file once the active one would exceed `max_file_size`.
pub trait SdStorage: Send + Sync {
    /// Mount the card.
    fn init(&self) -> Result<(), StorageError>;

    /// Unmount the card.
    fn deinit(&self) -> Result<(), StorageError>;

    /// Create a directory (and parents).
    fn create_directory(&self, dir: &str) -> Result<(), StorageError>;

    /// Write a whole file, replacing any previous content.
    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError>;

    /// Read a whole file.
    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError>;

    /// Delete a file.
    fn delete_file(&self, path: &str) -> Result<(), StorageError>;

    /// Append one line to `dir/prefix.log`, rotating to a fresh file when
    /// the active one would exceed `max_file_size` bytes.
    fn write_with_rotation(
        &self,
        dir: &str,
        prefix: &str,
        line: &str,
        max_file_size: u64,
    ) -> Result<(), StorageError>;

    /// Remaining free space on the card [bytes].
    fn free_space(&self) -> Result<u64, StorageError>;

    /// Timestamp string for file names and report headers.
    fn formatted_timestamp(&self) -> String {
        let secs = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs();
        secs.to_string()
    }
}

/// Non-volatile key/value store contract.
pub trait NvsStore: Send + Sync {
    /// Store a blob under `namespace/key`.
    fn set_blob(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError>;

    /// Fetch a blob; `None` when the key was never written.
    fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Flush pending writes to the backing medium.
    fn commit(&self) -> Result<(), StorageError>;
}

/// Real-time clock contract. The logger obtains one handle at init and
/// keeps it for its lifetime.
pub trait Rtc: Send + Sync {
    /// Milliseconds since the Unix epoch.
    fn timestamp_ms(&self) -> u64;
}

/// RTC backed by the shared runtime clock.
pub struct ClockRtc {
    clock: Arc<dyn Clock>,
}

impl ClockRtc {
    /// Wrap a clock as the RTC collaborator.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self { clock }
    }
}

impl Rtc for ClockRtc {
    fn timestamp_ms(&self) -> u64 {
        self.clock.now_ms()
    }
}

// ─── DirStorage ────────────────────────────────────────────────────

/// SD storage backed by a host directory.
pub struct DirStorage {
    root: PathBuf,
    mounted: AtomicBool,
}

impl DirStorage {
    /// Create storage rooted at `root`. `init` mounts it.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            mounted: AtomicBool::new(false),
        }
    }

    fn resolve(&self, path: &str) -> PathBuf {
        self.root.join(path)
    }

    fn require_mounted(&self) -> Result<(), StorageError> {
        if self.mounted.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(StorageError::NotMounted)
        }
    }

    /// Pick the first unused rotation target `dir/prefix_N.log`.
    fn rotation_target(&self, dir: &Path, prefix: &str) -> PathBuf {
        let mut index = 1;
        loop {
            let candidate = dir.join(format!("{prefix}_{index}.log"));
            if !candidate.exists() {
                return candidate;
            }
            index += 1;
        }
    }
}

impl SdStorage for DirStorage {
    fn init(&self) -> Result<(), StorageError> {
        std::fs::create_dir_all(&self.root).map_err(|e| StorageError::Io(e.to_string()))?;
        self.mounted.store(true, Ordering::SeqCst);
        debug!(root = %self.root.display(), "storage mounted");
        Ok(())
    }

    fn deinit(&self) -> Result<(), StorageError> {
        self.mounted.store(false, Ordering::SeqCst);
        Ok(())
    }

    fn create_directory(&self, dir: &str) -> Result<(), StorageError> {
        self.require_mounted()?;
        std::fs::create_dir_all(self.resolve(dir)).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn write(&self, path: &str, data: &[u8]) -> Result<(), StorageError> {
        self.require_mounted()?;
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            std::fs::create_dir_all(parent).map_err(|e| StorageError::Io(e.to_string()))?;
        }
        std::fs::write(&full, data).map_err(|e| StorageError::Io(e.to_string()))
    }

    fn read(&self, path: &str) -> Result<Vec<u8>, StorageError> {
        self.require_mounted()?;
        let full = self.resolve(path);
        std::fs::read(&full).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e.to_string())
            }
        })
    }

    fn delete_file(&self, path: &str) -> Result<(), StorageError> {
        self.require_mounted()?;
        std::fs::remove_file(self.resolve(path)).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                StorageError::NotFound(path.to_string())
            } else {
                StorageError::Io(e.to_string())
            }
        })
    }

    fn write_with_rotation(
        &self,
        dir: &str,
        prefix: &str,
        line: &str,
        max_file_size: u64,
    ) -> Result<(), StorageError> {
        self.require_mounted()?;
        let dir_path = self.resolve(dir);
        std::fs::create_dir_all(&dir_path).map_err(|e| StorageError::Io(e.to_string()))?;

        let active = dir_path.join(format!("{prefix}.log"));
        let current_len = std::fs::metadata(&active).map(|m| m.len()).unwrap_or(0);
        if current_len > 0 && current_len + line.len() as u64 + 1 > max_file_size {
            let target = self.rotation_target(&dir_path, prefix);
            std::fs::rename(&active, &target).map_err(|e| StorageError::Io(e.to_string()))?;
        }

        use std::io::Write;
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&active)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        writeln!(file, "{line}").map_err(|e| StorageError::Io(e.to_string()))
    }

    fn free_space(&self) -> Result<u64, StorageError> {
        self.require_mounted()?;
        let stat = nix::sys::statvfs::statvfs(&self.root)
            .map_err(|e| StorageError::Io(e.to_string()))?;
        Ok(stat.blocks_available() as u64 * stat.fragment_size() as u64)
    }
}

// ─── MemNvs ────────────────────────────────────────────────────────

/// In-memory NVS, used by the simulation profile and the tests.
#[derive(Default)]
pub struct MemNvs {
    blobs: Mutex<HashMap<String, Vec<u8>>>,
}

impl MemNvs {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NvsStore for MemNvs {
    fn set_blob(&self, namespace: &str, key: &str, value: &[u8]) -> Result<(), StorageError> {
        let mut blobs = match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        blobs.insert(format!("{namespace}/{key}"), value.to_vec());
        Ok(())
    }

    fn get_blob(&self, namespace: &str, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let blobs = match self.blobs.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        Ok(blobs.get(&format!("{namespace}/{key}")).cloned())
    }

    fn commit(&self) -> Result<(), StorageError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn mounted(dir: &TempDir) -> DirStorage {
        let storage = DirStorage::new(dir.path());
        storage.init().unwrap();
        storage
    }

    #[test]
    fn unmounted_storage_rejects_io() {
        let dir = TempDir::new().unwrap();
        let storage = DirStorage::new(dir.path());
        assert!(matches!(storage.write("a.txt", b"x"), Err(StorageError::NotMounted)));
    }

    #[test]
    fn write_read_roundtrip() {
        let dir = TempDir::new().unwrap();
        let storage = mounted(&dir);
        storage.write("sub/file.bin", b"payload").unwrap();
        assert_eq!(storage.read("sub/file.bin").unwrap(), b"payload");
    }

    #[test]
    fn read_missing_is_not_found() {
        let dir = TempDir::new().unwrap();
        let storage = mounted(&dir);
        assert!(matches!(storage.read("no.bin"), Err(StorageError::NotFound(_))));
    }

    #[test]
    fn rotation_starts_new_file() {
        let dir = TempDir::new().unwrap();
        let storage = mounted(&dir);

        // 20-byte cap: two ~12-byte lines force one rotation.
        storage.write_with_rotation("logs", "test", "0123456789", 20).unwrap();
        storage.write_with_rotation("logs", "test", "abcdefghij", 20).unwrap();

        assert!(dir.path().join("logs/test.log").exists());
        assert!(dir.path().join("logs/test_1.log").exists());
        let rotated = std::fs::read_to_string(dir.path().join("logs/test_1.log")).unwrap();
        assert_eq!(rotated, "0123456789\n");
    }

    #[test]
    fn free_space_is_positive() {
        let dir = TempDir::new().unwrap();
        let storage = mounted(&dir);
        assert!(storage.free_space().unwrap() > 0);
    }

    #[test]
    fn mem_nvs_roundtrip() {
        let nvs = MemNvs::new();
        assert_eq!(nvs.get_blob("ns", "key").unwrap(), None);
        nvs.set_blob("ns", "key", b"blob").unwrap();
        nvs.commit().unwrap();
        assert_eq!(nvs.get_blob("ns", "key").unwrap().as_deref(), Some(&b"blob"[..]));
    }
}
