//! Content-file directory plus a staged trash for asynchronous reclamation.
//!
//! Grounded on the teacher's disk-cache half of `ThumbnailCache` (plain
//! `fs::write`/`fs::read`/`fs::remove_dir_all` calls resolved against a
//! computed path), generalized from its tier subdirectories to the flat
//! `data/` + `trash/<uuid>/` layout described in the on-disk layout section.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{self, Sender};

/// Manages a `data/` directory of content files and a `trash/` directory
/// drained by a dedicated background thread.
pub struct FileStore {
    root: PathBuf,
    data_dir: PathBuf,
    trash_dir: PathBuf,
    trash_tx: Sender<PathBuf>,
}

impl FileStore {
    /// Creates (if missing) `root/data` and `root/trash`, and starts the
    /// trash-draining worker thread.
    pub fn open(root: impl Into<PathBuf>) -> std::io::Result<Self> {
        let root = root.into();
        let data_dir = root.join("data");
        let trash_dir = root.join("trash");
        fs::create_dir_all(&data_dir)?;
        fs::create_dir_all(&trash_dir)?;

        let (trash_tx, trash_rx) = mpsc::channel::<PathBuf>();
        std::thread::Builder::new()
            .name("kv-storage-trash".to_string())
            .spawn(move || {
                while let Ok(path) = trash_rx.recv() {
                    if let Err(e) = fs::remove_dir_all(&path) {
                        if e.kind() != std::io::ErrorKind::NotFound {
                            tracing::warn!(path = %path.display(), error = %e, "failed to empty trash entry");
                        }
                    }
                }
            })
            .expect("failed to spawn trash-drain thread");

        Ok(Self {
            root,
            data_dir,
            trash_dir,
            trash_tx,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }

    fn data_path(&self, filename: &str) -> PathBuf {
        self.data_dir.join(filename)
    }

    /// Writes `bytes` to `data/<filename>`, overwriting any prior content.
    pub fn write(&self, filename: &str, bytes: &[u8]) -> bool {
        fs::write(self.data_path(filename), bytes).is_ok()
    }

    /// Reads the entire file. Returns `None` on any error, including "not found".
    pub fn read(&self, filename: &str) -> Option<Vec<u8>> {
        fs::read(self.data_path(filename)).ok()
    }

    /// Returns the byte length of the file, or `None` if it doesn't exist.
    pub fn size_of(&self, filename: &str) -> Option<u64> {
        fs::metadata(self.data_path(filename)).ok().map(|m| m.len())
    }

    /// Removes the file. Absence at the filesystem level is reported as a
    /// failure here (the caller-facing "absence is not an error" contract
    /// lives one layer up, in [`crate::KVStorage`]).
    pub fn delete(&self, filename: &str) -> bool {
        fs::remove_file(self.data_path(filename)).is_ok()
    }

    /// Renames the current `data/` directory to `trash/<uuid>` and recreates
    /// an empty `data/`. The reclamation primitive used by full reset/rebuild.
    pub fn move_all_to_trash(&self) -> bool {
        let trashed = self.trash_dir.join(uuid::Uuid::new_v4().to_string());
        if fs::rename(&self.data_dir, &trashed).is_err() {
            return false;
        }
        if fs::create_dir_all(&self.data_dir).is_err() {
            return false;
        }
        self.empty_trash_in_background();
        true
    }

    /// Enqueues every entry currently beneath `trash/` for background
    /// removal. Errors are logged, never surfaced — `trash/` is never read
    /// by anything else, so a stray leftover costs only disk space.
    pub fn empty_trash_in_background(&self) {
        let entries = match fs::read_dir(&self.trash_dir) {
            Ok(entries) => entries,
            Err(e) => {
                tracing::warn!(error = %e, "failed to list trash directory");
                return;
            }
        };
        for entry in entries.flatten() {
            let _ = self.trash_tx.send(entry.path());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_then_read_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert!(store.write("a.bin", b"hello"));
        assert_eq!(store.read("a.bin"), Some(b"hello".to_vec()));
        assert_eq!(store.size_of("a.bin"), Some(5));
    }

    #[test]
    fn read_missing_returns_none_not_error() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        assert_eq!(store.read("missing.bin"), None);
    }

    #[test]
    fn delete_removes_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("a.bin", b"hi");
        assert!(store.delete("a.bin"));
        assert_eq!(store.read("a.bin"), None);
    }

    #[test]
    fn move_all_to_trash_empties_and_recreates_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = FileStore::open(dir.path()).unwrap();
        store.write("a.bin", b"hi");
        assert!(store.move_all_to_trash());
        assert_eq!(store.read("a.bin"), None);
        assert!(store.data_dir().exists());

        // give the background drain thread a moment, then confirm trash empties
        for _ in 0..50 {
            let remaining = fs::read_dir(dir.path().join("trash")).unwrap().count();
            if remaining == 0 {
                break;
            }
            std::thread::sleep(std::time::Duration::from_millis(20));
        }
        assert_eq!(fs::read_dir(dir.path().join("trash")).unwrap().count(), 0);
    }
}
