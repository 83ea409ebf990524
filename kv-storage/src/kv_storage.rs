//! Composes [`crate::file_store::FileStore`] and [`crate::db::MetadataDb`]
//! behind one API, choosing inline vs. external storage per [`StorageMode`].
//!
//! Grounded on the teacher's `ThumbnailCache::new`/`with_config` for the
//! "build the directory tree, then open the backing store, retry once on
//! failure" constructor shape, and `SessionDb::open`/`open_at` for the
//! pair of a conventional-path constructor and a test-oriented
//! explicit-path constructor.

use crate::db::MetadataDb;
use crate::file_store::FileStore;
use std::path::{Path, PathBuf};

const PATH_MAX: usize = 4096;

/// Per-instance policy for where a value's bytes live.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StorageMode {
    /// Values are always stored as external files.
    File,
    /// Values are always stored inline in the manifest row.
    Sqlite,
    /// The caller chooses per write by supplying a filename or not.
    Mixed,
}

/// A single retrieved item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Vec<u8>,
    pub extended_data: Option<Vec<u8>>,
    pub size: i64,
    pub modification_time: i64,
    pub last_access_time: i64,
}

/// Metadata about an item without fetching its value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ItemInfo {
    pub key: String,
    pub size: i64,
    pub modification_time: i64,
    pub last_access_time: i64,
}

/// Persistent key-value store: a relational manifest plus a content-addressed
/// file directory. Not internally thread-safe — concurrent access from
/// multiple threads is the caller's responsibility (`KVStorage` holds no
/// locks of its own beyond what `MetadataDb`'s single connection requires).
pub struct KVStorage {
    mode: StorageMode,
    files: FileStore,
    db: MetadataDb,
}

impl KVStorage {
    /// Creates `path/`, `path/data/`, `path/trash/`, opens the database, and
    /// initializes the schema. On failure of either step, performs a full
    /// reset (moves `data/` to `trash/`, empties trash in the background,
    /// drops the manifest file) and retries once.
    pub fn open(root: impl Into<PathBuf>, mode: StorageMode) -> Option<Self> {
        let root = root.into();
        let root_str = root.to_string_lossy();
        if root_str.len() > PATH_MAX - 64 {
            tracing::warn!(path = %root_str, "kv-storage root path too long");
            return None;
        }

        match Self::try_open(&root, mode) {
            Some(store) => Some(store),
            None => {
                tracing::warn!(path = %root_str, "kv-storage open failed, resetting and retrying once");
                Self::reset(&root);
                Self::try_open(&root, mode)
            }
        }
    }

    fn try_open(root: &Path, mode: StorageMode) -> Option<Self> {
        std::fs::create_dir_all(root).ok()?;
        let files = FileStore::open(root).ok()?;
        let db_path = root.join("manifest.sqlite");
        let db = MetadataDb::new(db_path);
        // Force the schema to materialize now, rather than on first real use,
        // so a broken store is caught here instead of on the first write.
        db.count_all().ok()?;
        Some(Self { mode, files, db })
    }

    fn reset(root: &Path) {
        let manifest = root.join("manifest.sqlite");
        let _ = std::fs::remove_file(&manifest);
        let _ = std::fs::remove_file(root.join("manifest.sqlite-wal"));
        let _ = std::fs::remove_file(root.join("manifest.sqlite-shm"));
        if let Ok(files) = FileStore::open(root) {
            files.move_all_to_trash();
        }
    }

    pub fn mode(&self) -> StorageMode {
        self.mode
    }

    /// Writes a value. `filename`, if present and non-empty, stores the
    /// value externally under `data/`; otherwise the value is stored inline.
    /// In `StorageMode::File`, a write without a filename is rejected.
    pub fn save_item(
        &self,
        key: &str,
        value: &[u8],
        filename: Option<&str>,
        extended_data: Option<&[u8]>,
    ) -> bool {
        if key.is_empty() || value.is_empty() {
            return false;
        }
        let filename = filename.filter(|f| !f.is_empty());
        if self.mode == StorageMode::File && filename.is_none() {
            return false;
        }
        // In `Sqlite` mode values are always inline; in `File` mode they are
        // always external. Only `Mixed` mode lets the caller choose.
        let filename = match self.mode {
            StorageMode::Sqlite => None,
            _ => filename,
        };

        match filename {
            Some(filename) => {
                if !self.files.write(filename, value) {
                    return false;
                }
                let ok = self
                    .db
                    .upsert(key, Some(filename), value.len() as i64, None, extended_data)
                    .is_ok();
                if !ok {
                    self.files.delete(filename);
                }
                ok
            }
            None => {
                if let Ok(Some(prior_filename)) = self.db.get_filename(key) {
                    self.files.delete(&prior_filename);
                }
                self.db
                    .upsert(key, None, value.len() as i64, Some(value), extended_data)
                    .is_ok()
            }
        }
    }

    /// Fetches a row, reading its value from disk if externally stored.
    /// Heals an orphaned manifest row (file missing on disk) by deleting it
    /// and returning `None`.
    pub fn get_item(&self, key: &str) -> Option<Item> {
        let row = self.db.get(key, true).ok().flatten()?;
        let value = match &row.filename {
            Some(filename) => match self.files.read(filename) {
                Some(bytes) => bytes,
                None => {
                    let _ = self.db.delete(key);
                    return None;
                }
            },
            None => row.inline_data.clone().unwrap_or_default(),
        };
        let _ = self.db.update_access_time(key);
        Some(Item {
            key: row.key,
            value,
            extended_data: row.extended_data,
            size: row.size,
            modification_time: row.modification_time,
            last_access_time: row.last_access_time,
        })
    }

    /// Like [`Self::get_item`] but skips inline bytes and file reads entirely.
    pub fn get_item_info(&self, key: &str) -> Option<ItemInfo> {
        let row = self.db.get(key, false).ok().flatten()?;
        Some(ItemInfo {
            key: row.key,
            size: row.size,
            modification_time: row.modification_time,
            last_access_time: row.last_access_time,
        })
    }

    pub fn get_item_value(&self, key: &str) -> Option<Vec<u8>> {
        self.get_item(key).map(|i| i.value)
    }

    /// Fetches several items. A file-read failure for one key prunes that
    /// key's row and continues rather than aborting the whole batch. Returns
    /// `None` only if the underlying query itself failed.
    pub fn get_items_for_keys(&self, keys: &[String]) -> Option<Vec<Item>> {
        let rows = self.db.get_many(keys, true).ok()?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let value = match &row.filename {
                Some(filename) => match self.files.read(filename) {
                    Some(bytes) => bytes,
                    None => {
                        let _ = self.db.delete(&row.key);
                        continue;
                    }
                },
                None => row.inline_data.clone().unwrap_or_default(),
            };
            let _ = self.db.update_access_time(&row.key);
            out.push(Item {
                key: row.key,
                value,
                extended_data: row.extended_data,
                size: row.size,
                modification_time: row.modification_time,
                last_access_time: row.last_access_time,
            });
        }
        Some(out)
    }

    pub fn get_items_info_for_keys(&self, keys: &[String]) -> Option<Vec<ItemInfo>> {
        let rows = self.db.get_many(keys, false).ok()?;
        Some(
            rows.into_iter()
                .map(|row| ItemInfo {
                    key: row.key,
                    size: row.size,
                    modification_time: row.modification_time,
                    last_access_time: row.last_access_time,
                })
                .collect(),
        )
    }

    pub fn item_exists(&self, key: &str) -> bool {
        self.db.count_key(key).unwrap_or(0) > 0
    }

    pub fn get_items_count(&self) -> i64 {
        self.db.count_all().unwrap_or(0)
    }

    pub fn get_items_size(&self) -> i64 {
        self.db.sum_size().unwrap_or(0)
    }

    fn delete_file_for(&self, filename: &Option<String>) {
        if let Some(f) = filename {
            self.files.delete(f);
        }
    }

    pub fn remove_item(&self, key: &str) -> bool {
        let filename = self.db.get_filename(key).ok().flatten();
        let ok = self.db.delete(key).is_ok();
        if ok {
            if let Some(f) = filename {
                self.files.delete(&f);
            }
        }
        ok
    }

    pub fn remove_items(&self, keys: &[String]) -> bool {
        if keys.is_empty() {
            return true;
        }
        let Ok(rows) = self.db.get_many(keys, false) else {
            return false;
        };
        let ok = self.db.delete_many(keys).is_ok();
        if ok {
            for row in rows {
                self.delete_file_for(&row.filename);
            }
            let _ = self.db.checkpoint();
        }
        ok
    }

    pub fn remove_all_items(&self) -> bool {
        let ok = self.db.delete_all().is_ok();
        if ok {
            self.files.move_all_to_trash();
            let _ = self.db.checkpoint();
        }
        ok
    }

    pub fn remove_items_larger_than(&self, size: i64) -> bool {
        let Ok(rows) = self.db.rows_larger_than(size) else {
            return false;
        };
        let keys: Vec<String> = rows.iter().map(|(k, _)| k.clone()).collect();
        if keys.is_empty() {
            return true;
        }
        let ok = self.db.delete_many(&keys).is_ok();
        if ok {
            for (_, filename) in rows {
                self.delete_file_for(&filename);
            }
            let _ = self.db.checkpoint();
        }
        ok
    }

    pub fn remove_items_earlier_than(&self, timestamp: i64) -> bool {
        let Ok(rows) = self.db.rows_earlier_than(timestamp) else {
            return false;
        };
        let keys: Vec<String> = rows.iter().map(|(k, _)| k.clone()).collect();
        if keys.is_empty() {
            return true;
        }
        let ok = self.db.delete_many(&keys).is_ok();
        if ok {
            for (_, filename) in rows {
                self.delete_file_for(&filename);
            }
            let _ = self.db.checkpoint();
        }
        ok
    }

    const TRIM_BATCH: usize = 16;

    /// Fetches the oldest 16 rows at a time, deletes each row's file (if any)
    /// and its manifest row, and repeats until total size is within `limit`.
    pub fn remove_items_to_fit_size(&self, limit: i64) -> bool {
        let mut total = self.get_items_size();
        while total > limit {
            let Ok(batch) = self.db.get_oldest(Self::TRIM_BATCH) else {
                return false;
            };
            if batch.is_empty() {
                break;
            }
            for (key, filename, size) in batch {
                if total <= limit {
                    break;
                }
                if self.db.delete(&key).is_err() {
                    return false;
                }
                self.delete_file_for(&filename);
                total -= size;
            }
        }
        let _ = self.db.checkpoint();
        true
    }

    /// As [`Self::remove_items_to_fit_size`] but bounding row count instead of bytes.
    pub fn remove_items_to_fit_count(&self, limit: i64) -> bool {
        let mut total = self.get_items_count();
        while total > limit {
            let Ok(batch) = self.db.get_oldest(Self::TRIM_BATCH) else {
                return false;
            };
            if batch.is_empty() {
                break;
            }
            for (key, filename, _size) in batch {
                if total <= limit {
                    break;
                }
                if self.db.delete(&key).is_err() {
                    return false;
                }
                self.delete_file_for(&filename);
                total -= 1;
            }
        }
        let _ = self.db.checkpoint();
        true
    }

    const PROGRESS_BATCH: usize = 32;

    /// Removes everything, reporting `(removed, total)` after each batch.
    /// `on_end(errored)` is invoked exactly once.
    pub fn remove_all_with_progress(
        &self,
        mut on_progress: impl FnMut(usize, usize),
        on_end: impl FnOnce(bool),
    ) {
        let total = self.get_items_count();
        if total < 0 {
            on_end(true);
            return;
        }
        let total = total as usize;
        let mut removed = 0usize;
        let mut errored = false;

        while removed < total {
            let Ok(batch) = self.db.get_oldest(Self::PROGRESS_BATCH) else {
                errored = true;
                break;
            };
            if batch.is_empty() {
                break;
            }
            for (key, filename, _size) in batch {
                if self.db.delete(&key).is_err() {
                    errored = true;
                    break;
                }
                self.delete_file_for(&filename);
                removed += 1;
                on_progress(removed, total);
            }
            if errored {
                break;
            }
        }

        let _ = self.db.checkpoint();
        on_end(errored);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store(mode: StorageMode) -> (KVStorage, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let store = KVStorage::open(dir.path(), mode).unwrap();
        (store, dir)
    }

    #[test]
    fn s4_persistent_round_trip() {
        let (store, _dir) = open_store(StorageMode::Mixed);
        assert!(store.save_item("animal", b"bytes1", Some("animal"), Some(b"meta")));
        let item = store.get_item("animal").unwrap();
        assert_eq!(item.value, b"bytes1");
        assert_eq!(item.extended_data, Some(b"meta".to_vec()));
        assert!(store.item_exists("animal"));
    }

    #[test]
    fn s5_missing_file_heals() {
        let (store, dir) = open_store(StorageMode::Mixed);
        store.save_item("animal", b"bytes1", Some("animal"), Some(b"meta"));
        std::fs::remove_file(dir.path().join("data").join("animal")).unwrap();
        assert_eq!(store.get_item("animal"), None);
        assert!(!store.item_exists("animal"));
    }

    #[test]
    fn s6_size_trim() {
        let (store, _dir) = open_store(StorageMode::Sqlite);
        for size in (10..=100).step_by(10) {
            let value = vec![0u8; size];
            store.save_item(&format!("k{size}"), &value, None, None);
        }
        store.remove_items_larger_than(50);
        assert_eq!(store.get_items_size(), 150);
        for size in (10..=50).step_by(10) {
            assert!(store.item_exists(&format!("k{size}")));
        }
        for size in (60..=100).step_by(10) {
            assert!(!store.item_exists(&format!("k{size}")));
        }
    }

    #[test]
    fn remove_items_to_fit_count_keeps_exactly_the_m_newest() {
        let (store, _dir) = open_store(StorageMode::Sqlite);
        for i in 0..10 {
            store.save_item(&format!("k{i}"), b"x", None, None);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert!(store.remove_items_to_fit_count(4));
        assert_eq!(store.get_items_count(), 4);
        for i in 0..6 {
            assert!(!store.item_exists(&format!("k{i}")), "k{i} should have been trimmed");
        }
        for i in 6..10 {
            assert!(store.item_exists(&format!("k{i}")), "k{i} should have survived");
        }
    }

    #[test]
    fn remove_items_to_fit_count_does_not_over_trim_mid_batch() {
        let (store, _dir) = open_store(StorageMode::Sqlite);
        for i in 0..5 {
            store.save_item(&format!("k{i}"), b"x", None, None);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        // limit sits inside what would otherwise be a single 16-row batch
        assert!(store.remove_items_to_fit_count(4));
        assert_eq!(store.get_items_count(), 4);
        assert!(!store.item_exists("k0"));
        for i in 1..5 {
            assert!(store.item_exists(&format!("k{i}")));
        }
    }

    #[test]
    fn remove_items_to_fit_size_does_not_over_trim_mid_batch() {
        let (store, _dir) = open_store(StorageMode::Sqlite);
        // five 10-byte rows, all within a single 16-row trim batch
        for i in 0..5 {
            store.save_item(&format!("k{i}"), &[0u8; 10], None, None);
            std::thread::sleep(std::time::Duration::from_millis(2));
        }
        assert_eq!(store.get_items_size(), 50);
        // limit only requires deleting the single oldest row, not the whole batch
        assert!(store.remove_items_to_fit_size(45));
        assert_eq!(store.get_items_size(), 40);
        assert!(!store.item_exists("k0"));
        for i in 1..5 {
            assert!(store.item_exists(&format!("k{i}")), "k{i} should have survived");
        }
    }

    #[test]
    fn s7_progress_reports_monotonically_to_completion() {
        let (store, _dir) = open_store(StorageMode::Sqlite);
        for i in 0..50 {
            store.save_item(&format!("k{i}"), b"x", None, None);
        }
        let mut progresses = Vec::new();
        let mut ended = None;
        store.remove_all_with_progress(
            |removed, total| progresses.push((removed, total)),
            |errored| ended = Some(errored),
        );
        assert_eq!(ended, Some(false));
        assert_eq!(progresses.last(), Some(&(50, 50)));
        let mut last = 0;
        for (removed, total) in &progresses {
            assert_eq!(*total, 50);
            assert!(*removed >= last);
            last = *removed;
        }
        assert_eq!(store.get_items_count(), 0);
    }

    #[test]
    fn file_mode_rejects_missing_filename() {
        let (store, _dir) = open_store(StorageMode::File);
        assert!(!store.save_item("k", b"v", None, None));
        assert!(store.save_item("k", b"v", Some("k.bin"), None));
    }

    #[test]
    fn sqlite_mode_always_inline() {
        let (store, dir) = open_store(StorageMode::Sqlite);
        store.save_item("k", b"v", Some("ignored"), None);
        // filename is ignored in sqlite mode; value lives inline, no file written
        assert!(!dir.path().join("data").join("ignored").exists());
        assert_eq!(store.get_item_value("k"), Some(b"v".to_vec()));
    }

    #[test]
    fn remove_all_items_empties_store() {
        let (store, _dir) = open_store(StorageMode::Mixed);
        store.save_item("a", b"1", Some("a"), None);
        store.save_item("b", b"2", None, None);
        assert!(store.remove_all_items());
        assert_eq!(store.get_items_count(), 0);
        assert_eq!(store.get_items_size(), 0);
    }

    #[test]
    fn multi_key_read_prunes_missing_files_not_whole_batch() {
        let (store, dir) = open_store(StorageMode::Mixed);
        store.save_item("a", b"1", Some("a"), None);
        store.save_item("b", b"2", Some("b"), None);
        std::fs::remove_file(dir.path().join("data").join("a")).unwrap();

        let items = store
            .get_items_for_keys(&["a".to_string(), "b".to_string()])
            .unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].key, "b");
        assert!(!store.item_exists("a"));
    }
}
