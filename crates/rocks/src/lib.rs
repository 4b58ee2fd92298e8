use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rocksdb::{
    BottommostLevelCompaction, ColumnFamily, CompactOptions, Direction, IteratorMode, ReadOptions,
    Snapshot, WriteBatch,
};

pub use rocksdb;

/// The column family every database starts with.
pub const DEFAULT_COLUMN_FAMILY: &str = "default";
/// Framework state: consumer offsets, the applied version timestamp, and
/// whatever else the pipeline needs to persist about itself.
pub const METADATA_COLUMN_FAMILY: &str = "smyte-metadata";

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("RocksDB error: {0}")]
    Rocks(#[from] rocksdb::Error),
    #[error("Column family not found: {0}")]
    UnknownColumnFamily(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Thin facade over the opened database: column-family handles by name,
/// column-family groups for virtual sharding, and the master-replica bit.
///
/// The handle maps are fixed after startup. Components borrow the facade and
/// never mutate it, so no locking is layered on top of the engine's own.
pub struct StoreManager {
    db: rocksdb::DB,
    path: PathBuf,
    cf_names: Vec<String>,
    cf_groups: BTreeMap<String, Vec<String>>,
    master_replica: bool,
    frozen: AtomicBool,
}

impl StoreManager {
    /// Wrap an opened database. `cf_names` must cover every live column
    /// family; the default and metadata families are required.
    pub fn new(
        db: rocksdb::DB,
        path: impl Into<PathBuf>,
        cf_names: Vec<String>,
        cf_groups: BTreeMap<String, Vec<String>>,
        master_replica: bool,
    ) -> Self {
        assert!(
            cf_names.iter().any(|name| name == DEFAULT_COLUMN_FAMILY),
            "database must include the default column family"
        );
        assert!(
            cf_names.iter().any(|name| name == METADATA_COLUMN_FAMILY),
            "database must include the {METADATA_COLUMN_FAMILY} column family"
        );
        let manager = StoreManager {
            db,
            path: path.into(),
            cf_names,
            cf_groups,
            master_replica,
            frozen: AtomicBool::new(false),
        };
        for name in &manager.cf_names {
            assert!(
                manager.db.cf_handle(name).is_some(),
                "column family handle missing: {name}"
            );
        }
        manager
    }

    pub fn db(&self) -> &rocksdb::DB {
        &self.db
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_master_replica(&self) -> bool {
        self.master_replica
    }

    pub fn cf_names(&self) -> &[String] {
        &self.cf_names
    }

    pub fn cf(&self, name: &str) -> Result<&ColumnFamily, Error> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| Error::UnknownColumnFamily(name.to_string()))
    }

    pub fn metadata_cf(&self) -> &ColumnFamily {
        self.db
            .cf_handle(METADATA_COLUMN_FAMILY)
            .expect("metadata column family was validated at construction")
    }

    /// Ordered column families of a virtual-shard group.
    pub fn cf_group(&self, group: &str) -> Option<&[String]> {
        self.cf_groups.get(group).map(Vec::as_slice)
    }

    pub fn cf_groups(&self) -> &BTreeMap<String, Vec<String>> {
        &self.cf_groups
    }

    pub fn get(&self, cf_name: &str, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get_cf(self.cf(cf_name)?, key)?)
    }

    pub fn put(&self, cf_name: &str, key: &[u8], value: &[u8]) -> Result<(), Error> {
        Ok(self.db.put_cf(self.cf(cf_name)?, key, value)?)
    }

    pub fn delete(&self, cf_name: &str, key: &[u8]) -> Result<(), Error> {
        Ok(self.db.delete_cf(self.cf(cf_name)?, key)?)
    }

    pub fn get_metadata(&self, key: &[u8]) -> Result<Option<Vec<u8>>, Error> {
        Ok(self.db.get_cf(self.metadata_cf(), key)?)
    }

    pub fn put_metadata(&self, key: &[u8], value: &[u8]) -> Result<(), Error> {
        Ok(self.db.put_cf(self.metadata_cf(), key, value)?)
    }

    /// Apply `batch` atomically.
    pub fn write(&self, batch: WriteBatch) -> Result<(), Error> {
        Ok(self.db.write(batch)?)
    }

    pub fn snapshot(&self) -> Snapshot<'_> {
        self.db.snapshot()
    }

    /// Collect up to `limit` key/value pairs of `cf_name` within
    /// `[lower, upper)` in lexicographic order. `limit` of zero means
    /// unlimited.
    pub fn iterate(
        &self,
        cf_name: &str,
        lower: Option<&[u8]>,
        upper: Option<&[u8]>,
        limit: usize,
    ) -> Result<Vec<(Box<[u8]>, Box<[u8]>)>, Error> {
        let cf = self.cf(cf_name)?;
        let mut read_opts = ReadOptions::default();
        if let Some(upper) = upper {
            read_opts.set_iterate_upper_bound(upper.to_vec());
        }
        let mode = match lower {
            Some(lower) => IteratorMode::From(lower, Direction::Forward),
            None => IteratorMode::Start,
        };

        let mut pairs = Vec::new();
        for entry in self.db.iterator_cf_opt(cf, read_opts, mode) {
            let (key, value) = entry?;
            pairs.push((key, value));
            if limit != 0 && pairs.len() >= limit {
                break;
            }
        }
        Ok(pairs)
    }

    pub fn drop_cf(&mut self, name: &str) -> Result<(), Error> {
        if self.db.cf_handle(name).is_none() {
            return Err(Error::UnknownColumnFamily(name.to_string()));
        }
        self.db.drop_cf(name)?;
        self.cf_names.retain(|kept| kept != name);
        tracing::info!(name, "dropped column family");
        Ok(())
    }

    /// Stop background compactions (the source of file deletions) and return
    /// the current live files, MANIFEST and WAL entries suffixed with their
    /// size. Backup tooling copies the returned files and then calls
    /// [`StoreManager::thaw`].
    pub fn freeze(&self) -> Result<Vec<String>, Error> {
        self.set_auto_compactions(false)?;
        self.frozen.store(true, Ordering::SeqCst);

        let mut files = Vec::new();
        for live in self.db.live_files()? {
            files.push(live.name);
        }
        // The table listing excludes the database's bookkeeping files; pick
        // them up from the directory while deletions are quiesced.
        for entry in std::fs::read_dir(&self.path)? {
            let entry = entry?;
            let name = entry.file_name().to_string_lossy().into_owned();
            if name == "CURRENT" || name.starts_with("OPTIONS-") {
                files.push(format!("/{name}"));
            } else if name.starts_with("MANIFEST-") || name.ends_with(".log") {
                let size = entry.metadata()?.len();
                files.push(format!("/{name}:{size}"));
            }
        }
        Ok(files)
    }

    /// Re-enable background compactions after a [`StoreManager::freeze`].
    pub fn thaw(&self) -> Result<(), Error> {
        self.set_auto_compactions(true)?;
        self.frozen.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_frozen(&self) -> bool {
        self.frozen.load(Ordering::SeqCst)
    }

    /// Force a full compaction of `cf_name`, optionally bounded to
    /// `[start, end]`, on a detached thread. Compactions can run for a long
    /// time; the caller's thread returns immediately.
    pub fn force_compact_detached(
        self: &Arc<Self>,
        cf_name: &str,
        range: Option<(Vec<u8>, Vec<u8>)>,
    ) -> Result<(), Error> {
        // Validate up front so the caller learns about a bad name.
        self.cf(cf_name)?;

        let manager = Arc::clone(self);
        let cf_name = cf_name.to_string();
        std::thread::spawn(move || {
            let Ok(cf) = manager.cf(&cf_name) else {
                return;
            };
            let mut opts = CompactOptions::default();
            // Move data back down to the minimum level able to hold it, and
            // force the bottommost level through as well.
            opts.set_change_level(true);
            opts.set_bottommost_level_compaction(BottommostLevelCompaction::Force);

            tracing::info!(cf = %cf_name, "starting forced compaction");
            match &range {
                Some((start, end)) => manager.db.compact_range_cf_opt(
                    cf,
                    Some(start.as_slice()),
                    Some(end.as_slice()),
                    &opts,
                ),
                None => {
                    manager
                        .db
                        .compact_range_cf_opt(cf, None::<&[u8]>, None::<&[u8]>, &opts)
                }
            }
            tracing::info!(cf = %cf_name, "forced compaction finished");
        });
        Ok(())
    }

    pub fn property(&self, cf_name: &str, property: &str) -> Result<Option<String>, Error> {
        Ok(self.db.property_value_cf(self.cf(cf_name)?, property)?)
    }

    pub fn property_int(&self, cf_name: &str, property: &str) -> Result<Option<u64>, Error> {
        Ok(self.db.property_int_value_cf(self.cf(cf_name)?, property)?)
    }

    fn set_auto_compactions(&self, enabled: bool) -> Result<(), Error> {
        let value = if enabled { "false" } else { "true" };
        for name in &self.cf_names {
            let cf = self.cf(name)?;
            self.db
                .set_options_cf(cf, &[("disable_auto_compactions", value)])?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for StoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StoreManager")
            .field("path", &self.path)
            .field("cf_names", &self.cf_names)
            .field("cf_groups", &self.cf_groups)
            .field("master_replica", &self.master_replica)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // Builds an empty database in a temporary directory with the required
    // column families plus one extra for tests to play with.
    fn build_test_store() -> (tempfile::TempDir, Arc<StoreManager>) {
        let dir = tempfile::TempDir::new().unwrap();

        let mut opts = rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let names = vec![
            DEFAULT_COLUMN_FAMILY.to_string(),
            METADATA_COLUMN_FAMILY.to_string(),
            "extra".to_string(),
        ];
        let db = rocksdb::DB::open_cf(&opts, dir.path(), names.iter()).unwrap();
        let store = StoreManager::new(db, dir.path(), names, BTreeMap::new(), false);
        (dir, Arc::new(store))
    }

    #[test]
    fn get_put_roundtrip() {
        let (_dir, store) = build_test_store();

        assert_eq!(store.get(DEFAULT_COLUMN_FAMILY, b"k").unwrap(), None);
        store.put(DEFAULT_COLUMN_FAMILY, b"k", b"v").unwrap();
        assert_eq!(
            store.get(DEFAULT_COLUMN_FAMILY, b"k").unwrap(),
            Some(b"v".to_vec())
        );

        store.put_metadata(b"meta", b"1").unwrap();
        assert_eq!(store.get_metadata(b"meta").unwrap(), Some(b"1".to_vec()));
        // Metadata lives in its own family.
        assert_eq!(store.get(DEFAULT_COLUMN_FAMILY, b"meta").unwrap(), None);
    }

    #[test]
    fn unknown_column_family_is_an_error() {
        let (_dir, store) = build_test_store();
        assert!(matches!(
            store.get("nope", b"k"),
            Err(Error::UnknownColumnFamily(_))
        ));
    }

    #[test]
    fn write_batch_is_atomic_across_families() {
        let (_dir, store) = build_test_store();

        let mut batch = WriteBatch::default();
        batch.put_cf(store.cf("extra").unwrap(), b"a", b"1");
        batch.put_cf(store.metadata_cf(), b"b", b"2");
        store.write(batch).unwrap();

        assert_eq!(store.get("extra", b"a").unwrap(), Some(b"1".to_vec()));
        assert_eq!(store.get_metadata(b"b").unwrap(), Some(b"2".to_vec()));
    }

    #[test]
    fn iterate_respects_bounds_and_limit() {
        let (_dir, store) = build_test_store();
        for key in [b"a", b"b", b"c", b"d"] {
            store.put("extra", key, b"x").unwrap();
        }

        let pairs = store.iterate("extra", None, None, 0).unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec(), b"d".to_vec()]);

        let pairs = store.iterate("extra", Some(b"b"), Some(b"d"), 0).unwrap();
        let keys: Vec<_> = pairs.iter().map(|(k, _)| k.to_vec()).collect();
        assert_eq!(keys, vec![b"b".to_vec(), b"c".to_vec()]);

        let pairs = store.iterate("extra", None, None, 2).unwrap();
        assert_eq!(pairs.len(), 2);
    }

    #[test]
    fn freeze_lists_files_and_thaw_recovers() {
        let (_dir, store) = build_test_store();
        store.put(DEFAULT_COLUMN_FAMILY, b"k", b"v").unwrap();

        let files = store.freeze().unwrap();
        assert!(store.is_frozen());
        assert!(files.iter().any(|f| f.contains("CURRENT")));
        assert!(files
            .iter()
            .any(|f| f.contains("MANIFEST") && f.contains(':')));

        store.thaw().unwrap();
        assert!(!store.is_frozen());
    }

    #[test]
    fn detached_compaction_accepts_ranges() {
        let (_dir, store) = build_test_store();
        for i in 0..100u32 {
            store
                .put("extra", format!("key-{i:04}").as_bytes(), b"v")
                .unwrap();
        }

        store.force_compact_detached("extra", None).unwrap();
        store
            .force_compact_detached("extra", Some((b"key-0010".to_vec(), b"key-0050".to_vec())))
            .unwrap();
        assert!(matches!(
            store.force_compact_detached("nope", None),
            Err(Error::UnknownColumnFamily(_))
        ));
    }
}
