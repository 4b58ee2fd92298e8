use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, RwLock};

use rocks::rocksdb::WriteBatch;
use rocks::StoreManager;

// librdkafka's numeric offset sentinels, reproduced so persisted raw commits
// stay byte-compatible with existing deployments.
pub const OFFSET_BEGINNING: i64 = -2;
pub const OFFSET_END: i64 = -1;
pub const OFFSET_STORED: i64 = -1000;
pub const OFFSET_INVALID: i64 = -1001;

// Fixed-width decimal encoding of an i64.
const INT64_MAX_DIGITS: usize = 20;

struct OffsetEntry {
    topic: String,
    partition: i32,
    last_committed: AtomicI64,
    high_watermark: AtomicI64,
    lagging: AtomicBool,
}

impl OffsetEntry {
    fn refresh_lagging(&self) {
        let last = self.last_committed.load(Ordering::Relaxed);
        let high = self.high_watermark.load(Ordering::Relaxed);
        let lagging = last != OFFSET_INVALID && high != OFFSET_INVALID && high > last;
        self.lagging.store(lagging, Ordering::Relaxed);
    }
}

/// Per-(topic, partition) consumption bookkeeping.
///
/// For every linked offset key this tracks the durably committed offset and
/// the broker-reported high watermark. Offsets persist in the metadata
/// column family under `~kafka-offset~<topic>~<partition>~<suffix>`, encoded
/// as plain decimal so they are easy to inspect with `getmeta`; the handful
/// of keys per database makes the encoding's size irrelevant.
///
/// Keys are linked sequentially during startup. Afterwards only existing
/// entries are updated, each by its owning consumer thread plus the
/// statistics callback.
pub struct OffsetTracker {
    store: Arc<StoreManager>,
    entries: RwLock<BTreeMap<String, Arc<OffsetEntry>>>,
}

impl OffsetTracker {
    pub fn new(store: Arc<StoreManager>) -> Self {
        OffsetTracker {
            store,
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn encode_offset(offset: i64) -> String {
        offset.to_string()
    }

    /// Decode a committed offset, yielding `OFFSET_INVALID` when the stored
    /// bytes do not parse.
    pub fn decode_offset(value: &[u8]) -> i64 {
        match std::str::from_utf8(value).ok().and_then(|s| s.parse().ok()) {
            Some(offset) => offset,
            None => {
                tracing::error!(
                    value = %String::from_utf8_lossy(value),
                    "error decoding kafka offset"
                );
                OFFSET_INVALID
            }
        }
    }

    /// Fixed-width `<log offset>:<file offset>` form used by archive
    /// consumers. Sentinels are not representable: both values must be
    /// non-negative.
    pub fn encode_offset_pair(log_offset: i64, file_offset: i64) -> String {
        assert!(
            log_offset >= 0 && file_offset >= 0,
            "offset pairs do not support negative sentinel values"
        );
        format!("{log_offset:020}:{file_offset:020}")
    }

    /// Inverse of [`Self::encode_offset_pair`]: exactly 41 bytes, two
    /// 20-digit decimals.
    pub fn decode_offset_pair(value: &[u8]) -> Option<(i64, i64)> {
        if value.len() != INT64_MAX_DIGITS * 2 + 1 {
            tracing::error!(
                value = %String::from_utf8_lossy(value),
                "encoded kafka and file offsets are not 41 bytes long"
            );
            return None;
        }
        let parse = |bytes: &[u8]| -> Option<i64> {
            std::str::from_utf8(bytes).ok()?.parse().ok()
        };
        let log_offset = parse(&value[..INT64_MAX_DIGITS]);
        let file_offset = parse(&value[INT64_MAX_DIGITS + 1..]);
        match (log_offset, file_offset) {
            (Some(log_offset), Some(file_offset)) => Some((log_offset, file_offset)),
            _ => {
                tracing::error!(
                    value = %String::from_utf8_lossy(value),
                    "error parsing kafka and file offsets"
                );
                None
            }
        }
    }

    /// Register a (topic, partition) pair and return its offset key. Each
    /// pair-plus-suffix may only be linked once, during startup.
    pub fn link(&self, topic: &str, partition: i32, suffix: &str) -> String {
        let offset_key = format!("~kafka-offset~{topic}~{partition}~{suffix}");
        let mut entries = self.entries.write().unwrap();
        assert!(
            !entries.contains_key(&offset_key),
            "topic {topic} partition {partition} already linked"
        );
        entries.insert(
            offset_key.clone(),
            Arc::new(OffsetEntry {
                topic: topic.to_string(),
                partition,
                last_committed: AtomicI64::new(OFFSET_INVALID),
                high_watermark: AtomicI64::new(OFFSET_INVALID),
                lagging: AtomicBool::new(false),
            }),
        );
        offset_key
    }

    /// Commit any offset value, sentinels included. Used to seed one-off
    /// positions at startup.
    pub fn commit_raw(
        &self,
        offset_key: &str,
        offset: i64,
        batch: Option<&mut WriteBatch>,
    ) -> Result<(), rocks::Error> {
        self.commit_value(offset_key, &Self::encode_offset(offset), batch)?;
        self.set_last_committed(offset_key, offset);
        Ok(())
    }

    /// Commit the next offset to process; sentinels are a programming error
    /// here.
    pub fn commit_next(
        &self,
        offset_key: &str,
        next_offset: i64,
        batch: Option<&mut WriteBatch>,
    ) -> Result<(), rocks::Error> {
        assert!(next_offset >= 0, "expected a non-negative offset to process next");
        self.commit_raw(offset_key, next_offset, batch)
    }

    /// Commit the next offset together with the archive file offset that
    /// contains it.
    pub fn commit_pair(
        &self,
        offset_key: &str,
        next_offset: i64,
        file_offset: i64,
        batch: Option<&mut WriteBatch>,
    ) -> Result<(), rocks::Error> {
        assert!(
            next_offset >= 0 && file_offset >= 0,
            "expected non-negative offsets to process next"
        );
        self.commit_value(
            offset_key,
            &Self::encode_offset_pair(next_offset, file_offset),
            batch,
        )?;
        self.set_last_committed(offset_key, next_offset);
        Ok(())
    }

    /// Load the committed offset from storage, updating the in-memory view.
    /// Missing or undecodable values yield `OFFSET_INVALID`.
    pub fn load_committed(&self, offset_key: &str) -> i64 {
        let offset = match self.store.get_metadata(offset_key.as_bytes()) {
            Ok(Some(value)) => Self::decode_offset(&value),
            Ok(None) => {
                tracing::warn!(offset_key, "no committed offset found in the store");
                OFFSET_INVALID
            }
            Err(err) => {
                tracing::error!(%err, offset_key, "reading committed offset failed");
                OFFSET_INVALID
            }
        };
        self.set_last_committed(offset_key, offset);
        offset
    }

    /// Load a committed (log offset, file offset) pair from storage.
    pub fn load_committed_pair(&self, offset_key: &str) -> Option<(i64, i64)> {
        let decoded = match self.store.get_metadata(offset_key.as_bytes()) {
            Ok(Some(value)) => Self::decode_offset_pair(&value),
            Ok(None) => {
                tracing::warn!(offset_key, "no committed offsets found in the store");
                None
            }
            Err(err) => {
                tracing::error!(%err, offset_key, "reading committed offsets failed");
                None
            }
        };
        match decoded {
            Some((log_offset, file_offset)) => {
                self.set_last_committed(offset_key, log_offset);
                Some((log_offset, file_offset))
            }
            None => {
                self.set_last_committed(offset_key, OFFSET_INVALID);
                None
            }
        }
    }

    /// Fold the broker client's statistics blob into the high watermark for
    /// `offset_key`. A blob that fails to parse leaves the previous value.
    pub fn update_stats(&self, stats_json: &str, offset_key: &str) {
        let entry = self.entry(offset_key);
        let high = serde_json::from_str::<serde_json::Value>(stats_json)
            .ok()
            .and_then(|stats| {
                stats
                    .get("topics")?
                    .get(&entry.topic)?
                    .get("partitions")?
                    .get(entry.partition.to_string())?
                    .get("hi_offset")?
                    .as_i64()
            });
        match high {
            Some(high) if high != OFFSET_INVALID => {
                entry.high_watermark.store(high, Ordering::Relaxed);
                entry.refresh_lagging();
            }
            _ => tracing::warn!(offset_key, "parsing kafka stats JSON failed"),
        }
    }

    pub fn last_committed(&self, offset_key: &str) -> i64 {
        self.entry(offset_key).last_committed.load(Ordering::Relaxed)
    }

    pub fn high_watermark(&self, offset_key: &str) -> i64 {
        self.entry(offset_key).high_watermark.load(Ordering::Relaxed)
    }

    pub fn set_last_committed(&self, offset_key: &str, offset: i64) {
        let entry = self.entry(offset_key);
        entry.last_committed.store(offset, Ordering::Relaxed);
        entry.refresh_lagging();
    }

    pub fn is_any_lagging(&self) -> bool {
        self.entries
            .read()
            .unwrap()
            .values()
            .any(|entry| entry.lagging.load(Ordering::Relaxed))
    }

    /// Append the consumer stats lines of the `info` report.
    pub fn append_info(&self, out: &mut String) {
        let entries = self.entries.read().unwrap();
        for entry in entries.values() {
            let prefix = format!(
                "kafka_topic_{}_partition_{}_",
                entry.topic, entry.partition
            );
            let last = entry.last_committed.load(Ordering::Relaxed);
            let high = entry.high_watermark.load(Ordering::Relaxed);
            // The watermark is refreshed asynchronously and may trail the
            // committed offset for a moment; lag never reads negative.
            let lag = (high - last).max(0);
            writeln!(out, "{prefix}last_committed_offset:{last}").unwrap();
            writeln!(out, "{prefix}high_watermark_offset:{high}").unwrap();
            writeln!(out, "{prefix}lag:{lag}").unwrap();
        }
        let any_lagging = entries
            .values()
            .any(|entry| entry.lagging.load(Ordering::Relaxed));
        writeln!(out, "is_any_consumer_lagging:{}", any_lagging as u8).unwrap();
    }

    fn entry(&self, offset_key: &str) -> Arc<OffsetEntry> {
        self.entries
            .read()
            .unwrap()
            .get(offset_key)
            .unwrap_or_else(|| panic!("offset key was never linked: {offset_key}"))
            .clone()
    }

    fn commit_value(
        &self,
        offset_key: &str,
        value: &str,
        batch: Option<&mut WriteBatch>,
    ) -> Result<(), rocks::Error> {
        match batch {
            // The write joins the caller's batch; the caller commits.
            Some(batch) => {
                batch.put_cf(self.store.metadata_cf(), offset_key, value);
                Ok(())
            }
            None => self
                .store
                .put_metadata(offset_key.as_bytes(), value.as_bytes()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build_tracker() -> (tempfile::TempDir, Arc<StoreManager>, OffsetTracker) {
        let dir = tempfile::TempDir::new().unwrap();
        let mut opts = rocks::rocksdb::Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);
        let names = vec![
            rocks::DEFAULT_COLUMN_FAMILY.to_string(),
            rocks::METADATA_COLUMN_FAMILY.to_string(),
        ];
        let db = rocks::rocksdb::DB::open_cf(&opts, dir.path(), names.iter()).unwrap();
        let store = Arc::new(StoreManager::new(
            db,
            dir.path(),
            names,
            Default::default(),
            false,
        ));
        let tracker = OffsetTracker::new(store.clone());
        (dir, store, tracker)
    }

    #[test]
    fn offset_encoding_roundtrip() {
        for offset in [0i64, 1, 42, 1234567890123, OFFSET_BEGINNING, OFFSET_INVALID] {
            let encoded = OffsetTracker::encode_offset(offset);
            assert_eq!(OffsetTracker::decode_offset(encoded.as_bytes()), offset);
        }
        assert_eq!(OffsetTracker::decode_offset(b"not-a-number"), OFFSET_INVALID);
    }

    #[test]
    fn offset_pair_encoding_is_fixed_width() {
        let encoded = OffsetTracker::encode_offset_pair(12345, 67);
        assert_eq!(encoded.len(), 41);
        assert_eq!(
            encoded,
            "00000000000000012345:00000000000000000067"
        );
        assert_eq!(
            OffsetTracker::decode_offset_pair(encoded.as_bytes()),
            Some((12345, 67))
        );

        // Anything that is not exactly 41 bytes fails.
        assert_eq!(OffsetTracker::decode_offset_pair(b"123:456"), None);
        assert_eq!(OffsetTracker::decode_offset_pair(&encoded.as_bytes()[1..]), None);
        // Right length, junk digits.
        let junk = "x".repeat(41);
        assert_eq!(OffsetTracker::decode_offset_pair(junk.as_bytes()), None);
    }

    #[test]
    #[should_panic(expected = "negative sentinel")]
    fn offset_pair_rejects_sentinels() {
        OffsetTracker::encode_offset_pair(OFFSET_BEGINNING, 0);
    }

    #[test]
    fn link_initializes_counters_invalid() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 3, "");
        assert_eq!(key, "~kafka-offset~events~3~");
        assert_eq!(tracker.last_committed(&key), OFFSET_INVALID);
        assert_eq!(tracker.high_watermark(&key), OFFSET_INVALID);
        assert!(!tracker.is_any_lagging());
    }

    #[test]
    #[should_panic(expected = "already linked")]
    fn double_link_panics() {
        let (_dir, _store, tracker) = build_tracker();
        tracker.link("events", 3, "");
        tracker.link("events", 3, "");
    }

    #[test]
    fn commit_then_load_roundtrip() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 0, "");

        tracker.commit_next(&key, 42, None).unwrap();
        assert_eq!(tracker.last_committed(&key), 42);
        // Drop the in-memory view, then reload from storage.
        tracker.set_last_committed(&key, OFFSET_INVALID);
        assert_eq!(tracker.load_committed(&key), 42);
        assert_eq!(tracker.last_committed(&key), 42);
    }

    #[test]
    fn commit_pair_then_load_roundtrip() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 0, "store");

        tracker.commit_pair(&key, 1000, 950, None).unwrap();
        assert_eq!(tracker.load_committed_pair(&key), Some((1000, 950)));
        assert_eq!(tracker.last_committed(&key), 1000);
    }

    #[test]
    fn load_missing_offset_is_invalid() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 0, "");
        assert_eq!(tracker.load_committed(&key), OFFSET_INVALID);
        assert_eq!(tracker.load_committed_pair(&key), None);
    }

    #[test]
    fn commit_with_batch_joins_without_writing() {
        let (_dir, store, tracker) = build_tracker();
        let key = tracker.link("events", 0, "");

        let mut batch = WriteBatch::default();
        tracker.commit_next(&key, 7, Some(&mut batch)).unwrap();
        // In-memory view is updated immediately, storage only after the
        // caller commits the batch.
        assert_eq!(tracker.last_committed(&key), 7);
        assert_eq!(store.get_metadata(key.as_bytes()).unwrap(), None);

        store.write(batch).unwrap();
        assert_eq!(tracker.load_committed(&key), 7);
    }

    #[test]
    fn stats_blob_updates_high_watermark() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 2, "");

        let stats = serde_json::json!({
            "topics": {
                "events": {
                    "partitions": {
                        "2": { "hi_offset": 150 }
                    }
                }
            }
        })
        .to_string();
        tracker.update_stats(&stats, &key);
        assert_eq!(tracker.high_watermark(&key), 150);

        // A malformed blob leaves the previous value in place.
        tracker.update_stats("{not json", &key);
        assert_eq!(tracker.high_watermark(&key), 150);
        tracker.update_stats("{\"topics\":{}}", &key);
        assert_eq!(tracker.high_watermark(&key), 150);
    }

    #[test]
    fn info_lines_clamp_lag_to_zero() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 1, "");

        tracker.commit_next(&key, 100, None).unwrap();
        let stats = serde_json::json!({
            "topics": {"events": {"partitions": {"1": {"hi_offset": 90}}}}
        })
        .to_string();
        tracker.update_stats(&stats, &key);

        let mut out = String::new();
        tracker.append_info(&mut out);
        assert!(out.contains("kafka_topic_events_partition_1_last_committed_offset:100\n"));
        assert!(out.contains("kafka_topic_events_partition_1_high_watermark_offset:90\n"));
        // The watermark trails the commit; lag clamps to zero.
        assert!(out.contains("kafka_topic_events_partition_1_lag:0\n"));
        assert!(out.ends_with("is_any_consumer_lagging:0\n"));
    }

    #[test]
    fn lagging_consumer_is_reported() {
        let (_dir, _store, tracker) = build_tracker();
        let key = tracker.link("events", 1, "");

        tracker.commit_next(&key, 100, None).unwrap();
        let stats = serde_json::json!({
            "topics": {"events": {"partitions": {"1": {"hi_offset": 175}}}}
        })
        .to_string();
        tracker.update_stats(&stats, &key);

        assert!(tracker.is_any_lagging());
        let mut out = String::new();
        tracker.append_info(&mut out);
        assert!(out.contains("kafka_topic_events_partition_1_lag:75\n"));
        assert!(out.ends_with("is_any_consumer_lagging:1\n"));
    }
}
