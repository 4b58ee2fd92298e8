use std::io::BufReader;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rocks::rocksdb::WriteBatch;

use crate::consumer::{BatchProgress, Consumer, LogRecord, RecordProcessor, MAX_BATCH};
use crate::object_client::ObjectClient;
use crate::offsets::{OffsetTracker, OFFSET_STORED};
use crate::record::LogFileRecord;
use crate::{now_ms, ConsumerConfig, Error};

/// How long to wait before re-checking for an archive file that is not
/// there yet. Polling faster runs up object-storage request charges.
const RETRY_DELAY: Duration = Duration::from_secs(60);

/// Object name of the archive file starting at `file_offset`:
/// `<prefix><topic>/<partition:06>/<file_offset:020>`.
pub fn object_name(prefix: &str, topic: &str, partition: i32, file_offset: i64) -> String {
    format!("{prefix}{topic}/{partition:06}/{file_offset:020}")
}

struct OpenFile {
    reader: apache_avro::Reader<'static, BufReader<std::fs::File>>,
    // Dropping removes the downloaded copy.
    _download: tempfile::NamedTempFile,
}

/// Replays a partition from archived log files in object storage.
///
/// Each file covers a contiguous offset range and carries a `count`
/// metadata field; consecutive files chain by `file_offset + count`. The
/// consumer downloads one file at a time, streams its records to the
/// processor, and waits for the next file to appear upstream when it runs
/// off the end of the archive.
pub struct ArchiveConsumer {
    bucket: String,
    object_prefix: String,
    topic: String,
    partition: i32,
    group_id: String,
    offset_key: String,
    tracker: Arc<OffsetTracker>,
    client: Box<dyn ObjectClient>,
    processor: Box<dyn RecordProcessor>,
    run: Arc<AtomicBool>,
    current: Option<OpenFile>,
    current_file_offset: i64,
    next_file_offset: i64,
    next_offset: i64,
    initialized: bool,
}

impl ArchiveConsumer {
    pub fn new(
        config: &ConsumerConfig,
        offset_key: impl Into<String>,
        tracker: Arc<OffsetTracker>,
        client: Box<dyn ObjectClient>,
        processor: Box<dyn RecordProcessor>,
    ) -> Self {
        assert!(
            config.is_archive(),
            "archive consumers require object_store_bucket_name"
        );
        ArchiveConsumer {
            bucket: config.object_store_bucket_name.clone(),
            object_prefix: config.object_store_object_name_prefix.clone(),
            topic: config.topic.clone(),
            partition: config.partition,
            group_id: config.group_id.clone(),
            offset_key: offset_key.into(),
            tracker,
            client,
            processor,
            run: Arc::new(AtomicBool::new(true)),
            current: None,
            current_file_offset: 0,
            next_file_offset: 0,
            next_offset: 0,
            initialized: false,
        }
    }

    /// Download the file starting at `file_offset` and validate its record
    /// count. Returns the count, or an error when the object is missing or
    /// malformed.
    fn download_and_validate(
        &self,
        file_offset: i64,
        dest: &std::path::Path,
    ) -> Result<i64, Error> {
        let object = object_name(&self.object_prefix, &self.topic, self.partition, file_offset);
        tracing::info!(bucket = %self.bucket, object = %object, "downloading archive object");
        let metadata = self.client.download(&self.bucket, &object, dest)?;
        let count = metadata
            .get("count")
            .ok_or_else(|| Error::Invalid(format!("object {object} has no `count` metadata")))?
            .parse::<i64>()
            .map_err(|err| Error::Invalid(format!("bad `count` metadata on {object}: {err}")))?;
        if count <= 0 {
            return Err(Error::Invalid(format!(
                "invalid record count {count} on {object}"
            )));
        }
        tracing::info!(object = %object, count, "downloaded archive object");
        Ok(count)
    }

    /// Download the file at `file_offset` to a fresh temp path. With `retry`,
    /// keeps trying until the object appears or the consumer is stopped: in
    /// steady state a missing file just has not been uploaded yet.
    fn download_file(&self, file_offset: i64, retry: bool) -> Option<(tempfile::NamedTempFile, i64)> {
        while self.run.load(Ordering::SeqCst) {
            let download = tempfile::Builder::new()
                .prefix("kafka-archive.")
                .tempfile()
                .unwrap_or_else(|err| panic!("creating an archive download file: {err}"));
            match self.download_and_validate(file_offset, download.path()) {
                Ok(count) => return Some((download, count)),
                Err(err) if retry => {
                    tracing::warn!(
                        %err,
                        file_offset,
                        "archive file not available; retrying in {}s",
                        RETRY_DELAY.as_secs()
                    );
                    std::thread::sleep(RETRY_DELAY);
                }
                Err(err) => {
                    tracing::error!(%err, file_offset, "archive download failed");
                    return None;
                }
            }
        }
        None
    }

    fn open(download: tempfile::NamedTempFile) -> OpenFile {
        let file = std::fs::File::open(download.path())
            .unwrap_or_else(|err| panic!("reopening a downloaded archive file: {err}"));
        let reader = apache_avro::Reader::new(BufReader::new(file))
            .unwrap_or_else(|err| panic!("downloaded archive file is not readable: {err}"));
        OpenFile {
            reader,
            _download: download,
        }
    }
}

impl Consumer for ArchiveConsumer {
    fn init(&mut self, initial_offset: i64) {
        assert!(!self.initialized, "consumer already initialized");
        assert!(
            initial_offset >= 0 || initial_offset == OFFSET_STORED,
            "either specify a valid initial offset or use OFFSET_STORED"
        );

        let (committed_offset, initial_file_offset) = self
            .tracker
            .load_committed_pair(&self.offset_key)
            .unwrap_or_else(|| {
                panic!(
                    "no committed offset pair for {}; archive consumers require a seeded pair",
                    self.offset_key
                )
            });
        let initial_offset = if initial_offset == OFFSET_STORED {
            committed_offset
        } else {
            initial_offset
        };
        assert!(
            initial_file_offset >= 0,
            "invalid initial file offset: {initial_file_offset}"
        );
        assert!(
            initial_offset >= initial_file_offset,
            "invalid combination of log offset {initial_offset} and file offset {initial_file_offset}"
        );

        // The initial download does not retry: a hole at the committed
        // position means the archive and the offsets disagree.
        let (download, count) = self
            .download_file(initial_file_offset, false)
            .unwrap_or_else(|| {
                panic!(
                    "failed to download or validate object for initial offset {initial_offset} \
                     and initial file offset {initial_file_offset}"
                )
            });
        assert!(
            initial_file_offset + count > initial_offset,
            "initial offset {initial_offset} is past the end of file {initial_file_offset} \
             with {count} records"
        );

        let mut open = Self::open(download);
        for skipped in initial_file_offset..initial_offset {
            open.reader.next().and_then(Result::ok).unwrap_or_else(|| {
                panic!("archive file {initial_file_offset} ended while skipping to {skipped}")
            });
        }

        self.current = Some(open);
        self.current_file_offset = initial_file_offset;
        self.next_file_offset = initial_file_offset + count;
        self.next_offset = initial_offset;
        self.initialized = true;

        tracing::info!(
            topic = %self.topic,
            partition = self.partition,
            group = %self.group_id,
            offset = self.next_offset,
            "start consuming archived partition"
        );
    }

    fn process_batch(&mut self, timeout_ms: u64) -> usize {
        assert!(self.initialized, "consumer has not been initialized");
        if !self.run.load(Ordering::SeqCst) {
            return 0;
        }

        if self.current.is_none() {
            assert_eq!(
                self.next_offset, self.next_file_offset,
                "log offset and file offset must match when starting a new file"
            );
            let Some((download, count)) = self.download_file(self.next_file_offset, true) else {
                return 0;
            };
            if !self.run.load(Ordering::SeqCst) {
                return 0;
            }
            self.current = Some(Self::open(download));
            self.current_file_offset = self.next_file_offset;
            self.next_file_offset += count;
        }

        // The timer starts after any download, which may well exceed the
        // batch timeout on its own.
        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        let start = now_ms();
        let mut remaining = timeout_ms as i64;
        while self.run.load(Ordering::SeqCst) && count < MAX_BATCH && remaining > 0 {
            let datum = self
                .current
                .as_mut()
                .expect("an archive file is open")
                .reader
                .next();
            let record = match datum {
                Some(Ok(value)) => LogFileRecord::from_value(value).unwrap_or_else(|err| {
                    panic!(
                        "archive file {} holds an undecodable record: {err}",
                        self.current_file_offset
                    )
                }),
                Some(Err(err)) => panic!(
                    "reading archive file {} failed: {err}",
                    self.current_file_offset
                ),
                None => panic!(
                    "record count in archive file {} is inconsistent with its metadata",
                    self.current_file_offset
                ),
            };

            self.processor.process_one(
                LogRecord {
                    offset: self.next_offset,
                    timestamp_ms: Some(record.timestamp),
                    key: record.key.as_deref(),
                    value: record.value.as_deref(),
                },
                &mut batch,
            );
            count += 1;
            self.next_offset += 1;

            if self.next_offset >= self.next_file_offset {
                assert_eq!(
                    self.next_offset, self.next_file_offset,
                    "log offset and file offset must match when finishing a file"
                );
                // File exhausted: drop the reader and its temp copy, wrap up
                // the batch. The next invocation downloads the next file.
                self.current = None;
                break;
            }
            remaining = timeout_ms as i64 - (now_ms() - start);
        }

        if count > 0 {
            metrics::counter!("kafka_archive_records_consumed").increment(count as u64);
            let file_offset = if self.current.is_some() {
                self.current_file_offset
            } else {
                self.next_file_offset
            };
            self.processor.finish_batch(
                batch,
                BatchProgress {
                    next_offset: self.next_offset,
                    file_offset: Some(file_offset),
                },
            );
        }
        count
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    fn on_stop(&mut self) {
        // Drops the open reader and deletes the temp download.
        self.current = None;
        tracing::info!(
            topic = %self.topic,
            partition = self.partition,
            "archive consumer destroyed"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object_client::ObjectClient;
    use crate::offsets::OFFSET_INVALID;
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    /// Directory-backed stand-in for object storage: objects are files under
    /// `<root>/<bucket>/<object>`, metadata lives in an in-memory map.
    struct DirObjectClient {
        root: std::path::PathBuf,
        metadata: Mutex<HashMap<String, HashMap<String, String>>>,
    }

    impl DirObjectClient {
        fn new(root: impl Into<std::path::PathBuf>) -> Self {
            DirObjectClient {
                root: root.into(),
                metadata: Mutex::new(HashMap::new()),
            }
        }

        fn put_object(
            &self,
            bucket: &str,
            object: &str,
            contents: &[u8],
            metadata: HashMap<String, String>,
        ) {
            let path = self.root.join(bucket).join(object);
            std::fs::create_dir_all(path.parent().unwrap()).unwrap();
            std::fs::write(path, contents).unwrap();
            self.metadata
                .lock()
                .unwrap()
                .insert(format!("{bucket}/{object}"), metadata);
        }
    }

    impl ObjectClient for Arc<DirObjectClient> {
        fn download(
            &self,
            bucket: &str,
            object: &str,
            dest: &std::path::Path,
        ) -> Result<HashMap<String, String>, Error> {
            let path = self.root.join(bucket).join(object);
            if !path.exists() {
                return Err(Error::Invalid(format!("no such object: {bucket}/{object}")));
            }
            std::fs::copy(&path, dest)?;
            Ok(self
                .metadata
                .lock()
                .unwrap()
                .get(&format!("{bucket}/{object}"))
                .cloned()
                .unwrap_or_default())
        }
    }

    #[derive(Default)]
    struct Recording {
        records: Vec<(i64, Option<Vec<u8>>, Option<Vec<u8>>)>,
        progresses: Vec<BatchProgress>,
    }

    /// Records deliveries, and commits the offset pair the way a real
    /// service would: joined to the batch, then written atomically.
    struct CommittingProcessor {
        store: Arc<rocks::StoreManager>,
        tracker: Arc<OffsetTracker>,
        offset_key: String,
        recording: Arc<Mutex<Recording>>,
    }

    impl RecordProcessor for CommittingProcessor {
        fn process_one(&mut self, record: LogRecord<'_>, _batch: &mut WriteBatch) {
            self.recording.lock().unwrap().records.push((
                record.offset,
                record.key.map(<[u8]>::to_vec),
                record.value.map(<[u8]>::to_vec),
            ));
        }

        fn finish_batch(&mut self, mut batch: WriteBatch, progress: BatchProgress) {
            self.recording.lock().unwrap().progresses.push(progress);
            self.tracker
                .commit_pair(
                    &self.offset_key,
                    progress.next_offset,
                    progress.file_offset.unwrap(),
                    Some(&mut batch),
                )
                .unwrap();
            self.store.write(batch).unwrap();
        }
    }

    struct Fixture {
        _dir: tempfile::TempDir,
        store: Arc<rocks::StoreManager>,
        tracker: Arc<OffsetTracker>,
        client: Arc<DirObjectClient>,
        recording: Arc<Mutex<Recording>>,
        offset_key: String,
        config: ConsumerConfig,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = tempfile::TempDir::new().unwrap();
            let mut opts = rocks::rocksdb::Options::default();
            opts.create_if_missing(true);
            opts.create_missing_column_families(true);
            let names = vec![
                rocks::DEFAULT_COLUMN_FAMILY.to_string(),
                rocks::METADATA_COLUMN_FAMILY.to_string(),
            ];
            let db =
                rocks::rocksdb::DB::open_cf(&opts, dir.path().join("db"), names.iter()).unwrap();
            let store = Arc::new(rocks::StoreManager::new(
                db,
                dir.path().join("db"),
                names,
                BTreeMap::new(),
                false,
            ));
            let tracker = Arc::new(OffsetTracker::new(store.clone()));
            let offset_key = tracker.link("events", 1, "store");
            let client = Arc::new(DirObjectClient::new(dir.path().join("objects")));
            let config = ConsumerConfig {
                consumer_name: "ArchiveEvents".to_string(),
                topic: "events".to_string(),
                partition: 1,
                group_id: "events-replay".to_string(),
                offset_key_suffix: "store".to_string(),
                consume_from_beginning_one_off: false,
                initial_offset_one_off: OFFSET_INVALID,
                object_store_bucket_name: "archive".to_string(),
                object_store_object_name_prefix: "raw/".to_string(),
                low_latency: false,
            };
            Fixture {
                _dir: dir,
                store,
                tracker,
                client,
                recording: Arc::new(Mutex::new(Recording::default())),
                offset_key,
                config,
            }
        }

        fn write_archive_file(&self, file_offset: i64, records: usize) {
            let mut writer =
                apache_avro::Writer::new(LogFileRecord::schema(), Vec::new());
            for i in 0..records {
                let offset = file_offset + i as i64;
                writer
                    .append(
                        LogFileRecord {
                            timestamp: 1_462_295_107_000 + offset,
                            key: Some(format!("k{offset}").into_bytes()),
                            value: Some(format!("v{offset}").into_bytes()),
                        }
                        .into_value(),
                    )
                    .unwrap();
            }
            let contents = writer.into_inner().unwrap();
            let object = object_name("raw/", "events", 1, file_offset);
            let metadata =
                HashMap::from([("count".to_string(), records.to_string())]);
            self.client.put_object("archive", &object, &contents, metadata);
        }

        fn consumer(&self) -> ArchiveConsumer {
            ArchiveConsumer::new(
                &self.config,
                self.offset_key.clone(),
                self.tracker.clone(),
                Box::new(self.client.clone()),
                Box::new(CommittingProcessor {
                    store: self.store.clone(),
                    tracker: self.tracker.clone(),
                    offset_key: self.offset_key.clone(),
                    recording: self.recording.clone(),
                }),
            )
        }
    }

    #[test]
    fn object_names_are_zero_padded() {
        assert_eq!(
            object_name("raw/", "events", 1, 42),
            "raw/events/000001/00000000000000000042"
        );
    }

    #[test]
    fn replays_a_file_from_the_stored_offset() {
        let fixture = Fixture::new();
        fixture.write_archive_file(0, 5);
        fixture.tracker.commit_pair(&fixture.offset_key, 0, 0, None).unwrap();

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
        assert_eq!(consumer.process_batch(1000), 5);

        let recording = fixture.recording.lock().unwrap();
        let offsets: Vec<i64> = recording.records.iter().map(|(o, _, _)| *o).collect();
        assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        assert_eq!(recording.records[2].1, Some(b"k2".to_vec()));
        assert_eq!(recording.records[2].2, Some(b"v2".to_vec()));
        // The file was exhausted; progress points at the next file.
        assert_eq!(
            recording.progresses.as_slice(),
            &[BatchProgress {
                next_offset: 5,
                file_offset: Some(5),
            }]
        );
    }

    #[test]
    fn skips_to_an_initial_offset_inside_the_file() {
        let fixture = Fixture::new();
        fixture.write_archive_file(0, 5);
        fixture.tracker.commit_pair(&fixture.offset_key, 3, 0, None).unwrap();

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
        assert_eq!(consumer.process_batch(1000), 2);

        let recording = fixture.recording.lock().unwrap();
        let offsets: Vec<i64> = recording.records.iter().map(|(o, _, _)| *o).collect();
        assert_eq!(offsets, vec![3, 4]);
    }

    #[test]
    fn chains_across_files_and_resumes_from_commits() {
        let fixture = Fixture::new();
        fixture.write_archive_file(0, 3);
        fixture.write_archive_file(3, 2);
        fixture.tracker.commit_pair(&fixture.offset_key, 0, 0, None).unwrap();

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
        // One batch per file: exhausting a file wraps up the batch.
        assert_eq!(consumer.process_batch(1000), 3);
        assert_eq!(consumer.process_batch(1000), 2);

        {
            let recording = fixture.recording.lock().unwrap();
            let offsets: Vec<i64> = recording.records.iter().map(|(o, _, _)| *o).collect();
            assert_eq!(offsets, vec![0, 1, 2, 3, 4]);
        }
        assert_eq!(
            fixture.tracker.load_committed_pair(&fixture.offset_key),
            Some((5, 5))
        );

        // A fresh consumer picks up exactly where the commits left off once
        // the next file exists.
        fixture.write_archive_file(5, 1);
        let mut resumed = fixture.consumer();
        resumed.init(OFFSET_STORED);
        assert_eq!(resumed.process_batch(1000), 1);
        let recording = fixture.recording.lock().unwrap();
        assert_eq!(recording.records.last().unwrap().0, 5);
    }

    #[test]
    #[should_panic(expected = "past the end of file")]
    fn init_rejects_an_offset_beyond_the_file() {
        let fixture = Fixture::new();
        fixture.write_archive_file(0, 5);
        fixture.tracker.commit_pair(&fixture.offset_key, 10, 0, None).unwrap();

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
    }

    #[test]
    #[should_panic(expected = "requires a seeded pair")]
    fn init_requires_a_seeded_offset_pair() {
        let fixture = Fixture::new();
        fixture.write_archive_file(0, 5);

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
    }

    #[test]
    #[should_panic(expected = "failed to download or validate")]
    fn init_requires_the_initial_file_to_exist() {
        let fixture = Fixture::new();
        fixture.tracker.commit_pair(&fixture.offset_key, 0, 0, None).unwrap();

        let mut consumer = fixture.consumer();
        consumer.init(OFFSET_STORED);
    }
}
