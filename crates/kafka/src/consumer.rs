use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;

use rocks::rocksdb::WriteBatch;

/// Cap on records handed to the processor per batch.
pub const MAX_BATCH: usize = 10_000;

/// One record delivered to a processor, whichever source it came from.
#[derive(Debug)]
pub struct LogRecord<'a> {
    pub offset: i64,
    pub timestamp_ms: Option<i64>,
    pub key: Option<&'a [u8]>,
    pub value: Option<&'a [u8]>,
}

/// Where a finished batch left off. `file_offset` is set by archive
/// consumers: the offset of the file containing `next_offset`, suitable for
/// [`crate::OffsetTracker::commit_pair`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchProgress {
    pub next_offset: i64,
    pub file_offset: Option<i64>,
}

/// Application hook for consumed records.
///
/// `process_one` receives every record of a batch along with a write batch
/// shared across that batch; `finish_batch` receives the same write batch
/// once the batch ends, and typically joins an offset commit to it before
/// writing the whole thing atomically.
pub trait RecordProcessor: Send {
    fn process_one(&mut self, record: LogRecord<'_>, batch: &mut WriteBatch);
    fn finish_batch(&mut self, batch: WriteBatch, progress: BatchProgress);
}

/// A partition consumer. `init` validates the source and seeks to the
/// initial offset, panicking on any verification failure: consuming from
/// the wrong position risks corrupting derived state, so refusing to start
/// is the only safe response. After `init`, `process_batch` is driven in a
/// loop by a [`ConsumerDriver`].
pub trait Consumer: Send {
    /// Seek to `initial_offset`, or to the committed offset when passed
    /// [`crate::OFFSET_STORED`].
    fn init(&mut self, initial_offset: i64);

    /// Consume up to [`MAX_BATCH`] records or until `timeout_ms` elapses,
    /// returning how many records were processed.
    fn process_batch(&mut self, timeout_ms: u64) -> usize;

    /// Flag checked between batches; shared with the driver.
    fn run_flag(&self) -> Arc<AtomicBool>;

    /// Release source resources once the worker loop has exited.
    fn on_stop(&mut self) {}
}

/// Owns the worker thread of one consumer.
pub struct ConsumerDriver {
    label: String,
    run: Arc<AtomicBool>,
    worker: Option<JoinHandle<()>>,
}

impl ConsumerDriver {
    /// Spawn the worker loop for an initialized consumer.
    pub fn start(label: impl Into<String>, mut consumer: Box<dyn Consumer>, timeout_ms: u64) -> Self {
        let label = label.into();
        let run = consumer.run_flag();
        let worker_run = Arc::clone(&run);
        let worker = std::thread::Builder::new()
            .name(label.clone())
            .spawn(move || {
                while worker_run.load(Ordering::SeqCst) {
                    consumer.process_batch(timeout_ms);
                }
                consumer.on_stop();
            })
            .expect("spawning a consumer worker");
        tracing::info!(consumer = %label, "consumer worker started");
        ConsumerDriver {
            label,
            run,
            worker: Some(worker),
        }
    }

    /// Signal the worker to exit after its current batch. Never blocks.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    /// Stop the worker and wait for it to release its resources.
    pub fn destroy(&mut self) {
        self.stop();
        let worker = self
            .worker
            .take()
            .expect("consumer worker already destroyed");
        worker.join().expect("consumer worker panicked");
        tracing::info!(consumer = %self.label, "consumer worker stopped");
    }
}
