use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rocks::rocksdb::{IteratorMode, WriteBatch};
use rocks::StoreManager;

mod task;
pub use task::ScheduledTask;

/// Column family used for scheduled tasks unless the service configures its
/// own.
pub const COLUMN_FAMILY: &str = "scheduled-tasks";

/// Pause between drain cycles of the worker.
const CHECK_INTERVAL: Duration = Duration::from_millis(1000);
/// Cap on tasks copied out of the column family per scan.
const SCAN_BATCH: usize = 10_000;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as i64
}

/// Application hook for draining the queue.
pub trait TaskProcessor: Send + Sync {
    /// Process one batch of due tasks. Mark each fully-processed task
    /// completed; the queue deletes completed tasks atomically with whatever
    /// writes the processor added to `batch`. Tasks left incomplete stay in
    /// the queue and are retried on the next cycle.
    fn process_pending(&self, tasks: &mut [ScheduledTask], batch: &mut WriteBatch);

    /// Expand an opaque key/value pair into zero or more tasks, appending to
    /// `out`. `log_offset` carries the record's log position when the pair
    /// came off a consumer, `-1` otherwise. A negative return signals an
    /// error and is propagated to the scheduling caller.
    fn generate_tasks(
        &self,
        opaque_key: &[u8],
        opaque_value: &[u8],
        log_offset: i64,
        out: &mut Vec<ScheduledTask>,
    ) -> i64 {
        let _ = (opaque_key, opaque_value, log_offset, out);
        panic!("generate_tasks must be implemented to schedule opaque key/value pairs");
    }
}

/// A durable, time-ordered task queue persisted in one column family.
///
/// A single background worker scans due tasks once a second, hands them to
/// the processor in batches, and commits the processor's writes together
/// with the deletion of every completed task.
pub struct TaskQueue {
    store: Arc<StoreManager>,
    processor: Arc<dyn TaskProcessor>,
    cf_name: String,
    run: AtomicBool,
    outstanding: AtomicI64,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl TaskQueue {
    pub fn new(
        store: Arc<StoreManager>,
        processor: Arc<dyn TaskProcessor>,
        cf_name: impl Into<String>,
    ) -> Self {
        let cf_name = cf_name.into();
        store
            .cf(&cf_name)
            .unwrap_or_else(|_| panic!("scheduled-task column family missing: {cf_name}"));
        TaskQueue {
            store,
            processor,
            cf_name,
            run: AtomicBool::new(true),
            outstanding: AtomicI64::new(0),
            worker: Mutex::new(None),
        }
    }

    pub fn column_family(&self) -> &str {
        &self.cf_name
    }

    /// Start the background worker. Called once during bootstrap.
    pub fn start(self: &Arc<Self>) {
        let mut worker = self.worker.lock().unwrap();
        assert!(worker.is_none(), "task queue worker already started");

        self.outstanding
            .store(self.outstanding_accurate_slow() as i64, Ordering::SeqCst);

        let queue = Arc::clone(self);
        let handle = std::thread::Builder::new()
            .name("scheduled-tasks".to_string())
            .spawn(move || {
                while queue.run.load(Ordering::SeqCst) {
                    // Scan through the next millisecond so tasks stamped with
                    // the current instant are picked up in this cycle.
                    let max_ts = now_ms() + 1;
                    while queue.batch_process(max_ts) == SCAN_BATCH {}
                    std::thread::sleep(CHECK_INTERVAL);
                }
            })
            .expect("spawning the scheduled-task worker");
        *worker = Some(handle);
        tracing::info!("scheduled task worker started");
    }

    /// Clear the run flag; the in-progress cycle finishes normally.
    pub fn stop(&self) {
        self.run.store(false, Ordering::SeqCst);
    }

    /// Stop the worker and wait for it to exit.
    pub fn destroy(&self) {
        self.stop();
        let handle = self
            .worker
            .lock()
            .unwrap()
            .take()
            .expect("task queue worker was never started");
        handle.join().expect("scheduled task worker panicked");
        tracing::info!("scheduled task worker stopped");
    }

    /// Process one batch of tasks due before `max_ts`. Returns how many were
    /// scanned; a full batch means more may be pending.
    pub fn batch_process(&self, max_ts: i64) -> usize {
        let mut tasks = Vec::new();
        let count = self.scan_pending(max_ts, SCAN_BATCH, Some(&mut tasks));
        if count == 0 {
            return 0;
        }
        tracing::debug!(count, "found pending tasks");

        let mut batch = WriteBatch::default();
        self.processor.process_pending(&mut tasks, &mut batch);

        let cf = self.cf();
        let mut completed = 0usize;
        for task in &tasks {
            if task.completed() {
                completed += 1;
                batch.delete_cf(cf, task.key());
            }
        }
        // Nothing to recover from here: losing this write would replay the
        // processor's side effects with no record they already happened.
        self.store.write(batch).unwrap_or_else(|err| {
            panic!("failed to persist results of scheduled task processing: {err}")
        });

        self.outstanding
            .fetch_sub(completed as i64, Ordering::SeqCst);
        metrics::counter!("taskqueue_tasks_completed").increment(completed as u64);
        if completed < tasks.len() {
            tracing::warn!(
                incomplete = tasks.len() - completed,
                total = tasks.len(),
                "pending tasks not completed; they will be retried next cycle"
            );
        } else {
            tracing::debug!(completed, "completed pending tasks");
        }
        count
    }

    /// Count tasks scheduled up to `max_ts`, optionally copying up to
    /// `limit` of them into `tasks`. `limit` of zero means unlimited.
    /// Tasks are not removed.
    pub fn scan_pending(
        &self,
        max_ts: i64,
        limit: usize,
        mut tasks: Option<&mut Vec<ScheduledTask>>,
    ) -> usize {
        let cf = self.cf();
        let mut count = 0usize;
        for entry in self.store.db().iterator_cf(cf, IteratorMode::Start) {
            if limit != 0 && count >= limit {
                break;
            }
            let (key, value) =
                entry.unwrap_or_else(|err| panic!("scanning scheduled tasks failed: {err}"));
            let (scheduled_ms, data_key) = ScheduledTask::split_key(&key);
            if scheduled_ms > max_ts {
                break;
            }
            count += 1;
            if let Some(tasks) = tasks.as_mut() {
                tasks.push(ScheduledTask::new(scheduled_ms, data_key, &value[..]));
            }
        }
        count
    }

    /// Add `task` to a caller-owned batch. The caller commits; until it
    /// does, the outstanding count over-reports, which is fine because a
    /// process that fails to commit is expected to exit.
    pub fn schedule_with_batch(&self, task: &ScheduledTask, batch: &mut WriteBatch) {
        batch.put_cf(self.cf(), task.key(), task.value());
        self.outstanding.fetch_add(1, Ordering::SeqCst);
    }

    pub fn schedule_all_with_batch(&self, tasks: &[ScheduledTask], batch: &mut WriteBatch) {
        for task in tasks {
            self.schedule_with_batch(task, batch);
        }
    }

    /// Schedule a single task with its own committed write.
    pub fn schedule(&self, task: &ScheduledTask) -> Result<(), rocks::Error> {
        let mut batch = WriteBatch::default();
        self.schedule_with_batch(task, &mut batch);
        self.store.write(batch).map_err(|err| {
            tracing::error!(%err, "failed to schedule a single task");
            err
        })
    }

    /// Expand an opaque key/value pair through the processor and add the
    /// generated tasks to `batch`. Returns the generator's count; negative
    /// means the generator failed. Generated tasks with conflicting keys
    /// overwrite each other, which is the caller's concern.
    pub fn schedule_opaque_with_batch(
        &self,
        opaque_key: &[u8],
        opaque_value: &[u8],
        log_offset: i64,
        batch: &mut WriteBatch,
    ) -> i64 {
        let mut tasks = Vec::new();
        let generated =
            self.processor
                .generate_tasks(opaque_key, opaque_value, log_offset, &mut tasks);
        if generated > 0 {
            tracing::debug!(generated, "tasks generated from opaque pair");
            self.schedule_all_with_batch(&tasks, batch);
        }
        generated
    }

    /// As [`Self::schedule_opaque_with_batch`], but committed immediately.
    pub fn schedule_opaque(
        &self,
        opaque_key: &[u8],
        opaque_value: &[u8],
        log_offset: i64,
    ) -> Result<i64, rocks::Error> {
        let mut batch = WriteBatch::default();
        let generated = self.schedule_opaque_with_batch(opaque_key, opaque_value, log_offset, &mut batch);
        if generated <= 0 {
            return Ok(generated);
        }
        self.store.write(batch)?;
        Ok(generated)
    }

    /// Tasks believed outstanding. May over-report after failed commits;
    /// use [`Self::outstanding_accurate_slow`] when it matters.
    pub fn outstanding(&self) -> i64 {
        self.outstanding.load(Ordering::SeqCst)
    }

    /// Full scan of the queue column family. Can be slow with many tasks
    /// pending.
    pub fn outstanding_accurate_slow(&self) -> usize {
        self.scan_pending(i64::MAX, 0, None)
    }

    fn cf(&self) -> &rocks::rocksdb::ColumnFamily {
        self.store
            .cf(&self.cf_name)
            .expect("column family validated at construction")
    }
}

/// Tune a column family for total-order scans of timestamp-prefixed keys:
/// a dedicated block cache plus a bloom filter to spare disk reads. No
/// prefix extractor, since drain scans need total ordering.
pub fn tune_column_family(options: &mut rocks::rocksdb::Options) {
    let mut table = rocks::rocksdb::BlockBasedOptions::default();
    table.set_block_cache(&rocks::rocksdb::Cache::new_lru_cache(32 * 1024 * 1024));
    table.set_bloom_filter(10.0, false);
    options.set_block_based_table_factory(&table);
}
