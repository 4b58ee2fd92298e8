use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::consumer::{BaseConsumer, Consumer as _, ConsumerContext};
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::{Offset, TopicPartitionList};
use rocks::rocksdb::WriteBatch;

use crate::consumer::{BatchProgress, Consumer, LogRecord, RecordProcessor, MAX_BATCH};
use crate::offsets::{OffsetTracker, OFFSET_BEGINNING, OFFSET_END, OFFSET_INVALID, OFFSET_STORED};
use crate::{now_ms, ConsumerConfig};

/// Client context that feeds the periodic statistics blob into the offset
/// tracker, keeping high-watermark and lag estimates current.
struct StatsContext {
    tracker: Arc<OffsetTracker>,
    offset_key: String,
}

impl ClientContext for StatsContext {
    fn stats_raw(&self, statistics: &[u8]) {
        match std::str::from_utf8(statistics) {
            Ok(json) => self.tracker.update_stats(json, &self.offset_key),
            Err(err) => tracing::warn!(%err, "kafka statistics blob is not UTF-8"),
        }
    }

    fn error(&self, error: KafkaError, reason: &str) {
        tracing::error!(%error, reason, "kafka client error");
    }
}

impl ConsumerContext for StatsContext {}

/// Consumes one partition of one topic from a live broker subscription.
///
/// Offsets are never auto-committed to the broker; durable progress lives in
/// the offset tracker's storage, committed by the processor together with
/// the records' own writes.
pub struct LiveConsumer {
    broker_list: String,
    topic: String,
    partition: i32,
    group_id: String,
    low_latency: bool,
    offset_key: String,
    tracker: Arc<OffsetTracker>,
    processor: Box<dyn RecordProcessor>,
    consumer: Option<BaseConsumer<StatsContext>>,
    run: Arc<AtomicBool>,
    next_offset: i64,
}

impl LiveConsumer {
    pub fn new(
        broker_list: impl Into<String>,
        config: &ConsumerConfig,
        offset_key: impl Into<String>,
        tracker: Arc<OffsetTracker>,
        processor: Box<dyn RecordProcessor>,
    ) -> Self {
        LiveConsumer {
            broker_list: broker_list.into(),
            topic: config.topic.clone(),
            partition: config.partition,
            group_id: config.group_id.clone(),
            low_latency: config.low_latency,
            offset_key: offset_key.into(),
            tracker,
            processor,
            consumer: None,
            run: Arc::new(AtomicBool::new(true)),
            next_offset: OFFSET_INVALID,
        }
    }
}

impl Consumer for LiveConsumer {
    fn init(&mut self, initial_offset: i64) {
        assert!(self.consumer.is_none(), "consumer already initialized");
        assert!(!self.group_id.is_empty(), "consumer requires a group id");

        let mut initial_offset = initial_offset;
        if initial_offset == OFFSET_STORED {
            initial_offset = self.tracker.load_committed(&self.offset_key);
        }
        assert!(
            initial_offset != OFFSET_INVALID,
            "no valid initial offset for {}; seed one with consume_from_beginning_one_off \
             or initial_offset_one_off",
            self.offset_key
        );

        let context = StatsContext {
            tracker: self.tracker.clone(),
            offset_key: self.offset_key.clone(),
        };
        let mut config = ClientConfig::new();
        config
            // A client id unique to this topic/partition makes broker-side
            // logs attributable.
            .set(
                "client.id",
                format!("rust_client_{}_{}", self.topic, self.partition),
            )
            .set("group.id", &self.group_id)
            .set("metadata.broker.list", &self.broker_list)
            // Commits are explicit through the offset tracker.
            .set("enable.auto.commit", "false")
            .set("message.max.bytes", "1000000")
            .set("socket.keepalive.enable", "true")
            .set("log.connection.close", "false")
            .set("statistics.interval.ms", "5000")
            .set("api.version.request", "true")
            // Error out rather than silently rewind when the offset is out
            // of range.
            .set("auto.offset.reset", "error");
        if self.low_latency {
            config
                .set("fetch.error.backoff.ms", "5")
                .set("fetch.wait.max.ms", "5");
        }

        let consumer: BaseConsumer<StatsContext> = config
            .create_with_context(context)
            .unwrap_or_else(|err| panic!("kafka consumer initialization failed: {err}"));

        let metadata = consumer
            .fetch_metadata(Some(&self.topic), Duration::from_secs(10))
            .unwrap_or_else(|err| panic!("getting topic metadata failed: {err}"));
        let partition_exists = metadata.topics().iter().any(|topic| {
            topic.name() == self.topic
                && self.partition >= 0
                && (self.partition as usize) < topic.partitions().len()
        });
        assert!(
            partition_exists,
            "partition {} of topic {} does not exist",
            self.partition, self.topic
        );

        match initial_offset {
            OFFSET_BEGINNING => tracing::info!(
                topic = %self.topic, partition = self.partition, group = %self.group_id,
                "start consuming from the beginning"
            ),
            OFFSET_END => tracing::info!(
                topic = %self.topic, partition = self.partition, group = %self.group_id,
                "start consuming from the end"
            ),
            offset => tracing::info!(
                topic = %self.topic, partition = self.partition, group = %self.group_id,
                offset, "start consuming from offset"
            ),
        }

        let mut assignment = TopicPartitionList::new();
        assignment
            .add_partition_offset(&self.topic, self.partition, Offset::from_raw(initial_offset))
            .unwrap_or_else(|err| panic!("invalid initial offset assignment: {err}"));
        consumer
            .assign(&assignment)
            .unwrap_or_else(|err| panic!("assigning topic partition failed: {err}"));

        if initial_offset >= 0 {
            self.next_offset = initial_offset;
        }
        self.consumer = Some(consumer);
    }

    fn process_batch(&mut self, timeout_ms: u64) -> usize {
        let Self {
            consumer,
            processor,
            run,
            next_offset,
            topic,
            partition,
            ..
        } = self;
        let consumer = consumer.as_ref().expect("consumer has not been initialized");

        let mut batch = WriteBatch::default();
        let mut count = 0usize;
        let start = now_ms();
        let mut remaining = timeout_ms as i64;
        while run.load(Ordering::SeqCst) && count < MAX_BATCH && remaining > 0 {
            match consumer.poll(Duration::from_millis(remaining as u64)) {
                // Poll timeout; not an error.
                None => break,
                Some(Ok(message)) => {
                    processor.process_one(
                        LogRecord {
                            offset: message.offset(),
                            timestamp_ms: message.timestamp().to_millis(),
                            key: message.key(),
                            value: message.payload(),
                        },
                        &mut batch,
                    );
                    *next_offset = message.offset() + 1;
                    count += 1;
                }
                Some(Err(KafkaError::PartitionEOF(eof_partition))) => {
                    tracing::info!(
                        topic = %topic,
                        partition = eof_partition,
                        "no more messages for partition"
                    );
                    break;
                }
                Some(Err(err)) => {
                    // Recoverable: the outer loop resumes on the next batch.
                    tracing::error!(%err, topic = %topic, partition = *partition, "consume failed");
                    break;
                }
            }
            remaining = timeout_ms as i64 - (now_ms() - start);
        }

        if count > 0 {
            metrics::counter!("kafka_records_consumed").increment(count as u64);
            processor.finish_batch(
                batch,
                BatchProgress {
                    next_offset: *next_offset,
                    file_offset: None,
                },
            );
        }
        count
    }

    fn run_flag(&self) -> Arc<AtomicBool> {
        self.run.clone()
    }

    fn on_stop(&mut self) {
        // Dropping the client closes the subscription.
        self.consumer = None;
        tracing::info!(topic = %self.topic, partition = self.partition, "kafka consumer destroyed");
    }
}
