mod archive;
mod config;
mod consumer;
mod live;
mod object_client;
mod offsets;
mod producer;
mod record;

pub use archive::ArchiveConsumer;
pub use config::{parse_consumer_configs, parse_producer_configs, ConsumerConfig, ProducerConfig};
pub use consumer::{
    BatchProgress, Consumer, ConsumerDriver, LogRecord, RecordProcessor, MAX_BATCH,
};
pub use live::LiveConsumer;
pub use object_client::{GcsClient, ObjectClient};
pub use offsets::{
    OffsetTracker, OFFSET_BEGINNING, OFFSET_END, OFFSET_INVALID, OFFSET_STORED,
};
pub use producer::Producer;
pub use record::LogFileRecord;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("store error: {0}")]
    Store(#[from] rocks::Error),
    #[error("kafka client error: {0}")]
    Kafka(#[from] rdkafka::error::KafkaError),
    #[error("object download error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("avro error: {0}")]
    Avro(#[from] apache_avro::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error("{0}")]
    Invalid(String),
}

pub(crate) fn now_ms() -> i64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as i64
}
