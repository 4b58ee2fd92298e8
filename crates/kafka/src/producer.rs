use std::time::Duration;

use rdkafka::client::ClientContext;
use rdkafka::config::ClientConfig;
use rdkafka::error::KafkaError;
use rdkafka::message::Message as _;
use rdkafka::producer::{BaseProducer, BaseRecord, DeliveryResult, Producer as _, ProducerContext};
use rdkafka::types::RDKafkaErrorCode;

use crate::ProducerConfig;

/// Reports failed deliveries; successes stay quiet.
struct DeliveryLogger;

impl ClientContext for DeliveryLogger {
    fn error(&self, error: KafkaError, reason: &str) {
        tracing::error!(%error, reason, "kafka client error");
    }
}

impl ProducerContext for DeliveryLogger {
    type DeliveryOpaque = ();

    fn delivery(&self, result: &DeliveryResult<'_>, _: ()) {
        if let Err((err, message)) = result {
            tracing::error!(
                %err,
                topic = message.topic(),
                partition = message.partition(),
                "kafka message delivery failed"
            );
        }
    }
}

/// Buffered producer for one topic.
///
/// The underlying client is asynchronous by design: messages accumulate in
/// its send queue and ship to brokers in batches, which favors throughput
/// but means unacknowledged messages are lost if the process dies. Callers
/// that need the queue drained use [`Producer::destroy`].
pub struct Producer {
    topic: String,
    partition: Option<i32>,
    inner: BaseProducer<DeliveryLogger>,
}

impl Producer {
    /// Create and verify a producer. Any configuration failure panics: this
    /// runs on the bootstrap path where a producer that cannot start must
    /// stop the service.
    pub fn new(broker_list: &str, config: &ProducerConfig) -> Self {
        let mut client_config = ClientConfig::new();
        client_config
            .set("metadata.broker.list", broker_list)
            .set("log.connection.close", "false")
            .set("compression.codec", "snappy")
            // Messages count as delivered only once every in-sync replica
            // has them.
            .set("request.required.acks", "-1");
        if config.low_latency {
            client_config.set("queue.buffering.max.ms", "1");
        }

        let inner: BaseProducer<DeliveryLogger> = client_config
            .create_with_context(DeliveryLogger)
            .unwrap_or_else(|err| panic!("failed to create kafka producer: {err}"));

        let metadata = inner
            .client()
            .fetch_metadata(Some(&config.topic), Duration::from_secs(10))
            .unwrap_or_else(|err| panic!("getting topic metadata failed: {err}"));
        assert!(
            metadata
                .topics()
                .iter()
                .any(|topic| topic.name() == config.topic),
            "producer topic does not exist: {}",
            config.topic
        );
        tracing::info!(topic = %config.topic, "kafka producer initialized");

        Producer {
            topic: config.topic.clone(),
            partition: config.partition,
            inner,
        }
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Enqueue one message. `partition` overrides the configured partition;
    /// with neither, the client's partitioner decides.
    pub fn send(
        &self,
        payload: &[u8],
        key: Option<&[u8]>,
        partition: Option<i32>,
    ) -> Result<(), KafkaError> {
        let mut record: BaseRecord<'_, [u8], [u8]> =
            BaseRecord::to(&self.topic).payload(payload);
        if let Some(key) = key {
            record = record.key(key);
        }
        if let Some(partition) = partition.or(self.partition) {
            record = record.partition(partition);
        }
        self.inner.send(record).map_err(|(err, _)| err)?;
        // Serve delivery callbacks opportunistically.
        self.inner.poll(Duration::ZERO);
        Ok(())
    }

    /// Enqueue one message, waiting out a full send queue and panicking on
    /// any other failure. Losing a record here would silently drop data the
    /// rest of the pipeline believes was published.
    pub fn send_fatal_on_error(&self, payload: &[u8], partition: Option<i32>) {
        loop {
            match self.send(payload, None, partition) {
                Ok(()) => return,
                Err(KafkaError::MessageProduction(RDKafkaErrorCode::QueueFull)) => {
                    tracing::warn!(
                        topic = %self.topic,
                        "producing kafka messages too fast; throttling for one second"
                    );
                    self.inner.poll(Duration::from_secs(1));
                }
                Err(err) => panic!("error producing kafka message: {err}"),
            }
        }
    }

    /// Wait for every outstanding message to be acknowledged by brokers.
    pub fn destroy(&self) {
        if let Err(err) = self.inner.flush(Duration::from_secs(10)) {
            tracing::warn!(%err, topic = %self.topic, "flushing kafka producer failed");
        }
        tracing::info!(topic = %self.topic, "kafka producer send queue drained");
    }
}
