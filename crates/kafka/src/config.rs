use std::collections::HashMap;

use serde::Deserialize;

use crate::offsets::OFFSET_INVALID;

/// One consumer instance, deserialized from the `kafka_consumer_configs`
/// JSON array. `consumer_name` selects the factory registered by the
/// service; the `_one_off` fields are gated by the version-timestamp check
/// during bootstrap.
#[derive(Debug, Clone, Deserialize)]
pub struct ConsumerConfig {
    pub consumer_name: String,
    pub topic: String,
    pub partition: i32,
    pub group_id: String,
    #[serde(default)]
    pub offset_key_suffix: String,
    #[serde(default)]
    pub consume_from_beginning_one_off: bool,
    #[serde(default = "invalid_offset")]
    pub initial_offset_one_off: i64,
    #[serde(default)]
    pub object_store_bucket_name: String,
    #[serde(default)]
    pub object_store_object_name_prefix: String,
    #[serde(default)]
    pub low_latency: bool,
}

fn invalid_offset() -> i64 {
    OFFSET_INVALID
}

impl ConsumerConfig {
    /// Archive consumers replay files from object storage instead of a live
    /// broker subscription.
    pub fn is_archive(&self) -> bool {
        !self.object_store_bucket_name.is_empty()
    }
}

/// One producer, deserialized from the values of the
/// `kafka_producer_configs` JSON object. The map key is the logical name
/// services use to look the producer up; `topic` is the full topic name,
/// which may carry an environment prefix or suffix.
#[derive(Debug, Clone, Deserialize)]
pub struct ProducerConfig {
    pub topic: String,
    #[serde(default)]
    pub partition: Option<i32>,
    #[serde(default)]
    pub low_latency: bool,
}

/// Parse `kafka_consumer_configs`. Configuration errors are fatal: a
/// service launched with a bad consumer config must not start consuming.
pub fn parse_consumer_configs(configs: &str) -> Vec<ConsumerConfig> {
    if configs.is_empty() {
        return Vec::new();
    }
    let parsed: Vec<ConsumerConfig> = serde_json::from_str(configs)
        .unwrap_or_else(|err| panic!("kafka_consumer_configs must be valid JSON: {err}"));
    for config in &parsed {
        assert!(!config.topic.is_empty(), "consumer config requires a topic");
        assert!(
            !config.group_id.is_empty(),
            "consumer config requires a group_id"
        );
        assert!(
            !(config.consume_from_beginning_one_off && config.initial_offset_one_off >= 0),
            "cannot define both consume_from_beginning_one_off and initial_offset_one_off"
        );
    }
    parsed
}

/// Parse `kafka_producer_configs` into logical name → config.
pub fn parse_producer_configs(configs: &str) -> HashMap<String, ProducerConfig> {
    if configs.is_empty() {
        return HashMap::new();
    }
    serde_json::from_str(configs)
        .unwrap_or_else(|err| panic!("kafka_producer_configs must be valid JSON: {err}"))
}
