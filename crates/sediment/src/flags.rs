use clap::Parser;

/// Command-line flags shared by every pipeline service.
///
/// Flags ending in `_one_off` take effect at most once: they apply only
/// when `--version_timestamp_ms` names a moment that is still in the
/// future and newer than the version timestamp persisted in the store.
#[derive(Debug, Clone, Parser)]
#[command(about, version)]
pub struct Flags {
    /// Server port speaking the wire protocol.
    #[arg(long = "port", default_value_t = 9049, env = "PORT")]
    pub port: u16,

    /// Port of the embedded operational http server.
    #[arg(long = "metrics_port", default_value_t = 9090, env = "METRICS_PORT")]
    pub metrics_port: u16,

    /// RocksDB data path.
    #[arg(long = "rocksdb_db_path", default_value = "/dev/null")]
    pub rocksdb_db_path: String,

    /// Parallelism for flush and compaction; 0 means the core count.
    #[arg(long = "rocksdb_parallelism", default_value_t = 0)]
    pub rocksdb_parallelism: i32,

    /// RocksDB block cache size in MB.
    #[arg(long = "rocksdb_block_cache_size_mb", default_value_t = 512)]
    pub rocksdb_block_cache_size_mb: usize,

    /// Create the database when missing, without the one-off gate. Prefer
    /// the `_one_off` variant in production.
    #[arg(long = "rocksdb_create_if_missing")]
    pub rocksdb_create_if_missing: bool,

    /// Create the database when missing, gated by version_timestamp_ms.
    #[arg(long = "rocksdb_create_if_missing_one_off")]
    pub rocksdb_create_if_missing_one_off: bool,

    /// Column family groups for virtual sharding, e.g.
    /// {"node-index": {"start_shard_index": 1,
    ///                 "local_virtual_shard_count": 64,
    ///                 "shard_index_increment": 16}}
    #[arg(long = "rocksdb_cf_group_configs", default_value = "{}")]
    pub rocksdb_cf_group_configs: String,

    /// Same shape as rocksdb_cf_group_configs, naming the groups to drop.
    #[arg(long = "rocksdb_drop_cf_group_configs", default_value = "{}")]
    pub rocksdb_drop_cf_group_configs: String,

    /// Kafka broker list.
    #[arg(long = "kafka_broker_list", default_value = "localhost:9092")]
    pub kafka_broker_list: String,

    /// Kafka consumer configurations, a JSON array.
    #[arg(long = "kafka_consumer_configs", default_value = "")]
    pub kafka_consumer_configs: String,

    /// Kafka producer configurations, a JSON object keyed by logical name.
    #[arg(long = "kafka_producer_configs", default_value = "")]
    pub kafka_producer_configs: String,

    /// Whether this replica is the master replica. The framework itself
    /// only reports it; services and external tooling decide what it means.
    #[arg(long = "master_replica")]
    pub master_replica: bool,

    /// Version timestamp gating the one-off flags. -1 disables them all.
    #[arg(
        long = "version_timestamp_ms",
        default_value_t = -1,
        allow_negative_numbers = true
    )]
    pub version_timestamp_ms: i64,
}

impl Flags {
    /// Flush/compaction parallelism with the core-count default applied.
    pub fn parallelism(&self) -> i32 {
        if self.rocksdb_parallelism > 0 {
            return self.rocksdb_parallelism;
        }
        std::thread::available_parallelism()
            .map(|cores| cores.get() as i32)
            .unwrap_or(4)
    }
}
