use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use anyhow::Context as _;
use clap::Parser as _;
use kafka::{Consumer, ConsumerConfig, ConsumerDriver, OffsetTracker, Producer, OFFSET_BEGINNING,
    OFFSET_STORED};
use pipeline::{CommandTable, PipelineShared};
use rocks::rocksdb::{ColumnFamilyDescriptor, Options};
use rocks::StoreManager;
use taskqueue::{TaskProcessor, TaskQueue};
use tokio_util::sync::CancellationToken;

use crate::config::parse_cf_group_configs;
use crate::{metrics_server, Flags};

/// Metadata key recording the last version timestamp whose one-off flags
/// were applied.
const VERSION_TIMESTAMP_KEY: &[u8] = b"VersionTimestamp";

/// Poll timeout handed to consumer workers.
const CONSUMER_TIMEOUT_MS: u64 = 1000;

/// The optional collaborators built during bootstrap, handed to service
/// factories as they become available: producers exist before the task
/// queue, which exists before consumers.
pub struct Components {
    pub store: Arc<StoreManager>,
    pub tracker: Option<Arc<OffsetTracker>>,
    pub task_queue: Option<Arc<TaskQueue>>,
    pub producers: HashMap<String, Arc<Producer>>,
}

/// Builds one consumer from its parsed config. Receives the broker list,
/// the config entry, the linked offset key, and the components built so
/// far.
pub type ConsumerFactory =
    Box<dyn Fn(&str, &ConsumerConfig, String, &Components) -> Box<dyn Consumer>>;

/// What a service plugs into the framework.
pub struct ServiceConfig {
    pub name: &'static str,
    pub version: &'static str,
    /// Registers the service's command handlers over the built-ins.
    pub register_commands: Box<dyn FnOnce(&Components, &mut CommandTable)>,
    /// Column family (or group) name → tuning function, given the block
    /// cache size in MB. The default and metadata families fall back to
    /// point-lookup tuning when not listed.
    pub cf_configurators: HashMap<String, Box<dyn Fn(usize, &mut Options)>>,
    /// When set, the scheduled-task queue is created over its column family
    /// and started with this processor.
    pub task_processor: Option<Box<dyn FnOnce(&Components) -> Arc<dyn TaskProcessor>>>,
    /// Consumer name → factory, matched against `kafka_consumer_configs`.
    pub consumer_factories: HashMap<String, ConsumerFactory>,
}

impl ServiceConfig {
    pub fn new(name: &'static str, version: &'static str) -> Self {
        ServiceConfig {
            name,
            version,
            register_commands: Box::new(|_, _| {}),
            cf_configurators: HashMap::new(),
            task_processor: None,
            consumer_factories: HashMap::new(),
        }
    }
}

/// Parse flags from the command line and run the service to completion.
/// Returns once a shutdown signal has drained everything.
pub async fn run(service: ServiceConfig) -> anyhow::Result<()> {
    crate::init_logging();
    let flags = Flags::parse();
    run_with_flags(service, flags).await
}

pub async fn run_with_flags(mut service: ServiceConfig, flags: Flags) -> anyhow::Result<()> {
    tracing::info!(service = service.name, "initializing pipeline");

    // Open the store first; every optional component hangs off of it.
    let store = Arc::new(open_store(&service, &flags)?);

    let one_off_allowed = can_apply_one_off(flags.version_timestamp_ms, Some(&store));

    // Producers and the database manager may be used by everything further
    // down, so they come first.
    let mut producers = HashMap::new();
    for (name, producer_config) in kafka::parse_producer_configs(&flags.kafka_producer_configs) {
        producers.insert(
            name,
            Arc::new(Producer::new(&flags.kafka_broker_list, &producer_config)),
        );
    }

    let mut components = Components {
        store: store.clone(),
        tracker: None,
        task_queue: None,
        producers,
    };

    if let Some(factory) = service.task_processor.take() {
        let processor = factory(&components);
        components.task_queue = Some(Arc::new(TaskQueue::new(
            store.clone(),
            processor,
            taskqueue::COLUMN_FAMILY,
        )));
    }

    // Link consumer offsets, apply one-off seeds, and construct consumers.
    let consumer_configs = kafka::parse_consumer_configs(&flags.kafka_consumer_configs);
    let mut consumers: Vec<(String, Box<dyn Consumer>)> = Vec::new();
    if !consumer_configs.is_empty() {
        let tracker = Arc::new(OffsetTracker::new(store.clone()));
        components.tracker = Some(tracker.clone());

        for consumer_config in &consumer_configs {
            let factory = service
                .consumer_factories
                .get(&consumer_config.consumer_name)
                .unwrap_or_else(|| {
                    panic!(
                        "kafka consumer factory for {} is not defined",
                        consumer_config.consumer_name
                    )
                });
            let offset_key = tracker.link(
                &consumer_config.topic,
                consumer_config.partition,
                &consumer_config.offset_key_suffix,
            );

            if consumer_config.consume_from_beginning_one_off {
                if one_off_allowed {
                    tracing::warn!(
                        topic = %consumer_config.topic,
                        partition = consumer_config.partition,
                        "consuming from the beginning as a one-off operation"
                    );
                    if consumer_config.is_archive() {
                        tracker.commit_pair(&offset_key, 0, 0, None)?;
                    } else {
                        tracker.commit_raw(&offset_key, OFFSET_BEGINNING, None)?;
                    }
                } else {
                    tracing::warn!(
                        "cannot consume from the beginning unless a valid version_timestamp_ms \
                         is specified"
                    );
                }
            } else if consumer_config.initial_offset_one_off >= 0 {
                if one_off_allowed {
                    tracing::warn!(
                        topic = %consumer_config.topic,
                        partition = consumer_config.partition,
                        offset = consumer_config.initial_offset_one_off,
                        "consuming from a fixed offset as a one-off operation"
                    );
                    tracker.commit_raw(&offset_key, consumer_config.initial_offset_one_off, None)?;
                } else {
                    tracing::warn!(
                        "cannot consume from the specified offset unless a valid \
                         version_timestamp_ms is specified"
                    );
                }
            }

            tracing::info!(
                consumer = %consumer_config.consumer_name,
                topic = %consumer_config.topic,
                partition = consumer_config.partition,
                group = %consumer_config.group_id,
                "launching kafka consumer"
            );
            let consumer = factory(
                &flags.kafka_broker_list,
                consumer_config,
                offset_key,
                &components,
            );
            consumers.push((
                format!(
                    "{}-{}-{}",
                    consumer_config.consumer_name,
                    consumer_config.topic,
                    consumer_config.partition
                ),
                consumer,
            ));
        }
    }

    // Assemble the connection-facing state and command table.
    let mut shared = PipelineShared::new(service.name, service.version, store.clone());
    shared.tracker = components.tracker.clone();
    shared.task_queue = components.task_queue.clone();
    shared.producers = components.producers.clone();
    let shared = Arc::new(shared);

    let mut table = CommandTable::new();
    (service.register_commands)(&components, &mut table);
    let table = Arc::new(table);

    // Start optional components. All consumers are initialized before any
    // of them starts: init panics on verification failures, and panicking
    // before the first record moves keeps derived state untouched.
    if let Some(task_queue) = &components.task_queue {
        task_queue.start();
    }
    for (_, consumer) in consumers.iter_mut() {
        consumer.init(OFFSET_STORED);
    }
    let mut drivers: Vec<ConsumerDriver> = consumers
        .into_iter()
        .map(|(label, consumer)| ConsumerDriver::start(label, consumer, CONSUMER_TIMEOUT_MS))
        .collect();

    // Record that this version's one-off flags have been applied.
    if one_off_allowed {
        store
            .put_metadata(
                VERSION_TIMESTAMP_KEY,
                flags.version_timestamp_ms.to_string().as_bytes(),
            )
            .context("persisting version_timestamp_ms")?;
    }

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone());

    let metrics_listener =
        tokio::net::TcpListener::bind(("0.0.0.0", flags.metrics_port))
            .await
            .context("failed to bind the metrics port")?;
    let metrics_router = metrics_server::build_router(shared.clone());
    tokio::spawn(async move {
        if let Err(err) = axum::serve(metrics_listener, metrics_router).await {
            tracing::error!(%err, "embedded http server failed");
        }
    });

    let listener = tokio::net::TcpListener::bind(("0.0.0.0", flags.port))
        .await
        .context("failed to bind the server port")?;
    tracing::info!(port = flags.port, "launching server");
    pipeline::listen(listener, shared.clone(), table, shutdown.clone()).await;
    tracing::info!("pipeline server has shut down gracefully");

    // Tear down in reverse start order; the store goes last when everything
    // referencing it has dropped.
    for driver in drivers.iter_mut() {
        driver.destroy();
    }
    if let Some(task_queue) = &components.task_queue {
        task_queue.destroy();
    }
    for producer in components.producers.values() {
        producer.destroy();
    }
    tracing::info!("pipeline components stopped");
    Ok(())
}

fn spawn_signal_handler(shutdown: CancellationToken) {
    tokio::spawn(async move {
        let mut sigterm =
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("installing the SIGTERM handler");
        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result.expect("listening for SIGINT");
            }
            _ = sigterm.recv() => {}
        }
        tracing::info!("received shutdown signal; stopping");
        shutdown.cancel();
    });
}

/// Whether one-off flags may take effect: a version timestamp is supplied,
/// has not already passed, and is strictly newer than the persisted one.
fn can_apply_one_off(version_timestamp_ms: i64, store: Option<&StoreManager>) -> bool {
    if version_timestamp_ms < 0 {
        return false;
    }
    let now = pipeline::now_ms();
    if now > version_timestamp_ms {
        tracing::warn!(
            version_timestamp_ms,
            behind_ms = now - version_timestamp_ms,
            "specified version_timestamp_ms has already passed"
        );
        return false;
    }
    if let Some(store) = store {
        match store.get_metadata(VERSION_TIMESTAMP_KEY) {
            Ok(Some(value)) => {
                let stored = std::str::from_utf8(&value)
                    .ok()
                    .and_then(|value| value.parse::<i64>().ok())
                    .unwrap_or_else(|| {
                        panic!(
                            "persisted version timestamp is corrupt: {:?}",
                            String::from_utf8_lossy(&value)
                        )
                    });
                if stored >= version_timestamp_ms {
                    tracing::warn!(
                        stored,
                        version_timestamp_ms,
                        "specified version_timestamp_ms is older than the stored version"
                    );
                    return false;
                }
            }
            Ok(None) => {}
            Err(err) => panic!("failed to load the version timestamp: {err}"),
        }
    }
    true
}

/// Open the database per configuration: existing column families are opened
/// with their configured options, missing required ones are created, and
/// the drop set is dropped. Returns the assembled facade.
fn open_store(service: &ServiceConfig, flags: &Flags) -> anyhow::Result<StoreManager> {
    let db_path = Path::new(&flags.rocksdb_db_path);
    let cache_mb = flags.rocksdb_block_cache_size_mb;

    let mut options = Options::default();
    options.set_wal_recovery_mode(rocks::rocksdb::DBRecoveryMode::PointInTime);
    options.set_write_buffer_size(64 * 1024 * 1024);
    options.set_target_file_size_base(64 * 1024 * 1024);
    options.set_max_bytes_for_level_base(256 * 1024 * 1024);
    options.set_max_total_wal_size(1024 * 1024 * 1024);
    options.set_max_open_files(1500);
    options.increase_parallelism(flags.parallelism());
    options.optimize_level_style_compaction(512 * 1024 * 1024);

    let group_configs = parse_cf_group_configs(&flags.rocksdb_cf_group_configs);
    let drop_group_configs = parse_cf_group_configs(&flags.rocksdb_drop_cf_group_configs);

    // Required column families with their options, expanding groups into
    // their shards.
    let mut required: BTreeMap<String, Options> = BTreeMap::new();
    let mut drops: BTreeMap<String, Options> = BTreeMap::new();
    for (name, configurator) in &service.cf_configurators {
        let mut cf_options = options.clone();
        configurator(cache_mb, &mut cf_options);
        match group_configs.get(name) {
            Some(group) => {
                for shard in group.shard_names(name) {
                    required.insert(shard, cf_options.clone());
                }
            }
            None => {
                required.insert(name.clone(), cf_options.clone());
            }
        }
        // Families being dropped still need options to open the database.
        if let Some(group) = drop_group_configs.get(name) {
            for shard in group.shard_names(name) {
                assert!(
                    !required.contains_key(&shard),
                    "cannot drop required column family: {shard}"
                );
                drops.insert(shard, cf_options.clone());
            }
        }
    }

    if service.task_processor.is_some() && !required.contains_key(taskqueue::COLUMN_FAMILY) {
        let mut cf_options = options.clone();
        taskqueue::tune_column_family(&mut cf_options);
        required.insert(taskqueue::COLUMN_FAMILY.to_string(), cf_options);
    }
    if !required.contains_key(rocks::DEFAULT_COLUMN_FAMILY) {
        let mut cf_options = options.clone();
        cf_options.optimize_for_point_lookup(cache_mb as u64);
        required.insert(rocks::DEFAULT_COLUMN_FAMILY.to_string(), cf_options);
    }
    if !required.contains_key(rocks::METADATA_COLUMN_FAMILY) {
        let mut cf_options = options.clone();
        // The metadata family holds a handful of keys; 1MB of cache is
        // plenty.
        cf_options.optimize_for_point_lookup(1);
        required.insert(rocks::METADATA_COLUMN_FAMILY.to_string(), cf_options);
    }

    let db_exists = db_path.join("CURRENT").exists();
    if !db_exists {
        if flags.rocksdb_create_if_missing {
            tracing::warn!("setting RocksDB option create_if_missing");
            options.create_if_missing(true);
        } else if flags.rocksdb_create_if_missing_one_off {
            if can_apply_one_off(flags.version_timestamp_ms, None) {
                tracing::warn!("setting RocksDB option create_if_missing as a one-off operation");
                options.create_if_missing(true);
            } else {
                tracing::warn!(
                    "cannot apply create_if_missing unless a valid version_timestamp_ms \
                     is specified"
                );
            }
        }
    }

    let existing: Vec<String> = if db_exists {
        tracing::info!(path = %db_path.display(), "loading existing database");
        rocks::rocksdb::DB::list_cf(&options, db_path)
            .unwrap_or_else(|err| panic!("listing column families failed: {err}"))
    } else {
        tracing::info!(path = %db_path.display(), "creating initial database");
        vec![rocks::DEFAULT_COLUMN_FAMILY.to_string()]
    };

    let mut descriptors = Vec::new();
    for name in &existing {
        let cf_options = required
            .get(name)
            .or_else(|| drops.get(name))
            .unwrap_or_else(|| panic!("must define column family options for {name}"));
        descriptors.push(ColumnFamilyDescriptor::new(name, cf_options.clone()));
    }

    let mut db = rocks::rocksdb::DB::open_cf_descriptors(&options, db_path, descriptors)
        .unwrap_or_else(|err| panic!("RocksDB initialization failed: {err}"));

    for (name, cf_options) in &required {
        if !existing.contains(name) {
            db.create_cf(name, cf_options)
                .unwrap_or_else(|err| panic!("creating column family `{name}` failed: {err}"));
            tracing::info!(name, "created column family");
        }
    }

    for name in drops.keys() {
        if db.cf_handle(name).is_some() {
            tracing::info!(name, "dropping column family");
            db.drop_cf(name)
                .unwrap_or_else(|err| panic!("dropping column family `{name}` failed: {err}"));
        } else {
            tracing::error!(name, "column family to drop does not exist");
        }
    }

    let mut cf_groups: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (group, group_config) in &group_configs {
        let names = group_config.shard_names(group);
        for name in &names {
            assert!(
                required.contains_key(name),
                "column family not found for group {group}: {name}"
            );
        }
        cf_groups.insert(group.clone(), names);
    }

    let cf_names: Vec<String> = required.keys().cloned().collect();
    for name in &cf_names {
        tracing::info!(name, "loaded column family");
    }

    Ok(StoreManager::new(
        db,
        db_path,
        cf_names,
        cf_groups,
        flags.master_replica,
    ))
}
