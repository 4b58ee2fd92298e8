use std::collections::BTreeMap;

use serde::Deserialize;

/// A group of column families acting as virtual shards. The family names
/// are `<group>-<shard_index>` for each index the group covers.
#[derive(Debug, Clone, Deserialize)]
pub struct CfGroupConfig {
    pub start_shard_index: i32,
    pub local_virtual_shard_count: i32,
    pub shard_index_increment: i32,
}

impl CfGroupConfig {
    /// The column family names of this group, in shard order.
    pub fn shard_names(&self, group: &str) -> Vec<String> {
        (0..self.local_virtual_shard_count)
            .map(|i| {
                let shard_index = self.start_shard_index + i * self.shard_index_increment;
                format!("{group}-{shard_index}")
            })
            .collect()
    }
}

/// Parse a `rocksdb_cf_group_configs`-shaped JSON object. Bad configuration
/// is fatal.
pub fn parse_cf_group_configs(configs: &str) -> BTreeMap<String, CfGroupConfig> {
    serde_json::from_str(configs).unwrap_or_else(|err| {
        panic!("rocksdb column family group configurations must be valid JSON: {err}")
    })
}
