mod bootstrap;
mod config;
mod flags;
mod logging;
mod metrics_server;

pub use bootstrap::{run, run_with_flags, Components, ConsumerFactory, ServiceConfig};
pub use config::{parse_cf_group_configs, CfGroupConfig};
pub use flags::Flags;
pub use logging::init_logging;
