//! A simple key-value store speaking the redis protocol, persisting data in
//! the default column family. The smallest useful pipeline service, and the
//! reference for wiring one up.

use codec::RespValue;
use pipeline::{Command, CommandTable, HandlerContext};

/// Register the service's commands over the built-ins.
pub fn register_commands(table: &mut CommandTable) {
    table.register("get", Command::sync(get, 1, 1));
    table.register("set", Command::sync(set, 2, 2));
}

fn get(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx.shared.store.get(rocks::DEFAULT_COLUMN_FAMILY, &cmd[1]) {
        Ok(Some(value)) => RespValue::Bulk(value),
        Ok(None) => RespValue::NullBulk,
        Err(err) => RespValue::Error(format!("RocksDB error: {err}")),
    }
}

fn set(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx
        .shared
        .store
        .put(rocks::DEFAULT_COLUMN_FAMILY, &cmd[1], &cmd[2])
    {
        Ok(()) => RespValue::ok(),
        Err(err) => RespValue::Error(format!("RocksDB error: {err}")),
    }
}
