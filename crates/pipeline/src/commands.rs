use std::fmt::Write as _;

use codec::RespValue;

use crate::handler::{Command, CommandTable, HandlerContext};

/// Administrative commands every pipeline service speaks. Services may
/// shadow any of these by registering the same name.
pub(crate) fn install_builtins(table: &mut CommandTable) {
    table.register("compact", Command::sync(compact, 0, 3));
    table.register("freeze", Command::sync(freeze, 0, 0));
    table.register("getmeta", Command::sync(get_meta, 1, 1));
    table.register("info", Command::sync(info, 0, 1));
    table.register("monitor", Command::sync(monitor, 0, 0));
    table.register("ping", Command::sync(ping, 0, 0));
    table.register("ready", Command::sync(ready, 0, 0));
    table.register("select", Command::sync(select, 1, 1));
    table.register("setmeta", Command::sync(set_meta, 2, 2));
    table.register("setready", Command::sync(set_ready, 0, 0));
    table.register("sleep", Command::sync(sleep, 1, 1));
    table.register("thaw", Command::sync(thaw, 0, 0));
}

fn internal_server_error() -> RespValue {
    RespValue::Error("Internal server error".to_string())
}

fn ping(_cmd: &[Vec<u8>], _ctx: &HandlerContext) -> RespValue {
    RespValue::Simple("PONG".to_string())
}

// Databases are not modeled; accepting SELECT keeps standard clients happy.
fn select(_cmd: &[Vec<u8>], _ctx: &HandlerContext) -> RespValue {
    RespValue::ok()
}

fn monitor(_cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    if !ctx
        .shared
        .register_monitor(ctx.conn_id, ctx.reply_sender())
    {
        tracing::warn!(peer = %ctx.peer, "is already monitoring");
    }
    RespValue::ok()
}

fn get_meta(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx.shared.store.get_metadata(&cmd[1]) {
        Ok(Some(value)) => RespValue::Bulk(value),
        Ok(None) => RespValue::NullBulk,
        Err(err) => RespValue::Error(format!("RocksDB error: {err}")),
    }
}

fn set_meta(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx.shared.store.put_metadata(&cmd[1], &cmd[2]) {
        Ok(()) => RespValue::ok(),
        Err(err) => RespValue::Error(format!("RocksDB error: {err}")),
    }
}

fn freeze(_cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx.shared.store.freeze() {
        Ok(files) => RespValue::BulkArray(files.into_iter().map(String::into_bytes).collect()),
        Err(err) => {
            tracing::error!(%err, "freeze failed");
            internal_server_error()
        }
    }
}

fn thaw(_cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    match ctx.shared.store.thaw() {
        Ok(()) => RespValue::ok(),
        Err(err) => {
            tracing::error!(%err, "thaw failed");
            internal_server_error()
        }
    }
}

fn compact(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    let cf_name = match cmd.get(1) {
        Some(name) => String::from_utf8_lossy(name).into_owned(),
        None => rocks::DEFAULT_COLUMN_FAMILY.to_string(),
    };
    if cmd.len() == 3 {
        return RespValue::Error("must specify begin and end keys".to_string());
    }
    let range = if cmd.len() == 4 {
        Some((cmd[2].clone(), cmd[3].clone()))
    } else {
        None
    };

    match ctx.shared.store.force_compact_detached(&cf_name, range) {
        // The compaction keeps running on its own thread.
        Ok(()) => RespValue::ok(),
        Err(rocks::Error::UnknownColumnFamily(name)) => {
            RespValue::Error(format!("Column family not found: {name}"))
        }
        Err(err) => RespValue::Error(format!("RocksDB error: {err}")),
    }
}

fn sleep(cmd: &[Vec<u8>], _ctx: &HandlerContext) -> RespValue {
    let Some(ms) = std::str::from_utf8(&cmd[1])
        .ok()
        .and_then(|s| s.parse::<u64>().ok())
    else {
        return RespValue::Error("Value is not an integer or out of range".to_string());
    };
    // Debugging aid; intentionally occupies this handler thread.
    std::thread::sleep(std::time::Duration::from_millis(ms));
    RespValue::ok()
}

fn ready(_cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    if ctx.shared.is_ready() {
        RespValue::ok()
    } else {
        RespValue::Error("Not ready".to_string())
    }
}

fn set_ready(_cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    ctx.shared.set_ready(true);
    RespValue::ok()
}

fn info(cmd: &[Vec<u8>], ctx: &HandlerContext) -> RespValue {
    let report = if cmd.len() >= 2 && cmd[1] == b"dbstats" {
        engine_stats(ctx)
    } else {
        composite_report(ctx)
    };
    RespValue::Bulk(report.into_bytes())
}

/// Raw per-column-family engine statistics.
fn engine_stats(ctx: &HandlerContext) -> String {
    let store = &ctx.shared.store;
    let mut out = String::new();
    for cf_name in store.cf_names() {
        if let Ok(Some(stats)) = store.property(cf_name, "rocksdb.stats") {
            out.push_str(&stats);
        }
    }
    out
}

/// The composite operational report: server identity, client count, store
/// sizing, and consumer progress.
fn composite_report(ctx: &HandlerContext) -> String {
    let shared = &ctx.shared;
    let store = &shared.store;
    let mut out = String::new();

    writeln!(out, "# Server").unwrap();
    writeln!(
        out,
        "{}_version:{}",
        shared.service_name, shared.service_version
    )
    .unwrap();
    writeln!(out, "master_replica:{}", store.is_master_replica() as u8).unwrap();
    writeln!(out, "ready:{}", shared.is_ready() as u8).unwrap();
    writeln!(out).unwrap();

    writeln!(out, "# Clients").unwrap();
    writeln!(out, "connected_clients:{}", shared.connection_count()).unwrap();
    writeln!(out).unwrap();

    writeln!(out, "# RocksDB").unwrap();
    let live_size = store
        .property_int(rocks::DEFAULT_COLUMN_FAMILY, "rocksdb.estimate-live-data-size")
        .ok()
        .flatten()
        .unwrap_or(0);
    writeln!(out, "estimate_live_data_size:{live_size}").unwrap();
    writeln!(out, "estimate_live_data_size_human:{}M", live_size >> 20).unwrap();

    let mut used_memory = 0u64;
    for cf_name in store.cf_names() {
        let keys = store
            .property_int(cf_name, "rocksdb.estimate-num-keys")
            .ok()
            .flatten()
            .unwrap_or(0);
        writeln!(out, "{cf_name}_cf_estimate_num_keys:{keys}").unwrap();

        let readers = store
            .property_int(cf_name, "rocksdb.estimate-table-readers-mem")
            .ok()
            .flatten()
            .unwrap_or(0);
        let memtables = store
            .property_int(cf_name, "rocksdb.size-all-mem-tables")
            .ok()
            .flatten()
            .unwrap_or(0);
        writeln!(out, "{cf_name}_cf_table_reader_memory:{readers}").unwrap();
        writeln!(out, "{cf_name}_cf_memtable_size:{memtables}").unwrap();
        used_memory += readers + memtables;
    }
    writeln!(out, "used_memory:{used_memory}").unwrap();
    writeln!(out, "used_memory_human:{}M", used_memory >> 20).unwrap();

    if let Some(task_queue) = &shared.task_queue {
        writeln!(out).unwrap();
        writeln!(out, "# ScheduledTasks").unwrap();
        writeln!(out, "outstanding_tasks:{}", task_queue.outstanding()).unwrap();
    }

    if let Some(tracker) = &shared.tracker {
        writeln!(out).unwrap();
        writeln!(out, "# Kafka").unwrap();
        tracker.append_info(&mut out);
    }

    out
}
