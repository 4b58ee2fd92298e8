use std::collections::HashMap;
use std::sync::Arc;

use codec::{Frame, RespValue};
use rocks::rocksdb::WriteBatch;
use tokio::sync::mpsc;

use crate::{commands, PipelineShared};

pub type SyncFn = dyn Fn(&[Vec<u8>], &HandlerContext) -> RespValue + Send + Sync;
pub type AsyncFn = dyn Fn(i64, &[Vec<u8>], &HandlerContext) -> RespValue + Send + Sync;
pub type TransactionalFn =
    dyn Fn(&[Vec<u8>], &mut WriteBatch, &HandlerContext) -> RespValue + Send + Sync;

/// The three handler flavors, distinguished by how their result reaches the
/// client.
///
/// Sync handlers return the reply directly. Async handlers return
/// [`RespValue::Pending`] and later resolve their sequence key through the
/// connection's reply channel; they must not block the connection task.
/// Transactional handlers stage writes into a batch that commits atomically,
/// either per command or at `EXEC`.
#[derive(Clone)]
pub enum CommandKind {
    Sync(Arc<SyncFn>),
    Async(Arc<AsyncFn>),
    Transactional(Arc<TransactionalFn>),
}

/// A command table entry: the handler plus its argument bounds. Argument
/// counts exclude the command name; `-1` disables a bound.
#[derive(Clone)]
pub struct Command {
    pub kind: CommandKind,
    pub min_args: i32,
    pub max_args: i32,
}

impl Command {
    pub fn sync<F>(handler: F, min_args: i32, max_args: i32) -> Command
    where
        F: Fn(&[Vec<u8>], &HandlerContext) -> RespValue + Send + Sync + 'static,
    {
        Command {
            kind: CommandKind::Sync(Arc::new(handler)),
            min_args,
            max_args,
        }
    }

    pub fn async_fn<F>(handler: F, min_args: i32, max_args: i32) -> Command
    where
        F: Fn(i64, &[Vec<u8>], &HandlerContext) -> RespValue + Send + Sync + 'static,
    {
        Command {
            kind: CommandKind::Async(Arc::new(handler)),
            min_args,
            max_args,
        }
    }

    pub fn transactional<F>(handler: F, min_args: i32, max_args: i32) -> Command
    where
        F: Fn(&[Vec<u8>], &mut WriteBatch, &HandlerContext) -> RespValue + Send + Sync + 'static,
    {
        Command {
            kind: CommandKind::Transactional(Arc::new(handler)),
            min_args,
            max_args,
        }
    }
}

/// Lowercase command name → handler. Starts with the built-in
/// administrative commands; service registrations overwrite built-ins on a
/// name collision.
pub struct CommandTable {
    commands: HashMap<String, Command>,
}

impl CommandTable {
    pub fn new() -> Self {
        let mut table = CommandTable {
            commands: HashMap::new(),
        };
        commands::install_builtins(&mut table);
        table
    }

    pub fn register(&mut self, name: &str, command: Command) {
        self.commands.insert(name.to_lowercase(), command);
    }

    pub fn get(&self, name: &str) -> Option<&Command> {
        self.commands.get(name)
    }
}

impl Default for CommandTable {
    fn default() -> Self {
        Self::new()
    }
}

/// Everything a handler may touch: process-wide shared state, the peer's
/// address, and the connection's reply channel for async resolutions and
/// unsolicited frames.
pub struct HandlerContext {
    pub shared: Arc<PipelineShared>,
    pub peer: String,
    pub conn_id: u64,
    replies: mpsc::UnboundedSender<Frame>,
}

impl HandlerContext {
    pub fn new(
        shared: Arc<PipelineShared>,
        peer: String,
        conn_id: u64,
        replies: mpsc::UnboundedSender<Frame>,
    ) -> Self {
        HandlerContext {
            shared,
            peer,
            conn_id,
            replies,
        }
    }

    /// Queue the reply for `key`. The connection task releases it once all
    /// earlier replies are out.
    pub fn respond(&self, key: i64, value: RespValue) {
        // A closed channel means the connection is gone; the reply has
        // nowhere to go.
        let _ = self.replies.send(Frame::new(key, value));
    }

    /// Channel handle for async handlers to resolve from other tasks.
    pub fn reply_sender(&self) -> mpsc::UnboundedSender<Frame> {
        self.replies.clone()
    }

    pub fn error(&self, key: i64, message: impl Into<String>) {
        let message = message.into();
        tracing::error!(peer = %self.peer, "error sent to client: {message}");
        self.respond(key, RespValue::Error(message));
    }
}

/// Per-connection dispatcher: command lookup, argument validation, the
/// MULTI/EXEC transaction window, and monitor fan-out.
pub struct Dispatcher {
    table: Arc<CommandTable>,
    in_transaction: bool,
    error_seen: bool,
    queued: Vec<(Command, Vec<Vec<u8>>)>,
}

impl Dispatcher {
    pub fn new(table: Arc<CommandTable>) -> Self {
        Dispatcher {
            table,
            in_transaction: false,
            error_seen: false,
            queued: Vec::new(),
        }
    }

    /// Handle one decoded request. Every path resolves `key` exactly once,
    /// except async handlers which defer resolution to the reply channel.
    pub fn dispatch(&mut self, key: i64, request: RespValue, ctx: &HandlerContext) {
        // Decoder-reported protocol errors go straight back to the client.
        if request.is_error() {
            tracing::error!(peer = %ctx.peer, ?request, "invalid request");
            ctx.respond(key, request);
            return;
        }
        let RespValue::BulkArray(cmd) = request else {
            ctx.error(key, "Not a Redis Array of Bulk String");
            return;
        };
        let Some(name) = cmd.first() else {
            // The decoder rejects empty arrays; nothing else produces them.
            ctx.error(key, "Not a Redis Array of Bulk String");
            return;
        };
        let name = String::from_utf8_lossy(name).to_lowercase();

        metrics::counter!("pipeline_commands", "command" => name.clone()).increment(1);
        let known = match name.as_str() {
            "multi" => {
                self.handle_multi(key, ctx);
                true
            }
            "exec" => {
                self.handle_exec(key, ctx);
                true
            }
            _ => self.handle_command(key, &name, &cmd, ctx),
        };

        if known {
            ctx.shared.broadcast(&cmd, ctx.conn_id, &ctx.peer);
        } else {
            ctx.error(key, format!("Unknown command: '{name}'"));
        }
    }

    /// True when a MULTI window is open on this connection.
    pub fn in_transaction(&self) -> bool {
        self.in_transaction
    }

    fn handle_multi(&mut self, key: i64, ctx: &HandlerContext) {
        if self.in_transaction {
            // A nested MULTI is an error but does not cancel the window.
            ctx.error(key, "MULTI calls cannot be nested");
        } else {
            self.in_transaction = true;
            ctx.respond(key, RespValue::ok());
        }
    }

    fn handle_exec(&mut self, key: i64, ctx: &HandlerContext) {
        if !self.in_transaction {
            ctx.error(key, "EXEC without MULTI");
            return;
        }
        if self.error_seen {
            ctx.error(key, "Transaction discarded because of previous errors");
            self.reset_transaction();
            return;
        }

        let queued = std::mem::take(&mut self.queued);
        let mut batch = WriteBatch::default();
        let mut results = Vec::with_capacity(queued.len());
        let mut failed = false;
        for (command, cmd) in &queued {
            let result = match &command.kind {
                CommandKind::Sync(handler) => handler(cmd, ctx),
                CommandKind::Transactional(handler) => handler(cmd, &mut batch, ctx),
                CommandKind::Async(_) => unreachable!("async commands are rejected at queue time"),
            };
            if result.is_error() {
                failed = true;
                break;
            }
            results.push(result);
        }

        if failed {
            // Unlike standard Redis, a runtime error aborts the whole
            // transaction; nothing reaches the store.
            ctx.error(
                key,
                "Transaction discarded because an error was encountered during execution",
            );
        } else {
            match self.commit(batch, ctx) {
                Ok(()) => ctx.respond(key, RespValue::Array(results)),
                Err(message) => ctx.error(key, message),
            }
        }
        self.reset_transaction();
    }

    /// Returns false only for unknown commands.
    fn handle_command(
        &mut self,
        key: i64,
        name: &str,
        cmd: &[Vec<u8>],
        ctx: &HandlerContext,
    ) -> bool {
        let Some(command) = self.table.get(name) else {
            if self.in_transaction {
                self.error_seen = true;
            }
            return false;
        };
        let command = command.clone();

        if !validate_arg_count(cmd, command.min_args, command.max_args) {
            if self.in_transaction {
                self.error_seen = true;
            }
            ctx.error(key, format!("Wrong number of arguments for '{name}' command"));
            return true;
        }

        if self.in_transaction {
            if matches!(command.kind, CommandKind::Async(_)) {
                self.error_seen = true;
                ctx.error(key, format!("'{name}' cannot be used inside MULTI"));
            } else {
                self.queued.push((command, cmd.to_vec()));
                ctx.respond(key, RespValue::Simple("QUEUED".to_string()));
            }
            return true;
        }

        match &command.kind {
            CommandKind::Sync(handler) => {
                let result = handler(cmd, ctx);
                ctx.respond(key, result);
            }
            CommandKind::Async(handler) => {
                let result = handler(key, cmd, ctx);
                // Pending means the handler took ownership of the key and
                // will resolve it through the reply channel.
                if !result.is_pending() {
                    ctx.respond(key, result);
                }
            }
            CommandKind::Transactional(handler) => {
                let mut batch = WriteBatch::default();
                let result = handler(cmd, &mut batch, ctx);
                match self.commit(batch, ctx) {
                    Ok(()) => ctx.respond(key, result),
                    Err(message) => ctx.error(key, message),
                }
            }
        }
        true
    }

    fn commit(&self, batch: WriteBatch, ctx: &HandlerContext) -> Result<(), String> {
        if batch.is_empty() {
            return Ok(());
        }
        ctx.shared
            .store
            .write(batch)
            .map_err(|err| format!("RocksDB error: {err}"))
    }

    fn reset_transaction(&mut self) {
        self.in_transaction = false;
        self.error_seen = false;
        self.queued.clear();
    }
}

/// Bounds are inclusive; `-1` skips a bound. The command name itself is not
/// counted.
fn validate_arg_count(cmd: &[Vec<u8>], min_args: i32, max_args: i32) -> bool {
    let num_args = cmd.len() as i32 - 1;
    (min_args == -1 || num_args >= min_args) && (max_args == -1 || num_args <= max_args)
}
