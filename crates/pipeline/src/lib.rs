mod commands;
mod handler;
mod ordering;
mod server;

pub use handler::{Command, CommandKind, CommandTable, Dispatcher, HandlerContext};
pub use ordering::OrderedReplies;
pub use server::{listen, serve};

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use codec::{Frame, RespValue};
use kafka::{OffsetTracker, Producer};
use rocks::StoreManager;
use taskqueue::TaskQueue;
use tokio::sync::mpsc;

pub fn now_ms() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock is before the epoch")
        .as_millis() as i64
}

struct MonitorPeer {
    conn_id: u64,
    sender: mpsc::UnboundedSender<Frame>,
}

/// State shared by every connection of one pipeline service: the store and
/// optional collaborators handlers reach through, the monitor registry, the
/// connection counter, and the readiness gate.
pub struct PipelineShared {
    pub store: Arc<StoreManager>,
    pub tracker: Option<Arc<OffsetTracker>>,
    pub task_queue: Option<Arc<TaskQueue>>,
    pub producers: HashMap<String, Arc<Producer>>,
    pub service_name: String,
    pub service_version: String,
    ready: AtomicBool,
    connections: AtomicUsize,
    next_conn_id: AtomicUsize,
    monitors: Mutex<Vec<MonitorPeer>>,
}

impl PipelineShared {
    pub fn new(
        service_name: impl Into<String>,
        service_version: impl Into<String>,
        store: Arc<StoreManager>,
    ) -> Self {
        PipelineShared {
            store,
            tracker: None,
            task_queue: None,
            producers: HashMap::new(),
            service_name: service_name.into(),
            service_version: service_version.into(),
            ready: AtomicBool::new(false),
            connections: AtomicUsize::new(0),
            next_conn_id: AtomicUsize::new(0),
            monitors: Mutex::new(Vec::new()),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::SeqCst)
    }

    pub fn set_ready(&self, ready: bool) {
        self.ready.store(ready, Ordering::SeqCst);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::SeqCst)
    }

    pub(crate) fn connection_opened(&self) -> u64 {
        self.connections.fetch_add(1, Ordering::SeqCst);
        self.next_conn_id.fetch_add(1, Ordering::SeqCst) as u64
    }

    pub(crate) fn connection_closed(&self) {
        self.connections.fetch_sub(1, Ordering::SeqCst);
    }

    /// Put a connection in monitor mode. Returns false when it already was.
    pub fn register_monitor(&self, conn_id: u64, sender: mpsc::UnboundedSender<Frame>) -> bool {
        let mut monitors = self.monitors.lock().unwrap();
        if monitors.iter().any(|peer| peer.conn_id == conn_id) {
            return false;
        }
        monitors.push(MonitorPeer { conn_id, sender });
        true
    }

    pub fn remove_monitor(&self, conn_id: u64) {
        let mut monitors = self.monitors.lock().unwrap();
        if let Some(index) = monitors.iter().position(|peer| peer.conn_id == conn_id) {
            monitors.swap_remove(index);
            tracing::info!(conn_id, "monitoring finished");
        }
    }

    /// Mirror a dispatched command to every monitoring connection except the
    /// one that issued it. The line is posted to each monitor's own reply
    /// channel; its connection task performs the write.
    pub fn broadcast(&self, cmd: &[Vec<u8>], source_conn_id: u64, source_peer: &str) {
        let monitors = self.monitors.lock().unwrap();
        if monitors.is_empty() {
            return;
        }

        // e.g. 1458363281.367954 [0 172.17.42.1:55983] "get" "abc"
        let now_us = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock is before the epoch")
            .as_micros() as i64;
        let mut line = format!(
            "{}.{:06} [0 {}]",
            now_us / 1_000_000,
            now_us % 1_000_000,
            source_peer
        );
        for arg in cmd {
            line.push_str(" \"");
            line.push_str(&backslashify(arg));
            line.push('"');
        }

        for peer in monitors.iter() {
            if peer.conn_id == source_conn_id {
                continue;
            }
            // A full or closed channel means the monitor is going away; its
            // connection task cleans up the registration.
            let _ = peer
                .sender
                .send(Frame::unsolicited(RespValue::Simple(line.clone())));
        }
    }
}

/// Escape quotes, backslashes and unprintable bytes so a command renders as
/// one monitor line.
fn backslashify(arg: &[u8]) -> String {
    let mut out = String::with_capacity(arg.len());
    for &b in arg {
        match b {
            b'"' => out.push_str("\\\""),
            b'\\' => out.push_str("\\\\"),
            b'\n' => out.push_str("\\n"),
            b'\r' => out.push_str("\\r"),
            b'\t' => out.push_str("\\t"),
            0x20..=0x7e => out.push(b as char),
            other => out.push_str(&format!("\\x{other:02x}")),
        }
    }
    out
}
