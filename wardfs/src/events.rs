use std::sync::atomic::{AtomicU64, Ordering};

use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::mpsc;
use tracing::debug;

use crate::fs::types::{now_millis, FileKind, LogicalPath, Principal, SensitivityLevel};

/// What happened to a node. Mutations emit exactly one event for the path
/// they were asked to operate on; bulk extraction emits one per entry
/// written.
#[derive(Debug, Clone, Serialize)]
pub enum FileEventKind {
    Created { kind: FileKind },
    Modified,
    Deleted,
    Moved { from: LogicalPath },
    Copied { from: LogicalPath },
    SensitivityChanged { level: Option<SensitivityLevel> },
}

#[derive(Debug, Clone, Serialize)]
pub struct FileEvent {
    pub kind: FileEventKind,
    pub path: LogicalPath,
    pub principal: Principal,
    pub timestamp: u64,
}

impl FileEvent {
    pub fn new(kind: FileEventKind, path: LogicalPath, principal: Principal) -> Self {
        FileEvent {
            kind,
            path,
            principal,
            timestamp: now_millis(),
        }
    }
}

/// Fire-and-forget fan-out of mutation events to in-process subscribers.
///
/// Emission never blocks and never fails the emitting operation; a
/// subscriber that went away is pruned on the next emit.
pub struct EventSink {
    next_id: AtomicU64,
    subscribers: DashMap<u64, mpsc::UnboundedSender<FileEvent>>,
}

impl EventSink {
    pub fn new() -> Self {
        EventSink {
            next_id: AtomicU64::new(0),
            subscribers: DashMap::new(),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<FileEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.subscribers.insert(id, tx);
        debug!(subscriber = id, "event subscriber attached");
        rx
    }

    /// Cheap guard so emitters can skip event assembly entirely.
    pub fn has_subscribers(&self) -> bool {
        !self.subscribers.is_empty()
    }

    pub fn emit(&self, event: FileEvent) {
        if self.subscribers.is_empty() {
            return;
        }
        self.subscribers.retain(|id, tx| {
            let delivered = tx.send(event.clone()).is_ok();
            if !delivered {
                debug!(subscriber = id, "dropping closed event subscriber");
            }
            delivered
        });
    }
}

impl Default for EventSink {
    fn default() -> Self {
        Self::new()
    }
}
