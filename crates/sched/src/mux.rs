//! Fan-in of all change streams into one ordered queue.

use std::sync::Arc;

use berth_core::{ChangeEvent, ResourceKind};
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::{Action, Message};

struct Source {
    action: Action,
    resource: ResourceKind,
    rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Merges per-stream channels into a single bounded queue.
///
/// Each source gets its own bridge task, so a source's events keep their
/// order; events of different sources interleave freely. Sources buffer
/// without bound, nothing is dropped.
///
/// With the sync barrier on, schedule sources are held back until every
/// patch source has forwarded its first resync, or a fault if it fails
/// before it ever lists.
pub struct Multiplexer {
    queue_cap: usize,
    sync_barrier: bool,
    sources: Vec<Source>,
}

impl Multiplexer {
    pub fn new(queue_cap: usize) -> Self {
        Self { queue_cap: queue_cap.max(1), sync_barrier: true, sources: Vec::new() }
    }

    pub fn with_sync_barrier(mut self, on: bool) -> Self {
        self.sync_barrier = on;
        self
    }

    pub fn add_source(&mut self, action: Action, resource: ResourceKind, rx: mpsc::UnboundedReceiver<ChangeEvent>) {
        self.sources.push(Source { action, resource, rx });
    }

    pub fn len(&self) -> usize { self.sources.len() }
    pub fn is_empty(&self) -> bool { self.sources.is_empty() }

    /// Spawn the bridges and return the consumer end of the queue.
    pub fn start(self) -> (mpsc::Receiver<Message>, Vec<JoinHandle<()>>) {
        let (tx, rx) = mpsc::channel::<Message>(self.queue_cap);
        let pending = if self.sync_barrier {
            self.sources.iter().filter(|s| s.action == Action::Patch).count()
        } else {
            0
        };
        let (gate_tx, gate_rx) = watch::channel(pending);
        let gate_tx = Arc::new(gate_tx);
        info!(sources = self.sources.len(), pending_resyncs = pending, "multiplexer started");

        let mut handles = Vec::with_capacity(self.sources.len());
        for src in self.sources {
            let tx = tx.clone();
            let handle = match src.action {
                Action::Patch => {
                    let gate = (pending > 0).then(|| Arc::clone(&gate_tx));
                    tokio::spawn(bridge_patch(src, tx, gate))
                }
                Action::Schedule => tokio::spawn(bridge_schedule(src, tx, gate_rx.clone())),
            };
            handles.push(handle);
        }
        (rx, handles)
    }
}

async fn bridge_patch(mut src: Source, tx: mpsc::Sender<Message>, mut gate: Option<Arc<watch::Sender<usize>>>) {
    while let Some(event) = src.rx.recv().await {
        let resync = matches!(event, ChangeEvent::Resync(_));
        let fault = match &event {
            ChangeEvent::Fault(reason) => Some(reason.clone()),
            _ => None,
        };
        if tx.send(Message { action: src.action, resource: src.resource, event }).await.is_err() {
            break;
        }
        if gate.is_none() {
            continue;
        }
        if resync {
            // Queue is FIFO: once forwarded, this resync is applied before anything sent after it.
            if let Some(gate) = gate.take() {
                gate.send_modify(|n| *n = n.saturating_sub(1));
                debug!(resource = %src.resource, remaining = *gate.borrow(), "initial resync forwarded");
            }
        } else if let Some(reason) = fault {
            // A stream that cannot list must not hold scheduling back forever.
            if let Some(gate) = gate.take() {
                gate.send_modify(|n| *n = n.saturating_sub(1));
                warn!(
                    resource = %src.resource,
                    %reason,
                    remaining = *gate.borrow(),
                    "stream failed before its initial resync; releasing it from the sync barrier"
                );
            }
        }
    }
    debug!(resource = %src.resource, "patch bridge closed");
}

async fn bridge_schedule(mut src: Source, tx: mpsc::Sender<Message>, mut gate: watch::Receiver<usize>) {
    // Err means every patch bridge is gone; nothing left to wait for.
    if gate.wait_for(|n| *n == 0).await.is_ok() {
        debug!(resource = %src.resource, "sync barrier released");
    }
    while let Some(event) = src.rx.recv().await {
        if tx.send(Message { action: src.action, resource: src.resource, event }).await.is_err() {
            break;
        }
    }
    debug!(resource = %src.resource, "schedule bridge closed");
}
