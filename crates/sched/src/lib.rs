//! Berth scheduling pipeline.
//!
//! Change streams feed a [`Multiplexer`]; a single [`Dispatcher`] drains it,
//! patching the mirror for cluster state and handing unplaced pods to the
//! [`Engine`], which ranks nodes through a [`FitOracle`] and binds the pod.

#![forbid(unsafe_code)]

use std::sync::Arc;

use anyhow::{Context, Result};
use berth_core::{ChangeEvent, ResourceKind};
use berth_kubehub::{Binder, ChangeStream};
use berth_store::Mirror;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

pub mod dispatch;
pub mod engine;
pub mod mux;
pub mod oracle;

pub use dispatch::{DispatchError, Dispatcher, ResyncPolicy};
pub use engine::{Engine, Outcome, ScheduleError, Timings};
pub use mux::Multiplexer;
pub use oracle::{classify, FitDecision, FitOracle, FitPath, HttpOracle};

/// What the dispatcher does with a stream's events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Mirror the objects.
    Patch,
    /// Place the (unplaced) pods.
    Schedule,
}

/// One queued item: an event plus where it came from and what to do with it.
#[derive(Debug, Clone)]
pub struct Message {
    pub action: Action,
    pub resource: ResourceKind,
    pub event: ChangeEvent,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WatchSpec {
    pub action: Action,
    pub resource: ResourceKind,
    pub field_selector: &'static str,
}

/// Streams the scheduler runs. Pods are split by placement: unplaced ones are
/// scheduled, placed ones are mirrored. Finished pods are not watched at all.
pub fn default_watch_table() -> Vec<WatchSpec> {
    vec![
        WatchSpec {
            action: Action::Schedule,
            resource: ResourceKind::Pods,
            field_selector: "spec.nodeName=,status.phase!=Succeeded,status.phase!=Failed",
        },
        WatchSpec {
            action: Action::Patch,
            resource: ResourceKind::Pods,
            field_selector: "spec.nodeName!=,status.phase!=Succeeded,status.phase!=Failed",
        },
        WatchSpec { action: Action::Patch, resource: ResourceKind::Nodes, field_selector: "spec.unschedulable=false" },
        WatchSpec { action: Action::Patch, resource: ResourceKind::Services, field_selector: "" },
        WatchSpec { action: Action::Patch, resource: ResourceKind::ReplicationControllers, field_selector: "" },
    ]
}

#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    pub queue_cap: usize,
    pub resync: ResyncPolicy,
    pub sync_barrier: bool,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { queue_cap: 2048, resync: ResyncPolicy::default(), sync_barrier: true }
    }
}

/// Event source for one [`WatchSpec`].
pub struct Source {
    pub spec: WatchSpec,
    pub rx: mpsc::UnboundedReceiver<ChangeEvent>,
}

/// Create and start a change stream per spec. Any failure aborts: the
/// scheduler cannot run without seeing the cluster.
pub fn start_streams(client: kube::Client, table: &[WatchSpec]) -> Result<(Vec<Source>, Vec<JoinHandle<()>>)> {
    let mut sources = Vec::with_capacity(table.len());
    let mut handles = Vec::with_capacity(table.len());
    for spec in table {
        let (stream, rx) = ChangeStream::new(client.clone(), spec.resource.as_str(), spec.field_selector)
            .with_context(|| format!("starting {} stream for {}", action_name(spec.action), spec.resource))?;
        handles.push(stream.start());
        sources.push(Source { spec: spec.clone(), rx });
    }
    Ok((sources, handles))
}

fn action_name(action: Action) -> &'static str {
    match action {
        Action::Patch => "patch",
        Action::Schedule => "schedule",
    }
}

/// Owns the mirror and the decision engine for the process lifetime.
pub struct Scheduler {
    mirror: Mirror,
    engine: Engine,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(mirror: Mirror, oracle: Arc<dyn FitOracle>, binder: Arc<dyn Binder>, config: SchedulerConfig) -> Self {
        let engine = Engine::new(mirror.clone(), oracle, binder);
        Self { mirror, engine, config }
    }

    pub fn mirror(&self) -> &Mirror { &self.mirror }

    /// Initialize the mirror roots, then wire sources into the dispatcher.
    /// Returns the dispatcher task.
    pub async fn start(self, sources: Vec<Source>) -> Result<JoinHandle<()>> {
        self.mirror.init_roots().await.context("initializing mirror roots")?;
        let mut mux = Multiplexer::new(self.config.queue_cap).with_sync_barrier(self.config.sync_barrier);
        for src in sources {
            mux.add_source(src.spec.action, src.spec.resource, src.rx);
        }
        info!(sources = mux.len(), queue_cap = self.config.queue_cap, "scheduler starting");
        let (rx, _bridges) = mux.start();
        let dispatcher = Dispatcher::new(self.mirror, self.engine, self.config.resync);
        Ok(tokio::spawn(dispatcher.run(rx)))
    }
}
