//! Sequential consumer of the multiplexed queue.

use berth_core::{doc, ChangeEvent, EventKind, ObjectError, ResourceKind};
use berth_store::{Mirror, MirrorError, MirrorPath, PatchOp};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::engine::{Engine, ScheduleError};
use crate::{Action, Message};

/// What a patch-stream resync does with mirror entries missing from the snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ResyncPolicy {
    /// Leave them in place.
    Keep,
    /// Remove them in the same transaction as the snapshot upserts.
    #[default]
    Prune,
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error("mirror: {0}")]
    Mirror(#[from] MirrorError),
    #[error(transparent)]
    Schedule(#[from] ScheduleError),
    #[error("change stream fault: {0}")]
    Fault(String),
}

/// Applies messages one at a time: nothing here runs concurrently, which makes
/// every mirror write and scheduling decision ordered with respect to the others.
pub struct Dispatcher {
    mirror: Mirror,
    engine: Engine,
    resync: ResyncPolicy,
}

impl Dispatcher {
    pub fn new(mirror: Mirror, engine: Engine, resync: ResyncPolicy) -> Self {
        Self { mirror, engine, resync }
    }

    /// Drain the queue until every producer is gone. Per-message failures are
    /// logged and never stop the loop.
    pub async fn run(self, mut rx: mpsc::Receiver<Message>) {
        info!(resync = ?self.resync, "dispatcher started");
        while let Some(msg) = rx.recv().await {
            let resource = msg.resource;
            let payload = msg.event.payload_type();
            if let Err(e) = self.handle(msg).await {
                counter!("dispatch_errors_total", 1u64, "resource" => resource.as_str());
                error!(resource = %resource, payload, error = %e, "error handling update");
            }
        }
        info!("dispatcher stopped");
    }

    pub async fn handle(&self, msg: Message) -> Result<(), DispatchError> {
        match msg.action {
            Action::Patch => self.patch(msg.resource, msg.event).await,
            Action::Schedule => self.schedule(msg.event).await,
        }
    }

    async fn schedule(&self, event: ChangeEvent) -> Result<(), DispatchError> {
        match event {
            ChangeEvent::Resync(items) => {
                let total = items.len();
                let mut first_err = None;
                for item in items {
                    if let Err(e) = self.engine.schedule_pod(item).await {
                        warn!(error = %e, "scheduling from resync failed");
                        first_err.get_or_insert(e);
                    }
                }
                debug!(total, "resync scheduled");
                first_err.map_or(Ok(()), |e| Err(e.into()))
            }
            ChangeEvent::Incremental { kind: EventKind::Added, doc } => {
                self.engine.schedule_pod(doc).await?;
                Ok(())
            }
            ChangeEvent::Incremental { kind, doc } => {
                debug!(?kind, pod = doc::display_name(&doc), "ignoring change to unplaced pod");
                Ok(())
            }
            ChangeEvent::Fault(reason) => Err(DispatchError::Fault(reason)),
        }
    }

    async fn patch(&self, kind: ResourceKind, event: ChangeEvent) -> Result<(), DispatchError> {
        match event {
            ChangeEvent::Resync(items) => self.patch_resync(kind, items).await,
            ChangeEvent::Incremental { kind: EventKind::Added | EventKind::Modified, doc } => {
                let path = MirrorPath::entry(kind, doc::uid(&doc)?);
                let mut txn = self.mirror.begin().await;
                txn.upsert(&path, doc)?;
                txn.commit();
                Ok(())
            }
            ChangeEvent::Incremental { kind: EventKind::Deleted, doc } => {
                let path = MirrorPath::entry(kind, doc::uid(&doc)?);
                let mut txn = self.mirror.begin().await;
                match txn.write(PatchOp::Remove, &path, None) {
                    Ok(()) => {
                        txn.commit();
                        Ok(())
                    }
                    Err(MirrorError::NotFound(_)) => {
                        debug!(path = %path, "delete for entry not in mirror");
                        Ok(())
                    }
                    Err(e) => Err(e.into()),
                }
            }
            ChangeEvent::Fault(reason) => Err(DispatchError::Fault(reason)),
        }
    }

    async fn patch_resync(&self, kind: ResourceKind, items: Vec<Value>) -> Result<(), DispatchError> {
        let total = items.len();
        let mut txn = self.mirror.begin().await;
        let mut live = FxHashSet::default();
        let mut first_err: Option<DispatchError> = None;
        for item in items {
            let uid = match doc::uid(&item) {
                Ok(uid) => uid.to_string(),
                Err(e) => {
                    warn!(resource = %kind, error = %e, "skipping resync item");
                    first_err.get_or_insert(e.into());
                    continue;
                }
            };
            txn.upsert(&MirrorPath::entry(kind, uid.clone()), item)?;
            live.insert(uid);
        }

        let mut pruned = 0usize;
        if self.resync == ResyncPolicy::Prune {
            let stale: Vec<String> = txn
                .documents()
                .collection(kind)
                .map(|coll| {
                    coll.keys()
                        .filter(|uid| !live.contains(uid.as_str()))
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            for uid in stale {
                txn.write(PatchOp::Remove, &MirrorPath::entry(kind, uid), None)?;
                pruned += 1;
            }
        }
        txn.commit();
        info!(resource = %kind, total, upserted = live.len(), pruned, "resync applied");
        first_err.map_or(Ok(()), Err)
    }
}
