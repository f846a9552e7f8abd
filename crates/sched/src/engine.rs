//! Scheduling decisions: rank, select, record, bind, and retract on failure.

use std::sync::Arc;
use std::time::{Duration, Instant};

use berth_core::{doc, ObjectError, ResourceKind};
use berth_kubehub::{BindError, Binder, BindingRecord};
use berth_store::{Mirror, MirrorError, MirrorPath, PatchOp};
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::{error, info, warn};

use crate::oracle::{classify, FitDecision, FitOracle};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Timings {
    pub query: Duration,
    pub store: Duration,
    pub bind: Duration,
}

/// Result of one scheduling attempt that did not fail.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Scheduled { node: String, timings: Timings },
    /// The fit document had no value for this pod.
    Undefined,
    Malformed(String),
    NoNodes,
}

impl Outcome {
    fn label(&self) -> &'static str {
        match self {
            Outcome::Scheduled { .. } => "scheduled",
            Outcome::Undefined => "undefined",
            Outcome::Malformed(_) => "malformed",
            Outcome::NoNodes => "no_nodes",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ScheduleError {
    #[error(transparent)]
    Object(#[from] ObjectError),
    #[error("mirror: {0}")]
    Mirror(#[from] MirrorError),
    #[error("fit query: {0:#}")]
    Oracle(anyhow::Error),
    #[error("bind: {0}")]
    Bind(#[from] BindError),
}

pub struct Engine {
    mirror: Mirror,
    oracle: Arc<dyn FitOracle>,
    binder: Arc<dyn Binder>,
}

impl Engine {
    pub fn new(mirror: Mirror, oracle: Arc<dyn FitOracle>, binder: Arc<dyn Binder>) -> Self {
        Self { mirror, oracle, binder }
    }

    pub fn mirror(&self) -> &Mirror { &self.mirror }

    /// Place one unplaced pod.
    ///
    /// The placement is written to the mirror before the binding is submitted;
    /// if the binding fails the entry is removed again before the error is
    /// returned. "No decision" outcomes are not errors and write nothing.
    pub async fn schedule_pod(&self, mut pod: Value) -> Result<Outcome, ScheduleError> {
        let uid = doc::uid(&pod)?.to_string();
        let name = doc::display_name(&pod).to_string();
        counter!("sched_attempts_total", 1u64);

        let t0 = Instant::now();
        let mut txn = self.mirror.begin().await;
        let raw = self.oracle.query(txn.documents(), &pod).await.map_err(ScheduleError::Oracle)?;
        let query = t0.elapsed();
        histogram!("sched_query_ms", query.as_secs_f64() * 1000.0);

        let mut rankings = match classify(raw) {
            FitDecision::Ranked(r) => r,
            FitDecision::Undefined => {
                info!(pod = %name, ?query, "unable to schedule pod: fit document is undefined");
                return Ok(record(Outcome::Undefined));
            }
            FitDecision::Malformed(reason) => {
                info!(pod = %name, ?query, %reason, "unable to schedule pod: fit document is malformed");
                return Ok(record(Outcome::Malformed(reason)));
            }
        };
        let Some(best) = rankings.best() else {
            info!(pod = %name, ?query, "unable to schedule pod: no nodes are available");
            return Ok(record(Outcome::NoNodes));
        };
        let node = best.node.clone();

        doc::set_node_name(&mut pod, &node)?;
        let binding = BindingRecord::from_pod(&pod)?;
        let prior = txn.get(ResourceKind::Pods, &uid).cloned();
        let path = MirrorPath::entry(ResourceKind::Pods, uid);

        let t1 = Instant::now();
        txn.upsert(&path, pod.clone())?;
        txn.commit();
        let store = t1.elapsed();

        let t2 = Instant::now();
        if let Err(e) = self.binder.bind(&binding).await {
            error!(pod = %name, node = %node, error = %e, "failed to bind pod");
            counter!("sched_compensations_total", 1u64);
            self.retract(&path, &pod, prior).await?;
            counter!("sched_outcome_total", 1u64, "outcome" => "bind_failed");
            return Err(ScheduleError::Bind(e));
        }
        let bind = t2.elapsed();
        histogram!("sched_bind_ms", bind.as_secs_f64() * 1000.0);

        let timings = Timings { query, store, bind };
        info!(pod = %name, node = %node, ?query, ?store, ?bind, "scheduled pod");
        Ok(record(Outcome::Scheduled { node, timings }))
    }

    /// Undo a tentative placement: put back the entry it replaced, or remove
    /// it if there was none. An entry that changed since the placement belongs
    /// to a newer patch and is left alone.
    async fn retract(&self, path: &MirrorPath, placed: &Value, prior: Option<Value>) -> Result<(), MirrorError> {
        let mut txn = self.mirror.begin().await;
        let current = path.uid.as_deref().and_then(|uid| txn.get(path.kind, uid));
        match current {
            None => {
                warn!(path = %path, "placement already gone from mirror");
                return Ok(());
            }
            Some(doc) if doc != placed => {
                warn!(path = %path, "placement superseded in mirror; keeping newer entry");
                return Ok(());
            }
            Some(_) => {}
        }
        match prior {
            Some(prev) => txn.write(PatchOp::Replace, path, Some(prev))?,
            None => txn.write(PatchOp::Remove, path, None)?,
        }
        txn.commit();
        Ok(())
    }
}

fn record(outcome: Outcome) -> Outcome {
    counter!("sched_outcome_total", 1u64, "outcome" => outcome.label());
    outcome
}
