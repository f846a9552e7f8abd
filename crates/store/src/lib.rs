//! Berth store: the resource mirror.
//!
//! Documents are kept per resource type, keyed by `metadata.uid`. Writers go
//! through [`Txn`]: a copy-on-write view that is published atomically on
//! commit, so readers holding a snapshot never observe a half-applied batch.
//! Only one transaction is open at a time.

#![forbid(unsafe_code)]

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use arc_swap::ArcSwap;
use berth_core::ResourceKind;
use metrics::{counter, histogram};
use rustc_hash::FxHashMap;
use serde::Serialize;
use serde_json::Value;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tracing::{debug, info};

/// One resource type's documents, keyed by uid.
pub type Collection = FxHashMap<String, Value>;

/// Full mirror contents. Serializes as `{ "pods": { uid: doc }, ... }`.
#[derive(Debug, Clone, Default, Serialize)]
#[serde(transparent)]
pub struct Documents {
    roots: FxHashMap<ResourceKind, Collection>,
}

impl Documents {
    pub fn collection(&self, kind: ResourceKind) -> Option<&Collection> { self.roots.get(&kind) }

    pub fn get(&self, kind: ResourceKind, uid: &str) -> Option<&Value> {
        self.roots.get(&kind).and_then(|c| c.get(uid))
    }

    pub fn len(&self, kind: ResourceKind) -> usize {
        self.roots.get(&kind).map(|c| c.len()).unwrap_or(0)
    }

    pub fn to_json(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PatchOp {
    Add,
    Replace,
    Remove,
}

/// Address of a collection root (`pods`) or a single entry (`pods["p1"]`).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MirrorPath {
    pub kind: ResourceKind,
    pub uid: Option<String>,
}

impl MirrorPath {
    pub fn root(kind: ResourceKind) -> Self { Self { kind, uid: None } }
    pub fn entry(kind: ResourceKind, uid: impl Into<String>) -> Self { Self { kind, uid: Some(uid.into()) } }
}

impl fmt::Display for MirrorPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.uid {
            Some(uid) => write!(f, "{}[{:?}]", self.kind, uid),
            None => write!(f, "{}", self.kind),
        }
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum MirrorError {
    #[error("storage path not found: {0}")]
    NotFound(String),
    #[error("invalid document for {path}: {reason}")]
    InvalidDocument { path: String, reason: &'static str },
    #[error("{op:?} at {path} requires a document")]
    MissingDocument { op: PatchOp, path: String },
}

/// Handle to the mirror. Cheap to clone; every clone sees the same documents.
#[derive(Clone)]
pub struct Mirror {
    docs: Arc<ArcSwap<Documents>>,
    writer: Arc<Mutex<()>>,
    epoch_tx: Arc<watch::Sender<u64>>,
    next_txn: Arc<AtomicU64>,
}

impl Default for Mirror {
    fn default() -> Self { Self::new() }
}

impl Mirror {
    pub fn new() -> Self {
        let (epoch_tx, _rx) = watch::channel(0u64);
        Self {
            docs: Arc::new(ArcSwap::from_pointee(Documents::default())),
            writer: Arc::new(Mutex::new(())),
            epoch_tx: Arc::new(epoch_tx),
            next_txn: Arc::new(AtomicU64::new(1)),
        }
    }

    /// Open a transaction. Waits while another transaction is open.
    pub async fn begin(&self) -> Txn {
        let guard = Arc::clone(&self.writer).lock_owned().await;
        let id = self.next_txn.fetch_add(1, Ordering::Relaxed);
        Txn {
            id,
            docs: self.docs.load_full(),
            writes: 0,
            started: Instant::now(),
            mirror: self.clone(),
            committed: false,
            _guard: guard,
        }
    }

    /// Create the empty root document for every resource type.
    pub async fn init_roots(&self) -> Result<(), MirrorError> {
        let mut txn = self.begin().await;
        for kind in ResourceKind::ALL {
            txn.write(PatchOp::Add, &MirrorPath::root(kind), Some(Value::Object(Default::default())))?;
        }
        txn.commit();
        info!(roots = ResourceKind::ALL.len(), "mirror roots initialized");
        Ok(())
    }

    pub fn snapshot(&self) -> Arc<Documents> { self.docs.load_full() }

    pub fn get(&self, kind: ResourceKind, uid: &str) -> Option<Value> {
        self.docs.load().get(kind, uid).cloned()
    }

    pub fn len(&self, kind: ResourceKind) -> usize { self.docs.load().len(kind) }

    /// Number of committed transactions that wrote something.
    pub fn epoch(&self) -> u64 { *self.epoch_tx.borrow() }

    pub fn subscribe_epoch(&self) -> watch::Receiver<u64> { self.epoch_tx.subscribe() }
}

/// An open write transaction. Reads through it see its own writes.
///
/// [`Txn::commit`] publishes the writes; dropping the handle without
/// committing discards them.
pub struct Txn {
    id: u64,
    docs: Arc<Documents>,
    writes: usize,
    started: Instant,
    mirror: Mirror,
    committed: bool,
    _guard: OwnedMutexGuard<()>,
}

impl Txn {
    pub fn id(&self) -> u64 { self.id }
    pub fn writes(&self) -> usize { self.writes }
    pub fn documents(&self) -> &Documents { &self.docs }
    pub fn get(&self, kind: ResourceKind, uid: &str) -> Option<&Value> { self.docs.get(kind, uid) }

    pub fn write(&mut self, op: PatchOp, path: &MirrorPath, doc: Option<Value>) -> Result<(), MirrorError> {
        // Validate against the current view first so a failed write never forces a copy.
        self.check(op, path, doc.as_ref())?;
        let docs = Arc::make_mut(&mut self.docs);
        match (&path.uid, op) {
            (None, PatchOp::Add | PatchOp::Replace) => {
                if let Some(Value::Object(obj)) = doc {
                    docs.roots.insert(path.kind, obj.into_iter().collect());
                }
            }
            (None, PatchOp::Remove) => {
                docs.roots.remove(&path.kind);
            }
            (Some(uid), PatchOp::Add | PatchOp::Replace) => {
                if let (Some(coll), Some(doc)) = (docs.roots.get_mut(&path.kind), doc) {
                    coll.insert(uid.clone(), doc);
                }
            }
            (Some(uid), PatchOp::Remove) => {
                if let Some(coll) = docs.roots.get_mut(&path.kind) {
                    coll.remove(uid);
                }
            }
        }
        self.writes += 1;
        debug!(txn = self.id, ?op, path = %path, "mirror write");
        Ok(())
    }

    fn check(&self, op: PatchOp, path: &MirrorPath, doc: Option<&Value>) -> Result<(), MirrorError> {
        let coll = self.docs.roots.get(&path.kind);
        match (&path.uid, op) {
            (None, PatchOp::Add) => {}
            (None, PatchOp::Replace | PatchOp::Remove) if coll.is_none() => {
                return Err(MirrorError::NotFound(path.to_string()));
            }
            (None, _) => {}
            (Some(_), _) if coll.is_none() => return Err(MirrorError::NotFound(path.to_string())),
            (Some(uid), PatchOp::Replace | PatchOp::Remove) => {
                if !coll.map(|c| c.contains_key(uid)).unwrap_or(false) {
                    return Err(MirrorError::NotFound(path.to_string()));
                }
            }
            (Some(_), PatchOp::Add) => {}
        }
        if op == PatchOp::Remove {
            return Ok(());
        }
        match doc {
            None => Err(MirrorError::MissingDocument { op, path: path.to_string() }),
            Some(Value::Object(_)) => Ok(()),
            Some(_) => Err(MirrorError::InvalidDocument { path: path.to_string(), reason: "expected an object" }),
        }
    }

    /// Add when the entry is absent, Replace when present.
    pub fn upsert(&mut self, path: &MirrorPath, doc: Value) -> Result<(), MirrorError> {
        let exists = match &path.uid {
            Some(uid) => self.docs.get(path.kind, uid).is_some(),
            None => self.docs.collection(path.kind).is_some(),
        };
        let op = if exists { PatchOp::Replace } else { PatchOp::Add };
        self.write(op, path, Some(doc))
    }

    /// Publish the writes and close the transaction. Returns the mirror epoch.
    pub fn commit(mut self) -> u64 {
        self.committed = true;
        let mirror = self.mirror.clone();
        if self.writes == 0 {
            return mirror.epoch();
        }
        let docs = std::mem::take(&mut self.docs);
        mirror.docs.store(docs);
        let mut epoch = 0;
        mirror.epoch_tx.send_modify(|e| {
            *e = e.saturating_add(1);
            epoch = *e;
        });
        counter!("mirror_commit_total", 1u64);
        counter!("mirror_writes_total", self.writes as u64);
        histogram!("mirror_commit_ms", self.started.elapsed().as_secs_f64() * 1000.0);
        debug!(txn = self.id, writes = self.writes, epoch, "transaction committed");
        epoch
    }
}

impl Drop for Txn {
    fn drop(&mut self) {
        if !self.committed && self.writes > 0 {
            debug!(txn = self.id, writes = self.writes, "transaction discarded");
        }
    }
}
