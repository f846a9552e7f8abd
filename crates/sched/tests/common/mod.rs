#![allow(dead_code)]

use std::sync::{Arc, Mutex};

use berth_kubehub::{BindError, Binder, BindingRecord};
use berth_sched::FitOracle;
use berth_store::Documents;
use serde_json::{json, Value};

/// Oracle answering every query with the same result.
pub struct FakeOracle {
    pub result: Option<Value>,
    pub seen: Mutex<Vec<(Value, Value)>>,
}

impl FakeOracle {
    pub fn returning(result: Option<Value>) -> Arc<Self> {
        Arc::new(Self { result, seen: Mutex::new(Vec::new()) })
    }

    pub fn calls(&self) -> usize { self.seen.lock().unwrap().len() }

    /// Cluster documents passed with the last query.
    pub fn last_cluster(&self) -> Option<Value> { self.seen.lock().unwrap().last().map(|(c, _)| c.clone()) }
}

#[async_trait::async_trait]
impl FitOracle for FakeOracle {
    async fn query(&self, cluster: &Documents, pod: &Value) -> anyhow::Result<Option<Value>> {
        self.seen.lock().unwrap().push((cluster.to_json(), pod.clone()));
        Ok(self.result.clone())
    }
}

pub struct FailingOracle;

#[async_trait::async_trait]
impl FitOracle for FailingOracle {
    async fn query(&self, _cluster: &Documents, _pod: &Value) -> anyhow::Result<Option<Value>> {
        anyhow::bail!("policy engine unreachable")
    }
}

/// Binder recording requests and answering with a fixed status.
pub struct RecordingBinder {
    pub status: u16,
    pub requests: Mutex<Vec<(String, Value)>>,
}

impl RecordingBinder {
    pub fn with_status(status: u16) -> Arc<Self> {
        Arc::new(Self { status, requests: Mutex::new(Vec::new()) })
    }

    pub fn requests(&self) -> Vec<(String, Value)> { self.requests.lock().unwrap().clone() }
}

#[async_trait::async_trait]
impl Binder for RecordingBinder {
    async fn bind(&self, binding: &BindingRecord) -> Result<(), BindError> {
        self.requests.lock().unwrap().push((binding.path(), binding.body()));
        if self.status <= 201 {
            Ok(())
        } else {
            Err(BindError::rejected(binding, self.status, "injected failure"))
        }
    }
}

pub fn pod(uid: &str, name: &str) -> Value {
    json!({
        "metadata": { "uid": uid, "name": name, "namespace": "ns" },
        "spec": {},
        "status": { "phase": "Pending" }
    })
}

pub fn node(uid: &str, name: &str) -> Value {
    json!({ "metadata": { "uid": uid, "name": name }, "spec": {} })
}

/// Buffer collecting formatted log lines for the current thread.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Route this thread's tracing output into the buffer until the guard drops.
    pub fn install(&self) -> tracing::subscriber::DefaultGuard {
        let sink = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || sink.clone())
            .with_ansi(false)
            .with_max_level(tracing::Level::DEBUG)
            .finish();
        tracing::subscriber::set_default(subscriber)
    }

    pub fn text(&self) -> String { String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned() }

    pub fn lines_with(&self, needle: &str) -> Vec<String> {
        self.text().lines().filter(|l| l.contains(needle)).map(str::to_string).collect()
    }
}

impl std::io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> { Ok(()) }
}
