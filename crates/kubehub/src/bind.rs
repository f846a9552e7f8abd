use std::fmt;
use std::time::Duration;

use berth_core::{doc, ObjectError};
use kube::{
    api::PostParams,
    client::Body,
    core::{DynamicObject, ErrorResponse, Request},
    Client, Resource,
};
use metrics::{counter, histogram};
use serde_json::{json, Value};
use tracing::debug;

use crate::binding_resource;

/// "Pod X goes to node Y", as submitted to the control plane.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindingRecord {
    pub pod: String,
    pub namespace: String,
    pub node: String,
}

impl BindingRecord {
    /// Build from a pod document whose `spec.nodeName` is already set.
    pub fn from_pod(pod: &Value) -> Result<Self, ObjectError> {
        let node = doc::node_name(pod).ok_or_else(|| ObjectError::missing("spec.nodeName", pod))?;
        Ok(Self {
            pod: doc::name(pod)?.to_string(),
            namespace: doc::namespace(pod)?.to_string(),
            node: node.to_string(),
        })
    }

    /// Request path relative to the API server root.
    pub fn path(&self) -> String { format!("/api/v1/namespaces/{}/bindings", self.namespace) }

    pub fn body(&self) -> Value {
        json!({
            "apiVersion": "v1",
            "kind": "Binding",
            "metadata": { "name": self.pod, "namespace": self.namespace },
            "target": { "apiVersion": "v1", "kind": "Node", "name": self.node },
        })
    }
}

impl fmt::Display for BindingRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} -> {}", self.namespace, self.pod, self.node)
    }
}

#[derive(Debug, Clone, thiserror::Error, PartialEq, Eq)]
pub enum BindError {
    #[error("POST {path} ({binding}): status {status}: {message}")]
    Rejected { path: String, binding: String, status: u16, message: String },
    #[error("POST {path} ({binding}): {reason}")]
    Transport { path: String, binding: String, reason: String },
    #[error("POST {path} ({binding}): no response within {timeout:?}")]
    Timeout { path: String, binding: String, timeout: Duration },
}

impl BindError {
    pub fn rejected(b: &BindingRecord, status: u16, message: impl Into<String>) -> Self {
        BindError::Rejected { path: b.path(), binding: b.to_string(), status, message: message.into() }
    }

    pub fn transport(b: &BindingRecord, reason: impl Into<String>) -> Self {
        BindError::Transport { path: b.path(), binding: b.to_string(), reason: reason.into() }
    }
}

/// Submits placements to the control plane. One call is one request; callers
/// must not assume retries are safe.
#[async_trait::async_trait]
pub trait Binder: Send + Sync {
    async fn bind(&self, binding: &BindingRecord) -> Result<(), BindError>;
}

/// [`Binder`] posting `v1/Binding` objects through the kube client.
pub struct KubeBinder {
    client: Client,
    timeout: Duration,
}

impl KubeBinder {
    pub fn new(client: Client, timeout: Duration) -> Self { Self { client, timeout } }
}

/// Statuses the control plane answers a successful binding with.
fn is_bound(status: u16) -> bool { matches!(status, 200 | 201) }

/// Reason text for a refused binding: the API `Status` message when the body is
/// one, else the body itself.
fn rejection_message(body: &[u8]) -> String {
    match serde_json::from_slice::<ErrorResponse>(body) {
        Ok(status) if !status.message.is_empty() => status.message,
        _ => String::from_utf8_lossy(body).trim().to_string(),
    }
}

#[async_trait::async_trait]
impl Binder for KubeBinder {
    async fn bind(&self, binding: &BindingRecord) -> Result<(), BindError> {
        let started = std::time::Instant::now();
        let ar = binding_resource();
        let obj = DynamicObject::new(&binding.pod, &ar)
            .within(&binding.namespace)
            .data(json!({ "target": binding.body()["target"].clone() }));
        let body = serde_json::to_vec(&obj).map_err(|e| BindError::transport(binding, e.to_string()))?;
        let req = Request::new(DynamicObject::url_path(&ar, Some(binding.namespace.as_str())))
            .create(&PostParams::default(), body)
            .map_err(|e| BindError::transport(binding, e.to_string()))?;

        let exchange = async {
            let res = self.client.send(req.map(Body::from)).await?;
            let status = res.status().as_u16();
            let bytes = res.into_body().collect_bytes().await?;
            Ok::<_, kube::Error>((status, bytes))
        };
        let res = tokio::time::timeout(self.timeout, exchange).await;
        histogram!("bind_request_ms", started.elapsed().as_secs_f64() * 1000.0);
        match res {
            Ok(Ok((status, _))) if is_bound(status) => {
                counter!("bind_ok_total", 1u64);
                debug!(binding = %binding, status, "binding accepted");
                Ok(())
            }
            Ok(Ok((status, bytes))) => {
                counter!("bind_err_total", 1u64);
                Err(BindError::rejected(binding, status, rejection_message(&bytes)))
            }
            Ok(Err(e)) => {
                counter!("bind_err_total", 1u64);
                Err(BindError::transport(binding, e.to_string()))
            }
            Err(_) => {
                counter!("bind_err_total", 1u64);
                Err(BindError::Timeout { path: binding.path(), binding: binding.to_string(), timeout: self.timeout })
            }
        }
    }
}
