//! Fit oracle: scores candidate nodes for a pod against the mirrored cluster.

use std::fmt;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use berth_core::Rankings;
use berth_store::Documents;
use serde_json::{json, Value};
use tracing::debug;

/// Evaluates the fit policy for one pod.
///
/// `Ok(None)` means the policy produced no result for this pod (undefined).
/// Any other shape is passed back as-is and judged by [`classify`].
#[async_trait::async_trait]
pub trait FitOracle: Send + Sync {
    async fn query(&self, cluster: &Documents, pod: &Value) -> Result<Option<Value>>;
}

#[derive(Debug, Clone, PartialEq)]
pub enum FitDecision {
    Ranked(Rankings),
    Undefined,
    Malformed(String),
}

/// A ranking is an object mapping node name to a number.
pub fn classify(result: Option<Value>) -> FitDecision {
    let map = match result {
        None => return FitDecision::Undefined,
        Some(Value::Object(map)) => map,
        Some(other) => return FitDecision::Malformed(format!("expected node weights, got {}", json_type(&other))),
    };
    let mut rankings = Rankings::new();
    for (node, weight) in map {
        match weight.as_f64() {
            Some(w) => rankings.push(node, w),
            None => return FitDecision::Malformed(format!("weight for {node} is {}", json_type(&weight))),
        }
    }
    FitDecision::Ranked(rankings)
}

fn json_type(v: &Value) -> &'static str {
    match v {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Location of the fit document, e.g. `/io/k8s/scheduler/fit`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FitPath(Vec<String>);

impl FitPath {
    pub fn parse(s: &str) -> Result<Self> {
        let Some(rest) = s.strip_prefix('/') else {
            bail!("invalid fit path {s:?}: must start with '/'");
        };
        let parts: Vec<String> = rest.split('/').map(str::to_string).collect();
        if parts.iter().any(|p| p.is_empty()) {
            bail!("invalid fit path {s:?}: empty segment");
        }
        Ok(Self(parts))
    }

    pub fn segments(&self) -> &[String] { &self.0 }
}

impl fmt::Display for FitPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for seg in &self.0 {
            write!(f, "/{seg}")?;
        }
        Ok(())
    }
}

/// [`FitOracle`] backed by a policy engine's data API: the fit document is
/// read with a POST to `<base>/v1/data/<fit path>`, passing the pod and the
/// mirrored cluster as input.
pub struct HttpOracle {
    client: reqwest::Client,
    url: String,
}

impl HttpOracle {
    pub fn new(base_url: &str, fit: &FitPath, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("building fit oracle http client")?;
        let url = format!("{}/v1/data{}", base_url.trim_end_matches('/'), fit);
        Ok(Self { client, url })
    }

    pub fn url(&self) -> &str { &self.url }
}

#[async_trait::async_trait]
impl FitOracle for HttpOracle {
    async fn query(&self, cluster: &Documents, pod: &Value) -> Result<Option<Value>> {
        let body = json!({ "input": { "requested_pod": pod, "cluster": cluster } });
        let resp = self
            .client
            .post(&self.url)
            .json(&body)
            .send()
            .await
            .with_context(|| format!("POST {}", self.url))?;
        let status = resp.status();
        if !status.is_success() {
            let text = resp.text().await.unwrap_or_default();
            bail!("POST {} returned {}: {}", self.url, status, text.trim());
        }
        let mut doc: Value = resp.json().await.with_context(|| format!("decoding response from {}", self.url))?;
        let result = doc.get_mut("result").map(Value::take);
        debug!(url = %self.url, defined = result.is_some(), "fit query answered");
        Ok(result)
    }
}
