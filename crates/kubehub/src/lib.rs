//! Berth kubehub: client construction, change streams and binding submission.

#![forbid(unsafe_code)]

use std::path::Path;

use anyhow::{Context, Result};
use berth_core::ResourceKind;
use k8s_openapi::api::core::v1::{Binding, Node, Pod, ReplicationController, Service};
use kube::{
    config::{KubeConfigOptions, Kubeconfig},
    core::ApiResource,
    Client, Config,
};
use tracing::info;

mod bind;
mod stream;

pub use bind::{BindError, Binder, BindingRecord, KubeBinder};
pub use stream::{ChangeStream, EventNormalizer};

/// Build a client from an explicit kubeconfig file, or fall back to the
/// default chain (KUBECONFIG, ~/.kube/config, in-cluster).
pub async fn kube_client(kubeconfig: Option<&Path>) -> Result<Client> {
    let client = match kubeconfig {
        Some(path) => {
            let kc = Kubeconfig::read_from(path).with_context(|| format!("reading kubeconfig {}", path.display()))?;
            let cfg = Config::from_custom_kubeconfig(kc, &KubeConfigOptions::default())
                .await
                .context("loading kubeconfig")?;
            Client::try_from(cfg).context("building kube client")?
        }
        None => Client::try_default().await.context("inferring kube client config")?,
    };
    info!(kubeconfig = ?kubeconfig, "kube client ready");
    Ok(client)
}

pub(crate) fn api_resource(kind: ResourceKind) -> ApiResource {
    match kind {
        ResourceKind::Pods => ApiResource::erase::<Pod>(&()),
        ResourceKind::Nodes => ApiResource::erase::<Node>(&()),
        ResourceKind::Services => ApiResource::erase::<Service>(&()),
        ResourceKind::ReplicationControllers => ApiResource::erase::<ReplicationController>(&()),
    }
}

pub(crate) fn binding_resource() -> ApiResource { ApiResource::erase::<Binding>(&()) }

fn strip_managed_fields(v: &mut serde_json::Value) {
    if let Some(meta) = v.get_mut("metadata") {
        if let Some(obj) = meta.as_object_mut() {
            obj.remove("managedFields");
        }
    }
}
