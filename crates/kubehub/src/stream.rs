use anyhow::{Context, Result};
use berth_core::{doc, ChangeEvent, ResourceKind};
use futures::StreamExt;
use kube::{
    api::Api,
    core::DynamicObject,
    runtime::{watcher::{self, Event}, WatchStreamExt},
    Client,
};
use metrics::counter;
use rustc_hash::FxHashSet;
use serde_json::Value;
use tokio::{sync::mpsc, task::JoinHandle};
use tracing::{debug, info, warn};

use crate::{api_resource, strip_managed_fields};

/// Turns list+watch events into [`ChangeEvent`]s.
///
/// The watcher only reports "applied"; whether that is an add or a modify is
/// decided by the uids seen since the last resync.
#[derive(Debug, Default)]
pub struct EventNormalizer {
    seen: FxHashSet<String>,
}

impl EventNormalizer {
    pub fn restarted(&mut self, docs: Vec<Value>) -> ChangeEvent {
        self.seen.clear();
        self.seen.extend(docs.iter().filter_map(|d| doc::uid(d).ok()).map(str::to_string));
        ChangeEvent::Resync(docs)
    }

    pub fn applied(&mut self, d: Value) -> ChangeEvent {
        let known = match doc::uid(&d) {
            Ok(uid) => !self.seen.insert(uid.to_string()),
            Err(_) => false,
        };
        if known { ChangeEvent::modified(d) } else { ChangeEvent::added(d) }
    }

    pub fn deleted(&mut self, d: Value) -> ChangeEvent {
        if let Ok(uid) = doc::uid(&d) {
            self.seen.remove(uid);
        }
        ChangeEvent::deleted(d)
    }

    pub fn len(&self) -> usize { self.seen.len() }
    pub fn is_empty(&self) -> bool { self.seen.is_empty() }
}

fn object_json(obj: &DynamicObject) -> Result<Value, serde_json::Error> {
    let mut raw = serde_json::to_value(obj)?;
    strip_managed_fields(&mut raw);
    Ok(raw)
}

/// List+watch for one resource type, filtered server-side by a field selector.
///
/// The stream starts with one resync and then reports incremental changes for
/// as long as the process runs. Watch errors are forwarded as
/// [`ChangeEvent::Fault`] and the watch resumes after backoff.
pub struct ChangeStream {
    resource: ResourceKind,
    field_selector: String,
    api: Api<DynamicObject>,
    tx: mpsc::UnboundedSender<ChangeEvent>,
}

impl ChangeStream {
    /// Create the stream and the channel its events will arrive on. Nothing is
    /// watched until [`ChangeStream::start`].
    pub fn new(client: Client, resource: &str, field_selector: &str) -> Result<(Self, mpsc::UnboundedReceiver<ChangeEvent>)> {
        let resource: ResourceKind = resource.parse().context("creating change stream")?;
        let ar = api_resource(resource);
        let api: Api<DynamicObject> = Api::all_with(client, &ar);
        let (tx, rx) = mpsc::unbounded_channel();
        Ok((Self { resource, field_selector: field_selector.to_string(), api, tx }, rx))
    }

    pub fn resource(&self) -> ResourceKind { self.resource }
    pub fn field_selector(&self) -> &str { &self.field_selector }

    pub fn start(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }

    async fn run(self) {
        let mut cfg = watcher::Config::default();
        if !self.field_selector.is_empty() {
            cfg = cfg.fields(&self.field_selector);
        }
        let stream = watcher::watcher(self.api, cfg).default_backoff();
        futures::pin_mut!(stream);
        let resource = self.resource.as_str();
        info!(resource, selector = %self.field_selector, "change stream started");
        let mut norm = EventNormalizer::default();
        while let Some(item) = stream.next().await {
            let ev = match item {
                Ok(Event::Restarted(list)) => {
                    debug!(resource, count = list.len(), "watch restart");
                    match list.iter().map(object_json).collect::<Result<Vec<_>, _>>() {
                        Ok(docs) => norm.restarted(docs),
                        Err(e) => ChangeEvent::Fault(format!("encoding resync: {e}")),
                    }
                }
                Ok(Event::Applied(o)) => match object_json(&o) {
                    Ok(d) => norm.applied(d),
                    Err(e) => ChangeEvent::Fault(format!("encoding object: {e}")),
                },
                Ok(Event::Deleted(o)) => match object_json(&o) {
                    Ok(d) => norm.deleted(d),
                    Err(e) => ChangeEvent::Fault(format!("encoding object: {e}")),
                },
                Err(e) => {
                    counter!("watch_errors_total", 1u64, "resource" => resource);
                    ChangeEvent::Fault(e.to_string())
                }
            };
            counter!("watch_events_total", 1u64, "resource" => resource);
            if self.tx.send(ev).is_err() {
                debug!(resource, "change stream receiver dropped");
                break;
            }
        }
        warn!(resource, "change stream ended");
    }
}
