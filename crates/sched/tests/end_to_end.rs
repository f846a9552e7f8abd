#![forbid(unsafe_code)]

mod common;

use std::time::Duration;

use berth_core::{doc, ChangeEvent, ResourceKind};
use berth_sched::{default_watch_table, Scheduler, SchedulerConfig, Source};
use berth_store::Mirror;
use common::{node, pod, FakeOracle, LogCapture, RecordingBinder};
use serde_json::json;
use tokio::sync::mpsc;

struct Harness {
    txs: Vec<mpsc::UnboundedSender<ChangeEvent>>,
    sources: Vec<Source>,
}

/// One channel per default stream, in table order.
fn harness() -> Harness {
    let mut txs = Vec::new();
    let mut sources = Vec::new();
    for spec in default_watch_table() {
        let (tx, rx) = mpsc::unbounded_channel();
        txs.push(tx);
        sources.push(Source { spec, rx });
    }
    Harness { txs, sources }
}

const UNPLACED_PODS: usize = 0;
const NODES: usize = 2;

async fn eventually(mut cond: impl FnMut() -> bool) {
    for _ in 0..200 {
        if cond() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

/// Send the initial resync on every patch stream so the sync barrier opens.
fn resync_patch_streams(h: &Harness) {
    for (i, tx) in h.txs.iter().enumerate() {
        if i == UNPLACED_PODS {
            continue;
        }
        let items = if i == NODES { vec![node("n1", "node-1")] } else { vec![] };
        tx.send(ChangeEvent::Resync(items)).unwrap();
    }
}

#[tokio::test]
async fn added_pod_is_scheduled_and_bound() {
    let mirror = Mirror::new();
    let oracle = FakeOracle::returning(Some(json!({"node-1": 1.0})));
    let binder = RecordingBinder::with_status(201);
    let logs = LogCapture::default();
    let _guard = logs.install();
    let h = harness();
    let sched = Scheduler::new(mirror.clone(), oracle.clone(), binder.clone(), SchedulerConfig::default());

    resync_patch_streams(&h);
    h.txs[UNPLACED_PODS].send(ChangeEvent::added(pod("p1", "a"))).unwrap();
    let Harness { txs, sources } = h;
    let _dispatcher = sched.start(sources).await.unwrap();

    eventually(|| !binder.requests().is_empty()).await;
    // init, node resync, placement; empty resyncs write nothing
    assert_eq!(mirror.epoch(), 3);
    let placed = mirror.get(ResourceKind::Pods, "p1").expect("pod mirrored");
    assert_eq!(doc::node_name(&placed), Some("node-1"));

    let reqs = binder.requests();
    assert_eq!(reqs.len(), 1);
    let (path, body) = &reqs[0];
    assert!(path.ends_with("/namespaces/ns/bindings"));
    assert_eq!(body["kind"], "Binding");
    assert_eq!(body["target"]["name"], "node-1");
    assert_eq!(body["metadata"], json!({"name": "a", "namespace": "ns"}));

    // The oracle saw the synced node.
    assert_eq!(oracle.last_cluster().unwrap()["nodes"]["n1"]["metadata"]["name"], "node-1");

    eventually(|| !logs.lines_with("scheduled pod").is_empty()).await;
    let scheduled = logs.lines_with("scheduled pod");
    assert_eq!(scheduled.len(), 1, "{}", logs.text());
    assert!(scheduled[0].contains("INFO"));
    assert!(scheduled[0].contains("pod=a") && scheduled[0].contains("node=node-1"), "{}", scheduled[0]);
    drop(txs);
}

#[tokio::test]
async fn undefined_fit_leaves_no_trace() {
    let mirror = Mirror::new();
    let oracle = FakeOracle::returning(None);
    let binder = RecordingBinder::with_status(201);
    let logs = LogCapture::default();
    let _guard = logs.install();
    let h = harness();
    let config = SchedulerConfig { sync_barrier: false, ..SchedulerConfig::default() };
    let sched = Scheduler::new(mirror.clone(), oracle.clone(), binder.clone(), config);

    h.txs[UNPLACED_PODS].send(ChangeEvent::added(pod("p1", "a"))).unwrap();
    let Harness { txs, sources } = h;
    let dispatcher = sched.start(sources).await.unwrap();

    // Closing every producer lets the dispatcher drain and stop.
    drop(txs);
    tokio::time::timeout(Duration::from_secs(2), dispatcher).await.unwrap().unwrap();

    assert_eq!(oracle.calls(), 1);
    assert_eq!(mirror.epoch(), 1, "only the root initialization was written");
    assert_eq!(mirror.len(ResourceKind::Pods), 0);
    assert!(binder.requests().is_empty());

    let undefined = logs.lines_with("fit document is undefined");
    assert_eq!(undefined.len(), 1, "{}", logs.text());
    assert!(undefined[0].contains("INFO"));
    assert!(logs.lines_with("ERROR").is_empty(), "{}", logs.text());
}

#[tokio::test]
async fn dispatcher_survives_failures() {
    let mirror = Mirror::new();
    let oracle = FakeOracle::returning(Some(json!({"node-1": 1.0})));
    let binder = RecordingBinder::with_status(500);
    let h = harness();
    let config = SchedulerConfig { sync_barrier: false, ..SchedulerConfig::default() };
    let sched = Scheduler::new(mirror.clone(), oracle, binder.clone(), config);

    let pods = &h.txs[UNPLACED_PODS];
    pods.send(ChangeEvent::Fault("watch expired".into())).unwrap();
    pods.send(ChangeEvent::added(json!({"metadata": {"name": "no-uid"}}))).unwrap();
    pods.send(ChangeEvent::added(pod("p1", "a"))).unwrap();
    h.txs[NODES].send(ChangeEvent::added(node("n1", "node-1"))).unwrap();
    let Harness { txs, sources } = h;
    let dispatcher = sched.start(sources).await.unwrap();
    drop(txs);
    tokio::time::timeout(Duration::from_secs(2), dispatcher).await.unwrap().unwrap();

    // The bind failed and was compensated; later events were still applied.
    assert_eq!(binder.requests().len(), 1);
    assert!(mirror.get(ResourceKind::Pods, "p1").is_none());
    assert!(mirror.get(ResourceKind::Nodes, "n1").is_some());
}
