#![forbid(unsafe_code)]

use std::time::Duration;

use berth_sched::{FitOracle, FitPath, HttpOracle};
use berth_store::Mirror;
use serde_json::json;
use wiremock::matchers::{body_partial_json, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fit() -> FitPath { FitPath::parse("/io/k8s/scheduler/fit").unwrap() }

async fn cluster() -> Mirror {
    let m = Mirror::new();
    m.init_roots().await.unwrap();
    m
}

#[tokio::test]
async fn returns_result_document() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/v1/data/io/k8s/scheduler/fit"))
        .and(body_partial_json(json!({"input": {"requested_pod": {"metadata": {"uid": "p1"}}, "cluster": {"nodes": {}}}})))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {"node-1": 1.0}})))
        .expect(1)
        .mount(&server)
        .await;

    let oracle = HttpOracle::new(&server.uri(), &fit(), Duration::from_secs(2)).unwrap();
    let m = cluster().await;
    let res = oracle.query(&m.snapshot(), &json!({"metadata": {"uid": "p1"}})).await.unwrap();
    assert_eq!(res, Some(json!({"node-1": 1.0})));
}

#[tokio::test]
async fn missing_result_is_undefined() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
        .mount(&server)
        .await;

    let oracle = HttpOracle::new(&server.uri(), &fit(), Duration::from_secs(2)).unwrap();
    let m = cluster().await;
    assert_eq!(oracle.query(&m.snapshot(), &json!({})).await.unwrap(), None);
}

#[tokio::test]
async fn server_errors_fail_the_query() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(500).set_body_string("policy compile error"))
        .mount(&server)
        .await;

    let oracle = HttpOracle::new(&server.uri(), &fit(), Duration::from_secs(2)).unwrap();
    let m = cluster().await;
    let err = oracle.query(&m.snapshot(), &json!({})).await.unwrap_err();
    let msg = format!("{err:#}");
    assert!(msg.contains("500"), "{msg}");
    assert!(msg.contains("policy compile error"), "{msg}");
}

#[tokio::test]
async fn slow_oracle_times_out() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({"result": {}})).set_delay(Duration::from_millis(500)))
        .mount(&server)
        .await;

    let oracle = HttpOracle::new(&server.uri(), &fit(), Duration::from_millis(50)).unwrap();
    let m = cluster().await;
    assert!(oracle.query(&m.snapshot(), &json!({})).await.is_err());
}
