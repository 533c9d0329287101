//! Flow and poller scenarios against a mock backend over real HTTP

use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use taskflow_engine::application::progress_poller::{ProgressChannel, ProgressEvent, TerminationReason};
use taskflow_engine::application::task_flow::FlowConfig;
use taskflow_engine::domain::flow_status::FlowStatus;
use taskflow_engine::domain::progress::StopReason;
use taskflow_engine::domain::task::Platform;
use taskflow_engine::infrastructure::http_transport::ReqwestTransport;
use taskflow_engine::infrastructure::local_store::{LocalStore, keys};
use taskflow_engine::{EngineConfig, EngineContext};
use tokio::sync::mpsc;
use wiremock::matchers::{body_partial_json, method, path, query_param};
use wiremock::{Mock, MockServer, ResponseTemplate};

fn fast_engine(server: &MockServer, store: Arc<LocalStore>) -> EngineContext {
    let mut config = EngineConfig::default();
    config.api.base_url = server.uri();
    config.gateway.min_interval_ms = 10;
    config.gateway.retry_delay_ms = 10;
    config.gateway.timeout_ms = 1_000;
    config.polling.interval_ms = 40;
    config.flow.check_interval_ms = 40;
    config.flow.max_wait_ms = 5_000;

    store.set(keys::TOKEN, &"tok").unwrap();
    let transport = ReqwestTransport::new("taskflow-tests", Duration::from_secs(2)).unwrap();
    EngineContext::with_parts(config, Arc::new(transport), store).unwrap()
}

fn listing(crawler: &str, analysis: &str, market: &str) -> Value {
    json!({
        "status": 200,
        "data": {
            "task_list": [{
                "task_id": "t-100",
                "keyword": "matcha",
                "platform": "dy",
                "crawler_state": crawler,
                "analysis_state": analysis,
                "marketing_state": market
            }],
            "total_count": 1
        }
    })
}

fn progress(num: u64, sum: u64) -> Value {
    json!({ "status": 200, "data": { "num": num, "sum": sum, "state": 1, "ic_num": 0 } })
}

#[tokio::test]
async fn flow_runs_from_creation_to_marketing_users() {
    let server = MockServer::start().await;
    Mock::given(method("POST"))
        .and(path("/comment_crawler"))
        .and(body_partial_json(json!({ "platform": "dy", "keyword": "matcha", "lt": "qrcode" })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 200, "task_id": "t-100" })))
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/task_list"))
        .and(query_param("count", "100"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing("crawling", "initial", "initial")))
        .up_to_n_times(1)
        .with_priority(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/task_list"))
        .respond_with(ResponseTemplate::new(200).set_body_json(listing("finish", "finish", "ready")))
        .with_priority(2)
        .mount(&server)
        .await;
    Mock::given(method("POST"))
        .and(path("/get_simple_marketing_user"))
        .and(body_partial_json(json!({ "task_id": "t-100", "task_step_type": 3 })))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({ "status": 200, "data": [{ "nickname": "a" }] })))
        .expect(1)
        .mount(&server)
        .await;

    let dir = tempfile::tempdir().unwrap();
    let store = Arc::new(LocalStore::open(dir.path().join("store.json")).unwrap());
    let engine = fast_engine(&server, store);

    let flow = engine.new_flow(FlowConfig::new(Platform::Dy, "matcha"));
    let outcome = flow.start_flow().await.unwrap();

    assert_eq!(outcome.task_id, "t-100");
    assert_eq!(outcome.status, FlowStatus::MarketingReady);
    assert_eq!(outcome.marketing_users, vec![json!({ "nickname": "a" })]);
    assert_eq!(engine.registry.get("t-100").map(|t| t.keyword), Some("matcha".to_string()));

    // the summary survives a reopen of the store file
    let reopened = LocalStore::open(dir.path().join("store.json")).unwrap();
    let summary: Value = reopened.get(&keys::task_summary("t-100")).unwrap().unwrap();
    assert_eq!(summary["keyword"], "matcha");
}

#[tokio::test]
async fn poller_stops_on_a_stalled_counter() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/progress"))
        .respond_with(ResponseTemplate::new(200).set_body_json(progress(3, 10)))
        .up_to_n_times(1)
        .with_priority(1)
        .expect(1)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/progress"))
        .and(query_param("step_type", "2"))
        .respond_with(ResponseTemplate::new(200).set_body_json(progress(5, 10)))
        .with_priority(2)
        .expect(4)
        .mount(&server)
        .await;

    let engine = fast_engine(&server, Arc::new(LocalStore::in_memory()));
    let (tx, mut rx) = mpsc::unbounded_channel();
    engine.poller.on_update(
        "t-100",
        Arc::new(move |event: &ProgressEvent| {
            let _ = tx.send(event.clone());
        }),
    );

    engine
        .poller
        .start("t-100", engine.poller.analysis_channel())
        .await
        .unwrap();

    let mut nums = Vec::new();
    let reason = tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(ProgressEvent::Updated { snapshot, .. }) => nums.push(snapshot.num),
                Some(ProgressEvent::Terminated { reason, .. }) => break reason,
                None => panic!("poller dropped its listener"),
            }
        }
    })
    .await
    .unwrap();

    assert_eq!(nums, vec![3, 5, 5, 5, 5]);
    assert_eq!(reason, TerminationReason::Finished { reason: StopReason::Stalled });
    let latest = engine
        .poller
        .latest("t-100", ProgressChannel::Analysis { step_type: 2 })
        .unwrap();
    assert_eq!(latest.percent(), 50);
}
