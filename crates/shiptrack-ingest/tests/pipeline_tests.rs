//! End-to-end runs of the fetch-and-parse pipeline against a simulated partner
//!
//! The partner answers every identifier in the `ids` query parameter with one
//! shipment record; individual batches are made to fail by matching their
//! exact identifier list.

use serde_json::{json, Value};
use shiptrack_ingest::batch::{Batch, BatchSet};
use shiptrack_ingest::config::{PipelineConfig, RetryPolicy};
use shiptrack_ingest::models::{EventNote, ShipmentEvents};
use shiptrack_ingest::pipeline::TrackingPipeline;
use shiptrack_ingest::progress::ProgressSink;
use shiptrack_ingest::queue::ProgressSnapshot;
use shiptrack_ingest::store::{get_json, DurableStore, FsStore, Stage, StoreKey};
use std::path::Path;
use std::sync::{Arc, Mutex};
use wiremock::{
    matchers::{method, path, query_param},
    Mock, MockServer, Request, ResponseTemplate,
};

/// Progress sink that keeps every report
#[derive(Default)]
struct RecordingSink {
    reports: Mutex<Vec<(String, u8, String)>>,
}

impl RecordingSink {
    fn percents(&self, stage: &str) -> Vec<u8> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .filter(|(s, _, _)| s == stage)
            .map(|(_, percent, _)| *percent)
            .collect()
    }
}

impl ProgressSink for RecordingSink {
    fn report(&self, stage: &str, snapshot: &ProgressSnapshot) -> anyhow::Result<()> {
        self.reports.lock().unwrap().push((
            stage.to_string(),
            snapshot.percent(),
            snapshot.status_line(),
        ));
        Ok(())
    }
}

/// One record per requested identifier; ids ending in `9` have no scans
fn echo_partner(request: &Request) -> ResponseTemplate {
    let ids = request
        .url
        .query_pairs()
        .find(|(key, _)| key == "ids")
        .map(|(_, value)| value.into_owned())
        .unwrap_or_default();

    let records: Vec<Value> = ids
        .split(',')
        .filter(|id| !id.is_empty())
        .map(|id| {
            if id.ends_with('9') {
                json!({"Tracking_ID": id, "Parcel_Status": "Label Created"})
            } else {
                json!({
                    "Tracking_ID": id,
                    "Parcel_Status": "In Transit",
                    "Origin": "Memphis, TN",
                    "Event_Scans": [
                        {"Datetime": "2024-02-01T08:00:00", "Location": "Memphis, TN"},
                        {"Datetime": "02/01/2024 17:30", "Location": "Louisville, KY"}
                    ]
                })
            }
        })
        .collect();

    ResponseTemplate::new(200).set_body_json(Value::Array(records))
}

fn tracking_ids(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("1Z{:04}", i)).collect()
}

fn config(server: &MockServer, root: &Path, workers: usize) -> PipelineConfig {
    PipelineConfig::builder("acme", format!("{}/track?ids={{ids}}", server.uri()))
        .workers(workers)
        .retry(RetryPolicy {
            max_retries: 2,
            base_delay_ms: 1,
            factor: 2.0,
            max_delay_ms: 5,
        })
        .store_root(root)
        .build()
        .unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_one_failed_sub_batch_does_not_stop_the_others() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    let ids = tracking_ids(100);
    let batches = BatchSet::chunked("sub", &ids, 20).unwrap();
    assert_eq!(batches.len(), 5);

    // sub_0003 keeps failing until its retry budget is spent
    Mock::given(method("GET"))
        .and(path("/track"))
        .and(query_param("ids", ids[40..60].join(",")))
        .respond_with(ResponseTemplate::new(503))
        .expect(3)
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/track"))
        .respond_with(echo_partner)
        .expect(4)
        .mount(&mock_server)
        .await;

    let sink = Arc::new(RecordingSink::default());
    let pipeline = TrackingPipeline::new(config(&mock_server, dir.path(), 5))
        .unwrap()
        .with_progress_sink(sink.clone());

    let summary = pipeline.run(batches).await;

    assert_eq!(summary.identifiers_requested, 100);
    assert_eq!(summary.fetch.total, 5);
    assert_eq!(summary.fetch.completed, 4);
    assert_eq!(summary.failed_batches(), 1);
    assert_eq!(summary.fetch.failed[0].task, "sub_0003");
    assert_eq!(summary.fetch.failed[0].kind, "fetch");

    assert_eq!(summary.parse.total, 4);
    assert_eq!(summary.parse.completed, 4);
    assert!(summary.parse.failed.is_empty());
    // 1Z0009, 1Z0019, ... have no scans: 8 of them outside sub_0003
    assert_eq!(summary.identifiers_parsed, 72);
    assert_eq!(summary.identifiers_degraded, 8);
    assert_eq!(summary.identifiers_failed, 0);

    let store = FsStore::new(dir.path());
    let details = store.list("acme", Stage::Details).await.unwrap();
    assert_eq!(details.len(), 80);
    assert!(!details.contains(&"1Z0045".to_string()));

    let raw = store.list("acme", Stage::Batches).await.unwrap();
    assert_eq!(raw, vec!["sub_0001", "sub_0002", "sub_0004", "sub_0005"]);

    let shipment: ShipmentEvents = get_json(&store, &StoreKey::details("acme", "1Z0000"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(shipment.batch_name, "sub_0001");
    assert_eq!(shipment.events.len(), 2);
    assert_eq!(shipment.events[1].sequence, 1);
    assert!(shipment.events.iter().all(|e| e.timestamp.is_some()));

    let degraded: ShipmentEvents = get_json(&store, &StoreKey::details("acme", "1Z0009"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(degraded.events.len(), 1);
    assert_eq!(degraded.events[0].note, Some(EventNote::NoScanData));

    for stage in ["fetch", "parse"] {
        let percents = sink.percents(stage);
        assert!(!percents.is_empty(), "no progress reported for {}", stage);
        assert!(
            percents.windows(2).all(|w| w[0] < w[1]),
            "{} progress not monotonic: {:?}",
            stage,
            percents
        );
        assert_eq!(percents.last(), Some(&100));
    }

    let lines = sink.reports.lock().unwrap();
    let final_fetch = lines.iter().rev().find(|(s, _, _)| s == "fetch").unwrap();
    assert_eq!(final_fetch.2, "100% of 5 complete");
}

#[tokio::test]
async fn test_client_error_fails_batch_without_retry() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/track"))
        .and(query_param("ids", "BAD1"))
        .respond_with(ResponseTemplate::new(400))
        .expect(1)
        .with_priority(1)
        .mount(&mock_server)
        .await;

    Mock::given(method("GET"))
        .and(path("/track"))
        .respond_with(echo_partner)
        .mount(&mock_server)
        .await;

    let batches = BatchSet::new(vec![
        Batch::new("ok", ["1Z0001", "1Z0002"]),
        Batch::new("rejected", ["BAD1"]),
    ])
    .unwrap();

    let pipeline = TrackingPipeline::new(config(&mock_server, dir.path(), 2)).unwrap();
    let summary = pipeline.run(batches).await;

    assert_eq!(summary.failed_batches(), 1);
    assert_eq!(summary.fetch.failed[0].task, "rejected");
    assert!(summary.fetch.failed[0].reason.contains("400"));
    assert_eq!(summary.identifiers_parsed, 2);
}

#[tokio::test]
async fn test_batch_names_differing_only_in_separators_stay_apart() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/track"))
        .respond_with(echo_partner)
        .expect(2)
        .mount(&mock_server)
        .await;

    let batches = BatchSet::new(vec![
        Batch::new("west/1", ["A/1", "A2"]),
        Batch::new("west_1", ["A_1", "B2"]),
    ])
    .unwrap();

    let pipeline = TrackingPipeline::new(config(&mock_server, dir.path(), 2)).unwrap();
    let summary = pipeline.run(batches).await;

    assert!(summary.is_clean());
    assert_eq!(summary.parse.completed, 2);
    assert_eq!(summary.identifiers_parsed, 4);

    let store = FsStore::new(dir.path());
    assert_eq!(
        store.list("acme", Stage::Batches).await.unwrap(),
        vec!["west/1", "west_1"]
    );
    let details = store.list("acme", Stage::Details).await.unwrap();
    assert_eq!(details, vec!["A/1", "A2", "A_1", "B2"]);

    let slash: ShipmentEvents = get_json(&store, &StoreKey::details("acme", "A/1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(slash.batch_name, "west/1");
    let underscore: ShipmentEvents = get_json(&store, &StoreKey::details("acme", "A_1"))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(underscore.batch_name, "west_1");
}

#[tokio::test]
async fn test_reparse_from_store_without_refetch() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/track"))
        .respond_with(echo_partner)
        .expect(2)
        .mount(&mock_server)
        .await;

    let pipeline = TrackingPipeline::new(config(&mock_server, dir.path(), 4)).unwrap();
    let batches = BatchSet::chunked("nightly", tracking_ids(6), 3).unwrap();

    let fetch = pipeline.fetch_stage(batches).await;
    assert_eq!(fetch.completed, 2);

    let stored = pipeline.stored_batches().await.unwrap();
    assert_eq!(stored.len(), 2);

    let first = pipeline.parse_stage(stored.clone()).await;
    let second = pipeline.parse_stage(stored).await;
    assert_eq!(first.identifiers_parsed, 6);
    assert_eq!(second.identifiers_parsed, 6);
    assert_eq!(second.stage.completed, 2);
}

#[tokio::test]
async fn test_summary_serializes_to_json() {
    let mock_server = MockServer::start().await;
    let dir = tempfile::tempdir().unwrap();

    Mock::given(method("GET"))
        .and(path("/track"))
        .respond_with(echo_partner)
        .mount(&mock_server)
        .await;

    let pipeline = TrackingPipeline::new(config(&mock_server, dir.path(), 2)).unwrap();
    let summary = pipeline
        .run(BatchSet::chunked("b", tracking_ids(3), 10).unwrap())
        .await;

    let value = serde_json::to_value(&summary).unwrap();
    assert_eq!(value["partner"], "acme");
    assert_eq!(value["fetch"]["total"], 1);
    assert_eq!(value["parse"]["completed"], 1);
    assert_eq!(value["identifiers_parsed"], 3);
    assert!(value["run_id"].is_string());
}
