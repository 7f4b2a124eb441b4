use chrono::{TimeZone, Utc};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

use openai_usage_exporter::client::UsageClient;
use openai_usage_exporter::collector::{Exporter, Schedule, Scheduler, UsageWindow};
use openai_usage_exporter::config::ApiConfig;
use openai_usage_exporter::dedup::Ledger;
use openai_usage_exporter::metrics::{CostLabels, MetricsSink, UsageLabels};
use openai_usage_exporter::models::{Measure, ResourceType};
use openai_usage_exporter::resolver::NameResolver;

struct Harness {
    server: MockServer,
    exporter: Arc<Exporter>,
    sink: Arc<MetricsSink>,
}

async fn harness(resources: Vec<ResourceType>, track_open_buckets: bool) -> Harness {
    let server = MockServer::start().await;

    Mock::given(method("GET"))
        .and(path("/organization/projects/proj-1"))
        .respond_with(ResponseTemplate::new(200).set_body_json(json!({
            "id": "proj-1",
            "name": "Research"
        })))
        .mount(&server)
        .await;

    let client = UsageClient::new(&ApiConfig {
        secret_key: "sk-test".to_string(),
        organization_id: "org-test".to_string(),
        base_url: server.uri(),
        ..ApiConfig::default()
    })
    .unwrap();

    let sink = Arc::new(MetricsSink::new().unwrap());
    let exporter = Arc::new(Exporter::new(
        client.clone(),
        Arc::new(Ledger::new(track_open_buckets)),
        Arc::new(NameResolver::new(Arc::new(client))),
        sink.clone(),
        "org-test".to_string(),
        resources,
    ));

    Harness {
        server,
        exporter,
        sink,
    }
}

fn usage_page(start: i64, end: i64, input_tokens: u64) -> serde_json::Value {
    json!({
        "object": "page",
        "data": [{
            "object": "bucket",
            "start_time": start,
            "end_time": end,
            "results": [{
                "input_tokens": input_tokens,
                "output_tokens": 0,
                "num_model_requests": 2,
                "project_id": "proj-1",
                "user_id": "user-1",
                "api_key_id": "key-1",
                "model": "gpt-4o",
                "batch": false
            }]
        }],
        "has_more": false
    })
}

async fn mount_usage(server: &MockServer, resource: &str, body: serde_json::Value, times: Option<u64>) {
    let mock = Mock::given(method("GET"))
        .and(path(format!("/organization/usage/{resource}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(body));
    let mock = match times {
        Some(n) => mock.up_to_n_times(n),
        None => mock,
    };
    mock.mount(server).await;
}

fn labels(operation: &str, batch: &str) -> UsageLabels {
    UsageLabels {
        model: "gpt-4o".to_string(),
        operation: operation.to_string(),
        project_id: "proj-1".to_string(),
        project_name: "Research".to_string(),
        user_id: "user-1".to_string(),
        api_key_id: "key-1".to_string(),
        batch: batch.to_string(),
    }
}

const WINDOW: UsageWindow = UsageWindow { start: 0, end: 2000 };

#[tokio::test]
async fn test_closed_bucket_counted_once() {
    let h = harness(vec![ResourceType::Completions], true).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 500), None).await;

    for _ in 0..3 {
        let report = h.exporter.collect_usage(WINDOW, 2000).await;
        assert!(report.all_succeeded());
    }

    let l = labels("completions", "false");
    assert_eq!(h.sink.token_total(&l, Measure::Input), 500.0);
    assert_eq!(h.sink.token_total(&l, Measure::Requests), 2.0);
}

#[tokio::test]
async fn test_open_bucket_publishes_growth() {
    let h = harness(vec![ResourceType::Completions], true).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 100), Some(1)).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 130), None).await;

    h.exporter.collect_usage(WINDOW, 1030).await;
    let l = labels("completions", "false");
    assert_eq!(h.sink.token_total(&l, Measure::Input), 100.0);

    h.exporter.collect_usage(WINDOW, 1045).await;
    assert_eq!(h.sink.token_total(&l, Measure::Input), 130.0);

    // Closing without further growth adds nothing.
    h.exporter.collect_usage(WINDOW, 1100).await;
    assert_eq!(h.sink.token_total(&l, Measure::Input), 130.0);
}

#[tokio::test]
async fn test_closed_only_mode_waits_for_close() {
    let h = harness(vec![ResourceType::Completions], false).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 100), Some(1)).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 130), None).await;

    h.exporter.collect_usage(WINDOW, 1030).await;
    let l = labels("completions", "false");
    assert_eq!(h.sink.token_total(&l, Measure::Input), 0.0);

    h.exporter.collect_usage(WINDOW, 1100).await;
    assert_eq!(h.sink.token_total(&l, Measure::Input), 130.0);
}

#[tokio::test]
async fn test_regression_is_counted_not_published() {
    let h = harness(vec![ResourceType::Completions], true).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 100), Some(1)).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 90), None).await;

    h.exporter.collect_usage(WINDOW, 1030).await;
    h.exporter.collect_usage(WINDOW, 1045).await;

    let l = labels("completions", "false");
    assert_eq!(h.sink.token_total(&l, Measure::Input), 100.0);

    let text = h.sink.render().unwrap();
    assert!(text.contains(r#"openai_exporter_usage_anomalies_total{operation="completions"} 1"#));
}

#[tokio::test]
async fn test_failing_resource_does_not_block_others() {
    let h = harness(vec![ResourceType::Completions, ResourceType::Embeddings], true).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 500), None).await;
    Mock::given(method("GET"))
        .and(path("/organization/usage/embeddings"))
        .respond_with(ResponseTemplate::new(500).set_body_string("upstream unavailable"))
        .mount(&h.server)
        .await;

    let report = h.exporter.collect_usage(WINDOW, 2000).await;

    assert!(!report.all_succeeded());
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, ResourceType::Embeddings);
    assert_eq!(report.succeeded.len(), 1);
    assert_eq!(report.succeeded[0].1.records, 1);

    let l = labels("completions", "false");
    assert_eq!(h.sink.token_total(&l, Measure::Input), 500.0);

    let text = h.sink.render().unwrap();
    assert!(text.contains(r#"openai_exporter_scrape_errors_total{operation="embeddings"} 1"#));
}

#[tokio::test]
async fn test_unresolvable_project_is_unknown() {
    let h = harness(vec![ResourceType::Embeddings], true).await;
    let mut page = usage_page(1000, 1060, 40);
    page["data"][0]["results"][0]["project_id"] = json!("proj-missing");
    page["data"][0]["results"][0]["batch"] = json!(null);
    mount_usage(&h.server, "embeddings", page, None).await;

    let report = h.exporter.collect_usage(WINDOW, 2000).await;
    assert!(report.all_succeeded());

    let l = UsageLabels {
        project_id: "proj-missing".to_string(),
        project_name: "unknown".to_string(),
        ..labels("embeddings", "unknown")
    };
    assert_eq!(h.sink.token_total(&l, Measure::Input), 40.0);
}

#[tokio::test]
async fn test_costs_overwrite_gauge() {
    let h = harness(vec![ResourceType::Completions], true).await;

    let cost_page = |value: f64| {
        json!({
            "object": "page",
            "data": [{
                "start_time": 1_705_276_800,
                "end_time": 1_705_363_200,
                "results": [{
                    "amount": {"value": value, "currency": "usd"},
                    "line_item": "gpt-4o, input",
                    "project_id": "proj-1",
                    "organization_id": null
                }, {
                    "amount": null,
                    "line_item": "gpt-4o, output",
                    "project_id": "proj-1"
                }]
            }],
            "has_more": false
        })
    };

    Mock::given(method("GET"))
        .and(path("/organization/costs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cost_page(1.25)))
        .up_to_n_times(1)
        .mount(&h.server)
        .await;
    Mock::given(method("GET"))
        .and(path("/organization/costs"))
        .respond_with(ResponseTemplate::new(200).set_body_json(cost_page(1.10)))
        .mount(&h.server)
        .await;

    let now = Utc.with_ymd_and_hms(2024, 1, 15, 18, 0, 0).unwrap();
    assert_eq!(h.exporter.collect_costs(now).await.unwrap(), 1);

    let cost = CostLabels {
        date: "2024-01-15".to_string(),
        project_id: "proj-1".to_string(),
        project_name: "Research".to_string(),
        line_item: "gpt-4o, input".to_string(),
        organization_id: "org-test".to_string(),
        currency: "usd".to_string(),
    };
    assert_eq!(h.sink.cost(&cost), 1.25);

    h.exporter.collect_costs(now).await.unwrap();
    assert_eq!(h.sink.cost(&cost), 1.10);
}

#[tokio::test]
async fn test_scheduler_runs_and_stops() {
    let h = harness(vec![ResourceType::Completions], true).await;
    mount_usage(&h.server, "completions", usage_page(1000, 1060, 500), None).await;

    let schedule = Schedule {
        scrape_interval: Duration::from_secs(1),
        query_offset: Duration::from_secs(900),
        ledger_retention: Duration::from_secs(u32::MAX as u64),
        cost_interval: None,
    };
    let scheduler = Scheduler::start(h.exporter.clone(), schedule, CancellationToken::new());

    let l = labels("completions", "false");
    for _ in 0..50 {
        if h.sink.token_total(&l, Measure::Input) > 0.0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    tokio::time::timeout(Duration::from_secs(5), scheduler.shutdown())
        .await
        .expect("scheduler should stop promptly");

    assert_eq!(h.sink.token_total(&l, Measure::Input), 500.0);
    assert!(h
        .sink
        .render()
        .unwrap()
        .contains("openai_exporter_ledger_entries 6"));
}
