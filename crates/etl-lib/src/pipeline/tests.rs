//! Cross-component tests for cycles and the scheduler
//!
//! HTTP endpoints are served by mockito; everything else runs in process.

use super::*;
use crate::client::ClientConstructor;
use crate::cluster::{ClusterConfig, ClusterCoordinator, LocalCluster, MemberConfig};
use crate::connector::{Connector, ConnectorRegistry, ConnectorSource};
use crate::error::EtlError;
use crate::metering::ProcessStatus;
use crate::models::Severity;
use mockito::{Matcher, Server};
use std::sync::Mutex;

const SERIES_BODY: &str = r#"[
    {"name": "cpu", "tags": {"host": "web-1"}, "points": [
        {"time": "2024-01-01T00:00:00Z", "value": 40},
        {"time": "2024-01-01T00:01:00Z", "value": 95}
    ]}
]"#;

fn http_constructor() -> ClientConstructor<HttpClient> {
    Arc::new(|connector: &Connector| -> anyhow::Result<HttpClient> {
        HttpClient::from_connector(connector)
    })
}

fn registry(endpoints: &[(&str, &str)]) -> Arc<ConnectorRegistry> {
    let connectors = endpoints
        .iter()
        .map(|(id, url)| Connector::new(*id, url::Url::parse(url).unwrap()))
        .collect();
    Arc::new(ConnectorRegistry::new(vec![ConnectorSource::new("test", connectors)]).unwrap())
}

fn pipeline_with(registry: Arc<ConnectorRegistry>, constructor: ClientConstructor<HttpClient>) -> Arc<Pipeline> {
    Arc::new(Pipeline::new(
        Arc::new(HttpClientFactory::new(registry, constructor)),
        Arc::new(SystemStatus::default()),
        ShutdownSequence::new(),
        PipelineOptions::default(),
    ))
}

fn pipeline(registry: Arc<ConnectorRegistry>) -> Arc<Pipeline> {
    pipeline_with(registry, http_constructor())
}

fn configuration(json: &str) -> Configuration {
    parse_configuration(json.as_bytes(), "test").unwrap()
}

const STATIC_CPU: &str = r#"{
    "repeatIntervalMillis": 100,
    "extract": [{"_type": "static", "series": [{"name": "cpu", "points": [
        {"time": "2024-01-01T00:00:00Z", "value": 7}
    ]}]}],
    "transform": [{"_type": "threshold", "type": "GREATER_THAN_OR_EQUAL",
                   "criticalThreshold": 10, "warningThreshold": 5}],
    "load": [{"_type": "log"}]
}"#;

#[tokio::test]
async fn test_static_cycle_classifies_and_logs() {
    let pipeline = pipeline(registry(&[]));
    let states = CycleStates::new();

    let outcome = pipeline
        .run_cycle(&configuration(STATIC_CPU), &states)
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.points_extracted, 1);
    assert_eq!(outcome.points_loaded, 1);
    assert_eq!(outcome.matrix[0][0].value, Severity::Warn.value());
    assert_eq!(outcome.matrix[0][0].original_value, 7.0);
    assert_eq!(states.get("test"), Some(CycleState::Idle));
    assert_eq!(
        pipeline.status().current_count("load.log", ProcessStatus::Succeeded),
        1
    );
}

#[tokio::test]
async fn test_http_extract_is_cached() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/").with_status(200).create_async().await;
    let series = server
        .mock("GET", "/series")
        .match_query(Matcher::UrlEncoded("metric".into(), "cpu".into()))
        .with_status(200)
        .with_header("content-type", "application/json")
        .with_body(SERIES_BODY)
        .expect(1)
        .create_async()
        .await;

    let pipeline = pipeline(registry(&[("api", &server.url())]));
    let config = configuration(
        r#"{
            "repeatIntervalMillis": 1000,
            "extract": [{"_type": "httpJson", "endpoint": "api", "path": "/series",
                         "query": {"metric": "cpu"}, "cacheTtlMillis": 60000}],
            "load": [{"_type": "log"}]
        }"#,
    );
    let states = CycleStates::new();

    let first = pipeline.run_cycle(&config, &states).await.unwrap();
    let second = pipeline.run_cycle(&config, &states).await.unwrap();

    assert!(first.success && second.success);
    assert_eq!(first.points_extracted, 2);
    assert_eq!(first.matrix, second.matrix);
    assert_eq!(first.matrix[0][1].metadata.tags.get("host").map(String::as_str), Some("web-1"));
    assert_eq!(
        pipeline.status().current_count("extract.api", ProcessStatus::Succeeded),
        2
    );
    series.assert_async().await;
}

#[tokio::test]
async fn test_missing_connector_is_isolated() {
    let pipeline = pipeline(registry(&[]));
    let config = configuration(
        r#"{
            "repeatIntervalMillis": 1000,
            "extract": [
                {"_type": "httpJson", "endpoint": "nowhere", "path": "/series"},
                {"_type": "static", "series": [{"name": "up", "points": [{"time": "2024-01-01T00:00:00Z", "value": 1}]}]}
            ],
            "load": [{"_type": "log"}]
        }"#,
    );

    let outcome = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(outcome.failed_endpoints, vec!["nowhere"]);
    assert_eq!(outcome.points_loaded, 1);
    assert_eq!(
        pipeline.status().current_count("extract.nowhere", ProcessStatus::Failed),
        1
    );
}

#[tokio::test]
async fn test_rejected_credentials_skip_endpoint() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/").with_status(401).create_async().await;
    let series = server
        .mock("GET", "/series")
        .match_query(Matcher::Any)
        .expect(0)
        .create_async()
        .await;

    let pipeline = pipeline(registry(&[("api", &server.url())]));
    let config = configuration(
        r#"{
            "repeatIntervalMillis": 1000,
            "extract": [{"_type": "httpJson", "endpoint": "api", "path": "/series"}]
        }"#,
    );

    let outcome = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap();

    assert!(!outcome.success);
    assert_eq!(
        pipeline
            .status()
            .current_count("extract.api", ProcessStatus::AuthenticationFailure),
        1
    );
    series.assert_async().await;
}

#[tokio::test]
async fn test_empty_response_is_no_data() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/").with_status(200).create_async().await;
    server
        .mock("GET", "/series")
        .match_query(Matcher::Any)
        .with_status(200)
        .with_body("[]")
        .create_async()
        .await;

    let pipeline = pipeline(registry(&[("api", &server.url())]));
    let config = configuration(
        r#"{"repeatIntervalMillis": 1000,
            "extract": [{"_type": "httpJson", "endpoint": "api", "path": "/series"}]}"#,
    );

    let outcome = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert!(outcome.matrix.is_empty());
    assert_eq!(
        pipeline.status().current_count("extract.api", ProcessStatus::NoData),
        1
    );
}

#[tokio::test]
async fn test_client_construction_failure_is_bootstrap_error() {
    let constructor: ClientConstructor<HttpClient> =
        Arc::new(|_: &Connector| -> anyhow::Result<HttpClient> { anyhow::bail!("no trust store") });
    let pipeline = pipeline_with(registry(&[("api", "http://localhost:1")]), constructor);
    let config = configuration(
        r#"{"repeatIntervalMillis": 1000,
            "extract": [{"_type": "httpJson", "endpoint": "api", "path": "/series"}]}"#,
    );

    let err = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap_err();
    assert!(matches!(err, BootstrapError::ClientConstruction { ref endpoint, .. } if endpoint == "api"));
}

#[tokio::test]
async fn test_webhook_receives_classified_matrix() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/").with_status(200).create_async().await;
    let hook = server
        .mock("POST", "/hook")
        .match_body(Matcher::AllOf(vec![
            Matcher::Regex(r#""name":"cpu""#.to_string()),
            Matcher::Regex(r#""value":2\.0"#.to_string()),
            Matcher::Regex(r#""originalValue":7\.0"#.to_string()),
        ]))
        .with_status(204)
        .expect(1)
        .create_async()
        .await;

    let pipeline = pipeline(registry(&[("alerts", &server.url())]));
    let mut config = configuration(STATIC_CPU);
    config.load = vec![LoadSpec::HttpWebhook(HttpWebhookLoad {
        endpoint: "alerts".to_string(),
        path: "/hook".to_string(),
    })];

    let outcome = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.points_loaded, 1);
    hook.assert_async().await;
}

#[tokio::test]
async fn test_bulk_load_respects_batch_size() {
    let mut server = Server::new_async().await;
    server.mock("GET", "/").with_status(200).create_async().await;
    let bulk = server
        .mock("POST", "/bulk")
        .with_status(200)
        .expect(3)
        .create_async()
        .await;

    let pipeline = pipeline(registry(&[("store", &server.url())]));
    let config = configuration(
        r#"{
            "repeatIntervalMillis": 1000,
            "extract": [{"_type": "static", "series": [{"name": "q", "points": [
                {"time": "2024-01-01T00:00:00Z", "value": 1},
                {"time": "2024-01-01T00:00:01Z", "value": 2},
                {"time": "2024-01-01T00:00:02Z", "value": 3},
                {"time": "2024-01-01T00:00:03Z", "value": 4},
                {"time": "2024-01-01T00:00:04Z", "value": 5}
            ]}]}],
            "load": [{"_type": "httpBulk", "endpoint": "store", "path": "/bulk", "batchSize": 2}]
        }"#,
    );

    let outcome = pipeline
        .run_cycle(&config, &CycleStates::new())
        .await
        .unwrap();

    assert!(outcome.success);
    assert_eq!(outcome.points_loaded, 5);
    assert_eq!(
        pipeline.status().current_count("load.store", ProcessStatus::Succeeded),
        3
    );
    bulk.assert_async().await;
}

fn fixed_source(configurations: Vec<Configuration>) -> Arc<dyn ConfigurationSource> {
    Arc::new(move || -> anyhow::Result<Vec<Configuration>> { Ok(configurations.clone()) })
}

fn once() -> SchedulerConfig {
    SchedulerConfig {
        run_once: true,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_run_once_skips_disabled() {
    let pipeline = pipeline(registry(&[]));
    let enabled = configuration(STATIC_CPU);
    let mut disabled = configuration(STATIC_CPU);
    disabled.name = "disabled".to_string();
    disabled.disabled = true;

    let scheduler = Scheduler::new(
        Arc::clone(&pipeline),
        fixed_source(vec![enabled, disabled]),
        Arc::new(ClusterCoordinator::standalone("solo")),
        once(),
    );
    tokio_test::assert_ok!(scheduler.run().await);

    assert_eq!(
        pipeline.status().current_count("extract.static", ProcessStatus::Succeeded),
        1
    );
}

#[tokio::test]
async fn test_non_master_runs_nothing() {
    let pipeline = pipeline(registry(&[]));
    let hub = LocalCluster::new();
    let enabled = ClusterConfig {
        enabled: true,
        config: MemberConfig::default(),
    };
    let leader = ClusterCoordinator::new(&enabled, "leader", Arc::new(hub.member("leader")));
    let follower = ClusterCoordinator::new(&enabled, "follower", Arc::new(hub.member("follower")));
    leader.initialize(&ShutdownSequence::new()).unwrap();
    follower.initialize(&ShutdownSequence::new()).unwrap();

    let scheduler = Scheduler::new(
        Arc::clone(&pipeline),
        fixed_source(vec![configuration(STATIC_CPU)]),
        Arc::new(follower),
        once(),
    );
    scheduler.run().await.unwrap();

    assert_eq!(
        pipeline.status().current_count("extract.static", ProcessStatus::Succeeded),
        0
    );
}

#[tokio::test]
async fn test_bootstrap_failure_stops_scheduler() {
    let constructor: ClientConstructor<HttpClient> =
        Arc::new(|_: &Connector| -> anyhow::Result<HttpClient> { anyhow::bail!("bad keystore") });
    let pipeline = pipeline_with(registry(&[("api", "http://localhost:1")]), constructor);
    let config = configuration(
        r#"{"repeatIntervalMillis": 50,
            "extract": [{"_type": "httpJson", "endpoint": "api", "path": "/series"}]}"#,
    );

    let scheduler = Scheduler::new(
        pipeline,
        fixed_source(vec![config]),
        Arc::new(ClusterCoordinator::standalone("solo")),
        SchedulerConfig::default(),
    );

    let err = tokio::time::timeout(Duration::from_secs(5), scheduler.run())
        .await
        .expect("scheduler should stop on its own")
        .unwrap_err();
    assert!(matches!(err, EtlError::Bootstrap(BootstrapError::ClientConstruction { .. })));
}

#[tokio::test]
async fn test_initial_load_failure_is_returned() {
    let source: Arc<dyn ConfigurationSource> =
        Arc::new(|| -> anyhow::Result<Vec<Configuration>> { anyhow::bail!("unreadable") });
    let scheduler = Scheduler::new(
        pipeline(registry(&[])),
        source,
        Arc::new(ClusterCoordinator::standalone("solo")),
        SchedulerConfig::default(),
    );

    assert!(matches!(
        scheduler.run().await,
        Err(EtlError::Configuration(_))
    ));
}

#[tokio::test(start_paused = true)]
async fn test_periodic_cycles_until_shutdown() {
    let pipeline = pipeline(registry(&[]));
    let shutdown = pipeline.shutdown().clone();
    let scheduler = Scheduler::new(
        Arc::clone(&pipeline),
        fixed_source(vec![configuration(STATIC_CPU)]),
        Arc::new(ClusterCoordinator::standalone("solo")),
        SchedulerConfig::default(),
    );
    let states = scheduler.states();

    let handle = tokio::spawn(scheduler.run());
    tokio::time::sleep(Duration::from_millis(350)).await;

    // Ticks at 0, 100, 200 and 300 ms
    assert_eq!(
        pipeline.status().current_count("extract.static", ProcessStatus::Succeeded),
        4
    );
    assert_eq!(states.get("test"), Some(CycleState::Idle));

    shutdown.signal();
    handle.await.unwrap().unwrap();
    assert!(states.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_reload_replaces_configurations() {
    let current = Arc::new(Mutex::new(vec![configuration(STATIC_CPU)]));
    let source: Arc<dyn ConfigurationSource> = {
        let current = Arc::clone(&current);
        Arc::new(move || -> anyhow::Result<Vec<Configuration>> {
            Ok(current.lock().unwrap().clone())
        })
    };

    let pipeline = pipeline(registry(&[]));
    let shutdown = pipeline.shutdown().clone();
    let scheduler = Scheduler::new(
        Arc::clone(&pipeline),
        source,
        Arc::new(ClusterCoordinator::standalone("solo")),
        SchedulerConfig {
            update_interval: Duration::from_secs(1),
            run_once: false,
        },
    );
    let states = scheduler.states();
    let handle = tokio::spawn(scheduler.run());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(states.get("test").is_some());

    let mut renamed = configuration(STATIC_CPU);
    renamed.name = "renamed".to_string();
    *current.lock().unwrap() = vec![renamed];

    tokio::time::sleep(Duration::from_millis(1_100)).await;
    assert!(states.get("test").is_none());
    assert!(states.get("renamed").is_some());

    shutdown.signal();
    handle.await.unwrap().unwrap();
}
