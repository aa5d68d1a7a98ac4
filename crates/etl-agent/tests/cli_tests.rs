//! CLI integration tests

use std::fs;
use std::path::Path;
use std::process::{Command, Output};
use tempfile::TempDir;

const CONNECTORS: &str = r#"[
    {"id": "prom", "endpoint": "http://127.0.0.1:9/"},
    {"id": "store", "endpoint": "http://127.0.0.1:9/", "username": "etl", "password": "hunter2"}
]"#;

const CPU_CONFIGURATION: &str = r#"{
    "repeatIntervalMillis": 60000,
    "extract": [{"_type": "static", "series": [{"name": "cpu", "points": [
        {"time": "2024-01-01T00:00:00Z", "value": 95}
    ]}]}],
    "transform": [{"_type": "threshold", "type": "GREATER_THAN_OR_EQUAL",
                   "criticalThreshold": 90, "warningThreshold": 70}],
    "load": [{"_type": "log"}]
}"#;

/// Workspace with a connectors file, a configurations directory and an app config
struct Fixture {
    dir: TempDir,
}

impl Fixture {
    fn new(connectors: &str, configurations: &[(&str, &str)]) -> Self {
        Self::with_settings(connectors, configurations, "")
    }

    /// `global` lines plus any further TOML appended to the app config
    fn with_settings(connectors: &str, configurations: &[(&str, &str)], extra: &str) -> Self {
        let dir = tempfile::tempdir().expect("Failed to create temp dir");
        let configurations_dir = dir.path().join("configurations");
        fs::create_dir(&configurations_dir).unwrap();
        fs::write(dir.path().join("connectors.json"), connectors).unwrap();
        for (name, body) in configurations {
            fs::write(configurations_dir.join(format!("{name}.json")), body).unwrap();
        }

        let app = format!(
            "[global]\nconfigurationsPath = {:?}\nconnectorsPath = {:?}\n{extra}",
            configurations_dir.display().to_string(),
            dir.path().join("connectors.json").display().to_string(),
        );
        fs::write(dir.path().join("etl.toml"), app).unwrap();

        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn run(&self, args: &[&str]) -> Output {
        let config = self.root().join("etl.toml");
        Command::new(env!("CARGO_BIN_EXE_metrics-etl"))
            .arg("--config")
            .arg(config)
            .args(args)
            .env_remove("ETL_CONFIG")
            .env("RUST_LOG", "info")
            .output()
            .expect("Failed to execute command")
    }
}

/// Test that the CLI shows help
#[test]
fn test_cli_help() {
    let output = Command::new(env!("CARGO_BIN_EXE_metrics-etl"))
        .arg("--help")
        .output()
        .expect("Failed to execute command");

    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "CLI help should succeed");
    assert!(stdout.contains("--config"), "Should show config option");
    assert!(stdout.contains("--once"), "Should show once option");
    assert!(stdout.contains("validate"), "Should show validate command");
    assert!(stdout.contains("run"), "Should show run command");
}

#[test]
fn test_validate_accepts_consistent_setup() {
    let fixture = Fixture::new(
        CONNECTORS,
        &[
            ("cpu", CPU_CONFIGURATION),
            (
                "remote",
                r#"{"repeatIntervalMillis": 1000, "disabled": true,
                    "extract": [{"_type": "httpJson", "endpoint": "prom", "path": "/series"}],
                    "load": [{"_type": "httpWebhook", "endpoint": "store", "path": "/hook"}]}"#,
            ),
        ],
    );

    let output = fixture.run(&["validate"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "validate failed: {stdout}");
    assert!(stdout.contains("Connectors: 2"));
    assert!(stdout.contains("Configurations: 2"));
    assert!(stdout.contains("ok    cpu (enabled)"));
    assert!(stdout.contains("ok    remote (disabled)"));
    assert!(!stdout.contains("hunter2"), "Secrets must not be printed");
}

#[test]
fn test_validate_rejects_duplicate_connector() {
    let fixture = Fixture::new(
        r#"[{"id": "a", "endpoint": "http://127.0.0.1:9/"},
            {"id": "a", "endpoint": "http://127.0.0.1:10/"}]"#,
        &[("cpu", CPU_CONFIGURATION)],
    );

    let output = fixture.run(&["validate"]);
    let stderr = String::from_utf8_lossy(&output.stderr);

    assert!(!output.status.success());
    assert!(stderr.contains("duplicate connector id 'a'"), "stderr: {stderr}");
}

#[test]
fn test_validate_reports_unknown_endpoint() {
    let fixture = Fixture::new(
        CONNECTORS,
        &[(
            "orphan",
            r#"{"repeatIntervalMillis": 1000,
                "extract": [{"_type": "httpJson", "endpoint": "missing", "path": "/series"}]}"#,
        )],
    );

    let output = fixture.run(&["validate"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(!output.status.success());
    assert!(stdout.contains("unknown endpoints missing"), "stdout: {stdout}");
}

#[test]
fn test_validate_rejects_malformed_configuration() {
    let fixture = Fixture::new(
        CONNECTORS,
        &[("broken", r#"{"repeatIntervalMillis": 1000, "extract": [{"_type": "ftp"}]}"#)],
    );

    let output = fixture.run(&["validate"]);
    assert!(!output.status.success());
}

#[test]
fn test_run_once_processes_static_configuration() {
    let fixture = Fixture::new(CONNECTORS, &[("cpu", CPU_CONFIGURATION)]);

    let output = fixture.run(&["--once", "run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);

    assert!(output.status.success(), "run failed: {stdout}");
    assert!(stdout.contains("Loaded point"), "Should log the loaded point");
    assert!(stdout.contains("\"metric\":\"cpu\""));
    assert!(stdout.contains("run completed"));
}

#[test]
fn test_cluster_mode_is_rejected() {
    let fixture = Fixture::with_settings(
        CONNECTORS,
        &[("cpu", CPU_CONFIGURATION)],
        "\n[cluster]\nenabled = true\n",
    );

    for args in [&["validate"][..], &["--once", "run"][..]] {
        let output = fixture.run(args);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert!(!output.status.success(), "{args:?} should fail");
        assert!(
            stderr.contains("cluster.enabled is not supported"),
            "stderr: {stderr}"
        );
        assert!(!stdout.contains("Loaded point"), "No cycle may run");
    }
}

#[test]
fn test_run_once_writes_metrics_file() {
    let dir = tempfile::tempdir().unwrap();
    let metrics = dir.path().join("etl.prom");
    let fixture = Fixture::with_settings(
        CONNECTORS,
        &[("cpu", CPU_CONFIGURATION)],
        &format!("metricsFile = {:?}\n", metrics.display().to_string()),
    );

    let output = fixture.run(&["--once", "run"]);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(output.status.success(), "run failed: {stdout}");

    let text = fs::read_to_string(&metrics).expect("Metrics file should exist");
    assert!(text.contains(r#"metrics_etl_cycles_total{configuration="cpu",outcome="success"} 1"#));
}
