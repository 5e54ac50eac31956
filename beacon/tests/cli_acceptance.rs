use beacon_core::dispatch::lock_key;
use beacon_core::{DurableStore, EventQueue, SqliteBackend};
use std::ffi::OsString;
use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};
use std::sync::Arc;
use tempfile::TempDir;

struct CliTestEnv {
    _temp_dir: TempDir,
    home: PathBuf,
    xdg_data: PathBuf,
    xdg_config: PathBuf,
    xdg_state: PathBuf,
    xdg_runtime: PathBuf,
}

impl CliTestEnv {
    fn new() -> Self {
        let temp_dir = TempDir::new().expect("failed to create temp dir");
        let base = temp_dir.path().to_path_buf();
        let home = base.join("home");
        let xdg_data = base.join("xdg-data");
        let xdg_config = base.join("xdg-config");
        let xdg_state = base.join("xdg-state");
        let xdg_runtime = base.join("xdg-runtime");

        for dir in [&home, &xdg_data, &xdg_config, &xdg_state, &xdg_runtime] {
            fs::create_dir_all(dir).expect("failed to create test directory");
        }

        Self {
            _temp_dir: temp_dir,
            home,
            xdg_data,
            xdg_config,
            xdg_state,
            xdg_runtime,
        }
    }

    /// Environment with a configured app pointing at a closed local port
    fn configured() -> Self {
        let env = Self::new();
        env.write_config(
            r#"
[app]
app_id = "app1"
api_write_key = "wk_test"
api_server = "http://127.0.0.1:9"

[dispatch]
interval_secs = 30
timeout_secs = 5
"#,
        );
        env
    }

    fn write_config(&self, contents: &str) {
        let dir = self.xdg_config.join("beacon");
        fs::create_dir_all(&dir).expect("failed to create config dir");
        fs::write(dir.join("config.toml"), contents).expect("failed to write config");
    }

    fn store_path(&self) -> PathBuf {
        self.xdg_data.join("beacon/store.db")
    }

    fn open_store(&self) -> Arc<DurableStore> {
        let backend = SqliteBackend::open(&self.store_path()).expect("failed to open store");
        Arc::new(DurableStore::new(Arc::new(backend)))
    }
}

fn run(env: &CliTestEnv, args: &[&str]) -> Output {
    let mut command = Command::new(assert_cmd::cargo::cargo_bin!("beacon"));

    command
        .args(args)
        .env_remove("RUST_LOG")
        .env("HOME", &env.home)
        .env("XDG_DATA_HOME", &env.xdg_data)
        .env("XDG_CONFIG_HOME", &env.xdg_config)
        .env("XDG_STATE_HOME", &env.xdg_state)
        .env("XDG_RUNTIME_DIR", &env.xdg_runtime)
        .output()
        .unwrap_or_else(|e| panic!("failed to execute beacon: {e}"))
}

fn assert_success(args: &[&str], output: &Output) {
    if output.status.success() {
        return;
    }

    let rendered_args = args
        .iter()
        .map(|arg| OsString::from(arg).to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join(" ");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    panic!(
        "beacon {rendered_args} failed\nstatus: {}\nstdout:\n{}\nstderr:\n{}",
        output.status, stdout, stderr
    );
}

fn run_ok(env: &CliTestEnv, args: &[&str]) -> String {
    let output = run(env, args);
    assert_success(args, &output);
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn status_without_config_reports_not_ready() {
    let env = CliTestEnv::new();

    let stdout = run_ok(&env, &["status"]);

    assert!(stdout.contains("App ID:          <not set>"), "{stdout}");
    assert!(stdout.contains("Status: Not ready"), "{stdout}");
    assert!(!env.store_path().exists());
}

#[test]
fn track_without_credentials_fails() {
    let env = CliTestEnv::new();

    let output = run(&env, &["track", "load"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("app_id"), "{stderr}");
}

#[test]
fn track_rejects_non_object_payload() {
    let env = CliTestEnv::configured();

    let output = run(&env, &["track", "load", "[1, 2]"]);

    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("must be a JSON object"), "{stderr}");
}

#[test]
fn track_queues_events_that_status_reports() {
    let env = CliTestEnv::configured();

    let stdout = run_ok(&env, &["track", "load", r#"{"a": 1}"#]);
    assert!(stdout.contains("Queued event in 'load' (1 pending)"), "{stdout}");
    run_ok(&env, &["track", "tap"]);

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Status: Ready"), "{stdout}");
    assert!(stdout.contains("Queued Events:   2"), "{stdout}");
    assert!(stdout.contains("  - load: 1"), "{stdout}");
    assert!(stdout.contains("  - tap: 1"), "{stdout}");
    assert!(stdout.contains("Dispatch Lock:   clear"), "{stdout}");

    let queue = EventQueue::new(env.open_store(), "app1");
    let snapshot = queue.snapshot();
    let event = &snapshot.get("load").unwrap()[0];
    assert_eq!(event.payload["a"], serde_json::json!(1));
    assert_eq!(event.payload["_app"], serde_json::json!({"app_id": "app1"}));
}

#[test]
fn flush_keeps_events_when_collector_is_unreachable() {
    let env = CliTestEnv::configured();
    run_ok(&env, &["track", "load"]);

    let stdout = run_ok(&env, &["flush"]);

    assert!(stdout.contains("Kept 1 event(s) for retry"), "{stdout}");
    assert!(stdout.contains("Pending:         1"), "{stdout}");
}

#[test]
fn flush_with_empty_queue_sends_nothing() {
    let env = CliTestEnv::configured();

    let stdout = run_ok(&env, &["flush"]);

    assert!(stdout.contains("Nothing to send"), "{stdout}");
}

#[test]
fn recover_discards_events_after_interrupted_dispatch() {
    let env = CliTestEnv::configured();
    run_ok(&env, &["track", "load"]);
    run_ok(&env, &["track", "load"]);
    env.open_store()
        .put(&lock_key("app1"), &"locked")
        .expect("failed to seed lock flag");

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("stale (interrupted dispatch"), "{stdout}");

    let stdout = run_ok(&env, &["recover"]);
    assert!(
        stdout.contains("Previous dispatch was interrupted; discarded 2 event(s)"),
        "{stdout}"
    );

    let stdout = run_ok(&env, &["status"]);
    assert!(stdout.contains("Queued Events:   0"), "{stdout}");
    assert!(stdout.contains("Dispatch Lock:   clear"), "{stdout}");

    let stdout = run_ok(&env, &["recover"]);
    assert!(stdout.contains("No interrupted dispatch found"), "{stdout}");
}

#[test]
fn flush_recovers_interrupted_dispatch() {
    let env = CliTestEnv::configured();
    run_ok(&env, &["track", "load"]);
    env.open_store()
        .put(&lock_key("app1"), &"locked")
        .expect("failed to seed lock flag");

    let stdout = run_ok(&env, &["flush"]);

    assert!(stdout.contains("discarded 1 event(s)"), "{stdout}");
    assert!(stdout.contains("Pending:         0"), "{stdout}");
}

#[test]
fn disabled_interval_sends_without_queueing() {
    let env = CliTestEnv::new();
    env.write_config(
        r#"
[app]
app_id = "app1"
api_write_key = "wk_test"
api_server = "http://127.0.0.1:9"

[dispatch]
interval_secs = 0
timeout_secs = 5
"#,
    );

    let stdout = run_ok(&env, &["track", "load"]);

    assert!(stdout.contains("directly"), "{stdout}");
    assert!(EventQueue::new(env.open_store(), "app1").is_empty());
}
