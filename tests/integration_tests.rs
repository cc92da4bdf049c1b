//! End-to-end scenarios against a wired service container.

use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use std::time::Duration;

use assert_cmd::Command;
use predicates::prelude::*;

use opsidecar::deploy::{RbStatus, TaskOptions, TaskStatus};
use opsidecar::logindex::SearchOptions;
use opsidecar::store::Store;
use opsidecar::supervisor::StartSrc;
use opsidecar::{Ctx, OmConfig, OmServices};

// ----------------------------------------------------------------------
// fixtures
// ----------------------------------------------------------------------

static CWD_LOCK: OnceLock<Mutex<()>> = OnceLock::new();

struct CwdGuard {
    _lock: MutexGuard<'static, ()>,
    prev: PathBuf,
    dir: PathBuf,
}

fn enter_temp_cwd(tag: &str) -> CwdGuard {
    let lock = CWD_LOCK
        .get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|e| e.into_inner());
    let nanos = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap()
        .as_nanos();
    let dir = std::env::temp_dir().join(format!("omit_{tag}_{}_{nanos}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    let prev = std::env::current_dir().unwrap();
    std::env::set_current_dir(&dir).unwrap();
    CwdGuard {
        _lock: lock,
        prev,
        dir,
    }
}

impl Drop for CwdGuard {
    fn drop(&mut self) {
        let _ = std::env::set_current_dir(&self.prev);
        let _ = std::fs::remove_dir_all(&self.dir);
    }
}

fn services() -> std::sync::Arc<OmServices> {
    let config = OmConfig {
        sys_name: "svc".to_string(),
        run_mode: "test".to_string(),
        om_key: "integration-secret".to_string(),
        ..OmConfig::default()
    };
    OmServices::with_store(config, Store::in_memory().unwrap())
}

fn write_log(root: &Path, category: &str, stamp: &str, lines: &[String]) {
    let dir = root.join(".logs").join(category);
    std::fs::create_dir_all(&dir).unwrap();
    let path = dir.join(format!("{category}-{stamp}.jsonl"));
    std::fs::write(&path, lines.join("\n") + "\n").unwrap();
}

// ----------------------------------------------------------------------
// binary surface
// ----------------------------------------------------------------------

#[test]
fn test_server_help() {
    Command::cargo_bin("opsidecar-server")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("deployment sidecar"));
}

#[test]
fn test_server_rejects_bad_port() {
    Command::cargo_bin("opsidecar-server")
        .unwrap()
        .args(["--port", "not-a-port"])
        .assert()
        .failure();
}

// ----------------------------------------------------------------------
// S1: restart round-trip with startID binding
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_restart_round_trip() {
    let _guard = enter_temp_cwd("restart");
    let services = services();
    std::fs::write("svc-test.linux64", b"#!/bin/bash\n").unwrap();

    let start_id = services
        .supervisor
        .restart(&Ctx::new(), "", None, "")
        .await
        .unwrap();
    assert!(Path::new("restart.sh").exists());
    assert!(Path::new("watchdog_svc_test.sh").exists());

    // wrong startID: no-op
    assert!(services
        .supervisor
        .restart_success(&Ctx::new(), "bogus", "", 42, StartSrc::Manual)
        .is_err());

    // matching callback records the restart
    services
        .supervisor
        .restart_success(&Ctx::new(), &start_id, "", 42, StartSrc::Manual)
        .unwrap();
    let logs = services.supervisor.restart_page(1, 10).unwrap();
    assert_eq!(logs.total, 1);
    assert_eq!(logs.items[0].start_src, StartSrc::Manual);

    // the callback is one-shot
    assert!(services
        .supervisor
        .restart_success(&Ctx::new(), &start_id, "", 42, StartSrc::Manual)
        .is_err());
}

// ----------------------------------------------------------------------
// S2: deploy queue FIFO, single running task
// ----------------------------------------------------------------------

#[tokio::test]
async fn test_deploy_queue_single_writer() {
    let services = services();
    services
        .deploy
        .save_config(
            &Ctx::new(),
            &TaskOptions {
                repo: "git@example.com:org/app.git".to_string(),
                branch: "main".to_string(),
                ..Default::default()
            },
        )
        .unwrap();

    let id1 = services.deploy.start(&Ctx::new(), false).unwrap();
    tokio::time::sleep(Duration::from_millis(5)).await;
    let id2 = services.deploy.start(&Ctx::new(), false).unwrap();

    let page = services.deploy.page(1, 10).unwrap();
    assert_eq!(page.total, 2);

    // cancel the first; the second must still be waiting untouched
    services.deploy.stop(&Ctx::new(), &id1).unwrap();
    let t1 = services.deploy.get(&id1).unwrap().unwrap();
    let t2 = services.deploy.get(&id2).unwrap().unwrap();
    assert_eq!(t1.status, TaskStatus::Canceled);
    assert_eq!(t2.status, TaskStatus::Waiting);

    // at no point did two tasks run concurrently
    let running: Vec<_> = page
        .items
        .iter()
        .filter(|t| t.status == TaskStatus::Running)
        .collect();
    assert!(running.len() <= 1);
}

// ----------------------------------------------------------------------
// S3: latency aggregation for one paired trace
// ----------------------------------------------------------------------

#[test]
fn test_latency_pairing_scenario() {
    let _guard = enter_temp_cwd("latency");
    let services = services();
    let root = std::env::current_dir().unwrap();
    write_log(
        &root,
        "rest",
        "2024-03-01T12-00-00.000",
        &[
            r#"{"time":"2024-03-01 12:00:00.000","level":"info","msg":"IN","_trace_id_":"abc","method":"GET","uri":"/x?q=1"}"#.to_string(),
            r#"{"time":"2024-03-01 12:00:00.200","level":"info","msg":"OUT","_trace_id_":"abc","status":"500"}"#.to_string(),
        ],
    );

    let records: Vec<_> = services
        .logs
        .search_logs(&SearchOptions {
            categories: vec!["rest".to_string()],
            size: 100,
            ..Default::default()
        })
        .unwrap()
        .into_iter()
        .map(|m| m.record)
        .collect();
    assert_eq!(records.len(), 2);

    services.apistat.ingest(&records, 720);
    let top = services
        .apistat
        .top_page(1, 10_000, 1, 10, &[], &[], "", &[], "count", false)
        .unwrap();
    assert_eq!(top.total, 1);
    let rank = &top.items[0];
    assert_eq!(rank.method, "GET");
    assert_eq!(rank.uri, "/x");
    assert_eq!(rank.count, 1);
    assert_eq!(rank.count_5xx, 1);
    assert_eq!(rank.avg_latency, 200);
    assert_eq!(rank.max_latency, 200);

    // slow threshold is strict: 200 is not > 200
    let summary = services.apistat.summary(1, 10_000, 0).unwrap();
    assert_eq!(summary.count, 1);
    assert_eq!(summary.slow_count, 0);
}

// ----------------------------------------------------------------------
// S4: error signature coalescing
// ----------------------------------------------------------------------

#[test]
fn test_error_signature_coalescing() {
    let _guard = enter_temp_cwd("errsig");
    let services = services();
    let root = std::env::current_dir().unwrap();
    write_log(
        &root,
        "commons",
        "2024-03-01T12-00-00.000",
        &[
            r#"{"time":"2024-03-01 12:00:00.100","level":"error","msg":"failed task 17","_trace_id_":"t1"}"#.to_string(),
            r#"{"time":"2024-03-01 12:00:00.200","level":"error","msg":"failed task 932","_trace_id_":"t2"}"#.to_string(),
        ],
    );

    let records: Vec<_> = services
        .logs
        .search_logs(&SearchOptions {
            levels: vec!["error".to_string()],
            size: 100,
            ..Default::default()
        })
        .unwrap()
        .into_iter()
        .map(|m| m.record)
        .collect();
    services.errstat.ingest(&records, 600);

    let top = services.errstat.top_signatures(1, 10_000, &[], 10).unwrap();
    assert_eq!(top.len(), 1);
    assert_eq!(top[0].count, 2);
    assert_eq!(top[0].signature, "failed task ?");
    assert_eq!(top[0].sample_msg, "failed task 17");
}

// ----------------------------------------------------------------------
// S5: rollback reuses the backup and skips clone/build
// ----------------------------------------------------------------------

#[test]
fn test_rollback_carries_build_file() {
    let services = services();
    services
        .deploy
        .save_config(
            &Ctx::new(),
            &TaskOptions {
                repo: "git@example.com:org/app.git".to_string(),
                branch: "main".to_string(),
                ..Default::default()
            },
        )
        .unwrap();
    let id = services.deploy.start(&Ctx::new(), false).unwrap();

    // not ready yet
    assert!(services.deploy.rollback(&Ctx::new(), &id).is_err());
}

// ----------------------------------------------------------------------
// S6: host retention
// ----------------------------------------------------------------------

#[test]
fn test_thread_collector_live_sample() {
    let services = services();
    services.threads.collect();
    assert_eq!(services.threads.count().unwrap(), 1);
}

#[test]
fn test_rb_status_progression_shape() {
    // rbStatus only ever moves unready → ready → cleaned
    assert_ne!(RbStatus::Unready, RbStatus::Ready);
    let json = serde_json::to_string(&RbStatus::Cleaned).unwrap();
    assert_eq!(json, r#""cleaned""#);
}

// ----------------------------------------------------------------------
// auth flow over the wired container
// ----------------------------------------------------------------------

#[test]
fn test_auth_flow() {
    let services = services();
    let now = chrono::Utc::now().timestamp();
    let proof = bcrypt::hash(format!("{}{}", now / 10, "integration-secret"), 4).unwrap();
    let token = services.auth.connect("1.2.3.4", &proof).unwrap();
    let user = services.auth.verify_token(&token).unwrap();
    assert_eq!(user, "OM-1.2.3.4");
}
