//! Self-supervising restart pipeline.
//!
//! `restart` hands the actual process swap to a detached `restart.sh`: the
//! script stops the old binary, starts the new one and polls the loopback
//! `/om/app/restarted` callback until the replacement confirms liveness.
//! The persisted startID is the sole coordination token between the restart
//! call and the callback; only the matching callback may complete.
//!
//! Detached children are intentionally not cancelled by any context — they
//! supervise this binary's replacement and must outlive the caller.

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fmt;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use tracing::{error, info};

use crate::command::{CmdRunner, RunOpts};
use crate::config::OmConfig;
use crate::ctx::Ctx;
use crate::error::{OmError, OmResult};
use crate::pubsub::{PubSub, TOPIC_RUN_STARTED};
use crate::store::{KvStore, PageCache, Pager, Record, Sorter, Store};

const START_ID_KEY: &str = "app_start_id";
const CRASH_LOG_TAIL_LINES: usize = 300;

pub type ProgressFn = Arc<dyn Fn(String) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartSrc {
    Manual,
    Deploy,
    Crash,
}

impl fmt::Display for StartSrc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StartSrc::Manual => write!(f, "manual"),
            StartSrc::Deploy => write!(f, "deploy"),
            StartSrc::Crash => write!(f, "crash"),
        }
    }
}

impl StartSrc {
    pub fn parse(s: &str) -> Self {
        match s {
            "deploy" => Self::Deploy,
            "crash" => Self::Crash,
            _ => Self::Manual,
        }
    }
}

/// Append-only record of every restart attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RestartLog {
    pub start_time: i64,
    pub start_src: StartSrc,
    pub log: String,
}

impl Record for RestartLog {
    const TABLE: &'static str = "restart_log";
}

pub fn render_restart_script(run_file: &str, run_mode: &str, callback_url: &str) -> String {
    format!(
        r#"#!/bin/bash
SRC=${{1:-manual}}
echo "Service restarting..."
echo "Stopping service..."
pkill -15 -f {run_file}
timeout=0
while pgrep -f {run_file} > /dev/null; do
    echo "Waiting for the service to stop..."
    timeout=$((timeout+1))
    if [ $timeout -gt 10 ]; then
        echo "Service stop failed. Force stop."
        pkill -9 -f {run_file}
        break
    fi
    sleep 1
done
echo "Service stopped."
echo "Starting service..."
export GORIG_SYS_MODE={run_mode}
nohup ./{run_file} > nohup.out 2>&1 &
pid=$!
echo "Service started with PID: $pid"
elapsed=0
delay=1
while true; do
    code=$(curl -s -o /dev/null -w "%{{http_code}}" "{callback_url}&pid=$pid&src=$SRC")
    if [ "$code" = "200" ]; then
        echo "Service restarted."
        exit 0
    fi
    sleep $delay
    elapsed=$((elapsed+delay))
    if [ $delay -lt 8 ]; then
        delay=$((delay*2))
    fi
    if [ $elapsed -ge 120 ]; then
        echo "Restart callback timed out."
        exit 1
    fi
done
"#
    )
}

pub fn render_watchdog_script(run_file: &str) -> String {
    format!(
        r#"#!/bin/bash
echo "Watchdog started at: $(date)"
while true; do
    if ! pgrep -f {run_file} > /dev/null; then
        echo "Service is not running. Restarting..."
        mkdir -p restart_logs
        cp nohup.out restart_logs/auto_restart_$(date +%Y%m%d%H%M%S).log
        ./restart.sh crash
    fi
    sleep 5
done
"#
    )
}

pub fn render_stop_script(run_file: &str, watchdog_file: &str) -> String {
    format!(
        r#"#!/bin/bash
echo "Stopping watchdog service..."
pkill -9 -f {watchdog_file}
echo "Stopping service..."
pkill -15 -f {run_file}
echo "Service stopped."
"#
    )
}

fn write_script(path: &Path, content: &str) -> OmResult<()> {
    std::fs::write(path, content)
        .map_err(|e| OmError::verify(format!("write {}: {e}", path.display())))?;
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755))
        .map_err(|e| OmError::verify(format!("chmod {}: {e}", path.display())))?;
    Ok(())
}

/// Launch a script detached: new process group, stdio redirected away from
/// this process, never waited on.
fn spawn_detached(script: &str, args: &[&str], stdout_file: Option<&str>) -> OmResult<()> {
    use std::os::unix::process::CommandExt;
    let (out, err): (Stdio, Stdio) = match stdout_file {
        Some(path) => {
            let f = std::fs::File::create(path)
                .map_err(|e| OmError::sys(format!("create {path}: {e}")))?;
            let f2 = f
                .try_clone()
                .map_err(|e| OmError::sys(format!("clone handle: {e}")))?;
            (Stdio::from(f), Stdio::from(f2))
        }
        None => (Stdio::null(), Stdio::null()),
    };
    std::process::Command::new("bash")
        .arg(script)
        .args(args)
        .stdin(Stdio::null())
        .stdout(out)
        .stderr(err)
        .process_group(0)
        .spawn()
        .map_err(|e| OmError::sys(format!("spawn {script}: {e}")))?;
    Ok(())
}

pub struct AppSupervisor {
    config: OmConfig,
    kv: KvStore,
    logs: Pager<RestartLog>,
    bus: PubSub,
    cmd: CmdRunner,
}

impl AppSupervisor {
    pub fn new(config: OmConfig, store: &Store, bus: PubSub, cmd: CmdRunner) -> Self {
        Self {
            kv: store.kv(),
            logs: store.pager::<RestartLog>(),
            config,
            bus,
            cmd,
        }
    }

    fn resolve_run_file(&self, run_file: &str) -> OmResult<String> {
        let run_file = if run_file.is_empty() {
            self.config.run_file_name()
        } else {
            run_file.to_string()
        };
        if !Path::new(&run_file).exists() {
            return Err(OmError::verify(format!("Run file not found: {run_file}")));
        }
        Ok(run_file)
    }

    fn ensure_executable(&self, run_file: &str) -> OmResult<()> {
        let meta = std::fs::metadata(run_file)
            .map_err(|e| OmError::verify(format!("stat {run_file}: {e}")))?;
        if meta.permissions().mode() & 0o111 == 0 {
            std::fs::set_permissions(run_file, std::fs::Permissions::from_mode(0o755))
                .map_err(|e| OmError::verify(format!("chmod {run_file}: {e}")))?;
            info!("File permissions changed to executable");
        }
        Ok(())
    }

    /// Kick off the restart protocol. Returns the allocated startID; the
    /// outcome is observed through the `/om/app/restarted` callback.
    pub async fn restart(
        &self,
        ctx: &Ctx,
        run_file: &str,
        progress: Option<ProgressFn>,
        item_id: &str,
    ) -> OmResult<String> {
        info!(trace = %ctx.trace_id, "Restarting application...");
        let run_file = self.resolve_run_file(run_file)?;
        self.ensure_executable(&run_file)?;

        let report = |msg: &str| {
            if let Some(cb) = &progress {
                cb(msg.to_string());
            }
        };
        report("Service restart ...");

        let start_id = uuid::Uuid::new_v4().simple().to_string();
        self.kv
            .set(START_ID_KEY, &start_id)
            .map_err(|e| OmError::sys(format!("persist startID: {e}")))?;

        let callback = self.config.restarted_callback_url(&start_id, item_id);
        let src = if progress.is_none() {
            StartSrc::Manual
        } else {
            StartSrc::Deploy
        };

        write_script(
            Path::new("restart.sh"),
            &render_restart_script(&run_file, &self.config.run_mode, &callback),
        )?;
        let watchdog_file = self.config.watchdog_file_name();
        write_script(
            Path::new(&watchdog_file),
            &render_watchdog_script(&run_file),
        )?;

        report("Stopping watchdog service...");
        let opts = RunOpts::default().with_print_log(false);
        let _ = self
            .cmd
            .run(ctx, "pkill", &opts, &["-9", "-f", &watchdog_file])
            .await;
        report("Watchdog service stopped.");

        spawn_detached("restart.sh", &[&src.to_string()], None)?;
        report("Restart script launched.");
        info!(trace = %ctx.trace_id, start_id = %start_id, src = %src, "restart handed off");
        Ok(start_id)
    }

    /// Callback endpoint body: validates the startID handshake and records
    /// the restart. All side effects are fire-and-forget.
    pub fn restart_success(
        &self,
        ctx: &Ctx,
        start_id: &str,
        item_id: &str,
        pid: i64,
        src: StartSrc,
    ) -> OmResult<()> {
        let expected: Option<String> = self
            .kv
            .get(START_ID_KEY)
            .map_err(|e| OmError::sys(format!("read startID: {e}")))?;
        match expected {
            Some(v) if v == start_id => {}
            _ => {
                return Err(OmError::verify(format!(
                    "startID mismatch: {start_id}"
                )))
            }
        }
        let _ = self.kv.delete(START_ID_KEY);

        let mut log = format!("Service started, pid={pid}, src={src}");
        if src == StartSrc::Crash {
            if let Some(tail) = latest_crash_log_tail(CRASH_LOG_TAIL_LINES) {
                log.push('\n');
                log.push_str(&tail);
            }
        }
        if let Err(e) = self.logs.put(&RestartLog {
            start_time: chrono::Utc::now().timestamp(),
            start_src: src,
            log,
        }) {
            error!(trace = %ctx.trace_id, "save restart log failed: {e:#}");
        }

        let watchdog_file = self.config.watchdog_file_name();
        if let Err(e) = spawn_detached(&watchdog_file, &[], Some("watchdog.out")) {
            error!(trace = %ctx.trace_id, "start watchdog failed: {e}");
        }

        self.bus.publish(
            TOPIC_RUN_STARTED,
            json!({"itemID": item_id, "pid": pid}),
        );
        info!(trace = %ctx.trace_id, pid, src = %src, "restart confirmed");
        Ok(())
    }

    pub async fn stop(&self, ctx: &Ctx) -> OmResult<()> {
        info!(trace = %ctx.trace_id, "Stopping application...");
        let run_file = self.config.run_file_name();
        write_script(
            Path::new("stop.sh"),
            &render_stop_script(&run_file, &self.config.watchdog_file_name()),
        )?;
        spawn_detached("stop.sh", &[], None)
    }

    /// Remove every generated artifact.
    pub fn clean(&self, ctx: &Ctx) -> OmResult<()> {
        info!(trace = %ctx.trace_id, "Cleaning files...");
        let files = [
            "restart.sh".to_string(),
            "stop.sh".to_string(),
            self.config.watchdog_file_name(),
            "nohup.out".to_string(),
            "watchdog.out".to_string(),
            "restart_logs".to_string(),
        ];
        for file in files {
            let path = PathBuf::from(&file);
            if !path.exists() {
                continue;
            }
            let res = if path.is_dir() {
                std::fs::remove_dir_all(&path)
            } else {
                std::fs::remove_file(&path)
            };
            if res.is_ok() {
                info!("Removed file: {file}");
            }
        }
        Ok(())
    }

    pub fn restart_page(&self, page: i64, size: i64) -> OmResult<PageCache<RestartLog>> {
        self.logs
            .find(page, size, None, Some(&Sorter::desc("startTime")))
            .map_err(|e| OmError::sys(format!("restart log page: {e:#}")))
    }

    #[cfg(test)]
    pub(crate) fn kv_start_id(&self) -> Option<String> {
        self.kv.get(START_ID_KEY).ok().flatten()
    }

    #[cfg(test)]
    pub(crate) fn seed_start_id(&self, id: &str) {
        self.kv.set(START_ID_KEY, &id.to_string()).unwrap();
    }
}

/// Last N lines of the newest `restart_logs/auto_restart_*.log`.
fn latest_crash_log_tail(lines: usize) -> Option<String> {
    let dir = Path::new("restart_logs");
    let mut newest: Option<(std::time::SystemTime, PathBuf)> = None;
    for entry in std::fs::read_dir(dir).ok()?.flatten() {
        let name = entry.file_name().to_string_lossy().to_string();
        if !name.starts_with("auto_restart_") || !name.ends_with(".log") {
            continue;
        }
        let mtime = entry.metadata().ok()?.modified().ok()?;
        if newest.as_ref().map(|(t, _)| mtime > *t).unwrap_or(true) {
            newest = Some((mtime, entry.path()));
        }
    }
    let (_, path) = newest?;
    let content = std::fs::read_to_string(path).ok()?;
    let all: Vec<&str> = content.lines().collect();
    let start = all.len().saturating_sub(lines);
    Some(all[start..].join("\n"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::cond;
    use serde_json::json;

    fn fixture() -> (AppSupervisor, PubSub, crate::testutil::CwdGuard) {
        let guard = crate::testutil::enter_temp_cwd("supervisor");
        let store = Store::in_memory().unwrap();
        let bus = PubSub::new();
        let cmd = CmdRunner::new(bus.clone());
        let config = OmConfig {
            sys_name: "svc".to_string(),
            run_mode: "test".to_string(),
            ..OmConfig::default()
        };
        (
            AppSupervisor::new(config, &store, bus.clone(), cmd),
            bus,
            guard,
        )
    }

    #[test]
    fn test_restart_script_contract() {
        let script = render_restart_script(
            "svc-test.linux64",
            "test",
            "http://127.0.0.1:8081/om/app/restarted?startID=s&itemID=",
        );
        assert!(script.contains("pkill -15 -f svc-test.linux64"));
        assert!(script.contains("pkill -9 -f svc-test.linux64"));
        assert!(script.contains("export GORIG_SYS_MODE=test"));
        assert!(script.contains("nohup ./svc-test.linux64 > nohup.out 2>&1 &"));
        assert!(script.contains("pid=$!"));
        assert!(script.contains("&pid=$pid&src=$SRC"));
        assert!(script.contains("%{http_code}"));
        assert!(script.contains("-ge 120"));
    }

    #[test]
    fn test_watchdog_script_contract() {
        let script = render_watchdog_script("svc-test.linux64");
        assert!(script.contains("sleep 5"));
        assert!(script.contains("restart_logs/auto_restart_"));
        assert!(script.contains("./restart.sh crash"));
    }

    #[test]
    fn test_stop_script_kills_watchdog_first() {
        let script = render_stop_script("svc.linux64", "watchdog_svc_test.sh");
        let wd = script.find("watchdog_svc_test.sh").unwrap();
        let svc = script.find("pkill -15 -f svc.linux64").unwrap();
        assert!(wd < svc);
    }

    #[tokio::test]
    async fn test_restart_missing_run_file() {
        let (sup, _bus, _guard) = fixture();
        let err = sup
            .restart(&Ctx::new(), "", None, "")
            .await
            .unwrap_err();
        assert!(matches!(err, OmError::Verify(_)));
    }

    #[tokio::test]
    async fn test_restart_roundtrip_and_start_id_binding() {
        let (sup, bus, _guard) = fixture();
        std::fs::write("svc-test.linux64", b"#!/bin/bash\n").unwrap();

        let start_id = sup.restart(&Ctx::new(), "", None, "").await.unwrap();
        assert!(Path::new("restart.sh").exists());
        assert!(Path::new("watchdog_svc_test.sh").exists());
        assert_eq!(sup.kv_start_id().as_deref(), Some(start_id.as_str()));

        // mismatched callback is a no-op
        let mut started = bus.subscribe(TOPIC_RUN_STARTED);
        let err = sup
            .restart_success(&Ctx::new(), "wrong", "", 42, StartSrc::Manual)
            .unwrap_err();
        assert!(matches!(err, OmError::Verify(_)));
        assert_eq!(sup.kv_start_id().as_deref(), Some(start_id.as_str()));

        // matching callback clears the key, logs, publishes run_started
        sup.restart_success(&Ctx::new(), &start_id, "item-1", 42, StartSrc::Manual)
            .unwrap();
        assert!(sup.kv_start_id().is_none());
        let msg = started.recv().await.unwrap();
        assert_eq!(msg["itemID"], "item-1");
        assert_eq!(msg["pid"], 42);

        let logs = sup.restart_page(1, 10).unwrap();
        assert_eq!(logs.total, 1);
        assert_eq!(logs.items[0].start_src, StartSrc::Manual);
    }

    #[tokio::test]
    async fn test_second_callback_is_rejected() {
        let (sup, _bus, _guard) = fixture();
        sup.seed_start_id("only-once");
        sup.restart_success(&Ctx::new(), "only-once", "", 1, StartSrc::Deploy)
            .unwrap();
        let err = sup
            .restart_success(&Ctx::new(), "only-once", "", 1, StartSrc::Deploy)
            .unwrap_err();
        assert!(matches!(err, OmError::Verify(_)));
    }

    #[test]
    fn test_restart_log_is_append_only_store() {
        let store = Store::in_memory().unwrap();
        let pager = store.pager::<RestartLog>();
        for (i, src) in [StartSrc::Manual, StartSrc::Deploy, StartSrc::Crash]
            .iter()
            .enumerate()
        {
            pager
                .put(&RestartLog {
                    start_time: 100 + i as i64,
                    start_src: *src,
                    log: format!("r{i}"),
                })
                .unwrap();
        }
        let page = pager
            .find(1, 10, None, Some(&Sorter::desc("startTime")))
            .unwrap();
        assert_eq!(page.total, 3);
        assert_eq!(page.items[0].start_src, StartSrc::Crash);
        // filter by source tag
        let crashes = pager
            .find(1, 10, Some(&cond(json!({"startSrc": "crash"}))), None)
            .unwrap();
        assert_eq!(crashes.total, 1);
    }

    #[test]
    fn test_start_src_parse() {
        assert_eq!(StartSrc::parse("deploy"), StartSrc::Deploy);
        assert_eq!(StartSrc::parse("crash"), StartSrc::Crash);
        assert_eq!(StartSrc::parse("anything"), StartSrc::Manual);
    }
}
