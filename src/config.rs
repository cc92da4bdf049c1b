use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OmConfig {
    /// System name; the run file is derived as `<sys_name>-<run_mode>.linux64`.
    #[serde(default = "default_sys_name")]
    pub sys_name: String,

    /// Run mode, exported to restarted children as GORIG_SYS_MODE.
    #[serde(default = "default_run_mode")]
    pub run_mode: String,

    /// Listen host for the REST surface.
    #[serde(default = "default_host")]
    pub host: String,

    /// Listen port; also the port the restart script calls back on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Shared secret for operator login. Empty disables the auth surface.
    #[serde(default = "default_om_key")]
    pub om_key: String,

    /// SQLite database path.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// Root directory holding `.logs/<category>/...`.
    #[serde(default = "default_root_dir")]
    pub root_dir: PathBuf,

    /// Latency above which a request counts as slow, milliseconds.
    #[serde(default = "default_slow_ms")]
    pub slow_ms: i64,

    /// Retention for telemetry rollups, hours.
    #[serde(default = "default_max_period_hours")]
    pub max_period_hours: u64,

    /// Number of build backups kept by the GC cron.
    #[serde(default = "default_backup_count")]
    pub backup_count: usize,

    /// Hard deadline for one deploy task, seconds.
    #[serde(default = "default_deploy_timeout_secs")]
    pub deploy_timeout_secs: u64,
}

fn default_sys_name() -> String {
    std::env::var("OM_SYS_NAME").unwrap_or_else(|_| "opsidecar".to_string())
}

fn default_run_mode() -> String {
    std::env::var("GORIG_SYS_MODE").unwrap_or_else(|_| "dev".to_string())
}

fn default_host() -> String {
    std::env::var("OM_HOST").unwrap_or_else(|_| "0.0.0.0".to_string())
}

fn default_port() -> u16 {
    std::env::var("OM_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8081)
}

fn default_om_key() -> String {
    std::env::var("OM_KEY").unwrap_or_default()
}

fn default_db_path() -> PathBuf {
    std::env::var("OM_DB_PATH")
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from(".cache/om.db"))
}

fn default_root_dir() -> PathBuf {
    PathBuf::from(".")
}

fn default_slow_ms() -> i64 {
    std::env::var("OM_SLOW_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(200)
}

fn default_max_period_hours() -> u64 {
    std::env::var("OM_MAX_PERIOD_HOURS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(720)
}

fn default_backup_count() -> usize {
    std::env::var("OM_BACKUP_COUNT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(10)
}

fn default_deploy_timeout_secs() -> u64 {
    std::env::var("OM_DEPLOY_TIMEOUT_SECS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(600)
}

impl Default for OmConfig {
    fn default() -> Self {
        serde_json::from_str("{}").expect("default config")
    }
}

impl OmConfig {
    /// Run-file name derived from sys name and mode: lowercase, `_` → `-`.
    pub fn run_file_name(&self) -> String {
        format!("{}-{}.linux64", self.sys_name, self.run_mode)
            .to_lowercase()
            .replace('_', "-")
    }

    /// Name of the generated watchdog script for this instance.
    pub fn watchdog_file_name(&self) -> String {
        format!(
            "watchdog_{}_{}.sh",
            self.sys_name.to_lowercase().replace('_', "-"),
            self.run_mode.to_lowercase()
        )
    }

    /// Loopback callback URL polled by the restart script.
    pub fn restarted_callback_url(&self, start_id: &str, item_id: &str) -> String {
        format!(
            "http://127.0.0.1:{}/om/app/restarted?startID={}&itemID={}",
            self.port, start_id, item_id
        )
    }

    pub fn max_period(&self) -> Duration {
        Duration::from_secs(self.max_period_hours * 3600)
    }

    pub fn deploy_timeout(&self) -> Duration {
        Duration::from_secs(self.deploy_timeout_secs)
    }
}
