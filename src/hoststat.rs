//! Host and process resource sampling.
//!
//! Every minute the collector takes a 1-second CPU delta from `/proc/stat`
//! and `/proc/self/stat`, reads memory from `/proc/meminfo`, root disk
//! capacity via statvfs and the application's on-disk footprint by walking
//! the working directory. Values are stored as two-decimal strings.
//!
//! Parsers are pure functions over file contents so they can be tested with
//! string fixtures.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use crate::config::OmConfig;
use crate::error::{OmError, OmResult};
use crate::store::{cond, Agg, Granularity, PageCache, Pager, Record, Sorter, Store, TimeBucket};

const COLLECT_TICK: Duration = Duration::from_secs(60);
const SWEEP_TICK: Duration = Duration::from_secs(60);
const JITTER_MAX: Duration = Duration::from_secs(10);
const CPU_SAMPLE_WINDOW: Duration = Duration::from_secs(1);

pub const HOST_FIELDS: &[&str] = &[
    "cpu", "appCpu", "mem", "appMem", "totalMem", "disk", "appDisk", "totalDisk",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HostUsage {
    pub at: i64,
    /// Application CPU usage, percent.
    pub app_cpu: String,
    /// Application resident memory, MB.
    pub app_mem: String,
    /// Application disk footprint under CWD, MB.
    pub app_disk: String,
    /// Host CPU usage averaged across cores, percent.
    pub cpu: String,
    /// Host memory used, MB.
    pub mem: String,
    /// Host memory total, MB.
    pub total_mem: String,
    /// Root filesystem used, MB.
    pub disk: String,
    /// Root filesystem total, MB.
    pub total_disk: String,
}

impl Record for HostUsage {
    const TABLE: &'static str = "host_usage";
}

/// Aggregated `/proc/stat` cpu line.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuTotals {
    pub total: u64,
    pub idle: u64,
}

/// Parse the aggregate `cpu ` line of `/proc/stat`.
pub fn parse_cpu_totals(content: &str) -> Option<CpuTotals> {
    let line = content.lines().find(|l| l.starts_with("cpu "))?;
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .filter_map(|f| f.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0);
    Some(CpuTotals {
        total: fields.iter().sum(),
        idle,
    })
}

/// utime+stime and RSS pages from `/proc/self/stat`. The comm field may
/// contain spaces, so fields are taken after the closing paren.
pub fn parse_self_stat(content: &str) -> Option<(u64, i64)> {
    let after = &content[content.rfind(')')? + 2..];
    let fields: Vec<&str> = after.split_whitespace().collect();
    // after state: utime is field 11, stime 12, rss 21 (0-based)
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    let rss_pages: i64 = fields.get(21)?.parse().ok()?;
    Some((utime + stime, rss_pages))
}

/// Relevant `/proc/meminfo` fields, KiB.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MemInfo {
    pub total: u64,
    pub free: u64,
    pub buffers: u64,
    pub cached: u64,
    pub sreclaimable: u64,
}

impl MemInfo {
    /// Used memory: total minus free, buffers and page cache (including
    /// reclaimable slab). Reclaimable cache counts as used here, unlike
    /// MemAvailable-based accounting.
    pub fn used(&self) -> u64 {
        self.total
            .saturating_sub(self.free)
            .saturating_sub(self.buffers)
            .saturating_sub(self.cached)
            .saturating_sub(self.sreclaimable)
    }
}

pub fn parse_meminfo(content: &str) -> Option<MemInfo> {
    let mut info = MemInfo::default();
    let mut seen_total = false;
    for line in content.lines() {
        let mut parts = line.split_whitespace();
        let (Some(key), Some(value)) = (parts.next(), parts.next()) else {
            continue;
        };
        let Ok(value) = value.parse() else {
            continue;
        };
        match key {
            "MemTotal:" => {
                info.total = value;
                seen_total = true;
            }
            "MemFree:" => info.free = value,
            "Buffers:" => info.buffers = value,
            "Cached:" => info.cached = value,
            "SReclaimable:" => info.sreclaimable = value,
            _ => {}
        }
    }
    if seen_total {
        Some(info)
    } else {
        None
    }
}

/// Host CPU percentage from two `/proc/stat` samples.
pub fn cpu_percent(before: CpuTotals, after: CpuTotals) -> f64 {
    let total = after.total.saturating_sub(before.total);
    if total == 0 {
        return 0.0;
    }
    let busy = total.saturating_sub(after.idle.saturating_sub(before.idle));
    busy as f64 / total as f64 * 100.0
}

fn statvfs_usage(path: &str) -> Option<(u64, u64)> {
    let c_path = std::ffi::CString::new(path).ok()?;
    let mut stats: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(c_path.as_ptr(), &mut stats) } != 0 {
        return None;
    }
    let frsize = stats.f_frsize as u64;
    let total = stats.f_blocks as u64 * frsize;
    let free = stats.f_bfree as u64 * frsize;
    Some((total, total.saturating_sub(free)))
}

/// Sum of file sizes under a directory tree.
pub fn dir_usage(path: &Path) -> u64 {
    let mut total = 0u64;
    let Ok(entries) = std::fs::read_dir(path) else {
        return 0;
    };
    for entry in entries.flatten() {
        let p = entry.path();
        if p.is_dir() {
            total += dir_usage(&p);
        } else if let Ok(meta) = entry.metadata() {
            total += meta.len();
        }
    }
    total
}

fn mb(bytes: u64) -> f64 {
    bytes as f64 / 1024.0 / 1024.0
}

pub struct HostCollector {
    storage: Pager<HostUsage>,
    max_period: Duration,
}

impl HostCollector {
    pub fn new(config: &OmConfig, store: &Store) -> Self {
        Self {
            storage: store.pager::<HostUsage>(),
            max_period: config.max_period(),
        }
    }

    pub async fn collect(&self) {
        let read = |p: &str| std::fs::read_to_string(p).unwrap_or_default();
        let cpu0 = parse_cpu_totals(&read("/proc/stat"));
        let self0 = parse_self_stat(&read("/proc/self/stat"));
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        let cpu1 = parse_cpu_totals(&read("/proc/stat"));
        let self1 = parse_self_stat(&read("/proc/self/stat"));

        let (Some(cpu0), Some(cpu1), Some(self0), Some(self1)) = (cpu0, cpu1, self0, self1)
        else {
            error!("host collect failed to sample /proc");
            return;
        };

        let host_cpu = cpu_percent(cpu0, cpu1);
        let clk_tck = unsafe { libc::sysconf(libc::_SC_CLK_TCK) } as f64;
        let app_cpu = if clk_tck > 0.0 {
            (self1.0.saturating_sub(self0.0)) as f64 / clk_tck
                / CPU_SAMPLE_WINDOW.as_secs_f64()
                * 100.0
        } else {
            0.0
        };

        let Some(mem) = parse_meminfo(&read("/proc/meminfo")) else {
            error!("host collect failed to read meminfo");
            return;
        };
        let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) } as u64;
        let app_rss = self1.1.max(0) as u64 * page_size;

        let (disk_total, disk_used) = statvfs_usage("/").unwrap_or((0, 0));
        let app_disk = std::env::current_dir()
            .map(|cwd| dir_usage(&cwd))
            .unwrap_or(0);

        let usage = HostUsage {
            at: chrono::Utc::now().timestamp(),
            app_cpu: format!("{app_cpu:.2}"),
            app_mem: format!("{:.2}", mb(app_rss)),
            app_disk: format!("{:.2}", mb(app_disk)),
            cpu: format!("{host_cpu:.2}"),
            mem: format!("{:.2}", mb(mem.used() * 1024)),
            total_mem: format!("{:.2}", mb(mem.total * 1024)),
            disk: format!("{:.2}", mb(disk_used)),
            total_disk: format!("{:.2}", mb(disk_total)),
        };
        if let Err(e) = self.storage.put(&usage) {
            error!("host collect failed to save resource usage: {e:#}");
        }
    }

    pub fn page(&self, page: i64, size: i64) -> OmResult<PageCache<HostUsage>> {
        self.storage
            .find(page, size, None, Some(&Sorter::desc("at")))
            .map_err(|e| OmError::verify(format!("host usage page: {e}")))
    }

    pub fn time_range(
        &self,
        start: i64,
        end: i64,
        granularity: Option<Granularity>,
        fields: &[String],
    ) -> OmResult<Vec<TimeBucket>> {
        if start <= 0 || end <= 0 || start > end {
            return Err(OmError::verify("Invalid time range"));
        }
        let granularity = granularity.unwrap_or(Granularity::Hour);
        let fields: Vec<&str> = if fields.is_empty() {
            vec!["cpu", "appCpu", "mem", "appMem"]
        } else {
            for f in fields {
                if !HOST_FIELDS.contains(&f.as_str()) {
                    return Err(OmError::verify(format!("unsupported field: {f}")));
                }
            }
            fields.iter().map(|s| s.as_str()).collect()
        };
        self.storage
            .group_by_time(None, start, end, granularity, Agg::Sum, &fields)
            .map_err(|e| OmError::sys(format!("GroupByTime failed: {e:#}")))
    }

    /// Delete rows older than the retention window.
    pub fn sweep(&self) {
        let expiration = chrono::Utc::now().timestamp() - self.max_period.as_secs() as i64;
        if let Err(e) = self
            .storage
            .delete(&cond(serde_json::json!({"at": {"$lt": expiration}})))
        {
            error!("host usage sweep failed: {e:#}");
        }
    }

    pub fn spawn(self: &Arc<Self>) {
        let collector = self.clone();
        tokio::spawn(async move {
            let jitter = rand::thread_rng().gen_range(Duration::ZERO..JITTER_MAX);
            tokio::time::sleep(jitter).await;
            info!("host collector started");
            let mut ticker = tokio::time::interval(COLLECT_TICK);
            loop {
                ticker.tick().await;
                collector.collect().await;
            }
        });
        let collector = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_TICK);
            loop {
                ticker.tick().await;
                collector.sweep();
            }
        });
    }

    #[cfg(test)]
    pub(crate) fn put_sample(&self, at: i64) {
        self.storage
            .put(&HostUsage {
                at,
                app_cpu: "1.00".into(),
                app_mem: "10.00".into(),
                app_disk: "5.00".into(),
                cpu: "20.00".into(),
                mem: "100.00".into(),
                total_mem: "200.00".into(),
                disk: "50.00".into(),
                total_disk: "500.00".into(),
            })
            .unwrap();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PROC_STAT: &str = "cpu  100 0 100 700 100 0 0 0 0 0\ncpu0 50 0 50 350 50 0 0 0 0 0\n";
    const PROC_STAT_LATER: &str = "cpu  150 0 150 700 100 0 0 0 0 0\n";

    #[test]
    fn test_parse_cpu_totals() {
        let t = parse_cpu_totals(PROC_STAT).unwrap();
        assert_eq!(t.total, 1000);
        assert_eq!(t.idle, 800);
        assert!(parse_cpu_totals("garbage").is_none());
    }

    #[test]
    fn test_cpu_percent_from_delta() {
        let before = parse_cpu_totals(PROC_STAT).unwrap();
        let after = parse_cpu_totals(PROC_STAT_LATER).unwrap();
        // Δtotal = 100, Δidle = 0 → 100% busy
        assert_eq!(cpu_percent(before, after), 100.0);
        assert_eq!(cpu_percent(after, after), 0.0);
    }

    #[test]
    fn test_parse_self_stat_with_spaced_comm() {
        let content = "1234 (my svc) S 1 1 1 0 -1 4194560 100 0 0 0 \
                       40 20 0 0 20 0 8 0 100 1000000 250 18446744073709551615";
        let (ticks, rss) = parse_self_stat(content).unwrap();
        assert_eq!(ticks, 60);
        assert_eq!(rss, 250);
    }

    #[test]
    fn test_parse_meminfo() {
        let content = "MemTotal:       16000000 kB\n\
                       MemFree:         2000000 kB\n\
                       MemAvailable:    8000000 kB\n\
                       Buffers:          500000 kB\n\
                       Cached:          4000000 kB\n\
                       SReclaimable:     300000 kB\n";
        let info = parse_meminfo(content).unwrap();
        assert_eq!(info.total, 16_000_000);
        assert_eq!(info.free, 2_000_000);
        assert_eq!(info.buffers, 500_000);
        assert_eq!(info.cached, 4_000_000);
        assert_eq!(info.sreclaimable, 300_000);
        // used ignores MemAvailable: reclaimable cache still counts as used
        assert_eq!(info.used(), 9_200_000);
        assert!(parse_meminfo("MemFree: 1 kB").is_none());
    }

    #[test]
    fn test_retention_sweep() {
        let store = Store::in_memory().unwrap();
        let config = OmConfig::default();
        let mut collector = HostCollector::new(&config, &store);
        collector.max_period = Duration::from_secs(2);

        let now = chrono::Utc::now().timestamp();
        collector.put_sample(now - 10);
        collector.put_sample(now);
        collector.sweep();

        let page = collector.page(1, 10).unwrap();
        assert_eq!(page.total, 1);
        assert_eq!(page.items[0].at, now);
    }

    #[test]
    fn test_time_range_validation_and_buckets() {
        let store = Store::in_memory().unwrap();
        let collector = HostCollector::new(&OmConfig::default(), &store);
        assert!(collector.time_range(10, 5, None, &[]).is_err());
        assert!(collector
            .time_range(1, 100, None, &["bogus".to_string()])
            .is_err());

        collector.put_sample(3600);
        collector.put_sample(3660);
        let buckets = collector
            .time_range(0, 7200, Some(Granularity::Hour), &["cpu".to_string()])
            .unwrap();
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].bucket, 3600);
        assert_eq!(buckets[0].value["cpu"], 40.0);
    }

    #[test]
    fn test_dir_usage_counts_files() {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("dirusage_{}_{nanos}", std::process::id()));
        std::fs::create_dir_all(dir.join("sub")).unwrap();
        std::fs::write(dir.join("a"), vec![0u8; 100]).unwrap();
        std::fs::write(dir.join("sub/b"), vec![0u8; 50]).unwrap();
        assert_eq!(dir_usage(&dir), 150);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
