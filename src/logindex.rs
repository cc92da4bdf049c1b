//! JSONL log file enumeration, search and tailing.
//!
//! Log files live under `<root>/.logs/<category>/<category>-<wallclock>.jsonl`
//! where the filename timestamp identifies the earliest record in the file.
//! Records are NDJSON with five well-known keys; every other key flattens
//! into a string map.

use anyhow::Result;
use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::{OmError, OmResult};

pub const CATEGORIES: &[&str] = &["commons", "rest", "console"];
pub const LEVELS: &[&str] = &["debug", "info", "warn", "error", "fatal", "dpanic"];

/// Lines longer than this are skipped outright.
const MAX_LINE_BYTES: usize = 1 << 20;

const FILE_TIME_FORMAT: &str = "%Y-%m-%dT%H-%M-%S%.3f";
const OPTS_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";
const RECORD_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.3f";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SearchOptions {
    pub categories: Vec<String>,
    pub level: String,
    /// Multi-level filter used by the collectors; `level` wins when both set.
    pub levels: Vec<String>,
    #[serde(rename = "traceID")]
    pub trace_id: String,
    pub keyword: String,
    /// Local wall-clock, `YYYY-MM-DD HH:MM:SS`.
    pub start_time: String,
    pub end_time: String,
    pub size: usize,
    pub last_path: String,
    pub last_line: i64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LogRecord {
    pub level: String,
    pub time: String,
    pub msg: String,
    #[serde(rename = "_trace_id_")]
    pub trace_id: String,
    pub error: String,
    pub data: HashMap<String, String>,
}

impl LogRecord {
    pub fn parsed_time(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&self.time, RECORD_TIME_FORMAT)
            .or_else(|_| NaiveDateTime::parse_from_str(&self.time, OPTS_TIME_FORMAT))
            .ok()
    }
}

/// Flatten a parsed NDJSON object into a [`LogRecord`]. Unknown keys land
/// in `data`; non-string values keep their raw JSON form.
pub fn record_from_value(value: Value) -> LogRecord {
    let mut rec = LogRecord::default();
    let Value::Object(map) = value else {
        return rec;
    };
    for (k, v) in map {
        let as_str = |v: &Value| match v {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        };
        match k.as_str() {
            "level" => rec.level = as_str(&v),
            "time" => rec.time = as_str(&v),
            "msg" => rec.msg = as_str(&v),
            "_trace_id_" => rec.trace_id = as_str(&v),
            "error" => rec.error = as_str(&v),
            _ => {
                rec.data.insert(k, as_str(&v));
            }
        }
    }
    rec
}

#[derive(Debug, Clone, Serialize)]
pub struct MatchedRecord {
    pub path: String,
    pub line: i64,
    pub record: LogRecord,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContextLine {
    pub path: String,
    pub line: i64,
    pub content: String,
    pub record: LogRecord,
}

fn parse_opts_time(s: &str) -> Option<NaiveDateTime> {
    let s = s.trim();
    if s.is_empty() {
        return None;
    }
    NaiveDateTime::parse_from_str(s, OPTS_TIME_FORMAT).ok()
}

/// Whether a record passes the search filters.
pub fn match_record(rec: &LogRecord, opts: &SearchOptions) -> bool {
    if !opts.level.is_empty() && !rec.level.eq_ignore_ascii_case(&opts.level) {
        return false;
    }
    if opts.level.is_empty() && !opts.levels.is_empty() {
        let hit = opts
            .levels
            .iter()
            .any(|l| rec.level.eq_ignore_ascii_case(l));
        if !hit {
            return false;
        }
    }
    if !opts.trace_id.is_empty() && rec.trace_id != opts.trace_id {
        return false;
    }

    let Some(pt) = rec.parsed_time() else {
        return false;
    };
    if let Some(start) = parse_opts_time(&opts.start_time) {
        if pt < start {
            return false;
        }
    }
    if let Some(end) = parse_opts_time(&opts.end_time) {
        if pt > end {
            return false;
        }
    }

    if !opts.keyword.is_empty() {
        let kw = opts.keyword.as_str();
        return rec.msg.contains(kw)
            || rec.error.contains(kw)
            || rec.data.values().any(|v| v.contains(kw));
    }
    true
}

/// Cheap substring probe on the raw line before the JSON parse.
fn raw_prefilter(line: &str, opts: &SearchOptions) -> bool {
    if !opts.level.is_empty() && !line.contains(&format!("\"level\":\"{}\"", opts.level)) {
        return false;
    }
    if opts.level.is_empty() && !opts.levels.is_empty() {
        let hit = opts
            .levels
            .iter()
            .any(|l| line.contains(&format!("\"level\":\"{l}\"")));
        if !hit {
            return false;
        }
    }
    if !opts.trace_id.is_empty()
        && !line.contains(&format!("\"_trace_id_\":\"{}\"", opts.trace_id))
    {
        return false;
    }
    if !opts.keyword.is_empty() && !line.contains(opts.keyword.as_str()) {
        return false;
    }
    true
}

#[derive(Clone)]
pub struct LogIndex {
    root: PathBuf,
}

impl LogIndex {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn log_dir(&self) -> PathBuf {
        self.root.join(".logs")
    }

    /// Enumerate candidate files for the given filters, sorted by path so
    /// that resumable paging sees a stable order.
    pub fn list_log_files(&self, opts: &SearchOptions) -> Result<Vec<PathBuf>> {
        let log_dir = self.log_dir();
        if !log_dir.exists() {
            anyhow::bail!("log dir not found: {}", log_dir.display());
        }

        let categories: Vec<String> = if opts.categories.is_empty() {
            CATEGORIES.iter().map(|s| s.to_string()).collect()
        } else {
            opts.categories.clone()
        };

        let start = parse_opts_time(&opts.start_time);
        let end = parse_opts_time(&opts.end_time);

        let mut result = Vec::new();
        for entry in std::fs::read_dir(&log_dir)? {
            let entry = entry?;
            let cat = entry.file_name().to_string_lossy().to_string();
            if !entry.path().is_dir() || !categories.iter().any(|c| c == &cat) {
                continue;
            }
            for file in std::fs::read_dir(entry.path())? {
                let file = file?;
                let name = file.file_name().to_string_lossy().to_string();
                if !name.ends_with(".jsonl") || !name.starts_with(&format!("{cat}-")) {
                    continue;
                }
                let stamp = name
                    .trim_end_matches(".jsonl")
                    .trim_start_matches(&format!("{cat}-"))
                    .to_string();
                let Ok(file_time) = NaiveDateTime::parse_from_str(&stamp, FILE_TIME_FORMAT)
                else {
                    continue;
                };
                if let Some(start) = start {
                    if file_time < start {
                        continue;
                    }
                }
                if let Some(end) = end {
                    // The filename stamps the earliest record; a file whose
                    // first record is already past the window has no hits.
                    match first_record_time(&file.path()) {
                        Some(first) if first > end => continue,
                        None if file_time > end => continue,
                        _ => {}
                    }
                }
                result.push(file.path());
            }
        }
        result.sort();
        Ok(result)
    }

    /// Sequential scan with resumable paging: `last_path`/`last_line` name
    /// the last record of the previous page and scanning resumes strictly
    /// after it.
    pub fn search_logs(&self, opts: &SearchOptions) -> OmResult<Vec<MatchedRecord>> {
        let size = if opts.size == 0 { 10 } else { opts.size };
        let files = self
            .list_log_files(opts)
            .map_err(|e| OmError::verify(e.to_string()))?;

        let mut matched = Vec::new();
        let mut processing = opts.last_path.is_empty();

        'files: for path in files {
            let path_str = path.to_string_lossy().to_string();
            if !processing {
                if path_str == opts.last_path {
                    processing = true;
                } else {
                    continue;
                }
            }

            let file = File::open(&path)
                .map_err(|e| OmError::verify(format!("open file error: {e}")))?;
            let mut reader = BufReader::new(file);
            let mut line_no: i64 = 0;
            let mut buf = Vec::new();
            loop {
                buf.clear();
                let n = reader
                    .read_until(b'\n', &mut buf)
                    .map_err(|e| OmError::sys(format!("read line: {e}")))?;
                if n == 0 {
                    break;
                }
                line_no += 1;
                if path_str == opts.last_path && line_no <= opts.last_line {
                    continue;
                }
                if buf.len() > MAX_LINE_BYTES {
                    continue;
                }
                let line = String::from_utf8_lossy(&buf);
                let line = line.trim();
                if line.is_empty() || !raw_prefilter(line, opts) {
                    continue;
                }
                let Ok(value) = serde_json::from_str::<Value>(line) else {
                    continue;
                };
                let rec = record_from_value(value);
                if match_record(&rec, opts) {
                    matched.push(MatchedRecord {
                        path: path_str.clone(),
                        line: line_no,
                        record: rec,
                    });
                    if matched.len() >= size {
                        break 'files;
                    }
                }
            }
        }
        Ok(matched)
    }

    /// Context lines around `center` in one file.
    pub fn context_lines(
        &self,
        path: &str,
        center: i64,
        range: i64,
    ) -> OmResult<Vec<ContextLine>> {
        if center < 1 {
            return Err(OmError::verify("center line must be greater than 0"));
        }
        let range = range.max(0);
        let start = (center - range).max(1);
        let end = center + range;

        let file =
            File::open(path).map_err(|e| OmError::verify(format!("open file error: {e}")))?;
        let reader = BufReader::new(file);
        let mut result = Vec::new();
        for (idx, line) in reader.lines().enumerate() {
            let line_no = idx as i64 + 1;
            if line_no < start {
                continue;
            }
            if line_no > end {
                break;
            }
            let line = line.map_err(|e| OmError::sys(format!("read line: {e}")))?;
            let Ok(value) = serde_json::from_str::<Value>(&line) else {
                continue;
            };
            result.push(ContextLine {
                path: path.to_string(),
                line: line_no,
                record: record_from_value(value),
                content: line,
            });
        }
        Ok(result)
    }

    /// Scan a file backwards in 1 KiB steps for its last complete record.
    pub fn read_last_record(path: &Path) -> Option<MatchedRecord> {
        let mut file = File::open(path).ok()?;
        let size = file.metadata().ok()?.len() as i64;
        let mut offset: i64 = 0;
        let mut buf = [0u8; 1024];
        loop {
            offset += 1024;
            let from_end = offset.min(size);
            file.seek(SeekFrom::End(-from_end)).ok()?;
            let n = file.read(&mut buf).ok()?;
            for i in (0..n).rev() {
                if buf[i] == b'\n' && i + 1 < n {
                    let line = String::from_utf8_lossy(&buf[i + 1..n]);
                    let line = line.trim();
                    if line.is_empty() {
                        continue;
                    }
                    let value: Value = serde_json::from_str(line).ok()?;
                    return Some(MatchedRecord {
                        path: path.to_string_lossy().to_string(),
                        line: -1,
                        record: record_from_value(value),
                    });
                }
            }
            if offset >= size {
                return None;
            }
        }
    }

    /// Tail matching records as they are appended. The poller exits when
    /// the receiver is dropped.
    pub fn monitor(&self, opts: SearchOptions) -> mpsc::Receiver<MatchedRecord> {
        let (tx, rx) = mpsc::channel(64);
        let index = self.clone();
        tokio::spawn(async move {
            let mut offsets: HashMap<PathBuf, u64> = HashMap::new();
            // Start at the current end of every already-known file.
            if let Ok(files) = index.list_log_files(&opts) {
                for path in files {
                    if let Ok(meta) = std::fs::metadata(&path) {
                        offsets.insert(path, meta.len());
                    }
                }
            }
            let mut ticker = tokio::time::interval(std::time::Duration::from_secs(1));
            loop {
                ticker.tick().await;
                let files = match index.list_log_files(&opts) {
                    Ok(f) => f,
                    Err(e) => {
                        warn!("monitor list failed: {e}");
                        continue;
                    }
                };
                for path in files {
                    let len = match std::fs::metadata(&path) {
                        Ok(m) => m.len(),
                        Err(_) => continue,
                    };
                    let offset = *offsets.get(&path).unwrap_or(&0);
                    if len <= offset {
                        offsets.insert(path, len);
                        continue;
                    }
                    let Ok(mut file) = File::open(&path) else {
                        continue;
                    };
                    if file.seek(SeekFrom::Start(offset)).is_err() {
                        continue;
                    }
                    let reader = BufReader::new(&mut file);
                    for line in reader.lines().map_while(Result::ok) {
                        let line = line.trim().to_string();
                        if line.is_empty() || !raw_prefilter(&line, &opts) {
                            continue;
                        }
                        let Ok(value) = serde_json::from_str::<Value>(&line) else {
                            continue;
                        };
                        let rec = record_from_value(value);
                        if match_record(&rec, &opts) {
                            let matched = MatchedRecord {
                                path: path.to_string_lossy().to_string(),
                                line: -1,
                                record: rec,
                            };
                            if tx.send(matched).await.is_err() {
                                return;
                            }
                        }
                    }
                    offsets.insert(path, len);
                }
            }
        });
        rx
    }

    /// Validate a download path: inside tree, no traversal, `.jsonl` only.
    pub fn validate_download(&self, path: &str) -> OmResult<PathBuf> {
        if path.contains("..") || !path.ends_with(".jsonl") {
            return Err(OmError::verify("invalid log file"));
        }
        let p = PathBuf::from(path);
        if !p.exists() {
            return Err(OmError::verify("log file does not exist"));
        }
        Ok(p)
    }
}

fn first_record_time(path: &Path) -> Option<NaiveDateTime> {
    let file = File::open(path).ok()?;
    let mut reader = BufReader::new(file);
    let mut buf = Vec::new();
    for _ in 0..16 {
        buf.clear();
        let n = reader.read_until(b'\n', &mut buf).ok()?;
        if n == 0 {
            return None;
        }
        if buf.len() > MAX_LINE_BYTES {
            continue;
        }
        let line = String::from_utf8_lossy(&buf);
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(line) {
            if let Some(t) = record_from_value(value).parsed_time() {
                return Some(t);
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn temp_root(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("logindex_{tag}_{}_{nanos}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    fn write_log(root: &Path, category: &str, stamp: &str, lines: &[&str]) -> PathBuf {
        let dir = root.join(".logs").join(category);
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(format!("{category}-{stamp}.jsonl"));
        let mut f = File::create(&path).unwrap();
        for line in lines {
            writeln!(f, "{line}").unwrap();
        }
        path
    }

    fn line(time: &str, level: &str, msg: &str, trace: &str) -> String {
        format!(
            r#"{{"time":"{time}","level":"{level}","msg":"{msg}","_trace_id_":"{trace}","status":200}}"#
        )
    }

    #[test]
    fn test_record_from_value_flattens_extra_keys() {
        let v: Value = serde_json::from_str(
            r#"{"time":"2024-01-01 10:00:00.000","level":"info","msg":"IN","_trace_id_":"t1","method":"get","n":7,"obj":{"a":1}}"#,
        )
        .unwrap();
        let rec = record_from_value(v);
        assert_eq!(rec.msg, "IN");
        assert_eq!(rec.trace_id, "t1");
        assert_eq!(rec.data["method"], "get");
        assert_eq!(rec.data["n"], "7");
        assert_eq!(rec.data["obj"], r#"{"a":1}"#);
    }

    #[test]
    fn test_search_matches_level_and_keyword() {
        let root = temp_root("search");
        write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[
                &line("2024-01-01 10:00:01.000", "info", "hello world", "a"),
                &line("2024-01-01 10:00:02.000", "error", "bad thing", "b"),
                &line("2024-01-01 10:00:03.000", "error", "other", "c"),
            ],
        );
        let index = LogIndex::new(&root);
        let opts = SearchOptions {
            level: "error".into(),
            keyword: "bad".into(),
            size: 10,
            ..Default::default()
        };
        let hits = index.search_logs(&opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.msg, "bad thing");
        assert_eq!(hits[0].line, 2);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_resumable_paging_no_duplicates() {
        let root = temp_root("page");
        write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[
                &line("2024-01-01 10:00:01.000", "info", "m1", "a"),
                &line("2024-01-01 10:00:02.000", "info", "m2", "b"),
                &line("2024-01-01 10:00:03.000", "info", "m3", "c"),
                &line("2024-01-01 10:00:04.000", "info", "m4", "d"),
            ],
        );
        let index = LogIndex::new(&root);
        let mut opts = SearchOptions {
            size: 2,
            ..Default::default()
        };
        let page1 = index.search_logs(&opts).unwrap();
        assert_eq!(page1.len(), 2);

        opts.last_path = page1[1].path.clone();
        opts.last_line = page1[1].line;
        let page2 = index.search_logs(&opts).unwrap();
        assert_eq!(page2.len(), 2);

        let mut seen: Vec<(String, i64)> = page1
            .iter()
            .chain(page2.iter())
            .map(|m| (m.path.clone(), m.line))
            .collect();
        let before = seen.len();
        seen.dedup();
        assert_eq!(seen.len(), before);
        assert_eq!(page2[0].record.msg, "m3");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_time_window_filters_files() {
        let root = temp_root("window");
        write_log(
            &root,
            "commons",
            "2024-01-01T08-00-00.000",
            &[&line("2024-01-01 08:00:01.000", "info", "early", "a")],
        );
        write_log(
            &root,
            "commons",
            "2024-01-01T12-00-00.000",
            &[&line("2024-01-01 12:00:01.000", "info", "late", "b")],
        );
        let index = LogIndex::new(&root);
        let opts = SearchOptions {
            start_time: "2024-01-01 11:00:00".into(),
            size: 10,
            ..Default::default()
        };
        let hits = index.search_logs(&opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.msg, "late");

        // end before the second file's first record excludes it
        let opts = SearchOptions {
            end_time: "2024-01-01 09:00:00".into(),
            size: 10,
            ..Default::default()
        };
        let hits = index.search_logs(&opts).unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.msg, "early");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_oversized_line_skipped() {
        let root = temp_root("bigline");
        let big = format!(
            r#"{{"time":"2024-01-01 10:00:01.000","level":"info","msg":"{}"}}"#,
            "x".repeat(MAX_LINE_BYTES + 16)
        );
        write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[&big, &line("2024-01-01 10:00:02.000", "info", "small", "a")],
        );
        let index = LogIndex::new(&root);
        let hits = index
            .search_logs(&SearchOptions {
                size: 10,
                ..Default::default()
            })
            .unwrap();
        assert_eq!(hits.len(), 1);
        assert_eq!(hits[0].record.msg, "small");
        assert_eq!(hits[0].line, 2);
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_context_lines() {
        let root = temp_root("near");
        let path = write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[
                &line("2024-01-01 10:00:01.000", "info", "m1", "a"),
                &line("2024-01-01 10:00:02.000", "info", "m2", "b"),
                &line("2024-01-01 10:00:03.000", "info", "m3", "c"),
            ],
        );
        let index = LogIndex::new(&root);
        let ctx = index
            .context_lines(&path.to_string_lossy(), 2, 1)
            .unwrap();
        assert_eq!(ctx.len(), 3);
        assert_eq!(ctx[0].record.msg, "m1");
        assert_eq!(ctx[2].record.msg, "m3");
        assert!(index.context_lines("x", 0, 1).is_err());
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_read_last_record() {
        let root = temp_root("tail");
        let path = write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[
                &line("2024-01-01 10:00:01.000", "info", "first", "a"),
                &line("2024-01-01 10:00:02.000", "info", "last", "b"),
            ],
        );
        let rec = LogIndex::read_last_record(&path).unwrap();
        assert_eq!(rec.record.msg, "last");
        let _ = std::fs::remove_dir_all(&root);
    }

    #[test]
    fn test_validate_download() {
        let root = temp_root("dl");
        let path = write_log(
            &root,
            "commons",
            "2024-01-01T10-00-00.000",
            &[&line("2024-01-01 10:00:01.000", "info", "m", "a")],
        );
        let index = LogIndex::new(&root);
        assert!(index
            .validate_download(&path.to_string_lossy())
            .is_ok());
        assert!(index.validate_download("../etc/passwd.jsonl").is_err());
        assert!(index.validate_download("notes.txt").is_err());
        let _ = std::fs::remove_dir_all(&root);
    }
}
