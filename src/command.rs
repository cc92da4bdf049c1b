//! Bounded, nice-weighted subprocess execution.
//!
//! Deadlines are reported through the PubSub bus (`run_timeout.<trace_id>`)
//! instead of the return value so detached deployment work can observe
//! them. A non-zero exit with empty stderr returns success with empty
//! output: deploy scripts use `pkill`, which legitimately exits non-zero
//! when there is nothing to kill.

use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::Command;
use tracing::{error, info};

use crate::ctx::Ctx;
use crate::error::{OmError, OmResult};
use crate::pubsub::{run_timeout_topic, PubSub};

const RUN_TIMEOUT_DEFAULT: Duration = Duration::from_secs(60);

/// Niceness outside this range is a programming error, not an input error.
const NICE_MIN: i32 = -20;
const NICE_MAX: i32 = 19;

#[derive(Debug, Clone)]
pub struct RunOpts {
    /// Working directory; the call is rejected if it does not exist.
    pub dir: Option<PathBuf>,
    /// Extra environment, appended onto the process environment.
    pub env: Vec<(String, String)>,
    /// Echo command and combined output to the logger.
    pub print_log: bool,
    /// Deadline; zero disables.
    pub timeout: Duration,
    /// `nice` value in [-20, 19]. 0 means no nice wrapper at all; callers
    /// wanting the default adjustment pass 5.
    pub nice: i32,
}

impl Default for RunOpts {
    fn default() -> Self {
        Self {
            dir: None,
            env: Vec::new(),
            print_log: true,
            timeout: RUN_TIMEOUT_DEFAULT,
            nice: 5,
        }
    }
}

impl RunOpts {
    pub fn with_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.dir = Some(dir.into());
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn with_print_log(mut self, print_log: bool) -> Self {
        self.print_log = print_log;
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_nice(mut self, nice: i32) -> Self {
        self.nice = nice;
        self
    }
}

#[derive(Clone)]
pub struct CmdRunner {
    bus: PubSub,
}

impl CmdRunner {
    pub fn new(bus: PubSub) -> Self {
        Self { bus }
    }

    /// Run a command to completion, returning its stdout without the
    /// trailing newline.
    pub async fn run(
        &self,
        ctx: &Ctx,
        cmd: &str,
        opts: &RunOpts,
        args: &[&str],
    ) -> OmResult<String> {
        if opts.print_log {
            info!(trace = %ctx.trace_id, "Running command: {} {}", cmd, args.join(" "));
        }

        if opts.nice < NICE_MIN || opts.nice > NICE_MAX {
            return Err(OmError::sys(format!(
                "Nice value must be between {NICE_MIN} and {NICE_MAX}"
            )));
        }
        if let Some(dir) = &opts.dir {
            if !dir.exists() {
                return Err(OmError::verify(format!(
                    "working directory not found: {}",
                    dir.display()
                )));
            }
        }

        let mut command = if opts.nice == 0 {
            let mut c = Command::new(cmd);
            c.args(args);
            c
        } else {
            let mut c = Command::new("nice");
            c.arg("-n").arg(opts.nice.to_string()).arg(cmd).args(args);
            c
        };
        if let Some(dir) = &opts.dir {
            command.current_dir(dir);
        }
        for (key, value) in &opts.env {
            command.env(key, value);
        }
        command
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = command
            .spawn()
            .map_err(|e| OmError::sys(format!("spawn {cmd}: {e}")))?;

        let output = if opts.timeout.is_zero() {
            child.wait_with_output().await
        } else {
            match tokio::time::timeout(opts.timeout, child.wait_with_output()).await {
                Ok(res) => res,
                Err(_) => {
                    // Deadline: the child is killed on drop; observers learn
                    // about it through the bus, not the return value.
                    error!(trace = %ctx.trace_id, "Command timed out: {} {}", cmd, args.join(" "));
                    self.bus.publish(
                        &run_timeout_topic(&ctx.trace_id),
                        serde_json::Value::Null,
                    );
                    return Ok(String::new());
                }
            }
        };
        let output = output.map_err(|e| OmError::sys(format!("wait {cmd}: {e}")))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();

        if !output.status.success() {
            if !opts.print_log {
                info!(trace = %ctx.trace_id, "Running command: {} {}", cmd, args.join(" "));
            }
            let err_info = format!("Command failed: {}\n{}", output.status, stderr);
            error!(trace = %ctx.trace_id, "{err_info}");
            if stderr.is_empty() {
                return Ok(String::new());
            }
            return Err(OmError::verify(err_info));
        }

        let result = stdout.strip_suffix('\n').unwrap_or(&stdout).to_string();
        if opts.print_log {
            info!(trace = %ctx.trace_id, "Command output: {result}");
        }
        Ok(result)
    }
}
