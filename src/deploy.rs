//! Build-from-git deployment pipeline.
//!
//! A persistent FIFO queue with a single worker: clone → build → swap
//! binary → restart. The worker never runs two tasks at once; liveness of
//! the restarted binary is confirmed asynchronously through the
//! `run_started` topic, and command deadlines surface through
//! `run_timeout.<trace>`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};

use crate::command::{CmdRunner, RunOpts};
use crate::config::OmConfig;
use crate::ctx::Ctx;
use crate::error::{OmError, OmResult};
use crate::gitenv::GitEnv;
use crate::pubsub::{run_timeout_topic, PubSub, TOPIC_RUN_STARTED};
use crate::store::{cond, KvStore, PageCache, Pager, Record, Sorter, Store};
use crate::supervisor::{AppSupervisor, ProgressFn};

pub const CONFIG_KEY: &str = "dp_task_config";
const WORK_DIR: &str = ".deploy";

const WORKER_TICK: Duration = Duration::from_secs(5);
const CLONE_TIMEOUT: Duration = Duration::from_secs(120);
const TIDY_TIMEOUT: Duration = Duration::from_secs(300);
const BUILD_TIMEOUT: Duration = Duration::from_secs(120);
const TIMEOUT_SWEEP_TICK: Duration = Duration::from_secs(60);
const BACKUP_GC_TICK: Duration = Duration::from_secs(600);
const AUTO_CHECK_TICK: Duration = Duration::from_secs(10);
const PROXY_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

const GO_PROXY_PROBE: &str = "https://proxy.golang.org/";
const GO_PROXY_FALLBACK: &str = "https://goproxy.cn,direct";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    Waiting,
    Running,
    Success,
    Failed,
    Timeout,
    Canceled,
}

impl TaskStatus {
    pub fn is_terminal(self) -> bool {
        !matches!(self, TaskStatus::Waiting | TaskStatus::Running)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RbStatus {
    Unready,
    Ready,
    Cleaned,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskLogLevel {
    Info,
    Warn,
    Error,
    /// Highlighted progress milestone.
    Light,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskLogEntry {
    pub time: i64,
    pub text: String,
    pub level: TaskLogLevel,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct OtherRepo {
    pub repo: String,
    pub branch: String,
    pub dir: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOptions {
    pub git_init: bool,
    pub go_init: bool,
    pub ssh_key_copy: bool,
    pub repo: String,
    pub branch: String,
    pub other_repos: Vec<OtherRepo>,
    pub auto_trigger: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    #[serde(flatten)]
    pub options: TaskOptions,
    pub commit: String,
    pub git_hash: String,
    /// Unix milliseconds; FIFO order key.
    pub create_at: i64,
    pub status: TaskStatus,
    pub create_by: String,
    pub build_file: String,
    pub log: Vec<TaskLogEntry>,
    pub start_at: i64,
    pub finish_at: i64,
    pub rb_status: RbStatus,
    pub rb: bool,
    pub rid: String,
}

impl Record for TaskRecord {
    const TABLE: &'static str = "deploy_task";
}

impl TaskRecord {
    fn new(options: TaskOptions, create_by: &str) -> Self {
        Self {
            id: uuid::Uuid::new_v4().simple().to_string(),
            options,
            commit: String::new(),
            git_hash: String::new(),
            create_at: chrono::Utc::now().timestamp_millis(),
            status: TaskStatus::Waiting,
            create_by: create_by.to_string(),
            build_file: String::new(),
            log: Vec::new(),
            start_at: 0,
            finish_at: 0,
            rb_status: RbStatus::Unready,
            rb: false,
            rid: String::new(),
        }
    }
}

pub struct DeployEngine {
    config: OmConfig,
    tasks: Pager<TaskRecord>,
    kv: KvStore,
    bus: PubSub,
    cmd: CmdRunner,
    gitenv: Arc<GitEnv>,
    supervisor: Arc<AppSupervisor>,
    http: reqwest::Client,
}

impl DeployEngine {
    pub fn new(
        config: OmConfig,
        store: &Store,
        bus: PubSub,
        cmd: CmdRunner,
        gitenv: Arc<GitEnv>,
        supervisor: Arc<AppSupervisor>,
    ) -> Self {
        Self {
            tasks: store.pager::<TaskRecord>(),
            kv: store.kv(),
            config,
            bus,
            cmd,
            gitenv,
            supervisor,
            http: reqwest::Client::new(),
        }
    }

    // ------------------------------------------------------------------
    // Public operations
    // ------------------------------------------------------------------

    pub fn save_config(&self, ctx: &Ctx, opts: &TaskOptions) -> OmResult<()> {
        info!(trace = %ctx.trace_id, "Saving task config: {opts:?}");
        self.kv
            .set(CONFIG_KEY, opts)
            .map_err(|e| OmError::verify(format!("save config: {e}")))
    }

    pub fn get_config(&self) -> OmResult<Option<TaskOptions>> {
        self.kv
            .get(CONFIG_KEY)
            .map_err(|e| OmError::verify(format!("get config: {e}")))
    }

    /// Enqueue a deploy task from the saved configuration.
    pub fn start(&self, ctx: &Ctx, auto: bool) -> OmResult<String> {
        info!(trace = %ctx.trace_id, auto, "Starting deploy task");
        let opts = self
            .get_config()?
            .ok_or_else(|| OmError::verify("Task options are nil"))?;
        if opts.repo.is_empty() || opts.branch.is_empty() {
            return Err(OmError::verify("Repository URL or branch is empty"));
        }
        let task = TaskRecord::new(opts, if auto { "system" } else { "admin" });
        let id = task.id.clone();
        self.tasks
            .put(&task)
            .map_err(|e| OmError::verify(format!("enqueue task: {e}")))?;
        Ok(id)
    }

    /// Cancel a waiting or running task.
    pub fn stop(&self, ctx: &Ctx, id: &str) -> OmResult<()> {
        info!(trace = %ctx.trace_id, id, "Canceling deploy task");
        let mut task = self
            .tasks
            .get(&cond(serde_json::json!({"id": id})))
            .map_err(|e| OmError::sys(format!("get task: {e}")))?
            .ok_or_else(|| OmError::verify("Task not found"))?;
        if task.status.is_terminal() {
            return Err(OmError::verify(format!(
                "Task already finished: {:?}",
                task.status
            )));
        }
        task.status = TaskStatus::Canceled;
        task.finish_at = chrono::Utc::now().timestamp_millis();
        task.log.push(TaskLogEntry {
            time: task.finish_at,
            text: "Task canceled".to_string(),
            level: TaskLogLevel::Warn,
        });
        self.tasks
            .update(&cond(serde_json::json!({"id": id})), &task)
            .map_err(|e| OmError::sys(format!("update task: {e}")))?;
        Ok(())
    }

    pub fn page(&self, page: i64, size: i64) -> OmResult<PageCache<TaskRecord>> {
        self.tasks
            .find(page, size, None, Some(&Sorter::desc("createAt")))
            .map_err(|e| OmError::verify(format!("task page: {e}")))
    }

    pub fn get(&self, id: &str) -> OmResult<Option<TaskRecord>> {
        self.tasks
            .get(&cond(serde_json::json!({"id": id})))
            .map_err(|e| OmError::verify(format!("get task: {e}")))
    }

    /// Clone a succeeded task into a rollback task reusing its backup.
    pub fn rollback(&self, ctx: &Ctx, id: &str) -> OmResult<String> {
        info!(trace = %ctx.trace_id, id, "Rolling back task");
        let source = self
            .get(id)?
            .ok_or_else(|| OmError::verify("Task not found"))?;
        if source.rb_status != RbStatus::Ready {
            return Err(OmError::verify("Task not ready for rollback"));
        }
        let mut task = TaskRecord::new(source.options.clone(), "admin");
        task.commit = source.commit.clone();
        task.git_hash = source.git_hash.clone();
        task.build_file = source.build_file.clone();
        task.rb = true;
        task.rid = id.to_string();
        let new_id = task.id.clone();
        self.tasks
            .put(&task)
            .map_err(|e| OmError::verify(format!("enqueue rollback: {e}")))?;
        Ok(new_id)
    }

    // ------------------------------------------------------------------
    // Task log trail
    // ------------------------------------------------------------------

    /// Append a log line and advance the status machine: first info line
    /// moves waiting → running, an error line moves running → failed.
    /// Terminal statuses win; the stored status is returned either way.
    fn task_log(&self, id: &str, text: &str, level: TaskLogLevel) -> TaskStatus {
        let key = cond(serde_json::json!({"id": id}));
        let mut task = match self.tasks.get(&key) {
            Ok(Some(t)) => t,
            Ok(None) => {
                error!(id, "Task item not found");
                return TaskStatus::Failed;
            }
            Err(e) => {
                error!(id, "Error getting task item: {e:#}");
                return TaskStatus::Failed;
            }
        };
        if task.status.is_terminal() && task.status != TaskStatus::Success {
            return task.status;
        }
        let now = chrono::Utc::now().timestamp_millis();
        task.log.push(TaskLogEntry {
            time: now,
            text: text.to_string(),
            level,
        });
        if level == TaskLogLevel::Error {
            task.status = TaskStatus::Failed;
            task.finish_at = now;
        } else if task.status == TaskStatus::Waiting {
            task.status = TaskStatus::Running;
            task.start_at = now;
        }
        if let Err(e) = self.tasks.update(&key, &task) {
            error!(id, "Error updating task item: {e:#}");
        }
        task.status
    }

    fn mutate_task<F: FnOnce(&mut TaskRecord)>(&self, id: &str, f: F) {
        let key = cond(serde_json::json!({"id": id}));
        match self.tasks.get(&key) {
            Ok(Some(mut task)) => {
                f(&mut task);
                if let Err(e) = self.tasks.update(&key, &task) {
                    error!(id, "Error updating task item: {e:#}");
                }
            }
            Ok(None) => error!(id, "Task item not found"),
            Err(e) => error!(id, "Error getting task item: {e:#}"),
        }
    }

    fn current_status(&self, id: &str) -> TaskStatus {
        self.get(id)
            .ok()
            .flatten()
            .map(|t| t.status)
            .unwrap_or(TaskStatus::Failed)
    }

    // ------------------------------------------------------------------
    // Worker
    // ------------------------------------------------------------------

    /// Spawn the worker loop, crons and the `run_started` subscriber.
    pub fn spawn(self: &Arc<Self>) {
        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(WORKER_TICK);
            loop {
                ticker.tick().await;
                engine.deploy_tick().await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(TIMEOUT_SWEEP_TICK);
            loop {
                ticker.tick().await;
                engine.timeout_sweep();
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(BACKUP_GC_TICK);
            loop {
                ticker.tick().await;
                engine.clean_backup();
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(AUTO_CHECK_TICK);
            loop {
                ticker.tick().await;
                engine.auto_check().await;
            }
        });

        let engine = self.clone();
        tokio::spawn(async move {
            let mut rx = engine.bus.subscribe(TOPIC_RUN_STARTED);
            while let Some(msg) = rx.recv().await {
                let item_id = msg["itemID"].as_str().unwrap_or_default().to_string();
                if !item_id.is_empty() {
                    engine.complete_task(&item_id);
                }
            }
        });
    }

    /// `run_started` arrived for a deploy task: the replacement binary is
    /// alive, the task is done.
    fn complete_task(&self, id: &str) {
        self.mutate_task(id, |task| {
            if task.status != TaskStatus::Running {
                return;
            }
            let now = chrono::Utc::now().timestamp_millis();
            task.status = TaskStatus::Success;
            task.finish_at = now;
            if !task.build_file.is_empty() {
                task.rb_status = RbStatus::Ready;
            }
            task.log.push(TaskLogEntry {
                time: now,
                text: "Deploy task finished successfully".to_string(),
                level: TaskLogLevel::Light,
            });
        });
        info!(id, "deploy task completed");
    }

    /// One worker iteration: skip if anything is running, else pick the
    /// oldest waiting task and execute it under the deploy deadline.
    pub async fn deploy_tick(self: &Arc<Self>) {
        let running = match self.tasks.find(
            1,
            1,
            Some(&cond(serde_json::json!({"status": "running"}))),
            Some(&Sorter::asc("createAt")),
        ) {
            Ok(page) => page,
            Err(e) => {
                error!("Error finding running task items: {e:#}");
                return;
            }
        };
        if !running.items.is_empty() {
            return;
        }

        let waiting = match self.tasks.find(
            1,
            1,
            Some(&cond(serde_json::json!({"status": "waiting"}))),
            Some(&Sorter::asc("createAt")),
        ) {
            Ok(page) => page,
            Err(e) => {
                error!("Error finding task items: {e:#}");
                return;
            }
        };
        let Some(task) = waiting.items.into_iter().next() else {
            return;
        };

        let ctx = Ctx::new();
        let id = task.id.clone();
        info!(trace = %ctx.trace_id, id = %id, "Running task");
        let mut timeout_rx = self.bus.subscribe(&run_timeout_topic(&ctx.trace_id));

        self.task_log(&id, &format!("Running task {id}"), TaskLogLevel::Info);
        self.task_log(
            &id,
            &format!(
                "Repository: {}, Branch: {}",
                task.options.repo, task.options.branch
            ),
            TaskLogLevel::Info,
        );

        tokio::select! {
            _ = self.execute(&ctx, &task) => {}
            _ = timeout_rx.recv() => {
                self.force_timeout(&id, "Task run timeout");
            }
            _ = tokio::time::sleep(self.config.deploy_timeout()) => {
                self.force_timeout(&id, "Task timeout, Cancelled");
            }
        }
    }

    fn force_timeout(&self, id: &str, text: &str) {
        warn!(id, "{text}");
        self.mutate_task(id, |task| {
            if task.status.is_terminal() {
                return;
            }
            let now = chrono::Utc::now().timestamp_millis();
            task.status = TaskStatus::Timeout;
            task.finish_at = now;
            task.log.push(TaskLogEntry {
                time: now,
                text: text.to_string(),
                level: TaskLogLevel::Warn,
            });
        });
    }

    async fn execute(self: &Arc<Self>, ctx: &Ctx, task: &TaskRecord) {
        let id = task.id.clone();
        let code_dir = Path::new(WORK_DIR).join("code");

        if !task.rb {
            self.clone_sources(ctx, &id, task, &code_dir).await;
            if self.current_status(&id) != TaskStatus::Running {
                let _ = std::fs::remove_dir_all(&code_dir);
                return;
            }
        }

        let run_file = self.build_file(ctx, &id, task, &code_dir).await;
        let cleanup = || {
            let _ = std::fs::remove_dir_all(&code_dir);
        };
        if self.current_status(&id) != TaskStatus::Running {
            cleanup();
            return;
        }
        let Some(run_file) = run_file else {
            cleanup();
            return;
        };

        let engine = self.clone();
        let progress_id = id.clone();
        let progress: ProgressFn = Arc::new(move |line: String| {
            engine.task_log(&progress_id, &line, TaskLogLevel::Info);
        });
        if let Err(e) = self
            .supervisor
            .restart(ctx, &run_file, Some(progress), &id)
            .await
        {
            self.task_log(&id, &format!("Restart failed: {e}"), TaskLogLevel::Error);
        }
        cleanup();
        // The task stays running; run_started or the timeout sweep settles it.
    }

    async fn clone_sources(
        self: &Arc<Self>,
        ctx: &Ctx,
        id: &str,
        task: &TaskRecord,
        code_dir: &Path,
    ) {
        let log = |text: &str, level: TaskLogLevel| self.task_log(id, text, level);

        log(
            &format!(
                "Cloning repository: {}, {}",
                task.options.repo, task.options.branch
            ),
            TaskLogLevel::Light,
        );
        if task.options.repo.is_empty() || task.options.branch.is_empty() {
            log("Repository URL or branch is empty", TaskLogLevel::Error);
            return;
        }

        log("Getting latest git hash...", TaskLogLevel::Info);
        let hash = self
            .gitenv
            .latest_hash(ctx, &task.options.repo, &task.options.branch)
            .await;
        self.mutate_task(id, |t| t.git_hash = hash.clone());
        log(&format!("Git hash: {hash}"), TaskLogLevel::Light);

        if code_dir.exists() {
            log(
                &format!("Removing existing code directory: {}", code_dir.display()),
                TaskLogLevel::Warn,
            );
            if let Err(e) = std::fs::remove_dir_all(code_dir) {
                log(
                    &format!("Error removing code directory: {e}"),
                    TaskLogLevel::Error,
                );
                return;
            }
        }
        if let Err(e) = std::fs::create_dir_all(code_dir) {
            log(
                &format!("Error making code directory: {e}"),
                TaskLogLevel::Error,
            );
            return;
        }

        let main_dir = code_dir.join("main");
        let opts = RunOpts::default().with_timeout(CLONE_TIMEOUT);
        if let Err(e) = self
            .cmd
            .run(
                ctx,
                "git",
                &opts,
                &[
                    "clone",
                    "--depth",
                    "1",
                    "-b",
                    &task.options.branch,
                    &task.options.repo,
                    &main_dir.to_string_lossy(),
                ],
            )
            .await
        {
            log(&format!("Error cloning repository: {e}"), TaskLogLevel::Error);
            return;
        }
        log(
            &format!("Cloned repository: {}", main_dir.display()),
            TaskLogLevel::Light,
        );

        for other in &task.options.other_repos {
            if other.repo.is_empty() || other.dir.is_empty() {
                continue;
            }
            let sibling = code_dir.join(&other.dir);
            let branch = if other.branch.is_empty() {
                &task.options.branch
            } else {
                &other.branch
            };
            if let Err(e) = self
                .cmd
                .run(
                    ctx,
                    "git",
                    &opts,
                    &[
                        "clone",
                        "--depth",
                        "1",
                        "-b",
                        branch,
                        &other.repo,
                        &sibling.to_string_lossy(),
                    ],
                )
                .await
            {
                log(
                    &format!("Error cloning {}: {e}", other.repo),
                    TaskLogLevel::Error,
                );
                return;
            }
            log(
                &format!("Cloned sibling repository: {}", sibling.display()),
                TaskLogLevel::Light,
            );
        }

        let git_env = RunOpts::default()
            .with_env("GIT_DIR", main_dir.join(".git").to_string_lossy())
            .with_env("GIT_WORK_TREE", main_dir.to_string_lossy());
        match self
            .cmd
            .run(ctx, "git", &git_env, &["log", "-1", "--pretty=%B"])
            .await
        {
            Ok(commit) => {
                let commit = commit.trim().to_string();
                self.mutate_task(id, |t| t.commit = commit.clone());
                log(&format!("Commit message: {commit}"), TaskLogLevel::Light);
            }
            Err(e) => {
                log(
                    &format!("Error getting commit message: {e}"),
                    TaskLogLevel::Error,
                );
            }
        }
    }

    /// Produce the run file: rollback tasks reuse their backup, everything
    /// else compiles from the cloned tree. Returns the run-file name.
    async fn build_file(
        self: &Arc<Self>,
        ctx: &Ctx,
        id: &str,
        task: &TaskRecord,
        code_dir: &Path,
    ) -> Option<String> {
        let log = |text: &str, level: TaskLogLevel| self.task_log(id, text, level);
        let output_name = self.config.run_file_name();

        if task.rb && !task.build_file.is_empty() {
            if let Err(e) = copy_file(Path::new(&task.build_file), Path::new(&output_name)) {
                log(&format!("Error copying file: {e}"), TaskLogLevel::Error);
                return None;
            }
            log(
                &format!(
                    "Copied file {} to running directory: {output_name}",
                    task.build_file
                ),
                TaskLogLevel::Light,
            );
            return Some(output_name);
        }

        let build_dir = Path::new(WORK_DIR).join("build");
        if let Err(e) = std::fs::create_dir_all(&build_dir) {
            log(
                &format!("Error making build directory: {e}"),
                TaskLogLevel::Error,
            );
            return None;
        }

        let main_dir = code_dir.join("main");
        let dir_opts = RunOpts::default().with_dir(&main_dir);

        let mut env_list = match self.gitenv.go_env_get(ctx) {
            Ok(env) => env,
            Err(e) => {
                log(&format!("Error loading go env: {e}"), TaskLogLevel::Error);
                return None;
            }
        };
        if !self.probe_go_proxy().await {
            log(
                &format!("Go proxy unreachable, using {GO_PROXY_FALLBACK}"),
                TaskLogLevel::Warn,
            );
            env_list.push(crate::gitenv::GoEnv {
                key: "GOPROXY".to_string(),
                value: GO_PROXY_FALLBACK.to_string(),
                default: false,
            });
        }
        for env in &env_list {
            let assignment = format!("{}={}", env.key, env.value);
            if let Err(e) = self
                .cmd
                .run(ctx, "go", &dir_opts, &["env", "-w", &assignment])
                .await
            {
                log(
                    &format!("Error setting Go environment: {e}"),
                    TaskLogLevel::Error,
                );
                return None;
            }
            log(&format!("Set Go environment: {assignment}"), TaskLogLevel::Info);
        }

        if let Err(e) = self
            .cmd
            .run(
                ctx,
                "git",
                &dir_opts,
                &[
                    "config",
                    "--global",
                    "url.git@github.com:.insteadOf",
                    "https://github.com/",
                ],
            )
            .await
        {
            log(
                &format!("Error rewriting git urls: {e}"),
                TaskLogLevel::Warn,
            );
        }

        log("Running go mod tidy...", TaskLogLevel::Info);
        let tidy_opts = RunOpts::default()
            .with_dir(&main_dir)
            .with_timeout(TIDY_TIMEOUT);
        if let Err(e) = self
            .cmd
            .run(ctx, "go", &tidy_opts, &["mod", "tidy"])
            .await
        {
            log(&format!("Error running go mod tidy: {e}"), TaskLogLevel::Error);
            return None;
        }

        log("Finding main.go file...", TaskLogLevel::Info);
        let Some(main_go) = first_main_go(&main_dir) else {
            log("main.go not found in repository", TaskLogLevel::Error);
            return None;
        };
        log(
            &format!("Found main.go file: {}", main_go.display()),
            TaskLogLevel::Light,
        );

        log("Running go build...", TaskLogLevel::Info);
        let build_opts = RunOpts::default()
            .with_dir(&main_dir)
            .with_timeout(BUILD_TIMEOUT);
        if let Err(e) = self
            .cmd
            .run(
                ctx,
                "go",
                &build_opts,
                &[
                    "build",
                    "-o",
                    &output_name,
                    "-ldflags",
                    "-w -s",
                    "-trimpath",
                    &main_go.to_string_lossy(),
                ],
            )
            .await
        {
            log(&format!("Error building file: {e}"), TaskLogLevel::Error);
            return None;
        }
        let artifact = main_dir.join(&output_name);
        log(
            &format!("Build file: {}", artifact.display()),
            TaskLogLevel::Light,
        );

        if let Err(e) = copy_file(&artifact, Path::new(&output_name)) {
            log(&format!("Error copying file: {e}"), TaskLogLevel::Error);
            return None;
        }
        log(
            &format!("Copied file to running directory: {output_name}"),
            TaskLogLevel::Light,
        );

        let backup_name = format!(
            "{}_{}.linux64",
            output_name.trim_end_matches(".linux64"),
            chrono::Utc::now().timestamp()
        );
        let backup_path = build_dir.join(&backup_name);
        if let Err(e) = copy_file(&artifact, &backup_path) {
            log(
                &format!("Error copying file to backup directory: {e}"),
                TaskLogLevel::Error,
            );
            return None;
        }
        let backup_str = backup_path.to_string_lossy().to_string();
        self.mutate_task(id, |t| {
            t.build_file = backup_str.clone();
            t.rb_status = RbStatus::Ready;
        });
        log(
            &format!("Copied file to backup directory: {backup_str}"),
            TaskLogLevel::Light,
        );

        Some(output_name)
    }

    async fn probe_go_proxy(&self) -> bool {
        match self
            .http
            .head(GO_PROXY_PROBE)
            .timeout(PROXY_PROBE_TIMEOUT)
            .send()
            .await
        {
            Ok(resp) => resp.status().as_u16() < 500,
            Err(_) => false,
        }
    }

    // ------------------------------------------------------------------
    // Crons
    // ------------------------------------------------------------------

    /// Force long-running tasks to `timeout`. BuildFile and rbStatus are
    /// left untouched.
    pub fn timeout_sweep(&self) {
        let running = match self.tasks.find(
            1,
            10,
            Some(&cond(serde_json::json!({"status": "running"}))),
            Some(&Sorter::asc("createAt")),
        ) {
            Ok(page) => page,
            Err(e) => {
                error!("Error finding running task items: {e:#}");
                return;
            }
        };
        let deadline_ms = self.config.deploy_timeout().as_millis() as i64;
        let now = chrono::Utc::now().timestamp_millis();
        for task in running.items {
            if task.start_at > 0 && now - task.start_at > deadline_ms {
                self.force_timeout(&task.id, "Task timeout, Cancelled");
            }
        }
    }

    /// Keep only the newest `backup_count` build backups; mark the owning
    /// tasks as cleaned.
    pub fn clean_backup(&self) {
        let build_dir = Path::new(WORK_DIR).join("build");
        let Ok(entries) = std::fs::read_dir(&build_dir) else {
            return;
        };
        let mut backups: Vec<(std::time::SystemTime, PathBuf)> = entries
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_string_lossy()
                    .ends_with(".linux64")
            })
            .filter_map(|e| {
                let mtime = e.metadata().ok()?.modified().ok()?;
                Some((mtime, e.path()))
            })
            .collect();
        if backups.len() <= self.config.backup_count {
            return;
        }
        backups.sort_by(|a, b| b.0.cmp(&a.0));
        for (_, path) in backups.split_off(self.config.backup_count) {
            if let Err(e) = std::fs::remove_file(&path) {
                error!("Error removing backup file: {e}");
                continue;
            }
            info!("Removed backup file: {}", path.display());
            let path_str = path.to_string_lossy().to_string();
            match self
                .tasks
                .get(&cond(serde_json::json!({"buildFile": path_str})))
            {
                Ok(Some(_)) => self.mutate_task_by_build_file(&path_str),
                Ok(None) => {}
                Err(e) => error!("Error getting task item: {e:#}"),
            }
        }
    }

    fn mutate_task_by_build_file(&self, build_file: &str) {
        let key = cond(serde_json::json!({"buildFile": build_file}));
        if let Ok(Some(mut task)) = self.tasks.get(&key) {
            task.rb_status = RbStatus::Cleaned;
            task.log.push(TaskLogEntry {
                time: chrono::Utc::now().timestamp_millis(),
                text: format!("Backup file {build_file} removed"),
                level: TaskLogLevel::Warn,
            });
            if let Err(e) = self.tasks.update(&key, &task) {
                error!("Error updating task item: {e:#}");
            }
        }
    }

    /// Enqueue a system task when auto-trigger is on and the remote head
    /// has not been deployed yet.
    pub async fn auto_check(&self) {
        let Ok(Some(opts)) = self.get_config() else {
            return;
        };
        if !opts.auto_trigger {
            return;
        }
        let ctx = Ctx::new();
        let hash = self
            .gitenv
            .latest_hash(&ctx, &opts.repo, &opts.branch)
            .await;
        if hash.is_empty() {
            return;
        }
        match self.tasks.get(&cond(serde_json::json!({"gitHash": hash}))) {
            Ok(Some(_)) => {}
            Ok(None) => {
                if let Err(e) = self.start(&ctx, true) {
                    error!("Error starting task: {e}");
                }
            }
            Err(e) => error!("Error getting task item: {e:#}"),
        }
    }
}

/// Copy, falling back to write-then-rename when the destination is a
/// running binary (ETXTBSY).
pub fn copy_file(src: &Path, dst: &Path) -> std::io::Result<()> {
    match std::fs::copy(src, dst) {
        Ok(_) => Ok(()),
        Err(e) if e.raw_os_error() == Some(libc::ETXTBSY) => {
            let tmp = dst.with_extension("tmp");
            std::fs::copy(src, &tmp)?;
            std::fs::rename(&tmp, dst)?;
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// First `main.go` found walking the tree, relative to `root`.
pub fn first_main_go(root: &Path) -> Option<PathBuf> {
    fn walk(dir: &Path, root: &Path) -> Option<PathBuf> {
        let mut entries: Vec<_> = std::fs::read_dir(dir).ok()?.flatten().collect();
        entries.sort_by_key(|e| e.file_name());
        for entry in &entries {
            let path = entry.path();
            if path.is_file() && entry.file_name() == "main.go" {
                return path.strip_prefix(root).ok().map(|p| p.to_path_buf());
            }
        }
        for entry in &entries {
            let path = entry.path();
            if path.is_dir() {
                if let Some(found) = walk(&path, root) {
                    return Some(found);
                }
            }
        }
        None
    }
    walk(root, root)
}
