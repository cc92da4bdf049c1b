//! REST surface under `/om`.
//!
//! Everything except `/om/auth/connect` and `/om/app/restarted` sits behind
//! the token middleware. Handlers return the `{code, data, err}` envelope;
//! panics are converted to a generic 500 by the catch-panic layer.

use axum::extract::{ConnectInfo, Query, State};
use axum::http::{header, StatusCode};
use axum::middleware::Next;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::stream::{self, Stream, StreamExt};
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tracing::warn;

use crate::ctx::Ctx;
use crate::error::{ok, Envelope, OmError, OmResult};
use crate::gitenv::GoEnv;
use crate::logindex::{SearchOptions, CATEGORIES, LEVELS};
use crate::server::OmServices;
use crate::store::Granularity;
use crate::supervisor::StartSrc;

type AppState = Arc<OmServices>;

pub fn router(services: AppState) -> Router {
    let public = Router::new()
        .route("/om/auth/connect", post(auth_connect))
        .route("/om/app/restarted", get(app_restarted));

    let protected = Router::new()
        .route("/om/app/restart", post(app_restart))
        .route("/om/app/stop", post(app_stop))
        .route("/om/app/clean", post(app_clean))
        .route("/om/app/restart/logs", get(app_restart_logs))
        .route("/om/log/categories", get(log_categories))
        .route("/om/log/levels", get(log_levels))
        .route("/om/log/search", post(log_search))
        .route("/om/log/near", get(log_near))
        .route("/om/log/monitor", get(log_monitor))
        .route("/om/log/download", get(log_download))
        .route("/om/deploy/git/check", get(git_check))
        .route("/om/deploy/git/install", post(git_install))
        .route("/om/deploy/branches", get(git_branches))
        .route("/om/deploy/ssh/key", get(ssh_key_get).post(ssh_key_gen))
        .route("/om/deploy/go/check", get(go_check))
        .route("/om/deploy/go/install", post(go_install))
        .route("/om/deploy/go/env", get(go_env_get).post(go_env_set))
        .route(
            "/om/deploy/task/config",
            get(task_config_get).post(task_config_set),
        )
        .route("/om/deploy/task/start", post(task_start))
        .route("/om/deploy/task/stop", post(task_stop))
        .route("/om/deploy/task/page", get(task_page))
        .route("/om/deploy/task/get", get(task_get))
        .route("/om/deploy/task/rollback", post(task_rollback))
        .route("/om/host/usage", get(host_usage))
        .route("/om/host/usage/time", get(host_usage_time))
        .route("/om/stat/goroutine/time", get(goroutine_time))
        .route("/om/stat/error/time", get(error_time))
        .route("/om/stat/error/top", get(error_top))
        .route("/om/stat/api/summary", get(api_summary))
        .route("/om/stat/api/top", get(api_top))
        .route("/om/stat/api/sample", get(api_sample))
        .route("/om/stat/api/time", get(api_time))
        .route("/om/stat/mem/big/top", get(mem_big_top))
        .route("/om/stat/mem/big/count", get(mem_big_count))
        .route("/om/stat/mem/leak/latest", get(mem_leak_latest))
        .route("/om/stat/mem/leak/count", get(mem_leak_count))
        .route("/om/stat/mem/leak/page", get(mem_leak_page))
        .layer(axum::middleware::from_fn_with_state(
            services.clone(),
            auth_middleware,
        ));

    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    public
        .merge(protected)
        .layer(cors)
        .layer(CatchPanicLayer::custom(handle_panic))
        .with_state(services)
}

fn handle_panic(_err: Box<dyn std::any::Any + Send + 'static>) -> Response {
    let trace = Ctx::new().trace_id;
    warn!(trace = %trace, "handler panicked");
    let body = Envelope::<()> {
        code: "panic".to_string(),
        data: None,
        err: Some(format!("internal error, trace {trace}")),
    };
    (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
}

fn extract_token(req: &axum::extract::Request) -> Option<String> {
    if let Some(auth) = req.headers().get(header::AUTHORIZATION) {
        if let Ok(s) = auth.to_str() {
            if let Some(token) = s.strip_prefix("Bearer ") {
                return Some(token.to_string());
            }
        }
    }
    req.uri().query().and_then(|query| {
        query.split('&').find_map(|pair| {
            pair.strip_prefix("token=").map(|v| v.to_string())
        })
    })
}

async fn auth_middleware(
    State(services): State<AppState>,
    req: axum::extract::Request,
    next: Next,
) -> Response {
    let Some(token) = extract_token(&req) else {
        return forbidden();
    };
    match services.auth.verify_token(&token) {
        Ok(_) => next.run(req).await,
        Err(_) => forbidden(),
    }
}

fn forbidden() -> Response {
    let body = Envelope::<()> {
        code: "forbidden".to_string(),
        data: None,
        err: Some("forbidden".to_string()),
    };
    (StatusCode::FORBIDDEN, Json(body)).into_response()
}

fn csv(value: &Option<String>) -> Vec<String> {
    value
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect()
}

fn parse_unit(unit: &Option<String>) -> Option<Granularity> {
    unit.as_deref().and_then(Granularity::parse)
}

// ----------------------------------------------------------------------
// auth / app
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct ConnectReq {
    pwd: String,
}

async fn auth_connect(
    State(services): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    Json(req): Json<ConnectReq>,
) -> OmResult<impl IntoResponse> {
    let token = services.auth.connect(&addr.ip().to_string(), &req.pwd)?;
    Ok(ok(token))
}

async fn app_restart(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    let ctx = Ctx::new();
    let start_id = services.supervisor.restart(&ctx, "", None, "").await?;
    Ok(ok(start_id))
}

#[derive(Deserialize)]
struct RestartedQuery {
    #[serde(rename = "startID", default)]
    start_id: String,
    #[serde(rename = "itemID", default)]
    item_id: String,
    #[serde(default)]
    pid: i64,
    #[serde(default)]
    src: String,
}

async fn app_restarted(
    State(services): State<AppState>,
    Query(q): Query<RestartedQuery>,
) -> OmResult<impl IntoResponse> {
    let ctx = Ctx::new();
    services.supervisor.restart_success(
        &ctx,
        &q.start_id,
        &q.item_id,
        q.pid,
        StartSrc::parse(&q.src),
    )?;
    Ok(ok(()))
}

async fn app_stop(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    services.supervisor.stop(&Ctx::new()).await?;
    Ok(ok(()))
}

async fn app_clean(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    services.supervisor.clean(&Ctx::new())?;
    Ok(ok(()))
}

#[derive(Deserialize)]
struct PageQuery {
    #[serde(default)]
    page: i64,
    #[serde(default)]
    size: i64,
}

async fn app_restart_logs(
    State(services): State<AppState>,
    Query(q): Query<PageQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.supervisor.restart_page(q.page, q.size)?))
}

// ----------------------------------------------------------------------
// logs
// ----------------------------------------------------------------------

async fn log_categories() -> impl IntoResponse {
    ok(CATEGORIES)
}

async fn log_levels() -> impl IntoResponse {
    ok(LEVELS)
}

async fn log_search(
    State(services): State<AppState>,
    Json(opts): Json<SearchOptions>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.logs.search_logs(&opts)?))
}

#[derive(Deserialize)]
struct NearQuery {
    path: String,
    line: i64,
    range: i64,
}

async fn log_near(
    State(services): State<AppState>,
    Query(q): Query<NearQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.logs.context_lines(&q.path, q.line, q.range)?))
}

#[derive(Deserialize)]
struct MonitorQuery {
    #[serde(default)]
    categories: Option<String>,
    #[serde(default)]
    level: Option<String>,
    #[serde(rename = "traceID", default)]
    trace_id: Option<String>,
    #[serde(default)]
    keyword: Option<String>,
}

async fn log_monitor(
    State(services): State<AppState>,
    Query(q): Query<MonitorQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let opts = SearchOptions {
        categories: csv(&q.categories),
        level: q.level.unwrap_or_default(),
        trace_id: q.trace_id.unwrap_or_default(),
        keyword: q.keyword.unwrap_or_default(),
        ..Default::default()
    };
    let rx = services.logs.monitor(opts);
    let started = stream::once(async {
        Ok::<_, Infallible>(Event::default().data("monitoring started"))
    });
    let records = stream::unfold(rx, |mut rx| async move {
        let rec = rx.recv().await?;
        let event = Event::default()
            .json_data(&rec)
            .unwrap_or_else(|_| Event::default().data("serialize error"));
        Some((Ok::<_, Infallible>(event), rx))
    });
    Sse::new(started.chain(records).boxed()).keep_alive(KeepAlive::default())
}

#[derive(Deserialize)]
struct DownloadQuery {
    path: String,
}

async fn log_download(
    State(services): State<AppState>,
    Query(q): Query<DownloadQuery>,
) -> OmResult<Response> {
    let path = services.logs.validate_download(&q.path)?;
    let body = std::fs::read(&path)
        .map_err(|e| OmError::verify(format!("read log file: {e}")))?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "log.jsonl".to_string());
    Ok((
        [
            (header::CONTENT_TYPE, "application/octet-stream".to_string()),
            (
                header::CONTENT_DISPOSITION,
                format!("attachment; filename={filename}"),
            ),
        ],
        body,
    )
        .into_response())
}

// ----------------------------------------------------------------------
// deploy environment
// ----------------------------------------------------------------------

async fn git_check(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.check_git(&Ctx::new()).await)
}

async fn git_install(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.install_git(&Ctx::new()).await)
}

#[derive(Deserialize)]
struct BranchesQuery {
    #[serde(default)]
    repo: Option<String>,
}

async fn git_branches(
    State(services): State<AppState>,
    Query(q): Query<BranchesQuery>,
) -> OmResult<impl IntoResponse> {
    let repo = match q.repo.filter(|r| !r.is_empty()) {
        Some(repo) => repo,
        None => services
            .deploy
            .get_config()?
            .map(|c| c.repo)
            .filter(|r| !r.is_empty())
            .ok_or_else(|| OmError::verify("repository is not configured"))?,
    };
    Ok(ok(services.gitenv.branches(&Ctx::new(), &repo).await?))
}

async fn ssh_key_get(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.get_ssh_key(&Ctx::new()).await)
}

async fn ssh_key_gen(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.gen_ssh_key(&Ctx::new()).await)
}

async fn go_check(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.check_go(&Ctx::new()).await)
}

async fn go_install(State(services): State<AppState>) -> impl IntoResponse {
    ok(services.gitenv.install_go(&Ctx::new()).await)
}

async fn go_env_get(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    Ok(ok(services.gitenv.go_env_get(&Ctx::new())?))
}

async fn go_env_set(
    State(services): State<AppState>,
    Json(env): Json<Vec<GoEnv>>,
) -> OmResult<impl IntoResponse> {
    services.gitenv.go_env_set(&Ctx::new(), env).await?;
    Ok(ok(()))
}

// ----------------------------------------------------------------------
// deploy tasks
// ----------------------------------------------------------------------

async fn task_config_get(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    Ok(ok(services.deploy.get_config()?))
}

async fn task_config_set(
    State(services): State<AppState>,
    Json(opts): Json<crate::deploy::TaskOptions>,
) -> OmResult<impl IntoResponse> {
    services.deploy.save_config(&Ctx::new(), &opts)?;
    Ok(ok(()))
}

async fn task_start(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    Ok(ok(services.deploy.start(&Ctx::new(), false)?))
}

#[derive(Deserialize)]
struct TaskIdQuery {
    id: String,
}

async fn task_stop(
    State(services): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> OmResult<impl IntoResponse> {
    services.deploy.stop(&Ctx::new(), &q.id)?;
    Ok(ok(()))
}

async fn task_page(
    State(services): State<AppState>,
    Query(q): Query<PageQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.deploy.page(q.page, q.size)?))
}

async fn task_get(
    State(services): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> OmResult<impl IntoResponse> {
    let task = services
        .deploy
        .get(&q.id)?
        .ok_or_else(|| OmError::verify("Task not found"))?;
    Ok(ok(task))
}

async fn task_rollback(
    State(services): State<AppState>,
    Query(q): Query<TaskIdQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.deploy.rollback(&Ctx::new(), &q.id)?))
}

// ----------------------------------------------------------------------
// telemetry
// ----------------------------------------------------------------------

async fn host_usage(
    State(services): State<AppState>,
    Query(q): Query<PageQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.host.page(q.page, q.size)?))
}

#[derive(Deserialize)]
struct TimeRangeQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default)]
    unit: Option<String>,
    #[serde(default)]
    filter: Option<String>,
}

async fn host_usage_time(
    State(services): State<AppState>,
    Query(q): Query<TimeRangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.host.time_range(
        q.start,
        q.end,
        parse_unit(&q.unit),
        &csv(&q.filter),
    )?))
}

async fn goroutine_time(
    State(services): State<AppState>,
    Query(q): Query<TimeRangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services
        .threads
        .time_range(q.start, q.end, parse_unit(&q.unit))?))
}

async fn error_time(
    State(services): State<AppState>,
    Query(q): Query<TimeRangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.errstat.time_range(
        q.start,
        q.end,
        parse_unit(&q.unit),
        &csv(&q.filter),
    )?))
}

#[derive(Deserialize)]
struct ErrTopQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    limit: i64,
}

async fn error_top(
    State(services): State<AppState>,
    Query(q): Query<ErrTopQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.errstat.top_signatures(
        q.start,
        q.end,
        &csv(&q.filter),
        q.limit,
    )?))
}

#[derive(Deserialize)]
struct SummaryQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(rename = "slowMs", default)]
    slow_ms: i64,
}

async fn api_summary(
    State(services): State<AppState>,
    Query(q): Query<SummaryQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.apistat.summary(q.start, q.end, q.slow_ms)?))
}

#[derive(Deserialize)]
struct ApiTopQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default)]
    page: i64,
    #[serde(default)]
    size: i64,
    #[serde(default)]
    methods: Option<String>,
    #[serde(rename = "negMethods", default)]
    neg_methods: Option<String>,
    #[serde(rename = "uriPrefix", default)]
    uri_prefix: Option<String>,
    #[serde(default)]
    statuses: Option<String>,
    #[serde(rename = "sortBy", default)]
    sort_by: Option<String>,
    #[serde(default)]
    asc: bool,
}

async fn api_top(
    State(services): State<AppState>,
    Query(q): Query<ApiTopQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.apistat.top_page(
        q.start,
        q.end,
        q.page,
        q.size,
        &csv(&q.methods),
        &csv(&q.neg_methods),
        q.uri_prefix.as_deref().unwrap_or_default(),
        &csv(&q.statuses),
        q.sort_by.as_deref().unwrap_or_default(),
        q.asc,
    )?))
}

#[derive(Deserialize)]
struct ApiSampleQuery {
    method: String,
    uri: String,
    #[serde(default)]
    types: Option<String>,
}

async fn api_sample(
    State(services): State<AppState>,
    Query(q): Query<ApiSampleQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services
        .apistat
        .sample(&q.method, &q.uri, &csv(&q.types))?))
}

async fn api_time(
    State(services): State<AppState>,
    Query(q): Query<TimeRangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.apistat.time_range(
        q.start,
        q.end,
        parse_unit(&q.unit),
        &csv(&q.filter),
    )?))
}

// ----------------------------------------------------------------------
// memory
// ----------------------------------------------------------------------

#[derive(Deserialize)]
struct MemTopQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default)]
    page: i64,
    #[serde(default)]
    size: i64,
    #[serde(rename = "sortBy", default)]
    sort_by: Option<String>,
    #[serde(default)]
    asc: bool,
}

async fn mem_big_top(
    State(services): State<AppState>,
    Query(q): Query<MemTopQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.memstat.big_top(
        q.start,
        q.end,
        q.page,
        q.size,
        q.sort_by.as_deref().unwrap_or_default(),
        q.asc,
    )?))
}

#[derive(Deserialize)]
struct RangeQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
}

async fn mem_big_count(
    State(services): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.memstat.big_count(q.start, q.end)?))
}

async fn mem_leak_latest(State(services): State<AppState>) -> OmResult<impl IntoResponse> {
    Ok(ok(services.memstat.leak_latest()?))
}

async fn mem_leak_count(
    State(services): State<AppState>,
    Query(q): Query<RangeQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services.memstat.leak_count(q.start, q.end)?))
}

#[derive(Deserialize)]
struct LeakPageQuery {
    #[serde(default)]
    start: i64,
    #[serde(default)]
    end: i64,
    #[serde(default)]
    page: i64,
    #[serde(default)]
    size: i64,
}

async fn mem_leak_page(
    State(services): State<AppState>,
    Query(q): Query<LeakPageQuery>,
) -> OmResult<impl IntoResponse> {
    Ok(ok(services
        .memstat
        .leak_page(q.start, q.end, q.page, q.size)?))
}
