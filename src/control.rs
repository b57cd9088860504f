//! Local control plane: the token-gated HTTP surface a UI or CLI uses to
//! observe and steer the daemon, plus the in-memory upload registry and
//! per-file status board it serves from.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{
    extract::{Path as UrlPath, Query, State},
    http::{HeaderMap, StatusCode},
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, Notify};
use uuid::Uuid;
use walkdir::WalkDir;

use crate::http::ApiClient;
use crate::subscriptions::{self, Action, Subscriptions};
use crate::telemetry::{HttpStats, LatencyStats};

const BIND_ATTEMPTS: u32 = 5;
const BIND_RETRY_DELAY: Duration = Duration::from_millis(200);
const EVENT_BUFFER: usize = 1024;
const LATENCY_PING_EVERY: Duration = Duration::from_secs(30);

// ---------------------------------------------------------------------------
// per-file status board

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncState {
    Pending,
    Syncing,
    Completed,
    Error,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum ConflictState {
    None,
    Conflicted,
    Rejected,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct FileStatus {
    path: String,
    state: SyncState,
    conflict_state: ConflictState,
    progress: f64,
    #[serde(skip_serializing_if = "String::is_empty", default)]
    error: String,
    #[serde(skip_serializing_if = "is_zero", default)]
    error_count: i64,
    updated_at: DateTime<Utc>,
}

fn is_zero(v: &i64) -> bool {
    *v == 0
}

/// Last-known sync state per path, with a broadcast feed for SSE clients.
struct StatusBoard {
    files: Mutex<HashMap<String, FileStatus>>,
    events: broadcast::Sender<FileStatus>,
}

impl StatusBoard {
    fn new() -> Self {
        Self {
            files: Mutex::new(HashMap::new()),
            events: broadcast::channel(EVENT_BUFFER).0,
        }
    }

    fn update(&self, path: &str, apply: impl FnOnce(&mut FileStatus)) {
        let mut files = self.files.lock().unwrap();
        let entry = files.entry(path.to_string()).or_insert_with(|| FileStatus {
            path: path.to_string(),
            state: SyncState::Pending,
            conflict_state: ConflictState::None,
            progress: 0.0,
            error: String::new(),
            error_count: 0,
            updated_at: Utc::now(),
        });
        apply(entry);
        entry.progress = entry.progress.clamp(0.0, 100.0);
        entry.updated_at = Utc::now();
        let _ = self.events.send(entry.clone());
    }

    fn get(&self, path: &str) -> Option<FileStatus> {
        self.files.lock().unwrap().get(path).cloned()
    }

    fn all_sorted(&self) -> Vec<FileStatus> {
        let mut out: Vec<FileStatus> = self.files.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.path.cmp(&b.path));
        out
    }

    fn subscribe(&self) -> broadcast::Receiver<FileStatus> {
        self.events.subscribe()
    }
}

// ---------------------------------------------------------------------------
// upload registry

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadState {
    Pending,
    Uploading,
    Paused,
    Restarted,
    Completed,
    Error,
}

#[derive(Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UploadEntry {
    id: String,
    key: String,
    state: UploadState,
    #[serde(skip_serializing_if = "Option::is_none")]
    local_path: Option<String>,
    size: i64,
    uploaded_bytes: i64,
    part_size: Option<i64>,
    part_count: Option<i64>,
    completed_parts: Vec<i64>,
    progress: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
    started_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl UploadEntry {
    fn recompute_progress(&mut self) {
        if self.size > 0 {
            self.progress = ((self.uploaded_bytes as f64) * 100.0 / (self.size as f64))
                .clamp(0.0, 100.0);
        }
    }
}

/// Live view of every transfer the uploader is (or was recently) driving.
/// The uploader writes; the HTTP surface reads and flips pause/resume/
/// restart states that the uploader polls between parts.
struct UploadRegistry {
    entries: Mutex<HashMap<String, UploadEntry>>,
}

impl UploadRegistry {
    fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Register (or refresh) the entry for a key. An existing entry that
    /// has not completed is reused so a retried upload keeps its id and
    /// any pause/restart request attached to it.
    fn upsert(
        &self,
        key: &str,
        local_path: Option<String>,
        size: i64,
        part_size: Option<i64>,
        part_count: Option<i64>,
    ) -> (String, f64) {
        let mut entries = self.entries.lock().unwrap();
        for entry in entries.values_mut() {
            if entry.key == key && entry.state != UploadState::Completed {
                entry.size = size;
                if local_path.is_some() {
                    entry.local_path = local_path;
                }
                entry.part_size = part_size;
                entry.part_count = part_count;
                entry.updated_at = Utc::now();
                return (entry.id.clone(), entry.progress);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        entries.insert(
            id.clone(),
            UploadEntry {
                id: id.clone(),
                key: key.to_string(),
                state: UploadState::Uploading,
                local_path,
                size,
                uploaded_bytes: 0,
                part_size,
                part_count,
                completed_parts: Vec::new(),
                progress: 0.0,
                error: None,
                started_at: now,
                updated_at: now,
            },
        );
        (id, 0.0)
    }

    fn with_entry<T>(&self, id: &str, apply: impl FnOnce(&mut UploadEntry) -> T) -> Option<T> {
        let mut entries = self.entries.lock().unwrap();
        let entry = entries.get_mut(id)?;
        let out = apply(entry);
        entry.updated_at = Utc::now();
        Some(out)
    }

    fn state_of(&self, id: &str) -> Option<UploadState> {
        self.entries.lock().unwrap().get(id).map(|e| e.state)
    }

    fn key_of(&self, id: &str) -> Option<String> {
        self.entries.lock().unwrap().get(id).map(|e| e.key.clone())
    }

    fn remove(&self, id: &str) -> Option<UploadEntry> {
        self.entries.lock().unwrap().remove(id)
    }

    fn list(&self) -> Vec<UploadEntry> {
        let mut out: Vec<UploadEntry> = self.entries.lock().unwrap().values().cloned().collect();
        out.sort_by(|a, b| a.started_at.cmp(&b.started_at));
        out
    }
}

// ---------------------------------------------------------------------------
// control plane

struct ControlState {
    token: String,
    board: StatusBoard,
    registry: UploadRegistry,
    sync_now: Notify,
    http_stats: Arc<HttpStats>,
    latency: Arc<LatencyStats>,
    data_dir: PathBuf,
    owner_email: String,
    api: Option<ApiClient>,
}

#[derive(Clone)]
pub struct ControlPlane {
    state: Arc<ControlState>,
    bound_addr: SocketAddr,
}

impl std::fmt::Debug for ControlPlane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ControlPlane")
            .field("bound_addr", &self.bound_addr)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone)]
pub struct ControlPlaneStartResult {
    pub control_plane: ControlPlane,
    pub bound_addr: SocketAddr,
}

impl ControlPlane {
    /// Bind and serve the control plane. The requested port is retried a
    /// few times (it may sit in TIME_WAIT right after a restart), then the
    /// daemon falls back to an OS-assigned port; the caller learns the
    /// actual address either way.
    pub async fn start_async(
        addr: &str,
        token: Option<String>,
        http_stats: Arc<HttpStats>,
        shutdown: Option<Arc<Notify>>,
        data_dir: PathBuf,
        owner_email: String,
        server_url: String,
        api: Option<ApiClient>,
    ) -> Result<ControlPlaneStartResult> {
        let token = token.unwrap_or_else(|| Uuid::new_v4().as_simple().to_string());
        crate::logging::info_kv(
            "control plane starting",
            &[("requested_addr", addr), ("token", token.as_str())],
        );

        let requested: SocketAddr = addr.parse().with_context(|| {
            format!("invalid control plane address {addr:?} (use a numeric ip, not a hostname)")
        })?;
        let listener = bind_with_fallback(requested).await?;
        let bound_addr = listener.local_addr()?;

        let state = Arc::new(ControlState {
            token,
            board: StatusBoard::new(),
            registry: UploadRegistry::new(),
            sync_now: Notify::new(),
            http_stats,
            latency: Arc::new(LatencyStats::new(server_url)),
            data_dir,
            owner_email,
            api: api.clone(),
        });

        if let Some(api) = api {
            spawn_latency_pinger(api, state.latency.clone(), shutdown.clone());
        }

        let app = build_router(state.clone());
        let graceful = shutdown.clone();
        tokio::spawn(async move {
            let served = match graceful {
                Some(shutdown) => {
                    axum::serve(listener, app)
                        .with_graceful_shutdown(async move { shutdown.notified().await })
                        .await
                }
                None => axum::serve(listener, app).await,
            };
            if let Err(err) = served {
                crate::logging::error(format!("control plane server error: {err}"));
            }
        });

        crate::logging::info_kv("control plane ready", &[("addr", &bound_addr.to_string())]);
        Ok(ControlPlaneStartResult {
            control_plane: ControlPlane { state, bound_addr },
            bound_addr,
        })
    }

    /// Blocking wrapper used from sync startup code already inside tokio.
    pub fn start(
        addr: &str,
        token: Option<String>,
        http_stats: Arc<HttpStats>,
        shutdown: Option<Arc<Notify>>,
        data_dir: PathBuf,
        owner_email: String,
        server_url: String,
        api: Option<ApiClient>,
    ) -> Result<ControlPlaneStartResult> {
        tokio::task::block_in_place(|| {
            tokio::runtime::Handle::current().block_on(Self::start_async(
                addr,
                token,
                http_stats,
                shutdown,
                data_dir,
                owner_email,
                server_url,
                api,
            ))
        })
    }

    pub fn bound_addr(&self) -> SocketAddr {
        self.bound_addr
    }

    pub async fn wait_sync_now(&self) {
        self.state.sync_now.notified().await;
    }

    /// Request a reconciliation pass, same as `POST /v1/sync/now`. Used by
    /// the priority channel and watcher to wake the sync loop early.
    pub fn trigger_sync(&self) {
        self.state.sync_now.notify_one();
    }

    // -- status board writers used by the sync engine --

    pub fn set_sync_syncing(&self, key: &str, progress: f64) {
        self.state.board.update(key, |s| {
            s.state = SyncState::Syncing;
            s.progress = progress;
            s.error.clear();
        });
    }

    pub fn set_sync_completed(&self, key: &str) {
        self.state.board.update(key, |s| {
            s.state = SyncState::Completed;
            s.progress = 100.0;
            s.error.clear();
        });
    }

    pub fn set_sync_conflicted(&self, key: &str) {
        self.state.board.update(key, |s| {
            s.state = SyncState::Completed;
            s.conflict_state = ConflictState::Conflicted;
            s.progress = 100.0;
        });
    }

    pub fn set_sync_rejected(&self, key: &str) {
        self.state.board.update(key, |s| {
            s.state = SyncState::Completed;
            s.conflict_state = ConflictState::Rejected;
            s.progress = 100.0;
        });
    }

    pub fn set_sync_error(&self, key: &str, err: &str) {
        self.state.board.update(key, |s| {
            s.state = SyncState::Error;
            s.error = err.to_string();
            s.error_count += 1;
        });
    }

    // -- upload registry writers used by the uploader --

    pub fn upsert_upload(
        &self,
        key: String,
        local_path: Option<String>,
        size: i64,
        part_size: Option<i64>,
        part_count: Option<i64>,
    ) -> String {
        let (id, progress) = self
            .state
            .registry
            .upsert(&key, local_path, size, part_size, part_count);
        self.set_sync_syncing(&key, progress);
        id
    }

    pub fn update_upload_progress(&self, id: &str, uploaded_bytes: i64, completed_parts: Vec<i64>) {
        let progressed = self.state.registry.with_entry(id, |entry| {
            entry.uploaded_bytes = uploaded_bytes.max(0);
            entry.completed_parts = completed_parts;
            entry.recompute_progress();
            (entry.key.clone(), entry.progress)
        });
        if let Some((key, progress)) = progressed {
            self.set_sync_syncing(&key, progress);
        }
    }

    pub fn set_upload_state(&self, id: &str, state: UploadState, error: Option<String>) {
        let changed = self.state.registry.with_entry(id, |entry| {
            entry.state = state;
            entry.error = error.clone();
            (entry.key.clone(), entry.progress)
        });
        let Some((key, progress)) = changed else {
            return;
        };
        match (state, error) {
            (_, Some(err)) => self.set_sync_error(&key, &err),
            (UploadState::Uploading, None) => self.set_sync_syncing(&key, progress),
            (UploadState::Completed, None) => self.set_sync_completed(&key),
            (_, None) => self.state.board.update(&key, |s| {
                s.state = SyncState::Pending;
            }),
        }
    }

    pub fn set_upload_error(&self, id: &str, err: String) {
        self.set_upload_state(id, UploadState::Error, Some(err));
    }

    /// Completed sessions leave the registry immediately; only the status
    /// board remembers the finished transfer.
    pub fn set_upload_completed(&self, id: &str, uploaded_bytes: i64) {
        self.state.registry.with_entry(id, |entry| {
            entry.state = UploadState::Completed;
            entry.error = None;
            entry.uploaded_bytes = uploaded_bytes.max(0);
            entry.progress = 100.0;
        });
        if let Some(key) = self.state.registry.key_of(id) {
            self.set_sync_completed(&key);
        }
        self.state.registry.remove(id);
    }

    /// `None` means the entry is gone, i.e. the upload was cancelled.
    pub fn get_upload_state(&self, id: &str) -> Option<UploadState> {
        self.state.registry.state_of(id)
    }
}

async fn bind_with_fallback(requested: SocketAddr) -> Result<tokio::net::TcpListener> {
    let mut last_err = None;
    for attempt in 1..=BIND_ATTEMPTS {
        match tokio::net::TcpListener::bind(requested).await {
            Ok(listener) => return Ok(listener),
            Err(err) => {
                crate::logging::info_kv(
                    "control plane bind failed, retrying",
                    &[
                        ("addr", &requested.to_string()),
                        ("attempt", &attempt.to_string()),
                        ("error", &err.to_string()),
                    ],
                );
                last_err = Some(err);
                if attempt < BIND_ATTEMPTS {
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
            }
        }
    }

    let fallback = SocketAddr::new(requested.ip(), 0);
    match tokio::net::TcpListener::bind(fallback).await {
        Ok(listener) => {
            crate::logging::info_kv(
                "control plane fell back to os-assigned port",
                &[("requested", &requested.to_string())],
            );
            Ok(listener)
        }
        Err(fallback_err) => Err(anyhow::anyhow!(
            "control plane could not bind {requested} ({}) nor an os-assigned port ({fallback_err})",
            last_err.map(|e| e.to_string()).unwrap_or_default()
        )),
    }
}

/// Periodically time a healthz round trip so `/v1/stats/latency` has data.
fn spawn_latency_pinger(api: ApiClient, latency: Arc<LatencyStats>, shutdown: Option<Arc<Notify>>) {
    tokio::spawn(async move {
        loop {
            let started = std::time::Instant::now();
            if api.healthz().await.is_ok() {
                latency.record(started.elapsed().as_millis() as u64);
            }
            match &shutdown {
                Some(shutdown) => {
                    tokio::select! {
                        _ = shutdown.notified() => return,
                        _ = tokio::time::sleep(LATENCY_PING_EVERY) => {}
                    }
                }
                None => tokio::time::sleep(LATENCY_PING_EVERY).await,
            }
        }
    });
}

// ---------------------------------------------------------------------------
// http surface

fn build_router(state: Arc<ControlState>) -> Router {
    let authed = Router::new()
        .route("/v1/sync/status", get(sync_status))
        .route("/v1/sync/status/file", get(sync_status_file))
        .route("/v1/sync/queue", get(sync_queue))
        .route("/v1/sync/conflicts", get(sync_conflicts))
        .route("/v1/sync/now", post(sync_now))
        .route("/v1/sync/refresh", post(sync_refresh))
        .route("/v1/sync/cleanup", post(sync_cleanup))
        .route("/v1/uploads/", get(uploads_list))
        .route("/v1/uploads/:id", get(uploads_get).delete(uploads_cancel))
        .route("/v1/uploads/:id/pause", post(uploads_pause))
        .route("/v1/uploads/:id/resume", post(uploads_resume))
        .route("/v1/uploads/:id/restart", post(uploads_restart))
        .route(
            "/v1/subscriptions",
            get(subscriptions_get).put(subscriptions_put),
        )
        .route("/v1/subscriptions/effective", get(subscriptions_effective))
        .route(
            "/v1/subscriptions/rules",
            post(subscription_rule_add).delete(subscription_rule_delete),
        )
        .route("/v1/discovery/files", get(discovery_files))
        .route("/v1/publications", get(publications))
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            require_bearer_token,
        ));

    // `/v1/status` and the latency probe are open so dashboards can poll
    // without credentials; SSE authenticates via query parameter because
    // EventSource cannot set headers.
    Router::new()
        .route("/v1/status", get(daemon_status))
        .route("/v1/stats/latency", get(latency_stats))
        .route("/v1/sync/events", get(sync_events))
        .merge(authed)
        .with_state(state)
}

async fn require_bearer_token(
    State(state): State<Arc<ControlState>>,
    headers: HeaderMap,
    req: axum::http::Request<axum::body::Body>,
    next: axum::middleware::Next,
) -> Response {
    let presented = headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "));
    if presented == Some(state.token.as_str()) {
        next.run(req).await
    } else {
        api_error(StatusCode::UNAUTHORIZED, "unauthorized")
    }
}

fn api_error(status: StatusCode, message: impl ToString) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": message.to_string() })),
    )
        .into_response()
}

#[derive(Serialize)]
struct DaemonStatus {
    status: &'static str,
    ts: String,
    version: &'static str,
    revision: &'static str,
    #[serde(rename = "buildDate")]
    build_date: &'static str,
    runtime: RuntimeStatus,
}

#[derive(Serialize)]
struct RuntimeStatus {
    http: HttpCounters,
}

#[derive(Serialize)]
struct HttpCounters {
    bytes_sent_total: i64,
    bytes_recv_total: i64,
    #[serde(skip_serializing_if = "String::is_empty")]
    last_error: String,
}

async fn daemon_status(State(state): State<Arc<ControlState>>) -> Response {
    let http = state.http_stats.snapshot();
    Json(DaemonStatus {
        status: "ok",
        ts: Utc::now().to_rfc3339(),
        version: env!("CARGO_PKG_VERSION"),
        revision: option_env!("SYFTBOX_REVISION").unwrap_or(""),
        build_date: option_env!("SYFTBOX_BUILD_DATE").unwrap_or(""),
        runtime: RuntimeStatus {
            http: HttpCounters {
                bytes_sent_total: http.bytes_sent_total,
                bytes_recv_total: http.bytes_recv_total,
                last_error: http.last_error,
            },
        },
    })
    .into_response()
}

async fn latency_stats(State(state): State<Arc<ControlState>>) -> Response {
    Json(state.latency.snapshot()).into_response()
}

#[derive(Serialize, Default)]
struct SyncSummary {
    pending: usize,
    syncing: usize,
    completed: usize,
    error: usize,
}

async fn sync_status(State(state): State<Arc<ControlState>>) -> Response {
    let files = state.board.all_sorted();
    let mut summary = SyncSummary::default();
    for f in &files {
        match f.state {
            SyncState::Pending => summary.pending += 1,
            SyncState::Syncing => summary.syncing += 1,
            SyncState::Completed => summary.completed += 1,
            SyncState::Error => summary.error += 1,
        }
    }
    Json(serde_json::json!({ "files": files, "summary": summary })).into_response()
}

#[derive(Deserialize)]
struct PathQuery {
    path: String,
}

async fn sync_status_file(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<PathQuery>,
) -> Response {
    if q.path.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "path is required");
    }
    match state.board.get(&q.path) {
        Some(status) => Json(status).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "unknown path"),
    }
}

async fn sync_queue(State(state): State<Arc<ControlState>>) -> Response {
    let files: Vec<FileStatus> = state
        .board
        .all_sorted()
        .into_iter()
        .filter(|f| matches!(f.state, SyncState::Pending | SyncState::Syncing))
        .collect();
    Json(serde_json::json!({ "files": files })).into_response()
}

async fn sync_now(State(state): State<Arc<ControlState>>) -> Response {
    state.sync_now.notify_one();
    Json(serde_json::json!({ "status": "sync triggered" })).into_response()
}

async fn sync_refresh(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<HashMap<String, String>>,
) -> Response {
    state.sync_now.notify_one();
    let mut body = serde_json::json!({ "status": "sync triggered" });
    if let Some(path) = q.get("path") {
        body["path"] = serde_json::Value::String(path.clone());
    }
    Json(body).into_response()
}

#[derive(Deserialize)]
struct SseQuery {
    token: Option<String>,
}

async fn sync_events(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<SseQuery>,
) -> Response {
    if q.token.as_deref() != Some(state.token.as_str()) {
        return api_error(StatusCode::UNAUTHORIZED, "unauthorized");
    }
    let rx = state.board.subscribe();
    let stream = futures_util::stream::unfold(rx, |mut rx| async move {
        loop {
            match rx.recv().await {
                Ok(status) => {
                    let data =
                        serde_json::to_string(&status).unwrap_or_else(|_| "{}".to_string());
                    let event = Event::default().event("sync").data(data);
                    return Some((Ok::<_, std::convert::Infallible>(event), rx));
                }
                // A slow consumer just skips ahead.
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => return None,
            }
        }
    });
    Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response()
}

// -- uploads --

async fn uploads_list(State(state): State<Arc<ControlState>>) -> Response {
    Json(serde_json::json!({ "uploads": state.registry.list() })).into_response()
}

async fn uploads_get(
    State(state): State<Arc<ControlState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    let entry = state.registry.entries.lock().unwrap().get(&id).cloned();
    match entry {
        Some(entry) => Json(entry).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "unknown upload"),
    }
}

async fn uploads_cancel(
    State(state): State<Arc<ControlState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    match state.registry.remove(&id) {
        Some(_) => Json(serde_json::json!({ "status": "cancelled" })).into_response(),
        None => api_error(StatusCode::NOT_FOUND, "unknown upload"),
    }
}

/// Shared shape for the three state-transition endpoints: look the entry
/// up, check the transition is legal, flip it, and mirror the change onto
/// the status board.
fn transition_upload(
    state: &ControlState,
    id: &str,
    allowed_from: &[UploadState],
    to: UploadState,
    board_state: SyncState,
    verb: &str,
) -> Response {
    let Some(current) = state.registry.state_of(id) else {
        return api_error(StatusCode::NOT_FOUND, "unknown upload");
    };
    if !allowed_from.contains(&current) {
        return api_error(
            StatusCode::BAD_REQUEST,
            format!("cannot {verb} an upload in state {current:?}"),
        );
    }
    let key = state.registry.with_entry(id, |entry| {
        entry.state = to;
        if to == UploadState::Restarted {
            entry.uploaded_bytes = 0;
            entry.completed_parts.clear();
            entry.progress = 0.0;
        }
        entry.key.clone()
    });
    if let Some(key) = key {
        state.board.update(&key, |s| {
            s.state = board_state;
            if to == UploadState::Restarted {
                s.progress = 0.0;
            }
        });
    }
    Json(serde_json::json!({ "status": verb })).into_response()
}

async fn uploads_pause(
    State(state): State<Arc<ControlState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    transition_upload(
        &state,
        &id,
        &[UploadState::Uploading, UploadState::Pending],
        UploadState::Paused,
        SyncState::Pending,
        "paused",
    )
}

async fn uploads_resume(
    State(state): State<Arc<ControlState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    transition_upload(
        &state,
        &id,
        &[UploadState::Paused],
        UploadState::Uploading,
        SyncState::Syncing,
        "resumed",
    )
}

async fn uploads_restart(
    State(state): State<Arc<ControlState>>,
    UrlPath(id): UrlPath<String>,
) -> Response {
    transition_upload(
        &state,
        &id,
        &[
            UploadState::Uploading,
            UploadState::Paused,
            UploadState::Pending,
            UploadState::Error,
            UploadState::Restarted,
        ],
        UploadState::Restarted,
        SyncState::Pending,
        "restarted",
    )
}

// -- subscriptions --

fn load_subscription_config(state: &ControlState) -> (PathBuf, Subscriptions) {
    let path = subscriptions::config_path(&state.data_dir);
    let cfg = subscriptions::load(&path).unwrap_or_else(|err| {
        crate::logging::error(format!(
            "subscriptions load error path={} err={err:?}",
            path.display()
        ));
        subscriptions::default_config()
    });
    (path, cfg)
}

fn save_subscriptions_and_wake(
    state: &ControlState,
    path: &Path,
    cfg: &Subscriptions,
) -> Option<Response> {
    if let Err(err) = subscriptions::save(path, cfg) {
        return Some(api_error(StatusCode::INTERNAL_SERVER_ERROR, err));
    }
    state.sync_now.notify_one();
    None
}

fn subscriptions_response(path: &Path, cfg: Subscriptions) -> Response {
    Json(serde_json::json!({
        "path": path.display().to_string(),
        "config": cfg,
    }))
    .into_response()
}

async fn subscriptions_get(State(state): State<Arc<ControlState>>) -> Response {
    let (path, cfg) = load_subscription_config(&state);
    subscriptions_response(&path, cfg)
}

#[derive(Deserialize)]
struct SubscriptionsPutBody {
    config: Subscriptions,
}

async fn subscriptions_put(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<SubscriptionsPutBody>,
) -> Response {
    let path = subscriptions::config_path(&state.data_dir);
    if let Some(err) = save_subscriptions_and_wake(&state, &path, &body.config) {
        return err;
    }
    subscriptions_response(&path, body.config)
}

#[derive(Deserialize)]
struct RuleBody {
    rule: subscriptions::Rule,
}

async fn subscription_rule_add(
    State(state): State<Arc<ControlState>>,
    Json(body): Json<RuleBody>,
) -> Response {
    if body.rule.path.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "rule.path is required");
    }
    let (path, mut cfg) = load_subscription_config(&state);

    // One rule per (datasite, path): a re-add updates the action in place.
    match cfg
        .rules
        .iter_mut()
        .find(|r| r.datasite == body.rule.datasite && r.path == body.rule.path)
    {
        Some(existing) => existing.action = body.rule.action,
        None => cfg.rules.push(body.rule),
    }

    if let Some(err) = save_subscriptions_and_wake(&state, &path, &cfg) {
        return err;
    }
    subscriptions_response(&path, cfg)
}

#[derive(Deserialize)]
struct RuleDeleteQuery {
    datasite: Option<String>,
    path: String,
    action: Option<String>,
}

fn parse_action(raw: &str) -> Option<Action> {
    match raw.trim().to_lowercase().as_str() {
        "allow" => Some(Action::Allow),
        "pause" => Some(Action::Pause),
        "block" | "deny" => Some(Action::Block),
        _ => None,
    }
}

async fn subscription_rule_delete(
    State(state): State<Arc<ControlState>>,
    Query(q): Query<RuleDeleteQuery>,
) -> Response {
    if q.path.trim().is_empty() {
        return api_error(StatusCode::BAD_REQUEST, "path is required");
    }
    let action_filter = match q.action.as_deref() {
        None => None,
        Some(raw) => match parse_action(raw) {
            Some(action) => Some(action),
            None => return api_error(StatusCode::BAD_REQUEST, "invalid action"),
        },
    };

    let (path, mut cfg) = load_subscription_config(&state);
    cfg.rules.retain(|rule| {
        if rule.path != q.path {
            return true;
        }
        if let Some(datasite) = &q.datasite {
            if rule.datasite.as_deref() != Some(datasite.as_str()) {
                return true;
            }
        }
        match &action_filter {
            Some(action) => &rule.action != action,
            None => false,
        }
    });

    if let Some(err) = save_subscriptions_and_wake(&state, &path, &cfg) {
        return err;
    }
    subscriptions_response(&path, cfg)
}

/// Relay listing annotated with the local subscription decision, shared by
/// the discovery and effective-subscription views.
async fn observed_remote_files(
    state: &ControlState,
) -> Result<Vec<(crate::http::BlobInfo, Action)>, Response> {
    let Some(api) = state.api.clone() else {
        return Err(api_error(
            StatusCode::SERVICE_UNAVAILABLE,
            "relay client not configured",
        ));
    };
    let (_, cfg) = load_subscription_config(state);
    let listing = api
        .list_blobs()
        .await
        .map_err(|err| api_error(StatusCode::INTERNAL_SERVER_ERROR, err))?;

    Ok(listing
        .items
        .into_iter()
        .filter(|f| !is_policy_key(&f.key))
        .map(|f| {
            let action = subscriptions::action_for_path(&cfg, &state.owner_email, &f.key);
            (f, action)
        })
        .collect())
}

fn is_policy_key(key: &str) -> bool {
    key == "syft.pub.yaml"
        || key.ends_with("/syft.pub.yaml")
        || subscriptions::is_sub_file(key)
}

fn action_name(action: &Action) -> &'static str {
    match action {
        Action::Allow => "allow",
        Action::Pause => "pause",
        _ => "block",
    }
}

async fn subscriptions_effective(State(state): State<Arc<ControlState>>) -> Response {
    let files = match observed_remote_files(&state).await {
        Ok(files) => files,
        Err(resp) => return resp,
    };
    let rows: Vec<serde_json::Value> = files
        .iter()
        .map(|(f, action)| {
            serde_json::json!({
                "path": f.key,
                "action": action_name(action),
                "allowed": *action == Action::Allow,
            })
        })
        .collect();
    Json(serde_json::json!({ "files": rows })).into_response()
}

/// Remote files the local subscription currently hides: what a user would
/// browse when deciding what else to subscribe to.
async fn discovery_files(State(state): State<Arc<ControlState>>) -> Response {
    let files = match observed_remote_files(&state).await {
        Ok(files) => files,
        Err(resp) => return resp,
    };
    let rows: Vec<serde_json::Value> = files
        .iter()
        .filter(|(_, action)| *action != Action::Allow)
        .map(|(f, action)| {
            serde_json::json!({
                "path": f.key,
                "etag": f.etag,
                "size": f.size,
                "lastModified": f.last_modified,
                "action": action_name(action),
            })
        })
        .collect();
    Json(serde_json::json!({ "files": rows })).into_response()
}

/// Every `syft.pub.yaml` the owner publishes, with content.
async fn publications(State(state): State<Arc<ControlState>>) -> Response {
    let datasites = state.data_dir.join("datasites");
    let owner_root = datasites.join(&state.owner_email);
    let mut files = Vec::new();

    for entry in WalkDir::new(&owner_root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file()
            || entry.file_name().to_string_lossy() != "syft.pub.yaml"
        {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        let rel = entry
            .path()
            .strip_prefix(&datasites)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        files.push(serde_json::json!({ "path": rel, "content": content }));
    }

    Json(serde_json::json!({ "files": files })).into_response()
}

// -- conflicts & cleanup --

#[derive(Serialize)]
struct MarkedFile {
    path: String,
    #[serde(rename = "markerType")]
    marker_type: &'static str,
    #[serde(rename = "originalPath")]
    original_path: String,
    size: u64,
    #[serde(rename = "modTime")]
    mod_time: DateTime<Utc>,
}

async fn sync_conflicts(State(state): State<Arc<ControlState>>) -> Response {
    let (conflicts, rejected) = collect_marked_files(&state.data_dir.join("datasites"));
    Json(serde_json::json!({
        "summary": {
            "conflictCount": conflicts.len(),
            "rejectedCount": rejected.len(),
        },
        "conflicts": conflicts,
        "rejected": rejected,
    }))
    .into_response()
}

async fn sync_cleanup(State(state): State<Arc<ControlState>>) -> Response {
    let (cleaned, errors) = remove_orphaned_staging_files(&state.data_dir.join("datasites"));
    let mut body = serde_json::json!({ "cleanedCount": cleaned });
    if !errors.is_empty() {
        body["errors"] = serde_json::json!(errors);
    }
    Json(body).into_response()
}

fn collect_marked_files(datasites: &Path) -> (Vec<MarkedFile>, Vec<MarkedFile>) {
    let mut conflicts = Vec::new();
    let mut rejected = Vec::new();

    for entry in WalkDir::new(datasites).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let rel = entry
            .path()
            .strip_prefix(datasites)
            .unwrap_or(entry.path())
            .to_string_lossy()
            .replace('\\', "/");
        let Some(marker) = marker_type_of(&rel) else {
            continue;
        };
        let Ok(meta) = entry.metadata() else {
            continue;
        };
        let mod_time = meta
            .modified()
            .ok()
            .and_then(|t| t.duration_since(std::time::UNIX_EPOCH).ok())
            .and_then(|d| DateTime::<Utc>::from_timestamp(d.as_secs() as i64, 0))
            .unwrap_or_default();

        let info = MarkedFile {
            original_path: original_path_of(&rel),
            path: rel,
            marker_type: marker,
            size: meta.len(),
            mod_time,
        };
        if marker == "conflict" {
            conflicts.push(info);
        } else {
            rejected.push(info);
        }
    }

    (conflicts, rejected)
}

fn marker_type_of(path: &str) -> Option<&'static str> {
    if path.contains(".conflict") || path.contains("syftconflict") {
        Some("conflict")
    } else if path.contains(".rejected") || path.contains("syftrejected") {
        Some("rejected")
    } else {
        None
    }
}

/// Strip marker tokens (and the optional 14-digit rotation timestamp that
/// follows them) out of a marked file name.
fn original_path_of(path: &str) -> String {
    const TOKENS: [&str; 4] = [".conflict", ".rejected", ".syftconflict", ".syftrejected"];
    let mut out = String::with_capacity(path.len());
    let mut rest = path;
    'outer: while !rest.is_empty() {
        for token in TOKENS {
            if let Some(after) = rest.strip_prefix(token) {
                rest = strip_rotation_stamp(after);
                continue 'outer;
            }
        }
        let mut chars = rest.chars();
        if let Some(c) = chars.next() {
            out.push(c);
        }
        rest = chars.as_str();
    }
    out
}

fn strip_rotation_stamp(rest: &str) -> &str {
    let Some(tail) = rest.strip_prefix('.') else {
        return rest;
    };
    let digits = tail.chars().take_while(|c| c.is_ascii_digit()).count();
    if digits == 14 {
        &tail[14..]
    } else {
        rest
    }
}

/// Leftover download staging files: the hidden `.name.tmp-<uuid>` siblings
/// (and the legacy `*.syft.tmp.*` spelling) that a crash mid-download can
/// strand next to their targets.
fn is_staging_debris(name: &str) -> bool {
    name.contains(".tmp-") || (name.contains(".syft.tmp.") && !name.ends_with(".syft.tmp."))
}

fn remove_orphaned_staging_files(datasites: &Path) -> (usize, Vec<String>) {
    let mut cleaned = 0;
    let mut errors = Vec::new();
    for entry in WalkDir::new(datasites).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        if !is_staging_debris(&entry.file_name().to_string_lossy()) {
            continue;
        }
        match std::fs::remove_file(entry.path()) {
            Ok(()) => cleaned += 1,
            Err(err) => errors.push(format!("{}: {err}", entry.path().display())),
        }
    }
    (cleaned, errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::SystemTime;

    fn make_temp_dir(name: &str) -> PathBuf {
        let mut root = std::env::temp_dir();
        let nanos = SystemTime::now()
            .duration_since(SystemTime::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        root.push(format!("datasite-sync-control-test-{name}-{nanos}"));
        std::fs::create_dir_all(&root).unwrap();
        root
    }

    fn make_control(data_dir: PathBuf) -> ControlPlane {
        ControlPlane {
            state: Arc::new(ControlState {
                token: "secret".to_string(),
                board: StatusBoard::new(),
                registry: UploadRegistry::new(),
                sync_now: Notify::new(),
                http_stats: Arc::new(HttpStats::default()),
                latency: Arc::new(LatencyStats::new("https://relay.example.com".into())),
                data_dir,
                owner_email: "alice@example.com".to_string(),
                api: None,
            }),
            bound_addr: "127.0.0.1:7938".parse().unwrap(),
        }
    }

    #[test]
    fn board_tracks_states_and_error_counts() {
        let cp = make_control(make_temp_dir("board"));
        let key = "alice@example.com/public/a.txt";

        cp.set_sync_syncing(key, 40.0);
        let status = cp.state.board.get(key).unwrap();
        assert_eq!(status.state, SyncState::Syncing);
        assert_eq!(status.progress, 40.0);

        cp.set_sync_error(key, "relay unreachable");
        cp.set_sync_error(key, "relay unreachable");
        let status = cp.state.board.get(key).unwrap();
        assert_eq!(status.state, SyncState::Error);
        assert_eq!(status.error_count, 2);

        cp.set_sync_completed(key);
        let status = cp.state.board.get(key).unwrap();
        assert_eq!(status.state, SyncState::Completed);
        assert!(status.error.is_empty());
        // The error count is monotonic across recoveries.
        assert_eq!(status.error_count, 2);
    }

    #[test]
    fn upload_registry_reuses_live_entries_and_drops_completed_ones() {
        let cp = make_control(make_temp_dir("registry"));
        let key = "alice@example.com/public/big.bin".to_string();

        let id1 = cp.upsert_upload(key.clone(), None, 1024, Some(256), Some(4));
        let id2 = cp.upsert_upload(key.clone(), None, 1024, Some(256), Some(4));
        assert_eq!(id1, id2, "a live upload for the same key keeps its id");

        cp.update_upload_progress(&id1, 512, vec![1, 2]);
        assert_eq!(cp.get_upload_state(&id1), Some(UploadState::Uploading));

        cp.set_upload_completed(&id1, 1024);
        assert_eq!(cp.get_upload_state(&id1), None);
        assert_eq!(
            cp.state.board.get(&key).unwrap().state,
            SyncState::Completed
        );

        // A fresh upload for the same key gets a new id.
        let id3 = cp.upsert_upload(key, None, 2048, Some(256), Some(8));
        assert_ne!(id1, id3);
    }

    #[test]
    fn upload_transitions_enforce_legal_source_states() {
        let cp = make_control(make_temp_dir("transitions"));
        let id = cp.upsert_upload(
            "alice@example.com/public/big.bin".to_string(),
            None,
            1024,
            None,
            None,
        );

        // resume is only legal from paused
        let resp = transition_upload(
            &cp.state,
            &id,
            &[UploadState::Paused],
            UploadState::Uploading,
            SyncState::Syncing,
            "resumed",
        );
        assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

        let resp = transition_upload(
            &cp.state,
            &id,
            &[UploadState::Uploading, UploadState::Pending],
            UploadState::Paused,
            SyncState::Pending,
            "paused",
        );
        assert_eq!(resp.status(), StatusCode::OK);
        assert_eq!(cp.get_upload_state(&id), Some(UploadState::Paused));

        // restart resets accounting
        cp.update_upload_progress(&id, 512, vec![1]);
        let resp = transition_upload(
            &cp.state,
            &id,
            &[UploadState::Paused],
            UploadState::Restarted,
            SyncState::Pending,
            "restarted",
        );
        assert_eq!(resp.status(), StatusCode::OK);
        let entry = cp.state.registry.entries.lock().unwrap()[&id].clone();
        assert_eq!(entry.uploaded_bytes, 0);
        assert!(entry.completed_parts.is_empty());

        // unknown ids are 404
        let resp = transition_upload(
            &cp.state,
            "missing",
            &[UploadState::Paused],
            UploadState::Uploading,
            SyncState::Syncing,
            "resumed",
        );
        assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    }

    #[test]
    fn cancelled_uploads_disappear_from_the_registry() {
        let cp = make_control(make_temp_dir("cancel"));
        let id = cp.upsert_upload(
            "alice@example.com/public/big.bin".to_string(),
            None,
            1024,
            None,
            None,
        );
        assert!(cp.state.registry.remove(&id).is_some());
        assert_eq!(cp.get_upload_state(&id), None);
        assert!(cp.state.registry.remove(&id).is_none());
    }

    #[test]
    fn original_path_strips_markers_and_rotation_stamps() {
        assert_eq!(original_path_of("a/file.conflict.txt"), "a/file.txt");
        assert_eq!(original_path_of("a/file.rejected.txt"), "a/file.txt");
        assert_eq!(
            original_path_of("a/file.conflict.20260101120000.txt"),
            "a/file.txt"
        );
        assert_eq!(original_path_of("a/old.syftrejected.txt"), "a/old.txt");
        // A dotted number that is not a rotation stamp stays put.
        assert_eq!(original_path_of("a/f.conflict.123.txt"), "a/f.123.txt");
        assert_eq!(original_path_of("a/plain.txt"), "a/plain.txt");
    }

    #[test]
    fn marked_file_listing_separates_conflicts_from_rejections() {
        let root = make_temp_dir("marked");
        let dir = root.join("alice@example.com/public");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("a.conflict.txt"), b"c").unwrap();
        std::fs::write(dir.join("b.rejected.json"), b"r").unwrap();
        std::fs::write(dir.join("legacy.syftconflict.txt"), b"l").unwrap();
        std::fs::write(dir.join("normal.txt"), b"n").unwrap();

        let (conflicts, rejected) = collect_marked_files(&root);
        assert_eq!(conflicts.len(), 2);
        assert_eq!(rejected.len(), 1);
        assert!(conflicts.iter().all(|m| m.marker_type == "conflict"));
        assert_eq!(rejected[0].original_path, "alice@example.com/public/b.json");
    }

    #[test]
    fn staging_debris_cleanup_spares_real_files() {
        let root = make_temp_dir("debris");
        let dir = root.join("alice@example.com/public");
        std::fs::create_dir_all(&dir).unwrap();
        let debris1 = dir.join(".x.bin.tmp-1234abcd");
        let debris2 = dir.join("y.syft.tmp.99");
        let keep1 = dir.join("data.txt");
        let keep2 = dir.join("syft.pub.yaml");
        for (p, b) in [(&debris1, "d"), (&debris2, "d"), (&keep1, "k"), (&keep2, "k")] {
            std::fs::write(p, b).unwrap();
        }

        let (cleaned, errors) = remove_orphaned_staging_files(&root);
        assert_eq!(cleaned, 2);
        assert!(errors.is_empty());
        assert!(!debris1.exists());
        assert!(!debris2.exists());
        assert!(keep1.exists());
        assert!(keep2.exists());
    }

}
