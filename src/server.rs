//! Collector HTTP / WebSocket 服务
//!
//! 对外暴露 `/v1` 下的采集与查询 API：
//! - `POST /v1/traces`            批量摄入
//! - `GET  /v1/traces/search`     全文检索（LIKE）
//! - `GET  /v1/sessions`          会话列表
//! - `POST /v1/sessions/activity` 会话生命周期事件上报
//! - `GET  /v1/sessions/active`   当前活跃会话
//! - `GET  /v1/sessions/{id}`     会话详情 + 条目
//! - `POST /v1/agents/register`   agent 注册
//! - `GET  /v1/agents`            agent 列表
//! - `GET  /v1/stats`             聚合统计
//! - `GET  /v1/health`            健康检查（免鉴权）
//! - `POST /v1/ws/ticket`         签发一次性 WS ticket
//! - `GET  /v1/sessions/{id}/ws`  实时会话流（bearer 或 ticket）
//!
//! 配置了 token 时除 health 与 WS 端点外全部要求 Bearer 鉴权；
//! WS 端点自己校验（浏览器没法带自定义 header，走 ticket）。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::rejection::JsonRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, Request, State};
use axum::http::header::AUTHORIZATION;
use axum::http::{HeaderMap, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{CollectorConfig, DEFAULT_TICKET_TTL, STALE_AGENT_THRESHOLD};
use crate::error::Result;
use crate::normalizer::normalize_request;
use crate::pubsub::SessionPubSub;
use crate::registry::AgentRegistry;
use crate::store::{TraceStore, BACKFILL_LIMIT};
use crate::tickets::TicketStore;
use crate::types::{
    AgentRegistration, ErrorResponse, IngestRequest, IngestResponse, SessionActivityEvent,
    SessionFilter,
};

/// 过期 agent / ticket 的后台清扫间隔
const JANITOR_INTERVAL: Duration = Duration::from_secs(60);
/// search / 列表查询的默认上限
const DEFAULT_QUERY_LIMIT: usize = 50;

#[derive(Clone)]
struct AppState {
    store: Arc<TraceStore>,
    registry: Arc<AgentRegistry>,
    pubsub: Arc<SessionPubSub>,
    tickets: Arc<TicketStore>,
    token: Option<Arc<str>>,
}

/// Collector 服务实例，持有全部运行期组件
pub struct CollectorServer {
    config: CollectorConfig,
    state: AppState,
}

impl CollectorServer {
    /// 打开存储并组装各组件；必须在 tokio runtime 内调用
    pub fn new(config: CollectorConfig) -> Result<Self> {
        let store = TraceStore::open(&config.db_path, config.batch_size, config.flush_interval)?;
        let state = AppState {
            store: Arc::new(store),
            registry: Arc::new(AgentRegistry::new()),
            pubsub: Arc::new(SessionPubSub::new()),
            tickets: Arc::new(TicketStore::new()),
            token: config.token.as_deref().map(Arc::from),
        };
        Ok(Self { config, state })
    }

    pub fn router(&self) -> Router {
        let v1 = Router::new()
            .route("/traces", post(ingest_traces))
            .route("/traces/search", get(search_traces))
            .route("/sessions", get(list_sessions))
            .route("/sessions/activity", post(record_session_activity))
            .route("/sessions/active", get(active_sessions))
            .route("/sessions/:id", get(session_detail))
            .route("/sessions/:id/ws", get(session_ws))
            .route("/agents/register", post(register_agent))
            .route("/agents", get(list_agents))
            .route("/stats", get(stats))
            .route("/health", get(health))
            .route("/ws/ticket", post(issue_ticket));

        Router::new()
            .nest("/v1", v1)
            .layer(middleware::from_fn_with_state(
                self.state.clone(),
                require_bearer,
            ))
            .layer(CorsLayer::permissive())
            .layer(TraceLayer::new_for_http())
            .with_state(self.state.clone())
    }

    /// 绑定配置的地址并一直服务到取消
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        tracing::info!("🚀 Collector listening on {}", addr);
        self.serve(listener, cancel).await
    }

    /// 在给定 listener 上服务；关停时排空写入队列
    pub async fn serve(self, listener: TcpListener, cancel: CancellationToken) -> Result<()> {
        let router = self.router();
        let state = self.state.clone();

        let janitor_cancel = cancel.child_token();
        let janitor_state = self.state.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(JANITOR_INTERVAL);
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = janitor_state.registry.clean_stale(STALE_AGENT_THRESHOLD);
                        if removed > 0 {
                            tracing::info!("🧹 Removed {} stale agents", removed);
                        }
                        janitor_state.tickets.cleanup();
                    }
                    _ = janitor_cancel.cancelled() => return,
                }
            }
        });

        axum::serve(listener, router)
            .with_graceful_shutdown(cancel.cancelled_owned())
            .await?;

        tracing::info!("📦 Draining write queue before exit");
        state.store.close().await;
        Ok(())
    }
}

/// Bearer 鉴权中间件
///
/// health 免鉴权；WS 端点在 handler 里自行校验（需要支持 ticket）。
async fn require_bearer(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let token = match &state.token {
        Some(t) => t.clone(),
        None => return next.run(request).await,
    };

    let path = request.uri().path();
    if path == "/v1/health" || path.ends_with("/ws") {
        return next.run(request).await;
    }

    if bearer_matches(request.headers(), &token) {
        return next.run(request).await;
    }

    error_response(StatusCode::UNAUTHORIZED, "unauthorized", None)
}

fn bearer_matches(headers: &HeaderMap, token: &str) -> bool {
    headers
        .get(AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(|presented| constant_time_eq(presented, token))
        .unwrap_or(false)
}

fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.bytes().zip(b.bytes()).fold(0u8, |acc, (x, y)| acc | (x ^ y)) == 0
}

fn error_response(status: StatusCode, error: &str, message: Option<String>) -> Response {
    (
        status,
        Json(ErrorResponse {
            error: error.to_string(),
            message,
        }),
    )
        .into_response()
}

// ---- handlers ----

async fn ingest_traces(
    State(state): State<AppState>,
    body: std::result::Result<Json<IngestRequest>, JsonRejection>,
) -> Response {
    let Json(mut req) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_json", Some(e.to_string()))
        }
    };

    let dropped = match normalize_request(&mut req) {
        Ok(d) => d,
        Err(e) => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                Some(e.to_string()),
            )
        }
    };

    if req.entries.is_empty() {
        return Json(IngestResponse {
            accepted: 0,
            message: Some("all entries dropped during validation".to_string()),
        })
        .into_response();
    }

    let accepted = req.entries.len();
    let instance_id = req.instance_id.clone();
    let session_id = req.session_id.clone();
    let entries = req.entries.clone();

    if let Err(e) = state.store.ingest_batch(req).await {
        tracing::error!("💥 Ingest enqueue failed: {}", e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "ingest_error",
            Some(e.to_string()),
        );
    }

    if !instance_id.is_empty() {
        state.registry.heartbeat(&instance_id);
        state
            .registry
            .increment_trace_count(&instance_id, accepted as i64);
    }
    state.pubsub.publish(&session_id, entries);

    let message = if dropped > 0 {
        Some(format!("{} entries dropped during validation", dropped))
    } else {
        None
    };
    Json(IngestResponse { accepted, message }).into_response()
}

async fn search_traces(
    State(state): State<AppState>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    let query = match params.get("q").map(|q| q.trim()) {
        Some(q) if !q.is_empty() => q.to_string(),
        _ => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                Some("q parameter is required".to_string()),
            )
        }
    };
    let limit = params
        .get("limit")
        .and_then(|l| l.parse().ok())
        .unwrap_or(DEFAULT_QUERY_LIMIT);

    match state.store.search_traces(&query, limit) {
        Ok(results) => {
            let count = results.len();
            Json(serde_json::json!({
                "results": results,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "search_error",
            Some(e.to_string()),
        ),
    }
}

async fn list_sessions(
    State(state): State<AppState>,
    Query(filter): Query<SessionFilter>,
) -> Response {
    match state.store.query_sessions(&filter) {
        Ok(sessions) => {
            let count = sessions.len();
            Json(serde_json::json!({
                "sessions": sessions,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            Some(e.to_string()),
        ),
    }
}

async fn record_session_activity(
    State(state): State<AppState>,
    body: std::result::Result<Json<SessionActivityEvent>, JsonRejection>,
) -> Response {
    let Json(ev) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_json", Some(e.to_string()))
        }
    };
    if ev.session_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            Some("session_id is required".to_string()),
        );
    }
    match ev.event.as_str() {
        "session_start" | "session_active" | "session_end" => {}
        other => {
            return error_response(
                StatusCode::BAD_REQUEST,
                "validation_error",
                Some(format!("invalid event: {}", other)),
            )
        }
    }

    if let Err(e) = state.store.record_activity(&ev) {
        tracing::error!("💥 Activity write failed: {}", e);
        return error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "activity_error",
            Some(e.to_string()),
        );
    }

    if !ev.instance_id.is_empty() {
        state.registry.heartbeat(&ev.instance_id);
    }
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

async fn active_sessions(State(state): State<AppState>) -> Response {
    match state.store.query_active_sessions() {
        Ok(sessions) => Json(sessions).into_response(),
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            Some(e.to_string()),
        ),
    }
}

#[derive(Deserialize)]
struct EntryPage {
    #[serde(default)]
    limit: usize,
    #[serde(default)]
    offset: usize,
}

async fn session_detail(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(page): Query<EntryPage>,
) -> Response {
    let session = match state.store.get_session(&session_id) {
        Ok(Some(s)) => s,
        Ok(None) => {
            return error_response(
                StatusCode::NOT_FOUND,
                "session_not_found",
                Some(session_id),
            )
        }
        Err(e) => {
            return error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "query_error",
                Some(e.to_string()),
            )
        }
    };

    let limit = if page.limit == 0 {
        DEFAULT_QUERY_LIMIT
    } else {
        page.limit
    };
    match state.store.query_entries(&session_id, limit, page.offset) {
        Ok(entries) => {
            let count = entries.len();
            Json(serde_json::json!({
                "session": session,
                "entries": entries,
                "count": count,
            }))
            .into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "query_error",
            Some(e.to_string()),
        ),
    }
}

async fn register_agent(
    State(state): State<AppState>,
    body: std::result::Result<Json<AgentRegistration>, JsonRejection>,
) -> Response {
    let Json(reg) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_json", Some(e.to_string()))
        }
    };
    if reg.instance_id.trim().is_empty() || reg.platform.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            Some("instance_id and platform are required".to_string()),
        );
    }

    let info = state.registry.register(reg);
    tracing::info!("🤝 Agent registered: {} ({})", info.instance_id, info.platform);
    Json(info).into_response()
}

async fn list_agents(State(state): State<AppState>) -> Response {
    let agents = state.registry.list();
    let count = agents.len();
    Json(serde_json::json!({
        "agents": agents,
        "count": count,
    }))
    .into_response()
}

async fn stats(State(state): State<AppState>) -> Response {
    match state.store.get_stats() {
        Ok(mut stats) => {
            let (total, active) = state.registry.count();
            stats.total_agents = total;
            stats.active_agents = active;
            Json(stats).into_response()
        }
        Err(e) => error_response(
            StatusCode::INTERNAL_SERVER_ERROR,
            "stats_error",
            Some(e.to_string()),
        ),
    }
}

async fn health() -> Response {
    Json(serde_json::json!({ "status": "ok" })).into_response()
}

#[derive(Deserialize)]
struct TicketRequest {
    #[serde(default)]
    session_id: String,
}

async fn issue_ticket(
    State(state): State<AppState>,
    body: std::result::Result<Json<TicketRequest>, JsonRejection>,
) -> Response {
    let Json(req) = match body {
        Ok(b) => b,
        Err(e) => {
            return error_response(StatusCode::BAD_REQUEST, "invalid_json", Some(e.to_string()))
        }
    };
    if req.session_id.trim().is_empty() {
        return error_response(
            StatusCode::BAD_REQUEST,
            "validation_error",
            Some("session_id is required".to_string()),
        );
    }

    let ticket = state.tickets.issue(&req.session_id);
    Json(serde_json::json!({
        "ticket": ticket,
        "expires_in": DEFAULT_TICKET_TTL.as_secs(),
    }))
    .into_response()
}

#[derive(Deserialize)]
struct WsParams {
    #[serde(default)]
    ticket: Option<String>,
    #[serde(default)]
    after: Option<String>,
}

/// 实时会话流
///
/// 鉴权二选一：Bearer header，或一次性 ticket（查询即销毁，校验
/// 失败也不退回）。连接后先回放最近的持久化条目，再转发实时发布。
async fn session_ws(
    State(state): State<AppState>,
    Path(session_id): Path<String>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> Response {
    if let Some(token) = &state.token {
        let via_header = bearer_matches(&headers, token);
        let via_ticket = params
            .ticket
            .as_deref()
            .map(|t| state.tickets.redeem(t, &session_id))
            .unwrap_or(false);
        if !via_header && !via_ticket {
            return error_response(StatusCode::UNAUTHORIZED, "unauthorized", None);
        }
    }

    let after = params
        .after
        .as_deref()
        .and_then(|a| DateTime::parse_from_rfc3339(a).ok())
        .map(|t| t.with_timezone(&Utc));

    ws.on_upgrade(move |socket| handle_session_ws(socket, state, session_id, after))
}

async fn handle_session_ws(
    mut socket: WebSocket,
    state: AppState,
    session_id: String,
    after: Option<DateTime<Utc>>,
) {
    // 先回放，再订阅；两步之间写入的条目可能既不在回放里也不在订阅里，
    // 客户端按 uuid 去重兜底
    let backfill = state
        .store
        .recent_entries(&session_id, BACKFILL_LIMIT)
        .unwrap_or_default();
    for entry in &backfill {
        if let Some(cutoff) = after {
            if entry.timestamp.map(|t| t <= cutoff).unwrap_or(false) {
                continue;
            }
        }
        let Ok(payload) = serde_json::to_string(entry) else {
            continue;
        };
        if socket.send(Message::Text(payload)).await.is_err() {
            return;
        }
    }

    let (sub_id, mut rx) = state.pubsub.subscribe(&session_id);
    tracing::debug!("📺 WS subscriber attached: session={}", session_id);

    loop {
        tokio::select! {
            batch = rx.recv() => {
                let Some(entries) = batch else { break };
                let mut closed = false;
                for entry in &entries {
                    let Ok(payload) = serde_json::to_string(entry) else {
                        continue;
                    };
                    if socket.send(Message::Text(payload)).await.is_err() {
                        closed = true;
                        break;
                    }
                }
                if closed {
                    break;
                }
            }
            incoming = socket.recv() => {
                // 只关心对端关闭；客户端发来的内容一律忽略
                match incoming {
                    None | Some(Err(_)) | Some(Ok(Message::Close(_))) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    state.pubsub.unsubscribe(&session_id, sub_id);
    tracing::debug!("📺 WS subscriber detached: session={}", session_id);
}
