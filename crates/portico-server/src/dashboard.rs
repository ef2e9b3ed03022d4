use crate::http_server::AppState;
use crate::pusher::FullPushOutcome;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const SESSION_COOKIE: &str = "PORTICO_SESSION";
const XSRF_HEADER: &str = "x-portico-xsrf";
const SESSION_TTL: Duration = Duration::from_secs(8 * 60 * 60);

struct Session {
    xsrf_token: String,
    created: Instant,
}

/// Dashboard sessions: a cookie-identified session carrying the XSRF
/// token that must accompany every RPC.
#[derive(Clone, Default)]
pub struct SessionMap {
    sessions: Arc<DashMap<String, Session>>,
}

impl SessionMap {
    /// Returns (session id, xsrf token).
    pub fn create(&self) -> (String, String) {
        self.sessions
            .retain(|_, session| session.created.elapsed() < SESSION_TTL);
        let id = Uuid::new_v4().to_string();
        let token = Uuid::new_v4().to_string();
        self.sessions.insert(
            id.clone(),
            Session {
                xsrf_token: token.clone(),
                created: Instant::now(),
            },
        );
        (id, token)
    }

    pub fn xsrf_token(&self, session_id: &str) -> Option<String> {
        self.sessions
            .get(session_id)
            .filter(|session| session.created.elapsed() < SESSION_TTL)
            .map(|session| session.xsrf_token.clone())
    }
}

fn session_cookie(headers: &HeaderMap) -> Option<String> {
    let cookies = headers.get(header::COOKIE)?.to_str().ok()?;
    cookies.split(';').find_map(|cookie| {
        let (name, value) = cookie.trim().split_once('=')?;
        (name == SESSION_COOKIE).then(|| value.to_string())
    })
}

/// Prometheus text exposition, as scraped from the dashboard port.
pub async fn handle_metrics(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.trusted.is_trusted(peer.ip()) {
        return (StatusCode::FORBIDDEN, "metrics are operator-only").into_response();
    }
    match prometheus::TextEncoder::new().encode_to_string(&prometheus::default_registry().gather())
    {
        Ok(report) => report.into_response(),
        Err(err) => {
            (StatusCode::INTERNAL_SERVER_ERROR, format!("Error: {err:#}")).into_response()
        }
    }
}

#[derive(Serialize)]
struct StatusView {
    version: &'static str,
    feed_name: String,
    gsa_hostname: String,
    full_push_running: bool,
    journal: crate::journal::JournalSnapshot,
}

pub async fn handle_status(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
) -> Response {
    if !state.trusted.is_trusted(peer.ip()) {
        return (StatusCode::FORBIDDEN, "the dashboard is operator-only").into_response();
    }
    let view = StatusView {
        version: env!("CARGO_PKG_VERSION"),
        feed_name: state.config.str_value("feed.name").to_string(),
        gsa_hostname: state.config.str_value("gsa.hostname").to_string(),
        full_push_running: state.pusher.is_full_push_running(),
        journal: state.journal.snapshot(),
    };
    axum::Json(view).into_response()
}

#[derive(Deserialize)]
struct RpcRequest {
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

fn rpc_error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, axum::Json(json!({ "error": message.into() }))).into_response()
}

/// JSON-RPC for dashboard actions. Callers first ask for an XSRF
/// token (which also sets the session cookie), then pass it back in
/// the `X-Portico-Xsrf` header with every action.
pub async fn handle_rpc(
    State(state): State<AppState>,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    body: String,
) -> Response {
    if !state.trusted.is_trusted(peer.ip()) {
        return rpc_error(StatusCode::FORBIDDEN, "the dashboard is operator-only");
    }
    let request: RpcRequest = match serde_json::from_str(&body) {
        Ok(request) => request,
        Err(err) => return rpc_error(StatusCode::BAD_REQUEST, format!("bad request: {err}")),
    };

    if request.method == "getXsrfToken" {
        let (session_id, token) = state.sessions.create();
        return (
            [(
                header::SET_COOKIE,
                format!("{SESSION_COOKIE}={session_id}; HttpOnly; Path=/rpc"),
            )],
            axum::Json(json!({ "result": { "xsrfToken": token } })),
        )
            .into_response();
    }

    let presented = headers
        .get(XSRF_HEADER)
        .and_then(|value| value.to_str().ok());
    let expected = session_cookie(&headers).and_then(|id| state.sessions.xsrf_token(&id));
    match (presented, expected) {
        (Some(presented), Some(expected)) if presented == expected => {}
        _ => {
            return rpc_error(
                StatusCode::CONFLICT,
                "missing or stale XSRF token; call getXsrfToken first",
            )
        }
    }

    match request.method.as_str() {
        "startFeedPush" => {
            if state.pusher.is_full_push_running() {
                return rpc_error(StatusCode::CONFLICT, "a full push is already in progress");
            }
            let pusher = state.pusher.clone();
            let repo = state.repo.clone();
            tokio::spawn(async move {
                if let FullPushOutcome::AlreadyRunning = pusher.run_full_push(repo.as_ref()).await
                {
                    tracing::warn!("dashboard-requested full push lost the race to start");
                }
            });
            axum::Json(json!({ "result": "started" })).into_response()
        }
        "getStatus" => axum::Json(json!({ "result": state.journal.snapshot() })).into_response(),
        "getLog" => {
            let lines = portico_server_common::recent_logs()
                .map(|buffer| buffer.snapshot())
                .unwrap_or_default();
            axum::Json(json!({ "result": lines })).into_response()
        }
        "setLogLevel" => {
            let Some(filter) = request.params.as_str() else {
                return rpc_error(StatusCode::BAD_REQUEST, "params must be a filter string");
            };
            match portico_server_common::set_diagnostic_log_filter(filter) {
                Ok(()) => axum::Json(json!({ "result": "ok" })).into_response(),
                Err(err) => rpc_error(StatusCode::BAD_REQUEST, format!("{err:#}")),
            }
        }
        other => rpc_error(StatusCode::BAD_REQUEST, format!("unknown method {other:?}")),
    }
}
