mod adapters;
mod app;
mod domain;
mod ports;
mod telemetry;

pub use domain::origin::{
    DenyReason, OriginConfigError, OriginDecision, OriginPolicy, OriginRule,
    DEFAULT_PRIMARY_DOMAIN,
};
pub use domain::session::ProcessId;
pub use ports::process::{
    LaunchError, LaunchRequest, ProcessControl, ProcessEvent, ProcessEventSender, ProcessIoError,
    ProcessLauncher,
};

use anyhow::{anyhow, Context};
pub use adapters::process::ShellProcessLauncher;
use app::session::{serve_socket, SessionContext};
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Request, State};
use axum::http::{header, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use telemetry::BridgeMetrics;
use themag_protocol::DEFAULT_AGENT_PORT;
use tokio::net::TcpListener;
use tokio::signal::ctrl_c;
use tracing::{debug, info, warn};

#[derive(Clone)]
struct AppState {
    inner: Arc<AppStateInner>,
}

struct AppStateInner {
    origin_policy: OriginPolicy,
    sessions: SessionContext,
    metrics: Option<Arc<BridgeMetrics>>,
}

impl AppState {
    fn new(
        origin_policy: OriginPolicy,
        sessions: SessionContext,
        metrics: Option<Arc<BridgeMetrics>>,
    ) -> Self {
        Self {
            inner: Arc::new(AppStateInner {
                origin_policy,
                sessions,
                metrics,
            }),
        }
    }

    fn origin_policy(&self) -> &OriginPolicy {
        &self.inner.origin_policy
    }

    fn session_context(&self) -> SessionContext {
        self.inner.sessions.clone()
    }

    fn metrics(&self) -> Option<&Arc<BridgeMetrics>> {
        self.inner.metrics.as_ref()
    }
}

#[derive(Clone, Debug)]
pub struct Settings {
    pub listen: SocketAddr,
    /// Starting directory of every session. Defaults to the daemon's cwd.
    pub workdir: Option<PathBuf>,
    /// `None` disables the primary-domain rule.
    pub primary_domain: Option<String>,
    pub allowed_origins: Vec<String>,
    /// Overrides the platform shell (`sh` / `cmd.exe`).
    pub shell: Option<String>,
    pub otlp_endpoint: Option<String>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            listen: SocketAddr::from(([127, 0, 0, 1], DEFAULT_AGENT_PORT)),
            workdir: None,
            primary_domain: Some(DEFAULT_PRIMARY_DOMAIN.to_string()),
            allowed_origins: Vec::new(),
            shell: None,
            otlp_endpoint: None,
        }
    }
}

pub async fn run(settings: Settings) -> anyhow::Result<()> {
    let origin_policy = OriginPolicy::new(
        settings.primary_domain.as_deref(),
        &settings.allowed_origins,
    )
    .context("invalid origin configuration")?;

    let workdir = match settings.workdir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("resolving current directory")?,
    };
    let metadata = tokio::fs::metadata(&workdir)
        .await
        .with_context(|| format!("working directory {}", workdir.display()))?;
    if !metadata.is_dir() {
        return Err(anyhow!("{} is not a directory", workdir.display()));
    }
    let home = dirs::home_dir().unwrap_or_else(|| workdir.clone());

    let (metrics, provider) = if let Some(ref endpoint) = settings.otlp_endpoint {
        let (provider, metrics) =
            telemetry::init_metrics(Some(endpoint.clone()), "themag-agentd")?;
        (Some(Arc::new(metrics)), Some(provider))
    } else {
        (None, None)
    };

    let sessions = SessionContext {
        launcher: Arc::new(ShellProcessLauncher::with_shell(settings.shell.clone())),
        workdir: workdir.clone(),
        home,
        metrics: metrics.clone(),
    };
    let state = AppState::new(origin_policy, sessions, metrics);
    let app = router(state.clone());

    let listener = TcpListener::bind(settings.listen)
        .await
        .with_context(|| format!("binding {}", settings.listen))?;
    info!(
        "listening" = %settings.listen,
        "workdir" = %workdir.display(),
        "primary_domain" = state.origin_policy().primary_domain().unwrap_or("-"),
        "msg" = "themag-agentd started"
    );
    for origin in state.origin_policy().allowed_origins() {
        info!(%origin, "allowing origin");
    }

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(provider) = provider {
        telemetry::shutdown_metrics(provider)?;
    }
    Ok(())
}

fn router(state: AppState) -> Router {
    let gated = Router::new()
        .route("/", get(session_upgrade))
        .route_layer(middleware::from_fn_with_state(state.clone(), origin_gate));

    Router::new()
        .route("/healthz", get(health))
        .merge(gated)
        .fallback(not_found)
        .with_state(state)
}

async fn shutdown_signal() {
    let _ = ctrl_c().await;
    info!("msg" = "shutdown signal received");
}

async fn health() -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "timestamp": Utc::now().to_rfc3339(),
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

/// Rejects handshakes whose `Origin` the policy does not accept, before any
/// upgrade happens.
async fn origin_gate(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let declared = request.headers().get(header::ORIGIN);
    let decision = match declared.map(|value| value.to_str()) {
        None => state.origin_policy().evaluate(None),
        Some(Ok(origin)) => state.origin_policy().evaluate(Some(origin)),
        Some(Err(_)) => OriginDecision::Denied(DenyReason::Malformed),
    };
    let origin = declared
        .and_then(|value| value.to_str().ok())
        .unwrap_or("<none>")
        .to_string();

    if let Some(metrics) = state.metrics() {
        metrics.record_handshake(decision);
    }
    match decision {
        OriginDecision::Allowed(rule) => {
            debug!(%origin, ?rule, "origin accepted");
            next.run(request).await
        }
        OriginDecision::Denied(reason) => {
            warn!(%origin, %reason, "rejected WebSocket handshake");
            forbidden()
        }
    }
}

fn forbidden() -> Response {
    (
        StatusCode::FORBIDDEN,
        [(header::CONNECTION, "close")],
        "Forbidden",
    )
        .into_response()
}

async fn session_upgrade(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    let ctx = state.session_context();
    ws.on_upgrade(move |socket| serve_socket(socket, ctx))
}

async fn not_found(request: Request) -> ApiError {
    ApiError::not_found(
        "route.not_found",
        format!("no route for {}", request.uri().path()),
    )
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

#[derive(Debug)]
struct ApiError {
    status: StatusCode,
    body: ErrorBody,
}

impl ApiError {
    fn not_found(code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            body: ErrorBody {
                code,
                message: message.into(),
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status;
        let body = Json(self.body);
        (status, body).into_response()
    }
}
