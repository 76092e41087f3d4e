//! HTTP/1.1 front end: origin and credential gates, WebSocket upgrades for
//! the console and status endpoints, CORS preflight and health.
//!
//! Process-wide state (origin policy, authenticator, hub handle, console
//! service) is built once in [`AppState`] and shared by reference with every
//! connection.

use crate::auth::{AuthRejection, ConsoleAuthenticator, OriginPolicy, TokenValidator};
use crate::backend::{Hypervisor, VmStore};
use crate::broadcast::{serve_subscriber, StatusHub};
use crate::config::ServerConfig;
use crate::console::{ConsoleService, ConsoleSessionManager, ReadinessOrchestrator};
use bytes::Bytes;
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::header::{self, HeaderValue};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, error, info, warn};
use vmgate_core::{BroadcastMessage, GateError, GateResult, JwtValidator};

const CONSOLE_PATHS: [&str; 2] = ["/ws/vnc", "/vnc"];
const STATUS_PATH: &str = "/ws/vm-status";
const HEALTH_PATH: &str = "/health";

/// Shared application state.
pub struct AppState {
    pub origins: OriginPolicy,
    pub auth: ConsoleAuthenticator,
    pub console: Arc<ConsoleService>,
    pub hub: StatusHub,
    pub store: Arc<dyn VmStore>,
}

impl AppState {
    pub fn new(
        config: &ServerConfig,
        validator: Arc<dyn TokenValidator>,
        store: Arc<dyn VmStore>,
        hypervisor: Arc<dyn Hypervisor>,
        hub: StatusHub,
    ) -> Self {
        let orchestrator = ReadinessOrchestrator::new(
            store.clone(),
            hypervisor,
            hub.clone(),
            config.readiness.clone(),
        );
        let sessions = Arc::new(ConsoleSessionManager::new(config.session_limits.clone()));
        let console = Arc::new(ConsoleService::new(
            orchestrator,
            sessions,
            config.console.clone(),
        ));

        if config.allowed_origins.is_empty() {
            warn!("no allowed origins configured, every browser upgrade will be rejected");
        }

        Self {
            origins: OriginPolicy::new(config.allowed_origins.clone()),
            auth: ConsoleAuthenticator::new(validator),
            console,
            hub,
            store,
        }
    }
}

/// The vmgate server instance.
pub struct VmGateServer {
    config: ServerConfig,
    state: Arc<AppState>,
}

impl VmGateServer {
    /// Create a new server instance validating tokens with the configured secret.
    pub fn new(
        config: ServerConfig,
        store: Arc<dyn VmStore>,
        hypervisor: Arc<dyn Hypervisor>,
        hub: StatusHub,
    ) -> GateResult<Self> {
        let validator = Arc::new(JwtValidator::new(config.jwt_secret.as_bytes())?);
        let state = Arc::new(AppState::new(&config, validator, store, hypervisor, hub));
        Ok(Self { config, state })
    }

    /// Bind the listener and serve until the task is dropped.
    pub async fn run(self, tls_config: Option<Arc<rustls::ServerConfig>>) -> GateResult<()> {
        let addr = format!("{}:{}", self.config.bind, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| GateError::Transport(format!("bind {addr} failed: {e}")))?;
        info!(
            addr = %addr,
            tls = tls_config.is_some(),
            origins = ?self.state.origins.allowed(),
            "vmgate listening"
        );

        // Reconnect limiter GC
        let sessions = self.state.console.sessions().clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(60));
            loop {
                interval.tick().await;
                sessions.gc().await;
            }
        });

        serve(listener, self.state, tls_config.map(TlsAcceptor::from)).await
    }
}

/// Accept loop. Each connection is served on its own task.
pub async fn serve(
    listener: TcpListener,
    state: Arc<AppState>,
    tls: Option<TlsAcceptor>,
) -> GateResult<()> {
    loop {
        let (stream, addr) = match listener.accept().await {
            Ok(accepted) => accepted,
            Err(e) => {
                error!(error = %e, "TCP accept failed");
                continue;
            }
        };
        let state = Arc::clone(&state);
        let tls = tls.clone();

        tokio::spawn(async move {
            match tls {
                Some(acceptor) => match acceptor.accept(stream).await {
                    Ok(tls_stream) => serve_connection(tls_stream, addr, state).await,
                    Err(e) => debug!(remote = %addr, error = %e, "TLS handshake failed"),
                },
                None => serve_connection(stream, addr, state).await,
            }
        });
    }
}

async fn serve_connection<I>(io: I, addr: SocketAddr, state: Arc<AppState>)
where
    I: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let service = service_fn(move |req: Request<Incoming>| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(handle_request(state, Some(addr), req).await) }
    });

    if let Err(e) = http1::Builder::new()
        .serve_connection(TokioIo::new(io), service)
        .with_upgrades()
        .await
    {
        debug!(remote = %addr, error = %e, "connection error");
    }
}

/// Query parameters understood by the upgrade endpoints.
#[derive(Debug, Default, Deserialize)]
struct UpgradeQuery {
    id: Option<String>,
    /// Older clients send the VM id as `uuid`.
    uuid: Option<String>,
    token: Option<String>,
}

impl UpgradeQuery {
    fn parse(query: Option<&str>) -> Self {
        serde_urlencoded::from_str(query.unwrap_or("")).unwrap_or_default()
    }

    fn vm_uuid(&self) -> Option<String> {
        self.id
            .clone()
            .filter(|id| !id.is_empty())
            .or_else(|| self.uuid.clone())
    }
}

/// Route one request.
pub async fn handle_request<B>(
    state: Arc<AppState>,
    remote: Option<SocketAddr>,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let origin = header_str(req.headers(), header::ORIGIN).map(str::to_string);

    let is_console = CONSOLE_PATHS.contains(&path.as_str());
    let is_status = path == STATUS_PATH;

    match &method {
        &Method::OPTIONS if is_console || is_status => {
            let resp = text_response(StatusCode::OK, "");
            with_cors(resp, &state.origins, origin.as_deref())
        }
        &Method::GET if is_console || is_status => {
            if !state.origins.check(origin.as_deref()) {
                return text_response(StatusCode::FORBIDDEN, "Origin not allowed");
            }
            let resp = if is_console {
                console_upgrade(&state, remote, req).await
            } else {
                status_upgrade(&state, req).await
            };
            with_cors(resp, &state.origins, origin.as_deref())
        }
        &Method::GET if path == HEALTH_PATH => health(&state).await,
        _ => text_response(StatusCode::NOT_FOUND, "Not found"),
    }
}

async fn console_upgrade<B>(
    state: &Arc<AppState>,
    remote: Option<SocketAddr>,
    req: Request<B>,
) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    let query = UpgradeQuery::parse(req.uri().query());

    let principal = match state.auth.authenticate(query.token.as_deref(), req.headers()) {
        Ok(p) => p,
        Err(rejection) => return rejection_response(&rejection),
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return upgrade_required();
    }

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!(error = %e, "console upgrade failed");
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("WebSocket upgrade failed: {e}"),
            );
        }
    };

    info!(
        user_id = principal.user_id,
        username = %principal.username,
        vm_uuid = query.vm_uuid().as_deref().unwrap_or(""),
        "console connection accepted"
    );

    let console = state.console.clone();
    let vm_uuid = query.vm_uuid();
    tokio::spawn(async move {
        match websocket.await {
            Ok(ws) => console.serve(ws, principal, vm_uuid, remote).await,
            Err(e) => warn!(error = %e, "console websocket handshake failed"),
        }
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

async fn status_upgrade<B>(state: &Arc<AppState>, req: Request<B>) -> Response<Full<Bytes>>
where
    B: Send + 'static,
{
    let query = UpgradeQuery::parse(req.uri().query());

    let principal = match state.auth.identify(query.token.as_deref(), req.headers()) {
        Ok(p) => p,
        Err(rejection) => return rejection_response(&rejection),
    };

    if !hyper_tungstenite::is_upgrade_request(&req) {
        return upgrade_required();
    }

    let (response, websocket) = match hyper_tungstenite::upgrade(req, None) {
        Ok(upgrade) => upgrade,
        Err(e) => {
            warn!(error = %e, "status upgrade failed");
            return text_response(
                StatusCode::BAD_REQUEST,
                &format!("WebSocket upgrade failed: {e}"),
            );
        }
    };

    debug!(user_id = principal.user_id, "status subscriber connecting");

    let hub = state.hub.clone();
    let store = state.store.clone();
    tokio::spawn(async move {
        let ws = match websocket.await {
            Ok(ws) => ws,
            Err(e) => {
                warn!(error = %e, "status websocket handshake failed");
                return;
            }
        };
        let snapshot = match store.list().await {
            Ok(vms) => match (BroadcastMessage::VmList { vms }).to_json() {
                Ok(json) => Some(json),
                Err(e) => {
                    warn!(error = %e, "failed to encode vm list");
                    None
                }
            },
            Err(e) => {
                warn!(error = %e, "failed to load vm list for new subscriber");
                None
            }
        };
        serve_subscriber(ws, hub, snapshot).await;
    });

    let (parts, _) = response.into_parts();
    Response::from_parts(parts, Full::new(Bytes::new()))
}

async fn health(state: &AppState) -> Response<Full<Bytes>> {
    let body = serde_json::json!({
        "status": "ok",
        "subscribers": state.hub.subscriber_count(),
        "console_sessions": state.console.sessions().count().await,
    });
    let mut resp = text_response(StatusCode::OK, &body.to_string());
    resp.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("application/json"),
    );
    resp
}

// ── Response builders ──────────────────────────────────────────────

fn text_response(status: StatusCode, body: &str) -> Response<Full<Bytes>> {
    let mut resp = Response::new(Full::new(Bytes::from(body.to_string())));
    *resp.status_mut() = status;
    if !body.is_empty() {
        resp.headers_mut().insert(
            header::CONTENT_TYPE,
            HeaderValue::from_static("text/plain; charset=utf-8"),
        );
    }
    resp
}

fn rejection_response(rejection: &AuthRejection) -> Response<Full<Bytes>> {
    text_response(rejection.status(), &rejection.body())
}

fn upgrade_required() -> Response<Full<Bytes>> {
    let mut resp = text_response(StatusCode::UPGRADE_REQUIRED, "WebSocket connection required");
    resp.headers_mut()
        .insert(header::UPGRADE, HeaderValue::from_static("websocket"));
    resp
}

/// Attach CORS headers when the origin passes the gate.
fn with_cors(
    mut resp: Response<Full<Bytes>>,
    origins: &OriginPolicy,
    origin: Option<&str>,
) -> Response<Full<Bytes>> {
    let Some(origin) = origin.filter(|o| origins.allows(o)) else {
        return resp;
    };
    let Ok(value) = HeaderValue::from_str(origin) else {
        return resp;
    };
    let headers = resp.headers_mut();
    headers.insert(header::ACCESS_CONTROL_ALLOW_ORIGIN, value);
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_CREDENTIALS,
        HeaderValue::from_static("true"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_METHODS,
        HeaderValue::from_static("GET, OPTIONS"),
    );
    headers.insert(
        header::ACCESS_CONTROL_ALLOW_HEADERS,
        HeaderValue::from_static("Authorization, Content-Type"),
    );
    resp
}

fn header_str(headers: &HeaderMap, name: header::HeaderName) -> Option<&str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
