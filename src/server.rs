//! HTTP front door
//!
//! One listener serves the reverse proxy's forward-auth calls, its error-page
//! (wake) calls, and the status/health endpoints polled by waiting pages and
//! monitoring.

use crate::auth::{decide, effective_policy, AuthRequest};
use crate::context::AppContext;
use crate::db::AccessLogEntry;
use crate::error::{internal_error_response, json_error_response, AgentErrorCode};
use crate::wake::{WakeHandler, WakeOutcome};
use futures::FutureExt;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::header::{HeaderMap, HeaderValue, AUTHORIZATION, HOST, USER_AGENT, WWW_AUTHENTICATE};
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::convert::Infallible;
use std::net::{IpAddr, SocketAddr};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

/// Version information for the agent
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Seconds a waiting page asks the client to wait before retrying
const RETRY_AFTER_SECS: &str = "5";

/// How long open connections get to finish after shutdown before they are aborted
const CONNECTION_DRAIN: Duration = Duration::from_secs(5);

/// Helper to create a simple response - infallible with valid StatusCode
fn response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum")
}

/// Helper to create a JSON response
fn json_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "application/json")
        .body(Full::new(body.into()))
        .expect("valid response with StatusCode enum and static header")
}

fn html_response(status: StatusCode, body: String) -> Response<Full<Bytes>> {
    Response::builder()
        .status(status)
        .header("content-type", "text/html; charset=utf-8")
        .header("cache-control", "no-store")
        .body(Full::new(Bytes::from(body)))
        .expect("valid response with StatusCode enum and static headers")
}

struct FrontDoorState {
    ctx: AppContext,
    wake: WakeHandler,
}

/// The agent's HTTP listener
pub struct FrontDoor {
    bind_addr: SocketAddr,
    state: Arc<FrontDoorState>,
    shutdown_rx: watch::Receiver<bool>,
}

impl FrontDoor {
    pub fn new(bind_addr: SocketAddr, ctx: AppContext, shutdown_rx: watch::Receiver<bool>) -> Self {
        let wake = WakeHandler::new(&ctx);
        Self {
            bind_addr,
            state: Arc::new(FrontDoorState { ctx, wake }),
            shutdown_rx,
        }
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let listener = TcpListener::bind(self.bind_addr).await?;
        self.serve(listener).await
    }

    /// Accept connections on an already bound listener until shutdown.
    ///
    /// Returns once every connection has finished (or been aborted after
    /// the drain timeout), so no request still holds the shared state.
    pub async fn serve(self, listener: TcpListener) -> anyhow::Result<()> {
        let addr = listener.local_addr()?;
        info!(addr = %addr, "Front door listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                result = listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let state = Arc::clone(&self.state);
                            let shutdown = self.shutdown_rx.clone();
                            connections.spawn(async move {
                                if let Err(e) = serve_connection(stream, peer, state, shutdown).await {
                                    debug!(addr = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Front door shutting down");
                        break;
                    }
                }
            }
        }

        drop(listener);
        drain_connections(&mut connections).await;
        Ok(())
    }
}

async fn drain_connections(connections: &mut JoinSet<()>) {
    if connections.is_empty() {
        return;
    }
    debug!(open = connections.len(), "Waiting for open connections");

    let drained = tokio::time::timeout(CONNECTION_DRAIN, async {
        while connections.join_next().await.is_some() {}
    })
    .await;

    if drained.is_err() {
        warn!(
            open = connections.len(),
            drain_secs = CONNECTION_DRAIN.as_secs(),
            "Aborting connections still open after drain timeout"
        );
        connections.abort_all();
        while connections.join_next().await.is_some() {}
    }
}

async fn serve_connection<S>(
    stream: S,
    peer: SocketAddr,
    state: Arc<FrontDoorState>,
    mut shutdown: watch::Receiver<bool>,
) -> anyhow::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let state = Arc::clone(&state);
        async move { Ok::<_, Infallible>(dispatch(req, peer, state).await) }
    });

    let builder = AutoBuilder::new(TokioExecutor::new());
    let conn = builder.serve_connection(io, service);
    tokio::pin!(conn);

    let result = tokio::select! {
        result = conn.as_mut() => result,
        _ = shutdown_requested(&mut shutdown) => {
            // Finish the in-flight request, refuse further ones on this connection
            conn.as_mut().graceful_shutdown();
            conn.await
        }
    };
    result.map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}

/// Resolves once shutdown is signalled; never if the sender is gone
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    if shutdown.wait_for(|stop| *stop).await.is_err() {
        std::future::pending::<()>().await;
    }
}

/// Route a request, turning a panicking handler into a 500
async fn dispatch(req: Request<Incoming>, peer: SocketAddr, state: Arc<FrontDoorState>) -> Response<Full<Bytes>> {
    let method = req.method().clone();
    let path = req.uri().path().to_string();
    let request_id = uuid::Uuid::new_v4();
    debug!(%request_id, %method, %path, peer = %peer, "Front door request");

    match AssertUnwindSafe(route(req, peer, &state)).catch_unwind().await {
        Ok(response) => {
            debug!(%request_id, status = response.status().as_u16(), "Front door response");
            response
        }
        Err(_) => {
            error!(%request_id, %method, %path, "Request handler panicked");
            internal_error_response()
        }
    }
}

async fn route(req: Request<Incoming>, peer: SocketAddr, state: &FrontDoorState) -> Response<Full<Bytes>> {
    let path = req.uri().path();

    if path == "/__auth__" || path.starts_with("/__auth__/") {
        return handle_auth(req.headers(), peer.ip(), state);
    }

    if path == "/__status__" || path.starts_with("/__status__/") {
        if req.method() != Method::GET {
            return json_error_response(AgentErrorCode::MethodNotAllowed, "Use GET for /__status__");
        }
        let query = req.uri().query().map(str::to_string);
        drop(req);
        return handle_status(query.as_deref(), state).await;
    }

    if path == "/__health__" {
        let body = serde_json::json!({
            "status": "ok",
            "version": VERSION,
        });
        return json_response(StatusCode::OK, body.to_string());
    }

    handle_wake(req.headers(), state)
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

/// Hostname the client asked for: `X-Forwarded-Host`, else `Host`, without
/// port, lowercased
pub fn forwarded_host(headers: &HeaderMap) -> String {
    let raw = header_str(headers, "x-forwarded-host")
        .or_else(|| header_str(headers, HOST.as_str()))
        .unwrap_or_default();
    let first = raw.split(',').next().unwrap_or_default().trim();
    strip_port(first).to_ascii_lowercase()
}

fn strip_port(host: &str) -> &str {
    if let Some(rest) = host.strip_prefix('[') {
        // [v6]:port
        return rest.split(']').next().unwrap_or(rest);
    }
    match host.rsplit_once(':') {
        Some((name, port)) if !name.contains(':') && port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// Client address, preferring headers set by the CDN or proxy over the socket peer
pub fn client_ip(headers: &HeaderMap, peer: IpAddr) -> String {
    ["cf-connecting-ip", "true-client-ip", "x-real-ip"]
        .iter()
        .find_map(|name| header_str(headers, name))
        .map(str::to_string)
        .unwrap_or_else(|| peer.to_string())
}

/// Collect the authorization inputs of a forward-auth request
pub fn auth_request_from_headers(headers: &HeaderMap, peer: IpAddr) -> AuthRequest {
    AuthRequest {
        hostname: forwarded_host(headers),
        client_ip: client_ip(headers, peer),
        forwarded_for: header_str(headers, "x-forwarded-for").map(str::to_string),
        authorization: header_str(headers, AUTHORIZATION.as_str()).map(str::to_string),
    }
}

fn handle_auth(headers: &HeaderMap, peer: IpAddr, state: &FrontDoorState) -> Response<Full<Bytes>> {
    let ctx = &state.ctx;
    let request = auth_request_from_headers(headers, peer);

    let index = ctx.projects.snapshot();
    let project = index.project_for_host(&request.hostname);
    let project_policy = project
        .and_then(|name| index.overrides(name))
        .and_then(|o| o.auth_policy);
    let policy = effective_policy(&ctx.auth_policy, project_policy);

    let decision = decide(&request, &policy);

    if !decision.allowed {
        info!(
            hostname = %request.hostname,
            ip = request.real_ip(),
            reason = ?decision.reason,
            "Request denied"
        );
        let challenge = format!("Basic realm=\"{}\"", ctx.config.auth.realm.replace('"', ""));
        let mut response = response(StatusCode::UNAUTHORIZED, "Unauthorized");
        response.headers_mut().insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_str(&challenge).unwrap_or(HeaderValue::from_static("Basic realm=\"Trafic\"")),
        );
        return response;
    }

    if let Some(project) = project {
        if let Err(e) = ctx.registry.upsert_access(project) {
            warn!(project, error = %e, "Failed to record access");
        }

        let entry = AccessLogEntry::new(
            project,
            request.real_ip(),
            header_str(headers, USER_AGENT.as_str()).unwrap_or_default(),
            header_str(headers, "x-forwarded-uri").unwrap_or("/"),
        );
        if let Err(e) = ctx.registry.append_access_log(&entry) {
            warn!(project, error = %e, "Failed to write access log");
        }
    }

    debug!(hostname = %request.hostname, reason = ?decision.reason, "Request allowed");
    response(StatusCode::OK, Bytes::new())
}

fn query_param(query: Option<&str>, key: &str) -> Option<String> {
    query?
        .split('&')
        .filter_map(|pair| pair.split_once('=').or(Some((pair, ""))))
        .find(|(k, _)| *k == key)
        .and_then(|(_, v)| urlencoding::decode(v).ok())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

async fn handle_status(query: Option<&str>, state: &FrontDoorState) -> Response<Full<Bytes>> {
    let ctx = &state.ctx;

    let Some(name) = query_param(query, "project") else {
        return json_error_response(AgentErrorCode::MissingParameter, "Missing project parameter");
    };

    let record = match ctx.registry.get_status(&name) {
        Ok(status) => status,
        Err(e) => {
            warn!(project = %name, error = %e, "Failed to read project status");
            None
        }
    };

    if record.is_none() && !ctx.projects.snapshot().contains(&name) {
        return json_error_response(
            AgentErrorCode::UnknownProject,
            format!("Project not found: {}", name),
        );
    }

    let info = match ctx.control.describe(&name).await {
        Ok(info) => info,
        Err(e) => {
            debug!(project = %name, error = %e, "Describe failed, using registry status");
            None
        }
    };

    let status = info
        .as_ref()
        .map(|i| i.status.as_str())
        .or(record.map(|s| s.as_str()))
        .unwrap_or("unknown");
    let ready = info
        .as_ref()
        .is_some_and(|i| i.status == crate::control::ExternalStatus::Running);

    let body = serde_json::json!({
        "name": name,
        "status": status,
        "ready": ready,
    });
    json_response(StatusCode::OK, body.to_string())
}

fn handle_wake(headers: &HeaderMap, state: &FrontDoorState) -> Response<Full<Bytes>> {
    let hostname = forwarded_host(headers);
    let templates = &state.ctx.templates;

    match state.wake.handle(&hostname) {
        Ok(WakeOutcome::UnknownProject) => {
            html_response(StatusCode::NOT_FOUND, templates.error_page("Project not found", &hostname))
        }
        Ok(WakeOutcome::AlreadyStarting { project } | WakeOutcome::StartIssued { project }) => {
            let mut response = html_response(
                StatusCode::SERVICE_UNAVAILABLE,
                templates.wait_page(&project, &hostname),
            );
            response
                .headers_mut()
                .insert("retry-after", HeaderValue::from_static(RETRY_AFTER_SECS));
            response
        }
        Err(e) => {
            error!(hostname = %hostname, error = %e, "Wake request failed");
            internal_error_response()
        }
    }
}
