//! WebSocket server: accept loop and per-session task management.
//!
//! This module is responsible for:
//!
//! 1. Binding a TCP listener on the configured address.
//! 2. Accepting incoming TCP connections from machines and operators.
//! 3. Routing each upgrade request by path and verifying its bearer token
//!    *before* the WebSocket handshake completes:
//!    - `/{instance_id}/ws`      → machine session
//!    - `/app/{instance_id}/ws`  → operator session
//! 4. Spawning one Tokio task per accepted session.
//! 5. Shutting down gracefully when the `running` flag is cleared.
//!
//! The accept loop never blocks on a session: it hands the socket to a fresh
//! task and immediately accepts the next one, so the hub handles many
//! simultaneous machines and operators limited only by memory and the OS's
//! TCP stack.

use std::net::SocketAddr;
use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc,
};
use std::time::Duration;

use anyhow::Context;
use fleetlink_core::InstanceId;
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::application::MessageRouter;
use crate::domain::HubConfig;
use crate::infrastructure::auth::{CredentialCheck, StaticKeyCheck};
use crate::infrastructure::persistence::LoggingSignalStore;
use crate::infrastructure::{machine_session, operator_session};

// ── Shared state ──────────────────────────────────────────────────────────────

/// Everything a session task needs, cheaply cloneable.
#[derive(Clone)]
pub struct HubState {
    pub router: MessageRouter,
    pub credentials: Arc<dyn CredentialCheck>,
    pub config: Arc<HubConfig>,
}

impl HubState {
    /// Builds the default wiring: a router with the logging persistence
    /// stand-in and a static-key credential check from the config.
    pub fn new(config: HubConfig) -> Self {
        let credentials: Arc<dyn CredentialCheck> =
            Arc::new(StaticKeyCheck::new(config.security.access_key.clone()));
        Self {
            router: MessageRouter::new(Arc::new(LoggingSignalStore)),
            credentials,
            config: Arc::new(config),
        }
    }

    /// Builds state around externally constructed collaborators.
    pub fn with_collaborators(
        config: HubConfig,
        router: MessageRouter,
        credentials: Arc<dyn CredentialCheck>,
    ) -> Self {
        Self {
            router,
            credentials,
            config: Arc::new(config),
        }
    }
}

// ── Request routing ───────────────────────────────────────────────────────────

/// Which session kind an upgrade request asked for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionRoute {
    /// An instance-side socket: `/{instance_id}/ws`.
    Machine(InstanceId),
    /// An operator-side socket: `/app/{instance_id}/ws`.
    Operator(InstanceId),
}

/// Parses an upgrade request path into a session route.
///
/// Returns `None` for any path that is not one of the two channel shapes or
/// whose instance id is not a valid UUID.
pub fn parse_request_path(path: &str) -> Option<SessionRoute> {
    // Ignore any query string.
    let path = path.split('?').next().unwrap_or(path);
    let segments: Vec<&str> = path.trim_matches('/').split('/').collect();
    match segments.as_slice() {
        ["app", id, "ws"] => Uuid::parse_str(id).ok().map(SessionRoute::Operator),
        [id, "ws"] => Uuid::parse_str(id).ok().map(SessionRoute::Machine),
        _ => None,
    }
}

/// Extracts the bearer token from an upgrade request, if present.
fn bearer_token(request: &Request) -> Option<&str> {
    let value = request.headers().get("authorization")?.to_str().ok()?;
    value.strip_prefix("Bearer ")
}

/// Builds the HTTP error response that rejects an upgrade.
fn reject_upgrade(status: StatusCode, reason: &str) -> ErrorResponse {
    let mut response = ErrorResponse::new(Some(reason.to_string()));
    *response.status_mut() = status;
    response
}

// ── Public API ────────────────────────────────────────────────────────────────

/// Binds the hub's TCP listener.
///
/// Separate from [`serve`] so callers (and integration tests binding port 0)
/// can read the bound local address before the accept loop starts.
///
/// # Errors
///
/// Returns an error if the address cannot be bound (port in use, missing
/// privileges).
pub async fn bind_listener(addr: SocketAddr) -> anyhow::Result<TcpListener> {
    TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind hub listener on {addr}"))
}

/// Runs the accept loop until `running` is set to `false`.
///
/// Each accepted connection is handed to a dedicated Tokio task. A short
/// timeout on `accept()` lets the loop check the shutdown flag periodically
/// even when nothing is connecting.
pub async fn serve(listener: TcpListener, state: HubState, running: Arc<AtomicBool>) {
    loop {
        if !running.load(Ordering::Relaxed) {
            info!("shutdown flag set; stopping accept loop");
            break;
        }

        match timeout(Duration::from_millis(200), listener.accept()).await {
            Ok(Ok((stream, peer_addr))) => {
                let session_state = state.clone();
                tokio::spawn(async move {
                    handle_socket(stream, peer_addr, session_state).await;
                });
            }
            Ok(Err(e)) => {
                // Transient accept error (e.g. file-descriptor exhaustion);
                // keep serving the sessions that are already up.
                error!("accept error: {e}");
            }
            Err(_) => {
                // Timeout; loop back to check the running flag.
            }
        }
    }
}

/// Binds the configured address and serves until shutdown.
///
/// # Errors
///
/// Returns an error when the configured listen address is invalid or the
/// listener cannot be bound.
pub async fn run_server(config: HubConfig, running: Arc<AtomicBool>) -> anyhow::Result<()> {
    let addr = config.listen_addr()?;
    let listener = bind_listener(addr).await?;
    info!("fleetlink hub listening on {addr}");

    let state = HubState::new(config);
    serve(listener, state, running).await;
    Ok(())
}

// ── Per-socket handler ────────────────────────────────────────────────────────

/// Top-level handler for one accepted socket; logs the outcome.
async fn handle_socket(stream: TcpStream, peer_addr: SocketAddr, state: HubState) {
    match run_socket(stream, peer_addr, state).await {
        Ok(()) => info!("session {peer_addr} closed"),
        Err(e) => warn!("session {peer_addr} closed with error: {e:#}"),
    }
}

/// Performs the authenticated upgrade and dispatches to the session loop.
async fn run_socket(stream: TcpStream, peer_addr: SocketAddr, state: HubState) -> anyhow::Result<()> {
    let credentials = Arc::clone(&state.credentials);
    let mut route: Option<SessionRoute> = None;

    let callback = |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(parsed) = parse_request_path(request.uri().path()) else {
            return Err(reject_upgrade(StatusCode::NOT_FOUND, "unknown path"));
        };
        match bearer_token(request) {
            Some(token) if credentials.verify(token) => {
                route = Some(parsed);
                Ok(response)
            }
            Some(_) => Err(reject_upgrade(StatusCode::FORBIDDEN, "invalid credentials")),
            None => Err(reject_upgrade(
                StatusCode::UNAUTHORIZED,
                "missing bearer token",
            )),
        }
    };

    let ws_stream = accept_hdr_async(stream, callback)
        .await
        .with_context(|| format!("WebSocket handshake failed with {peer_addr}"))?;

    let Some(route) = route else {
        anyhow::bail!("handshake completed without a route");
    };

    match route {
        SessionRoute::Machine(instance_id) => {
            info!("machine {instance_id} connected from {peer_addr}");
            machine_session::run(ws_stream, instance_id, state).await
        }
        SessionRoute::Operator(instance_id) => {
            info!("operator for instance {instance_id} connected from {peer_addr}");
            operator_session::run(ws_stream, instance_id, state).await
        }
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_machine_path_parses() {
        let id = Uuid::new_v4();
        let route = parse_request_path(&format!("/{id}/ws"));
        assert_eq!(route, Some(SessionRoute::Machine(id)));
    }

    #[test]
    fn test_operator_path_parses() {
        let id = Uuid::new_v4();
        let route = parse_request_path(&format!("/app/{id}/ws"));
        assert_eq!(route, Some(SessionRoute::Operator(id)));
    }

    #[test]
    fn test_path_with_query_string_parses() {
        let id = Uuid::new_v4();
        let route = parse_request_path(&format!("/{id}/ws?version=1"));
        assert_eq!(route, Some(SessionRoute::Machine(id)));
    }

    #[test]
    fn test_invalid_uuid_is_rejected() {
        assert_eq!(parse_request_path("/not-a-uuid/ws"), None);
        assert_eq!(parse_request_path("/app/not-a-uuid/ws"), None);
    }

    #[test]
    fn test_unknown_paths_are_rejected() {
        let id = Uuid::new_v4();
        assert_eq!(parse_request_path("/"), None);
        assert_eq!(parse_request_path("/health"), None);
        assert_eq!(parse_request_path(&format!("/{id}")), None);
        assert_eq!(parse_request_path(&format!("/{id}/ws/extra")), None);
        assert_eq!(parse_request_path(&format!("/app/{id}/ws/extra")), None);
    }

    #[test]
    fn test_reject_upgrade_sets_status() {
        let response = reject_upgrade(StatusCode::UNAUTHORIZED, "missing bearer token");
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.body().as_deref(), Some("missing bearer token"));
    }
}
