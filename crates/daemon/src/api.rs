// SPDX-License-Identifier: Apache-2.0
// Copyright 2025 Devtunnel Host Contributors

// Devtunnel Host - REST API Module
// Loopback HTTP endpoints for login, hosting control and the event stream

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::sse::{Event, KeepAlive, Sse},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use chrono::Utc;
use futures::{stream, Stream, StreamExt};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tracing::{debug, error, info};

use devtunnel_host_common::{
    ClusterDetails, ErrorResponse, HostEvent, HostSummary, LoginRequest, StartHostRequest,
    UserLimit, UserStatus,
};

use crate::error::HostError;
use crate::registry::HostRegistry;

/// Shared application state
pub struct AppState {
    pub registry: HostRegistry,
    pub shutdown_tx: broadcast::Sender<()>,
}

/// Error wrapper mapping host errors onto HTTP status codes
pub struct ApiError(HostError);

impl From<HostError> for ApiError {
    fn from(err: HostError) -> Self {
        Self(err)
    }
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self.0 {
            HostError::NotLoggedIn => StatusCode::UNAUTHORIZED,
            HostError::TooManyConnections | HostError::AlreadyHosting(_) => StatusCode::CONFLICT,
            HostError::HostNotFound(_) => StatusCode::NOT_FOUND,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        if status.is_server_error() {
            error!("API request failed: {}", self.0);
        } else {
            debug!("API request refused: {}", self.0);
        }

        let body = ErrorResponse {
            error: self.0.to_string(),
            kind: self.0.kind().to_string(),
        };
        (status, Json(body)).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .route("/api/login", post(login))
        .route("/api/user", get(user))
        .route("/api/limits", get(limits))
        .route("/api/clusters", get(clusters))
        .route("/api/hosts", get(list_hosts))
        .route("/api/hosts/:id", get(host_status))
        .route("/api/hosts/:id/start", post(start_host))
        .route("/api/hosts/:id/stop", post(stop_host))
        .route("/api/hosts/:id/refresh", post(refresh_host))
        .route("/api/events", get(event_stream))
        .with_state(state)
}

async fn health() -> &'static str {
    "OK"
}

/// Run the interactive login; output lines are streamed as `login_output` events
async fn login(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<UserStatus> {
    info!("API: Login request using {}", request.platform);
    let token = state.registry.tokens().login(request.platform).await?;
    Ok(Json(UserStatus {
        logged_in: true,
        provider: Some(token.scheme().provider().to_string()),
    }))
}

async fn user(State(state): State<Arc<AppState>>) -> ApiResult<UserStatus> {
    match state.registry.tokens().get_token().await {
        Ok(token) => Ok(Json(UserStatus {
            logged_in: true,
            provider: Some(token.scheme().provider().to_string()),
        })),
        Err(HostError::NotLoggedIn) => Ok(Json(UserStatus {
            logged_in: false,
            provider: None,
        })),
        Err(e) => Err(e.into()),
    }
}

async fn limits(State(state): State<Arc<AppState>>) -> ApiResult<Vec<UserLimit>> {
    let limits = state
        .registry
        .management()
        .user_limits()
        .await
        .map_err(HostError::from)?;
    Ok(Json(limits))
}

async fn clusters(State(state): State<Arc<AppState>>) -> ApiResult<Vec<ClusterDetails>> {
    let clusters = state
        .registry
        .management()
        .list_clusters()
        .await
        .map_err(HostError::from)?;
    Ok(Json(clusters))
}

async fn list_hosts(State(state): State<Arc<AppState>>) -> Json<Vec<HostSummary>> {
    Json(state.registry.list().await)
}

async fn host_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<HostSummary> {
    Ok(Json(state.registry.status(&id).await?))
}

async fn start_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    request: Option<Json<StartHostRequest>>,
) -> ApiResult<HostSummary> {
    let cluster_id = request.and_then(|Json(r)| r.cluster_id);
    info!("API: Start host request for {}", id);
    let summary = state.registry.start_tunnel(&id, cluster_id).await?;
    Ok(Json(summary))
}

async fn stop_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> Result<StatusCode, ApiError> {
    info!("API: Stop host request for {}", id);
    state.registry.stop_tunnel(&id).await?;
    Ok(StatusCode::OK)
}

async fn refresh_host(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<HostSummary> {
    info!("API: Refresh ports request for {}", id);
    Ok(Json(state.registry.refresh_ports(&id).await?))
}

/// GET /api/events  → SSE stream of host events
pub async fn event_stream(
    State(state): State<Arc<AppState>>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.registry.subscribe();
    let mut shutdown_rx = state.shutdown_tx.subscribe();

    let host_events = BroadcastStream::new(rx).filter_map(|msg| async move {
        match msg {
            Ok(event) => encode_event(&event).map(Ok),
            Err(lagged) => {
                // Slow consumer; later events still arrive
                debug!("Event stream lagged: {:?}, continuing", lagged);
                None
            }
        }
    });

    let merged = stream::select(host_events, heartbeat_stream());

    let shutdown_aware = merged.take_until(async move {
        let _ = shutdown_rx.recv().await;
    });

    Sse::new(shutdown_aware).keep_alive(KeepAlive::default())
}

fn encode_event(event: &HostEvent) -> Option<Event> {
    match serde_json::to_string(event) {
        Ok(json) => Some(Event::default().data(json)),
        Err(e) => {
            error!("Failed to serialize HostEvent: {e}");
            None
        }
    }
}

fn heartbeat_stream() -> impl Stream<Item = Result<Event, Infallible>> + Send + Sync + 'static {
    tokio_stream::wrappers::IntervalStream::new(tokio::time::interval(heartbeat_interval()))
        .filter_map(|_| async {
            encode_event(&HostEvent::Heartbeat {
                timestamp: Utc::now(),
            })
            .map(Ok)
        })
}

#[cfg(not(test))]
fn heartbeat_interval() -> Duration {
    Duration::from_secs(10)
}

#[cfg(test)]
fn heartbeat_interval() -> Duration {
    Duration::from_millis(100)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::host::{HostOptions, ReconnectPolicy};
    use crate::relay::ProtocolVariant;
    use crate::testing::{FakeConnector, FakeManagement, StaticHelper};
    use crate::token::TokenStore;
    use axum::body::{to_bytes, Body};
    use axum::http::Request;
    use devtunnel_host_common::TunnelPort;
    use tower::ServiceExt;

    struct Fixture {
        router: Router,
        management: Arc<FakeManagement>,
        registry: HostRegistry,
    }

    fn fixture() -> Fixture {
        let management = Arc::new(FakeManagement::new(vec![TunnelPort::new(8080)]));
        let connector = Arc::new(FakeConnector::new(ProtocolVariant::Current));
        let event_tx = HostRegistry::event_channel();
        let tokens = TokenStore::new(
            Arc::new(StaticHelper::logged_in()),
            Duration::from_secs(30),
            event_tx.clone(),
        );
        let options = HostOptions {
            reconnect: ReconnectPolicy {
                delay: Duration::from_millis(1),
                ..Default::default()
            },
            ..Default::default()
        };
        let registry = HostRegistry::new(
            management.clone(),
            connector,
            tokens,
            options,
            "asse",
            event_tx,
        );
        let (shutdown_tx, _) = broadcast::channel(1);
        let state = Arc::new(AppState {
            registry: registry.clone(),
            shutdown_tx,
        });
        Fixture {
            router: create_router(state),
            management,
            registry,
        }
    }

    async fn send(router: &Router, method: &str, uri: &str) -> (StatusCode, serde_json::Value) {
        let request = Request::builder()
            .method(method)
            .uri(uri)
            .body(Body::empty())
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, value)
    }

    #[tokio::test]
    async fn heartbeat_stream_emits() {
        let mut stream = std::pin::pin!(heartbeat_stream());
        let evt = tokio::time::timeout(Duration::from_secs(1), stream.next())
            .await
            .expect("heartbeat timed out");
        assert!(evt.is_some());
    }

    #[test]
    fn heartbeat_payload_is_tagged() {
        let json = serde_json::to_string(&HostEvent::Heartbeat {
            timestamp: Utc::now(),
        })
        .unwrap();
        assert!(json.contains("\"type\":\"heartbeat\""));
    }

    #[test]
    fn error_status_mapping() {
        let cases = [
            (HostError::NotLoggedIn, StatusCode::UNAUTHORIZED),
            (HostError::TooManyConnections, StatusCode::CONFLICT),
            (HostError::AlreadyHosting("t1".into()), StatusCode::CONFLICT),
            (HostError::HostNotFound("t1".into()), StatusCode::NOT_FOUND),
            (HostError::Cancelled, StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (err, expected) in cases {
            assert_eq!(ApiError::from(err).status(), expected);
        }
    }

    #[tokio::test]
    async fn health_and_user() {
        let f = fixture();
        let (status, _) = send(&f.router, "GET", "/api/health").await;
        assert_eq!(status, StatusCode::OK);

        let (status, body) = send(&f.router, "GET", "/api/user").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["logged_in"], true);
        assert_eq!(body["provider"], "github");
    }

    #[tokio::test]
    async fn start_status_and_stop_host() {
        let f = fixture();

        let (status, body) = send(&f.router, "POST", "/api/hosts/t1/start").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["tunnel_id"], "t1");
        assert_eq!(body["state"], "active");

        let (status, body) = send(&f.router, "POST", "/api/hosts/t1/start").await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body["kind"], "already_hosting");

        let (status, body) = send(&f.router, "GET", "/api/hosts").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body.as_array().map(Vec::len), Some(1));

        let (status, _) = send(&f.router, "GET", "/api/hosts/t1").await;
        assert_eq!(status, StatusCode::OK);

        let (status, _) = send(&f.router, "POST", "/api/hosts/t1/stop").await;
        assert_eq!(status, StatusCode::OK);
        assert!(!f.registry.is_started("t1").await);

        let (status, body) = send(&f.router, "GET", "/api/hosts/t1").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body["kind"], "host_not_found");
    }

    #[tokio::test]
    async fn unauthorized_directory_maps_to_401() {
        let f = fixture();
        f.management.set_unauthorized(true);

        let (status, body) = send(&f.router, "GET", "/api/limits").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["kind"], "not_logged_in");

        let (status, _) = send(&f.router, "POST", "/api/hosts/t1/start").await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert!(!f.registry.is_started("t1").await);
    }

    #[tokio::test]
    async fn clusters_are_listed() {
        let f = fixture();
        let (status, body) = send(&f.router, "GET", "/api/clusters").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.is_array());
    }
}
