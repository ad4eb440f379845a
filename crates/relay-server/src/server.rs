//! `HubServer` — Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::Router;
use metrics_exporter_prometheus::PrometheusHandle;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::limit::RequestBodyLimitLayer;
use tower_http::request_id::{
    MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer,
};
use tower_http::timeout::TimeoutLayer;
use tracing::{info, instrument, warn};

use crate::config::HubConfig;
use crate::hub::client::ClientRecord;
use crate::hub::Hub;
use crate::middleware::require_bearer;
use crate::routes::admin;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::session::{run_session, SessionTimings};

/// Generates UUIDv7 request IDs.
#[derive(Clone)]
struct UuidV7RequestId;

impl MakeRequestId for UuidV7RequestId {
    fn make_request_id<B>(&mut self, _request: &axum::http::Request<B>) -> Option<RequestId> {
        let id = uuid::Uuid::now_v7().to_string();
        axum::http::HeaderValue::from_str(&id).ok().map(RequestId::new)
    }
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub hub: Arc<Hub>,
    pub config: HubConfig,
    pub shutdown: Arc<ShutdownCoordinator>,
    pub start_time: Instant,
    pub metrics_handle: Arc<PrometheusHandle>,
}

/// The hub server.
pub struct HubServer {
    config: HubConfig,
    hub: Arc<Hub>,
    shutdown: Arc<ShutdownCoordinator>,
    metrics_handle: Arc<PrometheusHandle>,
    start_time: Instant,
}

impl HubServer {
    pub fn new(config: HubConfig, hub: Arc<Hub>, metrics_handle: PrometheusHandle) -> Self {
        Self {
            config,
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            metrics_handle: Arc::new(metrics_handle),
            start_time: Instant::now(),
        }
    }

    /// Build the Axum router with all routes and middleware.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics_handle: self.metrics_handle.clone(),
        };

        // Everything except the upgrade endpoint and /metrics requires the
        // admin bearer token.
        let admin_routes = Router::new()
            .route("/health", get(admin::health))
            .route("/clients", get(admin::list_clients))
            .route(
                "/channels",
                get(admin::list_channels).post(admin::configure_channel),
            )
            .route("/channels/{channel}/clients", get(admin::channel_clients))
            .route("/clients/{client}/kick", post(admin::kick_client))
            .route("/broadcast", post(admin::broadcast))
            .route_layer(axum::middleware::from_fn_with_state(
                state.clone(),
                require_bearer,
            ));

        Router::new()
            .route("/ws", get(ws_upgrade_handler))
            .route("/metrics", get(metrics_handler))
            .merge(admin_routes)
            .with_state(state)
            // Outermost layers execute first on request, last on response.
            .layer(CatchPanicLayer::new())
            .layer(RequestBodyLimitLayer::new(1024 * 1024)) // 1 MB
            .layer(TimeoutLayer::with_status_code(
                StatusCode::REQUEST_TIMEOUT,
                Duration::from_secs(30),
            ))
            .layer(SetRequestIdLayer::x_request_id(UuidV7RequestId))
            .layer(PropagateRequestIdLayer::x_request_id())
    }

    /// Bind and start serving. Returns the bound address and a join handle
    /// for the server task.
    #[instrument(skip_all, fields(host = %self.config.host, port = self.config.port))]
    pub async fn listen(
        &self,
    ) -> Result<(SocketAddr, tokio::task::JoinHandle<()>), std::io::Error> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr).await?;
        let bound_addr = listener.local_addr()?;

        info!(addr = %bound_addr, "hub server started");

        let router = self.router();
        let shutdown_token = self.shutdown.token();

        let handle = tokio::spawn(async move {
            let _ = axum::serve(
                listener,
                router.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .with_graceful_shutdown(async move {
                shutdown_token.cancelled().await;
                info!("server shutdown initiated");
            })
            .await;
            info!("server shutdown complete");
        });

        Ok((bound_addr, handle))
    }

    pub fn hub(&self) -> &Arc<Hub> {
        &self.hub
    }

    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    pub fn config(&self) -> &HubConfig {
        &self.config
    }
}

/// GET /metrics — Prometheus text format.
async fn metrics_handler(State(state): State<AppState>) -> String {
    state.metrics_handle.render()
}

/// GET /ws — WebSocket upgrade handler.
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Result<impl IntoResponse, StatusCode> {
    let current = state.hub.client_count().await;
    if current >= state.config.max_connections {
        warn!(
            current,
            max = state.config.max_connections,
            "connection limit reached, rejecting WebSocket upgrade"
        );
        return Err(StatusCode::SERVICE_UNAVAILABLE);
    }

    let client_id = uuid::Uuid::now_v7().to_string();
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();

    let (lane_tx, lane_rx) = mpsc::channel(state.config.lane_capacity);
    let client = Arc::new(ClientRecord::new(
        client_id,
        addr.to_string(),
        user_agent,
        lane_tx,
        Duration::from_millis(state.config.send_timeout_ms),
    ));

    let timings = SessionTimings::from_config(&state.config);
    let hub = state.hub.clone();
    let server_cancel = state.shutdown.token();

    Ok(ws
        .max_message_size(state.config.max_message_size)
        .on_upgrade(move |socket| {
            run_session(socket, hub, client, lane_rx, timings, server_cancel)
        }))
}
