use std::convert::Infallible;
use std::io::Read;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tower_http::trace::TraceLayer;
use utoipa::{OpenApi, ToSchema};

use edge_relay_broker::{CollectionGate, Collector, ValueStream};
use edge_relay_error::{ErrorType, ProblemDetails, RelayError};

use crate::catalog::{CatalogSnapshot, ToolCatalog};
use crate::config::{
    BrokerSection, ClientConfigDocument, RelayConfig, RuntimeSelection, TimeseriesSection,
};
use crate::relay::StreamingRelay;
use crate::runtime::{AgentRuntime, ClaudeRuntime, MockRuntime};
use crate::session::{Exchange, SessionStore};
use crate::tools::{
    CollectValuesTool, CurrentValueTool, ResourceDescriptor, ToolDescriptor, ToolRegistry,
};

/// Session identity travels in this header; responses echo it back so a
/// first-time caller learns its token.
pub const SESSION_HEADER: &str = "x-session-id";

pub struct AppState {
    config: RelayConfig,
    sessions: Arc<SessionStore>,
    relay: Option<StreamingRelay>,
    catalog: Option<ToolCatalog>,
    gate: Arc<CollectionGate>,
}

impl AppState {
    /// Wire the configured runtime against the given value stream.
    pub fn new(config: RelayConfig, stream: Arc<dyn ValueStream>) -> Self {
        let gate = Arc::new(CollectionGate::new());
        let collector = Arc::new(Collector::new(stream));

        let mut registry = ToolRegistry::new();
        registry.register(Arc::new(CurrentValueTool::new(
            collector.clone(),
            gate.clone(),
            config.current_timeout,
        )));
        registry.register(Arc::new(CollectValuesTool::new(
            collector,
            gate.clone(),
            config.collect_gap_timeout,
            config.collect_overall_timeout,
        )));
        let registry = Arc::new(registry);

        let runtime: Option<Arc<dyn AgentRuntime>> = match &config.runtime {
            RuntimeSelection::Claude(claude) => {
                Some(Arc::new(ClaudeRuntime::new(claude.clone(), registry)))
            }
            RuntimeSelection::Mock => Some(Arc::new(MockRuntime::new())),
            RuntimeSelection::Unconfigured { reason } => {
                tracing::warn!(reason = %reason, "agent runtime not configured, querying disabled");
                None
            }
        };
        Self::with_runtime(config, runtime, gate)
    }

    /// Tests inject a scripted runtime directly.
    pub fn with_runtime(
        config: RelayConfig,
        runtime: Option<Arc<dyn AgentRuntime>>,
        gate: Arc<CollectionGate>,
    ) -> Self {
        let sessions = Arc::new(SessionStore::new(config.history_limit));
        let relay = runtime
            .clone()
            .map(|runtime| StreamingRelay::new(sessions.clone(), runtime));
        let catalog = runtime.map(ToolCatalog::new);
        Self {
            config,
            sessions,
            relay,
            catalog,
            gate,
        }
    }

    pub fn sessions(&self) -> Arc<SessionStore> {
        self.sessions.clone()
    }

    pub fn gate(&self) -> Arc<CollectionGate> {
        self.gate.clone()
    }
}

pub fn build_router(state: AppState) -> Router {
    let shared = Arc::new(state);
    Router::new()
        .route("/v1/health", get(get_health))
        .route("/v1/query", post(post_query))
        .route("/v1/history", get(get_history))
        .route("/v1/history/clear", post(post_clear_history))
        .route("/v1/catalog", get(get_catalog))
        .route("/v1/client-config", get(get_client_config))
        .route("/v1/live-data", get(get_live_data).post(post_live_data))
        .route("/v1/openapi.json", get(get_openapi))
        .with_state(shared)
        .layer(TraceLayer::new_for_http())
}

async fn get_openapi() -> Json<utoipa::openapi::OpenApi> {
    Json(ApiDoc::openapi())
}

#[derive(OpenApi)]
#[openapi(
    paths(
        get_health,
        post_query,
        get_history,
        post_clear_history,
        get_catalog,
        get_client_config,
        get_live_data,
        post_live_data
    ),
    components(schemas(
        QueryRequest,
        HistoryResponse,
        HealthResponse,
        LiveDataRequest,
        LiveDataStatus,
        Exchange,
        CatalogSnapshot,
        ToolDescriptor,
        ResourceDescriptor,
        ClientConfigDocument,
        BrokerSection,
        TimeseriesSection,
        ProblemDetails,
        ErrorType
    )),
    tags((name = "relay", description = "Streaming chat relay API"))
)]
pub struct ApiDoc;

#[derive(Debug)]
pub enum ApiError {
    Relay(RelayError),
}

impl From<RelayError> for ApiError {
    fn from(value: RelayError) -> Self {
        Self::Relay(value)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let problem: ProblemDetails = match &self {
            ApiError::Relay(err) => err.to_problem_details(),
        };
        let status =
            StatusCode::from_u16(problem.status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        (status, Json(problem)).into_response()
    }
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct QueryRequest {
    pub query: String,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct HistoryResponse {
    pub session_id: String,
    pub exchanges: Vec<Exchange>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct LiveDataRequest {
    pub enabled: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LiveDataStatus {
    pub enabled: bool,
}

#[utoipa::path(
    get,
    path = "/v1/health",
    responses((status = 200, body = HealthResponse)),
    tag = "relay"
)]
async fn get_health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/query",
    request_body = QueryRequest,
    responses(
        (status = 200, description = "Incrementally flushed plain-text reply"),
        (status = 400, body = ProblemDetails),
        (status = 409, body = ProblemDetails),
        (status = 503, body = ProblemDetails)
    ),
    tag = "relay"
)]
async fn post_query(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(request): Json<QueryRequest>,
) -> Result<Response, ApiError> {
    let relay = state.relay.as_ref().ok_or_else(|| RelayError::RuntimeUnavailable {
        message: "no agent runtime configured".to_string(),
    })?;

    let session_id = session_identity(&headers);
    state.sessions.get_or_create(&session_id);
    let stream = relay.submit(&session_id, &request.query)?;

    let body = Body::from_stream(stream.map(|fragment| Ok::<_, Infallible>(Bytes::from(fragment))));
    let mut response = Response::new(body);
    response.headers_mut().insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    response.headers_mut().insert(
        header::CACHE_CONTROL,
        HeaderValue::from_static("no-cache, no-store, must-revalidate"),
    );
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    Ok(response)
}

#[utoipa::path(
    get,
    path = "/v1/history",
    responses((status = 200, body = HistoryResponse)),
    tag = "relay"
)]
async fn get_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let session_id = session_identity(&headers);
    state.sessions.get_or_create(&session_id);
    let exchanges = state.sessions.history(&session_id);
    (
        [(SESSION_HEADER, session_id.clone())],
        Json(HistoryResponse {
            session_id,
            exchanges,
        }),
    )
}

#[utoipa::path(
    post,
    path = "/v1/history/clear",
    responses(
        (status = 204, description = "History cleared"),
        (status = 409, body = ProblemDetails)
    ),
    tag = "relay"
)]
async fn post_clear_history(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    if let Some(session_id) = provided_session(&headers) {
        state.sessions.clear(&session_id)?;
    }
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/v1/catalog",
    responses(
        (status = 200, body = CatalogSnapshot),
        (status = 503, body = ProblemDetails)
    ),
    tag = "relay"
)]
async fn get_catalog(State(state): State<Arc<AppState>>) -> Result<Json<CatalogSnapshot>, ApiError> {
    let catalog = state.catalog.as_ref().ok_or_else(|| RelayError::CatalogUnavailable {
        message: "no agent runtime configured".to_string(),
    })?;
    Ok(Json(catalog.list().await?))
}

#[utoipa::path(
    get,
    path = "/v1/client-config",
    responses((status = 200, body = ClientConfigDocument)),
    tag = "relay"
)]
async fn get_client_config(State(state): State<Arc<AppState>>) -> Json<ClientConfigDocument> {
    Json(state.config.client_config_document())
}

#[utoipa::path(
    get,
    path = "/v1/live-data",
    responses((status = 200, body = LiveDataStatus)),
    tag = "relay"
)]
async fn get_live_data(State(state): State<Arc<AppState>>) -> Json<LiveDataStatus> {
    Json(LiveDataStatus {
        enabled: state.gate.is_enabled(),
    })
}

#[utoipa::path(
    post,
    path = "/v1/live-data",
    request_body = LiveDataRequest,
    responses((status = 200, body = LiveDataStatus)),
    tag = "relay"
)]
async fn post_live_data(
    State(state): State<Arc<AppState>>,
    Json(request): Json<LiveDataRequest>,
) -> Json<LiveDataStatus> {
    let enabled = state.gate.set_enabled(request.enabled);
    tracing::info!(enabled, "live data collection toggled");
    Json(LiveDataStatus { enabled })
}

fn provided_session(headers: &HeaderMap) -> Option<String> {
    headers
        .get(SESSION_HEADER)
        .and_then(|value| value.to_str().ok())
        .filter(|value| !value.is_empty())
        .map(|value| value.to_string())
}

fn session_identity(headers: &HeaderMap) -> String {
    provided_session(headers).unwrap_or_else(new_session_token)
}

fn new_session_token() -> String {
    let mut bytes = [0u8; 16];
    if read_random_bytes(&mut bytes) {
        return hex_encode(&bytes);
    }

    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    let pid = std::process::id() as u128;
    bytes = (now ^ (pid << 64)).to_le_bytes();
    hex_encode(&bytes)
}

fn read_random_bytes(buf: &mut [u8]) -> bool {
    let mut file = match std::fs::File::open("/dev/urandom") {
        Ok(file) => file,
        Err(_) => return false,
    };
    file.read_exact(buf).is_ok()
}

fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push_str(&format!("{:02x}", byte));
    }
    out
}
