use axum::{
    body::Bytes,
    extract::{
        rejection::{BytesRejection, QueryRejection},
        DefaultBodyLimit, Query, State,
    },
    http::StatusCode,
    middleware,
    routing::{get, post},
    Extension, Json, Router,
};
use provisioner_sdk::VmStatus;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::{json, Value};
use tower_http::trace::TraceLayer;

use crate::{
    broker::{CreateSessionRequest, CreatedSession, SessionBroker, TerminateMode},
    chat::{ChatProxy, ChatTurn},
    error::{ApiError, BrokerError},
    guard::{csrf_protect, rate_limit, CsrfGuard, CsrfToken, RateLimiter},
    image::ImageProxy,
};

#[derive(Clone)]
pub struct AppState {
    pub broker: SessionBroker,
    pub chat: ChatProxy,
    pub image: ImageProxy,
}

/// Guards applied to the `/api` routes. `None` disables the guard.
#[derive(Clone)]
pub struct RouterOptions {
    pub rate_limiter: Option<RateLimiter>,
    pub csrf: Option<CsrfGuard>,
    pub max_body_bytes: usize,
}

impl Default for RouterOptions {
    fn default() -> Self {
        Self {
            rate_limiter: None,
            csrf: None,
            max_body_bytes: 16 * 1024,
        }
    }
}

pub fn build_router(state: AppState, options: RouterOptions) -> Router {
    let mut api = Router::new()
        .route(
            "/api/hyperbeam",
            post(create_session)
                .get(session_status)
                .delete(terminate_session)
                .fallback(method_not_allowed),
        )
        .route(
            "/api/hyperbeam/terminate",
            post(terminate_session).fallback(method_not_allowed),
        )
        .route(
            "/api/chat",
            post(complete_chat).fallback(method_not_allowed),
        )
        .route(
            "/api/image",
            post(generate_image).fallback(method_not_allowed),
        );

    if options.csrf.is_some() {
        api = api.route(
            "/api/csrf",
            get(issue_csrf_token).fallback(method_not_allowed),
        );
    }

    api = api.layer(DefaultBodyLimit::max(options.max_body_bytes));
    if let Some(guard) = options.csrf {
        api = api.layer(middleware::from_fn_with_state(guard, csrf_protect));
    }
    // Added last so it runs before every other guard.
    if let Some(limiter) = options.rate_limiter {
        api = api.layer(middleware::from_fn_with_state(limiter, rate_limit));
    }

    Router::new()
        .route("/healthz", get(health_check).fallback(method_not_allowed))
        .merge(api)
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HealthStatus {
    pub status: String,
    pub active_sessions: usize,
    pub pending_expiries: usize,
}

#[derive(Debug, Deserialize)]
pub struct StatusQuery {
    #[serde(default)]
    pub session_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
pub struct TerminateRequest {
    #[serde(default)]
    pub session_id: Option<String>,
    /// Use the API-key-only hard delete instead of the admin-token terminate.
    #[serde(default)]
    pub hard: bool,
}

/// POST /api/hyperbeam
async fn create_session(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<CreatedSession>, ApiError> {
    let request: CreateSessionRequest = parse_body(body)?;
    let created = state.broker.create(request).await?;
    Ok(Json(created))
}

/// GET /api/hyperbeam?session_id=
async fn session_status(
    State(state): State<AppState>,
    query: Result<Query<StatusQuery>, QueryRejection>,
) -> Result<Json<VmStatus>, ApiError> {
    let Query(query) =
        query.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
    let session_id = required_session_id(query.session_id)?;
    match state.broker.status(&session_id).await {
        Ok(status) => Ok(Json(status)),
        // A failed upstream lookup means the session is gone as far as the
        // client is concerned.
        Err(BrokerError::Upstream { message, .. }) => {
            Err(ApiError::new(StatusCode::NOT_FOUND, message))
        }
        Err(err) => Err(err.into()),
    }
}

/// DELETE /api/hyperbeam, POST /api/hyperbeam/terminate
async fn terminate_session(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let request: TerminateRequest = parse_body(body)?;
    let session_id = required_session_id(request.session_id)?;
    let mode = if request.hard {
        TerminateMode::Hard
    } else {
        TerminateMode::Soft
    };
    state.broker.terminate(&session_id, mode).await?;
    Ok(Json(json!({ "ok": true })))
}

#[derive(Debug, Default, Deserialize)]
pub struct ChatRequest {
    #[serde(default)]
    pub history: Option<Vec<ChatTurn>>,
}

/// POST /api/chat
async fn complete_chat(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let request: ChatRequest = parse_body(body)?;
    let history = request
        .history
        .ok_or_else(|| ApiError::bad_request("Missing or invalid 'history' in request body."))?;
    let text = state.chat.complete(&history).await?;
    Ok(Json(json!({ "text": text })))
}

/// POST /api/image
async fn generate_image(
    State(state): State<AppState>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<Value>, ApiError> {
    let payload: Value = parse_body(body)?;
    let prompt = payload
        .get("prompt")
        .and_then(Value::as_str)
        .filter(|prompt| !prompt.trim().is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing or invalid 'prompt' in request body."))?;
    let url = state.image.generate(prompt).await?;
    Ok(Json(json!({ "url": url })))
}

/// GET /api/csrf
async fn issue_csrf_token(Extension(CsrfToken(token)): Extension<CsrfToken>) -> Json<Value> {
    Json(json!({ "csrf_token": token }))
}

/// GET /healthz
async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok".to_string(),
        active_sessions: state.broker.store().len(),
        pending_expiries: state.broker.expiry().pending(),
    })
}

async fn method_not_allowed() -> ApiError {
    ApiError::method_not_allowed()
}

async fn not_found() -> ApiError {
    ApiError::new(StatusCode::NOT_FOUND, "Not found")
}

fn required_session_id(session_id: Option<String>) -> Result<String, ApiError> {
    session_id
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .ok_or_else(|| ApiError::bad_request("Missing session_id"))
}

/// Empty bodies deserialize to `T::default()`, matching clients that POST nothing.
fn parse_body<T>(body: Result<Bytes, BytesRejection>) -> Result<T, ApiError>
where
    T: DeserializeOwned + Default,
{
    let bytes = body.map_err(|rejection| ApiError::new(rejection.status(), rejection.body_text()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(T::default());
    }
    serde_json::from_slice(&bytes)
        .map_err(|err| ApiError::bad_request(format!("Invalid JSON body: {err}")))
}
