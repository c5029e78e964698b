use async_trait::async_trait;
use axum::{
    body::Bytes,
    extract::{rejection::QueryRejection, FromRequest, OriginalUri, Path, Query, Request, State},
    http::{header, HeaderValue, Method, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{delete, get, post},
    Router,
};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::json;
use shared::*;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};
use uuid::Uuid;
use crate::auth::{AdminUser, AuthService, Authenticated, PatientUser};
use crate::booking::{parse_instant, BookingEngine, BookingRequest, CancelRequest, CreateSlotRequest};
use crate::error::ServiceError;

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<BookingEngine>,
    pub auth: Arc<AuthService>,
}

#[derive(Debug, Serialize)]
pub struct Envelope<T> {
    pub ok: bool,
    pub data: T,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub ok: bool,
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct BookingResponse {
    pub message: String,
    pub appointment: Appointment,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub message: String,
    pub user: Identity,
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct UserResponse {
    pub user: Identity,
}

#[derive(Debug, Default, Deserialize)]
pub struct SlotListParams {
    pub from: Option<String>,
    pub to: Option<String>,
    pub page: Option<i64>,
    pub limit: Option<i64>,
}

#[derive(Debug, Default, Deserialize)]
pub struct CredentialsRequest {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// JSON request body whose failures answer with the error envelope.
///
/// An empty body deserializes to `T::default()`, so missing fields reach the
/// engine and get its own validation messages.
pub struct JsonBody<T>(pub T);

#[async_trait]
impl<S, T> FromRequest<S> for JsonBody<T>
where
    S: Send + Sync,
    T: DeserializeOwned + Default,
{
    type Rejection = ServiceError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        let bytes = Bytes::from_request(req, state)
            .await
            .map_err(|rejection| ServiceError::validation(rejection.body_text()))?;
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(JsonBody(T::default()));
        }
        serde_json::from_slice(&bytes)
            .map(JsonBody)
            .map_err(|e| ServiceError::validation(format!("invalid request body: {}", e)))
    }
}

impl From<QueryRejection> for ServiceError {
    fn from(rejection: QueryRejection) -> Self {
        ServiceError::validation(rejection.body_text())
    }
}

type ApiResult<T> = Result<Json<Envelope<T>>, ServiceError>;

fn ok<T: Serialize>(data: T) -> ApiResult<T> {
    Ok(Json(Envelope { ok: true, data }))
}

fn message(text: &str) -> ApiResult<MessageResponse> {
    ok(MessageResponse { message: text.to_string() })
}

impl IntoResponse for ServiceError {
    fn into_response(self) -> Response {
        let status = match &self {
            ServiceError::Validation(_) => StatusCode::BAD_REQUEST,
            ServiceError::Unauthorized(_) => StatusCode::UNAUTHORIZED,
            ServiceError::Forbidden(_) => StatusCode::FORBIDDEN,
            ServiceError::NotFound(_) => StatusCode::NOT_FOUND,
            ServiceError::Conflict(_) => StatusCode::CONFLICT,
            ServiceError::Transient(source) => {
                error!("Store fault: {}", source);
                StatusCode::SERVICE_UNAVAILABLE
            }
            ServiceError::Internal(detail) => {
                error!("Internal error: {}", detail);
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        let body = ErrorResponse {
            ok: false,
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}

pub fn create_router(state: AppState, allowed_origins: &[String]) -> Router {
    let origins: Vec<HeaderValue> = allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!("Ignoring invalid CORS origin {:?}", origin);
                None
            }
        })
        .collect();

    Router::new()
        .route("/appointments/available", get(list_available_slots))
        .route("/appointments/slots", get(list_all_slots).post(create_slot))
        .route("/appointments/book", post(book_slot))
        .route("/appointments/cancel", post(cancel_by_reference))
        .route("/appointments/all", get(list_appointments))
        .route("/appointments/:id", delete(cancel_appointment))
        .route("/auth/register", post(register))
        .route("/auth/login", post(login))
        .route("/auth/me", get(me))
        .route("/auth/logout", post(logout))
        .route("/health", get(health_check))
        .route("/healthz", get(liveness_check))
        .route("/readyz", get(readiness_check))
        .fallback(not_found)
        .with_state(state)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(AllowOrigin::list(origins))
                .allow_methods([
                    Method::GET,
                    Method::POST,
                    Method::PUT,
                    Method::PATCH,
                    Method::DELETE,
                    Method::OPTIONS,
                ])
                .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION])
                .allow_credentials(true),
        )
}

fn slot_query(params: SlotListParams, status: Option<SlotStatus>) -> Result<SlotQuery, ServiceError> {
    let bound = |value: Option<String>| -> Result<Option<chrono::DateTime<chrono::Utc>>, ServiceError> {
        match value.as_deref().map(str::trim).filter(|v| !v.is_empty()) {
            Some(v) => parse_instant(v).map(Some),
            None => Ok(None),
        }
    };
    Ok(SlotQuery {
        range: TimeRange {
            from: bound(params.from)?,
            to: bound(params.to)?,
        },
        status,
        page: PageRequest::new(params.page, params.limit),
    })
}

pub async fn list_available_slots(
    State(state): State<AppState>,
    params: Result<Query<SlotListParams>, QueryRejection>,
) -> ApiResult<Page<Slot>> {
    let Query(params) = params?;
    let query = slot_query(params, Some(SlotStatus::Available))?;
    ok(state.engine.list_slots(query).await?)
}

pub async fn list_all_slots(
    State(state): State<AppState>,
    params: Result<Query<SlotListParams>, QueryRejection>,
) -> ApiResult<Page<Slot>> {
    let Query(params) = params?;
    let query = slot_query(params, None)?;
    ok(state.engine.list_slots(query).await?)
}

pub async fn create_slot(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    JsonBody(request): JsonBody<CreateSlotRequest>,
) -> ApiResult<Slot> {
    let slot = state.engine.create_slot(request).await?;
    info!("Slot {} added by {}", slot.id, admin.username);
    ok(slot)
}

pub async fn book_slot(
    State(state): State<AppState>,
    PatientUser(patient): PatientUser,
    JsonBody(request): JsonBody<BookingRequest>,
) -> ApiResult<BookingResponse> {
    let appointment = state.engine.book_slot(request).await?;
    info!("Appointment {} booked by {}", appointment.id, patient.username);
    ok(BookingResponse {
        message: "Appointment booked successfully".to_string(),
        appointment,
    })
}

pub async fn cancel_by_reference(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CancelRequest>,
) -> ApiResult<MessageResponse> {
    state.engine.cancel_by_reference(request).await?;
    message("Appointment cancelled successfully")
}

pub async fn list_appointments(
    State(state): State<AppState>,
    _admin: AdminUser,
) -> ApiResult<Vec<AppointmentWithSlot>> {
    ok(state.engine.list_appointments().await?)
}

pub async fn cancel_appointment(
    State(state): State<AppState>,
    AdminUser(admin): AdminUser,
    Path(id): Path<String>,
) -> ApiResult<MessageResponse> {
    let id = Uuid::parse_str(&id).map_err(|_| ServiceError::not_found("appointment not found"))?;
    let outcome = state.engine.cancel_by_id(id).await?;
    info!("Cancel of appointment {} requested by {}", id, admin.username);
    message(outcome.message())
}

pub async fn register(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CredentialsRequest>,
) -> ApiResult<MessageResponse> {
    state.auth.register(&request.username, &request.password).await?;
    message("User registered successfully")
}

pub async fn login(
    State(state): State<AppState>,
    JsonBody(request): JsonBody<CredentialsRequest>,
) -> ApiResult<LoginResponse> {
    let session = state.auth.login(&request.username, &request.password).await?;
    ok(LoginResponse {
        message: "Logged in".to_string(),
        user: session.identity,
        token: session.token,
    })
}

pub async fn me(auth: Authenticated) -> ApiResult<UserResponse> {
    ok(UserResponse { user: auth.identity })
}

pub async fn logout(State(state): State<AppState>, auth: Authenticated) -> ApiResult<MessageResponse> {
    state.auth.logout(&auth.token).await?;
    message("Logged out")
}

pub async fn health_check() -> &'static str {
    "OK"
}

pub async fn liveness_check() -> Json<serde_json::Value> {
    Json(json!({ "ok": true }))
}

pub async fn readiness_check(State(state): State<AppState>) -> ApiResult<MessageResponse> {
    state.engine.ready().await?;
    message("ready")
}

pub async fn not_found(method: Method, OriginalUri(uri): OriginalUri) -> Response {
    let body = ErrorResponse {
        ok: false,
        error: format!("Not found: {} {}", method, uri),
    };
    (StatusCode::NOT_FOUND, Json(body)).into_response()
}
