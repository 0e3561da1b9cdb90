//! HTTP surface: the device endpoints, approver login, and the public key set.
use crate::device_auth::{
    ApprovalAction, DeviceAuthError, DeviceAuthService, InfoOutcome, PollOutcome, Provenance,
};
use crate::jwks::JwksManager;
use crate::session::SessionCookie;
use crate::settings::Settings;
use crate::storage;
use axum::body::Body;
use axum::extract::rejection::JsonRejection;
use axum::extract::{ConnectInfo, FromRequestParts, Query, State};
use axum::http::request::Parts;
use axum::http::{header, HeaderMap, HeaderName, HeaderValue, Request, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::DateTime;
use miette::IntoDiagnostic;
use sea_orm::DatabaseConnection;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub db: DatabaseConnection,
    pub jwks: JwksManager,
    pub device_auth: DeviceAuthService,
}

// Security headers middleware
async fn security_headers(request: Request<Body>, next: Next) -> impl IntoResponse {
    let mut response = next.run(request).await;
    let headers = response.headers_mut();

    headers.insert(
        HeaderName::from_static("x-frame-options"),
        HeaderValue::from_static("DENY"),
    );
    headers.insert(
        HeaderName::from_static("x-content-type-options"),
        HeaderValue::from_static("nosniff"),
    );
    headers.insert(
        HeaderName::from_static("content-security-policy"),
        HeaderValue::from_static("default-src 'none'; frame-ancestors 'none'"),
    );
    headers.insert(
        HeaderName::from_static("referrer-policy"),
        HeaderValue::from_static("no-referrer"),
    );

    response
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/.well-known/jwks.json", get(jwks_handler))
        .route("/api/login", post(login))
        .route("/api/logout", post(logout))
        .route("/api/device/start", post(device_start))
        .route("/api/device/poll", get(device_poll))
        .route("/api/device/info", get(device_info))
        .route("/api/device/grant", post(device_grant))
        .layer(middleware::from_fn(security_headers))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn serve(state: AppState) -> miette::Result<()> {
    let addr: SocketAddr = format!(
        "{}:{}",
        state.settings.server.host, state.settings.server.port
    )
    .parse()
    .map_err(|e| miette::miette!("bad listen addr: {e}"))?;

    let app = router(state);

    // NOTE: rate limiting of /api/device/info and /api/login belongs in the reverse proxy
    tracing::info!(%addr, "Public API listening");
    let listener = tokio::net::TcpListener::bind(addr).await.into_diagnostic()?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .into_diagnostic()?;
    Ok(())
}

fn json_with_headers(status: StatusCode, value: Value, headers: &[(&str, String)]) -> Response {
    let mut resp = (status, Json(value)).into_response();
    let h = resp.headers_mut();
    for (name, val) in headers {
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(val),
        ) {
            h.insert(n, v);
        }
    }
    resp
}

fn no_store<T: Serialize>(body: &T) -> Response {
    let value = serde_json::to_value(body).unwrap_or(Value::Null);
    json_with_headers(
        StatusCode::OK,
        value,
        &[("cache-control", "no-store".to_string())],
    )
}

fn rfc3339(unix: i64) -> String {
    DateTime::from_timestamp(unix, 0)
        .map(|t| t.to_rfc3339())
        .unwrap_or_default()
}

/// First `x-forwarded-for` hop, else the peer address, else `unknown`.
fn client_ip(headers: &HeaderMap, peer: Option<SocketAddr>) -> String {
    first_header_value(headers, "x-forwarded-for")
        .or_else(|| peer.map(|addr| addr.ip().to_string()))
        .unwrap_or_else(|| "unknown".to_string())
}

fn first_header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|h| h.to_str().ok())
        .and_then(|s| s.split(',').next())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(String::from)
}

/// Origin the client addressed, from `x-forwarded-host`/`x-forwarded-proto`
/// or `Host`. Hosts with characters outside a hostname and port are ignored.
fn request_base_url(headers: &HeaderMap) -> Option<String> {
    let host = first_header_value(headers, "x-forwarded-host")
        .or_else(|| first_header_value(headers, header::HOST.as_str()))?;
    let host_ok = host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '-' | ':' | '[' | ']'));
    if !host_ok {
        return None;
    }

    let scheme = match first_header_value(headers, "x-forwarded-proto").as_deref() {
        Some("https") => "https",
        _ => "http",
    };
    Some(format!("{scheme}://{host}"))
}

/// JSON body or an `invalid_input` error in the usual error shape.
fn json_body<T>(body: Result<Json<T>, JsonRejection>) -> Result<T, DeviceAuthError> {
    body.map(|Json(value)| value)
        .map_err(|rejection| DeviceAuthError::InvalidInput(rejection.body_text()))
}

fn user_agent(headers: &HeaderMap) -> Option<String> {
    headers
        .get(header::USER_AGENT)
        .and_then(|h| h.to_str().ok())
        .map(String::from)
}

/// Provenance of the calling device, taken from headers and the peer address.
struct RequestProvenance(Provenance);

impl<S: Send + Sync> FromRequestParts<S> for RequestProvenance {
    type Rejection = Infallible;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let peer = parts
            .extensions
            .get::<ConnectInfo<SocketAddr>>()
            .map(|ConnectInfo(addr)| *addr);

        Ok(Self(Provenance {
            client_ip: client_ip(&parts.headers, peer),
            user_agent: user_agent(&parts.headers).unwrap_or_else(|| "unknown".to_string()),
        }))
    }
}

/// Subject of the signed-in approver, from the session cookie.
async fn approver_subject(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<String, DeviceAuthError> {
    let cookie = SessionCookie::from_headers(headers).ok_or(DeviceAuthError::Unauthenticated)?;
    let session = storage::get_session(&state.db, &cookie.session_id)
        .await
        .map_err(|e| {
            tracing::error!(error = %e, "Failed to load approver session");
            DeviceAuthError::Internal(e.to_string())
        })?
        .ok_or(DeviceAuthError::Unauthenticated)?;
    Ok(session.subject)
}

async fn healthz() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn jwks_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.jwks.jwks_json())
}

// ---------------------------------------------------------------------------
// Device endpoints
// ---------------------------------------------------------------------------

async fn device_start(
    State(state): State<AppState>,
    headers: HeaderMap,
    RequestProvenance(provenance): RequestProvenance,
) -> Result<Response, DeviceAuthError> {
    // Without a configured public URL the QR code points back at whatever
    // origin the device used, never the bind address
    let start = match (&state.settings.server.public_base_url, request_base_url(&headers)) {
        (None, Some(base)) => state.device_auth.start_for_base(provenance, &base).await?,
        _ => state.device_auth.start(provenance).await?,
    };
    Ok(no_store(&start))
}

#[derive(Debug, Deserialize)]
struct PollQuery {
    #[serde(default)]
    device_code: String,
}

#[derive(Debug, Default, Serialize)]
struct PollResponse {
    status: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    token: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    is_admin: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secondary_salt: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    secondary_token: Option<String>,
}

impl From<PollOutcome> for PollResponse {
    fn from(outcome: PollOutcome) -> Self {
        let status = outcome.status();
        match outcome {
            PollOutcome::Granted(granted) => {
                let (secondary_salt, secondary_token) = match granted.credentials.secondary {
                    Some(s) => (Some(s.salt), Some(s.token)),
                    None => (None, None),
                };
                PollResponse {
                    status,
                    token: Some(granted.credentials.token),
                    id: Some(granted.identity.id),
                    name: granted.identity.name,
                    username: Some(granted.identity.username),
                    is_admin: Some(granted.identity.is_admin),
                    secondary_salt,
                    secondary_token,
                }
            }
            _ => PollResponse {
                status,
                ..Default::default()
            },
        }
    }
}

async fn device_poll(
    State(state): State<AppState>,
    Query(q): Query<PollQuery>,
) -> Result<Response, DeviceAuthError> {
    let outcome = state.device_auth.poll(&q.device_code).await?;
    Ok(no_store(&PollResponse::from(outcome)))
}

#[derive(Debug, Deserialize)]
struct InfoQuery {
    #[serde(default)]
    code: String,
}

#[derive(Debug, Default, Serialize)]
struct InfoResponse {
    valid: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    reason: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    message: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_code: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    client_ip: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    user_agent: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    created_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    expires_at: Option<String>,
}

impl From<InfoOutcome> for InfoResponse {
    fn from(outcome: InfoOutcome) -> Self {
        match outcome {
            InfoOutcome::Valid(info) => InfoResponse {
                valid: true,
                user_code: Some(info.user_code),
                client_ip: Some(info.client_ip),
                user_agent: Some(info.user_agent),
                created_at: Some(rfc3339(info.created_at)),
                expires_at: Some(rfc3339(info.expires_at)),
                ..Default::default()
            },
            InfoOutcome::Invalid(reason) => InfoResponse {
                valid: false,
                reason: Some(reason.as_str()),
                message: Some(reason.message()),
                ..Default::default()
            },
        }
    }
}

async fn device_info(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(q): Query<InfoQuery>,
) -> Result<Response, DeviceAuthError> {
    approver_subject(&state, &headers).await?;
    let outcome = state.device_auth.info(&q.code).await?;
    Ok(no_store(&InfoResponse::from(outcome)))
}

#[derive(Debug, Deserialize)]
struct GrantRequest {
    #[serde(default)]
    user_code: String,
    #[serde(default)]
    action: String,
}

async fn device_grant(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Result<Json<GrantRequest>, JsonRejection>,
) -> Result<Response, DeviceAuthError> {
    let approver = approver_subject(&state, &headers).await?;
    let req = json_body(body)?;
    let action: ApprovalAction = req.action.parse()?;

    state
        .device_auth
        .grant_or_deny(&req.user_code, &approver, action)
        .await?;
    Ok(no_store(&json!({ "status": "ok" })))
}

// ---------------------------------------------------------------------------
// Approver sessions
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct LoginRequest {
    username: String,
    password: String,
}

async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    RequestProvenance(provenance): RequestProvenance,
    body: Result<Json<LoginRequest>, JsonRejection>,
) -> Response {
    let req = match json_body(body) {
        Ok(req) => req,
        Err(e) => return e.into_response(),
    };
    let verified = storage::verify_user_password(&state.db, &req.username, &req.password).await;
    let subject = match verified {
        Ok(Some(sub)) => sub,
        Ok(None) => {
            tracing::debug!(username = %req.username, "Login rejected");
            return json_with_headers(
                StatusCode::UNAUTHORIZED,
                json!({
                    "error": "invalid_credentials",
                    "error_description": "Invalid username or password"
                }),
                &[],
            );
        }
        Err(e) => {
            tracing::error!(error = %e, "Login failed");
            return server_error();
        }
    };

    let user = match storage::get_user_by_subject(&state.db, &subject).await {
        Ok(Some(u)) => u,
        Ok(None) => return server_error(),
        Err(e) => {
            tracing::error!(error = %e, "Failed to load user after login");
            return server_error();
        }
    };

    let now = chrono::Utc::now().timestamp();
    let session = match storage::create_session(
        &state.db,
        &subject,
        now,
        state.settings.sessions.ttl_secs,
        user_agent(&headers),
        Some(provenance.client_ip),
    )
    .await
    {
        Ok(s) => s,
        Err(e) => {
            tracing::error!(error = %e, "Failed to create session");
            return server_error();
        }
    };

    tracing::info!(user = %user.username, "Approver signed in");
    let cookie = SessionCookie::new(session.session_id);
    json_with_headers(
        StatusCode::OK,
        json!({
            "id": user.subject,
            "username": user.username,
            "name": user.name,
            "is_admin": user.is_admin == 1,
        }),
        &[
            ("set-cookie", cookie.to_cookie_header(&state.settings)),
            ("cache-control", "no-store".to_string()),
        ],
    )
}

async fn logout(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if let Some(cookie) = SessionCookie::from_headers(&headers) {
        if let Err(e) = storage::delete_session(&state.db, &cookie.session_id).await {
            tracing::warn!(error = %e, "Failed to delete session on logout");
        }
    }

    json_with_headers(
        StatusCode::OK,
        json!({ "status": "ok" }),
        &[("set-cookie", SessionCookie::delete_cookie_header())],
    )
}

fn server_error() -> Response {
    json_with_headers(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({
            "error": "internal",
            "error_description": "Internal server error"
        }),
        &[],
    )
}
