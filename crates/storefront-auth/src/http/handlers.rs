//! Endpoint handlers.
//!
//! ```text
//! POST /register               {subject, password}            -> 201 | 400 | 409
//! GET  /verify?token=...                                      -> 200 | 400 | 409
//! POST /resend-verification    {subject}                      -> 202 | 409
//! POST /login                  {subject, password, device?}   -> 200 | 401 | 403
//! POST /refresh                {refresh_token}                -> 200 | 401
//! POST /logout                 {refresh_token}                -> 204
//! GET  /me                     Authorization: Bearer <access> -> 200 | 401
//! GET  /.well-known/jwks.json                                 -> 200
//! GET  /healthz                                               -> 200
//! ```

use axum::{
    Json,
    body::Bytes,
    extract::{Query, State, rejection::QueryRejection},
    http::{HeaderName, StatusCode, header},
    response::IntoResponse,
};
use serde::{Deserialize, Serialize};

use crate::AuthResult;
use crate::credential::Role;
use crate::error::AuthError;
use crate::token::{Claims, TokenPair};

use super::AuthState;
use super::extract::{BearerAuth, JsonBody};

// =============================================================================
// Request / Response Types
// =============================================================================

/// Body of `POST /register`.
#[derive(Debug, Deserialize)]
pub struct RegisterRequest {
    /// Login name.
    pub subject: String,
    /// Plain-text password.
    pub password: String,
}

/// Body of `POST /login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    /// Login name.
    pub subject: String,
    /// Plain-text password.
    pub password: String,
    /// Optional device context.
    #[serde(default)]
    pub device: Option<String>,
}

/// Query of `GET /verify`.
#[derive(Debug, Deserialize)]
pub struct VerifyQuery {
    /// The verification token.
    pub token: String,
}

/// Body of `POST /resend-verification`.
#[derive(Debug, Deserialize)]
pub struct ResendRequest {
    /// Login name of the pending account.
    pub subject: String,
}

/// Body of `POST /refresh` and `POST /logout`.
#[derive(Debug, Deserialize)]
pub struct RefreshRequest {
    /// The refresh token.
    pub refresh_token: String,
}

/// Successful login or refresh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenResponse {
    /// Access token.
    pub access_token: String,
    /// Refresh token.
    pub refresh_token: String,
    /// Always `Bearer`.
    pub token_type: String,
    /// Access token lifetime in seconds.
    pub expires_in: i64,
}

impl TokenResponse {
    fn new(pair: TokenPair, expires_in: i64) -> Self {
        Self {
            access_token: pair.access.value,
            refresh_token: pair.refresh.value,
            token_type: "Bearer".to_string(),
            expires_in,
        }
    }
}

/// Body of a successful registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    /// The registered subject.
    pub subject: String,
    /// Assigned role.
    pub role: Role,
    /// `false` while the account awaits verification.
    pub verified: bool,
}

/// Body of a successful verification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerifyResponse {
    /// The verified subject.
    pub subject: String,
    /// Always `true`.
    pub verified: bool,
}

/// Body of `GET /me`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeResponse {
    /// Authenticated subject.
    pub subject: String,
    /// Role claim, if present.
    pub role: Option<String>,
    /// Session id.
    pub session_id: Option<String>,
    /// Access token expiry (Unix timestamp).
    pub expires_at: i64,
}

impl From<Claims> for MeResponse {
    fn from(claims: Claims) -> Self {
        Self {
            role: claims.role().map(str::to_string),
            subject: claims.sub,
            session_id: claims.sid,
            expires_at: claims.exp,
        }
    }
}

// =============================================================================
// Handlers
// =============================================================================

/// `POST /register`
pub async fn register_handler(
    State(state): State<AuthState>,
    JsonBody(request): JsonBody<RegisterRequest>,
) -> AuthResult<impl IntoResponse> {
    let credential = state
        .orchestrator
        .register(&request.subject, &request.password)
        .await?;
    Ok((
        StatusCode::CREATED,
        Json(RegisterResponse {
            verified: credential.is_verified(),
            subject: credential.subject,
            role: credential.role,
        }),
    ))
}

/// `GET /verify?token=...`
pub async fn verify_handler(
    State(state): State<AuthState>,
    query: Result<Query<VerifyQuery>, QueryRejection>,
) -> AuthResult<Json<VerifyResponse>> {
    let Query(query) = query.map_err(|e| AuthError::invalid_request(e.body_text()))?;
    let credential = state.orchestrator.verify_account(&query.token).await?;
    Ok(Json(VerifyResponse {
        subject: credential.subject,
        verified: true,
    }))
}

/// `POST /resend-verification`. An unknown or closed account gets the same
/// 202 as a pending one.
pub async fn resend_verification_handler(
    State(state): State<AuthState>,
    JsonBody(request): JsonBody<ResendRequest>,
) -> AuthResult<StatusCode> {
    match state.orchestrator.resend_verification(&request.subject).await {
        Ok(_) => Ok(StatusCode::ACCEPTED),
        Err(AuthError::UnknownSubject { .. }) => {
            tracing::debug!("Verification resend for unknown subject");
            Ok(StatusCode::ACCEPTED)
        }
        Err(err) => Err(err),
    }
}

/// `POST /login`
pub async fn login_handler(
    State(state): State<AuthState>,
    JsonBody(request): JsonBody<LoginRequest>,
) -> AuthResult<impl IntoResponse> {
    let pair = state
        .orchestrator
        .login(&request.subject, &request.password, request.device)
        .await?;
    Ok(token_response(&state, pair))
}

/// `POST /refresh`
pub async fn refresh_handler(
    State(state): State<AuthState>,
    JsonBody(request): JsonBody<RefreshRequest>,
) -> AuthResult<impl IntoResponse> {
    let pair = state.orchestrator.refresh(&request.refresh_token).await?;
    Ok(token_response(&state, pair))
}

/// `POST /logout`. Answers 204 whatever the body holds.
pub async fn logout_handler(State(state): State<AuthState>, body: Bytes) -> StatusCode {
    match serde_json::from_slice::<RefreshRequest>(&body) {
        Ok(request) => state.orchestrator.logout(&request.refresh_token).await,
        Err(e) => tracing::debug!(error = %e, "Logout with unreadable body"),
    }
    StatusCode::NO_CONTENT
}

/// `GET /me`
pub async fn me_handler(auth: BearerAuth) -> Json<MeResponse> {
    Json(MeResponse::from(auth.claims))
}

/// `GET /.well-known/jwks.json`
pub async fn jwks_handler(State(state): State<AuthState>) -> impl IntoResponse {
    (
        [(header::CACHE_CONTROL, "public, max-age=300")],
        Json(state.orchestrator.jwks()),
    )
}

/// `GET /healthz`
pub async fn health_handler() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

fn token_response(
    state: &AuthState,
    pair: TokenPair,
) -> ([(HeaderName, &'static str); 1], Json<TokenResponse>) {
    let body = TokenResponse::new(pair, state.orchestrator.access_token_lifetime());
    ([(header::CACHE_CONTROL, "no-store")], Json(body))
}
