//! HTTP mapping for [`AuthError`].
//!
//! Token and credential failures become 401 with a `WWW-Authenticate`
//! challenge. Storage outages become 503 with `Retry-After` so clients back
//! off instead of retrying immediately.

use axum::{
    Json,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::{Deserialize, Serialize};

use crate::error::AuthError;

/// Realm named in `WWW-Authenticate` challenges.
pub const REALM: &str = "storefront";

/// Seconds a client should wait after a 503.
pub const RETRY_AFTER_SECS: u64 = 1;

/// JSON error body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorBody {
    /// Machine-readable code.
    pub error: String,
    /// Human-readable description.
    pub error_description: String,
}

impl IntoResponse for AuthError {
    fn into_response(self) -> Response {
        let status = status_for(&self);
        let description = public_description(&self);
        let code = self.error_code();

        let mut headers = HeaderMap::new();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = build_www_authenticate_header(code, &description);
            if let Ok(value) = HeaderValue::from_str(&challenge) {
                headers.insert(header::WWW_AUTHENTICATE, value);
            }
        }
        if status == StatusCode::SERVICE_UNAVAILABLE {
            headers.insert(header::RETRY_AFTER, HeaderValue::from(RETRY_AFTER_SECS));
        }
        if status.is_server_error() {
            tracing::error!(
                status = status.as_u16(),
                category = %self.category(),
                error = %self,
                "Request failed"
            );
        }

        let body = ErrorBody {
            error: code.to_string(),
            error_description: description,
        };
        (status, headers, Json(body)).into_response()
    }
}

/// Status code for an error.
#[must_use]
pub fn status_for(error: &AuthError) -> StatusCode {
    match error {
        AuthError::InvalidCredentials
        | AuthError::UnknownSubject { .. }
        | AuthError::Malformed { .. }
        | AuthError::Expired
        | AuthError::SignatureInvalid
        | AuthError::Revoked
        | AuthError::UnknownKeyVersion { .. } => StatusCode::UNAUTHORIZED,
        AuthError::AccountNotVerified => StatusCode::FORBIDDEN,
        AuthError::DuplicateSubject { .. } | AuthError::AlreadyVerified { .. } => {
            StatusCode::CONFLICT
        }
        AuthError::InvalidRequest { .. } | AuthError::InvalidVerificationToken { .. } => {
            StatusCode::BAD_REQUEST
        }
        AuthError::Transient { .. } => StatusCode::SERVICE_UNAVAILABLE,
        AuthError::Integrity { .. }
        | AuthError::Configuration { .. }
        | AuthError::Internal { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Description safe to show a client. Server-side details stay in the log.
fn public_description(error: &AuthError) -> String {
    match error {
        AuthError::UnknownSubject { .. } => AuthError::InvalidCredentials.to_string(),
        AuthError::AlreadyVerified { .. } => "Account already verified".to_string(),
        AuthError::Transient { .. } => "Service temporarily unavailable".to_string(),
        AuthError::Integrity { .. }
        | AuthError::Configuration { .. }
        | AuthError::Internal { .. } => "Internal server error".to_string(),
        other => other.to_string(),
    }
}

/// Format: `Bearer realm="storefront", error="token_expired", error_description="..."`
fn build_www_authenticate_header(error: &str, description: &str) -> String {
    let escaped = description.replace('"', "\\\"");
    format!("Bearer realm=\"{REALM}\", error=\"{error}\", error_description=\"{escaped}\"")
}
