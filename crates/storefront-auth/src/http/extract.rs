//! Request extractors.

use axum::{
    Json,
    extract::{FromRequest, FromRequestParts, Request, rejection::JsonRejection},
    http::{header::AUTHORIZATION, request::Parts},
};
use serde::de::DeserializeOwned;

use crate::error::AuthError;
use crate::token::Claims;

use super::AuthState;

/// Caller authenticated by a bearer access token.
#[derive(Debug, Clone)]
pub struct BearerAuth {
    /// Verified claims of the access token.
    pub claims: Claims,
}

impl FromRequestParts<AuthState> for BearerAuth {
    type Rejection = AuthError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &AuthState,
    ) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or_else(|| AuthError::malformed("missing bearer token"))?;
        let token = parse_bearer(header)?;
        let claims = state.orchestrator.authenticate(token).await?;
        tracing::debug!(
            subject = %claims.sub,
            path = %parts.uri.path(),
            "Bearer authenticated"
        );
        Ok(Self { claims })
    }
}

fn parse_bearer(header: &str) -> Result<&str, AuthError> {
    let (scheme, token) = header
        .split_once(' ')
        .ok_or_else(|| AuthError::malformed("expected 'Bearer <token>'"))?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return Err(AuthError::malformed("expected 'Bearer <token>'"));
    }
    let token = token.trim();
    if token.is_empty() {
        return Err(AuthError::malformed("empty bearer token"));
    }
    Ok(token)
}

/// JSON body whose rejections are reported as [`AuthError::InvalidRequest`].
#[derive(Debug, Clone)]
pub struct JsonBody<T>(pub T);

impl<T, S> FromRequest<S> for JsonBody<T>
where
    T: DeserializeOwned,
    S: Send + Sync,
{
    type Rejection = AuthError;

    async fn from_request(req: Request, state: &S) -> Result<Self, Self::Rejection> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(invalid_body(&rejection)),
        }
    }
}

fn invalid_body(rejection: &JsonRejection) -> AuthError {
    AuthError::invalid_request(rejection.body_text())
}
