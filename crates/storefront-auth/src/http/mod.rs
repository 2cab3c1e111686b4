//! HTTP surface.
//!
//! [`router`] mounts every endpoint on one `axum::Router`. The server crate
//! adds tracing and serves it.

pub mod error;
pub mod extract;
pub mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};

use crate::session::SessionOrchestrator;

pub use error::ErrorBody;
pub use extract::{BearerAuth, JsonBody};
pub use handlers::{
    LoginRequest, MeResponse, RefreshRequest, RegisterRequest, RegisterResponse, ResendRequest,
    TokenResponse, VerifyResponse,
};

/// Shared handler state.
#[derive(Clone)]
pub struct AuthState {
    /// The session orchestrator.
    pub orchestrator: Arc<SessionOrchestrator>,
}

impl AuthState {
    /// Creates handler state.
    pub fn new(orchestrator: Arc<SessionOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

/// Builds the router.
pub fn router(state: AuthState) -> Router {
    Router::new()
        .route("/register", post(handlers::register_handler))
        .route("/verify", get(handlers::verify_handler))
        .route(
            "/resend-verification",
            post(handlers::resend_verification_handler),
        )
        .route("/login", post(handlers::login_handler))
        .route("/refresh", post(handlers::refresh_handler))
        .route("/logout", post(handlers::logout_handler))
        .route("/me", get(handlers::me_handler))
        .route("/.well-known/jwks.json", get(handlers::jwks_handler))
        .route("/healthz", get(handlers::health_handler))
        .with_state(state)
}
