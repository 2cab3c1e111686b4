//! HTTP server binary support for the storefront authentication core.
//!
//! Configuration loading, tracing setup and the server builder live here so
//! integration tests can drive the same router the binary serves.

pub mod config;
pub mod observability;
pub mod server;

pub use config::AppConfig;
pub use server::{ServerBuilder, StorefrontServer, build_app, build_orchestrator, spawn_purge_task};
