//! Master control API.
//!
//! # Data Flow
//! ```text
//! gateway-ctl / curl
//!     → bearer auth (auth.rs)
//!     → handlers.rs
//!         GET  /admin/status, /admin/workers  → SupervisorHandle::snapshot
//!         POST /admin/reload, /admin/stop     → SupervisorHandle command
//! ```
//!
//! # Design Decisions
//! - Served by the master only; workers never expose it
//! - An empty `apiKey` disables authentication

pub mod auth;
pub mod handlers;

use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tokio::net::TcpListener;

use self::auth::admin_auth_middleware;
use self::handlers::*;
use crate::config::AdminConfig;
use crate::error::GatewayError;
use crate::lifecycle::Shutdown;
use crate::supervisor::SupervisorHandle;

#[derive(Clone)]
pub struct AdminState {
    pub handle: SupervisorHandle,
    pub api_key: String,
}

pub fn setup_admin_router(state: AdminState) -> Router {
    Router::new()
        .route("/admin/status", get(get_status))
        .route("/admin/workers", get(get_workers))
        .route("/admin/reload", post(post_reload))
        .route("/admin/stop", post(post_stop))
        .layer(middleware::from_fn_with_state(state.clone(), admin_auth_middleware))
        .with_state(state)
}

/// Serve the admin API until `shutdown` fires.
pub async fn serve_admin(
    config: &AdminConfig,
    handle: SupervisorHandle,
    shutdown: Shutdown,
) -> Result<(), GatewayError> {
    let listener = TcpListener::bind(&config.bind_address)
        .await
        .map_err(|source| GatewayError::Bind {
            addr: config.bind_address.clone(),
            source,
        })?;
    tracing::info!(address = %config.bind_address, "Admin API listening");

    let router = setup_admin_router(AdminState {
        handle,
        api_key: config.api_key.clone(),
    });
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown.wait())
        .await?;
    Ok(())
}
