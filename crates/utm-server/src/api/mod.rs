//! API routes for the UTM server.

pub mod auth;
pub mod request_id;
mod routes;

use axum::Router;
use std::sync::Arc;
use std::time::Duration;

use crate::config::Config;
use crate::state::AppState;

use self::auth::{AdminToken, RateLimiter};

pub fn routes(config: &Config) -> Router<Arc<AppState>> {
    let admin_token = AdminToken(Arc::new(config.admin_token.clone()));
    let rate_limiter = RateLimiter::new(
        config.rate_limit_rps,
        config.rate_limit_enabled,
        false,
        10_000,
        Duration::from_secs(300),
    );
    routes::create_router(admin_token, rate_limiter)
}
