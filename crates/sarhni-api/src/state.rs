use std::sync::Arc;

use axum::http::HeaderName;

use sarhni_db::Database;
use sarhni_gateway::Dispatcher;
use sarhni_media::Storage;

use crate::cache::PageCache;
use crate::rate_limit::RateLimiter;

pub type AppState = Arc<AppStateInner>;

/// Everything a request handler may touch. Built once at startup and shared;
/// the limiters, cache and dispatcher are process-local.
pub struct AppStateInner {
    pub db: Database,
    pub jwt_secret: String,
    pub dispatcher: Dispatcher,
    pub storage: Storage,
    pub cache: PageCache,
    pub send_limiter: RateLimiter,
    pub search_limiter: RateLimiter,
    /// Header set by our own reverse proxy with the real client address.
    pub trusted_ip_header: HeaderName,
}
