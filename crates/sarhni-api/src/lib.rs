pub mod admin;
pub mod auth;
pub mod authz;
pub mod cache;
pub mod confessions;
pub mod error;
pub mod extract;
pub mod middleware;
pub mod profile;
pub mod rate_limit;
pub mod reports;
pub mod state;
pub mod uploads;
pub mod users;

#[cfg(test)]
pub(crate) mod test_support;

use axum::{
    Router,
    routing::{delete, get, patch, post, put},
};
use tokio::time::{MissedTickBehavior, interval};
use tower_http::services::ServeDir;
use tracing::{debug, error};

use crate::error::ApiError;
use crate::state::{AppState, AppStateInner};

/// Run synchronous database work off the async runtime.
pub(crate) async fn blocking<F, T>(state: AppState, f: F) -> Result<T, ApiError>
where
    F: FnOnce(&AppStateInner) -> Result<T, ApiError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(move || f(&state))
        .await
        .map_err(|e| {
            error!("spawn_blocking join error: {}", e);
            ApiError::Internal(anyhow::anyhow!("blocking task failed: {e}"))
        })?
}

/// Every HTTP route, with the session layer applied. Transport layers (CORS,
/// tracing) are added by the binary.
pub fn router(state: AppState) -> Router {
    let api = Router::new()
        .route("/auth/register", post(auth::register))
        .route("/auth/login", post(auth::login))
        .route("/me", get(auth::me))
        .route("/me/image", delete(profile::delete_image))
        .route("/confessions", post(confessions::send))
        .route(
            "/confessions/{id}",
            patch(confessions::edit).delete(confessions::remove),
        )
        .route("/confessions/{id}/reply", put(confessions::reply))
        .route("/confessions/{id}/pin", post(confessions::pin))
        .route("/users/search", get(users::search))
        .route("/users/{id}/confessions", get(confessions::page))
        .route("/users/{id}/profile", patch(profile::update))
        .route("/u/{username}", get(users::profile))
        .route("/reports", post(reports::create))
        .route("/admin/reports", get(reports::list))
        .route("/admin/reports/{id}", patch(reports::update_status))
        .route("/admin/users/{id}", delete(admin::erase))
        .route(
            "/admin/users/{id}/ban",
            post(admin::ban).delete(admin::unban),
        )
        .route("/admin/users/{id}/role", put(admin::set_role))
        .route(
            "/upload",
            post(uploads::upload).layer(uploads::body_limit()),
        )
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            middleware::session,
        ))
        .with_state(state.clone());

    Router::new()
        .route("/health", get(|| async { "ok" }))
        .merge(api)
        .merge(sarhni_gateway::stream::routes(state.dispatcher.clone()))
        .nest_service("/uploads", ServeDir::new(state.storage.dir()))
}

/// Periodically drop expired rate-limit windows and cached pages. Runs until
/// the task is aborted.
pub async fn run_sweepers(state: AppState) {
    let mut limiters = interval(rate_limit::SWEEP_INTERVAL);
    let mut pages = interval(cache::SWEEP_INTERVAL);
    limiters.set_missed_tick_behavior(MissedTickBehavior::Delay);
    pages.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = limiters.tick() => {
                let dropped = state.send_limiter.sweep() + state.search_limiter.sweep();
                if dropped > 0 {
                    debug!("Swept {} expired rate-limit windows", dropped);
                }
            }
            _ = pages.tick() => {
                let dropped = state.cache.sweep();
                if dropped > 0 {
                    debug!("Swept {} expired cached pages", dropped);
                }
            }
        }
    }
}
