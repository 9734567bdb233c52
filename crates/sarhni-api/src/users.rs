use axum::extract::State;
use tracing::debug;

use sarhni_types::api::{PublicProfile, SearchQuery};
use sarhni_types::models::UserSummary;

use crate::blocking;
use crate::cache::{profile_path, user_tag};
use crate::confessions::{PAGE_SIZE, fetch_page};
use crate::error::ApiError;
use crate::extract::{Json, Path, Query};
use crate::middleware::ClientIp;
use crate::state::{AppState, AppStateInner};

pub const SEARCH_LIMIT: u32 = 10;

/// `GET /u/{username}`
pub async fn profile(
    State(state): State<AppState>,
    Path(username): Path<String>,
) -> Result<Json<PublicProfile>, ApiError> {
    let profile = blocking(state, move |s| public_profile(s, &username)).await?;
    Ok(Json(profile))
}

/// `GET /users/search?q=`
pub async fn search(
    State(state): State<AppState>,
    client: ClientIp,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<UserSummary>>, ApiError> {
    let users = blocking(state, move |s| search_users(s, &client, &query.q)).await?;
    Ok(Json(users))
}

/// Profile plus the first page of confessions, served from the page cache
/// while fresh.
pub fn public_profile(state: &AppStateInner, username: &str) -> Result<PublicProfile, ApiError> {
    let username = username.trim().to_lowercase();
    let path = profile_path(&username);
    if let Some(cached) = state.cache.get::<PublicProfile>(&path) {
        return Ok(cached);
    }

    let user = state
        .db
        .get_user_by_username(&username)?
        .filter(|user| !user.is_banned)
        .ok_or(ApiError::NotFound("User"))?;
    let confessions = fetch_page(state, user.id, 0, PAGE_SIZE)?;
    let profile = PublicProfile {
        user: user.into_public(),
        confessions,
    };

    state
        .cache
        .insert(&path, &[user_tag(profile.user.id)], &profile);
    debug!("Cached profile page {}", path);
    Ok(profile)
}

/// Username prefix search over non-banned accounts.
pub fn search_users(
    state: &AppStateInner,
    client: &ClientIp,
    query: &str,
) -> Result<Vec<UserSummary>, ApiError> {
    if let Some(key) = client.limiter_key() {
        let decision = state.search_limiter.check(&key);
        if !decision.success {
            return Err(ApiError::RateLimited {
                retry_after: decision.retry_after(),
            });
        }
    }

    let prefix = query.trim().to_lowercase();
    if prefix.is_empty() {
        return Ok(Vec::new());
    }
    Ok(state.db.search_users(&prefix, SEARCH_LIMIT)?)
}
