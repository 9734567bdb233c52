use axum::extract::State;
use tracing::info;
use uuid::Uuid;

use sarhni_db::models::OwnerGuarded;
use sarhni_types::api::{SetRoleRequest, Success};
use sarhni_types::models::Role;

use crate::authz;
use crate::blocking;
use crate::cache::user_tag;
use crate::error::ApiError;
use crate::extract::{Json, Path};
use crate::middleware::Session;
use crate::profile::remove_image_blob;
use crate::state::{AppState, AppStateInner};

const LAST_OWNER: &str = "Cannot remove the last owner";

pub async fn ban(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| set_banned(s, &session, id, true)).await?;
    Ok(Json(Success::ok()))
}

pub async fn unban(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| set_banned(s, &session, id, false)).await?;
    Ok(Json(Success::ok()))
}

pub async fn set_role(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(req): Json<SetRoleRequest>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| change_role(s, &session, id, req.role)).await?;
    Ok(Json(Success::ok()))
}

pub async fn erase(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<Success>, ApiError> {
    let image = blocking(state.clone(), move |s| erase_user(s, &session, id)).await?;
    if let Some(url) = image {
        remove_image_blob(&state, &url).await;
    }
    Ok(Json(Success::ok()))
}

pub fn set_banned(
    state: &AppStateInner,
    session: &Session,
    target: Uuid,
    banned: bool,
) -> Result<(), ApiError> {
    let moderator = authz::require_role(&state.db, session, Role::Admin)?;
    if banned && moderator.id == target {
        return Err(ApiError::validation("You cannot ban yourself"));
    }
    authz::can_act_on_user(&state.db, &moderator, target)?.into_result()?;

    if !state.db.set_banned(target, banned)? {
        return Err(ApiError::NotFound("User"));
    }
    state.cache.invalidate_tag(&user_tag(target));
    info!(
        "{} {} user {}",
        moderator.username,
        if banned { "banned" } else { "unbanned" },
        target
    );
    Ok(())
}

/// Promote or demote. Nobody grants a role above their own, and the last
/// OWNER keeps the role.
pub fn change_role(
    state: &AppStateInner,
    session: &Session,
    target: Uuid,
    role: Role,
) -> Result<(), ApiError> {
    let moderator = authz::require_role(&state.db, session, Role::Admin)?;
    if role > moderator.role {
        return Err(ApiError::forbidden("You cannot grant a role above your own"));
    }
    authz::can_act_on_user(&state.db, &moderator, target)?.into_result()?;
    if role != Role::Owner && !authz::can_demote_last_owner(&state.db, target)?.is_allowed() {
        return Err(ApiError::rule(LAST_OWNER));
    }

    let previous = match state.db.change_role(target, role)? {
        OwnerGuarded::Done(previous) => previous,
        OwnerGuarded::LastOwner => return Err(ApiError::rule(LAST_OWNER)),
        OwnerGuarded::Missing => return Err(ApiError::NotFound("User")),
    };
    state.cache.invalidate_tag(&user_tag(target));
    info!(
        "{} changed role of {} from {} to {}",
        moderator.username, target, previous, role
    );
    Ok(())
}

/// Hard-delete an account. Returns the erased account's image URL so the
/// caller can drop the blob.
pub fn erase_user(
    state: &AppStateInner,
    session: &Session,
    target: Uuid,
) -> Result<Option<String>, ApiError> {
    let moderator = authz::require_role(&state.db, session, Role::Admin)?;
    authz::can_act_on_user(&state.db, &moderator, target)?.into_result()?;
    if !authz::can_demote_last_owner(&state.db, target)?.is_allowed() {
        return Err(ApiError::rule(LAST_OWNER));
    }

    let image = match state.db.erase_user(target)? {
        OwnerGuarded::Done(image) => image,
        OwnerGuarded::LastOwner => return Err(ApiError::rule(LAST_OWNER)),
        OwnerGuarded::Missing => return Err(ApiError::NotFound("User")),
    };
    state.cache.invalidate_tag(&user_tag(target));
    info!("{} erased user {}", moderator.username, target);
    Ok(image)
}
