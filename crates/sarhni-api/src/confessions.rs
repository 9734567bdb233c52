use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info, warn};
use uuid::Uuid;

use sarhni_db::models::{NewConfession, PinToggle};
use sarhni_types::api::{
    EditConfessionRequest, PageQuery, PinResponse, ReplyRequest, SendConfessionRequest, Success,
};
use sarhni_types::models::Confession;

use crate::authz::{self, AuthUser};
use crate::blocking;
use crate::cache::user_tag;
use crate::error::ApiError;
use crate::extract::{Json, Path, Query};
use crate::middleware::{ClientIp, Session};
use crate::state::{AppState, AppStateInner};

pub const MAX_CONTENT_CHARS: usize = 500;
pub const PAGE_SIZE: u32 = 12;
pub const MAX_PAGE_SIZE: u32 = 50;
pub const MAX_PINNED: u32 = 3;
pub const EDIT_WINDOW_SECS: i64 = 300;

// -- Handlers --

pub async fn send(
    State(state): State<AppState>,
    session: Session,
    client: ClientIp,
    Json(req): Json<SendConfessionRequest>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(state, move |s| send_confession(s, &session, &client, &req)).await?;
    Ok((StatusCode::CREATED, Json(Success::ok())))
}

/// Infinite-scroll page. A failed lookup yields an empty page so clients stop
/// paginating instead of retrying in a loop.
pub async fn page(
    State(state): State<AppState>,
    Path(receiver_id): Path<Uuid>,
    Query(query): Query<PageQuery>,
) -> Json<Vec<Confession>> {
    let limit = query.limit.unwrap_or(PAGE_SIZE).clamp(1, MAX_PAGE_SIZE);
    let offset = query.offset;
    match blocking(state, move |s| fetch_page(s, receiver_id, offset, limit)).await {
        Ok(confessions) => Json(confessions),
        Err(e) => {
            warn!("Failed to load confessions for {}: {}", receiver_id, e);
            Json(Vec::new())
        }
    }
}

pub async fn remove(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| delete_confession(s, &session, id)).await?;
    Ok(Json(Success::ok()))
}

pub async fn reply(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(req): Json<ReplyRequest>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| reply_to_confession(s, &session, id, &req.reply)).await?;
    Ok(Json(Success::ok()))
}

pub async fn pin(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
) -> Result<Json<PinResponse>, ApiError> {
    let is_pinned = blocking(state, move |s| toggle_pin(s, &session, id)).await?;
    Ok(Json(PinResponse {
        success: true,
        is_pinned,
    }))
}

pub async fn edit(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(req): Json<EditConfessionRequest>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| {
        edit_confession(s, &session, id, &req.content, Utc::now())
    })
    .await?;
    Ok(Json(Success::ok()))
}

// -- Operations --

fn checked_content(raw: &str) -> Result<&str, ApiError> {
    let content = raw.trim();
    let len = content.chars().count();
    if len == 0 {
        return Err(ApiError::validation("Message cannot be empty"));
    }
    if len > MAX_CONTENT_CHARS {
        return Err(ApiError::validation(format!(
            "Message cannot exceed {MAX_CONTENT_CHARS} characters"
        )));
    }
    Ok(content)
}

/// The receiver, or any moderator.
fn may_moderate(user: &AuthUser, receiver_id: Uuid) -> bool {
    user.id == receiver_id || user.is_moderator()
}

/// Store a new confession and push it to the receiver's live listeners.
///
/// The sender is recorded only when the caller is signed in and did not ask
/// for anonymity.
pub fn send_confession(
    state: &AppStateInner,
    session: &Session,
    client: &ClientIp,
    req: &SendConfessionRequest,
) -> Result<Confession, ApiError> {
    let content = checked_content(&req.content)?;

    if let Some(key) = client.limiter_key() {
        let decision = state.send_limiter.check(&key);
        if !decision.success {
            debug!("Confession rate limit hit for {}", key);
            return Err(ApiError::RateLimited {
                retry_after: decision.retry_after(),
            });
        }
    }

    let receiver = state
        .db
        .get_user_by_id(req.receiver_id)?
        .filter(|user| !user.is_banned)
        .ok_or(ApiError::NotFound("User"))?;

    let sender_id = if req.is_anonymous {
        None
    } else {
        authz::current_user(&state.db, session)?.map(|user| user.id)
    };

    let id = Uuid::new_v4();
    state.db.insert_confession(&NewConfession {
        id,
        content,
        sender_id,
        receiver_id: receiver.id,
        created_at: Utc::now(),
    })?;

    let confession = state
        .db
        .get_confession(id)?
        .ok_or_else(|| anyhow::anyhow!("confession {id} vanished after insert"))?
        .into_view();

    let delivered = state.dispatcher.publish(receiver.id, &confession);
    debug!("Confession {} delivered to {} live listener(s)", id, delivered);
    state.cache.invalidate_tag(&user_tag(receiver.id));

    Ok(confession)
}

pub fn fetch_page(
    state: &AppStateInner,
    receiver_id: Uuid,
    offset: u32,
    limit: u32,
) -> Result<Vec<Confession>, ApiError> {
    let rows = state.db.list_confessions(receiver_id, offset, limit)?;
    Ok(rows.into_iter().map(|row| row.into_view()).collect())
}

pub fn delete_confession(state: &AppStateInner, session: &Session, id: Uuid) -> Result<(), ApiError> {
    let user = authz::require_auth(&state.db, session)?;
    let confession = state
        .db
        .get_confession(id)?
        .ok_or(ApiError::NotFound("Confession"))?;
    if !may_moderate(&user, confession.receiver_id) {
        return Err(ApiError::forbidden("Not authorized to delete this confession"));
    }

    state.db.delete_confession(id)?;
    if user.id != confession.receiver_id {
        info!("{} ({}) deleted confession {}", user.username, user.role, id);
    }
    state.cache.invalidate_tag(&user_tag(confession.receiver_id));
    Ok(())
}

/// Replace the receiver's reply.
pub fn reply_to_confession(
    state: &AppStateInner,
    session: &Session,
    id: Uuid,
    reply: &str,
) -> Result<(), ApiError> {
    let user = authz::require_auth(&state.db, session)?;
    let reply = checked_content(reply)?;
    let confession = state
        .db
        .get_confession(id)?
        .ok_or(ApiError::NotFound("Confession"))?;
    if confession.receiver_id != user.id {
        return Err(ApiError::forbidden("Only the receiver can reply"));
    }

    state.db.set_reply(id, reply, Utc::now())?;
    state.cache.invalidate_tag(&user_tag(confession.receiver_id));
    Ok(())
}

/// Flip the pin flag; returns the new state.
///
/// Moderators may pin on anyone's profile, but they are not exempt from the
/// recount: a receiver never shows more than [`MAX_PINNED`] pinned
/// confessions, whoever pinned them.
pub fn toggle_pin(state: &AppStateInner, session: &Session, id: Uuid) -> Result<bool, ApiError> {
    let user = authz::require_auth(&state.db, session)?;
    let confession = state
        .db
        .get_confession(id)?
        .ok_or(ApiError::NotFound("Confession"))?;
    if !may_moderate(&user, confession.receiver_id) {
        return Err(ApiError::forbidden("Not authorized to pin this confession"));
    }

    let pinned = match state.db.toggle_pin(id, MAX_PINNED)? {
        None => return Err(ApiError::NotFound("Confession")),
        Some(PinToggle::LimitReached) => {
            return Err(ApiError::rule(format!(
                "You can only pin up to {MAX_PINNED} confessions"
            )));
        }
        Some(PinToggle::Pinned) => true,
        Some(PinToggle::Unpinned) => false,
    };
    state.cache.invalidate_tag(&user_tag(confession.receiver_id));
    Ok(pinned)
}

/// Only the attributed sender may edit, and only within the edit window.
pub fn edit_confession(
    state: &AppStateInner,
    session: &Session,
    id: Uuid,
    content: &str,
    now: DateTime<Utc>,
) -> Result<(), ApiError> {
    let user = authz::require_auth(&state.db, session)?;
    let content = checked_content(content)?;
    let confession = state
        .db
        .get_confession(id)?
        .ok_or(ApiError::NotFound("Confession"))?;
    if confession.is_anonymous || confession.sender_id != Some(user.id) {
        return Err(ApiError::forbidden("Only the sender can edit this confession"));
    }
    if now - confession.created_at > Duration::seconds(EDIT_WINDOW_SECS) {
        return Err(ApiError::rule("The 5 minute edit window has expired"));
    }

    state.db.update_content(id, content, now)?;
    state.cache.invalidate_tag(&user_tag(confession.receiver_id));
    Ok(())
}
