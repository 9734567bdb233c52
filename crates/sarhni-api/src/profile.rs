use axum::extract::State;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use sarhni_types::api::{Success, UpdateProfileRequest};

use crate::authz;
use crate::blocking;
use crate::cache::user_tag;
use crate::error::ApiError;
use crate::extract::{Json, Path};
use crate::middleware::Session;
use crate::state::{AppState, AppStateInner};

pub const MAX_BIO_CHARS: usize = 500;

pub async fn update(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateProfileRequest>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| update_profile(s, &session, id, &req)).await?;
    Ok(Json(Success::ok()))
}

/// `DELETE /me/image`
pub async fn delete_image(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Success>, ApiError> {
    delete_profile_image(&state, session).await?;
    Ok(Json(Success::ok()))
}

/// `None` for an empty (cleared) URL. Blobs we host are accepted as the
/// upload endpoint returned them; anything else must be an absolute http(s)
/// URL.
fn checked_image_url<'a>(state: &AppStateInner, raw: &'a str) -> Result<Option<&'a str>, ApiError> {
    let raw = raw.trim();
    if raw.is_empty() {
        return Ok(None);
    }
    if state.storage.name_from_url(raw).is_some() {
        return Ok(Some(raw));
    }
    match Url::parse(raw) {
        Ok(url) if matches!(url.scheme(), "http" | "https") => Ok(Some(raw)),
        _ => Err(ApiError::validation("Image must be an http(s) URL")),
    }
}

/// Self-edit only. A field left out of the request is kept; `null` or an
/// empty string clears it.
pub fn update_profile(
    state: &AppStateInner,
    session: &Session,
    target: Uuid,
    req: &UpdateProfileRequest,
) -> Result<(), ApiError> {
    let user = authz::require_auth(&state.db, session)?;
    if user.id != target {
        return Err(ApiError::forbidden("You can only edit your own profile"));
    }

    let bio = match &req.bio {
        None => None,
        Some(None) => Some(None),
        Some(Some(bio)) => {
            if bio.chars().count() > MAX_BIO_CHARS {
                return Err(ApiError::validation(format!(
                    "Bio cannot exceed {MAX_BIO_CHARS} characters"
                )));
            }
            Some((!bio.is_empty()).then_some(bio.as_str()))
        }
    };
    let image = match &req.image {
        None => None,
        Some(None) => Some(None),
        Some(Some(url)) => Some(checked_image_url(state, url)?),
    };

    if !state.db.update_profile(user.id, bio, image)? {
        return Err(ApiError::NotFound("User"));
    }
    state.cache.invalidate_tag(&user_tag(user.id));
    Ok(())
}

/// Clear the caller's image and drop its blob if we host it.
pub async fn delete_profile_image(state: &AppState, session: Session) -> Result<(), ApiError> {
    let url = blocking(state.clone(), move |s| {
        let user = authz::require_auth(&s.db, &session)?;
        let row = s.db.get_user_by_id(user.id)?.ok_or(ApiError::Unauthorized)?;
        let url = row
            .image
            .ok_or_else(|| ApiError::rule("No profile image to delete"))?;
        s.db.update_profile(user.id, None, Some(None))?;
        s.cache.invalidate_tag(&user_tag(user.id));
        Ok(url)
    })
    .await?;

    remove_image_blob(state, &url).await;
    Ok(())
}

/// Best effort: failures are logged and never fail the caller.
pub async fn remove_image_blob(state: &AppStateInner, url: &str) {
    let Some(name) = state.storage.name_from_url(url) else {
        return;
    };
    match state.storage.delete(name).await {
        Ok(()) => info!("Removed profile image blob {}", name),
        Err(e) => warn!("Failed to delete image blob {}: {}", name, e),
    }
}

#[cfg(test)]
mod tests {
    use sarhni_media::{ImageKind, Storage};
    use sarhni_types::models::Role;

    use super::*;
    use crate::test_support::{TestUser, test_state};

    fn bio(text: Option<&str>) -> UpdateProfileRequest {
        UpdateProfileRequest {
            bio: Some(text.map(str::to_string)),
            image: None,
        }
    }

    fn image(url: &str) -> UpdateProfileRequest {
        UpdateProfileRequest {
            bio: None,
            image: Some(Some(url.to_string())),
        }
    }

    #[tokio::test]
    async fn bio_round_trips_at_the_limit() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);

        let max = "b".repeat(500);
        update_profile(&state, &alice.session(), alice.id, &bio(Some(max.as_str()))).unwrap();
        let stored = state.db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some(max.as_str()));

        let over = "b".repeat(501);
        assert!(matches!(
            update_profile(&state, &alice.session(), alice.id, &bio(Some(over.as_str()))),
            Err(ApiError::Validation(_))
        ));
        let stored = state.db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some(max.as_str()));
    }

    #[tokio::test]
    async fn omitted_fields_are_kept() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);

        update_profile(&state, &alice.session(), alice.id, &bio(Some("hello"))).unwrap();
        update_profile(&state, &alice.session(), alice.id, &image("https://cdn.example.com/a.png"))
            .unwrap();
        let stored = state.db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(stored.bio.as_deref(), Some("hello"));

        update_profile(&state, &alice.session(), alice.id, &bio(None)).unwrap();
        let stored = state.db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(stored.bio, None);
        assert_eq!(stored.image.as_deref(), Some("https://cdn.example.com/a.png"));
    }

    #[tokio::test]
    async fn only_http_image_urls_are_accepted() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);

        for bad in ["javascript:alert(1)", "data:image/png;base64,AAAA", "/relative.png", "ftp://x/y.png"] {
            assert!(
                matches!(
                    update_profile(&state, &alice.session(), alice.id, &image(bad)),
                    Err(ApiError::Validation(_))
                ),
                "{bad} should be rejected"
            );
        }
        update_profile(&state, &alice.session(), alice.id, &image("http://example.com/a.gif")).unwrap();
    }

    #[tokio::test]
    async fn hosted_upload_urls_are_accepted() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);

        let url = state.storage.url_for(&Storage::blob_name(ImageKind::Webp));
        assert!(url.starts_with('/'));
        update_profile(&state, &alice.session(), alice.id, &image(&url)).unwrap();
        let stored = state.db.get_user_by_id(alice.id).unwrap().unwrap();
        assert_eq!(stored.image.as_deref(), Some(url.as_str()));

        assert!(matches!(
            update_profile(&state, &alice.session(), alice.id, &image("/uploads/../secret.png")),
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn profiles_are_self_edit_only() {
        let (state, _dir) = test_state().await;
        let owner = TestUser::create(&state.db, "owner", Role::Owner);
        let alice = TestUser::create(&state.db, "alice", Role::User);

        assert!(matches!(
            update_profile(&state, &owner.session(), alice.id, &bio(Some("hacked"))),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            update_profile(&state, &Session::anonymous(), alice.id, &bio(Some("hacked"))),
            Err(ApiError::Unauthorized)
        ));
    }

    #[tokio::test]
    async fn deleting_image_removes_hosted_blob() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);

        assert!(matches!(
            delete_profile_image(&state, alice.session()).await,
            Err(ApiError::Rule(_))
        ));

        let name = Storage::blob_name(ImageKind::Png);
        let url = state.storage.put(&name, b"png bytes").await.unwrap();
        state
            .db
            .update_profile(alice.id, None, Some(Some(url.as_str())))
            .unwrap();

        delete_profile_image(&state, alice.session()).await.unwrap();
        assert!(!state.storage.dir().join(&name).exists());
        assert_eq!(state.db.get_user_by_id(alice.id).unwrap().unwrap().image, None);
    }

    #[tokio::test]
    async fn missing_blob_does_not_fail_image_removal() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);
        let url = state.storage.url_for(&Storage::blob_name(ImageKind::Jpeg));
        state
            .db
            .update_profile(alice.id, None, Some(Some(url.as_str())))
            .unwrap();

        delete_profile_image(&state, alice.session()).await.unwrap();
        assert_eq!(state.db.get_user_by_id(alice.id).unwrap().unwrap().image, None);
    }
}
