use axum::{
    extract::{
        DefaultBodyLimit, Multipart, State,
        multipart::{MultipartError, MultipartRejection},
    },
    http::{HeaderMap, StatusCode, header},
};
use tracing::{debug, info};

use sarhni_media::{MAX_UPLOAD_BYTES, Storage, UploadError, validate};
use sarhni_types::api::UploadResponse;

use crate::authz;
use crate::blocking;
use crate::error::ApiError;
use crate::extract::Json;
use crate::middleware::Session;
use crate::state::{AppState, AppStateInner};

const FILE_FIELD: &str = "file";

/// Room for multipart boundaries and part headers on top of the file itself.
const MULTIPART_OVERHEAD: usize = 64 * 1024;

pub fn body_limit() -> DefaultBodyLimit {
    DefaultBodyLimit::max(MAX_UPLOAD_BYTES + MULTIPART_OVERHEAD)
}

/// `POST /upload` with a multipart `file` field.
pub async fn upload(
    State(state): State<AppState>,
    session: Session,
    headers: HeaderMap,
    multipart: Result<Multipart, MultipartRejection>,
) -> Result<Json<UploadResponse>, ApiError> {
    let user = blocking(state.clone(), move |s| authz::require_auth(&s.db, &session)).await?;
    let mut multipart = multipart?;

    let declared = headers
        .get(header::CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.parse::<usize>().ok())
        .map(|len| len.saturating_sub(MULTIPART_OVERHEAD))
        .unwrap_or(0);

    let bytes = loop {
        let Some(field) = multipart.next_field().await.map_err(multipart_error)? else {
            return Err(UploadError::Empty.into());
        };
        if field.name() == Some(FILE_FIELD) {
            break field.bytes().await.map_err(multipart_error)?;
        }
    };

    let url = store_upload(&state, &bytes, declared).await?;
    info!("{} uploaded {} ({} bytes)", user.username, url, bytes.len());
    Ok(Json(UploadResponse { success: true, url }))
}

fn multipart_error(e: MultipartError) -> ApiError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        return UploadError::TooLarge.into();
    }
    debug!("Malformed multipart upload: {}", e.body_text());
    ApiError::validation("Malformed upload")
}

/// Validate by content and write under a fresh name. Returns the public URL.
pub async fn store_upload(
    state: &AppStateInner,
    bytes: &[u8],
    declared_size: usize,
) -> Result<String, ApiError> {
    let info = validate(bytes, declared_size)?;
    debug!(
        "Accepted {} upload {}x{}",
        info.mime(),
        info.width,
        info.height
    );
    let name = Storage::blob_name(info.kind);
    Ok(state.storage.put(&name, bytes).await?)
}

#[cfg(test)]
mod tests {
    use sarhni_media::fixtures::png;

    use super::*;
    use crate::test_support::test_state;

    #[tokio::test]
    async fn accepted_upload_gets_a_generated_name() {
        let (state, _dir) = test_state().await;
        let bytes = png(4096, 4096);

        let url = store_upload(&state, &bytes, bytes.len()).await.unwrap();
        let name = state.storage.name_from_url(&url).unwrap();
        assert!(name.ends_with(".png"));
        assert_eq!(std::fs::read(state.storage.dir().join(name)).unwrap(), bytes);
    }

    #[tokio::test]
    async fn disguised_file_is_rejected() {
        let (state, _dir) = test_state().await;
        let bytes = b"MZ\x90\x00 definitely a cat.jpg".to_vec();
        let err = store_upload(&state, &bytes, bytes.len()).await.unwrap_err();
        assert!(matches!(err, ApiError::Upload(UploadError::InvalidFileType)));
        assert_eq!(std::fs::read_dir(state.storage.dir()).unwrap().count(), 0);
    }

    #[tokio::test]
    async fn oversized_dimensions_and_payloads_are_rejected() {
        let (state, _dir) = test_state().await;
        let wide = png(5000, 3000);
        assert!(matches!(
            store_upload(&state, &wide, wide.len()).await,
            Err(ApiError::Upload(UploadError::DimensionsOutOfBounds { .. }))
        ));

        let small = png(10, 10);
        let err = store_upload(&state, &small, MAX_UPLOAD_BYTES + 1).await.unwrap_err();
        assert_eq!(err.status(), StatusCode::PAYLOAD_TOO_LARGE);
    }
}
