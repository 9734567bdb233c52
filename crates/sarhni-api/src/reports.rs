use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
};
use chrono::Utc;
use tracing::info;
use uuid::Uuid;

use sarhni_db::models::NewReport;
use sarhni_types::api::{CreateReportRequest, Success, UpdateReportStatusRequest};
use sarhni_types::models::{ReportDetail, ReportStatus, Role};

use crate::authz;
use crate::blocking;
use crate::error::ApiError;
use crate::extract::{Json, Path};
use crate::middleware::Session;
use crate::state::{AppState, AppStateInner};

pub const MAX_DESCRIPTION_CHARS: usize = 500;
pub const LIST_LIMIT: u32 = 50;

pub async fn create(
    State(state): State<AppState>,
    session: Session,
    Json(req): Json<CreateReportRequest>,
) -> Result<impl IntoResponse, ApiError> {
    blocking(state, move |s| create_report(s, &session, &req)).await?;
    Ok((StatusCode::CREATED, Json(Success::ok())))
}

pub async fn list(
    State(state): State<AppState>,
    session: Session,
) -> Result<Json<Vec<ReportDetail>>, ApiError> {
    let reports = blocking(state, move |s| list_reports(s, &session)).await?;
    Ok(Json(reports))
}

pub async fn update_status(
    State(state): State<AppState>,
    session: Session,
    Path(id): Path<Uuid>,
    Json(req): Json<UpdateReportStatusRequest>,
) -> Result<Json<Success>, ApiError> {
    blocking(state, move |s| review_report(s, &session, id, req.status)).await?;
    Ok(Json(Success::ok()))
}

/// File a report. A reporter holds at most one PENDING report per
/// confession; once that one is reviewed or dismissed they may report again.
pub fn create_report(
    state: &AppStateInner,
    session: &Session,
    req: &CreateReportRequest,
) -> Result<Uuid, ApiError> {
    let user = authz::require_auth(&state.db, session)?;

    let description = req
        .description
        .as_deref()
        .map(str::trim)
        .filter(|d| !d.is_empty());
    if description.is_some_and(|d| d.chars().count() > MAX_DESCRIPTION_CHARS) {
        return Err(ApiError::validation(format!(
            "Description cannot exceed {MAX_DESCRIPTION_CHARS} characters"
        )));
    }

    if state.db.get_confession(req.confession_id)?.is_none() {
        return Err(ApiError::NotFound("Confession"));
    }

    let id = Uuid::new_v4();
    let created = state.db.create_report(&NewReport {
        id,
        confession_id: req.confession_id,
        reporter_id: user.id,
        reason: req.reason,
        description,
        created_at: Utc::now(),
    })?;
    if !created {
        return Err(ApiError::rule("You have already reported this confession"));
    }

    info!(
        "{} reported confession {} ({})",
        user.username,
        req.confession_id,
        req.reason.as_str()
    );
    Ok(id)
}

pub fn list_reports(state: &AppStateInner, session: &Session) -> Result<Vec<ReportDetail>, ApiError> {
    authz::require_role(&state.db, session, Role::Admin)?;
    Ok(state.db.list_reports(LIST_LIMIT)?)
}

/// Move a report to REVIEWED or DISMISSED. Either terminal state may be
/// replaced by the other later; a report is never reopened.
pub fn review_report(
    state: &AppStateInner,
    session: &Session,
    id: Uuid,
    status: ReportStatus,
) -> Result<(), ApiError> {
    let moderator = authz::require_role(&state.db, session, Role::Admin)?;
    if status == ReportStatus::Pending {
        return Err(ApiError::validation("A report cannot be set back to PENDING"));
    }

    let report = state.db.get_report(id)?.ok_or(ApiError::NotFound("Report"))?;
    if !state
        .db
        .update_report_status(id, status, moderator.id, Utc::now())?
    {
        return Err(ApiError::NotFound("Report"));
    }

    info!(
        "Report {} {} -> {} by {}",
        id,
        report.status.as_str(),
        status.as_str(),
        moderator.username
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use sarhni_db::models::NewConfession;
    use sarhni_types::models::ReportReason;

    use super::*;
    use crate::test_support::{TestUser, test_state};

    fn seed_confession(state: &AppStateInner, receiver: &TestUser) -> Uuid {
        let id = Uuid::new_v4();
        state
            .db
            .insert_confession(&NewConfession {
                id,
                content: "something rude",
                sender_id: None,
                receiver_id: receiver.id,
                created_at: Utc::now(),
            })
            .unwrap();
        id
    }

    fn report(confession_id: Uuid, description: Option<&str>) -> CreateReportRequest {
        CreateReportRequest {
            confession_id,
            reason: ReportReason::Harassment,
            description: description.map(str::to_string),
        }
    }

    #[tokio::test]
    async fn second_pending_report_is_rejected_until_reviewed() {
        let (state, _dir) = test_state().await;
        let owner = TestUser::create(&state.db, "owner", Role::Owner);
        let alice = TestUser::create(&state.db, "alice", Role::User);
        let bob = TestUser::create(&state.db, "bob", Role::User);
        let confession = seed_confession(&state, &alice);

        let first = create_report(&state, &bob.session(), &report(confession, Some("mean"))).unwrap();
        assert!(matches!(
            create_report(&state, &bob.session(), &report(confession, None)),
            Err(ApiError::Rule(_))
        ));

        review_report(&state, &owner.session(), first, ReportStatus::Dismissed).unwrap();
        create_report(&state, &bob.session(), &report(confession, None)).unwrap();
    }

    #[tokio::test]
    async fn reporting_requires_a_real_confession_and_session() {
        let (state, _dir) = test_state().await;
        let bob = TestUser::create(&state.db, "bob", Role::User);

        assert!(matches!(
            create_report(&state, &Session::anonymous(), &report(Uuid::new_v4(), None)),
            Err(ApiError::Unauthorized)
        ));
        assert!(matches!(
            create_report(&state, &bob.session(), &report(Uuid::new_v4(), None)),
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn long_descriptions_are_rejected() {
        let (state, _dir) = test_state().await;
        let alice = TestUser::create(&state.db, "alice", Role::User);
        let confession = seed_confession(&state, &alice);
        let long = "x".repeat(501);

        assert!(matches!(
            create_report(&state, &alice.session(), &report(confession, Some(long.as_str()))),
            Err(ApiError::Validation(_))
        ));
    }

    #[tokio::test]
    async fn listing_is_for_moderators() {
        let (state, _dir) = test_state().await;
        let _owner = TestUser::create(&state.db, "owner", Role::Owner);
        let admin = TestUser::create(&state.db, "admin", Role::Admin);
        let alice = TestUser::create(&state.db, "alice", Role::User);
        let bob = TestUser::create(&state.db, "bob", Role::User);
        let confession = seed_confession(&state, &alice);
        create_report(&state, &bob.session(), &report(confession, Some("  "))).unwrap();

        assert!(matches!(
            list_reports(&state, &bob.session()),
            Err(ApiError::Forbidden(_))
        ));

        let reports = list_reports(&state, &admin.session()).unwrap();
        assert_eq!(reports.len(), 1);
        assert_eq!(reports[0].reporter.username, "bob");
        assert_eq!(reports[0].confession.receiver.username, "alice");
        assert_eq!(reports[0].description, None);
        assert_eq!(reports[0].status, ReportStatus::Pending);
    }

    #[tokio::test]
    async fn review_stamps_reviewer_and_allows_terminal_flips() {
        let (state, _dir) = test_state().await;
        let owner = TestUser::create(&state.db, "owner", Role::Owner);
        let alice = TestUser::create(&state.db, "alice", Role::User);
        let confession = seed_confession(&state, &alice);
        let id = create_report(&state, &alice.session(), &report(confession, None)).unwrap();

        assert!(matches!(
            review_report(&state, &alice.session(), id, ReportStatus::Reviewed),
            Err(ApiError::Forbidden(_))
        ));
        assert!(matches!(
            review_report(&state, &owner.session(), id, ReportStatus::Pending),
            Err(ApiError::Validation(_))
        ));
        assert!(matches!(
            review_report(&state, &owner.session(), Uuid::new_v4(), ReportStatus::Reviewed),
            Err(ApiError::NotFound(_))
        ));

        review_report(&state, &owner.session(), id, ReportStatus::Reviewed).unwrap();
        review_report(&state, &owner.session(), id, ReportStatus::Dismissed).unwrap();

        let stored = state.db.get_report(id).unwrap().unwrap();
        assert_eq!(stored.status, ReportStatus::Dismissed);
        assert_eq!(stored.reviewed_by, Some(owner.id));
        assert!(stored.reviewed_at.is_some());
    }
}
