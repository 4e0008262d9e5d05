use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Router,
};
use chrono::Local;
use serde::Deserialize;
use serde_json::json;

use super::controller::{PreconditionError, WorkflowError, WorkflowSnapshot};
use super::domain::{ApplicantProfile, CurrentUser, DocumentSubmission};
use super::lifecycle::LoanId;
use super::repository::{LoanRepository, RepositoryError};
use super::sessions::WorkflowSessions;
use super::tracker::{
    BuyOffUpdate, InstitutionUpdate, LoanTracker, LoanTrackerError, RepaymentUpdate,
};

pub const USER_ID_HEADER: &str = "x-user-id";
pub const USER_EMAIL_HEADER: &str = "x-user-email";
pub const USER_EMAIL_VERIFIED_HEADER: &str = "x-user-email-verified";
pub const INSTITUTION_KEY_HEADER: &str = "x-institution-key";

/// Shared handler state: per-applicant workflow sessions and the loan tracker.
pub struct OriginationState<R> {
    pub sessions: Arc<WorkflowSessions<R>>,
    pub tracker: Arc<LoanTracker<R>>,
    /// Key lenders must present to post status, repayment or buy-off updates.
    /// `None` refuses every such update.
    pub institution_key: Option<Arc<str>>,
}

impl<R> Clone for OriginationState<R> {
    fn clone(&self) -> Self {
        Self {
            sessions: Arc::clone(&self.sessions),
            tracker: Arc::clone(&self.tracker),
            institution_key: self.institution_key.clone(),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SelectionRequest {
    pub institution_name: String,
}

/// Router builder exposing the applicant workflow and loan tracking endpoints.
pub fn origination_router<R>(state: OriginationState<R>) -> Router
where
    R: LoanRepository + 'static,
{
    Router::new()
        .route("/api/v1/origination/session", get(session_handler::<R>))
        .route("/api/v1/origination/eligibility", post(eligibility_handler::<R>))
        .route("/api/v1/origination/matches", post(matches_handler::<R>))
        .route("/api/v1/origination/selection", post(selection_handler::<R>))
        .route("/api/v1/origination/kyc", post(kyc_handler::<R>))
        .route("/api/v1/origination/reset", post(reset_handler::<R>))
        .route("/api/v1/loans", get(dashboard_handler::<R>))
        .route("/api/v1/loans/:loan_id", get(loan_detail_handler::<R>))
        .route("/api/v1/loans/:loan_id/status", post(status_update_handler::<R>))
        .route(
            "/api/v1/loans/:loan_id/repayment",
            post(repayment_update_handler::<R>),
        )
        .route("/api/v1/loans/:loan_id/buy-off", post(buy_off_handler::<R>))
        .with_state(state)
}

/// Whether the request carries the configured institution key.
pub fn institution_authorized(expected: Option<&str>, headers: &HeaderMap) -> bool {
    let Some(expected) = expected else {
        return false;
    };
    headers
        .get(INSTITUTION_KEY_HEADER)
        .and_then(|value| value.to_str().ok())
        .is_some_and(|presented| presented.trim() == expected)
}

/// Identity forwarded by the authenticating proxy. A missing or blank id means signed out.
pub fn current_user(headers: &HeaderMap) -> Option<CurrentUser> {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|value| value.to_str().ok())
            .map(str::trim)
            .filter(|value| !value.is_empty())
    };

    let id = header(USER_ID_HEADER)?;
    Some(CurrentUser {
        id: id.to_string(),
        email: header(USER_EMAIL_HEADER).unwrap_or_default().to_string(),
        email_verified: header(USER_EMAIL_VERIFIED_HEADER)
            .is_some_and(|value| value.eq_ignore_ascii_case("true")),
    })
}

pub(crate) async fn session_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    let snapshot = state
        .sessions
        .existing(&user.id)
        .map_or_else(WorkflowSnapshot::empty, |controller| controller.snapshot());
    let payload = json!({
        "session": snapshot,
        "email_verified": user.email_verified,
    });
    (StatusCode::OK, axum::Json(payload)).into_response()
}

pub(crate) async fn eligibility_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    axum::Json(profile): axum::Json<ApplicantProfile>,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    let controller = state.sessions.for_user(&user.id);
    match controller.submit(Some(&user), profile).await {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => workflow_error_response(err),
    }
}

pub(crate) async fn matches_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    let controller = state.sessions.for_user(&user.id);
    match controller.request_matches(Some(&user)).await {
        Ok(outcome) => (StatusCode::OK, axum::Json(outcome)).into_response(),
        Err(err) => workflow_error_response(err),
    }
}

pub(crate) async fn selection_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    axum::Json(request): axum::Json<SelectionRequest>,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    let controller = state.sessions.for_user(&user.id);
    match controller.select_institution(Some(&user), &request.institution_name) {
        Ok(record) => (StatusCode::OK, axum::Json(record.summary_view())).into_response(),
        Err(err) => workflow_error_response(err),
    }
}

pub(crate) async fn kyc_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    axum::Json(submission): axum::Json<DocumentSubmission>,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    let controller = state.sessions.for_user(&user.id);
    match controller.submit_documents(Some(&user), submission) {
        Ok(record) => (StatusCode::ACCEPTED, axum::Json(record.summary_view())).into_response(),
        Err(err) => workflow_error_response(err),
    }
}

pub(crate) async fn reset_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    // Resetting the closed controller discards any response still in flight for it.
    if let Some(controller) = state.sessions.close(&user.id) {
        controller.reset();
    }
    (StatusCode::OK, axum::Json(WorkflowSnapshot::empty())).into_response()
}

pub(crate) async fn dashboard_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    match state.tracker.dashboard(&user.id) {
        Ok(loans) => (StatusCode::OK, axum::Json(json!({ "loans": loans }))).into_response(),
        Err(err) => tracker_error_response(err),
    }
}

pub(crate) async fn loan_detail_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    Path(loan_id): Path<String>,
) -> Response
where
    R: LoanRepository + 'static,
{
    let Some(user) = current_user(&headers) else {
        return unauthenticated();
    };

    match state.tracker.detail(&user.id, &LoanId(loan_id)) {
        Ok(record) => {
            let payload = json!({
                "loan": record,
                "summary": record.summary_view(),
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => tracker_error_response(err),
    }
}

pub(crate) async fn status_update_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    Path(loan_id): Path<String>,
    axum::Json(update): axum::Json<InstitutionUpdate>,
) -> Response
where
    R: LoanRepository + 'static,
{
    if !institution_authorized(state.institution_key.as_deref(), &headers) {
        return institution_unauthenticated();
    }

    let today = Local::now().date_naive();
    match state
        .tracker
        .apply_institution_update(&LoanId(loan_id), update, today)
    {
        Ok((record, transition)) => {
            let payload = json!({
                "loan": record.summary_view(),
                "transition": transition,
            });
            (StatusCode::OK, axum::Json(payload)).into_response()
        }
        Err(err) => tracker_error_response(err),
    }
}

pub(crate) async fn repayment_update_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    Path(loan_id): Path<String>,
    axum::Json(update): axum::Json<RepaymentUpdate>,
) -> Response
where
    R: LoanRepository + 'static,
{
    if !institution_authorized(state.institution_key.as_deref(), &headers) {
        return institution_unauthenticated();
    }

    let today = Local::now().date_naive();
    match state
        .tracker
        .record_repayment(&LoanId(loan_id), update, today)
    {
        Ok(record) => (StatusCode::OK, axum::Json(record.summary_view())).into_response(),
        Err(err) => tracker_error_response(err),
    }
}

pub(crate) async fn buy_off_handler<R>(
    State(state): State<OriginationState<R>>,
    headers: HeaderMap,
    Path(loan_id): Path<String>,
    axum::Json(update): axum::Json<BuyOffUpdate>,
) -> Response
where
    R: LoanRepository + 'static,
{
    if !institution_authorized(state.institution_key.as_deref(), &headers) {
        return institution_unauthenticated();
    }

    let today = Local::now().date_naive();
    match state.tracker.set_buy_off(&LoanId(loan_id), update, today) {
        Ok(record) => (StatusCode::OK, axum::Json(record.summary_view())).into_response(),
        Err(err) => tracker_error_response(err),
    }
}

fn unauthenticated() -> Response {
    workflow_error_response(PreconditionError::Unauthenticated.into())
}

fn institution_unauthenticated() -> Response {
    error_body(
        StatusCode::UNAUTHORIZED,
        "a valid institution key is required to update loans".to_string(),
        Some("institution_unauthenticated"),
    )
}

fn error_body(status: StatusCode, message: String, reason: Option<&str>) -> Response {
    let payload = match reason {
        Some(reason) => json!({ "error": message, "reason": reason }),
        None => json!({ "error": message }),
    };
    (status, axum::Json(payload)).into_response()
}

fn workflow_error_response(err: WorkflowError) -> Response {
    match err {
        WorkflowError::Validation(error) => error_body(
            StatusCode::UNPROCESSABLE_ENTITY,
            error.to_string(),
            Some(error.reason_code()),
        ),
        WorkflowError::Precondition(error) => {
            let status = match error {
                PreconditionError::Unauthenticated => StatusCode::UNAUTHORIZED,
                _ => StatusCode::CONFLICT,
            };
            error_body(status, error.to_string(), Some(error.reason_code()))
        }
        WorkflowError::Superseded => error_body(
            StatusCode::CONFLICT,
            WorkflowError::Superseded.to_string(),
            Some("superseded"),
        ),
        WorkflowError::Repository(error) => repository_error_response(error),
        WorkflowError::Lifecycle(error) => error_body(StatusCode::CONFLICT, error.to_string(), None),
        WorkflowError::Session(error) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, error.to_string(), None)
        }
    }
}

fn tracker_error_response(err: LoanTrackerError) -> Response {
    match err {
        LoanTrackerError::Repository(error) => repository_error_response(error),
        LoanTrackerError::Lifecycle(error) => error_body(StatusCode::CONFLICT, error.to_string(), None),
    }
}

fn repository_error_response(err: RepositoryError) -> Response {
    match err {
        RepositoryError::NotFound => {
            error_body(StatusCode::NOT_FOUND, "loan not found".to_string(), None)
        }
        RepositoryError::Conflict => {
            error_body(StatusCode::CONFLICT, "loan already exists".to_string(), None)
        }
        RepositoryError::Unavailable(_) => {
            error_body(StatusCode::INTERNAL_SERVER_ERROR, err.to_string(), None)
        }
    }
}
