// handler/escrow.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escrowdtos::*,
    error::HttpError,
    models::escrowmodel::MilestoneTemplate,
    AppState,
};

pub fn escrow_handler() -> Router {
    Router::new()
        .route("/:escrow_id", get(get_escrow))
        .route("/:escrow_id/ledger", get(get_ledger))
        .route("/:escrow_id/refund", post(refund_escrow))
        .route("/:escrow_id/dispute", post(dispute_escrow))
        .route(
            "/:escrow_id/milestones",
            get(list_milestones).post(create_milestone_plan),
        )
}

pub fn milestone_handler() -> Router {
    Router::new()
        .route("/:milestone_id/deposit", post(deposit_milestone))
        .route("/:milestone_id/evidence", post(submit_evidence))
        .route("/:milestone_id/approve", post(approve_milestone))
        .route("/:milestone_id/dispute", post(dispute_milestone))
}

pub async fn get_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let escrow = app_state.flow.escrows().get_escrow(escrow_id).await?;
    Ok(Json(ApiResponse::success("Escrow retrieved", escrow)))
}

pub async fn get_ledger(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let statement = app_state.flow.escrows().statement(escrow_id).await?;
    Ok(Json(ApiResponse::success("Escrow ledger retrieved", statement)))
}

pub async fn refund_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<ReasonDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .flow
        .escrows()
        .refund(escrow_id, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Escrow refunded", escrow)))
}

pub async fn dispute_escrow(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<ReasonDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let escrow = app_state
        .flow
        .escrows()
        .dispute(escrow_id, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Escrow disputed", escrow)))
}

pub async fn list_milestones(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let milestones = app_state.flow.milestones().list(escrow_id).await?;
    Ok(Json(ApiResponse::success("Milestones retrieved", milestones)))
}

pub async fn create_milestone_plan(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(escrow_id): Path<Uuid>,
    Json(body): Json<CreatePlanDto>,
) -> Result<impl IntoResponse, HttpError> {
    for milestone in &body.milestones {
        milestone
            .validate()
            .map_err(|e| HttpError::bad_request(e.to_string()))?;
    }

    let templates: Vec<MilestoneTemplate> = body.milestones.into_iter().map(Into::into).collect();
    let plan = app_state
        .flow
        .milestones()
        .create_plan(escrow_id, &templates)
        .await?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Milestone plan created", plan)),
    ))
}

pub async fn deposit_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let change = app_state.flow.milestones().deposit(milestone_id).await?;
    Ok(Json(ApiResponse::success("Milestone funded", change.milestone)))
}

pub async fn submit_evidence(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<EvidenceDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let receipt = app_state
        .flow
        .milestones()
        .submit_evidence(milestone_id, body.into())
        .await?;

    let message = if receipt.released.is_some() {
        "Evidence submitted and milestone released"
    } else {
        "Evidence submitted"
    };
    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success(message, receipt.evidence)),
    ))
}

pub async fn approve_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ApproverDto>,
) -> Result<impl IntoResponse, HttpError> {
    let change = app_state
        .flow
        .milestones()
        .approve(milestone_id, body.approver_id)
        .await?;

    Ok(Json(ApiResponse::success(
        "Milestone approved and released",
        serde_json::json!({
            "milestone": change.milestone,
            "activated": change.activated,
            "escrow_status": change.escrow.status,
        }),
    )))
}

pub async fn dispute_milestone(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(milestone_id): Path<Uuid>,
    Json(body): Json<ReasonDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let milestone = app_state
        .flow
        .milestones()
        .dispute(milestone_id, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Milestone disputed", milestone)))
}
