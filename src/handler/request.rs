// handler/request.rs
use std::sync::Arc;

use axum::{
    extract::Path,
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use chrono::Utc;
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escrowdtos::*,
    error::HttpError,
    models::{escrowmodel::MilestoneTemplate, paymentmodel::*},
    utils::currency::{format_kobo_as_naira, naira_to_kobo},
    AppState,
};

pub fn request_handler() -> Router {
    Router::new()
        .route("/", post(create_request))
        .route("/:request_id/quotes", post(submit_quote))
        .route("/:request_id/accept", post(accept_quote))
        .route("/:request_id/status", get(poll_status))
        .route("/:request_id/contact", get(reveal_contact))
        .route("/:request_id/activate", post(activate_job))
        .route("/:request_id/complete", post(complete_job))
        .route("/:request_id/cancel", post(cancel_request))
}

pub fn artisan_handler() -> Router {
    Router::new().route("/:artisan_id/contact", post(save_artisan_contact))
}

// Intake: requests, quotes and artisan profiles normally come from the
// wider platform; these endpoints let the engine run on its own.
pub async fn create_request(
    Extension(app_state): Extension<Arc<AppState>>,
    Json(body): Json<CreateRequestDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let request = app_state
        .store
        .save_request(ServiceRequest {
            id: Uuid::new_v4(),
            customer_id: body.customer_id,
            artisan_id: body.artisan_id,
            status: RequestStatus::Open,
            created_at: Utc::now(),
        })
        .await
        .map_err(|e| HttpError::server_error(e.to_string()))?;

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Service request created", request)),
    ))
}

pub async fn submit_quote(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<SubmitQuoteDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let request = app_state
        .store
        .get_request(request_id)
        .await
        .map_err(|e| HttpError::server_error(e.to_string()))?
        .ok_or_else(|| HttpError::not_found("Service request not found"))?;

    if request.status != RequestStatus::Open {
        return Err(HttpError::new(
            format!("Request is {}; quotes are closed", request.status.to_str()),
            StatusCode::CONFLICT,
        ));
    }

    let quote = app_state
        .store
        .save_quote(Quote {
            id: Uuid::new_v4(),
            request_id,
            artisan_id: request.artisan_id,
            amount: naira_to_kobo(body.amount),
            accepted_at: None,
        })
        .await
        .map_err(|e| HttpError::server_error(e.to_string()))?;

    let response = QuoteResponseDto {
        formatted_amount: format_kobo_as_naira(quote.amount),
        quote,
    };

    Ok((
        StatusCode::CREATED,
        Json(ApiResponse::success("Quote submitted", response)),
    ))
}

pub async fn save_artisan_contact(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(artisan_id): Path<Uuid>,
    Json(body): Json<ArtisanContactDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    app_state
        .store
        .save_artisan_contact(ArtisanContact {
            artisan_id,
            full_name: body.full_name,
            phone: body.phone,
            email: body.email,
            address: body.address,
        })
        .await
        .map_err(|e| HttpError::server_error(e.to_string()))?;

    // the details themselves only leave through the reveal gate
    Ok(Json(ApiResponse::success(
        "Artisan contact saved",
        serde_json::json!({ "artisan_id": artisan_id }),
    )))
}

pub async fn accept_quote(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<AcceptQuoteDto>,
) -> Result<impl IntoResponse, HttpError> {
    for milestone in &body.milestones {
        milestone
            .validate()
            .map_err(|e| HttpError::bad_request(e.to_string()))?;
    }

    let templates: Vec<MilestoneTemplate> = body.milestones.into_iter().map(Into::into).collect();
    let accepted = app_state
        .flow
        .accept_quote(request_id, body.quote_id, templates)
        .await?;

    Ok(Json(ApiResponse::success("Quote accepted", accepted)))
}

pub async fn poll_status(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let state = app_state.flow.poll_status(request_id).await?;
    Ok(Json(ApiResponse::success("Payment status retrieved", state)))
}

pub async fn reveal_contact(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let contact = app_state.flow.reveal_contact(request_id).await?;
    Ok(Json(ApiResponse::success("Artisan contact revealed", contact)))
}

pub async fn activate_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
) -> Result<impl IntoResponse, HttpError> {
    let request = app_state.flow.activate_job(request_id).await?;
    Ok(Json(ApiResponse::success("Job started", request)))
}

pub async fn complete_job(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<ApproverDto>,
) -> Result<impl IntoResponse, HttpError> {
    let completion = app_state
        .flow
        .complete_job(request_id, body.approver_id)
        .await?;
    Ok(Json(ApiResponse::success("Job completed and escrow released", completion)))
}

pub async fn cancel_request(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(request_id): Path<Uuid>,
    Json(body): Json<ReasonDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let cancellation = app_state
        .flow
        .cancel_request(request_id, &body.reason)
        .await?;
    Ok(Json(ApiResponse::success("Request cancelled", cancellation)))
}
