// handler/payment.rs
use std::sync::Arc;

use axum::{
    extract::{Path, Query},
    response::IntoResponse,
    routing::{get, post},
    Extension, Json, Router,
};
use uuid::Uuid;
use validator::Validate;

use crate::{
    dtos::escrowdtos::*,
    error::HttpError,
    service::error::ServiceError,
    utils::currency::{format_kobo_as_naira, naira_to_kobo},
    AppState,
};

pub fn payment_handler() -> Router {
    Router::new()
        .route("/fee-estimate", get(estimate_fee))
        .route("/verify/:reference", post(verify_payment))
        .route("/:payment_id/initiate", post(initiate_payment))
}

/// Starts the gateway payment for a service fee or escrow and keeps
/// verifying it in the background until it settles.
pub async fn initiate_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(payment_id): Path<Uuid>,
    Json(body): Json<InitiatePaymentDto>,
) -> Result<impl IntoResponse, HttpError> {
    body.validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let selection = app_state
        .flow
        .select_payment_method(payment_id, body.payment_method, &body.email)
        .await?;

    app_state
        .flow
        .spawn_confirmation(selection.attempt.reference.clone());

    Ok(Json(ApiResponse::success("Payment initiated", selection)))
}

/// Manual re-verification; same routine as webhooks and the poller.
pub async fn verify_payment(
    Extension(app_state): Extension<Arc<AppState>>,
    Path(reference): Path<String>,
) -> Result<impl IntoResponse, HttpError> {
    let confirmation = app_state.flow.confirm_payment(&reference).await?;
    Ok(Json(ApiResponse::success("Payment verification complete", confirmation)))
}

pub async fn estimate_fee(
    Extension(app_state): Extension<Arc<AppState>>,
    Query(query): Query<FeeEstimateQueryDto>,
) -> Result<impl IntoResponse, HttpError> {
    query
        .validate()
        .map_err(|e| HttpError::bad_request(e.to_string()))?;

    let amount = naira_to_kobo(query.amount);
    let fee = app_state
        .providers
        .estimate_fee(query.provider.as_deref(), amount, query.method)
        .map_err(ServiceError::from)?;

    let estimate = FeeEstimateDto {
        provider: query
            .provider
            .unwrap_or_else(|| app_state.providers.primary_name().to_string()),
        amount,
        fee,
        formatted_fee: format_kobo_as_naira(fee),
    };

    Ok(Json(ApiResponse::success("Fee estimated", estimate)))
}
