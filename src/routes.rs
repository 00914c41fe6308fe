// routes.rs
use std::sync::Arc;

use axum::{routing::get, Extension, Json, Router};
use serde_json::json;
use tower_http::trace::TraceLayer;

use crate::{
    handler::{
        escrow::{escrow_handler, milestone_handler},
        payment::payment_handler,
        request::{artisan_handler, request_handler},
        webhook::webhook_handler,
    },
    AppState,
};

async fn health_check() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "message": "Server is running"
    }))
}

pub fn create_router(app_state: Arc<AppState>) -> Router {
    let api_route = Router::new()
        .nest("/requests", request_handler())
        .nest("/artisans", artisan_handler())
        .nest("/payments", payment_handler())
        .nest("/escrow", escrow_handler())
        .nest("/milestones", milestone_handler())
        .nest("/webhooks", webhook_handler())
        .layer(TraceLayer::new_for_http())
        .layer(Extension(app_state));

    Router::new()
        .route("/health", get(health_check))
        .nest("/api", api_route)
}
