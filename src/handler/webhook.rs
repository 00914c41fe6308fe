// handler/webhook.rs
use std::sync::Arc;

use axum::{
    body::Bytes,
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    routing::post,
    Extension, Json, Router,
};
use hmac::{Hmac, Mac};
use serde_json::Value;
use sha2::Sha512;
use subtle::ConstantTimeEq;

use crate::{error::HttpError, service::error::ServiceError, AppState};

pub fn webhook_handler() -> Router {
    Router::new()
        .route("/paystack", post(paystack_webhook))
        .route("/flutterwave", post(flutterwave_webhook))
}

pub async fn paystack_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let signature = headers
        .get("x-paystack-signature")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::bad_request("Missing or invalid Paystack signature"))?;

    if !verify_paystack_signature(&body, signature, &app_state.env.paystack_secret_key) {
        tracing::warn!("Invalid Paystack webhook signature received");
        return Err(HttpError::unauthorized("Invalid webhook signature"));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("Invalid webhook payload: {}", e)))?;
    let event_type = payload["event"]
        .as_str()
        .ok_or_else(|| HttpError::bad_request("Missing event type in webhook payload"))?;

    match event_type {
        "charge.success" | "charge.failed" => {
            let reference = payload["data"]["reference"]
                .as_str()
                .ok_or_else(|| HttpError::bad_request("Missing reference in webhook data"))?;
            confirm_from_webhook(&app_state, "paystack", reference).await?;
        }
        _ => tracing::info!("Unhandled Paystack webhook event: {}", event_type),
    }

    Ok(Json(serde_json::json!({"status": "success"})))
}

pub async fn flutterwave_webhook(
    Extension(app_state): Extension<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<impl IntoResponse, HttpError> {
    let signature = headers
        .get("verif-hash")
        .and_then(|h| h.to_str().ok())
        .ok_or_else(|| HttpError::bad_request("Missing or invalid Flutterwave signature"))?;

    if !verify_flutterwave_hash(signature, &app_state.env.flutterwave_webhook_hash) {
        tracing::warn!("Invalid Flutterwave webhook signature received");
        return Err(HttpError::unauthorized("Invalid webhook signature"));
    }

    let payload: Value = serde_json::from_slice(&body)
        .map_err(|e| HttpError::bad_request(format!("Invalid webhook payload: {}", e)))?;
    let event_type = payload["event"]
        .as_str()
        .ok_or_else(|| HttpError::bad_request("Missing event type in webhook payload"))?;

    match event_type {
        "charge.completed" => {
            let reference = payload["data"]["tx_ref"]
                .as_str()
                .ok_or_else(|| HttpError::bad_request("Missing tx_ref in webhook data"))?;
            confirm_from_webhook(&app_state, "flutterwave", reference).await?;
        }
        _ => tracing::info!("Unhandled Flutterwave webhook event: {}", event_type),
    }

    Ok(Json(serde_json::json!({"status": "success"})))
}

/// Webhook payloads are treated as a hint only: the gateway is re-queried
/// through the shared confirmation routine. Unknown references are
/// acknowledged so the provider stops retrying.
async fn confirm_from_webhook(
    app_state: &AppState,
    provider: &str,
    reference: &str,
) -> Result<(), HttpError> {
    match app_state.flow.confirm_payment(reference).await {
        Ok(confirmation) => {
            tracing::info!(
                "{} webhook for {}: attempt is {:?}",
                provider,
                reference,
                confirmation.attempt().status
            );
            Ok(())
        }
        Err(ServiceError::NotFound { .. }) => {
            tracing::warn!("{} webhook for unknown reference {}", provider, reference);
            Ok(())
        }
        Err(e) if e.is_retryable() => Err(HttpError::new(e.to_string(), StatusCode::SERVICE_UNAVAILABLE)),
        Err(e) => {
            tracing::error!("{} webhook for {} could not be applied: {}", provider, reference, e);
            Ok(())
        }
    }
}

fn verify_paystack_signature(payload: &[u8], signature: &str, secret: &str) -> bool {
    let Ok(mut mac) = Hmac::<Sha512>::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(payload);

    let expected_signature_hex = hex::encode(mac.finalize().into_bytes());

    ConstantTimeEq::ct_eq(
        signature.as_bytes(),
        expected_signature_hex.as_bytes(),
    )
    .into()
}

fn verify_flutterwave_hash(received: &str, configured: &str) -> bool {
    !configured.is_empty() && bool::from(received.as_bytes().ct_eq(configured.as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(payload: &[u8], secret: &str) -> String {
        let mut mac = Hmac::<Sha512>::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(payload);
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn test_paystack_signature_over_raw_body() {
        let body = br#"{"event":"charge.success","data":{"reference":"SVC_ABC"}}"#;
        let signature = sign(body, "sk_test_secret");

        assert!(verify_paystack_signature(body, &signature, "sk_test_secret"));
        assert!(!verify_paystack_signature(body, &signature, "another_secret"));
        assert!(!verify_paystack_signature(b"{}", &signature, "sk_test_secret"));
        assert!(!verify_paystack_signature(body, "deadbeef", "sk_test_secret"));
    }

    #[test]
    fn test_flutterwave_hash_must_match() {
        assert!(verify_flutterwave_hash("my-hash", "my-hash"));
        assert!(!verify_flutterwave_hash("my-hash", "other"));
        assert!(!verify_flutterwave_hash("", ""));
    }
}
