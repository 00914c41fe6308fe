use axum::http::StatusCode;
use thiserror::Error;
use uuid::Uuid;

use crate::{
    error::HttpError,
    models::{
        escrowmodel::{EscrowStatus, EvidenceKind},
        paymentmodel::FeePaymentStatus,
    },
    service::{milestone_planner::PlanRule, payment_provider::GatewayError},
};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("Milestone plan rejected by rule '{rule}': {detail}")]
    PlanRejected { rule: PlanRule, detail: String },

    #[error("{entity} {id} is {state}; cannot {operation}")]
    InvalidState {
        entity: &'static str,
        id: Uuid,
        state: String,
        operation: &'static str,
    },

    #[error("Payment {reference} was declined: {reason}")]
    PaymentDeclined { reference: String, reason: String },

    #[error("Payment {reference} not confirmed after {attempts} verification attempts")]
    VerificationTimeout { reference: String, attempts: u32 },

    #[error("Payments for request {request_id} are incomplete (service fee: {service_fee:?}, escrow: {escrow:?})")]
    PaymentIncomplete {
        request_id: Uuid,
        service_fee: Option<FeePaymentStatus>,
        escrow: Option<EscrowStatus>,
    },

    #[error("Milestone {milestone_id} is missing evidence: {missing:?}")]
    EvidenceIncomplete {
        milestone_id: Uuid,
        missing: Vec<EvidenceKind>,
    },

    #[error("Escrow {0} is under dispute")]
    DisputeActive(Uuid),

    #[error("{entity} {id} not found")]
    NotFound { entity: &'static str, id: String },

    #[error("Payment gateway error: {0}")]
    Gateway(#[from] GatewayError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Other error: {0}")]
    Other(String),
}

impl ServiceError {
    pub fn invalid_state(
        entity: &'static str,
        id: Uuid,
        state: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        ServiceError::InvalidState {
            entity,
            id,
            state: state.into(),
            operation,
        }
    }

    pub fn not_found(entity: &'static str, id: impl ToString) -> Self {
        ServiceError::NotFound {
            entity,
            id: id.to_string(),
        }
    }

    /// Whether the caller may retry the same operation later and expect a
    /// different outcome without changing its input.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            ServiceError::PaymentDeclined { .. }
                | ServiceError::VerificationTimeout { .. }
                | ServiceError::PaymentIncomplete { .. }
                | ServiceError::Gateway(_)
                | ServiceError::Database(_)
        )
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::Validation(_) | ServiceError::PlanRejected { .. } => {
                StatusCode::UNPROCESSABLE_ENTITY
            }

            ServiceError::InvalidState { .. }
            | ServiceError::DisputeActive(_)
            | ServiceError::EvidenceIncomplete { .. } => StatusCode::CONFLICT,

            ServiceError::PaymentDeclined { .. } | ServiceError::PaymentIncomplete { .. } => {
                StatusCode::PAYMENT_REQUIRED
            }

            ServiceError::VerificationTimeout { .. } => StatusCode::GATEWAY_TIMEOUT,

            ServiceError::NotFound { .. } => StatusCode::NOT_FOUND,

            ServiceError::Gateway(_) => StatusCode::BAD_GATEWAY,

            ServiceError::Database(_) | ServiceError::Other(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<ServiceError> for HttpError {
    fn from(error: ServiceError) -> Self {
        let status = error.status_code();
        if status.is_server_error() {
            tracing::error!("Service failure: {}", error);
        }
        HttpError::new(error.to_string(), status)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_is_distinct_from_decline() {
        let timeout = ServiceError::VerificationTimeout {
            reference: "ESC_1".to_string(),
            attempts: 30,
        };
        let declined = ServiceError::PaymentDeclined {
            reference: "ESC_1".to_string(),
            reason: "insufficient funds".to_string(),
        };

        assert_eq!(timeout.status_code(), StatusCode::GATEWAY_TIMEOUT);
        assert_eq!(declined.status_code(), StatusCode::PAYMENT_REQUIRED);
        assert!(timeout.is_retryable());
        assert!(declined.is_retryable());
    }

    #[test]
    fn test_invalid_state_is_not_retryable() {
        let err = ServiceError::invalid_state("Escrow", Uuid::new_v4(), "escrowed", "deposit");
        assert!(!err.is_retryable());
        assert_eq!(err.status_code(), StatusCode::CONFLICT);
        assert!(err.to_string().contains("cannot deposit"));
    }
}
