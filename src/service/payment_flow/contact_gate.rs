// service/payment_flow/contact_gate.rs
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use crate::{
    db::store::EngineStore,
    models::{
        escrowmodel::EscrowStatus,
        paymentmodel::{ArtisanContactInfo, ContactReveal, FeePaymentStatus, RequestStatus},
    },
    service::error::ServiceError,
};

/// Hands out artisan contact details only while the service fee is paid and
/// the job amount sits in escrow, and never for a cancelled request. These
/// facts are read from storage on every call; the reveal record is an audit
/// trail and never feeds back into the check.
#[derive(Clone)]
pub(super) struct ContactRevealGate {
    store: Arc<dyn EngineStore>,
}

impl ContactRevealGate {
    pub(super) fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    pub(super) async fn ensure_paid(&self, request_id: Uuid) -> Result<(), ServiceError> {
        let fee = self.store.get_service_fee_for_request(request_id).await?;
        let escrow = self.store.get_escrow_for_request(request_id).await?;

        let fee_status = fee.map(|f| f.status);
        let escrow_status = escrow.map(|e| e.status);

        if fee_status == Some(FeePaymentStatus::Paid) && escrow_status == Some(EscrowStatus::Escrowed) {
            return Ok(());
        }

        Err(ServiceError::PaymentIncomplete {
            request_id,
            service_fee: fee_status,
            escrow: escrow_status,
        })
    }

    pub(super) async fn reveal(&self, request_id: Uuid) -> Result<ArtisanContactInfo, ServiceError> {
        let request = self
            .store
            .get_request(request_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Request", request_id))?;

        if request.status == RequestStatus::Cancelled {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "reveal contact",
            ));
        }
        self.ensure_paid(request_id).await?;

        let contact = self
            .store
            .get_artisan_contact(request.artisan_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Artisan contact", request.artisan_id))?;

        let reveal = self
            .store
            .record_contact_reveal(ContactReveal {
                request_id,
                artisan_id: request.artisan_id,
                revealed_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            "Contact of artisan {} revealed for request {}",
            request.artisan_id,
            request_id
        );

        Ok(ArtisanContactInfo {
            artisan_id: contact.artisan_id,
            full_name: contact.full_name,
            phone: contact.phone,
            email: contact.email,
            address: contact.address,
            is_revealed: true,
            revealed_at: reveal.revealed_at,
        })
    }
}
