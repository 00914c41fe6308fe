// service/escrow_service.rs
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::store::{EngineStore, EscrowTransition, TransitionOutcome},
    models::{
        escrowmodel::*,
        paymentmodel::{generate_transaction_reference, AttemptStatus, PaymentTarget},
    },
    service::error::ServiceError,
};

/// Escrow together with its sub-ledger.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EscrowStatement {
    pub escrow: EscrowPayment,
    pub balance: EscrowBalance,
    pub entries: Vec<LedgerEntry>,
}

#[derive(Clone)]
pub struct EscrowService {
    store: Arc<dyn EngineStore>,
}

impl EscrowService {
    pub fn new(store: Arc<dyn EngineStore>) -> Self {
        Self { store }
    }

    pub async fn get_escrow(&self, escrow_id: Uuid) -> Result<EscrowPayment, ServiceError> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow", escrow_id))
    }

    /// `pending -> escrowed`, only for a reference the gateway confirmed for
    /// this escrow. Replaying the reference that funded it returns the
    /// escrow unchanged.
    pub async fn deposit(
        &self,
        escrow_id: Uuid,
        reference: &str,
    ) -> Result<EscrowPayment, ServiceError> {
        let escrow = self.get_escrow(escrow_id).await?;

        let attempt = self
            .store
            .get_attempt(reference)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", reference))?;

        if attempt.target != PaymentTarget::Escrow || attempt.target_id != escrow_id {
            return Err(ServiceError::Validation(format!(
                "Payment {} does not fund escrow {}",
                reference, escrow_id
            )));
        }
        if attempt.status != AttemptStatus::Succeeded {
            return Err(ServiceError::invalid_state(
                "Escrow",
                escrow.id,
                "awaiting payment confirmation",
                "deposit",
            ));
        }
        if attempt.amount < escrow.total_amount {
            return Err(ServiceError::PaymentDeclined {
                reference: reference.to_string(),
                reason: format!(
                    "paid {} but escrow requires {}",
                    attempt.amount, escrow.total_amount
                ),
            });
        }

        let outcome = self
            .store
            .transition_escrow(
                escrow_id,
                EscrowTransition::Deposit {
                    reference: reference.to_string(),
                },
            )
            .await?;

        match outcome {
            TransitionOutcome::Applied(escrow) => {
                tracing::info!(
                    "Escrow {} funded with {} (ref {})",
                    escrow.id,
                    escrow.total_amount,
                    reference
                );
                Ok(escrow)
            }
            TransitionOutcome::Rejected(current)
                if current.transaction_ref.as_deref() == Some(reference) =>
            {
                Ok(current)
            }
            TransitionOutcome::Rejected(current) => Err(ServiceError::invalid_state(
                "Escrow",
                current.id,
                current.status.to_str(),
                "deposit",
            )),
        }
    }

    /// Hands a payment back to the customer when it confirmed after the
    /// escrow was already funded by another reference. Returns the entries
    /// written; empty when the reference was already returned.
    pub async fn return_duplicate(
        &self,
        escrow_id: Uuid,
        reference: &str,
    ) -> Result<Vec<LedgerEntry>, ServiceError> {
        let attempt = self
            .store
            .get_attempt(reference)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", reference))?;
        if attempt.status != AttemptStatus::Succeeded {
            return Err(ServiceError::invalid_state(
                "Escrow",
                escrow_id,
                "awaiting payment confirmation",
                "return duplicate payment",
            ));
        }

        let entries = self
            .store
            .return_duplicate_payment(escrow_id, reference, attempt.amount)
            .await
            .map_err(|e| self.missing_or(e, escrow_id))?;
        if !entries.is_empty() {
            tracing::warn!(
                "Duplicate payment {} of {} returned to the customer of escrow {}",
                reference,
                attempt.amount,
                escrow_id
            );
        }
        Ok(entries)
    }

    /// `escrowed -> released`. Releasing an already released escrow returns
    /// the existing record and moves no funds.
    pub async fn release(
        &self,
        escrow_id: Uuid,
        approver_id: Uuid,
    ) -> Result<EscrowPayment, ServiceError> {
        let outcome = self
            .store
            .transition_escrow(
                escrow_id,
                EscrowTransition::Release {
                    approver_id,
                    reference: generate_transaction_reference("REL"),
                },
            )
            .await
            .map_err(|e| self.missing_or(e, escrow_id))?;

        match outcome {
            TransitionOutcome::Applied(escrow) => {
                tracing::info!(
                    "Escrow {} released by {}: artisan {}, commission {}",
                    escrow.id,
                    approver_id,
                    escrow.artisan_amount,
                    escrow.platform_fee
                );
                Ok(escrow)
            }
            TransitionOutcome::Rejected(current) if current.status == EscrowStatus::Released => {
                tracing::debug!("Escrow {} already released, nothing to do", current.id);
                Ok(current)
            }
            TransitionOutcome::Rejected(current) => Err(self.rejection(current, "release").await?),
        }
    }

    /// `escrowed -> refunded`: everything still held goes back to the
    /// customer. Repeating a refund returns the refunded record.
    pub async fn refund(&self, escrow_id: Uuid, reason: &str) -> Result<EscrowPayment, ServiceError> {
        let outcome = self
            .store
            .transition_escrow(
                escrow_id,
                EscrowTransition::Refund {
                    reason: reason.to_string(),
                    reference: generate_transaction_reference("RFD"),
                },
            )
            .await
            .map_err(|e| self.missing_or(e, escrow_id))?;

        match outcome {
            TransitionOutcome::Applied(escrow) => {
                tracing::info!("Escrow {} refunded: {}", escrow.id, reason);
                Ok(escrow)
            }
            TransitionOutcome::Rejected(current) if current.status == EscrowStatus::Refunded => {
                Ok(current)
            }
            TransitionOutcome::Rejected(current) => Err(self.rejection(current, "refund").await?),
        }
    }

    /// `escrowed -> disputed`. Freezes release and refund; resolution
    /// happens outside the engine.
    pub async fn dispute(&self, escrow_id: Uuid, reason: &str) -> Result<EscrowPayment, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::Validation(
                "A dispute needs a reason".to_string(),
            ));
        }

        let outcome = self
            .store
            .transition_escrow(
                escrow_id,
                EscrowTransition::Dispute {
                    reason: reason.to_string(),
                },
            )
            .await
            .map_err(|e| self.missing_or(e, escrow_id))?;

        match outcome {
            TransitionOutcome::Applied(escrow) => {
                tracing::warn!("Escrow {} disputed: {}", escrow.id, reason);
                Ok(escrow)
            }
            TransitionOutcome::Rejected(current) => Err(self.rejection(current, "dispute").await?),
        }
    }

    pub async fn entries(&self, escrow_id: Uuid) -> Result<Vec<LedgerEntry>, ServiceError> {
        Ok(self.store.ledger_entries(escrow_id).await?)
    }

    pub async fn statement(&self, escrow_id: Uuid) -> Result<EscrowStatement, ServiceError> {
        let escrow = self.get_escrow(escrow_id).await?;
        let entries = self.store.ledger_entries(escrow_id).await?;
        Ok(EscrowStatement {
            balance: EscrowBalance::from_entries(&entries),
            escrow,
            entries,
        })
    }

    fn missing_or(&self, error: sqlx::Error, escrow_id: Uuid) -> ServiceError {
        match error {
            sqlx::Error::RowNotFound => ServiceError::not_found("Escrow", escrow_id),
            other => ServiceError::Database(other),
        }
    }

    /// Maps a refused transition to the error that explains it.
    async fn rejection(
        &self,
        current: EscrowPayment,
        operation: &'static str,
    ) -> Result<ServiceError, ServiceError> {
        if current.status == EscrowStatus::Disputed {
            return Ok(ServiceError::DisputeActive(current.id));
        }
        if current.status == EscrowStatus::Escrowed {
            let plan = self.store.list_milestones(current.id).await?;
            if plan.iter().any(|m| m.status == MilestoneStatus::Disputed) {
                return Ok(ServiceError::DisputeActive(current.id));
            }
        }
        Ok(ServiceError::invalid_state(
            "Escrow",
            current.id,
            current.status.to_str(),
            operation,
        ))
    }
}


#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;
    use crate::db::{memory::seed::accepted_escrow, MemoryStore};

    #[tokio::test]
    async fn test_deposit_requires_confirmed_payment() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = accepted_escrow(&store, 15_000, 1_500).await;

        let err = service.deposit(escrow.id, "ESC_UNKNOWN").await.unwrap_err();
        assert!(matches!(err, ServiceError::NotFound { .. }));

        let short = succeeded_attempt(&store, &escrow, 10_000).await;
        let err = service.deposit(escrow.id, &short).await.unwrap_err();
        assert!(matches!(err, ServiceError::PaymentDeclined { .. }));
        assert_eq!(service.get_escrow(escrow.id).await.unwrap().status, EscrowStatus::Pending);
    }

    #[tokio::test]
    async fn test_deposit_on_escrowed_is_invalid_state() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        // replaying the funding reference is harmless
        let replay = service
            .deposit(escrow.id, escrow.transaction_ref.as_deref().unwrap())
            .await
            .unwrap();
        assert_eq!(replay, escrow);

        let second = succeeded_attempt(&store, &escrow, 15_000).await;
        let err = service.deposit(escrow.id, &second).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));
        assert_eq!(service.entries(escrow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_duplicate_payment_is_returned_once() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        let second = succeeded_attempt(&store, &escrow, 15_000).await;
        let returned = service.return_duplicate(escrow.id, &second).await.unwrap();
        assert_eq!(returned.len(), 2);
        assert!(service.return_duplicate(escrow.id, &second).await.unwrap().is_empty());

        let statement = service.statement(escrow.id).await.unwrap();
        assert_eq!(statement.escrow.status, EscrowStatus::Escrowed);
        assert_eq!(statement.balance.refunded, 15_000);
        assert_eq!(statement.balance.held(), 15_000);

        // the funding reference still releases the full escrow
        service.release(escrow.id, Uuid::new_v4()).await.unwrap();
        let statement = service.statement(escrow.id).await.unwrap();
        assert_eq!(statement.balance.paid_to_artisan, 13_500);
        assert_eq!(statement.balance.held(), 0);
    }

    #[tokio::test]
    async fn test_double_release_moves_funds_once() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;
        let approver = Uuid::new_v4();

        let first = service.release(escrow.id, approver).await.unwrap();
        let second = service.release(escrow.id, approver).await.unwrap();

        assert_eq!(first.status, EscrowStatus::Released);
        assert_eq!(first, second);

        let statement = service.statement(escrow.id).await.unwrap();
        assert_eq!(statement.entries.len(), 3);
        assert_eq!(statement.balance.paid_to_artisan, 13_500);
        assert_eq!(statement.balance.commission_collected, 1_500);
        assert_eq!(statement.balance.held(), 0);
    }

    #[tokio::test]
    async fn test_released_escrow_cannot_be_refunded() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        service.release(escrow.id, Uuid::new_v4()).await.unwrap();
        let err = service.refund(escrow.id, "changed my mind").await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_dispute_freezes_release_and_refund() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        service.dispute(escrow.id, "work not done").await.unwrap();

        let release = service.release(escrow.id, Uuid::new_v4()).await.unwrap_err();
        let refund = service.refund(escrow.id, "cancel").await.unwrap_err();
        assert!(matches!(release, ServiceError::DisputeActive(id) if id == escrow.id));
        assert!(matches!(refund, ServiceError::DisputeActive(_)));
        assert_eq!(service.entries(escrow.id).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_refund_returns_everything_held() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        let refunded = service.refund(escrow.id, "artisan unavailable").await.unwrap();
        assert_eq!(refunded.status, EscrowStatus::Refunded);
        assert_eq!(refunded.status_reason.as_deref(), Some("artisan unavailable"));

        let statement = service.statement(escrow.id).await.unwrap();
        assert_eq!(statement.balance.refunded, 15_000);
        assert_eq!(statement.balance.held(), 0);
    }

    #[tokio::test]
    async fn test_concurrent_release_and_dispute_apply_exactly_one() {
        let store = Arc::new(MemoryStore::new());
        let service = EscrowService::new(store.clone());
        let escrow = funded_escrow(&store, 15_000, 1_500).await;

        let releaser = service.clone();
        let disputer = service.clone();
        let id = escrow.id;
        let (release, dispute) = tokio::join!(
            tokio::spawn(async move { releaser.release(id, Uuid::new_v4()).await }),
            tokio::spawn(async move { disputer.dispute(id, "quality").await }),
        );
        let release = release.unwrap();
        let dispute = dispute.unwrap();

        assert!(release.is_ok() != dispute.is_ok());

        let statement = service.statement(escrow.id).await.unwrap();
        match statement.escrow.status {
            EscrowStatus::Released => assert_eq!(statement.balance.held(), 0),
            EscrowStatus::Disputed => assert_eq!(statement.balance.held(), 15_000),
            other => panic!("unexpected status {:?}", other),
        }
    }
}
