// db/memory.rs
use std::{collections::HashMap, sync::Arc};

use async_trait::async_trait;
use chrono::{Duration, Utc};
use sqlx::Error;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use super::store::*;
use crate::models::{escrowmodel::*, paymentmodel::*};

/// Everything that belongs to one escrow. Guarded by its own mutex so
/// mutations on one escrow are serialized while different escrows proceed
/// independently.
#[derive(Debug)]
struct EscrowBook {
    escrow: EscrowPayment,
    entries: Vec<LedgerEntry>,
    milestones: Vec<EscrowMilestone>,
    evidence: Vec<MilestoneEvidence>,
}

/// In-process store used when no database is configured and by the tests.
#[derive(Debug, Default)]
pub struct MemoryStore {
    requests: RwLock<HashMap<Uuid, ServiceRequest>>,
    quotes: RwLock<HashMap<Uuid, Quote>>,
    fees: RwLock<HashMap<Uuid, ServiceFeePayment>>,
    escrows: RwLock<HashMap<Uuid, Arc<Mutex<EscrowBook>>>>,
    escrow_by_request: RwLock<HashMap<Uuid, Uuid>>,
    escrow_by_milestone: RwLock<HashMap<Uuid, Uuid>>,
    attempts: RwLock<HashMap<String, PaymentAttempt>>,
    contacts: RwLock<HashMap<Uuid, ArtisanContact>>,
    reveals: RwLock<HashMap<Uuid, ContactReveal>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    async fn book(&self, escrow_id: Uuid) -> Option<Arc<Mutex<EscrowBook>>> {
        self.escrows.read().await.get(&escrow_id).cloned()
    }

    async fn book_for_milestone(&self, milestone_id: Uuid) -> Option<Arc<Mutex<EscrowBook>>> {
        let escrow_id = *self.escrow_by_milestone.read().await.get(&milestone_id)?;
        self.book(escrow_id).await
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn save_request(&self, request: ServiceRequest) -> Result<ServiceRequest, Error> {
        self.requests
            .write()
            .await
            .insert(request.id, request.clone());
        Ok(request)
    }

    async fn get_request(&self, request_id: Uuid) -> Result<Option<ServiceRequest>, Error> {
        Ok(self.requests.read().await.get(&request_id).cloned())
    }

    async fn save_quote(&self, quote: Quote) -> Result<Quote, Error> {
        self.quotes.write().await.insert(quote.id, quote.clone());
        Ok(quote)
    }

    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, Error> {
        Ok(self.quotes.read().await.get(&quote_id).cloned())
    }

    async fn update_request_status(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error> {
        let mut requests = self.requests.write().await;
        let request = requests.get_mut(&request_id).ok_or(Error::RowNotFound)?;

        if !from.contains(&request.status) {
            return Ok(TransitionOutcome::Rejected(request.clone()));
        }
        request.status = to;
        Ok(TransitionOutcome::Applied(request.clone()))
    }

    async fn accept_quote(
        &self,
        acceptance: QuoteAcceptance,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error> {
        let mut requests = self.requests.write().await;
        let request = requests
            .get_mut(&acceptance.request_id)
            .ok_or(Error::RowNotFound)?;

        if request.status != RequestStatus::Open {
            return Ok(TransitionOutcome::Rejected(request.clone()));
        }

        let mut quotes = self.quotes.write().await;
        let quote = quotes
            .get_mut(&acceptance.quote_id)
            .ok_or(Error::RowNotFound)?;
        quote.accepted_at = Some(acceptance.accepted_at);

        request.status = RequestStatus::QuoteAccepted;

        let escrow = acceptance.escrow;
        self.fees
            .write()
            .await
            .insert(acceptance.service_fee.id, acceptance.service_fee);
        self.escrow_by_request
            .write()
            .await
            .insert(escrow.request_id, escrow.id);
        self.escrows.write().await.insert(
            escrow.id,
            Arc::new(Mutex::new(EscrowBook {
                escrow,
                entries: Vec::new(),
                milestones: Vec::new(),
                evidence: Vec::new(),
            })),
        );

        Ok(TransitionOutcome::Applied(request.clone()))
    }

    async fn get_service_fee(&self, fee_id: Uuid) -> Result<Option<ServiceFeePayment>, Error> {
        Ok(self.fees.read().await.get(&fee_id).cloned())
    }

    async fn get_service_fee_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ServiceFeePayment>, Error> {
        Ok(self
            .fees
            .read()
            .await
            .values()
            .find(|fee| fee.request_id == request_id)
            .cloned())
    }

    async fn transition_service_fee(
        &self,
        fee_id: Uuid,
        transition: FeeTransition,
    ) -> Result<TransitionOutcome<ServiceFeePayment>, Error> {
        let mut fees = self.fees.write().await;
        let fee = fees.get_mut(&fee_id).ok_or(Error::RowNotFound)?;

        if !transition.allowed_from(fee.status) {
            return Ok(TransitionOutcome::Rejected(fee.clone()));
        }
        transition.apply(fee, Utc::now());
        Ok(TransitionOutcome::Applied(fee.clone()))
    }

    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<PaymentAttempt, Error> {
        let mut attempts = self.attempts.write().await;
        if attempts.contains_key(&attempt.reference) {
            return Err(Error::Protocol(format!(
                "duplicate payment reference {}",
                attempt.reference
            )));
        }
        attempts.insert(attempt.reference.clone(), attempt.clone());
        Ok(attempt)
    }

    async fn get_attempt(&self, reference: &str) -> Result<Option<PaymentAttempt>, Error> {
        Ok(self.attempts.read().await.get(reference).cloned())
    }

    async fn list_attempts_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Vec<PaymentAttempt>, Error> {
        let mut attempts: Vec<PaymentAttempt> = self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.request_id == request_id)
            .cloned()
            .collect();
        attempts.sort_by_key(|a| a.created_at);
        Ok(attempts)
    }

    async fn settle_attempt(
        &self,
        reference: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<TransitionOutcome<PaymentAttempt>, Error> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts.get_mut(reference).ok_or(Error::RowNotFound)?;

        if attempt.status != AttemptStatus::Initiated {
            return Ok(TransitionOutcome::Rejected(attempt.clone()));
        }
        attempt.status = status;
        attempt.failure_reason = failure_reason;
        attempt.settled_at = Some(Utc::now());
        Ok(TransitionOutcome::Applied(attempt.clone()))
    }

    async fn mark_attempt_applied(&self, reference: &str) -> Result<PaymentAttempt, Error> {
        let mut attempts = self.attempts.write().await;
        let attempt = attempts
            .get_mut(reference)
            .filter(|a| a.status != AttemptStatus::Initiated)
            .ok_or(Error::RowNotFound)?;
        attempt.applied_at.get_or_insert_with(Utc::now);
        Ok(attempt.clone())
    }

    async fn list_stale_attempts(&self, older_than: Duration) -> Result<Vec<PaymentAttempt>, Error> {
        let cutoff = Utc::now() - older_than;
        Ok(self
            .attempts
            .read()
            .await
            .values()
            .filter(|a| a.applied_at.is_none() && a.created_at <= cutoff)
            .cloned()
            .collect())
    }

    async fn save_artisan_contact(&self, contact: ArtisanContact) -> Result<ArtisanContact, Error> {
        self.contacts
            .write()
            .await
            .insert(contact.artisan_id, contact.clone());
        Ok(contact)
    }

    async fn get_artisan_contact(&self, artisan_id: Uuid) -> Result<Option<ArtisanContact>, Error> {
        Ok(self.contacts.read().await.get(&artisan_id).cloned())
    }

    async fn record_contact_reveal(&self, reveal: ContactReveal) -> Result<ContactReveal, Error> {
        let mut reveals = self.reveals.write().await;
        Ok(reveals.entry(reveal.request_id).or_insert(reveal).clone())
    }

    async fn get_contact_reveal(&self, request_id: Uuid) -> Result<Option<ContactReveal>, Error> {
        Ok(self.reveals.read().await.get(&request_id).cloned())
    }
}

#[async_trait]
impl EscrowStore for MemoryStore {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowPayment>, Error> {
        match self.book(escrow_id).await {
            Some(book) => Ok(Some(book.lock().await.escrow.clone())),
            None => Ok(None),
        }
    }

    async fn get_escrow_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<EscrowPayment>, Error> {
        let escrow_id = self.escrow_by_request.read().await.get(&request_id).copied();
        match escrow_id {
            Some(id) => self.get_escrow(id).await,
            None => Ok(None),
        }
    }

    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        transition: EscrowTransition,
    ) -> Result<TransitionOutcome<EscrowPayment>, Error> {
        let book = self.book(escrow_id).await.ok_or(Error::RowNotFound)?;
        let mut book = book.lock().await;

        let milestone_disputed = book
            .milestones
            .iter()
            .any(|m| m.status == MilestoneStatus::Disputed);
        if !book.escrow.status.can_transition_to(transition.target())
            || (milestone_disputed && transition.blocked_by_milestone_dispute())
        {
            return Ok(TransitionOutcome::Rejected(book.escrow.clone()));
        }

        let now = Utc::now();
        let entries = transition.entries(&book.escrow, &book.entries, now);
        transition.apply(&mut book.escrow, now);
        book.entries.extend(entries);
        Ok(TransitionOutcome::Applied(book.escrow.clone()))
    }

    async fn ledger_entries(&self, escrow_id: Uuid) -> Result<Vec<LedgerEntry>, Error> {
        match self.book(escrow_id).await {
            Some(book) => Ok(book.lock().await.entries.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn return_duplicate_payment(
        &self,
        escrow_id: Uuid,
        reference: &str,
        amount: i64,
    ) -> Result<Vec<LedgerEntry>, Error> {
        let book = self.book(escrow_id).await.ok_or(Error::RowNotFound)?;
        let mut book = book.lock().await;

        let entries = duplicate_payment_entries(&book.escrow, &book.entries, reference, amount, Utc::now());
        book.entries.extend(entries.iter().cloned());
        Ok(entries)
    }
}

#[async_trait]
impl MilestoneStore for MemoryStore {
    async fn insert_plan(
        &self,
        escrow_id: Uuid,
        plan: Vec<EscrowMilestone>,
    ) -> Result<TransitionOutcome<Vec<EscrowMilestone>>, Error> {
        let book = self.book(escrow_id).await.ok_or(Error::RowNotFound)?;
        let mut book = book.lock().await;

        if book.escrow.status != EscrowStatus::Escrowed || !book.milestones.is_empty() {
            return Ok(TransitionOutcome::Rejected(book.milestones.clone()));
        }

        let mut index = self.escrow_by_milestone.write().await;
        for milestone in &plan {
            index.insert(milestone.id, escrow_id);
        }
        book.milestones = plan.clone();
        book.milestones.sort_by_key(|m| m.sequence);
        Ok(TransitionOutcome::Applied(book.milestones.clone()))
    }

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowMilestone>, Error> {
        let Some(book) = self.book_for_milestone(milestone_id).await else {
            return Ok(None);
        };
        let book = book.lock().await;
        Ok(book.milestones.iter().find(|m| m.id == milestone_id).cloned())
    }

    async fn list_milestones(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error> {
        match self.book(escrow_id).await {
            Some(book) => Ok(book.lock().await.milestones.clone()),
            None => Ok(Vec::new()),
        }
    }

    async fn transition_milestone(
        &self,
        milestone_id: Uuid,
        transition: MilestoneTransition,
    ) -> Result<TransitionOutcome<MilestoneChange>, Error> {
        let book = self
            .book_for_milestone(milestone_id)
            .await
            .ok_or(Error::RowNotFound)?;
        let mut guard = book.lock().await;
        let book = &mut *guard;

        let index = book
            .milestones
            .iter()
            .position(|m| m.id == milestone_id)
            .ok_or(Error::RowNotFound)?;

        let outcome = apply_milestone_transition(
            &mut book.escrow,
            &mut book.milestones,
            index,
            &book.entries,
            &transition,
            Utc::now(),
        );

        if let TransitionOutcome::Applied(change) = &outcome {
            book.entries.extend(change.entries.iter().cloned());
            if matches!(transition, MilestoneTransition::Release { .. }) {
                for evidence in book
                    .evidence
                    .iter_mut()
                    .filter(|e| e.milestone_id == milestone_id)
                {
                    evidence.approved = true;
                }
            }
        }
        Ok(outcome)
    }

    async fn reconcile_readiness(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error> {
        let book = self.book(escrow_id).await.ok_or(Error::RowNotFound)?;
        let mut book = book.lock().await;

        if book.escrow.status != EscrowStatus::Escrowed {
            return Ok(Vec::new());
        }

        let ready = milestones_to_activate(&book.milestones);
        let mut activated = Vec::new();
        for milestone in book.milestones.iter_mut().filter(|m| ready.contains(&m.id)) {
            milestone.status = MilestoneStatus::Ready;
            activated.push(milestone.clone());
        }
        Ok(activated)
    }

    async fn escrows_with_pending_milestones(&self) -> Result<Vec<Uuid>, Error> {
        let books: Vec<Arc<Mutex<EscrowBook>>> =
            self.escrows.read().await.values().cloned().collect();

        let mut ids = Vec::new();
        for book in books {
            let book = book.lock().await;
            if book
                .milestones
                .iter()
                .any(|m| m.status == MilestoneStatus::Pending)
            {
                ids.push(book.escrow.id);
            }
        }
        Ok(ids)
    }

    async fn add_evidence(&self, evidence: MilestoneEvidence) -> Result<MilestoneEvidence, Error> {
        let book = self
            .book_for_milestone(evidence.milestone_id)
            .await
            .ok_or(Error::RowNotFound)?;
        book.lock().await.evidence.push(evidence.clone());
        Ok(evidence)
    }

    async fn list_evidence(&self, milestone_id: Uuid) -> Result<Vec<MilestoneEvidence>, Error> {
        let Some(book) = self.book_for_milestone(milestone_id).await else {
            return Ok(Vec::new());
        };
        let book = book.lock().await;
        Ok(book
            .evidence
            .iter()
            .filter(|e| e.milestone_id == milestone_id)
            .cloned()
            .collect())
    }
}


#[cfg(test)]
mod tests {
    use super::seed::*;
    use super::*;
    use crate::models::escrowmodel::fixtures::milestone;

    fn deposit(reference: &str) -> EscrowTransition {
        EscrowTransition::Deposit {
            reference: reference.to_string(),
        }
    }

    #[tokio::test]
    async fn test_deposit_writes_entry_once() {
        let store = MemoryStore::new();
        let escrow = accepted_escrow(&store, 15_000, 1_500).await;

        let first = store.transition_escrow(escrow.id, deposit("ESC_1")).await.unwrap();
        let second = store.transition_escrow(escrow.id, deposit("ESC_1")).await.unwrap();

        assert!(first.is_applied());
        assert!(!second.is_applied());
        let entries = store.ledger_entries(escrow.id).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, LedgerEntryKind::EscrowDeposit);
        assert_eq!(entries[0].amount, 15_000);
    }

    #[tokio::test]
    async fn test_second_acceptance_is_rejected() {
        let store = MemoryStore::new();
        let escrow = accepted_escrow(&store, 15_000, 1_500).await;
        let request = store.get_request(escrow.request_id).await.unwrap().unwrap();
        assert_eq!(request.status, RequestStatus::QuoteAccepted);

        let outcome = store
            .update_request_status(request.id, &[RequestStatus::Open], RequestStatus::QuoteAccepted)
            .await
            .unwrap();
        assert!(!outcome.is_applied());
    }

    #[tokio::test]
    async fn test_plan_is_inserted_once() {
        let store = MemoryStore::new();
        let escrow = accepted_escrow(&store, 100_000, 10_000).await;
        let plan = vec![milestone(escrow.id, 1, 100_000, MilestoneStatus::Ready, vec![])];

        // not escrowed yet
        assert!(!store.insert_plan(escrow.id, plan.clone()).await.unwrap().is_applied());

        store.transition_escrow(escrow.id, deposit("ESC_2")).await.unwrap();
        assert!(store.insert_plan(escrow.id, plan.clone()).await.unwrap().is_applied());

        let again = vec![milestone(escrow.id, 1, 100_000, MilestoneStatus::Ready, vec![])];
        let outcome = store.insert_plan(escrow.id, again).await.unwrap();
        assert!(!outcome.is_applied());
        assert_eq!(outcome.into_inner()[0].id, plan[0].id);
    }

    #[tokio::test]
    async fn test_reveal_keeps_first_timestamp() {
        let store = MemoryStore::new();
        let request_id = Uuid::new_v4();
        let artisan_id = Uuid::new_v4();
        let first = ContactReveal {
            request_id,
            artisan_id,
            revealed_at: Utc::now() - Duration::minutes(5),
        };
        store.record_contact_reveal(first.clone()).await.unwrap();
        let kept = store
            .record_contact_reveal(ContactReveal {
                revealed_at: Utc::now(),
                ..first.clone()
            })
            .await
            .unwrap();
        assert_eq!(kept, first);
    }

    #[tokio::test]
    async fn test_attempt_settles_once() {
        let store = MemoryStore::new();
        let attempt = PaymentAttempt {
            reference: "SVC_X".to_string(),
            request_id: Uuid::new_v4(),
            target: PaymentTarget::ServiceFee,
            target_id: Uuid::new_v4(),
            provider: "paystack".to_string(),
            method: PaymentMethod::Card,
            amount: 200_000,
            status: AttemptStatus::Initiated,
            failure_reason: None,
            created_at: Utc::now(),
            settled_at: None,
            applied_at: None,
        };
        store.insert_attempt(attempt.clone()).await.unwrap();
        assert!(store.insert_attempt(attempt).await.is_err());

        let settled = store
            .settle_attempt("SVC_X", AttemptStatus::Succeeded, None)
            .await
            .unwrap();
        assert!(settled.is_applied());
        let replay = store
            .settle_attempt("SVC_X", AttemptStatus::Failed, Some("late".to_string()))
            .await
            .unwrap();
        assert_eq!(replay.into_inner().status, AttemptStatus::Succeeded);

        let applied = store.mark_attempt_applied("SVC_X").await.unwrap();
        let stamp = applied.applied_at.unwrap();
        let again = store.mark_attempt_applied("SVC_X").await.unwrap();
        assert_eq!(again.applied_at, Some(stamp));
        assert!(store
            .list_stale_attempts(Duration::zero())
            .await
            .unwrap()
            .is_empty());
    }
}
