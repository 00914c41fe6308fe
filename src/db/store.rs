// db/store.rs
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::Error;
use uuid::Uuid;

use crate::models::{
    escrowmodel::*,
    paymentmodel::*,
};

/// Result of a guarded state change. `Rejected` carries the record as it is
/// now so the caller can report the real state or treat the call as a replay.
#[derive(Debug, Clone, PartialEq)]
pub enum TransitionOutcome<T> {
    Applied(T),
    Rejected(T),
}

impl<T> TransitionOutcome<T> {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied(_))
    }

    pub fn into_inner(self) -> T {
        match self {
            TransitionOutcome::Applied(value) | TransitionOutcome::Rejected(value) => value,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FeeTransition {
    /// A (new) gateway attempt was started. Clears an earlier failure.
    Initiate { reference: String },
    Paid { reference: String },
    Failed { reference: String },
}

impl FeeTransition {
    pub fn allowed_from(&self, status: FeePaymentStatus) -> bool {
        match self {
            FeeTransition::Initiate { .. } => {
                matches!(status, FeePaymentStatus::Pending | FeePaymentStatus::Failed)
            }
            // a confirmed payment lands even after an earlier attempt failed
            FeeTransition::Paid { .. } => {
                matches!(status, FeePaymentStatus::Pending | FeePaymentStatus::Failed)
            }
            FeeTransition::Failed { .. } => status == FeePaymentStatus::Pending,
        }
    }

    pub fn apply(&self, fee: &mut ServiceFeePayment, at: DateTime<Utc>) {
        match self {
            FeeTransition::Initiate { reference } => {
                fee.status = FeePaymentStatus::Pending;
                fee.transaction_ref = Some(reference.clone());
            }
            FeeTransition::Paid { reference } => {
                fee.status = FeePaymentStatus::Paid;
                fee.transaction_ref = Some(reference.clone());
                fee.paid_at = Some(at);
            }
            FeeTransition::Failed { reference } => {
                fee.status = FeePaymentStatus::Failed;
                fee.transaction_ref = Some(reference.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum EscrowTransition {
    Deposit { reference: String },
    Release { approver_id: Uuid, reference: String },
    Refund { reason: String, reference: String },
    Dispute { reason: String },
}

impl EscrowTransition {
    pub fn target(&self) -> EscrowStatus {
        match self {
            EscrowTransition::Deposit { .. } => EscrowStatus::Escrowed,
            EscrowTransition::Release { .. } => EscrowStatus::Released,
            EscrowTransition::Refund { .. } => EscrowStatus::Refunded,
            EscrowTransition::Dispute { .. } => EscrowStatus::Disputed,
        }
    }

    /// Release and refund wait while any milestone of the escrow is disputed.
    pub fn blocked_by_milestone_dispute(&self) -> bool {
        matches!(
            self,
            EscrowTransition::Release { .. } | EscrowTransition::Refund { .. }
        )
    }

    pub fn operation(&self) -> &'static str {
        match self {
            EscrowTransition::Deposit { .. } => "deposit",
            EscrowTransition::Release { .. } => "release",
            EscrowTransition::Refund { .. } => "refund",
            EscrowTransition::Dispute { .. } => "dispute",
        }
    }

    /// Funds movements caused by the transition, given the entries already
    /// recorded for the escrow.
    pub fn entries(
        &self,
        escrow: &EscrowPayment,
        existing: &[LedgerEntry],
        at: DateTime<Utc>,
    ) -> Vec<LedgerEntry> {
        match self {
            EscrowTransition::Deposit { reference } => vec![LedgerEntry::new(
                escrow.id,
                None,
                LedgerEntryKind::EscrowDeposit,
                escrow.total_amount,
                reference.as_str(),
                at,
            )],
            EscrowTransition::Release { reference, .. } => {
                escrow_release_entries(escrow, existing, reference, at)
            }
            EscrowTransition::Refund { reference, .. } => {
                escrow_refund_entry(escrow, existing, reference, at)
                    .into_iter()
                    .collect()
            }
            EscrowTransition::Dispute { .. } => Vec::new(),
        }
    }

    pub fn apply(&self, escrow: &mut EscrowPayment, at: DateTime<Utc>) {
        escrow.status = self.target();
        escrow.updated_at = at;
        match self {
            EscrowTransition::Deposit { reference } => {
                escrow.transaction_ref = Some(reference.clone());
                escrow.escrowed_at = Some(at);
            }
            EscrowTransition::Release { approver_id, .. } => {
                escrow.approver_id = Some(*approver_id);
                escrow.released_at = Some(at);
            }
            EscrowTransition::Refund { reason, .. } | EscrowTransition::Dispute { reason } => {
                escrow.status_reason = Some(reason.clone());
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum MilestoneTransition {
    Deposit { reference: String },
    Release { approver_id: Uuid, reference: String },
    Dispute { reason: String },
}

impl MilestoneTransition {
    pub fn target(&self) -> MilestoneStatus {
        match self {
            MilestoneTransition::Deposit { .. } => MilestoneStatus::Deposited,
            MilestoneTransition::Release { .. } => MilestoneStatus::Released,
            MilestoneTransition::Dispute { .. } => MilestoneStatus::Disputed,
        }
    }

    pub fn operation(&self) -> &'static str {
        match self {
            MilestoneTransition::Deposit { .. } => "deposit",
            MilestoneTransition::Release { .. } => "release",
            MilestoneTransition::Dispute { .. } => "dispute",
        }
    }
}

/// Everything a milestone transition touched, as persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct MilestoneChange {
    pub milestone: EscrowMilestone,
    pub escrow: EscrowPayment,
    /// Milestones moved `pending -> ready` by the same transaction.
    pub activated: Vec<EscrowMilestone>,
    pub entries: Vec<LedgerEntry>,
}

/// Applies `transition` to the milestone at `index` of `plan` in place. Both
/// store implementations call this while holding the escrow's lock, so the
/// readiness cascade and the escrow close-out land in the same transaction
/// as the triggering change. A deposit larger than the escrow's unallocated
/// balance is rejected.
pub fn apply_milestone_transition(
    escrow: &mut EscrowPayment,
    plan: &mut [EscrowMilestone],
    index: usize,
    existing: &[LedgerEntry],
    transition: &MilestoneTransition,
    at: DateTime<Utc>,
) -> TransitionOutcome<MilestoneChange> {
    let allowed = escrow.status == EscrowStatus::Escrowed
        && plan[index].status.can_transition_to(transition.target());

    if !allowed {
        return TransitionOutcome::Rejected(MilestoneChange {
            milestone: plan[index].clone(),
            escrow: escrow.clone(),
            activated: Vec::new(),
            entries: Vec::new(),
        });
    }

    let mut entries = Vec::new();
    let mut activated = Vec::new();

    match transition {
        MilestoneTransition::Deposit { reference } => {
            if EscrowBalance::from_entries(existing).unallocated() < plan[index].amount {
                return TransitionOutcome::Rejected(MilestoneChange {
                    milestone: plan[index].clone(),
                    escrow: escrow.clone(),
                    activated: Vec::new(),
                    entries: Vec::new(),
                });
            }
            let milestone = &mut plan[index];
            entries.push(LedgerEntry::new(
                escrow.id,
                Some(milestone.id),
                LedgerEntryKind::MilestoneDeposit,
                milestone.amount,
                reference.as_str(),
                at,
            ));
            milestone.status = MilestoneStatus::Deposited;
            milestone.transaction_ref = Some(reference.clone());
            milestone.deposited_at = Some(at);
        }
        MilestoneTransition::Release {
            approver_id,
            reference,
        } => {
            let commission = milestone_commission(escrow, &plan[index], plan);
            let milestone = &mut plan[index];
            let payout = milestone.amount - commission;
            if payout > 0 {
                entries.push(LedgerEntry::new(
                    escrow.id,
                    Some(milestone.id),
                    LedgerEntryKind::ArtisanPayout,
                    payout,
                    reference.as_str(),
                    at,
                ));
            }
            if commission > 0 {
                entries.push(LedgerEntry::new(
                    escrow.id,
                    Some(milestone.id),
                    LedgerEntryKind::PlatformCommission,
                    commission,
                    reference.as_str(),
                    at,
                ));
            }
            milestone.status = MilestoneStatus::Released;
            milestone.commission = Some(commission);
            milestone.released_at = Some(at);

            let ready = milestones_to_activate(plan);
            for m in plan.iter_mut().filter(|m| ready.contains(&m.id)) {
                m.status = MilestoneStatus::Ready;
                activated.push(m.clone());
            }

            if plan.iter().all(|m| m.status == MilestoneStatus::Released) {
                let close = EscrowTransition::Release {
                    approver_id: *approver_id,
                    reference: reference.clone(),
                };
                let mut ledger = existing.to_vec();
                ledger.extend(entries.iter().cloned());
                entries.extend(close.entries(escrow, &ledger, at));
                close.apply(escrow, at);
            }
        }
        MilestoneTransition::Dispute { reason } => {
            let milestone = &mut plan[index];
            milestone.status = MilestoneStatus::Disputed;
            milestone.dispute_reason = Some(reason.clone());
        }
    }

    TransitionOutcome::Applied(MilestoneChange {
        milestone: plan[index].clone(),
        escrow: escrow.clone(),
        activated,
        entries,
    })
}

/// Quote acceptance as one unit: request moves to `quote_accepted`, the
/// quote is stamped, and both payment records are created.
#[derive(Debug, Clone, PartialEq)]
pub struct QuoteAcceptance {
    pub request_id: Uuid,
    pub quote_id: Uuid,
    pub service_fee: ServiceFeePayment,
    pub escrow: EscrowPayment,
    pub accepted_at: DateTime<Utc>,
}

#[async_trait]
pub trait RequestStore {
    async fn save_request(&self, request: ServiceRequest) -> Result<ServiceRequest, Error>;
    async fn get_request(&self, request_id: Uuid) -> Result<Option<ServiceRequest>, Error>;
    async fn save_quote(&self, quote: Quote) -> Result<Quote, Error>;
    async fn get_quote(&self, quote_id: Uuid) -> Result<Option<Quote>, Error>;

    /// Compare-and-set on the request status.
    async fn update_request_status(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error>;

    /// Applied only while the request is `open`.
    async fn accept_quote(
        &self,
        acceptance: QuoteAcceptance,
    ) -> Result<TransitionOutcome<ServiceRequest>, Error>;

    async fn get_service_fee(&self, fee_id: Uuid) -> Result<Option<ServiceFeePayment>, Error>;
    async fn get_service_fee_for_request(
        &self,
        request_id: Uuid,
    ) -> Result<Option<ServiceFeePayment>, Error>;
    async fn transition_service_fee(
        &self,
        fee_id: Uuid,
        transition: FeeTransition,
    ) -> Result<TransitionOutcome<ServiceFeePayment>, Error>;

    async fn insert_attempt(&self, attempt: PaymentAttempt) -> Result<PaymentAttempt, Error>;
    async fn get_attempt(&self, reference: &str) -> Result<Option<PaymentAttempt>, Error>;
    async fn list_attempts_for_request(&self, request_id: Uuid)
        -> Result<Vec<PaymentAttempt>, Error>;
    /// Applied only while the attempt is still `initiated`.
    async fn settle_attempt(
        &self,
        reference: &str,
        status: AttemptStatus,
        failure_reason: Option<String>,
    ) -> Result<TransitionOutcome<PaymentAttempt>, Error>;
    /// Stamps `applied_at` on a settled attempt. Keeps the first stamp.
    async fn mark_attempt_applied(&self, reference: &str) -> Result<PaymentAttempt, Error>;
    /// Attempts created at or before `now - older_than` whose outcome was
    /// never applied: still `initiated`, or settled by a run that stopped
    /// before updating the fee or escrow.
    async fn list_stale_attempts(&self, older_than: Duration) -> Result<Vec<PaymentAttempt>, Error>;

    async fn save_artisan_contact(&self, contact: ArtisanContact) -> Result<ArtisanContact, Error>;
    async fn get_artisan_contact(&self, artisan_id: Uuid) -> Result<Option<ArtisanContact>, Error>;
    /// Keeps the first reveal per request and returns it.
    async fn record_contact_reveal(&self, reveal: ContactReveal) -> Result<ContactReveal, Error>;
    async fn get_contact_reveal(&self, request_id: Uuid) -> Result<Option<ContactReveal>, Error>;
}

#[async_trait]
pub trait EscrowStore {
    async fn get_escrow(&self, escrow_id: Uuid) -> Result<Option<EscrowPayment>, Error>;
    async fn get_escrow_for_request(&self, request_id: Uuid)
        -> Result<Option<EscrowPayment>, Error>;

    /// Applies the transition under the escrow's lock if the status table
    /// allows it and no milestone dispute blocks it, writing its ledger
    /// entries in the same unit.
    async fn transition_escrow(
        &self,
        escrow_id: Uuid,
        transition: EscrowTransition,
    ) -> Result<TransitionOutcome<EscrowPayment>, Error>;

    async fn ledger_entries(&self, escrow_id: Uuid) -> Result<Vec<LedgerEntry>, Error>;

    /// Records a payment received for an escrow that no longer takes one
    /// and its immediate return to the customer, under the escrow's lock.
    /// Writes nothing when the reference was already returned.
    async fn return_duplicate_payment(
        &self,
        escrow_id: Uuid,
        reference: &str,
        amount: i64,
    ) -> Result<Vec<LedgerEntry>, Error>;
}

#[async_trait]
pub trait MilestoneStore {
    /// Persists a whole plan. Rejected (returning the existing plan) unless
    /// the escrow is `escrowed` and has no milestones yet.
    async fn insert_plan(
        &self,
        escrow_id: Uuid,
        plan: Vec<EscrowMilestone>,
    ) -> Result<TransitionOutcome<Vec<EscrowMilestone>>, Error>;

    async fn get_milestone(&self, milestone_id: Uuid) -> Result<Option<EscrowMilestone>, Error>;
    async fn list_milestones(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error>;

    async fn transition_milestone(
        &self,
        milestone_id: Uuid,
        transition: MilestoneTransition,
    ) -> Result<TransitionOutcome<MilestoneChange>, Error>;

    /// Re-derives `pending -> ready` from persisted states.
    async fn reconcile_readiness(&self, escrow_id: Uuid) -> Result<Vec<EscrowMilestone>, Error>;
    async fn escrows_with_pending_milestones(&self) -> Result<Vec<Uuid>, Error>;

    async fn add_evidence(&self, evidence: MilestoneEvidence) -> Result<MilestoneEvidence, Error>;
    async fn list_evidence(&self, milestone_id: Uuid) -> Result<Vec<MilestoneEvidence>, Error>;
}

/// The full storage surface the services run against.
pub trait EngineStore: RequestStore + EscrowStore + MilestoneStore + Send + Sync {}

impl<T> EngineStore for T where T: RequestStore + EscrowStore + MilestoneStore + Send + Sync {}
