// service/milestone_service.rs
use std::sync::Arc;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    db::store::{EngineStore, MilestoneChange, MilestoneTransition, TransitionOutcome},
    models::{escrowmodel::*, paymentmodel::generate_transaction_reference},
    service::{error::ServiceError, milestone_planner::MilestonePlanner},
};

/// Approver recorded when a milestone releases itself.
pub const AUTO_RELEASE_APPROVER: Uuid = Uuid::nil();

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MilestoneView {
    pub milestone: EscrowMilestone,
    pub evidence: Vec<MilestoneEvidence>,
    pub missing_evidence: Vec<EvidenceKind>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EvidenceSubmission {
    pub kind: EvidenceKind,
    pub url: String,
    pub note: Option<String>,
    pub submitted_by: Uuid,
}

#[derive(Debug, Clone)]
pub struct EvidenceReceipt {
    pub evidence: MilestoneEvidence,
    /// Present when the submission completed the evidence of a milestone
    /// that needs no approval.
    pub released: Option<MilestoneChange>,
}

#[derive(Clone)]
pub struct MilestoneService {
    store: Arc<dyn EngineStore>,
    planner: MilestonePlanner,
}

impl MilestoneService {
    pub fn new(store: Arc<dyn EngineStore>, planner: MilestonePlanner) -> Self {
        Self { store, planner }
    }

    async fn escrow(&self, escrow_id: Uuid) -> Result<EscrowPayment, ServiceError> {
        self.store
            .get_escrow(escrow_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow", escrow_id))
    }

    async fn milestone(&self, milestone_id: Uuid) -> Result<EscrowMilestone, ServiceError> {
        self.store
            .get_milestone(milestone_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Milestone", milestone_id))
    }

    /// Validates and persists the plan for an escrowed, unplanned escrow.
    pub async fn create_plan(
        &self,
        escrow_id: Uuid,
        templates: &[MilestoneTemplate],
    ) -> Result<Vec<EscrowMilestone>, ServiceError> {
        let escrow = self.escrow(escrow_id).await?;
        match escrow.status {
            EscrowStatus::Escrowed => {}
            EscrowStatus::Disputed => return Err(ServiceError::DisputeActive(escrow.id)),
            other => {
                return Err(ServiceError::invalid_state(
                    "Escrow",
                    escrow.id,
                    other.to_str(),
                    "create milestone plan",
                ))
            }
        }

        let plan = self
            .planner
            .create_plan(escrow.id, escrow.total_amount, templates)?;

        match self.store.insert_plan(escrow.id, plan).await? {
            TransitionOutcome::Applied(plan) => {
                tracing::info!("Escrow {} split into {} milestones", escrow.id, plan.len());
                Ok(plan)
            }
            TransitionOutcome::Rejected(existing) if !existing.is_empty() => {
                Err(ServiceError::invalid_state(
                    "Escrow",
                    escrow.id,
                    "already planned",
                    "create milestone plan",
                ))
            }
            TransitionOutcome::Rejected(_) => {
                let current = self.escrow(escrow_id).await?;
                Err(ServiceError::invalid_state(
                    "Escrow",
                    current.id,
                    current.status.to_str(),
                    "create milestone plan",
                ))
            }
        }
    }

    /// Turns templates captured at quote acceptance into milestones once
    /// the escrow is funded. No-op when there are none or a plan exists.
    pub async fn materialize(&self, escrow: &EscrowPayment) -> Result<Vec<EscrowMilestone>, ServiceError> {
        if escrow.milestone_templates.is_empty() {
            return Ok(Vec::new());
        }
        let existing = self.store.list_milestones(escrow.id).await?;
        if !existing.is_empty() {
            return Ok(existing);
        }
        self.create_plan(escrow.id, &escrow.milestone_templates).await
    }

    pub async fn list(&self, escrow_id: Uuid) -> Result<Vec<MilestoneView>, ServiceError> {
        let milestones = self.store.list_milestones(escrow_id).await?;

        let mut views = Vec::with_capacity(milestones.len());
        for milestone in milestones {
            let evidence = self.store.list_evidence(milestone.id).await?;
            views.push(MilestoneView {
                missing_evidence: milestone.missing_evidence(&evidence),
                milestone,
                evidence,
            });
        }
        Ok(views)
    }

    /// `ready -> deposited`: earmarks the milestone's share of the escrowed
    /// funds as a distinct ledger entry.
    pub async fn deposit(&self, milestone_id: Uuid) -> Result<MilestoneChange, ServiceError> {
        let transition = MilestoneTransition::Deposit {
            reference: generate_transaction_reference("MIL"),
        };
        let change = self.apply(milestone_id, transition).await?;
        tracing::info!(
            "Milestone {} funded with {}",
            change.milestone.id,
            change.milestone.amount
        );

        if let Some(released) = self.try_auto_release(&change.milestone).await? {
            return Ok(released);
        }
        Ok(change)
    }

    /// Appends evidence. Evidence is never removed.
    pub async fn submit_evidence(
        &self,
        milestone_id: Uuid,
        submission: EvidenceSubmission,
    ) -> Result<EvidenceReceipt, ServiceError> {
        let milestone = self.milestone(milestone_id).await?;
        match milestone.status {
            MilestoneStatus::Ready | MilestoneStatus::Deposited => {}
            MilestoneStatus::Disputed => {
                return Err(ServiceError::DisputeActive(milestone.escrow_id))
            }
            other => {
                return Err(ServiceError::invalid_state(
                    "Milestone",
                    milestone.id,
                    other.to_str(),
                    "submit evidence",
                ))
            }
        }
        if submission.url.trim().is_empty() {
            return Err(ServiceError::Validation(
                "Evidence needs a file URL".to_string(),
            ));
        }

        let evidence = self
            .store
            .add_evidence(MilestoneEvidence {
                id: Uuid::new_v4(),
                milestone_id,
                kind: submission.kind,
                url: submission.url,
                note: submission.note,
                submitted_by: submission.submitted_by,
                submitted_at: Utc::now(),
                approved: false,
            })
            .await?;
        tracing::debug!(
            "Evidence {} ({}) added to milestone {}",
            evidence.id,
            evidence.kind.to_str(),
            milestone_id
        );

        let released = self.try_auto_release(&milestone).await?;
        Ok(EvidenceReceipt { evidence, released })
    }

    /// Customer approval: `deposited -> released` once every required
    /// evidence kind is present.
    pub async fn approve(
        &self,
        milestone_id: Uuid,
        approver_id: Uuid,
    ) -> Result<MilestoneChange, ServiceError> {
        let milestone = self.milestone(milestone_id).await?;
        let evidence = self.store.list_evidence(milestone_id).await?;
        let missing = milestone.missing_evidence(&evidence);

        if milestone.status == MilestoneStatus::Deposited && !missing.is_empty() {
            return Err(ServiceError::EvidenceIncomplete {
                milestone_id,
                missing,
            });
        }

        self.release(milestone_id, approver_id).await
    }

    pub async fn dispute(
        &self,
        milestone_id: Uuid,
        reason: &str,
    ) -> Result<EscrowMilestone, ServiceError> {
        if reason.trim().is_empty() {
            return Err(ServiceError::Validation(
                "A dispute needs a reason".to_string(),
            ));
        }

        let change = self
            .apply(
                milestone_id,
                MilestoneTransition::Dispute {
                    reason: reason.to_string(),
                },
            )
            .await?;
        tracing::warn!("Milestone {} disputed: {}", milestone_id, reason);
        Ok(change.milestone)
    }

    /// Re-derives readiness from persisted states for one escrow.
    pub async fn reconcile_readiness(
        &self,
        escrow_id: Uuid,
    ) -> Result<Vec<EscrowMilestone>, ServiceError> {
        let activated = self.store.reconcile_readiness(escrow_id).await?;
        if !activated.is_empty() {
            tracing::info!(
                "Reconciled escrow {}: {} milestones now ready",
                escrow_id,
                activated.len()
            );
        }
        Ok(activated)
    }

    pub async fn reconcile_all(&self) -> Result<usize, ServiceError> {
        let mut total = 0;
        for escrow_id in self.store.escrows_with_pending_milestones().await? {
            total += self.reconcile_readiness(escrow_id).await?.len();
        }
        Ok(total)
    }

    async fn release(
        &self,
        milestone_id: Uuid,
        approver_id: Uuid,
    ) -> Result<MilestoneChange, ServiceError> {
        let change = self
            .apply(
                milestone_id,
                MilestoneTransition::Release {
                    approver_id,
                    reference: generate_transaction_reference("MRL"),
                },
            )
            .await?;

        tracing::info!(
            "Milestone {} released ({} commission), {} milestones activated",
            change.milestone.id,
            change.milestone.commission.unwrap_or(0),
            change.activated.len()
        );
        if change.escrow.status == EscrowStatus::Released {
            tracing::info!("Escrow {} fully released through milestones", change.escrow.id);
        }
        Ok(change)
    }

    async fn try_auto_release(
        &self,
        milestone: &EscrowMilestone,
    ) -> Result<Option<MilestoneChange>, ServiceError> {
        if milestone.approval_required {
            return Ok(None);
        }
        let current = self.milestone(milestone.id).await?;
        if current.status != MilestoneStatus::Deposited {
            return Ok(None);
        }
        let evidence = self.store.list_evidence(current.id).await?;
        if !current.missing_evidence(&evidence).is_empty() {
            return Ok(None);
        }

        match self.release(current.id, AUTO_RELEASE_APPROVER).await {
            Ok(change) => Ok(Some(change)),
            // lost a race with another release or a dispute
            Err(ServiceError::InvalidState { .. }) | Err(ServiceError::DisputeActive(_)) => Ok(None),
            Err(e) => Err(e),
        }
    }

    async fn apply(
        &self,
        milestone_id: Uuid,
        transition: MilestoneTransition,
    ) -> Result<MilestoneChange, ServiceError> {
        let outcome = self
            .store
            .transition_milestone(milestone_id, transition.clone())
            .await
            .map_err(|e| match e {
                sqlx::Error::RowNotFound => ServiceError::not_found("Milestone", milestone_id),
                other => ServiceError::Database(other),
            })?;

        match outcome {
            TransitionOutcome::Applied(change) => Ok(change),
            TransitionOutcome::Rejected(current) => {
                if current.escrow.status == EscrowStatus::Disputed
                    || current.milestone.status == MilestoneStatus::Disputed
                {
                    return Err(ServiceError::DisputeActive(current.escrow.id));
                }
                if current.escrow.status != EscrowStatus::Escrowed {
                    return Err(ServiceError::invalid_state(
                        "Escrow",
                        current.escrow.id,
                        current.escrow.status.to_str(),
                        transition.operation(),
                    ));
                }
                if matches!(transition, MilestoneTransition::Deposit { .. })
                    && current.milestone.status == MilestoneStatus::Ready
                {
                    return Err(ServiceError::invalid_state(
                        "Escrow",
                        current.escrow.id,
                        "underfunded",
                        transition.operation(),
                    ));
                }
                Err(ServiceError::invalid_state(
                    "Milestone",
                    current.milestone.id,
                    current.milestone.status.to_str(),
                    transition.operation(),
                ))
            }
        }
    }
}
