// models/escrowmodel.rs
use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::utils::currency::proportional_share;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "escrow_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EscrowStatus {
    Pending,
    Escrowed,
    Released,
    Disputed,
    Refunded,
}

impl EscrowStatus {
    pub fn to_str(&self) -> &str {
        match self {
            EscrowStatus::Pending => "pending",
            EscrowStatus::Escrowed => "escrowed",
            EscrowStatus::Released => "released",
            EscrowStatus::Disputed => "disputed",
            EscrowStatus::Refunded => "refunded",
        }
    }

    /// Monotonic transition table. Nothing leaves a terminal state.
    pub fn can_transition_to(&self, to: EscrowStatus) -> bool {
        matches!(
            (self, to),
            (EscrowStatus::Pending, EscrowStatus::Escrowed)
                | (EscrowStatus::Escrowed, EscrowStatus::Released)
                | (EscrowStatus::Escrowed, EscrowStatus::Refunded)
                | (EscrowStatus::Escrowed, EscrowStatus::Disputed)
        )
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct EscrowPayment {
    pub id: Uuid,
    pub request_id: Uuid,
    pub total_amount: i64,
    pub platform_fee: i64,
    pub artisan_amount: i64,
    pub service_fee_id: Uuid,
    pub status: EscrowStatus,
    pub transaction_ref: Option<String>,
    pub status_reason: Option<String>,
    pub approver_id: Option<Uuid>,
    #[sqlx(json)]
    pub milestone_templates: Vec<MilestoneTemplate>,
    pub escrowed_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl EscrowPayment {
    pub fn is_balanced(&self) -> bool {
        self.platform_fee + self.artisan_amount == self.total_amount
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "ledger_entry_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum LedgerEntryKind {
    EscrowDeposit,
    MilestoneDeposit,
    ArtisanPayout,
    PlatformCommission,
    CustomerRefund,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub milestone_id: Option<Uuid>,
    pub kind: LedgerEntryKind,
    pub amount: i64,
    pub reference: String,
    pub created_at: DateTime<Utc>,
}

impl LedgerEntry {
    pub fn new(
        escrow_id: Uuid,
        milestone_id: Option<Uuid>,
        kind: LedgerEntryKind,
        amount: i64,
        reference: impl Into<String>,
        at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            escrow_id,
            milestone_id,
            kind,
            amount,
            reference: reference.into(),
            created_at: at,
        }
    }
}

/// Funds currently held against an escrow, derived from its entries.
/// Milestone deposits earmark part of the escrowed funds and do not add to
/// what was collected.
#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, Default)]
pub struct EscrowBalance {
    pub deposited: i64,
    pub allocated_to_milestones: i64,
    pub paid_to_artisan: i64,
    pub commission_collected: i64,
    pub refunded: i64,
}

impl EscrowBalance {
    pub fn from_entries(entries: &[LedgerEntry]) -> Self {
        entries.iter().fold(Self::default(), |mut acc, entry| {
            match entry.kind {
                LedgerEntryKind::EscrowDeposit => acc.deposited += entry.amount,
                LedgerEntryKind::MilestoneDeposit => acc.allocated_to_milestones += entry.amount,
                LedgerEntryKind::ArtisanPayout => acc.paid_to_artisan += entry.amount,
                LedgerEntryKind::PlatformCommission => acc.commission_collected += entry.amount,
                LedgerEntryKind::CustomerRefund => acc.refunded += entry.amount,
            }
            acc
        })
    }

    pub fn held(&self) -> i64 {
        self.deposited - self.paid_to_artisan - self.commission_collected - self.refunded
    }

    /// Escrowed funds not yet earmarked for a milestone.
    pub fn unallocated(&self) -> i64 {
        self.deposited - self.allocated_to_milestones - self.refunded
    }
}

/// Entries written when a whole escrow is released: whatever part of the
/// artisan amount and commission has not already gone out through
/// milestone releases.
pub fn escrow_release_entries(
    escrow: &EscrowPayment,
    existing: &[LedgerEntry],
    reference: &str,
    at: DateTime<Utc>,
) -> Vec<LedgerEntry> {
    let balance = EscrowBalance::from_entries(existing);
    let payout = (escrow.artisan_amount - balance.paid_to_artisan).max(0);
    let commission = (escrow.platform_fee - balance.commission_collected).max(0);

    let mut entries = Vec::with_capacity(2);
    if payout > 0 {
        entries.push(LedgerEntry::new(
            escrow.id,
            None,
            LedgerEntryKind::ArtisanPayout,
            payout,
            reference,
            at,
        ));
    }
    if commission > 0 {
        entries.push(LedgerEntry::new(
            escrow.id,
            None,
            LedgerEntryKind::PlatformCommission,
            commission,
            reference,
            at,
        ));
    }
    entries
}

/// Refund returns everything still held for the customer.
pub fn escrow_refund_entry(
    escrow: &EscrowPayment,
    existing: &[LedgerEntry],
    reference: &str,
    at: DateTime<Utc>,
) -> Option<LedgerEntry> {
    let held = EscrowBalance::from_entries(existing).held();
    (held > 0).then(|| {
        LedgerEntry::new(
            escrow.id,
            None,
            LedgerEntryKind::CustomerRefund,
            held,
            reference,
            at,
        )
    })
}

/// A payment for an escrow that was already funded or closed when it
/// confirmed. It is recorded as received and handed straight back under its
/// own reference, so the pair nets to zero in the balance. Empty when that
/// reference was already returned.
pub fn duplicate_payment_entries(
    escrow: &EscrowPayment,
    existing: &[LedgerEntry],
    reference: &str,
    amount: i64,
    at: DateTime<Utc>,
) -> Vec<LedgerEntry> {
    let returned = existing
        .iter()
        .any(|e| e.kind == LedgerEntryKind::CustomerRefund && e.reference == reference);
    if returned || amount <= 0 {
        return Vec::new();
    }
    vec![
        LedgerEntry::new(escrow.id, None, LedgerEntryKind::EscrowDeposit, amount, reference, at),
        LedgerEntry::new(escrow.id, None, LedgerEntryKind::CustomerRefund, amount, reference, at),
    ]
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[sqlx(type_name = "evidence_kind", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum EvidenceKind {
    Photo,
    Video,
    Document,
    Receipt,
    Inspection,
}

impl EvidenceKind {
    pub fn to_str(&self) -> &str {
        match self {
            EvidenceKind::Photo => "photo",
            EvidenceKind::Video => "video",
            EvidenceKind::Document => "document",
            EvidenceKind::Receipt => "receipt",
            EvidenceKind::Inspection => "inspection",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "milestone_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum MilestoneStatus {
    Pending,
    Ready,
    Deposited,
    Released,
    Disputed,
}

impl MilestoneStatus {
    pub fn to_str(&self) -> &str {
        match self {
            MilestoneStatus::Pending => "pending",
            MilestoneStatus::Ready => "ready",
            MilestoneStatus::Deposited => "deposited",
            MilestoneStatus::Released => "released",
            MilestoneStatus::Disputed => "disputed",
        }
    }

    pub fn can_transition_to(&self, to: MilestoneStatus) -> bool {
        matches!(
            (self, to),
            (MilestoneStatus::Pending, MilestoneStatus::Ready)
                | (MilestoneStatus::Ready, MilestoneStatus::Deposited)
                | (MilestoneStatus::Deposited, MilestoneStatus::Released)
                | (MilestoneStatus::Deposited, MilestoneStatus::Disputed)
        )
    }
}

/// Milestone as supplied by the customer before the plan is materialized.
/// Dependencies point at other templates by their `order`.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct MilestoneTemplate {
    pub title: String,
    pub order: i32,
    pub percentage: f64,
    #[serde(default)]
    pub amount: Option<i64>,
    #[serde(default)]
    pub depends_on: Vec<i32>,
    #[serde(default)]
    pub evidence_required: Vec<EvidenceKind>,
    #[serde(default = "default_approval_required")]
    pub approval_required: bool,
}

fn default_approval_required() -> bool {
    true
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct EscrowMilestone {
    pub id: Uuid,
    pub escrow_id: Uuid,
    pub title: String,
    pub amount: i64,
    pub percentage: f64,
    #[serde(rename = "order")]
    pub sequence: i32,
    pub status: MilestoneStatus,
    pub dependencies: Vec<Uuid>,
    #[sqlx(json)]
    pub evidence_required: Vec<EvidenceKind>,
    pub approval_required: bool,
    pub transaction_ref: Option<String>,
    pub commission: Option<i64>,
    pub dispute_reason: Option<String>,
    pub deposited_at: Option<DateTime<Utc>>,
    pub released_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl EscrowMilestone {
    /// Required evidence kinds with no submission yet, in a stable order.
    pub fn missing_evidence(&self, evidence: &[MilestoneEvidence]) -> Vec<EvidenceKind> {
        let submitted: HashSet<EvidenceKind> = evidence
            .iter()
            .filter(|e| e.milestone_id == self.id)
            .map(|e| e.kind)
            .collect();

        let mut missing: Vec<EvidenceKind> = self
            .evidence_required
            .iter()
            .copied()
            .filter(|kind| !submitted.contains(kind))
            .collect();
        missing.sort();
        missing.dedup();
        missing
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct MilestoneEvidence {
    pub id: Uuid,
    pub milestone_id: Uuid,
    pub kind: EvidenceKind,
    pub url: String,
    pub note: Option<String>,
    pub submitted_by: Uuid,
    pub submitted_at: DateTime<Utc>,
    pub approved: bool,
}

/// Pending milestones that should become `ready` given the persisted states
/// of the whole plan. A milestone qualifies when it lists dependencies and
/// every one of them is `released`. Only the first milestone starts ready;
/// a later one without dependencies is never activated by a release.
pub fn milestones_to_activate(plan: &[EscrowMilestone]) -> Vec<Uuid> {
    let status: HashMap<Uuid, MilestoneStatus> = plan.iter().map(|m| (m.id, m.status)).collect();

    let mut ready: Vec<&EscrowMilestone> = plan
        .iter()
        .filter(|m| m.status == MilestoneStatus::Pending && !m.dependencies.is_empty())
        .filter(|m| {
            m.dependencies
                .iter()
                .all(|dep| status.get(dep) == Some(&MilestoneStatus::Released))
        })
        .collect();
    ready.sort_by_key(|m| m.sequence);
    ready.into_iter().map(|m| m.id).collect()
}

/// Commission withheld when `milestone` is released. The last milestone of
/// the plan to be released takes whatever remains of the platform fee so the
/// per-milestone commissions add up to it exactly.
pub fn milestone_commission(
    escrow: &EscrowPayment,
    milestone: &EscrowMilestone,
    plan: &[EscrowMilestone],
) -> i64 {
    let others_unreleased = plan
        .iter()
        .any(|m| m.id != milestone.id && m.status != MilestoneStatus::Released);

    if others_unreleased {
        return proportional_share(escrow.platform_fee, milestone.amount, escrow.total_amount)
            .min(milestone.amount);
    }

    let already: i64 = plan
        .iter()
        .filter(|m| m.id != milestone.id)
        .filter_map(|m| m.commission)
        .sum();
    (escrow.platform_fee - already).clamp(0, milestone.amount)
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    pub fn escrow(total: i64, fee: i64) -> EscrowPayment {
        let now = Utc::now();
        EscrowPayment {
            id: Uuid::new_v4(),
            request_id: Uuid::new_v4(),
            total_amount: total,
            platform_fee: fee,
            artisan_amount: total - fee,
            service_fee_id: Uuid::new_v4(),
            status: EscrowStatus::Escrowed,
            transaction_ref: Some("ESC_TEST".to_string()),
            status_reason: None,
            approver_id: None,
            milestone_templates: Vec::new(),
            escrowed_at: Some(now),
            released_at: None,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn milestone(
        escrow_id: Uuid,
        sequence: i32,
        amount: i64,
        status: MilestoneStatus,
        dependencies: Vec<Uuid>,
    ) -> EscrowMilestone {
        EscrowMilestone {
            id: Uuid::new_v4(),
            escrow_id,
            title: format!("Milestone {}", sequence),
            amount,
            percentage: 0.0,
            sequence,
            status,
            dependencies,
            evidence_required: Vec::new(),
            approval_required: true,
            transaction_ref: None,
            commission: None,
            dispute_reason: None,
            deposited_at: None,
            released_at: None,
            created_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fixtures::*;
    use super::*;

    #[test]
    fn test_escrow_transitions_are_monotonic() {
        use EscrowStatus::*;
        assert!(Pending.can_transition_to(Escrowed));
        assert!(Escrowed.can_transition_to(Released));
        assert!(!Released.can_transition_to(Escrowed));
        assert!(!Refunded.can_transition_to(Escrowed));
        assert!(!Disputed.can_transition_to(Released));
        assert!(!Pending.can_transition_to(Released));
    }

    #[test]
    fn test_activation_requires_released_dependencies() {
        let escrow = escrow(100_000, 10_000);
        let mut first = milestone(escrow.id, 1, 30_000, MilestoneStatus::Deposited, vec![]);
        let second = milestone(escrow.id, 2, 50_000, MilestoneStatus::Pending, vec![first.id]);

        let plan = vec![first.clone(), second.clone()];
        assert!(milestones_to_activate(&plan).is_empty());

        first.status = MilestoneStatus::Released;
        let plan = vec![first, second.clone()];
        assert_eq!(milestones_to_activate(&plan), vec![second.id]);
    }

    #[test]
    fn test_release_does_not_activate_independent_milestones() {
        let escrow = escrow(100_000, 10_000);
        let first = milestone(escrow.id, 1, 40_000, MilestoneStatus::Released, vec![]);
        let second = milestone(escrow.id, 2, 60_000, MilestoneStatus::Pending, vec![]);
        assert!(milestones_to_activate(&[first, second]).is_empty());
    }

    #[test]
    fn test_duplicate_payment_nets_to_zero() {
        let escrow = escrow(15_000, 1_500);
        assert!(escrow.is_balanced());
        let now = Utc::now();
        let mut entries = vec![LedgerEntry::new(
            escrow.id,
            None,
            LedgerEntryKind::EscrowDeposit,
            15_000,
            "ESC_1",
            now,
        )];

        let returned = duplicate_payment_entries(&escrow, &entries, "ESC_2", 15_000, now);
        assert_eq!(returned.len(), 2);
        entries.extend(returned);

        let balance = EscrowBalance::from_entries(&entries);
        assert_eq!(balance.held(), 15_000);
        assert_eq!(balance.unallocated(), 15_000);
        assert_eq!(balance.refunded, 15_000);
        assert!(duplicate_payment_entries(&escrow, &entries, "ESC_2", 15_000, now).is_empty());
    }

    #[test]
    fn test_disputed_dependency_blocks_activation() {
        let escrow = escrow(100_000, 10_000);
        let first = milestone(escrow.id, 1, 50_000, MilestoneStatus::Disputed, vec![]);
        let second = milestone(escrow.id, 2, 50_000, MilestoneStatus::Pending, vec![first.id]);
        assert!(milestones_to_activate(&[first, second]).is_empty());
    }

    #[test]
    fn test_milestone_commissions_sum_to_platform_fee() {
        let escrow = escrow(1_000, 101);
        let mut plan = vec![
            milestone(escrow.id, 1, 333, MilestoneStatus::Deposited, vec![]),
            milestone(escrow.id, 2, 333, MilestoneStatus::Pending, vec![]),
            milestone(escrow.id, 3, 334, MilestoneStatus::Pending, vec![]),
        ];

        let mut total = 0;
        for i in 0..plan.len() {
            let commission = milestone_commission(&escrow, &plan[i], &plan);
            plan[i].commission = Some(commission);
            plan[i].status = MilestoneStatus::Released;
            total += commission;
        }
        assert_eq!(total, escrow.platform_fee);
    }

    #[test]
    fn test_release_entries_skip_paid_milestones() {
        let escrow = escrow(15_000, 1_500);
        let now = Utc::now();
        let existing = vec![
            LedgerEntry::new(escrow.id, None, LedgerEntryKind::EscrowDeposit, 15_000, "d", now),
            LedgerEntry::new(escrow.id, None, LedgerEntryKind::ArtisanPayout, 4_000, "m1", now),
            LedgerEntry::new(escrow.id, None, LedgerEntryKind::PlatformCommission, 500, "m1", now),
        ];

        let entries = escrow_release_entries(&escrow, &existing, "rel", now);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].amount, 9_500);
        assert_eq!(entries[1].amount, 1_000);
    }

    #[test]
    fn test_missing_evidence_lists_absent_kinds() {
        let escrow = escrow(10_000, 1_000);
        let mut m = milestone(escrow.id, 1, 10_000, MilestoneStatus::Deposited, vec![]);
        m.evidence_required = vec![EvidenceKind::Photo, EvidenceKind::Receipt];
        let evidence = vec![MilestoneEvidence {
            id: Uuid::new_v4(),
            milestone_id: m.id,
            kind: EvidenceKind::Photo,
            url: "https://files.example/p.jpg".to_string(),
            note: None,
            submitted_by: Uuid::new_v4(),
            submitted_at: Utc::now(),
            approved: false,
        }];
        assert_eq!(m.missing_evidence(&evidence), vec![EvidenceKind::Receipt]);
    }
}
