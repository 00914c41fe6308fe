// service/milestone_planner.rs
use std::{
    collections::{HashMap, HashSet},
    fmt,
};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::{
    config::Config,
    models::escrowmodel::{EscrowMilestone, MilestoneStatus, MilestoneTemplate},
    service::error::ServiceError,
    utils::currency::percentage_of,
};

/// Percentages may drift this far from 100 in total.
pub const PERCENTAGE_TOLERANCE: f64 = 0.01;

/// The validation rule a rejected plan broke.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanRule {
    NonEmpty,
    ContiguousOrder,
    PositivePercentage,
    PercentageSum,
    AmountSum,
    PositiveAmount,
    MilestoneCap,
    DependencyExists,
    DependencyAcyclic,
    EntryPoint,
}

impl fmt::Display for PlanRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PlanRule::NonEmpty => "non_empty",
            PlanRule::ContiguousOrder => "contiguous_order",
            PlanRule::PositivePercentage => "positive_percentage",
            PlanRule::PercentageSum => "percentage_sum",
            PlanRule::AmountSum => "amount_sum",
            PlanRule::PositiveAmount => "positive_amount",
            PlanRule::MilestoneCap => "milestone_cap",
            PlanRule::DependencyExists => "dependency_exists",
            PlanRule::DependencyAcyclic => "dependency_acyclic",
            PlanRule::EntryPoint => "entry_point",
        };
        write!(f, "{}", name)
    }
}

fn reject(rule: PlanRule, detail: impl Into<String>) -> ServiceError {
    ServiceError::PlanRejected {
        rule,
        detail: detail.into(),
    }
}

#[derive(Debug, Clone, Copy)]
pub struct MilestonePlanner {
    cap: i64,
}

impl MilestonePlanner {
    pub fn new(cap: i64) -> Self {
        Self { cap }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.milestone_cap)
    }

    /// Checks every rule and returns the templates sorted by order together
    /// with the amount each one will carry. Nothing is persisted here.
    pub fn validate(
        &self,
        job_total: i64,
        templates: &[MilestoneTemplate],
    ) -> Result<Vec<(MilestoneTemplate, i64)>, ServiceError> {
        if templates.is_empty() {
            return Err(reject(PlanRule::NonEmpty, "a plan needs at least one milestone"));
        }

        let mut sorted = templates.to_vec();
        sorted.sort_by_key(|t| t.order);
        for (i, template) in sorted.iter().enumerate() {
            if template.order != i as i32 + 1 {
                return Err(reject(
                    PlanRule::ContiguousOrder,
                    format!("orders must run 1..={} without gaps or repeats", sorted.len()),
                ));
            }
            if !(template.percentage > 0.0) {
                return Err(reject(
                    PlanRule::PositivePercentage,
                    format!("milestone {} has percentage {}", template.order, template.percentage),
                ));
            }
        }

        let percentage_sum: f64 = sorted.iter().map(|t| t.percentage).sum();
        if (percentage_sum - 100.0).abs() > PERCENTAGE_TOLERANCE {
            return Err(reject(
                PlanRule::PercentageSum,
                format!("percentages add up to {:.2}, expected 100", percentage_sum),
            ));
        }

        let amounts = self.amounts(job_total, &sorted);
        let amount_sum: i64 = amounts.iter().sum();
        if amount_sum != job_total {
            return Err(reject(
                PlanRule::AmountSum,
                format!("amounts add up to {}, job total is {}", amount_sum, job_total),
            ));
        }

        for (template, amount) in sorted.iter().zip(&amounts) {
            if *amount <= 0 {
                return Err(reject(
                    PlanRule::PositiveAmount,
                    format!("milestone {} would carry {}", template.order, amount),
                ));
            }
            if *amount > self.cap {
                return Err(reject(
                    PlanRule::MilestoneCap,
                    format!(
                        "milestone {} carries {}, cap is {}",
                        template.order, amount, self.cap
                    ),
                ));
            }
        }

        check_dependencies(&sorted)?;

        Ok(sorted.into_iter().zip(amounts).collect())
    }

    /// Builds the milestone records for `escrow_id`. The first milestone is
    /// `ready` when it has no dependencies; the rest start `pending`.
    pub fn create_plan(
        &self,
        escrow_id: Uuid,
        job_total: i64,
        templates: &[MilestoneTemplate],
    ) -> Result<Vec<EscrowMilestone>, ServiceError> {
        let validated = self.validate(job_total, templates)?;

        let ids: HashMap<i32, Uuid> = validated
            .iter()
            .map(|(template, _)| (template.order, Uuid::new_v4()))
            .collect();
        let now = Utc::now();

        Ok(validated
            .into_iter()
            .map(|(template, amount)| {
                let status = if template.order == 1 && template.depends_on.is_empty() {
                    MilestoneStatus::Ready
                } else {
                    MilestoneStatus::Pending
                };

                let mut evidence_required = template.evidence_required.clone();
                evidence_required.sort();
                evidence_required.dedup();

                EscrowMilestone {
                    id: ids[&template.order],
                    escrow_id,
                    title: template.title,
                    amount,
                    percentage: template.percentage,
                    sequence: template.order,
                    status,
                    dependencies: template.depends_on.iter().map(|order| ids[order]).collect(),
                    evidence_required,
                    approval_required: template.approval_required,
                    transaction_ref: None,
                    commission: None,
                    dispute_reason: None,
                    deposited_at: None,
                    released_at: None,
                    created_at: now,
                }
            })
            .collect())
    }

    /// Explicit amounts are taken as given; the rest are the percentage of
    /// the total rounded half-up, with the last computed milestone absorbing
    /// whatever is left over.
    fn amounts(&self, job_total: i64, sorted: &[MilestoneTemplate]) -> Vec<i64> {
        let mut amounts: Vec<i64> = sorted
            .iter()
            .map(|t| t.amount.unwrap_or_else(|| percentage_of(job_total, t.percentage)))
            .collect();

        if let Some(last_computed) = sorted.iter().rposition(|t| t.amount.is_none()) {
            let residue = job_total - amounts.iter().sum::<i64>();
            amounts[last_computed] += residue;
        }
        amounts
    }
}

fn check_dependencies(sorted: &[MilestoneTemplate]) -> Result<(), ServiceError> {
    let orders: HashSet<i32> = sorted.iter().map(|t| t.order).collect();

    for template in sorted {
        for dep in &template.depends_on {
            if *dep == template.order {
                return Err(reject(
                    PlanRule::DependencyAcyclic,
                    format!("milestone {} depends on itself", template.order),
                ));
            }
            if !orders.contains(dep) {
                return Err(reject(
                    PlanRule::DependencyExists,
                    format!("milestone {} depends on unknown milestone {}", template.order, dep),
                ));
            }
        }
    }

    // Kahn's algorithm: anything left unvisited sits on a cycle.
    let mut indegree: HashMap<i32, usize> = sorted
        .iter()
        .map(|t| {
            let unique: HashSet<&i32> = t.depends_on.iter().collect();
            (t.order, unique.len())
        })
        .collect();
    let mut queue: Vec<i32> = indegree
        .iter()
        .filter(|(_, d)| **d == 0)
        .map(|(o, _)| *o)
        .collect();
    let mut visited = 0;

    while let Some(order) = queue.pop() {
        visited += 1;
        for dependent in sorted.iter().filter(|t| t.depends_on.contains(&order)) {
            if let Some(d) = indegree.get_mut(&dependent.order) {
                *d -= 1;
                if *d == 0 {
                    queue.push(dependent.order);
                }
            }
        }
    }

    if visited != sorted.len() {
        return Err(reject(
            PlanRule::DependencyAcyclic,
            "milestone dependencies form a cycle",
        ));
    }

    if sorted.first().is_some_and(|first| !first.depends_on.is_empty()) {
        return Err(reject(
            PlanRule::EntryPoint,
            "the first milestone cannot wait on later ones",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::escrowmodel::EvidenceKind;

    fn template(order: i32, percentage: f64, depends_on: Vec<i32>) -> MilestoneTemplate {
        MilestoneTemplate {
            title: format!("Stage {}", order),
            order,
            percentage,
            amount: None,
            depends_on,
            evidence_required: vec![EvidenceKind::Photo],
            approval_required: true,
        }
    }

    fn rule_of(err: ServiceError) -> PlanRule {
        match err {
            ServiceError::PlanRejected { rule, .. } => rule,
            other => panic!("expected a plan rejection, got {:?}", other),
        }
    }

    #[test]
    fn test_three_stage_plan() {
        let planner = MilestonePlanner::new(1_000_000);
        let plan = planner
            .create_plan(
                Uuid::new_v4(),
                100_000,
                &[
                    template(1, 30.0, vec![]),
                    template(2, 50.0, vec![1]),
                    template(3, 20.0, vec![2]),
                ],
            )
            .unwrap();

        let amounts: Vec<i64> = plan.iter().map(|m| m.amount).collect();
        assert_eq!(amounts, vec![30_000, 50_000, 20_000]);
        assert_eq!(plan[0].status, MilestoneStatus::Ready);
        assert_eq!(plan[1].status, MilestoneStatus::Pending);
        assert_eq!(plan[1].dependencies, vec![plan[0].id]);
        assert_eq!(plan[2].dependencies, vec![plan[1].id]);
    }

    #[test]
    fn test_rounding_residue_lands_on_last_milestone() {
        let planner = MilestonePlanner::new(1_000_000);
        let plan = planner
            .create_plan(
                Uuid::new_v4(),
                1_001,
                &[
                    template(1, 33.33, vec![]),
                    template(2, 33.33, vec![]),
                    template(3, 33.34, vec![]),
                ],
            )
            .unwrap();

        let amounts: Vec<i64> = plan.iter().map(|m| m.amount).collect();
        assert_eq!(amounts.iter().sum::<i64>(), 1_001);
        assert_eq!(amounts[..2], [334, 334]);
    }

    #[test]
    fn test_templates_in_any_order() {
        let planner = MilestonePlanner::new(1_000_000);
        let plan = planner
            .create_plan(
                Uuid::new_v4(),
                10_000,
                &[template(2, 60.0, vec![1]), template(1, 40.0, vec![])],
            )
            .unwrap();
        assert_eq!(plan[0].sequence, 1);
        assert_eq!(plan[0].amount, 4_000);
    }

    #[test]
    fn test_percentages_must_reach_hundred() {
        let planner = MilestonePlanner::new(1_000_000);
        let err = planner
            .validate(100_000, &[template(1, 30.0, vec![]), template(2, 69.0, vec![])])
            .unwrap_err();
        assert_eq!(rule_of(err), PlanRule::PercentageSum);
    }

    #[test]
    fn test_explicit_amounts_must_reconcile() {
        let planner = MilestonePlanner::new(1_000_000);
        let mut first = template(1, 50.0, vec![]);
        first.amount = Some(50_000);
        let mut second = template(2, 50.0, vec![]);
        second.amount = Some(49_000);

        let err = planner.validate(100_000, &[first, second]).unwrap_err();
        assert_eq!(rule_of(err), PlanRule::AmountSum);
    }

    #[test]
    fn test_cap_applies_per_milestone() {
        let planner = MilestonePlanner::new(40_000);
        let err = planner
            .validate(100_000, &[template(1, 50.0, vec![]), template(2, 50.0, vec![])])
            .unwrap_err();
        assert_eq!(rule_of(err), PlanRule::MilestoneCap);
    }

    #[test]
    fn test_dependency_rules() {
        let planner = MilestonePlanner::new(1_000_000);

        let dangling = planner
            .validate(100_000, &[template(1, 50.0, vec![]), template(2, 50.0, vec![7])])
            .unwrap_err();
        assert_eq!(rule_of(dangling), PlanRule::DependencyExists);

        let cycle = planner
            .validate(
                100_000,
                &[
                    template(1, 20.0, vec![]),
                    template(2, 40.0, vec![3]),
                    template(3, 40.0, vec![2]),
                ],
            )
            .unwrap_err();
        assert_eq!(rule_of(cycle), PlanRule::DependencyAcyclic);

        let blocked_start = planner
            .validate(100_000, &[template(1, 50.0, vec![2]), template(2, 50.0, vec![])])
            .unwrap_err();
        assert_eq!(rule_of(blocked_start), PlanRule::EntryPoint);
    }

    #[test]
    fn test_orders_must_be_contiguous() {
        let planner = MilestonePlanner::new(1_000_000);
        let err = planner
            .validate(100_000, &[template(1, 50.0, vec![]), template(3, 50.0, vec![])])
            .unwrap_err();
        assert_eq!(rule_of(err), PlanRule::ContiguousOrder);

        assert_eq!(
            rule_of(planner.validate(100_000, &[]).unwrap_err()),
            PlanRule::NonEmpty
        );
    }
}
