// service/background_jobs.rs
use std::sync::Arc;

use chrono::Utc;
use tokio::time::{interval, Duration};

use crate::{
    db::store::EngineStore,
    service::{
        error::ServiceError,
        payment_flow::{Confirmation, PaymentFlowController},
    },
    AppState,
};

/// Counts from one pass over unsettled payment attempts.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ReconcileReport {
    pub checked: usize,
    pub confirmed: usize,
    pub declined: usize,
    pub errors: usize,
}

/// Re-runs confirmation for attempts whose outcome is still unapplied after
/// `older_than`: webhooks that never arrived, pollers lost to a restart, and
/// confirmations that stopped between settling the attempt and updating the
/// fee or escrow.
pub async fn reconcile_stale_attempts(
    store: &Arc<dyn EngineStore>,
    flow: &PaymentFlowController,
    older_than: chrono::Duration,
) -> Result<ReconcileReport, ServiceError> {
    let mut report = ReconcileReport::default();

    for attempt in store.list_stale_attempts(older_than).await? {
        report.checked += 1;
        match flow.confirm_payment(&attempt.reference).await {
            Ok(Confirmation::Confirmed(_)) => report.confirmed += 1,
            Ok(Confirmation::Declined(_)) => report.declined += 1,
            Ok(Confirmation::Pending(_)) => {}
            Err(e) => {
                report.errors += 1;
                tracing::error!("Reconciling payment {} failed: {}", attempt.reference, e);
            }
        }
    }

    Ok(report)
}

/// Periodic re-verification of stale payment attempts.
pub async fn start_payment_reconciliation_job(app_state: Arc<AppState>) {
    let period = Duration::from_secs(app_state.env.reconcile_interval_secs.max(1));
    let older_than = chrono::Duration::seconds(app_state.env.reconcile_interval_secs as i64);
    let mut interval = interval(period);

    loop {
        interval.tick().await;

        tracing::debug!("Running payment reconciliation job at {}", Utc::now());

        match reconcile_stale_attempts(&app_state.store, &app_state.flow, older_than).await {
            Ok(report) if report.checked > 0 => tracing::info!(
                "Payment reconciliation: {} checked, {} confirmed, {} declined, {} errors",
                report.checked,
                report.confirmed,
                report.declined,
                report.errors
            ),
            Ok(_) => {}
            Err(e) => tracing::error!("Payment reconciliation job failed: {}", e),
        }
    }
}

/// One-off start-up pass re-deriving milestone readiness.
pub async fn reconcile_milestones_on_startup(app_state: Arc<AppState>) {
    match app_state.flow.milestones().reconcile_all().await {
        Ok(0) => tracing::debug!("Milestone readiness is consistent"),
        Ok(activated) => tracing::info!("Start-up reconciliation activated {} milestones", activated),
        Err(e) => tracing::error!("Start-up milestone reconciliation failed: {}", e),
    }
}
