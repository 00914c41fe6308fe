// service/payment_flow.rs
mod contact_gate;

use std::{collections::HashMap, sync::Arc};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Mutex};
use uuid::Uuid;

use crate::{
    db::store::{EngineStore, FeeTransition, QuoteAcceptance, TransitionOutcome},
    models::{escrowmodel::*, paymentmodel::*},
    service::{
        error::ServiceError,
        escrow_service::EscrowService,
        fee_calculator::{CostBreakdown, FeeCalculator},
        milestone_planner::MilestonePlanner,
        milestone_service::MilestoneService,
        payment_provider::{GatewayStatus, InitiatePayment, PaymentInitiation, PaymentProviderService},
        verification_poller::{PollOutcome, VerificationPoller},
    },
};

use contact_gate::ContactRevealGate;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AcceptedQuote {
    pub request: ServiceRequest,
    pub service_fee: ServiceFeePayment,
    pub escrow: EscrowPayment,
    pub cost: CostBreakdown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PaymentSelection {
    pub attempt: PaymentAttempt,
    pub initiation: PaymentInitiation,
}

/// Where a payment reference stands after one confirmation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "status", content = "attempt")]
pub enum Confirmation {
    Confirmed(PaymentAttempt),
    Declined(PaymentAttempt),
    Pending(PaymentAttempt),
}

impl Confirmation {
    pub fn attempt(&self) -> &PaymentAttempt {
        match self {
            Confirmation::Confirmed(a) | Confirmation::Declined(a) | Confirmation::Pending(a) => a,
        }
    }

    fn from_attempt(attempt: PaymentAttempt) -> Self {
        match attempt.status {
            AttemptStatus::Succeeded => Confirmation::Confirmed(attempt),
            AttemptStatus::Failed => Confirmation::Declined(attempt),
            AttemptStatus::Initiated => Confirmation::Pending(attempt),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobCompletion {
    pub request: ServiceRequest,
    pub escrow: EscrowPayment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Cancellation {
    pub request: ServiceRequest,
    pub escrow: Option<EscrowPayment>,
}

struct ActivePoller {
    reference: String,
    request_id: Uuid,
    cancel: watch::Sender<bool>,
}

/// Running pollers by task token; one reference may have several.
type PollerRegistry = HashMap<Uuid, ActivePoller>;

/// Drives one service request from quote acceptance to completion. Every
/// step is triggered by a confirmed event; failures leave state where it was
/// and surface the reason.
#[derive(Clone)]
pub struct PaymentFlowController {
    store: Arc<dyn EngineStore>,
    providers: Arc<PaymentProviderService>,
    fees: FeeCalculator,
    planner: MilestonePlanner,
    poller: VerificationPoller,
    escrows: EscrowService,
    milestones: MilestoneService,
    gate: ContactRevealGate,
    pollers: Arc<Mutex<PollerRegistry>>,
}

impl PaymentFlowController {
    pub fn new(
        store: Arc<dyn EngineStore>,
        providers: Arc<PaymentProviderService>,
        fees: FeeCalculator,
        planner: MilestonePlanner,
        poller: VerificationPoller,
    ) -> Self {
        Self {
            escrows: EscrowService::new(store.clone()),
            milestones: MilestoneService::new(store.clone(), planner),
            gate: ContactRevealGate::new(store.clone()),
            store,
            providers,
            fees,
            planner,
            poller,
            pollers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn escrows(&self) -> &EscrowService {
        &self.escrows
    }

    pub fn milestones(&self) -> &MilestoneService {
        &self.milestones
    }

    async fn request(&self, request_id: Uuid) -> Result<ServiceRequest, ServiceError> {
        self.store
            .get_request(request_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Request", request_id))
    }

    /// Accepts a quote: creates the pending service fee and the pending
    /// escrow in one unit. Milestone templates, when given, are validated
    /// now and materialized once the escrow is funded.
    pub async fn accept_quote(
        &self,
        request_id: Uuid,
        quote_id: Uuid,
        milestones: Vec<MilestoneTemplate>,
    ) -> Result<AcceptedQuote, ServiceError> {
        let request = self.request(request_id).await?;
        let quote = self
            .store
            .get_quote(quote_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Quote", quote_id))?;

        if quote.request_id != request.id {
            return Err(ServiceError::Validation(format!(
                "Quote {} does not belong to request {}",
                quote_id, request_id
            )));
        }
        if quote.amount <= 0 {
            return Err(ServiceError::Validation(format!(
                "Quote {} must be for a positive amount, got {}",
                quote_id, quote.amount
            )));
        }
        if request.status != RequestStatus::Open {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "accept quote",
            ));
        }

        let cost = self.fees.calculate_total_cost(quote.amount)?;
        if !milestones.is_empty() {
            self.planner.validate(quote.amount, &milestones)?;
        }

        let now = Utc::now();
        let service_fee = ServiceFeePayment {
            id: Uuid::new_v4(),
            request_id,
            amount: cost.service_fee,
            status: FeePaymentStatus::Pending,
            transaction_ref: None,
            paid_at: None,
            created_at: now,
        };
        let escrow = EscrowPayment {
            id: Uuid::new_v4(),
            request_id,
            total_amount: cost.job_amount,
            platform_fee: cost.platform_fee,
            artisan_amount: cost.artisan_amount,
            service_fee_id: service_fee.id,
            status: EscrowStatus::Pending,
            transaction_ref: None,
            status_reason: None,
            approver_id: None,
            milestone_templates: milestones,
            escrowed_at: None,
            released_at: None,
            created_at: now,
            updated_at: now,
        };

        let outcome = self
            .store
            .accept_quote(QuoteAcceptance {
                request_id,
                quote_id,
                service_fee: service_fee.clone(),
                escrow: escrow.clone(),
                accepted_at: now,
            })
            .await?;

        match outcome {
            TransitionOutcome::Applied(request) => {
                tracing::info!(
                    "Quote {} accepted for request {}: job {}, fee {}, commission {}",
                    quote_id,
                    request_id,
                    cost.job_amount,
                    cost.service_fee,
                    cost.platform_fee
                );
                Ok(AcceptedQuote {
                    request,
                    service_fee,
                    escrow,
                    cost,
                })
            }
            TransitionOutcome::Rejected(current) => Err(ServiceError::invalid_state(
                "Request",
                current.id,
                current.status.to_str(),
                "accept quote",
            )),
        }
    }

    /// Starts a gateway payment for the service fee or the escrow identified
    /// by `payment_id`. The escrow can only be paid once the fee is paid, and
    /// no new attempt starts while an earlier one is still within its
    /// verification window.
    pub async fn select_payment_method(
        &self,
        payment_id: Uuid,
        method: PaymentMethod,
        payer_ref: &str,
    ) -> Result<PaymentSelection, ServiceError> {
        let (target, request_id, amount) =
            if let Some(fee) = self.store.get_service_fee(payment_id).await? {
                if !matches!(fee.status, FeePaymentStatus::Pending | FeePaymentStatus::Failed) {
                    return Err(ServiceError::invalid_state(
                        "Service fee",
                        fee.id,
                        fee.status.to_str(),
                        "initiate payment",
                    ));
                }
                (PaymentTarget::ServiceFee, fee.request_id, fee.amount)
            } else if let Some(escrow) = self.store.get_escrow(payment_id).await? {
                if escrow.status != EscrowStatus::Pending {
                    return Err(ServiceError::invalid_state(
                        "Escrow",
                        escrow.id,
                        escrow.status.to_str(),
                        "initiate payment",
                    ));
                }
                let fee = self.store.get_service_fee(escrow.service_fee_id).await?;
                let fee_status = fee.map(|f| f.status);
                if fee_status != Some(FeePaymentStatus::Paid) {
                    return Err(ServiceError::PaymentIncomplete {
                        request_id: escrow.request_id,
                        service_fee: fee_status,
                        escrow: Some(escrow.status),
                    });
                }
                (PaymentTarget::Escrow, escrow.request_id, escrow.total_amount)
            } else {
                return Err(ServiceError::not_found("Payment", payment_id));
            };

        let request = self.request(request_id).await?;
        if request.status != RequestStatus::QuoteAccepted {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "initiate payment",
            ));
        }

        let window = chrono::Duration::from_std(self.poller.budget())
            .unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - window;
        let in_flight = self
            .store
            .list_attempts_for_request(request_id)
            .await?
            .into_iter()
            .find(|a| {
                a.target_id == payment_id
                    && a.status == AttemptStatus::Initiated
                    && a.created_at > cutoff
            });
        if let Some(pending) = in_flight {
            return Err(ServiceError::invalid_state(
                "Payment",
                payment_id,
                format!("awaiting confirmation of {}", pending.reference),
                "initiate payment",
            ));
        }

        let prefix = match target {
            PaymentTarget::ServiceFee => "SVC",
            PaymentTarget::Escrow => "ESC",
        };
        let initiation = self
            .providers
            .initiate(InitiatePayment {
                reference: generate_transaction_reference(prefix),
                amount,
                method,
                payer_ref: payer_ref.to_string(),
                metadata: Some(serde_json::json!({
                    "request_id": request_id,
                    "payment_id": payment_id,
                })),
            })
            .await?;

        let attempt = self
            .store
            .insert_attempt(PaymentAttempt {
                reference: initiation.reference.clone(),
                request_id,
                target,
                target_id: payment_id,
                provider: initiation.provider.clone(),
                method,
                amount,
                status: AttemptStatus::Initiated,
                failure_reason: None,
                created_at: Utc::now(),
                settled_at: None,
                applied_at: None,
            })
            .await?;

        if target == PaymentTarget::ServiceFee {
            self.store
                .transition_service_fee(
                    payment_id,
                    FeeTransition::Initiate {
                        reference: attempt.reference.clone(),
                    },
                )
                .await?;
        }

        tracing::info!(
            "Payment {} initiated via {} for {} ({} {})",
            attempt.reference,
            attempt.provider,
            payment_id,
            amount,
            method.to_str()
        );

        Ok(PaymentSelection { attempt, initiation })
    }

    /// The one confirmation routine: webhooks, the poller, manual
    /// re-verification and the stale-attempt job all end up here. Safe to
    /// call any number of times for the same reference. A settled outcome is
    /// applied to its fee or escrow until the attempt is stamped applied, so
    /// a run interrupted between the two steps is finished by the next one.
    pub async fn confirm_payment(&self, reference: &str) -> Result<Confirmation, ServiceError> {
        let attempt = self
            .store
            .get_attempt(reference)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", reference))?;

        let attempt = match attempt.status {
            AttemptStatus::Succeeded | AttemptStatus::Failed => attempt,
            AttemptStatus::Initiated => {
                let verification = self.providers.verify(&attempt.provider, reference).await?;

                let (status, reason) = match verification.status {
                    GatewayStatus::Pending => return Ok(Confirmation::Pending(attempt)),
                    GatewayStatus::Success if verification.paid_amount < attempt.amount => (
                        AttemptStatus::Failed,
                        Some(format!(
                            "underpaid: received {} of {}",
                            verification.paid_amount, attempt.amount
                        )),
                    ),
                    GatewayStatus::Success => (AttemptStatus::Succeeded, None),
                    GatewayStatus::Failed => (
                        AttemptStatus::Failed,
                        Some(
                            verification
                                .message
                                .unwrap_or_else(|| "declined by provider".to_string()),
                        ),
                    ),
                };

                self.store
                    .settle_attempt(reference, status, reason)
                    .await?
                    .into_inner()
            }
        };

        if attempt.applied_at.is_some() {
            return Ok(Confirmation::from_attempt(attempt));
        }
        match attempt.status {
            AttemptStatus::Succeeded => self.apply_success(&attempt).await?,
            AttemptStatus::Failed => self.apply_failure(&attempt).await?,
            AttemptStatus::Initiated => return Ok(Confirmation::Pending(attempt)),
        }

        let attempt = self.store.mark_attempt_applied(reference).await?;
        Ok(Confirmation::from_attempt(attempt))
    }

    async fn apply_success(&self, attempt: &PaymentAttempt) -> Result<(), ServiceError> {
        match attempt.target {
            PaymentTarget::ServiceFee => {
                let outcome = self
                    .store
                    .transition_service_fee(
                        attempt.target_id,
                        FeeTransition::Paid {
                            reference: attempt.reference.clone(),
                        },
                    )
                    .await?;
                match outcome {
                    TransitionOutcome::Applied(_) => tracing::info!(
                        "Service fee for request {} paid (ref {})",
                        attempt.request_id,
                        attempt.reference
                    ),
                    TransitionOutcome::Rejected(fee)
                        if fee.transaction_ref.as_deref() != Some(attempt.reference.as_str()) =>
                    {
                        // already paid under another reference
                        let escrow = self
                            .store
                            .get_escrow_for_request(attempt.request_id)
                            .await?
                            .ok_or_else(|| {
                                ServiceError::not_found("Escrow for request", attempt.request_id)
                            })?;
                        self.escrows
                            .return_duplicate(escrow.id, &attempt.reference)
                            .await?;
                    }
                    TransitionOutcome::Rejected(_) => {}
                }
            }
            PaymentTarget::Escrow => {
                let escrow = match self
                    .escrows
                    .deposit(attempt.target_id, &attempt.reference)
                    .await
                {
                    Ok(escrow) => escrow,
                    // funded or closed under another reference
                    Err(ServiceError::InvalidState { .. }) => {
                        self.escrows
                            .return_duplicate(attempt.target_id, &attempt.reference)
                            .await?;
                        return Ok(());
                    }
                    Err(e) => return Err(e),
                };

                let request = self.request(attempt.request_id).await?;
                if request.status == RequestStatus::Cancelled {
                    if escrow.status == EscrowStatus::Escrowed {
                        tracing::warn!(
                            "Escrow {} funded after request {} was cancelled, refunding",
                            escrow.id,
                            request.id
                        );
                        self.escrows
                            .refund(escrow.id, "request cancelled before payment confirmed")
                            .await?;
                    }
                    return Ok(());
                }
                self.milestones.materialize(&escrow).await?;
            }
        }
        Ok(())
    }

    async fn apply_failure(&self, attempt: &PaymentAttempt) -> Result<(), ServiceError> {
        tracing::warn!(
            "Payment {} for request {} failed: {}",
            attempt.reference,
            attempt.request_id,
            attempt.failure_reason.as_deref().unwrap_or("unknown reason")
        );

        if attempt.target != PaymentTarget::ServiceFee {
            return Ok(());
        }
        let Some(fee) = self.store.get_service_fee(attempt.target_id).await? else {
            return Ok(());
        };
        // only the attempt currently tracked by the fee may fail it
        if fee.transaction_ref.as_deref() == Some(attempt.reference.as_str()) {
            self.store
                .transition_service_fee(
                    fee.id,
                    FeeTransition::Failed {
                        reference: attempt.reference.clone(),
                    },
                )
                .await?;
        }
        Ok(())
    }

    /// Polls the gateway for `reference` until it settles, the budget runs
    /// out, or the request is cancelled.
    pub async fn await_confirmation(&self, reference: &str) -> Result<PaymentAttempt, ServiceError> {
        let attempt = self
            .store
            .get_attempt(reference)
            .await?
            .ok_or_else(|| ServiceError::not_found("Payment", reference))?;

        let (tx, rx) = watch::channel(false);
        let token = Uuid::new_v4();
        self.pollers.lock().await.insert(
            token,
            ActivePoller {
                reference: reference.to_string(),
                request_id: attempt.request_id,
                cancel: tx,
            },
        );

        let this = self;
        let outcome = self
            .poller
            .run(reference, rx, move || this.probe(reference))
            .await;

        self.pollers.lock().await.remove(&token);

        match outcome {
            PollOutcome::Success { .. } => Ok(self
                .store
                .get_attempt(reference)
                .await?
                .unwrap_or(attempt)),
            PollOutcome::Failed { .. } => {
                let reason = self
                    .store
                    .get_attempt(reference)
                    .await?
                    .and_then(|a| a.failure_reason)
                    .unwrap_or_else(|| "declined by provider".to_string());
                Err(ServiceError::PaymentDeclined {
                    reference: reference.to_string(),
                    reason,
                })
            }
            PollOutcome::Timeout { attempts } => {
                tracing::warn!(
                    "Payment {} still unconfirmed after {} checks",
                    reference,
                    attempts
                );
                Err(ServiceError::VerificationTimeout {
                    reference: reference.to_string(),
                    attempts,
                })
            }
            PollOutcome::Cancelled { .. } => Err(ServiceError::invalid_state(
                "Request",
                attempt.request_id,
                "cancelled",
                "confirm payment",
            )),
        }
    }

    /// Runs `await_confirmation` on its own task and logs how it ended.
    pub fn spawn_confirmation(
        &self,
        reference: String,
    ) -> tokio::task::JoinHandle<Result<PaymentAttempt, ServiceError>> {
        let this = self.clone();
        tokio::spawn(async move {
            let result = this.await_confirmation(&reference).await;
            match &result {
                Ok(attempt) => tracing::info!(
                    "Background verification of {} finished: {:?}",
                    reference,
                    attempt.status
                ),
                Err(e) => tracing::warn!("Background verification of {} ended: {}", reference, e),
            }
            result
        })
    }

    async fn probe(&self, reference: &str) -> Result<GatewayStatus, ServiceError> {
        Ok(match self.confirm_payment(reference).await? {
            Confirmation::Confirmed(_) => GatewayStatus::Success,
            Confirmation::Declined(_) => GatewayStatus::Failed,
            Confirmation::Pending(_) => GatewayStatus::Pending,
        })
    }

    async fn stop_polling(&self, request_id: Uuid) -> usize {
        let pollers = self.pollers.lock().await;
        let mut stopped = 0;
        for poller in pollers.values().filter(|p| p.request_id == request_id) {
            let _ = poller.cancel.send(true);
            tracing::debug!("Stopping verification of {}", poller.reference);
            stopped += 1;
        }
        stopped
    }

    /// Read-only projection for UI polling.
    pub async fn poll_status(&self, request_id: Uuid) -> Result<PaymentFlowState, ServiceError> {
        let request = self.request(request_id).await?;
        let service_fee = self.store.get_service_fee_for_request(request_id).await?;
        let escrow = self.store.get_escrow_for_request(request_id).await?;
        let reveal = self.store.get_contact_reveal(request_id).await?;

        let mut attempts = self.store.list_attempts_for_request(request_id).await?;
        attempts.sort_by_key(|a| a.created_at);
        let last_failure = attempts
            .last()
            .filter(|a| a.status == AttemptStatus::Failed)
            .map(|a| {
                a.failure_reason
                    .clone()
                    .unwrap_or_else(|| "payment failed".to_string())
            });
        let escrow_attempted = attempts.iter().any(|a| {
            a.target == PaymentTarget::Escrow && a.status != AttemptStatus::Failed
        });

        let stage = derive_stage(
            &request,
            service_fee.as_ref(),
            escrow.as_ref(),
            reveal.is_some(),
            escrow_attempted,
        );

        Ok(PaymentFlowState {
            request_id,
            stage,
            request_status: request.status,
            service_fee,
            escrow,
            contact_revealed_at: reveal.map(|r| r.revealed_at),
            last_failure,
        })
    }

    pub async fn reveal_contact(&self, request_id: Uuid) -> Result<ArtisanContactInfo, ServiceError> {
        self.gate.reveal(request_id).await
    }

    /// `quote_accepted -> job_active`. Both payments must be in place; the
    /// artisan's contact is released to the customer if it was not yet.
    pub async fn activate_job(&self, request_id: Uuid) -> Result<ServiceRequest, ServiceError> {
        let request = self.request(request_id).await?;
        if request.status != RequestStatus::QuoteAccepted {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "activate job",
            ));
        }

        self.gate.reveal(request_id).await?;
        self.transition_request(request_id, &[RequestStatus::QuoteAccepted], RequestStatus::JobActive, "activate job")
            .await
    }

    /// `job_active -> completed`, releasing the escrow to the artisan.
    pub async fn complete_job(
        &self,
        request_id: Uuid,
        approver_id: Uuid,
    ) -> Result<JobCompletion, ServiceError> {
        let request = self.request(request_id).await?;
        if request.status != RequestStatus::JobActive {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "complete job",
            ));
        }

        let escrow = self
            .store
            .get_escrow_for_request(request_id)
            .await?
            .ok_or_else(|| ServiceError::not_found("Escrow for request", request_id))?;
        let escrow = self.escrows.release(escrow.id, approver_id).await?;

        let request = self
            .transition_request(request_id, &[RequestStatus::JobActive], RequestStatus::Completed, "complete job")
            .await?;
        tracing::info!("Request {} completed", request_id);

        Ok(JobCompletion { request, escrow })
    }

    /// Stops any verification in flight, cancels the request and refunds
    /// escrowed funds. Cancelling again returns the cancelled request and
    /// refunds an escrow that was funded in the meantime.
    pub async fn cancel_request(
        &self,
        request_id: Uuid,
        reason: &str,
    ) -> Result<Cancellation, ServiceError> {
        let request = self.request(request_id).await?;
        if request.status == RequestStatus::Completed {
            return Err(ServiceError::invalid_state(
                "Request",
                request.id,
                request.status.to_str(),
                "cancel",
            ));
        }

        if request.status != RequestStatus::Cancelled {
            if let Some(escrow) = self.store.get_escrow_for_request(request_id).await? {
                let disputed = match escrow.status {
                    EscrowStatus::Disputed => true,
                    EscrowStatus::Escrowed => self
                        .store
                        .list_milestones(escrow.id)
                        .await?
                        .iter()
                        .any(|m| m.status == MilestoneStatus::Disputed),
                    _ => false,
                };
                if disputed {
                    return Err(ServiceError::DisputeActive(escrow.id));
                }
            }
        }

        let stopped = self.stop_polling(request_id).await;
        if stopped > 0 {
            tracing::info!("Cancelled {} verifications for request {}", stopped, request_id);
        }

        let request = if request.status == RequestStatus::Cancelled {
            request
        } else {
            let request = self
                .transition_request(
                    request_id,
                    &[
                        RequestStatus::Open,
                        RequestStatus::QuoteAccepted,
                        RequestStatus::JobActive,
                    ],
                    RequestStatus::Cancelled,
                    "cancel",
                )
                .await?;
            tracing::info!("Request {} cancelled: {}", request_id, reason);
            request
        };

        // read after the status change so a deposit racing the cancel is
        // refunded either here or by the confirmation that made it
        let escrow = match self.store.get_escrow_for_request(request_id).await? {
            Some(escrow) if escrow.status == EscrowStatus::Escrowed => {
                Some(self.escrows.refund(escrow.id, reason).await?)
            }
            other => other,
        };

        Ok(Cancellation { request, escrow })
    }

    async fn transition_request(
        &self,
        request_id: Uuid,
        from: &[RequestStatus],
        to: RequestStatus,
        operation: &'static str,
    ) -> Result<ServiceRequest, ServiceError> {
        match self.store.update_request_status(request_id, from, to).await? {
            TransitionOutcome::Applied(request) => Ok(request),
            TransitionOutcome::Rejected(current) => Err(ServiceError::invalid_state(
                "Request",
                current.id,
                current.status.to_str(),
                operation,
            )),
        }
    }
}

fn derive_stage(
    request: &ServiceRequest,
    service_fee: Option<&ServiceFeePayment>,
    escrow: Option<&EscrowPayment>,
    revealed: bool,
    escrow_attempted: bool,
) -> PaymentStage {
    match request.status {
        RequestStatus::Completed => return PaymentStage::Completed,
        RequestStatus::Cancelled => return PaymentStage::Cancelled,
        _ => {}
    }

    let escrow_status = escrow.map(|e| e.status);
    match escrow_status {
        Some(EscrowStatus::Disputed) => return PaymentStage::Disputed,
        Some(EscrowStatus::Refunded) => return PaymentStage::Refunded,
        _ => {}
    }
    if request.status == RequestStatus::JobActive {
        return PaymentStage::JobActive;
    }

    let funded = matches!(
        escrow_status,
        Some(EscrowStatus::Escrowed | EscrowStatus::Released)
    );
    if funded && revealed {
        return PaymentStage::ContactRevealed;
    }
    if funded {
        return PaymentStage::EscrowDeposited;
    }

    match service_fee.map(|f| f.status) {
        None => PaymentStage::QuoteReview,
        Some(FeePaymentStatus::Paid) if escrow_attempted => PaymentStage::EscrowPending,
        Some(FeePaymentStatus::Paid) => PaymentStage::ServiceFeePaid,
        Some(_) => PaymentStage::ServiceFeePending,
    }
}
