// service/verification_poller.rs
use std::{fmt::Display, future::Future, time::Duration};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::{config::Config, service::payment_provider::GatewayStatus};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum PollOutcome {
    Success { attempts: u32 },
    Failed { attempts: u32 },
    /// Budget exhausted while the gateway still reported pending.
    Timeout { attempts: u32 },
    Cancelled { attempts: u32 },
}

/// Bounded re-verification of a single payment reference.
///
/// The first probe runs immediately; later probes are spaced by `interval`.
/// Transient probe errors are logged and consume budget like a pending
/// answer. Cancelling through the watch channel stops polling between
/// probes and never touches payment state.
#[derive(Debug, Clone, Copy)]
pub struct VerificationPoller {
    interval: Duration,
    max_attempts: u32,
}

impl VerificationPoller {
    pub fn new(interval: Duration, max_attempts: u32) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(
            config.verification_interval(),
            config.verification_max_attempts,
        )
    }

    /// How long a single run may keep an attempt in flight.
    pub fn budget(&self) -> Duration {
        self.interval * self.max_attempts
    }

    pub async fn run<F, Fut, E>(
        &self,
        reference: &str,
        mut cancel: watch::Receiver<bool>,
        mut probe: F,
    ) -> PollOutcome
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<GatewayStatus, E>>,
        E: Display,
    {
        let mut attempts = 0;

        loop {
            if *cancel.borrow() {
                tracing::info!("Verification of {} cancelled after {} attempts", reference, attempts);
                return PollOutcome::Cancelled { attempts };
            }

            attempts += 1;
            match probe().await {
                Ok(GatewayStatus::Success) => return PollOutcome::Success { attempts },
                Ok(GatewayStatus::Failed) => return PollOutcome::Failed { attempts },
                Ok(GatewayStatus::Pending) => {
                    tracing::debug!("Payment {} still pending (attempt {})", reference, attempts)
                }
                Err(e) => tracing::warn!(
                    "Verification attempt {} for {} failed: {}",
                    attempts,
                    reference,
                    e
                ),
            }

            if attempts >= self.max_attempts {
                tracing::warn!(
                    "Payment {} not confirmed after {} attempts",
                    reference,
                    attempts
                );
                return PollOutcome::Timeout { attempts };
            }

            if self.wait(&mut cancel).await {
                tracing::info!("Verification of {} cancelled after {} attempts", reference, attempts);
                return PollOutcome::Cancelled { attempts };
            }
        }
    }

    /// Sleeps one interval; true when cancellation arrived first.
    async fn wait(&self, cancel: &mut watch::Receiver<bool>) -> bool {
        let sleep = tokio::time::sleep(self.interval);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return false,
                changed = cancel.changed() => match changed {
                    Ok(()) if *cancel.borrow() => return true,
                    Ok(()) => continue,
                    // sender gone: nobody can cancel any more
                    Err(_) => {
                        (&mut sleep).await;
                        return false;
                    }
                },
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::{
        atomic::{AtomicU32, Ordering},
        Arc,
    };

    use super::*;

    fn scripted(
        calls: Arc<AtomicU32>,
        answer: impl Fn(u32) -> Result<GatewayStatus, String> + Clone,
    ) -> impl FnMut() -> std::pin::Pin<Box<dyn Future<Output = Result<GatewayStatus, String>> + Send>>
    {
        move || {
            let n = calls.fetch_add(1, Ordering::SeqCst) + 1;
            let result = answer(n);
            Box::pin(async move { result })
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_pending_times_out_after_budget() {
        let poller = VerificationPoller::new(Duration::from_secs(10), 30);
        let calls = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = watch::channel(false);

        let started = tokio::time::Instant::now();
        let outcome = poller
            .run("ESC_T", rx, scripted(calls.clone(), |_| Ok(GatewayStatus::Pending)))
            .await;

        assert_eq!(outcome, PollOutcome::Timeout { attempts: 30 });
        assert_eq!(calls.load(Ordering::SeqCst), 30);
        assert_eq!(started.elapsed(), Duration::from_secs(290));
        assert!(started.elapsed() < poller.budget());
    }

    #[tokio::test(start_paused = true)]
    async fn test_success_stops_polling() {
        let poller = VerificationPoller::new(Duration::from_secs(10), 30);
        let calls = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = watch::channel(false);

        let outcome = poller
            .run(
                "SVC_S",
                rx,
                scripted(calls.clone(), |n| {
                    Ok(if n < 3 {
                        GatewayStatus::Pending
                    } else {
                        GatewayStatus::Success
                    })
                }),
            )
            .await;

        assert_eq!(outcome, PollOutcome::Success { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_decline_is_not_a_timeout() {
        let poller = VerificationPoller::new(Duration::from_secs(10), 30);
        let (_tx, rx) = watch::channel(false);

        let outcome = poller
            .run(
                "SVC_F",
                rx,
                scripted(Arc::new(AtomicU32::new(0)), |_| Ok(GatewayStatus::Failed)),
            )
            .await;
        assert_eq!(outcome, PollOutcome::Failed { attempts: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_errors_consume_budget() {
        let poller = VerificationPoller::new(Duration::from_secs(1), 5);
        let calls = Arc::new(AtomicU32::new(0));
        let (_tx, rx) = watch::channel(false);

        let outcome = poller
            .run(
                "SVC_E",
                rx,
                scripted(calls.clone(), |_| Err("connection reset".to_string())),
            )
            .await;

        assert_eq!(outcome, PollOutcome::Timeout { attempts: 5 });
        assert_eq!(calls.load(Ordering::SeqCst), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_between_probes() {
        let poller = VerificationPoller::new(Duration::from_secs(10), 30);
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);

        let probe_calls = calls.clone();
        let handle = tokio::spawn(async move {
            poller
                .run("ESC_C", rx, scripted(probe_calls, |_| Ok(GatewayStatus::Pending)))
                .await
        });

        tokio::time::sleep(Duration::from_secs(25)).await;
        tx.send(true).unwrap();

        let outcome = handle.await.unwrap();
        assert_eq!(outcome, PollOutcome::Cancelled { attempts: 3 });
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_sender_keeps_polling() {
        let poller = VerificationPoller::new(Duration::from_secs(10), 4);
        let calls = Arc::new(AtomicU32::new(0));
        let (tx, rx) = watch::channel(false);
        drop(tx);

        let outcome = poller
            .run("ESC_D", rx, scripted(calls.clone(), |_| Ok(GatewayStatus::Pending)))
            .await;
        assert_eq!(outcome, PollOutcome::Timeout { attempts: 4 });
    }
}
