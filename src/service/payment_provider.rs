// service/payment_provider.rs
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    config::Config,
    models::paymentmodel::PaymentMethod,
    utils::currency::{apply_basis_points, kobo_to_naira, naira_to_kobo},
};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("HTTP error talking to {provider}: {source}")]
    Http {
        provider: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{provider} rejected the request: {message}")]
    Provider { provider: String, message: String },

    #[error("{provider} did not answer within {secs}s")]
    Timeout { provider: String, secs: u64 },

    #[error("No payment provider named '{0}' is configured")]
    UnknownProvider(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InitiatePayment {
    pub reference: String,
    /// Amount in kobo.
    pub amount: i64,
    pub method: PaymentMethod,
    /// Payer identity understood by the providers (an email address).
    pub payer_ref: String,
    pub metadata: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentInitiation {
    pub provider: String,
    pub reference: String,
    pub redirect_url: Option<String>,
    pub instructions: Option<String>,
    pub fee: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayStatus {
    Success,
    Failed,
    Pending,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PaymentVerification {
    pub reference: String,
    pub status: GatewayStatus,
    /// Amount in kobo actually collected.
    pub paid_amount: i64,
    pub channel: Option<String>,
    pub gateway_reference: Option<String>,
    pub message: Option<String>,
}

/// Uniform contract over an external payment provider.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    fn name(&self) -> &str;

    async fn initiate(&self, request: &InitiatePayment) -> Result<PaymentInitiation, GatewayError>;

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, GatewayError>;

    /// Provider charge for collecting `amount` kobo through `method`.
    fn estimate_fee(&self, amount: i64, method: PaymentMethod) -> i64;
}

/// Percentage fee with optional flat add-on and cap, all in kobo.
#[derive(Debug, Clone, Copy)]
struct FeeRule {
    bps: u32,
    flat: i64,
    flat_waived_below: i64,
    cap: Option<i64>,
}

impl FeeRule {
    fn apply(&self, amount: i64) -> i64 {
        let mut fee = apply_basis_points(amount, self.bps);
        if amount >= self.flat_waived_below {
            fee += self.flat;
        }
        match self.cap {
            Some(cap) => fee.min(cap),
            None => fee,
        }
    }
}

pub struct PaystackGateway {
    secret_key: String,
    base_url: String,
    callback_url: String,
    client: reqwest::Client,
}

impl PaystackGateway {
    pub fn new(secret_key: String, callback_url: String) -> Self {
        Self {
            secret_key,
            base_url: "https://api.paystack.co".to_string(),
            callback_url,
            client: reqwest::Client::new(),
        }
    }

    fn http_error(&self, source: reqwest::Error) -> GatewayError {
        GatewayError::Http {
            provider: self.name().to_string(),
            source,
        }
    }

    fn channel(method: PaymentMethod) -> &'static str {
        match method {
            PaymentMethod::Card => "card",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Ussd => "ussd",
        }
    }
}

#[async_trait]
impl PaymentGateway for PaystackGateway {
    fn name(&self) -> &str {
        "paystack"
    }

    async fn initiate(&self, request: &InitiatePayment) -> Result<PaymentInitiation, GatewayError> {
        let payload = serde_json::json!({
            "email": request.payer_ref,
            "amount": request.amount,
            "reference": request.reference,
            "currency": "NGN",
            "callback_url": self.callback_url,
            "metadata": request.metadata.clone().unwrap_or(serde_json::json!({})),
            "channels": [Self::channel(request.method)]
        });

        let response = self
            .client
            .post(format!("{}/transaction/initialize", self.base_url))
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let response_body: serde_json::Value =
            response.json().await.map_err(|e| self.http_error(e))?;

        if response_body["status"].as_bool().unwrap_or(false) {
            let data = &response_body["data"];
            Ok(PaymentInitiation {
                provider: self.name().to_string(),
                reference: data["reference"]
                    .as_str()
                    .unwrap_or(&request.reference)
                    .to_string(),
                redirect_url: data["authorization_url"].as_str().map(str::to_string),
                instructions: None,
                fee: self.estimate_fee(request.amount, request.method),
            })
        } else {
            Err(GatewayError::Provider {
                provider: self.name().to_string(),
                message: response_body["message"]
                    .as_str()
                    .unwrap_or("Payment initialization failed")
                    .to_string(),
            })
        }
    }

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, GatewayError> {
        let url = format!("{}/transaction/verify/{}", self.base_url, reference);

        let response = self
            .client
            .get(&url)
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let response_body: serde_json::Value =
            response.json().await.map_err(|e| self.http_error(e))?;

        if !response_body["status"].as_bool().unwrap_or(false) {
            return Err(GatewayError::Provider {
                provider: self.name().to_string(),
                message: response_body["message"]
                    .as_str()
                    .unwrap_or("Verification failed")
                    .to_string(),
            });
        }

        let data = &response_body["data"];
        // "abandoned" means the customer has not finished paying yet
        let status = match data["status"].as_str() {
            Some("success") => GatewayStatus::Success,
            Some("failed") | Some("reversed") => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        };

        Ok(PaymentVerification {
            reference: reference.to_string(),
            status,
            paid_amount: data["amount"].as_i64().unwrap_or(0),
            channel: data["channel"].as_str().map(str::to_string),
            gateway_reference: data["id"].as_i64().map(|id| id.to_string()),
            message: data["gateway_response"].as_str().map(str::to_string),
        })
    }

    fn estimate_fee(&self, amount: i64, method: PaymentMethod) -> i64 {
        let rule = match method {
            PaymentMethod::Card => FeeRule {
                bps: 150,
                flat: 10_000,
                flat_waived_below: 250_000,
                cap: Some(200_000),
            },
            PaymentMethod::BankTransfer => FeeRule {
                bps: 100,
                flat: 0,
                flat_waived_below: 0,
                cap: Some(30_000),
            },
            PaymentMethod::Ussd | PaymentMethod::MobileMoney => FeeRule {
                bps: 150,
                flat: 0,
                flat_waived_below: 0,
                cap: Some(200_000),
            },
        };
        rule.apply(amount)
    }
}

pub struct FlutterwaveGateway {
    secret_key: String,
    base_url: String,
    redirect_url: String,
    client: reqwest::Client,
}

impl FlutterwaveGateway {
    pub fn new(secret_key: String, redirect_url: String) -> Self {
        Self {
            secret_key,
            base_url: "https://api.flutterwave.com/v3".to_string(),
            redirect_url,
            client: reqwest::Client::new(),
        }
    }

    fn http_error(&self, source: reqwest::Error) -> GatewayError {
        GatewayError::Http {
            provider: self.name().to_string(),
            source,
        }
    }

    fn payment_option(method: PaymentMethod) -> &'static str {
        match method {
            PaymentMethod::Card => "card",
            PaymentMethod::MobileMoney => "mobilemoney",
            PaymentMethod::BankTransfer => "banktransfer",
            PaymentMethod::Ussd => "ussd",
        }
    }
}

#[async_trait]
impl PaymentGateway for FlutterwaveGateway {
    fn name(&self) -> &str {
        "flutterwave"
    }

    async fn initiate(&self, request: &InitiatePayment) -> Result<PaymentInitiation, GatewayError> {
        let payload = serde_json::json!({
            "tx_ref": request.reference,
            "amount": kobo_to_naira(request.amount),
            "currency": "NGN",
            "redirect_url": self.redirect_url,
            "payment_options": Self::payment_option(request.method),
            "customer": {
                "email": request.payer_ref,
            },
            "customizations": {
                "title": "Verinest Service Payment",
                "description": "Payment held in escrow until the job is done",
            },
            "meta": request.metadata.clone().unwrap_or(serde_json::json!({}))
        });

        let response = self
            .client
            .post(format!("{}/payments", self.base_url))
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .header("Content-Type", "application/json")
            .json(&payload)
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let response_body: serde_json::Value =
            response.json().await.map_err(|e| self.http_error(e))?;

        if response_body["status"].as_str() == Some("success") {
            let data = &response_body["data"];
            Ok(PaymentInitiation {
                provider: self.name().to_string(),
                reference: request.reference.clone(),
                redirect_url: data["link"].as_str().map(str::to_string),
                instructions: None,
                fee: self.estimate_fee(request.amount, request.method),
            })
        } else {
            Err(GatewayError::Provider {
                provider: self.name().to_string(),
                message: response_body["message"]
                    .as_str()
                    .unwrap_or("Payment initialization failed")
                    .to_string(),
            })
        }
    }

    async fn verify(&self, reference: &str) -> Result<PaymentVerification, GatewayError> {
        let url = format!("{}/transactions/verify_by_reference", self.base_url);

        let response = self
            .client
            .get(&url)
            .query(&[("tx_ref", reference)])
            .header("Authorization", format!("Bearer {}", self.secret_key))
            .send()
            .await
            .map_err(|e| self.http_error(e))?;

        let response_body: serde_json::Value =
            response.json().await.map_err(|e| self.http_error(e))?;

        if response_body["status"].as_str() != Some("success") {
            // Flutterwave answers "error" until the customer has paid
            return Ok(PaymentVerification {
                reference: reference.to_string(),
                status: GatewayStatus::Pending,
                paid_amount: 0,
                channel: None,
                gateway_reference: None,
                message: response_body["message"].as_str().map(str::to_string),
            });
        }

        let data = &response_body["data"];
        let status = match data["status"].as_str() {
            Some("successful") => GatewayStatus::Success,
            Some("failed") | Some("cancelled") => GatewayStatus::Failed,
            _ => GatewayStatus::Pending,
        };

        Ok(PaymentVerification {
            reference: reference.to_string(),
            status,
            paid_amount: naira_to_kobo(data["amount"].as_f64().unwrap_or(0.0)),
            channel: data["payment_type"].as_str().map(str::to_string),
            gateway_reference: data["flw_ref"].as_str().map(str::to_string),
            message: data["processor_response"].as_str().map(str::to_string),
        })
    }

    fn estimate_fee(&self, amount: i64, method: PaymentMethod) -> i64 {
        let rule = match method {
            PaymentMethod::Card | PaymentMethod::Ussd => FeeRule {
                bps: 140,
                flat: 0,
                flat_waived_below: 0,
                cap: Some(200_000),
            },
            PaymentMethod::BankTransfer => FeeRule {
                bps: 100,
                flat: 0,
                flat_waived_below: 0,
                cap: None,
            },
            PaymentMethod::MobileMoney => FeeRule {
                bps: 200,
                flat: 0,
                flat_waived_below: 0,
                cap: None,
            },
        };
        rule.apply(amount)
    }
}

/// Primary/secondary provider selection. `initiate` falls back to the
/// secondary exactly once; `verify` goes to the provider that handled the
/// attempt.
pub struct PaymentProviderService {
    primary: Arc<dyn PaymentGateway>,
    secondary: Option<Arc<dyn PaymentGateway>>,
    timeout: Duration,
}

impl PaymentProviderService {
    pub fn new(
        primary: Arc<dyn PaymentGateway>,
        secondary: Option<Arc<dyn PaymentGateway>>,
        timeout: Duration,
    ) -> Self {
        Self {
            primary,
            secondary,
            timeout,
        }
    }

    pub fn from_config(config: &Config) -> Result<Self, GatewayError> {
        let build = |name: &str| -> Result<Arc<dyn PaymentGateway>, GatewayError> {
            match name {
                "paystack" => Ok(Arc::new(PaystackGateway::new(
                    config.paystack_secret_key.clone(),
                    config.payment_callback_url.clone(),
                ))),
                "flutterwave" => Ok(Arc::new(FlutterwaveGateway::new(
                    config.flutterwave_secret_key.clone(),
                    config.payment_callback_url.clone(),
                ))),
                other => Err(GatewayError::UnknownProvider(other.to_string())),
            }
        };

        let primary = build(&config.primary_payment_provider)?;
        let secondary = if config.secondary_payment_provider.is_empty()
            || config.secondary_payment_provider == config.primary_payment_provider
        {
            None
        } else {
            Some(build(&config.secondary_payment_provider)?)
        };

        Ok(Self::new(primary, secondary, config.gateway_timeout()))
    }

    pub fn primary_name(&self) -> &str {
        self.primary.name()
    }

    fn gateway(&self, provider: &str) -> Result<&Arc<dyn PaymentGateway>, GatewayError> {
        if self.primary.name() == provider {
            return Ok(&self.primary);
        }
        match &self.secondary {
            Some(secondary) if secondary.name() == provider => Ok(secondary),
            _ => Err(GatewayError::UnknownProvider(provider.to_string())),
        }
    }

    async fn initiate_with(
        &self,
        gateway: &Arc<dyn PaymentGateway>,
        request: &InitiatePayment,
    ) -> Result<PaymentInitiation, GatewayError> {
        match tokio::time::timeout(self.timeout, gateway.initiate(request)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                provider: gateway.name().to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub async fn initiate(&self, request: InitiatePayment) -> Result<PaymentInitiation, GatewayError> {
        let primary_error = match self.initiate_with(&self.primary, &request).await {
            Ok(initiation) => return Ok(initiation),
            Err(e) => e,
        };

        let Some(secondary) = &self.secondary else {
            return Err(primary_error);
        };

        tracing::warn!(
            "Primary provider {} failed for {}: {}; falling back to {}",
            self.primary.name(),
            request.reference,
            primary_error,
            secondary.name()
        );

        // The primary may have registered the reference before failing, so
        // the fallback attempt gets a reference of its own.
        let fallback = InitiatePayment {
            reference: format!("{}_{}", request.reference, fallback_suffix(secondary.name())),
            ..request
        };
        self.initiate_with(secondary, &fallback).await
    }

    pub async fn verify(
        &self,
        provider: &str,
        reference: &str,
    ) -> Result<PaymentVerification, GatewayError> {
        let gateway = self.gateway(provider)?;
        match tokio::time::timeout(self.timeout, gateway.verify(reference)).await {
            Ok(result) => result,
            Err(_) => Err(GatewayError::Timeout {
                provider: provider.to_string(),
                secs: self.timeout.as_secs(),
            }),
        }
    }

    pub fn estimate_fee(
        &self,
        provider: Option<&str>,
        amount: i64,
        method: PaymentMethod,
    ) -> Result<i64, GatewayError> {
        let gateway = match provider {
            Some(name) => self.gateway(name)?,
            None => &self.primary,
        };
        Ok(gateway.estimate_fee(amount, method))
    }
}

fn fallback_suffix(provider: &str) -> String {
    provider
        .chars()
        .take(3)
        .collect::<String>()
        .to_uppercase()
}

#[cfg(test)]
pub(crate) mod testing {
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;

    use super::*;

    pub(crate) enum InitiateBehaviour {
        Succeed,
        Fail,
        Hang,
    }

    /// In-process gateway driven by a script of verification outcomes.
    pub(crate) struct ScriptedGateway {
        name: String,
        initiate: Mutex<InitiateBehaviour>,
        verify_script: Mutex<VecDeque<Result<GatewayStatus, String>>>,
        default_status: Mutex<GatewayStatus>,
        amounts: Mutex<HashMap<String, i64>>,
        paid_override: Mutex<Option<i64>>,
        pub(crate) initiated: Mutex<Vec<String>>,
        pub(crate) verify_calls: Mutex<u32>,
    }

    impl ScriptedGateway {
        pub(crate) fn new(name: &str) -> Self {
            Self {
                name: name.to_string(),
                initiate: Mutex::new(InitiateBehaviour::Succeed),
                verify_script: Mutex::new(VecDeque::new()),
                default_status: Mutex::new(GatewayStatus::Pending),
                amounts: Mutex::new(HashMap::new()),
                paid_override: Mutex::new(None),
                initiated: Mutex::new(Vec::new()),
                verify_calls: Mutex::new(0),
            }
        }

        pub(crate) fn set_initiate(&self, behaviour: InitiateBehaviour) {
            *self.initiate.lock().unwrap() = behaviour;
        }

        pub(crate) fn set_default_status(&self, status: GatewayStatus) {
            *self.default_status.lock().unwrap() = status;
        }

        pub(crate) fn push_verify(&self, outcome: Result<GatewayStatus, String>) {
            self.verify_script.lock().unwrap().push_back(outcome);
        }

        pub(crate) fn set_paid_amount(&self, amount: i64) {
            *self.paid_override.lock().unwrap() = Some(amount);
        }

        pub(crate) fn verify_count(&self) -> u32 {
            *self.verify_calls.lock().unwrap()
        }
    }

    #[async_trait]
    impl PaymentGateway for ScriptedGateway {
        fn name(&self) -> &str {
            &self.name
        }

        async fn initiate(&self, request: &InitiatePayment) -> Result<PaymentInitiation, GatewayError> {
            let hang = matches!(*self.initiate.lock().unwrap(), InitiateBehaviour::Hang);
            if hang {
                tokio::time::sleep(Duration::from_secs(3_600)).await;
            }
            if matches!(*self.initiate.lock().unwrap(), InitiateBehaviour::Fail) {
                return Err(GatewayError::Provider {
                    provider: self.name.clone(),
                    message: "service unavailable".to_string(),
                });
            }

            self.amounts
                .lock()
                .unwrap()
                .insert(request.reference.clone(), request.amount);
            self.initiated.lock().unwrap().push(request.reference.clone());

            Ok(PaymentInitiation {
                provider: self.name.clone(),
                reference: request.reference.clone(),
                redirect_url: Some(format!("https://pay.example/{}", request.reference)),
                instructions: None,
                fee: self.estimate_fee(request.amount, request.method),
            })
        }

        async fn verify(&self, reference: &str) -> Result<PaymentVerification, GatewayError> {
            *self.verify_calls.lock().unwrap() += 1;
            let scripted = self.verify_script.lock().unwrap().pop_front();
            let status = match scripted {
                Some(Ok(status)) => status,
                Some(Err(message)) => {
                    return Err(GatewayError::Provider {
                        provider: self.name.clone(),
                        message,
                    })
                }
                None => *self.default_status.lock().unwrap(),
            };

            let paid_amount = match *self.paid_override.lock().unwrap() {
                Some(amount) => amount,
                None => self
                    .amounts
                    .lock()
                    .unwrap()
                    .get(reference)
                    .copied()
                    .unwrap_or(0),
            };

            Ok(PaymentVerification {
                reference: reference.to_string(),
                status,
                paid_amount,
                channel: Some("card".to_string()),
                gateway_reference: None,
                message: None,
            })
        }

        fn estimate_fee(&self, amount: i64, _method: PaymentMethod) -> i64 {
            apply_basis_points(amount, 150)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::*;
    use super::*;

    fn request(reference: &str) -> InitiatePayment {
        InitiatePayment {
            reference: reference.to_string(),
            amount: 200_000,
            method: PaymentMethod::Card,
            payer_ref: "customer@example.com".to_string(),
            metadata: None,
        }
    }

    #[tokio::test]
    async fn test_primary_success_skips_secondary() {
        let primary = Arc::new(ScriptedGateway::new("paystack"));
        let secondary = Arc::new(ScriptedGateway::new("flutterwave"));
        let service = PaymentProviderService::new(
            primary.clone(),
            Some(secondary.clone()),
            Duration::from_secs(5),
        );

        let initiation = service.initiate(request("SVC_1")).await.unwrap();
        assert_eq!(initiation.provider, "paystack");
        assert_eq!(initiation.reference, "SVC_1");
        assert!(secondary.initiated.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_falls_back_once_on_primary_error() {
        let primary = Arc::new(ScriptedGateway::new("paystack"));
        primary.set_initiate(InitiateBehaviour::Fail);
        let secondary = Arc::new(ScriptedGateway::new("flutterwave"));
        let service = PaymentProviderService::new(
            primary.clone(),
            Some(secondary.clone()),
            Duration::from_secs(5),
        );

        let initiation = service.initiate(request("SVC_2")).await.unwrap();
        assert_eq!(initiation.provider, "flutterwave");
        assert_ne!(initiation.reference, "SVC_2");
        assert_eq!(secondary.initiated.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_falls_back_on_primary_timeout() {
        let primary = Arc::new(ScriptedGateway::new("paystack"));
        primary.set_initiate(InitiateBehaviour::Hang);
        let secondary = Arc::new(ScriptedGateway::new("flutterwave"));
        let service = PaymentProviderService::new(
            primary,
            Some(secondary.clone()),
            Duration::from_secs(5),
        );

        let initiation = service.initiate(request("SVC_3")).await.unwrap();
        assert_eq!(initiation.provider, "flutterwave");
    }

    #[tokio::test]
    async fn test_both_failing_surfaces_error() {
        let primary = Arc::new(ScriptedGateway::new("paystack"));
        primary.set_initiate(InitiateBehaviour::Fail);
        let secondary = Arc::new(ScriptedGateway::new("flutterwave"));
        secondary.set_initiate(InitiateBehaviour::Fail);
        let service =
            PaymentProviderService::new(primary, Some(secondary), Duration::from_secs(5));

        let err = service.initiate(request("SVC_4")).await.unwrap_err();
        assert!(matches!(err, GatewayError::Provider { ref provider, .. } if provider == "flutterwave"));
    }

    #[tokio::test]
    async fn test_verify_routes_to_named_provider() {
        let primary = Arc::new(ScriptedGateway::new("paystack"));
        let secondary = Arc::new(ScriptedGateway::new("flutterwave"));
        secondary.set_default_status(GatewayStatus::Success);
        let service = PaymentProviderService::new(
            primary.clone(),
            Some(secondary.clone()),
            Duration::from_secs(5),
        );

        let verification = service.verify("flutterwave", "ESC_1").await.unwrap();
        assert_eq!(verification.status, GatewayStatus::Success);
        assert_eq!(primary.verify_count(), 0);
        assert!(matches!(
            service.verify("stripe", "ESC_1").await,
            Err(GatewayError::UnknownProvider(_))
        ));
    }

    #[test]
    fn test_fee_schedules_differ_per_provider_and_method() {
        let paystack = PaystackGateway::new("sk".to_string(), String::new());
        let flutterwave = FlutterwaveGateway::new("sk".to_string(), String::new());

        // ₦10,000 by card: 1.5% + ₦100
        assert_eq!(paystack.estimate_fee(1_000_000, PaymentMethod::Card), 25_000);
        // flat charge waived under ₦2,500
        assert_eq!(paystack.estimate_fee(200_000, PaymentMethod::Card), 3_000);
        // capped at ₦2,000
        assert_eq!(paystack.estimate_fee(100_000_000, PaymentMethod::Card), 200_000);
        assert_eq!(paystack.estimate_fee(1_000_000, PaymentMethod::BankTransfer), 10_000);
        assert_eq!(flutterwave.estimate_fee(1_000_000, PaymentMethod::Card), 14_000);
        assert_eq!(flutterwave.estimate_fee(1_000_000, PaymentMethod::MobileMoney), 20_000);
    }
}
