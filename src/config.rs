// config.rs
use std::time::Duration;

/// Service fee charged per request, in kobo (₦2,000).
pub const DEFAULT_SERVICE_FEE: i64 = 200_000;
/// Platform commission on the job amount, in basis points (10%).
pub const DEFAULT_COMMISSION_BPS: u32 = 1_000;
/// Largest amount a single milestone may carry, in kobo (₦50,000,000).
pub const DEFAULT_MILESTONE_CAP: i64 = 5_000_000_000;

#[derive(Debug, Clone)]
pub struct Config {
    /// Unset means the in-process store is used.
    pub database_url: Option<String>,
    pub port: u16,
    pub log_level: String,
    // Payment provider configurations
    pub paystack_secret_key: String,
    pub flutterwave_secret_key: String,
    pub flutterwave_webhook_hash: String,
    pub primary_payment_provider: String,
    pub secondary_payment_provider: String,
    pub payment_callback_url: String,
    pub gateway_timeout_secs: u64,
    // Engine constants
    pub service_fee: i64,
    pub commission_bps: u32,
    pub milestone_cap: i64,
    pub verification_interval_secs: u64,
    pub verification_max_attempts: u32,
    pub reconcile_interval_secs: u64,
}

impl Config {
    pub fn init() -> Config {
        let database_url = std::env::var("DATABASE_URL").ok().filter(|v| !v.is_empty());

        // Payment provider configurations (with defaults)
        let paystack_secret_key = std::env::var("PAYSTACK_SECRET_KEY")
            .unwrap_or_else(|_| "test_secret_key".to_string());
        let flutterwave_secret_key = std::env::var("FLUTTERWAVE_SECRET_KEY")
            .unwrap_or_else(|_| "test_secret_key".to_string());
        let flutterwave_webhook_hash = std::env::var("FLUTTERWAVE_WEBHOOK_HASH")
            .unwrap_or_else(|_| flutterwave_secret_key.clone());
        let primary_payment_provider = std::env::var("PRIMARY_PAYMENT_PROVIDER")
            .unwrap_or_else(|_| "paystack".to_string());
        let secondary_payment_provider = std::env::var("SECONDARY_PAYMENT_PROVIDER")
            .unwrap_or_else(|_| "flutterwave".to_string());
        let payment_callback_url = std::env::var("PAYMENT_CALLBACK_URL")
            .unwrap_or_else(|_| "http://localhost:8000/api/payments/callback".to_string());

        Config {
            database_url,
            port: env_or("PORT", 8000),
            log_level: std::env::var("LOG_LEVEL").unwrap_or_else(|_| "debug".to_string()),
            paystack_secret_key,
            flutterwave_secret_key,
            flutterwave_webhook_hash,
            primary_payment_provider,
            secondary_payment_provider,
            payment_callback_url,
            gateway_timeout_secs: env_or("GATEWAY_TIMEOUT_SECS", 15),
            service_fee: env_or("SERVICE_FEE_KOBO", DEFAULT_SERVICE_FEE),
            commission_bps: env_or("PLATFORM_COMMISSION_BPS", DEFAULT_COMMISSION_BPS),
            milestone_cap: env_or("MILESTONE_CAP_KOBO", DEFAULT_MILESTONE_CAP),
            verification_interval_secs: env_or("VERIFICATION_INTERVAL_SECS", 10),
            verification_max_attempts: env_or("VERIFICATION_MAX_ATTEMPTS", 30),
            reconcile_interval_secs: env_or("RECONCILE_INTERVAL_SECS", 300),
        }
    }

    pub fn gateway_timeout(&self) -> Duration {
        Duration::from_secs(self.gateway_timeout_secs)
    }

    pub fn verification_interval(&self) -> Duration {
        Duration::from_secs(self.verification_interval_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            database_url: None,
            port: 8000,
            log_level: "debug".to_string(),
            paystack_secret_key: "test_secret_key".to_string(),
            flutterwave_secret_key: "test_secret_key".to_string(),
            flutterwave_webhook_hash: "test_secret_key".to_string(),
            primary_payment_provider: "paystack".to_string(),
            secondary_payment_provider: "flutterwave".to_string(),
            payment_callback_url: "http://localhost:8000/api/payments/callback".to_string(),
            gateway_timeout_secs: 15,
            service_fee: DEFAULT_SERVICE_FEE,
            commission_bps: DEFAULT_COMMISSION_BPS,
            milestone_cap: DEFAULT_MILESTONE_CAP,
            verification_interval_secs: 10,
            verification_max_attempts: 30,
            reconcile_interval_secs: 300,
        }
    }
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                tracing::warn!("Ignoring unparsable {}={:?}, using default", key, raw);
                default
            }
        },
        Err(_) => default,
    }
}
