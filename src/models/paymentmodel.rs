// models/paymentmodel.rs
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq, Hash)]
#[sqlx(type_name = "payment_method", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    MobileMoney,
    BankTransfer,
    Ussd,
}

impl PaymentMethod {
    pub fn to_str(&self) -> &str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::MobileMoney => "mobile_money",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Ussd => "ussd",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "request_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum RequestStatus {
    Open,
    QuoteAccepted,
    JobActive,
    Completed,
    Cancelled,
}

impl RequestStatus {
    pub fn to_str(&self) -> &str {
        match self {
            RequestStatus::Open => "open",
            RequestStatus::QuoteAccepted => "quote_accepted",
            RequestStatus::JobActive => "job_active",
            RequestStatus::Completed => "completed",
            RequestStatus::Cancelled => "cancelled",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct ServiceRequest {
    pub id: Uuid,
    pub customer_id: Uuid,
    pub artisan_id: Uuid,
    pub status: RequestStatus,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct Quote {
    pub id: Uuid,
    pub request_id: Uuid,
    pub artisan_id: Uuid,
    pub amount: i64,
    pub accepted_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "fee_payment_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum FeePaymentStatus {
    Pending,
    Paid,
    Failed,
    Refunded,
}

impl FeePaymentStatus {
    pub fn to_str(&self) -> &str {
        match self {
            FeePaymentStatus::Pending => "pending",
            FeePaymentStatus::Paid => "paid",
            FeePaymentStatus::Failed => "failed",
            FeePaymentStatus::Refunded => "refunded",
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct ServiceFeePayment {
    pub id: Uuid,
    pub request_id: Uuid,
    pub amount: i64,
    pub status: FeePaymentStatus,
    pub transaction_ref: Option<String>,
    pub paid_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "payment_target", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum PaymentTarget {
    ServiceFee,
    Escrow,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, sqlx::Type, PartialEq, Eq)]
#[sqlx(type_name = "attempt_status", rename_all = "snake_case")]
#[serde(rename_all = "snake_case")]
pub enum AttemptStatus {
    Initiated,
    Succeeded,
    Failed,
}

/// One gateway `initiate` call. The reference is unique and never reused.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct PaymentAttempt {
    pub reference: String,
    pub request_id: Uuid,
    pub target: PaymentTarget,
    pub target_id: Uuid,
    pub provider: String,
    pub method: PaymentMethod,
    pub amount: i64,
    pub status: AttemptStatus,
    pub failure_reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub settled_at: Option<DateTime<Utc>>,
    /// Set once the settled outcome has been applied to the fee or escrow.
    pub applied_at: Option<DateTime<Utc>>,
}

/// Raw contact details as held by the platform's profile store.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct ArtisanContact {
    pub artisan_id: Uuid,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub address: Option<String>,
}

/// What the reveal gate hands back. Only ever built by the gate.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct ArtisanContactInfo {
    pub artisan_id: Uuid,
    pub full_name: String,
    pub phone: String,
    pub email: String,
    pub address: Option<String>,
    pub is_revealed: bool,
    pub revealed_at: DateTime<Utc>,
}

/// Audit trail of the first reveal per request.
#[derive(Debug, Serialize, Deserialize, Clone, sqlx::FromRow, PartialEq)]
pub struct ContactReveal {
    pub request_id: Uuid,
    pub artisan_id: Uuid,
    pub revealed_at: DateTime<Utc>,
}

#[derive(Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStage {
    QuoteReview,
    ServiceFeePending,
    ServiceFeePaid,
    EscrowPending,
    EscrowDeposited,
    ContactRevealed,
    JobActive,
    Completed,
    Disputed,
    Refunded,
    Cancelled,
}

/// Read-only projection served to the UI for status polling.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct PaymentFlowState {
    pub request_id: Uuid,
    pub stage: PaymentStage,
    pub request_status: RequestStatus,
    pub service_fee: Option<ServiceFeePayment>,
    pub escrow: Option<crate::models::escrowmodel::EscrowPayment>,
    pub contact_revealed_at: Option<DateTime<Utc>>,
    pub last_failure: Option<String>,
}

pub fn generate_transaction_reference(prefix: &str) -> String {
    format!(
        "{}_{}",
        prefix,
        &uuid::Uuid::new_v4().to_string().replace('-', "").to_uppercase()[..16]
    )
}
