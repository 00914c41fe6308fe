// dtos/escrowdtos.rs
use std::borrow::Cow;

use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::{Validate, ValidationError};

use crate::{
    models::{escrowmodel::*, paymentmodel::*},
    service::milestone_service::EvidenceSubmission,
    utils::currency::naira_to_kobo,
};

#[derive(Debug, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub status: String,
    pub message: String,
    pub data: Option<T>,
}

impl<T> ApiResponse<T> {
    pub fn success(message: &str, data: T) -> Self {
        Self {
            status: "success".to_string(),
            message: message.to_string(),
            data: Some(data),
        }
    }
}

// Intake DTOs
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreateRequestDto {
    pub customer_id: Uuid,
    pub artisan_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct SubmitQuoteDto {
    #[validate(range(min = 100.0, max = 100000000.0, message = "Quote must be between ₦100 and ₦100,000,000"))]
    pub amount: f64, // In Naira
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ArtisanContactDto {
    #[validate(length(min = 1, max = 120, message = "Full name is required"))]
    pub full_name: String,

    #[validate(custom = "validate_phone")]
    pub phone: String,

    #[validate(email(message = "Valid email is required"))]
    pub email: String,

    #[validate(length(max = 300, message = "Address is too long"))]
    pub address: Option<String>,
}

fn validate_phone(phone: &str) -> Result<(), ValidationError> {
    let digits = phone.strip_prefix('+').unwrap_or(phone);
    if digits.len() < 10 || digits.len() > 15 || !digits.chars().all(|c| c.is_ascii_digit()) {
        let mut error = ValidationError::new("invalid_phone");
        error.message = Some(Cow::from("Phone number must have 10 to 15 digits"));
        return Err(error);
    }
    Ok(())
}

// Payment flow DTOs
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct MilestoneTemplateDto {
    #[validate(length(min = 1, max = 200, message = "Milestone title is required"))]
    pub title: String,

    #[validate(range(min = 1, message = "Order starts at 1"))]
    pub order: i32,

    #[validate(range(min = 0.01, max = 100.0, message = "Percentage must be between 0.01 and 100"))]
    pub percentage: f64,

    pub amount: Option<f64>, // In Naira

    #[serde(default)]
    pub depends_on: Vec<i32>,

    #[serde(default)]
    pub evidence_required: Vec<EvidenceKind>,

    pub approval_required: Option<bool>,
}

impl From<MilestoneTemplateDto> for MilestoneTemplate {
    fn from(dto: MilestoneTemplateDto) -> Self {
        Self {
            title: dto.title,
            order: dto.order,
            percentage: dto.percentage,
            amount: dto.amount.map(naira_to_kobo),
            depends_on: dto.depends_on,
            evidence_required: dto.evidence_required,
            approval_required: dto.approval_required.unwrap_or(true),
        }
    }
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct AcceptQuoteDto {
    pub quote_id: Uuid,

    #[serde(default)]
    pub milestones: Vec<MilestoneTemplateDto>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct CreatePlanDto {
    pub milestones: Vec<MilestoneTemplateDto>,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct InitiatePaymentDto {
    pub payment_method: PaymentMethod,

    #[validate(email(message = "Valid email is required"))]
    pub email: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct FeeEstimateQueryDto {
    #[validate(range(min = 1.0, message = "Amount must be positive"))]
    pub amount: f64, // In Naira
    pub method: PaymentMethod,
    pub provider: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FeeEstimateDto {
    pub provider: String,
    pub amount: i64,
    pub fee: i64,
    pub formatted_fee: String,
}

// Escrow & milestone DTOs
#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ReasonDto {
    #[validate(length(min = 3, max = 500, message = "Reason must be between 3 and 500 characters"))]
    pub reason: String,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct ApproverDto {
    pub approver_id: Uuid,
}

#[derive(Debug, Serialize, Deserialize, Validate)]
pub struct EvidenceDto {
    pub kind: EvidenceKind,

    #[validate(url(message = "Evidence must be a valid URL"))]
    pub url: String,

    #[validate(length(max = 500, message = "Note is too long"))]
    pub note: Option<String>,

    pub submitted_by: Uuid,
}

impl From<EvidenceDto> for EvidenceSubmission {
    fn from(dto: EvidenceDto) -> Self {
        Self {
            kind: dto.kind,
            url: dto.url,
            note: dto.note,
            submitted_by: dto.submitted_by,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
pub struct QuoteResponseDto {
    pub quote: Quote,
    pub formatted_amount: String,
}
