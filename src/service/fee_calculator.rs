// service/fee_calculator.rs
use serde::{Deserialize, Serialize};

use crate::{
    config::Config,
    service::error::ServiceError,
    utils::currency::apply_basis_points,
};

/// Breakdown of what the customer pays and how the job amount is split.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CostBreakdown {
    pub job_amount: i64,
    pub service_fee: i64,
    pub platform_fee: i64,
    pub artisan_amount: i64,
    pub total_customer_payment: i64,
}

/// Commission is `job_amount * commission_bps / 10_000` rounded half-up to
/// the kobo; the artisan receives the exact remainder of the job amount.
#[derive(Debug, Clone, Copy)]
pub struct FeeCalculator {
    service_fee: i64,
    commission_bps: u32,
}

impl FeeCalculator {
    pub fn new(service_fee: i64, commission_bps: u32) -> Self {
        Self {
            service_fee,
            commission_bps,
        }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.service_fee, config.commission_bps)
    }

    pub fn calculate_total_cost(&self, job_amount: i64) -> Result<CostBreakdown, ServiceError> {
        if job_amount < 0 {
            return Err(ServiceError::Validation(format!(
                "Job amount must not be negative, got {}",
                job_amount
            )));
        }

        let platform_fee = apply_basis_points(job_amount, self.commission_bps);
        let artisan_amount = job_amount - platform_fee;

        Ok(CostBreakdown {
            job_amount,
            service_fee: self.service_fee,
            platform_fee,
            artisan_amount,
            total_customer_payment: self.service_fee + job_amount,
        })
    }
}
