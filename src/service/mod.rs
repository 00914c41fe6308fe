pub mod background_jobs;
pub mod error;
pub mod escrow_service;
pub mod fee_calculator;
pub mod milestone_planner;
pub mod milestone_service;
pub mod payment_flow;
pub mod payment_provider;
pub mod verification_poller;
