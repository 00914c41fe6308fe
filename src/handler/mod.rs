pub mod escrow;
pub mod payment;
pub mod request;
pub mod webhook;
