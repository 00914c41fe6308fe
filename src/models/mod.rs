pub mod escrowmodel;
pub mod paymentmodel;
