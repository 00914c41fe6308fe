pub mod escrowdtos;
