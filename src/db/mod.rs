pub mod db;
pub mod escrowdb;
pub mod memory;
pub mod requestdb;
pub mod store;

pub use db::DBClient;
pub use memory::MemoryStore;
pub use store::*;
