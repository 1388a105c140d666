pub mod allocator;
pub mod house;
pub mod ledger;
pub mod memory;
pub mod metrics;
pub mod pgledger;
pub mod retry;
