//! Repo Upkeep Library
//!
//! Fleet maintenance for a code host mirror: staleness tracking, scan
//! scheduling, and permission sync queues over one shared SQLite database.

pub mod background_jobs;
pub mod clock;
pub mod code_host;
pub mod config;
pub mod error;
pub mod metrics;
pub mod permission_jobs;
pub mod policy;
pub mod repos;
pub mod scan;
pub mod sqlite_persistence;
pub mod staleness;
pub mod store;
pub mod sync;

// Re-export commonly used types for convenience
pub use clock::{Clock, SystemClock};
pub use error::{StoreError, StoreResult};
pub use store::UpkeepDb;
