//! Common test infrastructure
//!
//! Shared fixtures for the end-to-end tests. Tests should only import from
//! this module, not from internal submodules.
//!
//! # Example
//!
//! ```no_run
//! mod common;
//! use common::{SharedDb, ts};
//!
//! #[test]
//! fn test_something() {
//!     let shared = SharedDb::new();
//!     common::seed_repositories(&shared.first, 1..=3, "github.com/acme");
//! }
//! ```

mod constants;
mod fixtures;

#[allow(unused_imports)]
pub use constants::*;
#[allow(unused_imports)]
pub use fixtures::*;
