//! Shared constants for end-to-end tests

#![allow(dead_code)]

use std::time::Duration;

/// Project key used for the seeded Bitbucket-style project.
pub const PROJECT_KEY: &str = "PROJ";

/// External service the seeded project lives on.
pub const EXTERNAL_SERVICE_ID: i64 = 1;

/// Base timestamp for tests (2024-01-01T00:00:00Z).
pub const T0: i64 = 1_704_067_200;

pub const DAY: Duration = Duration::from_secs(24 * 3600);
