//! Shared test fixtures for the relay workspace.
//!
//! Provides single, shared instances of testcontainers across all test files:
//! - PostgreSQL (port 5432)
//! - Redis (port 6379)
//!
//! Each fixture is lazily initialized once per test process. When Docker is
//! unavailable the fixture resolves to `None` and callers skip.

mod fixtures;

pub use fixtures::*;
