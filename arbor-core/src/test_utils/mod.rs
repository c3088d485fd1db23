//! Test utilities and helpers
//!
//! Timeout helpers for actor tests and fixtures for configs, keys and
//! switch announcements. Used by unit tests and by the integration tests
//! under `tests/`.

pub mod async_helpers;
pub mod fixtures;

pub use async_helpers::*;
pub use fixtures::*;
