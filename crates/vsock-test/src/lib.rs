//! Integration-test crate: see `tests/integration.rs`.
