//! Testing utilities and mock implementations
//!
//! Lets the session, subscription and publish logic be exercised without a
//! live broker.

pub mod mocks;

pub use mocks::*;
