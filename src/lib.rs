//! Device onboarding test rig
//!
//! Drives a single provisioning run against a physical device: direct-link
//! establishment, PAKE pairing, and handoff to the infrastructure network,
//! with packet captures on both wireless interfaces.

pub mod authenticator;
pub mod capture;
pub mod commands;
pub mod common;
pub mod device;
pub mod rig;
pub mod run;
pub mod wifi;

// Re-export commonly used types for tests
pub use common::{Error, Result};
pub use run::{Run, RunOptions, RunReport};
