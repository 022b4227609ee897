//! # att-core
//!
//! Core types, configuration, and telemetry for Attache.
//!
//! This crate provides the building blocks shared by the other crates:
//! - Record identifiers (`Id`, `RecordKey`)
//! - Configuration types and loading
//! - Configuration errors
//! - Tracing subscriber setup for binaries

pub mod config;
pub mod error;
pub mod telemetry;
pub mod types;

pub use error::*;
pub use types::*;
