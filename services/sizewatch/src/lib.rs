//! sizewatch service library crate.
//!
//! # Purpose
//! Exposes the pipeline pieces (consumers, control loop, remediation, HTTP
//! surface) for use by the binary and integration tests.
pub mod api;
pub mod config;
pub mod control_loop;
pub mod delta_logger;
pub mod notifier;
pub mod observability;
pub mod pipeline;
pub mod remediation;
pub mod size_tracker;
pub mod worker;
