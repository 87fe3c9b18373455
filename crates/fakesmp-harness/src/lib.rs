//! Scenario harness for fakesmp.
//!
//! This crate provides:
//! - A catalogue of client programs exercising the emulated machine
//! - A runner that classifies each iteration by the violations it produced
//! - Structured JSONL run logs with a SHA-256 artifact index

#![deny(unsafe_code)]

pub mod runner;
#[allow(unsafe_code)]
pub mod scenario;
pub mod structured_log;

pub use runner::{HarnessError, MachineOverrides, RunReport, ScenarioReport, ScenarioRunner};
pub use scenario::{Expectation, ScenarioKind};
