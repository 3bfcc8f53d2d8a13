//! Appointment monitoring
//!
//! Targets, pass classification, evidence capture and the pass engine.

mod classify;
mod engine;
mod evidence;
mod outcome;
mod target;

pub use classify::{classify, Classification, PageSnapshot};
pub use engine::MonitorEngine;
pub use evidence::EvidenceStore;
pub use outcome::{LogSink, OutcomeSink, PassOutcome, PassStatus};
pub use target::{Target, TargetLocators, Tier};
