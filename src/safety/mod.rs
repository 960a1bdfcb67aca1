//! Command safety: risk classification and auto-correction.
//!
//! Every shell command passes through [`risk::RiskAssessor`] before any
//! byte reaches a terminal. The assessment feeds the execution-mode policy
//! (strict/relaxed/free) in the engine.

pub mod risk;

pub use risk::{AutoCorrection, RiskAssessor, RiskLevel};
