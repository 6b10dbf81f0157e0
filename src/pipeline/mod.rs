//! Classification pipeline for units in `Needs_Action`.
//!
//! 1. `TriageRules::evaluate()`: regex short-circuits (quarantine / archive)
//! 2. `ApprovalLadder::level()`: amount thresholds for financial items
//! 3. `drafts`: templated replies for inbound email
//! 4. `Classifier`: claims, routes, and records every outcome
//!
//! **Nothing here performs an external action.** Units only ever reach
//! `Approved` through the approval gate or the auto-approve amount rule.

pub mod amounts;
pub mod classifier;
pub mod drafts;
pub mod rules;

pub use classifier::{ClassifyStats, Classifier, Outcome};
