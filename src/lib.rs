//! AI Employee: a folder-queue workflow engine.
//!
//! Units of work are markdown files; the directory holding a file is its
//! lifecycle stage. Producers drop units into `Needs_Action`, classifiers
//! route them towards approval, and posting workers perform the approved
//! external actions.

pub mod approval;
pub mod audit;
pub mod breaker;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod posting;
pub mod producer;
pub mod runner;
pub mod vault;

pub use error::{Error, Result};
