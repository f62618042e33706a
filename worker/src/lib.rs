//! Autonomous code-change worker.
//!
//! A worker claims queued runs from a shared store, gathers read-only context
//! from the repository, runs the project's verification commands, asks an
//! external proposer for a unified diff, validates and risk-scores it, and
//! holds it for human approval before applying it to the working tree.
//!
//! - **[`core`]**: Pure, deterministic logic (diff parsing, patch policy, risk,
//!   lifecycle, log chunking). No I/O, fully testable in isolation.
//! - **[`io`]**: Side-effecting operations (stores, processes, filesystem).
//!   Traits at each seam so tests can substitute scripted fakes.
//!
//! [`orchestrator`] coordinates both into the run state machine the CLI drives.

pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod orchestrator;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
