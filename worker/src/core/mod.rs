//! Deterministic, pure logic shared by the worker.
//!
//! Core modules must be free of I/O side effects. They operate on in-memory
//! data structures and return deterministic outputs suitable for tests.

pub mod chunker;
pub mod classifier;
pub mod diff;
pub mod lifecycle;
pub mod patch_policy;
pub mod risk;
pub mod symbols;
pub mod types;
pub mod verification;
