//! Side-effecting operations: stores, processes, the filesystem.

pub mod approval;
pub mod claim;
pub mod config;
pub mod file_store;
pub mod memory_store;
pub mod patch_apply;
pub mod process;
pub mod proposer;
pub mod repo_tools;
pub mod store;
pub mod transport;
pub mod verify;
