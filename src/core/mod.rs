//! Core policy and deployment functionality
//!
//! - [`firewall`]: Rule, profile and template data structures
//! - [`compiler`]: Pure nftables script generation
//! - [`rule_constraints`]: Business rules for valid field combinations
//! - [`store`] / [`memory`]: Storage traits and the in-memory backend
//! - [`policy`]: Tenant-scoped rule and profile operations
//! - [`templates`]: Template CRUD, materialization, import and export
//! - [`deployment`]: Deployment records and their state machine
//! - [`orchestrator`]: Asynchronous apply / rollback / audit / flush
//! - [`executor`]: Agent execution and artifact collaborator traits
//! - [`nft_exec`]: Executor for the local host via `nft`
//! - [`artifacts`]: Directory-backed backup artifacts
//! - [`diff`]: Script diffs for previews
//! - [`error`]: Error types

pub mod artifacts;
pub mod compiler;
pub mod deployment;
pub mod diff;
pub mod error;
pub mod executor;
pub mod firewall;
pub mod memory;
pub mod nft_exec;
pub mod orchestrator;
pub mod policy;
pub mod rule_constraints;
pub mod store;
pub mod templates;

#[cfg(test)]
pub mod test_helpers;

#[cfg(test)]
mod tests;
