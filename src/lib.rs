//! nftfleet - multi-tenant nftables policy compiler and deployment orchestrator
//!
//! Manages declarative firewall policy (rules, profiles, templates) per
//! tenant, compiles it into complete nftables scripts, and deploys, rolls
//! back, audits or flushes that configuration on remote agents.
//!
//! # Architecture
//!
//! - [`core`] - Policy model, compiler, deployment records and orchestrator
//! - [`events`] - Deployment lifecycle events
//! - [`audit`] - Audit trail for deployment operations
//! - [`validators`] - Input validation
//! - [`config`] - Service configuration persistence
//! - [`utils`] - Utility functions (XDG directories, etc.)
//!
//! # Safety Features
//!
//! - Every interpolated value passes through one escaping routine
//! - Validation errors surface before any background work starts
//! - Best-effort backups with SHA-256 checksums before every apply
//! - Timeout-bounded, cancellable deployments serialized per agent
//! - Atomic file operations with secure permissions

// Allow pedantic clippy warnings that are not worth fixing for this codebase
#![allow(clippy::must_use_candidate)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]

pub mod audit;
pub mod config;
pub mod core;
pub mod events;
pub mod utils;
pub mod validators;

// Re-export commonly used types
pub use core::error::{Error, Result};
pub use core::firewall::{Chain, Profile, Protocol, Rule, RuleDefinition};
pub use core::orchestrator::Orchestrator;
