//! Nimbus Core - Shared types and the substrate interface
//!
//! This crate defines the abstractions shared between:
//! - nimbus-scheduler (the placement/DVFS/migration core)
//! - nimbus-sim (reference in-memory substrate and event engine)
//!
//! Key types:
//! - Substrate trait (interface to the machine/VM/task services)
//! - Machine, VM and task snapshots
//! - Error types

pub mod error;
pub mod traits;
pub mod types;

pub use error::*;
pub use traits::*;
pub use types::*;
