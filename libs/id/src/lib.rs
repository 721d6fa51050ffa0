//! # berth-id
//!
//! Typed identifiers for machines, instances, and snapshots.
//!
//! ## ID Format
//!
//! Every ID is `{prefix}_{token}` where `token` is exactly [`TOKEN_LEN`]
//! random ASCII alphanumerics:
//!
//! - `machine_q3ZkT0aPm9WcLx2B`
//! - `snap_Hn0Rb7yVdE4oKs1U`
//! - `inst_7TcMw2JxQe9pLa0F`
//!
//! Consumers outside this workspace (transport layers, clients) must treat
//! IDs as opaque strings. Typed parsing exists only so that code holding a
//! `MachineId` cannot be handed a `SnapshotId` by mistake.

mod error;
mod macros;
mod token;
mod types;

pub use error::IdError;
pub use token::{Token, TOKEN_LEN};
pub use types::*;
