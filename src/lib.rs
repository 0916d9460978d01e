//! Reboot coordination for Flatcar Container Linux clusters.
//!
//! The per-node update agent downloads updates and requests reboots through
//! node annotations, but never reboots on its own. This operator watches
//! those annotations, serializes disruptive reboots cluster-wide, and drives
//! each reboot through pre- and post-reboot hook gating. All coordination
//! state lives on the Node objects themselves; the operator is stateless
//! between reconciliation passes and safe to restart at any point.

pub mod constants;
pub mod error;
pub mod events;
pub mod leader_election;
pub mod node_store;
pub mod operator;
pub mod reboot_window;
pub mod retry;
pub mod selectors;

pub use error::{Error, Result};
