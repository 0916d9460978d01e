//! Annotation and label vocabulary shared with the node agent.
//!
//! These names form the wire contract between the operator, the per-node
//! update agent, and any external operators that write hook annotations.
//! Renaming any of them is a breaking protocol change.

/// Prefix for all annotations and labels owned by the update protocol.
pub const PREFIX: &str = "flatcar-linux-update.v1.flatcar-linux.net/";

/// Set to "true" by the agent when the node wants to reboot.
pub const ANNOTATION_REBOOT_NEEDED: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-needed";

/// Set to "true" by the agent while the reboot is underway.
pub const ANNOTATION_REBOOT_IN_PROGRESS: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-in-progress";

/// Set to "true" by an operator to hold a node out of reboot coordination.
pub const ANNOTATION_REBOOT_PAUSED: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/reboot-paused";

/// Written by the operator: "true" authorizes the agent to reboot, "false"
/// acknowledges that the reboot cycle has completed.
pub const ANNOTATION_OK_TO_REBOOT: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/ok-to-reboot";

/// Label marking a node as undergoing pre-reboot checks. Operator-owned.
pub const LABEL_BEFORE_REBOOT: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/before-reboot";

/// Label marking a node as undergoing post-reboot checks. Operator-owned.
pub const LABEL_AFTER_REBOOT: &str =
    "flatcar-linux-update.v1.flatcar-linux.net/after-reboot";

/// Canonical boolean values. Annotations compare against these literal
/// strings; anything else counts as "not true".
pub const TRUE: &str = "true";
/// See [`TRUE`].
pub const FALSE: &str = "false";

/// Name of the Lease used for leader election.
pub const LEADER_ELECTION_LEASE_NAME: &str = "flatcar-linux-update-operator-lock";
