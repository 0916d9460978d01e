//! The reboot-coordination reconciler.
//!
//! Every pass re-derives all decisions from the current Node set; the
//! operator holds no authoritative state of its own between passes. A pass
//! runs five phases in order:
//!
//! 1. cleanup: nodes labeled for pre-reboot checks that no longer want a
//!    reboot get their label and hook residue removed
//! 2. close finished reboots: post-reboot hook checks that pass flip
//!    ok-to-reboot back to "false"
//! 3. open post-reboot checks on nodes that just came back
//! 4. authorize reboots where pre-reboot hook checks pass
//! 5. admit new nodes into the cycle, bounded by the reboot budget and the
//!    configured reboot window
//!
//! Finished work is closed before new work is admitted so budget freed by a
//! completing node can be handed out in the same pass. Any phase error
//! aborts the pass; the next pass starts from scratch, so dropped work is
//! always re-attempted.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::runtime::events::EventType;
use kube::ResourceExt;
use tracing::{debug, error, info, warn};

use crate::constants;
use crate::error::Result;
use crate::events::{actions, node_reference, reasons, EventPublisher};
use crate::node_store::NodeStore;
use crate::reboot_window::RebootWindow;
use crate::selectors;

/// Time between reconciliation passes.
pub const RECONCILIATION_PERIOD: Duration = Duration::from_secs(30);

/// Operator configuration.
pub struct Config {
    /// Annotations that must read "true" before a reboot is authorized.
    pub before_reboot_annotations: Vec<String>,
    /// Annotations that must read "true" before a reboot cycle is closed.
    pub after_reboot_annotations: Vec<String>,
    /// Optional window constraining when new reboots are admitted.
    pub reboot_window: Option<RebootWindow>,
    /// Cluster-wide bound on concurrently rebooting nodes.
    pub max_rebooting_nodes: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            before_reboot_annotations: Vec::new(),
            after_reboot_annotations: Vec::new(),
            reboot_window: None,
            max_rebooting_nodes: 1,
        }
    }
}

/// The reboot coordinator.
pub struct Operator {
    store: Arc<dyn NodeStore>,
    events: Arc<dyn EventPublisher>,
    config: Config,
}

impl Operator {
    /// Create an operator over the given store and event sink.
    pub fn new(
        store: Arc<dyn NodeStore>,
        events: Arc<dyn EventPublisher>,
        config: Config,
    ) -> Self {
        Self {
            store,
            events,
            config,
        }
    }

    /// Run one reconciliation pass.
    ///
    /// `now` is the clock used for the reboot-window check; the supervisor
    /// passes wall time. Errors abort the pass and are logged, never
    /// propagated: the loop continues on the next tick.
    pub async fn process(&self, now: DateTime<Utc>) {
        debug!("Starting reconciliation pass");

        if let Err(e) = self.cleanup_state().await {
            error!(error = %e, "Failed to clean up node state");
            return;
        }

        if let Err(e) = self.check_after_reboot().await {
            error!(error = %e, "Failed to close completed reboots");
            return;
        }

        if let Err(e) = self.mark_after_reboot().await {
            error!(error = %e, "Failed to open post-reboot checks");
            return;
        }

        if let Err(e) = self.check_before_reboot().await {
            error!(error = %e, "Failed to authorize reboots");
            return;
        }

        if let Err(e) = self.mark_before_reboot(now).await {
            error!(error = %e, "Failed to admit rebootable nodes");
        }
    }

    /// Remove the pre-reboot label from nodes that no longer want a reboot.
    ///
    /// The agent may withdraw its request (or an operator may pause the
    /// node) after the label was applied. Hook annotations written in the
    /// meantime are deleted along with the label; they describe a cycle that
    /// is no longer happening.
    async fn cleanup_state(&self) -> Result<()> {
        let nodes = self.store.list_nodes().await?;

        for node in &nodes {
            if selectors::lacks_label(node, constants::LABEL_BEFORE_REBOOT)
                || selectors::rebootable(node)
            {
                continue;
            }

            let name = node.name_any();
            warn!(node = %name, "Node no longer wants to reboot, clearing pre-reboot state");

            let hooks = &self.config.before_reboot_annotations;
            self.store
                .update_node(&name, &|n: &mut Node| {
                    n.metadata
                        .labels
                        .as_mut()
                        .unwrap()
                        .remove(constants::LABEL_BEFORE_REBOOT);
                    let annotations = n.metadata.annotations.as_mut().unwrap();
                    for hook in hooks {
                        annotations.remove(hook);
                    }
                })
                .await?;

            self.events
                .publish(
                    &node_reference(node),
                    EventType::Normal,
                    reasons::REBOOT_RETRACTED,
                    actions::RECONCILE,
                    Some("node withdrew its reboot request".to_string()),
                )
                .await;
        }

        Ok(())
    }

    /// Authorize reboots on nodes whose pre-reboot hooks have all passed.
    async fn check_before_reboot(&self) -> Result<()> {
        self.check_reboot_phase(
            constants::LABEL_BEFORE_REBOOT,
            &self.config.before_reboot_annotations,
            constants::TRUE,
        )
        .await
    }

    /// Close the cycle on nodes whose post-reboot hooks have all passed.
    ///
    /// Each phase is gated on its own hook set: `before` hooks guard
    /// authorization, `after` hooks guard completion.
    async fn check_after_reboot(&self) -> Result<()> {
        self.check_reboot_phase(
            constants::LABEL_AFTER_REBOOT,
            &self.config.after_reboot_annotations,
            constants::FALSE,
        )
        .await
    }

    /// Shared hook-gated transition: for every node labeled `label` whose
    /// hook annotations all read "true", delete the label and the hook
    /// annotations and write `ok_to_reboot`, all in one update.
    ///
    /// Deleting the hook annotations forces external check operators to
    /// re-evaluate on the next cycle instead of a stale "true" passing the
    /// gate again.
    async fn check_reboot_phase(
        &self,
        label: &'static str,
        hook_annotations: &[String],
        ok_to_reboot: &'static str,
    ) -> Result<()> {
        let nodes = self.store.list_nodes().await?;

        for node in nodes.iter().filter(|n| selectors::has_label(n, label)) {
            let name = node.name_any();

            if !selectors::has_all_annotations(node, hook_annotations) {
                debug!(node = %name, label, "Waiting for hook annotations");
                continue;
            }

            debug!(node = %name, label, ok_to_reboot, "Hook checks passed, advancing");

            self.store
                .update_node(&name, &|n: &mut Node| {
                    n.metadata.labels.as_mut().unwrap().remove(label);
                    let annotations = n.metadata.annotations.as_mut().unwrap();
                    for hook in hook_annotations {
                        annotations.remove(hook);
                    }
                    annotations.insert(
                        constants::ANNOTATION_OK_TO_REBOOT.to_string(),
                        ok_to_reboot.to_string(),
                    );
                })
                .await?;

            let (reason, note) = if ok_to_reboot == constants::TRUE {
                (
                    reasons::REBOOT_AUTHORIZED,
                    "pre-reboot checks passed, node may reboot",
                )
            } else {
                (
                    reasons::REBOOT_COMPLETED,
                    "post-reboot checks passed, reboot cycle closed",
                )
            };
            self.events
                .publish(
                    &node_reference(node),
                    EventType::Normal,
                    reason,
                    actions::RECONCILE,
                    Some(note.to_string()),
                )
                .await;
        }

        Ok(())
    }

    /// Open post-reboot checks on nodes that just finished rebooting.
    ///
    /// The node stays in the budget until the checks pass; only then does
    /// phase 2 acknowledge completion by flipping ok-to-reboot to "false".
    async fn mark_after_reboot(&self) -> Result<()> {
        let nodes = self.store.list_nodes().await?;

        for node in nodes.iter().filter(|n| {
            selectors::just_rebooted(n) && selectors::lacks_label(n, constants::LABEL_AFTER_REBOOT)
        }) {
            let name = node.name_any();
            info!(node = %name, "Node rebooted, opening post-reboot checks");

            self.mark(
                &name,
                constants::LABEL_AFTER_REBOOT,
                &self.config.after_reboot_annotations,
            )
            .await?;

            self.events
                .publish(
                    &node_reference(node),
                    EventType::Normal,
                    reasons::POST_REBOOT_CHECKS,
                    actions::RECONCILE,
                    Some("node rebooted, post-reboot checks opened".to_string()),
                )
                .await;
        }

        Ok(())
    }

    /// Admit rebootable nodes into the cycle, up to the reboot budget and
    /// only inside the reboot window.
    async fn mark_before_reboot(&self, now: DateTime<Utc>) -> Result<()> {
        if let Some(window) = &self.config.reboot_window {
            if !window.contains(now) {
                debug!(
                    next_window = %window.next(now),
                    "Outside the reboot window, not admitting reboots"
                );
                return Ok(());
            }
        }

        let nodes = self.store.list_nodes().await?;

        // Nodes in either gating phase hold the budget just like nodes
        // actually rebooting.
        let in_flight = nodes
            .iter()
            .filter(|n| Self::counts_against_budget(n))
            .count();
        if in_flight >= self.config.max_rebooting_nodes {
            info!(
                in_flight,
                max = self.config.max_rebooting_nodes,
                "Reboot budget exhausted, waiting for completion"
            );
            return Ok(());
        }

        let budget = self.config.max_rebooting_nodes - in_flight;
        let chosen: Vec<&Node> = nodes
            .iter()
            .filter(|n| {
                selectors::rebootable(n)
                    && selectors::lacks_label(n, constants::LABEL_BEFORE_REBOOT)
            })
            .take(budget)
            .collect();

        if chosen.is_empty() {
            return Ok(());
        }

        info!(count = chosen.len(), "Admitting nodes into the reboot cycle");

        for node in chosen {
            let name = node.name_any();
            self.mark(
                &name,
                constants::LABEL_BEFORE_REBOOT,
                &self.config.before_reboot_annotations,
            )
            .await?;

            self.events
                .publish(
                    &node_reference(node),
                    EventType::Normal,
                    reasons::REBOOT_SCHEDULED,
                    actions::RECONCILE,
                    Some("node admitted into the reboot cycle".to_string()),
                )
                .await;
        }

        Ok(())
    }

    /// Delete any hook annotations left over from a previous cycle and set
    /// `label` to "true", in one update.
    async fn mark(
        &self,
        name: &str,
        label: &'static str,
        hook_annotations: &[String],
    ) -> Result<()> {
        self.store
            .update_node(name, &|n: &mut Node| {
                let annotations = n.metadata.annotations.as_mut().unwrap();
                for hook in hook_annotations {
                    annotations.remove(hook);
                }
                n.metadata
                    .labels
                    .as_mut()
                    .unwrap()
                    .insert(label.to_string(), constants::TRUE.to_string());
            })
            .await?;

        if !hook_annotations.is_empty() {
            info!(node = %name, label, hooks = ?hook_annotations, "Waiting for hook annotations");
        }

        Ok(())
    }

    fn counts_against_budget(node: &Node) -> bool {
        selectors::still_rebooting(node)
            || selectors::has_label(node, constants::LABEL_BEFORE_REBOOT)
            || selectors::has_label(node, constants::LABEL_AFTER_REBOOT)
    }
}
