//! Kubernetes Event recording for reboot lifecycle transitions.
//!
//! Provides a trait-based abstraction over `kube::runtime::events::Recorder`
//! so phase transitions show up in `kubectl describe node` and
//! `kubectl get events`.
//!
//! Events are **fire-and-forget**: failures are logged as warnings and never
//! propagate errors. A failed event must never break reconciliation.

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Node, ObjectReference};
use kube::runtime::events::{EventType, Recorder, Reporter};
use kube::{Client, ResourceExt};
use tracing::warn;

/// Trait for publishing Kubernetes Events.
///
/// Implementations are expected to be fire-and-forget: `publish()` logs a
/// warning on failure but never returns an error.
#[async_trait]
pub trait EventPublisher: Send + Sync {
    /// Publish a Kubernetes Event on the given resource.
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    );
}

/// Production implementation wrapping `kube::runtime::events::Recorder`.
pub struct KubeEventPublisher {
    recorder: Recorder,
}

impl KubeEventPublisher {
    /// Create a new publisher reporting as `component`
    /// (e.g. "update-operator").
    pub fn new(client: Client, component: &str) -> Self {
        let reporter = Reporter {
            controller: component.to_string(),
            instance: None,
        };
        Self {
            recorder: Recorder::new(client, reporter),
        }
    }
}

#[async_trait]
impl EventPublisher for KubeEventPublisher {
    async fn publish(
        &self,
        resource_ref: &ObjectReference,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let event = kube::runtime::events::Event {
            type_,
            reason: reason.to_string(),
            note,
            action: action.to_string(),
            secondary: None,
        };
        if let Err(e) = self.recorder.publish(&event, resource_ref).await {
            warn!(
                reason,
                action,
                error = %e,
                "Failed to publish Kubernetes event"
            );
        }
    }
}

/// No-op implementation for tests.
pub struct NoopEventPublisher;

#[async_trait]
impl EventPublisher for NoopEventPublisher {
    async fn publish(
        &self,
        _resource_ref: &ObjectReference,
        _type_: EventType,
        _reason: &str,
        _action: &str,
        _note: Option<String>,
    ) {
    }
}

/// Reference to a Node for event attribution.
pub fn node_reference(node: &Node) -> ObjectReference {
    ObjectReference {
        api_version: Some("v1".to_string()),
        kind: Some("Node".to_string()),
        name: Some(node.name_any()),
        uid: node.uid(),
        ..Default::default()
    }
}

/// Reference to the leader-election Lease for event attribution.
pub fn lease_reference(namespace: &str, name: &str) -> ObjectReference {
    ObjectReference {
        api_version: Some("coordination.k8s.io/v1".to_string()),
        kind: Some("Lease".to_string()),
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

/// Well-known event reason strings.
pub mod reasons {
    /// Node selected for reboot, pre-reboot checks opened
    pub const REBOOT_SCHEDULED: &str = "RebootScheduled";
    /// Pre-reboot checks passed, agent authorized to reboot
    pub const REBOOT_AUTHORIZED: &str = "RebootAuthorized";
    /// Node came back, post-reboot checks opened
    pub const POST_REBOOT_CHECKS: &str = "PostRebootChecks";
    /// Post-reboot checks passed, reboot cycle closed
    pub const REBOOT_COMPLETED: &str = "RebootCompleted";
    /// Node stopped wanting a reboot mid-cycle, pre-reboot state cleared
    pub const REBOOT_RETRACTED: &str = "RebootRetracted";
    /// This replica acquired the leader-election lease
    pub const LEADER_ELECTED: &str = "LeaderElected";
    /// This replica lost the leader-election lease
    pub const LEADERSHIP_LOST: &str = "LeadershipLost";
}

/// Well-known event action strings.
pub mod actions {
    /// Standard reconciliation pass
    pub const RECONCILE: &str = "Reconcile";
    /// Leader-election transition
    pub const ELECT: &str = "Elect";
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;

    #[test]
    fn noop_publisher_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopEventPublisher>();
    }

    #[test]
    fn node_reference_carries_name_and_uid() {
        let node = Node {
            metadata: ObjectMeta {
                name: Some("worker-0".to_string()),
                uid: Some("abc-123".to_string()),
                ..Default::default()
            },
            ..Default::default()
        };
        let reference = node_reference(&node);
        assert_eq!(reference.kind.as_deref(), Some("Node"));
        assert_eq!(reference.name.as_deref(), Some("worker-0"));
        assert_eq!(reference.uid.as_deref(), Some("abc-123"));
    }

    #[tokio::test]
    async fn noop_publisher_does_not_panic() {
        let publisher = NoopEventPublisher;
        publisher
            .publish(
                &ObjectReference::default(),
                EventType::Normal,
                reasons::REBOOT_SCHEDULED,
                actions::RECONCILE,
                Some("test".to_string()),
            )
            .await;
    }
}
