//! Leader election using Kubernetes Leases.
//!
//! The reconciler mutates cluster-wide state, so at most one replica may run
//! it. Election goes through a named Lease in the operator's namespace:
//! [`LeaderElector::acquire`] blocks until this replica holds the lease, then
//! a background task renews it. Loss of leadership is signalled through the
//! returned guard and is treated as fatal by the supervisor; restarting and
//! re-contending is simpler than reasoning about a half-finished pass under
//! a new leader.
//!
//! Timing: the lease lasts 90 s, renewal runs every 30 s, and leadership is
//! declared lost once renewal has not succeeded for 60 s or the lease is
//! observed held by someone else.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{MicroTime, ObjectMeta};
use kube::api::{Api, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::error::{Error, Result};

/// How long an acquired lease is valid without renewal.
const LEASE_DURATION: Duration = Duration::from_secs(90);
/// Renewal cadence while leading; acquisition retry cadence while not.
const RETRY_PERIOD: Duration = Duration::from_secs(30);
/// How long renewal may keep failing before leadership counts as lost.
const RENEW_DEADLINE: Duration = Duration::from_secs(60);

const FIELD_MANAGER: &str = "update-operator";

/// Whether the lease has outlived its duration at `now`.
///
/// A lease without a renew time or duration is treated as expired; it cannot
/// be proven live and taking it over is safe.
fn lease_expired(spec: &LeaseSpec, now: DateTime<Utc>) -> bool {
    match (spec.renew_time.as_ref(), spec.lease_duration_seconds) {
        (Some(renew), Some(duration)) => now > renew.0 + chrono::Duration::seconds(duration.into()),
        _ => true,
    }
}

/// Leader elector over a named Lease.
pub struct LeaderElector {
    client: Client,
    lease_name: String,
    namespace: String,
    identity: String,
}

impl LeaderElector {
    /// Create an elector for `lease_name` in `namespace`, contending as
    /// `identity`.
    pub fn new(client: Client, lease_name: &str, namespace: &str, identity: &str) -> Self {
        Self {
            client,
            lease_name: lease_name.to_string(),
            namespace: namespace.to_string(),
            identity: identity.to_string(),
        }
    }

    /// Block until leadership is acquired, then return a guard.
    ///
    /// Retryable API failures are logged and retried indefinitely; a
    /// non-retryable failure (e.g. missing RBAC) is returned so the process
    /// can exit instead of contending forever.
    pub async fn acquire(self: Arc<Self>) -> Result<LeaderGuard> {
        info!(
            identity = %self.identity,
            lease = %self.lease_name,
            "Waiting for leadership"
        );

        loop {
            match self.try_acquire_lease().await {
                Ok(true) => {
                    info!(identity = %self.identity, "Leadership acquired");
                    return Ok(self.create_guard());
                }
                Ok(false) => {
                    debug!(
                        identity = %self.identity,
                        retry_secs = RETRY_PERIOD.as_secs(),
                        "Lease held by another, waiting"
                    );
                }
                Err(e) if e.is_retryable() => {
                    warn!(
                        identity = %self.identity,
                        error = %e,
                        retry_secs = RETRY_PERIOD.as_secs(),
                        "Failed to contend for lease, retrying"
                    );
                }
                Err(e) => return Err(e),
            }
            tokio::time::sleep(RETRY_PERIOD).await;
        }
    }

    fn create_guard(self: &Arc<Self>) -> LeaderGuard {
        let (lost_tx, lost_rx) = oneshot::channel();
        let elector = Arc::clone(self);
        let renewal_task = tokio::spawn(async move {
            elector.renewal_loop(lost_tx).await;
        });

        LeaderGuard {
            identity: self.identity.clone(),
            renewal_task,
            lost_rx: Some(lost_rx),
        }
    }

    /// Try to acquire or renew the lease. `Ok(true)` means we hold it.
    async fn try_acquire_lease(&self) -> Result<bool> {
        let api: Api<Lease> = Api::namespaced(self.client.clone(), &self.namespace);
        let now = Utc::now();

        match api.get(&self.lease_name).await.map_err(Error::from_kube) {
            Ok(lease) => {
                let spec = lease.spec.unwrap_or_default();

                if spec.holder_identity.as_deref() == Some(self.identity.as_str()) {
                    return self.renew_lease(&api, now).await;
                }

                if lease_expired(&spec, now) {
                    let transitions = spec.lease_transitions.unwrap_or(0);
                    self.take_over_lease(&api, now, transitions).await
                } else {
                    Ok(false)
                }
            }
            Err(Error::NotFound(_)) => self.create_lease(&api, now).await,
            Err(e) => Err(e),
        }
    }

    /// Create a new lease (first leader).
    async fn create_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let lease = Lease {
            metadata: ObjectMeta {
                name: Some(self.lease_name.clone()),
                namespace: Some(self.namespace.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(LEASE_DURATION.as_secs() as i32),
                acquire_time: Some(MicroTime(now)),
                renew_time: Some(MicroTime(now)),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        };

        match api
            .create(&PostParams::default(), &lease)
            .await
            .map_err(Error::from_kube)
        {
            Ok(_) => {
                info!(identity = %self.identity, "Created new lease");
                Ok(true)
            }
            Err(Error::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Renew a lease we already hold.
    async fn renew_lease(&self, api: &Api<Lease>, now: DateTime<Utc>) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "renewTime": MicroTime(now),
            }
        });

        api.patch(
            &self.lease_name,
            &PatchParams::apply(FIELD_MANAGER).force(),
            &Patch::Apply(&patch),
        )
        .await
        .map_err(Error::from_kube)?;

        debug!(identity = %self.identity, "Lease renewed");
        Ok(true)
    }

    /// Take over an expired lease.
    async fn take_over_lease(
        &self,
        api: &Api<Lease>,
        now: DateTime<Utc>,
        transitions: i32,
    ) -> Result<bool> {
        let patch = serde_json::json!({
            "apiVersion": "coordination.k8s.io/v1",
            "kind": "Lease",
            "metadata": {
                "name": self.lease_name,
                "namespace": self.namespace,
            },
            "spec": {
                "holderIdentity": self.identity,
                "acquireTime": MicroTime(now),
                "renewTime": MicroTime(now),
                "leaseDurationSeconds": LEASE_DURATION.as_secs() as i32,
                "leaseTransitions": transitions + 1,
            }
        });

        match api
            .patch(
                &self.lease_name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&patch),
            )
            .await
            .map_err(Error::from_kube)
        {
            Ok(_) => {
                info!(
                    identity = %self.identity,
                    transitions = transitions + 1,
                    "Took over expired lease"
                );
                Ok(true)
            }
            Err(Error::Conflict(_)) => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Renewal loop that runs while we hold leadership. Exits, signalling
    /// `lost_tx`, when the lease is observed held by another identity or
    /// renewal has kept failing past the renew deadline.
    async fn renewal_loop(&self, lost_tx: oneshot::Sender<()>) {
        let mut last_renewal = Instant::now();

        loop {
            tokio::time::sleep(RETRY_PERIOD).await;

            match self.try_acquire_lease().await {
                Ok(true) => last_renewal = Instant::now(),
                Ok(false) => {
                    warn!(identity = %self.identity, "Lease held by another identity");
                    break;
                }
                Err(e) => {
                    if last_renewal.elapsed() >= RENEW_DEADLINE {
                        warn!(
                            identity = %self.identity,
                            error = %e,
                            deadline_secs = RENEW_DEADLINE.as_secs(),
                            "Renew deadline exceeded"
                        );
                        break;
                    }
                    warn!(identity = %self.identity, error = %e, "Failed to renew lease, will retry");
                }
            }
        }

        let _ = lost_tx.send(());
    }
}

/// Guard that maintains leadership.
///
/// While this guard exists the renewal task keeps the lease alive. Use
/// [`LeaderGuard::lost`] to wait for leadership loss. The renewal task is
/// aborted when the guard is dropped.
pub struct LeaderGuard {
    identity: String,
    renewal_task: JoinHandle<()>,
    lost_rx: Option<oneshot::Receiver<()>>,
}

impl LeaderGuard {
    /// Wait until leadership is lost.
    pub async fn lost(&mut self) {
        if let Some(rx) = self.lost_rx.take() {
            let _ = rx.await;
        }
    }
}

impl Drop for LeaderGuard {
    fn drop(&mut self) {
        self.renewal_task.abort();
        info!(identity = %self.identity, "Leadership released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn lease_spec(renewed_secs_ago: i64, duration: i32) -> LeaseSpec {
        LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(duration),
            renew_time: Some(MicroTime(
                Utc::now() - chrono::Duration::seconds(renewed_secs_ago),
            )),
            ..Default::default()
        }
    }

    #[test]
    fn fresh_lease_is_not_expired() {
        assert!(!lease_expired(&lease_spec(10, 90), Utc::now()));
    }

    #[test]
    fn stale_lease_is_expired() {
        assert!(lease_expired(&lease_spec(120, 90), Utc::now()));
    }

    #[test]
    fn lease_without_renew_time_is_expired() {
        let spec = LeaseSpec {
            holder_identity: Some("other".to_string()),
            lease_duration_seconds: Some(90),
            ..Default::default()
        };
        assert!(lease_expired(&spec, Utc::now()));
    }

    #[test]
    fn renew_deadline_is_two_thirds_of_the_lease() {
        assert_eq!(RENEW_DEADLINE * 3, LEASE_DURATION * 2);
        assert_eq!(RETRY_PERIOD * 3, LEASE_DURATION);
    }
}
