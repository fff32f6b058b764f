//! Instance lifecycle state machine
//!
//! ```text
//! Absent -> Creating -> Ready -> Running
//!              |          |        |
//!              v          v        v
//!            Failed    Stopped  Destroyed
//! ```
//!
//! Readiness is polled a bounded number of times with a fixed interval; every
//! check fetches a fresh snapshot. A failed, timed out or interrupted start
//! stops the half-created instance before the error is returned, and the
//! error always carries the instance id.

use crate::config::{ContainerSpec, InstanceRequirements, LifecyclePolicy, PricingMode};
use crate::error::{Result, VastError};
use crate::provider::{CreateInstanceRequest, InstanceProvider, Offer, Readiness, RemoteInstance};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Lifecycle state of the managed instance
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LifecycleState {
    /// Nothing rented yet
    Absent,
    /// Creation accepted, waiting for readiness
    Creating,
    /// Provisioned with ports assigned
    Ready,
    /// Handed off to sync/exec
    Running,
    Stopped,
    Destroyed,
    /// Creation or provisioning failed
    Failed,
}

impl LifecycleState {
    /// Whether `next` is a legal successor of this state
    pub fn can_transition_to(&self, next: LifecycleState) -> bool {
        use LifecycleState::*;
        match (*self, next) {
            (Absent | Stopped | Destroyed | Failed, Creating) => true,
            (Creating, Ready | Failed) => true,
            (Ready, Running) => true,
            // stop/destroy are accepted from any state
            (_, Stopped | Destroyed) => true,
            _ => false,
        }
    }
}

/// Instance accepted by the provider but not yet ready
#[derive(Debug, Clone, PartialEq)]
pub struct PendingInstance {
    pub instance_id: u64,
    pub offer_id: u64,
    /// Price sent with the creation request
    pub price: Option<f64>,
}

/// Result of a stop or destroy request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownOutcome {
    Stopped(u64),
    Destroyed(u64),
    /// No instance was found; nothing to do
    NotRunning,
}

/// Price sent with a creation request
///
/// Bid mode bids a multiple of the offer price. On-demand sends the price cap
/// when one is set and lets the provider charge the listed price otherwise.
pub fn creation_price(offer: &Offer, req: &InstanceRequirements) -> Option<f64> {
    match req.pricing {
        PricingMode::Bid => Some(round_price(offer.price * req.bid_ratio)),
        PricingMode::OnDemand if req.max_price > 0.0 => Some(req.max_price),
        PricingMode::OnDemand => None,
    }
}

fn round_price(price: f64) -> f64 {
    (price * 1_000_000.0).round() / 1_000_000.0
}

/// Drives one instance through create, readiness polling and teardown
pub struct InstanceLifecycle {
    provider: Arc<dyn InstanceProvider>,
    policy: LifecyclePolicy,
    label: String,
    state: LifecycleState,
}

impl InstanceLifecycle {
    pub fn new(
        provider: Arc<dyn InstanceProvider>,
        policy: LifecyclePolicy,
        label: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            policy,
            label: label.into(),
            state: LifecycleState::Absent,
        }
    }

    /// Current state
    pub fn state(&self) -> LifecycleState {
        self.state
    }

    fn transition(&mut self, next: LifecycleState) {
        if !self.state.can_transition_to(next) {
            warn!(from = ?self.state, to = ?next, "Unexpected lifecycle transition");
        }
        debug!(from = ?self.state, to = ?next, label = %self.label, "Lifecycle transition");
        self.state = next;
    }

    /// Creation request for an offer, without sending it
    pub fn creation_request(
        &self,
        offer: &Offer,
        req: &InstanceRequirements,
        container: &ContainerSpec,
        login: Option<String>,
    ) -> CreateInstanceRequest {
        CreateInstanceRequest {
            offer_id: offer.id,
            image: container.image.clone(),
            env: container.env_string(),
            price: creation_price(offer, req),
            disk_gb: req.min_disk_gb,
            label: self.label.clone(),
            login,
        }
    }

    /// Submit a creation request for `offer`
    ///
    /// Fails with [`VastError::CreateRejected`] if the provider refuses.
    pub async fn create(
        &mut self,
        offer: &Offer,
        req: &InstanceRequirements,
        container: &ContainerSpec,
        login: Option<String>,
    ) -> Result<PendingInstance> {
        let request = self.creation_request(offer, req, container, login);
        self.transition(LifecycleState::Creating);

        let response = match self.provider.create_instance(&request).await {
            Ok(response) => response,
            Err(e) => {
                self.transition(LifecycleState::Failed);
                return Err(e);
            }
        };

        if !response.success {
            self.transition(LifecycleState::Failed);
            return Err(VastError::CreateRejected(
                response
                    .error
                    .unwrap_or_else(|| "the provider reported success=false".to_string()),
            ));
        }

        let instance_id = match response.new_contract {
            Some(id) => id,
            None => {
                let reason = match self.find_by_label().await {
                    Ok(Some(instance)) => Ok(instance.id),
                    Ok(None) => {
                        Err("no instance id returned and none is listed under the label".to_string())
                    }
                    Err(e) => Err(format!("label lookup failed: {}", e)),
                };
                match reason {
                    Ok(id) => id,
                    Err(reason) => {
                        self.transition(LifecycleState::Failed);
                        return Err(VastError::CreationUnconfirmed {
                            label: self.label.clone(),
                            reason,
                        });
                    }
                }
            }
        };

        info!(instance_id, offer_id = offer.id, price = ?request.price, "Instance created");
        Ok(PendingInstance {
            instance_id,
            offer_id: offer.id,
            price: request.price,
        })
    }

    /// Poll until the instance is ready, fails, or attempts run out
    pub async fn await_ready(
        &mut self,
        pending: &PendingInstance,
        cancel: &CancellationToken,
    ) -> Result<RemoteInstance> {
        let instance_id = pending.instance_id;
        let mut last_status = String::from("unknown");

        info!(
            instance_id,
            max_attempts = self.policy.max_attempts,
            interval = ?self.policy.poll_interval,
            max_wait = ?self.policy.max_wait(),
            "Waiting for the instance to be ready"
        );

        for attempt in 1..=self.policy.max_attempts {
            let interrupted = tokio::select! {
                _ = cancel.cancelled() => true,
                _ = tokio::time::sleep(self.policy.poll_interval) => false,
            };
            if interrupted {
                warn!(instance_id, "Provisioning interrupted, stopping the instance");
                self.cleanup(instance_id).await;
                return Err(VastError::Cancelled { instance_id });
            }

            let snapshot = match self.fetch(instance_id).await {
                Ok(snapshot) => snapshot,
                Err(e) => {
                    warn!(instance_id, attempt, "Status check failed: {}", e);
                    last_status = format!("status check failed: {}", e);
                    continue;
                }
            };

            let Some(instance) = snapshot else {
                debug!(instance_id, attempt, "Instance not listed yet");
                last_status = "not listed yet".to_string();
                continue;
            };

            match instance.readiness() {
                Readiness::Ready => {
                    info!(instance_id, attempt, "Instance is ready");
                    self.transition(LifecycleState::Ready);
                    return Ok(instance);
                }
                Readiness::Failed(status) => {
                    error!(instance_id, status = %status, "Instance failed to start");
                    self.cleanup(instance_id).await;
                    return Err(VastError::ProvisioningFailed {
                        instance_id,
                        status,
                    });
                }
                Readiness::Pending(status) => {
                    debug!(instance_id, attempt, status = %status, "Instance not ready");
                    last_status = status;
                }
            }
        }

        warn!(instance_id, "Instance did not become ready, stopping it");
        self.cleanup(instance_id).await;
        Err(VastError::ProvisioningTimeout {
            instance_id,
            attempts: self.policy.max_attempts,
            last_status,
        })
    }

    /// Mark a ready instance as handed off
    pub fn mark_running(&mut self) {
        self.transition(LifecycleState::Running);
    }

    /// Stop a half-created instance; failures are logged, the caller's error wins
    async fn cleanup(&mut self, instance_id: u64) {
        if let Err(e) = self.provider.stop_instance(instance_id).await {
            error!(instance_id, "Failed to stop the instance: {}", e);
        }
        self.transition(LifecycleState::Failed);
    }

    /// Fresh snapshot of an instance by id
    pub async fn status(&self, instance_id: u64) -> Result<Option<RemoteInstance>> {
        self.fetch(instance_id).await
    }

    async fn fetch(&self, instance_id: u64) -> Result<Option<RemoteInstance>> {
        let instances = self.provider.show_instances().await?;
        Ok(instances.into_iter().find(|i| i.id == instance_id))
    }

    /// Fresh snapshot of the instance carrying this lifecycle's label
    pub async fn find_by_label(&self) -> Result<Option<RemoteInstance>> {
        let instances = self.provider.show_instances().await?;
        Ok(instances
            .into_iter()
            .find(|i| i.label.as_deref() == Some(self.label.as_str())))
    }

    /// Stop the instance; a missing id is a successful no-op
    pub async fn stop(&mut self, instance_id: Option<u64>) -> Result<TeardownOutcome> {
        let Some(instance_id) = instance_id else {
            info!(label = %self.label, "Instance is not running");
            return Ok(TeardownOutcome::NotRunning);
        };

        info!(instance_id, "Stopping instance");
        self.provider.stop_instance(instance_id).await?;
        self.transition(LifecycleState::Stopped);
        Ok(TeardownOutcome::Stopped(instance_id))
    }

    /// Destroy the instance; a missing id is a successful no-op
    pub async fn destroy(&mut self, instance_id: Option<u64>) -> Result<TeardownOutcome> {
        let Some(instance_id) = instance_id else {
            info!(label = %self.label, "Instance is not running");
            return Ok(TeardownOutcome::NotRunning);
        };

        info!(instance_id, "Destroying instance");
        self.provider.destroy_instance(instance_id).await?;
        self.transition(LifecycleState::Destroyed);
        Ok(TeardownOutcome::Destroyed(instance_id))
    }
}
