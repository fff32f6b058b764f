//! # Vast.ai Instance Orchestrator
//!
//! Rents a single GPU instance on the Vast.ai marketplace, waits for it to
//! come up, and hands it to SSH-based sync and exec.
//!
//! ## Architecture
//!
//! ```text
//! InstanceManager
//! ├── OfferSelector      query building, price cap
//! ├── InstanceLifecycle  create → poll until ready → stop/destroy
//! ├── KeyReconciler      local key pair vs. account key
//! └── FileSync / RemoteExec (rsync, ssh)
//!          │
//!          ▼
//!     VastClient  ──►  https://console.vast.ai/api/v0
//! ```
//!
//! ## Failure handling
//!
//! Readiness polling is bounded: `interval × max_attempts`. A provisioning
//! error, a timeout or a Ctrl+C stops the half-created instance, and the
//! returned error names its id. Idempotent API calls are retried on transient
//! failures; instance creation never is.
//!
//! Destructive steps (restarting an instance, replacing the account SSH key)
//! go through an injected [`Confirmation`], so headless callers can answer
//! with [`AutoConfirm`].

#![warn(clippy::all)]

pub mod client;
pub mod config;
pub mod credentials;
pub mod error;
pub mod keys;
pub mod lifecycle;
pub mod manager;
pub mod offer;
pub mod operator;
pub mod provider;
pub mod query;
pub mod remote;
pub mod retry;
pub mod status;

#[cfg(test)]
pub(crate) mod testing;

// Error handling
pub use error::{Result, VastError};

// Configuration
pub use config::{
    ContainerSpec, DEFAULT_CONFIG_FILE, InstanceConfig, InstanceParameters, InstanceRequirements,
    LifecyclePolicy, PortCountRule, PricingMode, ProjectConfig, SyncFilter,
};
pub use credentials::ApiCredentials;

// Provider API
pub use client::VastClient;
pub use provider::{
    AccountService, InstanceProvider, Offer, OfferQuery, OfferQueryService, RemoteInstance,
};
pub use retry::RetryPolicy;

// Lifecycle
pub use keys::{KeyPair, KeyReconciler, KeyStatus};
pub use lifecycle::{InstanceLifecycle, LifecycleState, PendingInstance, TeardownOutcome};
pub use manager::{InstanceManager, ProviderServices, StartOutcome};
pub use offer::{OfferSelector, build_query};

// Operator interaction
pub use operator::{AutoConfirm, Confirmation, InteractiveConfirmation, ProgressSink, StdoutSink};

// Remote handoff
pub use remote::{FileSync, RemoteExec, RsyncFileSync, SshRemoteExec, SshTarget};
