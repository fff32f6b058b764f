//! Provider data model and service interfaces
//!
//! The lifecycle, selector and key reconciler work through these traits only.
//! [`crate::client::VastClient`] implements all of them against the REST API;
//! tests use in-memory fakes.

use crate::config::PricingMode;
use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// A rentable machine advertised by the marketplace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    /// Offer (ask) id
    pub id: u64,

    /// Hourly price in $/hour
    #[serde(rename = "dph_total")]
    pub price: f64,

    /// Disk space in GB
    #[serde(default)]
    pub disk_space: f64,

    /// Open ports on the host's router
    #[serde(default, deserialize_with = "lenient_u32")]
    pub direct_port_count: u32,

    /// Whether the machine can currently be rented
    #[serde(default)]
    pub rentable: bool,

    #[serde(default)]
    pub gpu_name: Option<String>,

    #[serde(default)]
    pub num_gpus: Option<u32>,

    #[serde(default)]
    pub reliability: Option<f64>,

    #[serde(default)]
    pub min_bid: Option<f64>,
}

/// Host side of a published container port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortBinding {
    #[serde(rename = "HostIp", default)]
    pub host_ip: Option<String>,

    #[serde(rename = "HostPort")]
    pub host_port: String,
}

/// Container port (`"8888/tcp"`) to host bindings
pub type PortMap = BTreeMap<String, Vec<PortBinding>>;

/// Live snapshot of a rented instance
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RemoteInstance {
    pub id: u64,

    #[serde(default)]
    pub label: Option<String>,

    /// Container state (`loading`, `running`, `exited`, ...)
    #[serde(default)]
    pub actual_status: Option<String>,

    /// Human readable provisioning message
    #[serde(default)]
    pub status_msg: Option<String>,

    #[serde(default, deserialize_with = "lenient_ports")]
    pub ports: PortMap,

    #[serde(default)]
    pub public_ipaddr: Option<String>,

    /// Unix timestamp of the rental start
    #[serde(default)]
    pub start_date: Option<f64>,

    /// Hourly price in $/hour
    #[serde(default)]
    pub dph_total: Option<f64>,

    #[serde(default)]
    pub cpu_name: Option<String>,

    #[serde(default)]
    pub cpu_cores_effective: Option<f64>,

    #[serde(default)]
    pub num_gpus: Option<u32>,

    #[serde(default)]
    pub gpu_name: Option<String>,

    /// GPU RAM in MB
    #[serde(default)]
    pub gpu_ram: Option<f64>,

    #[serde(default)]
    pub total_flops: Option<f64>,

    /// Network speeds in MB/s
    #[serde(default)]
    pub inet_up: Option<f64>,

    #[serde(default)]
    pub inet_down: Option<f64>,

    /// Billed traffic in MB
    #[serde(default)]
    pub inet_up_billed: Option<f64>,

    #[serde(default)]
    pub inet_down_billed: Option<f64>,

    /// Traffic cost in $/GB
    #[serde(default)]
    pub inet_up_cost: Option<f64>,

    #[serde(default)]
    pub inet_down_cost: Option<f64>,
}

/// Outcome of a single readiness check
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    /// Provisioned and ports are assigned
    Ready,
    /// The provider reported an error
    Failed(String),
    /// Still starting
    Pending(String),
}

impl RemoteInstance {
    /// Lowercased provisioning message
    pub fn status_message(&self) -> String {
        self.status_msg.as_deref().unwrap_or_default().to_lowercase()
    }

    /// Whether the container reports `running`
    pub fn is_running(&self) -> bool {
        self.actual_status.as_deref() == Some("running")
    }

    /// Whether the provider evicted the instance (outbid)
    pub fn is_evicted(&self) -> bool {
        self.actual_status.as_deref() == Some("exited")
    }

    /// Classify the snapshot for the readiness poll
    pub fn readiness(&self) -> Readiness {
        let status = self.status_message();
        if status.contains("success") && !self.ports.is_empty() {
            Readiness::Ready
        } else if status.contains("error") {
            Readiness::Failed(status)
        } else {
            Readiness::Pending(status)
        }
    }

    /// Host port bound to a container port
    pub fn host_port(&self, container_port: u16) -> Option<u16> {
        self.ports
            .iter()
            .find(|(key, _)| container_port_of(key) == Some(container_port))
            .and_then(|(_, bindings)| bindings.first())
            .and_then(|b| b.host_port.parse().ok())
    }

    /// Host port of the container's SSH daemon
    pub fn ssh_port(&self) -> Option<u16> {
        self.host_port(22)
    }
}

/// Container port number of a `"8888/tcp"` key
pub fn container_port_of(key: &str) -> Option<u16> {
    key.split('/').next().and_then(|p| p.parse().ok())
}

/// Account owning the API key
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccountUser {
    pub id: u64,

    /// Registered public key
    #[serde(default)]
    pub ssh_key: Option<String>,
}

/// Offer search parameters
#[derive(Debug, Clone, PartialEq)]
pub struct OfferQuery {
    /// Textual predicate, e.g. `num_gpus=1 disk_space>=16`
    pub query: String,

    pub pricing: PricingMode,

    /// Comma separated sort keys, `-` suffix for descending
    pub order: String,

    /// Storage in GB used to price the offers
    pub storage_gb: f64,

    /// Skip the provider's default `verified/rentable/external` filters
    pub no_default: bool,
}

/// Request to rent an offer
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CreateInstanceRequest {
    pub offer_id: u64,
    pub image: String,
    /// `-e K=V -p P:P` string
    pub env: String,
    /// Bid price; `None` rents at the on-demand price
    pub price: Option<f64>,
    pub disk_gb: u32,
    pub label: String,
    /// Registry credentials (`-u user -p pass registry`)
    pub login: Option<String>,
}

/// Provider response to a creation request
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct CreateResponse {
    pub success: bool,

    /// Id of the new instance
    #[serde(default)]
    pub new_contract: Option<u64>,

    #[serde(default, alias = "msg")]
    pub error: Option<String>,
}

/// Marketplace search
#[async_trait]
pub trait OfferQueryService: Send + Sync {
    /// Offers matching the query, sorted by the provider
    async fn search_offers(&self, query: &OfferQuery) -> Result<Vec<Offer>>;
}

/// Instance lifecycle calls
#[async_trait]
pub trait InstanceProvider: Send + Sync {
    async fn create_instance(&self, request: &CreateInstanceRequest) -> Result<CreateResponse>;
    async fn show_instances(&self) -> Result<Vec<RemoteInstance>>;
    async fn stop_instance(&self, instance_id: u64) -> Result<()>;
    async fn destroy_instance(&self, instance_id: u64) -> Result<()>;
}

/// Account calls used for SSH key reconciliation
#[async_trait]
pub trait AccountService: Send + Sync {
    async fn show_user(&self) -> Result<AccountUser>;
    async fn update_ssh_key(&self, user_id: u64, public_key: &str) -> Result<()>;
}

/// The provider reports integer counts as floats for some offers
fn lenient_u32<'de, D>(deserializer: D) -> std::result::Result<u32, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    Ok(value
        .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
        .map(|n| u32::try_from(n).unwrap_or(u32::MAX))
        .unwrap_or(0))
}

/// `ports` is `null` or `[]` until the instance is scheduled
fn lenient_ports<'de, D>(deserializer: D) -> std::result::Result<PortMap, D::Error>
where
    D: Deserializer<'de>,
{
    let value = Option::<serde_json::Value>::deserialize(deserializer)?;
    match value {
        Some(v @ serde_json::Value::Object(_)) => {
            serde_json::from_value(v).map_err(serde::de::Error::custom)
        }
        _ => Ok(PortMap::new()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn instance(value: serde_json::Value) -> RemoteInstance {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_readiness() {
        let loading = instance(json!({"id": 1, "status_msg": "Pulling image", "ports": null}));
        assert!(matches!(loading.readiness(), Readiness::Pending(_)));

        let no_ports = instance(json!({"id": 1, "status_msg": "success, running", "ports": []}));
        assert!(matches!(no_ports.readiness(), Readiness::Pending(_)));

        let ready = instance(json!({
            "id": 1,
            "status_msg": "Success, running pytorch/pytorch",
            "ports": {"22/tcp": [{"HostIp": "0.0.0.0", "HostPort": "40022"}]}
        }));
        assert_eq!(ready.readiness(), Readiness::Ready);

        let failed = instance(json!({"id": 1, "status_msg": "Error: image not found"}));
        assert_eq!(
            failed.readiness(),
            Readiness::Failed("error: image not found".into())
        );
    }

    #[test]
    fn test_ssh_port_matches_exact_container_port() {
        let inst = instance(json!({
            "id": 7,
            "ports": {
                "8822/tcp": [{"HostPort": "41000"}],
                "22/tcp": [{"HostPort": "40022"}],
                "8888/tcp": [{"HostPort": "40888"}]
            }
        }));
        assert_eq!(inst.ssh_port(), Some(40022));
        assert_eq!(inst.host_port(8888), Some(40888));
        assert_eq!(inst.host_port(6006), None);
    }

    #[test]
    fn test_evicted_status() {
        let inst = instance(json!({"id": 3, "actual_status": "exited"}));
        assert!(inst.is_evicted());
        assert!(!inst.is_running());
    }

    #[test]
    fn test_offer_deserialization() {
        let offer: Offer = serde_json::from_value(json!({
            "id": 99,
            "dph_total": 0.31,
            "disk_space": 120.5,
            "direct_port_count": 12.0,
            "rentable": true,
            "gpu_name": "RTX 3090"
        }))
        .unwrap();
        assert_eq!(offer.price, 0.31);
        assert_eq!(offer.direct_port_count, 12);
        assert!(offer.rentable);
    }
}
