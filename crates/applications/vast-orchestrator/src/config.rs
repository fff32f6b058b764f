//! Project configuration and instance parameter validation
//!
//! The project file is YAML:
//!
//! ```yaml
//! project:
//!   name: my-project
//!   syncFilters:
//!     - exclude: [".git/*", "data/*"]
//! containers:
//!   - name: default
//!     image: pytorch/pytorch:latest
//!     env: { WANDB_MODE: offline }
//!     ports: [{ containerPort: 8888 }]
//! instances:
//!   - name: vast-1
//!     provider: vast
//!     parameters:
//!       query: num_gpus=1 gpu_name=RTX_3090
//!       type: bid
//!       bidRatio: 1.2
//! ```
//!
//! `parameters` is validated into [`InstanceParameters`]; lifecycle constants
//! that used to differ between code paths live in [`LifecyclePolicy`].

use crate::error::{Result, VastError};
use crate::query::parse_query;
use serde::{Deserialize, Serialize};
use serde_yaml::{Mapping, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

/// Default project file name
pub const DEFAULT_CONFIG_FILE: &str = "spotty.yaml";

/// Default root volume size in GB
pub const DEFAULT_ROOT_VOLUME_SIZE: u32 = 16;

/// Default offer ordering
pub const DEFAULT_SORT: &str = "score-";

/// Bid multiplier used when `bidRatio` is not configured
pub const DEFAULT_BID_RATIO: f64 = 1.2;

/// Default seconds between readiness checks
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Default number of readiness checks
pub const DEFAULT_MAX_POLL_ATTEMPTS: u32 = 20;

const KNOWN_PARAMETERS: &[&str] = &[
    "query",
    "type",
    "sort",
    "bidRatio",
    "maxPrice",
    "rootVolumeSize",
    "ports",
    "imageLogin",
    "reserveSshPort",
    "pollIntervalSecs",
    "maxPollAttempts",
];

/// Pricing mode for the rented machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum PricingMode {
    /// Fixed price, never preempted
    #[default]
    OnDemand,
    /// Interruptible, price is a multiple of the offer price
    Bid,
}

impl PricingMode {
    /// Parse from the config / CLI spelling
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "on-demand" => Some(Self::OnDemand),
            "bid" => Some(Self::Bid),
            _ => None,
        }
    }

    /// Provider spelling
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OnDemand => "on-demand",
            Self::Bid => "bid",
        }
    }
}

/// Comparator used for the `direct_port_count` clause
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum PortCountRule {
    /// `direct_port_count >= ports`
    #[default]
    AtLeast,
    /// `direct_port_count > ports`, keeping one port free for direct SSH
    ReserveManagementPort,
}

impl PortCountRule {
    /// Query operator for this rule
    pub fn operator(&self) -> &'static str {
        match self {
            Self::AtLeast => ">=",
            Self::ReserveManagementPort => ">",
        }
    }
}

/// Timing and pricing constants of the instance lifecycle
#[derive(Debug, Clone, PartialEq)]
pub struct LifecyclePolicy {
    /// Delay before each readiness check
    pub poll_interval: Duration,

    /// Number of readiness checks before giving up
    pub max_attempts: u32,

    /// Comparator for the open port requirement
    pub port_rule: PortCountRule,

    /// Bid multiplier when the instance parameters don't set one
    pub default_bid_ratio: f64,
}

impl Default for LifecyclePolicy {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(DEFAULT_POLL_INTERVAL_SECS),
            max_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
            port_rule: PortCountRule::AtLeast,
            default_bid_ratio: DEFAULT_BID_RATIO,
        }
    }
}

impl LifecyclePolicy {
    /// Set the delay between readiness checks
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Set the number of readiness checks
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the port comparator
    pub fn with_port_rule(mut self, rule: PortCountRule) -> Self {
        self.port_rule = rule;
        self
    }

    /// Upper bound on time spent waiting for readiness, `None` on overflow
    pub fn max_wait(&self) -> Option<Duration> {
        self.poll_interval.checked_mul(self.max_attempts)
    }
}

/// Normalized `parameters` block of a Vast instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceParameters {
    pub query: String,
    pub pricing: PricingMode,
    pub sort: String,
    pub bid_ratio: Option<f64>,
    pub max_price: f64,
    pub root_volume_size: u32,
    /// Extra container ports published next to the container's own
    pub ports: Vec<u16>,
    pub image_login: Option<String>,
    pub reserve_ssh_port: bool,
    pub poll_interval_secs: u64,
    pub max_poll_attempts: u32,
}

impl Default for InstanceParameters {
    fn default() -> Self {
        Self {
            query: String::new(),
            pricing: PricingMode::OnDemand,
            sort: DEFAULT_SORT.to_string(),
            bid_ratio: None,
            max_price: 0.0,
            root_volume_size: DEFAULT_ROOT_VOLUME_SIZE,
            ports: vec![],
            image_login: None,
            reserve_ssh_port: false,
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            max_poll_attempts: DEFAULT_MAX_POLL_ATTEMPTS,
        }
    }
}

impl InstanceParameters {
    /// Lifecycle policy configured by these parameters
    pub fn lifecycle_policy(&self) -> LifecyclePolicy {
        LifecyclePolicy::default()
            .with_poll_interval(Duration::from_secs(self.poll_interval_secs))
            .with_max_attempts(self.max_poll_attempts)
            .with_port_rule(if self.reserve_ssh_port {
                PortCountRule::ReserveManagementPort
            } else {
                PortCountRule::AtLeast
            })
    }
}

/// Normalize line breaks inside a query to single spaces
pub fn normalize_query(query: &str) -> String {
    query.replace("\r\n", "\n").replace('\n', " ")
}

/// Validate a raw `parameters` mapping and fill in defaults
pub fn validate_instance_parameters(params: &Mapping) -> Result<InstanceParameters> {
    let mut out = InstanceParameters::default();

    for (key, value) in params {
        let key = key
            .as_str()
            .ok_or_else(|| VastError::config("parameter names must be strings"))?;
        if !KNOWN_PARAMETERS.contains(&key) {
            return Err(VastError::config(format!("unknown parameter \"{}\"", key)));
        }
        if value.is_null() {
            continue;
        }

        match key {
            "query" => {
                out.query = normalize_query(expect_str(key, value)?);
                parse_query(&out.query)?;
            }
            "type" => {
                let raw = expect_str(key, value)?;
                out.pricing = PricingMode::parse(raw).ok_or_else(|| {
                    VastError::config(format!(
                        "\"type\" must be \"bid\" or \"on-demand\", got \"{}\"",
                        raw
                    ))
                })?;
            }
            "sort" => out.sort = expect_str(key, value)?.to_string(),
            "bidRatio" => {
                let ratio = parse_decimal(key, value)?;
                if ratio <= 0.0 {
                    return Err(VastError::config(
                        "\"bidRatio\" should be greater than 0 or should not be specified.",
                    ));
                }
                out.bid_ratio = Some(ratio);
            }
            "maxPrice" => out.max_price = parse_decimal(key, value)?,
            "rootVolumeSize" => {
                let size = parse_integer(key, value)?;
                if size == 0 {
                    return Err(VastError::config(
                        "\"rootVolumeSize\" should be greater than 0 or should not be specified.",
                    ));
                }
                out.root_volume_size = u32::try_from(size)
                    .map_err(|_| VastError::config("\"rootVolumeSize\" is too large"))?;
            }
            "ports" => out.ports = parse_ports(value)?,
            "imageLogin" => out.image_login = Some(expect_str(key, value)?.to_string()),
            "reserveSshPort" => {
                out.reserve_ssh_port = value
                    .as_bool()
                    .ok_or_else(|| VastError::config("\"reserveSshPort\" must be a boolean"))?;
            }
            "pollIntervalSecs" => out.poll_interval_secs = parse_integer(key, value)?,
            "maxPollAttempts" => {
                let attempts = parse_integer(key, value)?;
                if attempts == 0 {
                    return Err(VastError::config("\"maxPollAttempts\" must be at least 1"));
                }
                out.max_poll_attempts = u32::try_from(attempts)
                    .map_err(|_| VastError::config("\"maxPollAttempts\" is too large"))?;
            }
            _ => unreachable!("filtered by KNOWN_PARAMETERS"),
        }
    }

    if out.pricing == PricingMode::OnDemand && out.bid_ratio.is_some() {
        debug!("bidRatio is ignored for on-demand instances");
    }

    Ok(out)
}

fn expect_str<'a>(key: &str, value: &'a Value) -> Result<&'a str> {
    value
        .as_str()
        .ok_or_else(|| VastError::config(format!("\"{}\" must be a string", key)))
}

/// Accepts numbers or strings matching `^\d+(\.\d{1,6})?$`
fn parse_decimal(key: &str, value: &Value) -> Result<f64> {
    let invalid = || VastError::config(format!("Incorrect value for \"{}\".", key));
    let text = match value {
        Value::Number(n) => n.to_string(),
        Value::String(s) => s.trim().to_string(),
        _ => return Err(invalid()),
    };

    let (whole, fraction) = match text.split_once('.') {
        Some((w, f)) => (w, Some(f)),
        None => (text.as_str(), None),
    };
    let digits = |s: &str| !s.is_empty() && s.chars().all(|c| c.is_ascii_digit());
    let fraction_ok = fraction.is_none_or(|f| digits(f) && f.len() <= 6);
    if !digits(whole) || !fraction_ok {
        return Err(invalid());
    }

    text.parse::<f64>().map_err(|_| invalid())
}

fn parse_integer(key: &str, value: &Value) -> Result<u64> {
    let invalid = || VastError::config(format!("Incorrect value for \"{}\".", key));
    match value {
        Value::Number(n) => n.as_u64().ok_or_else(invalid),
        Value::String(s) => {
            let s = s.trim();
            if s.is_empty() || !s.chars().all(|c| c.is_ascii_digit()) {
                return Err(invalid());
            }
            s.parse().map_err(|_| invalid())
        }
        _ => Err(invalid()),
    }
}

fn parse_ports(value: &Value) -> Result<Vec<u16>> {
    let items = value
        .as_sequence()
        .ok_or_else(|| VastError::config("\"ports\" must be a list"))?;

    let mut ports = BTreeSet::new();
    for item in items {
        let port = item
            .as_str()
            .and_then(|p| p.strip_prefix("port-"))
            .filter(|n| !n.is_empty() && n.chars().all(|c| c.is_ascii_digit()))
            .and_then(|n| n.parse::<u16>().ok())
            .filter(|n| *n > 0)
            .ok_or_else(|| {
                VastError::config(format!(
                    "\"ports\" entries must look like \"port-<N>\", got {:?}",
                    item
                ))
            })?;
        ports.insert(port);
    }

    Ok(ports.into_iter().collect())
}

/// Container port exposed by the instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerPort {
    pub container_port: u16,

    #[serde(default)]
    pub host_port: Option<u16>,
}

/// Container run on the rented machine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    /// Container name within the project
    #[serde(default = "default_container_name")]
    pub name: String,

    /// Image reference
    pub image: String,

    /// Environment variables
    #[serde(default)]
    pub env: BTreeMap<String, String>,

    /// Ports to publish
    #[serde(default)]
    pub ports: Vec<ContainerPort>,

    /// Working directory inside the container
    #[serde(default = "default_working_dir")]
    pub working_dir: String,
}

fn default_container_name() -> String {
    "default".to_string()
}

fn default_working_dir() -> String {
    "/workspace".to_string()
}

impl ContainerSpec {
    /// Create a container spec for an image
    pub fn new(image: impl Into<String>) -> Self {
        Self {
            name: default_container_name(),
            image: image.into(),
            env: BTreeMap::new(),
            ports: vec![],
            working_dir: default_working_dir(),
        }
    }

    /// Add an environment variable
    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Publish a container port
    pub fn with_port(mut self, container_port: u16) -> Self {
        self.ports.push(ContainerPort {
            container_port,
            host_port: None,
        });
        self
    }

    /// Publish every port in `ports` that isn't published yet
    pub fn merge_ports(mut self, ports: &[u16]) -> Self {
        for &port in ports {
            if !self.ports.iter().any(|p| p.container_port == port) {
                self = self.with_port(port);
            }
        }
        self
    }

    /// Docker-style `-e K=V ... -p P:P ...` string understood by the provider
    pub fn env_string(&self) -> String {
        self.env
            .iter()
            .map(|(k, v)| format!("-e {}={}", k, v))
            .chain(
                self.ports
                    .iter()
                    .map(|p| format!("-p {}:{}", p.container_port, p.container_port)),
            )
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Include/exclude patterns applied when syncing the project
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SyncFilter {
    #[serde(default)]
    pub exclude: Vec<String>,

    #[serde(default)]
    pub include: Vec<String>,
}

/// Project settings consumed by the sync collaborator
#[derive(Debug, Clone, PartialEq)]
pub struct ProjectConfig {
    pub name: String,
    pub project_dir: PathBuf,
    pub sync_filters: Vec<SyncFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawProject {
    name: String,
    #[serde(default)]
    sync_filters: Vec<SyncFilter>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawInstance {
    name: String,
    #[serde(default = "default_provider")]
    provider: String,
    #[serde(default)]
    container_name: Option<String>,
    #[serde(default)]
    parameters: Mapping,
}

fn default_provider() -> String {
    "vast".to_string()
}

#[derive(Debug, Deserialize)]
struct RawProjectFile {
    project: RawProject,
    #[serde(default)]
    containers: Vec<ContainerSpec>,
    #[serde(default)]
    instances: Vec<RawInstance>,
}

/// Fully validated configuration of one Vast instance
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceConfig {
    /// Instance name, used as the provider-side label
    pub name: String,
    pub project: ProjectConfig,
    pub container: ContainerSpec,
    pub parameters: InstanceParameters,
}

impl InstanceConfig {
    /// Load `instance_name` (or the first instance) from a project file
    pub fn load(path: &Path, instance_name: Option<&str>) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| {
            VastError::config(format!("cannot read {}: {}", path.display(), e))
        })?;
        let project_dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));
        Self::from_yaml(&text, project_dir, instance_name)
    }

    /// Parse a project file that lives in `project_dir`
    pub fn from_yaml(text: &str, project_dir: PathBuf, instance_name: Option<&str>) -> Result<Self> {
        let raw: RawProjectFile = serde_yaml::from_str(text)?;

        let instance = match instance_name {
            Some(name) => raw.instances.into_iter().find(|i| i.name == name),
            None => raw.instances.into_iter().next(),
        }
        .ok_or_else(|| match instance_name {
            Some(name) => VastError::config(format!("instance \"{}\" not found", name)),
            None => VastError::config("no instances configured"),
        })?;

        if instance.provider != "vast" {
            return Err(VastError::config(format!(
                "instance \"{}\" uses provider \"{}\", expected \"vast\"",
                instance.name, instance.provider
            )));
        }

        let container = match &instance.container_name {
            Some(name) => raw.containers.into_iter().find(|c| &c.name == name),
            None => raw.containers.into_iter().next(),
        }
        .ok_or_else(|| VastError::config("no container configured for the instance"))?;

        if container.image.trim().is_empty() {
            return Err(VastError::config("container \"image\" must not be empty"));
        }

        let parameters = validate_instance_parameters(&instance.parameters)?;
        let container = container.merge_ports(&parameters.ports);

        Ok(Self {
            name: instance.name,
            project: ProjectConfig {
                name: raw.project.name,
                project_dir,
                sync_filters: raw.project.sync_filters,
            },
            container,
            parameters,
        })
    }

    /// Derive the offer requirements for this instance
    pub fn requirements(&self, policy: &LifecyclePolicy) -> InstanceRequirements {
        InstanceRequirements::derive(&self.parameters, &self.container, policy)
    }
}

/// What the rented machine must provide
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceRequirements {
    /// Provider query predicate, newlines already normalized
    pub query: String,
    pub pricing: PricingMode,
    pub sort: String,
    pub min_disk_gb: u32,
    pub required_ports: usize,
    pub bid_ratio: f64,
    /// Price cap in $/hour; 0 disables the cap
    pub max_price: f64,
}

impl InstanceRequirements {
    /// Re-derive requirements from validated parameters
    pub fn derive(
        params: &InstanceParameters,
        container: &ContainerSpec,
        policy: &LifecyclePolicy,
    ) -> Self {
        Self {
            query: normalize_query(&params.query),
            pricing: params.pricing,
            sort: params.sort.clone(),
            min_disk_gb: params.root_volume_size,
            required_ports: container.ports.len(),
            bid_ratio: params.bid_ratio.unwrap_or(policy.default_bid_ratio),
            max_price: params.max_price,
        }
    }
}
