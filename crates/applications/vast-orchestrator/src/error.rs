//! Error types for the Vast.ai instance orchestrator

use thiserror::Error;

/// Orchestrator result type
pub type Result<T> = std::result::Result<T, VastError>;

/// Errors that can occur while managing a Vast.ai instance
#[derive(Error, Debug)]
pub enum VastError {
    /// Malformed instance parameters, surfaced before any network call
    #[error("Configuration error: {0}")]
    ConfigValidation(String),

    /// No offer satisfies the requirements
    #[error("No offers found: {0}")]
    NoMatch(String),

    /// The provider rejected the creation request
    #[error("Instance creation rejected by the provider: {0}")]
    CreateRejected(String),

    /// The provider accepted the creation request but the new instance can't be located
    #[error(
        "The provider accepted the creation of instance \"{label}\" but it could not be located ({reason}). \
         Check https://cloud.vast.ai/instances/ or run `vastctl delete`"
    )]
    CreationUnconfirmed { label: String, reason: String },

    /// Polling ran out of attempts before the instance became ready
    #[error(
        "Instance {instance_id} was not ready after {attempts} status checks (last status: {last_status:?}). \
         Check it manually at https://cloud.vast.ai/instances/"
    )]
    ProvisioningTimeout {
        instance_id: u64,
        attempts: u32,
        last_status: String,
    },

    /// The provider reported an error while the instance was starting
    #[error("Instance {instance_id} failed to start: {status}")]
    ProvisioningFailed { instance_id: u64, status: String },

    /// The operator declined to overwrite the account SSH key
    #[error(
        "The account has a different SSH key registered. Put the matching private key in {}",
        private_key_path.display()
    )]
    KeyMismatch { private_key_path: std::path::PathBuf },

    /// Feature not available for this provider
    #[error("Unsupported operation: {0}")]
    UnsupportedOperation(String),

    /// No instance carries the configured label
    #[error("Instance \"{0}\" is not running")]
    NotRunning(String),

    /// The instance was evicted by the provider (outbid)
    #[error("Instance {instance_id} was outbid and has exited; a fresh instance is required")]
    Outbid { instance_id: u64 },

    /// The operator declined a destructive operation
    #[error("The operation was cancelled.")]
    Aborted,

    /// Polling was interrupted; the half-created instance was stopped
    #[error("Provisioning of instance {instance_id} was interrupted")]
    Cancelled { instance_id: u64 },

    /// Transient transport failure (connection, timeout)
    #[error("Transport error: {0}")]
    Transport(String),

    /// Non-success HTTP response from the provider API
    #[error("Vast API returned {status}: {body}")]
    Api { status: u16, body: String },

    /// External tool exited unsuccessfully
    #[error("`{program}` failed with exit code {code:?}: {stderr}")]
    Subprocess {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML project file error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl From<reqwest::Error> for VastError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::Api {
                status: status.as_u16(),
                body: err.to_string(),
            },
            None => Self::Transport(err.to_string()),
        }
    }
}

impl VastError {
    /// Create a configuration validation error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::ConfigValidation(msg.into())
    }

    /// Create a transport error
    pub fn transport(msg: impl Into<String>) -> Self {
        Self::Transport(msg.into())
    }

    /// Create an unsupported operation error
    pub fn unsupported(msg: impl Into<String>) -> Self {
        Self::UnsupportedOperation(msg.into())
    }

    /// Create a subprocess failure from a finished process
    pub fn subprocess(program: impl Into<String>, output: &std::process::Output) -> Self {
        Self::Subprocess {
            program: program.into(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        }
    }

    /// Whether the failure may succeed on a later attempt
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || *status >= 500,
            _ => false,
        }
    }

    /// Id of the instance left behind by this failure, if any
    pub fn instance_id(&self) -> Option<u64> {
        match self {
            Self::ProvisioningTimeout { instance_id, .. }
            | Self::ProvisioningFailed { instance_id, .. }
            | Self::Outbid { instance_id }
            | Self::Cancelled { instance_id } => Some(*instance_id),
            _ => None,
        }
    }
}
