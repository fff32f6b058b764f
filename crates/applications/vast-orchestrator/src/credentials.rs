//! Vast.ai API credentials
//!
//! The API key is stored in `~/.vast_api_key`, the same file the official
//! CLI uses. Credentials are loaded once and handed to every client explicitly.

use crate::error::{Result, VastError};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Default REST endpoint
pub const DEFAULT_BASE_URL: &str = "https://console.vast.ai";

/// Environment variable overriding the base URL
pub const BASE_URL_ENV: &str = "VAST_API_URL";

const API_KEY_FILE_NAME: &str = ".vast_api_key";

/// Path of the per-user API key file
pub fn api_key_file() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(API_KEY_FILE_NAME))
        .ok_or_else(|| VastError::config("cannot determine the home directory"))
}

/// API key and endpoint for the provider
#[derive(Clone, PartialEq, Eq)]
pub struct ApiCredentials {
    api_key: String,
    base_url: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("api_key", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}

impl ApiCredentials {
    /// Create credentials from an explicit key
    pub fn new(api_key: impl Into<String>, base_url: impl Into<String>) -> Result<Self> {
        let api_key = api_key.into().trim().to_string();
        if api_key.is_empty() {
            return Err(VastError::config(
                "Vast.ai API key is empty. Run `vastctl set-api-key <KEY>` first.",
            ));
        }
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        Ok(Self { api_key, base_url })
    }

    /// Use an explicit key with the usual base URL resolution
    pub fn from_key(api_key: impl Into<String>, base_url: Option<String>) -> Result<Self> {
        Self::new(api_key, resolve_base_url(base_url))
    }

    /// Load the key from `~/.vast_api_key`
    ///
    /// `base_url` wins over `VAST_API_URL`, which wins over the default.
    pub fn load(base_url: Option<String>) -> Result<Self> {
        Self::load_from(&api_key_file()?, base_url)
    }

    /// Load the key from a specific file
    pub fn load_from(path: &Path, base_url: Option<String>) -> Result<Self> {
        debug!("Loading Vast.ai API key from {}", path.display());
        let api_key = std::fs::read_to_string(path).map_err(|e| {
            VastError::config(format!(
                "cannot read the API key from {} ({}). Run `vastctl set-api-key <KEY>` first.",
                path.display(),
                e
            ))
        })?;
        Self::new(api_key, resolve_base_url(base_url))
    }

    /// Persist an API key to `~/.vast_api_key`
    pub fn save(api_key: &str) -> Result<PathBuf> {
        let path = api_key_file()?;
        Self::save_to(&path, api_key)?;
        Ok(path)
    }

    /// Persist an API key to `path`
    pub fn save_to(path: &Path, api_key: &str) -> Result<()> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(VastError::config("refusing to save an empty API key"));
        }
        std::fs::write(path, api_key)?;
        #[cfg(unix)]
        {
            use std::os::unix::fs::PermissionsExt;
            std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
        }
        Ok(())
    }

    /// API key
    pub fn api_key(&self) -> &str {
        &self.api_key
    }

    /// Base URL without a trailing slash
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Full URL of an `/api/v0` endpoint
    pub fn endpoint(&self, path: &str) -> String {
        format!("{}/api/v0{}", self.base_url, path)
    }
}

fn resolve_base_url(explicit: Option<String>) -> String {
    explicit
        .or_else(|| std::env::var(BASE_URL_ENV).ok())
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_BASE_URL.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_and_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".vast_api_key");

        ApiCredentials::save_to(&path, "  abc123\n").unwrap();
        let creds =
            ApiCredentials::load_from(&path, Some("http://localhost:9000/".into())).unwrap();

        assert_eq!(creds.api_key(), "abc123");
        assert_eq!(creds.base_url(), "http://localhost:9000");
        assert_eq!(
            creds.endpoint("/instances/"),
            "http://localhost:9000/api/v0/instances/"
        );
    }

    #[test]
    fn test_missing_or_empty_key_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = ApiCredentials::load_from(&dir.path().join("nope"), None);
        assert!(matches!(missing, Err(VastError::ConfigValidation(_))));

        let empty = ApiCredentials::new("   ", DEFAULT_BASE_URL);
        assert!(matches!(empty, Err(VastError::ConfigValidation(_))));
    }

    #[test]
    fn test_debug_redacts_key() {
        let creds = ApiCredentials::new("secret-key", DEFAULT_BASE_URL).unwrap();
        assert!(!format!("{:?}", creds).contains("secret-key"));
    }
}
