//! SSH key reconciliation
//!
//! A Vast.ai account has a single registered public key, and every instance
//! it rents trusts only that key. Before any SSH-dependent step the local key
//! pair under `~/.spotty/keys/vast/` is compared with the registered key. A
//! mismatch is never resolved silently: the operator either approves
//! replacing the account key or installs the matching private key by hand.

use crate::error::{Result, VastError};
use crate::operator::{Confirmation, ProgressSink};
use crate::provider::{AccountService, AccountUser};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// File name of the private key; the public key adds `.pub`
pub const KEY_NAME: &str = "ssh-key";

/// Default keys directory for this provider
pub fn default_keys_dir() -> Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".spotty").join("keys").join("vast"))
        .ok_or_else(|| VastError::config("cannot determine the home directory"))
}

/// Local private/public key files
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyPair {
    dir: PathBuf,
}

impl KeyPair {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// Key pair in [`default_keys_dir`]
    pub fn in_default_dir() -> Result<Self> {
        Ok(Self::new(default_keys_dir()?))
    }

    pub fn private_key_file(&self) -> PathBuf {
        self.dir.join(KEY_NAME)
    }

    pub fn public_key_file(&self) -> PathBuf {
        self.dir.join(format!("{}.pub", KEY_NAME))
    }

    /// Both key files are present
    pub fn exists(&self) -> bool {
        self.private_key_file().is_file() && self.public_key_file().is_file()
    }

    /// Public key, generating the pair first if needed
    pub async fn public_key(&self) -> Result<String> {
        if !self.exists() {
            self.generate().await?;
        }
        let key = tokio::fs::read_to_string(self.public_key_file()).await?;
        Ok(key.trim().to_string())
    }

    /// Generate a passphrase-less RSA key pair with `ssh-keygen`
    pub async fn generate(&self) -> Result<()> {
        let keygen = which::which("ssh-keygen")
            .map_err(|_| VastError::config("\"ssh-keygen\" command not found."))?;

        tokio::fs::create_dir_all(&self.dir).await?;
        // ssh-keygen prompts before overwriting a leftover half of the pair
        for path in [self.private_key_file(), self.public_key_file()] {
            if path.exists() {
                tokio::fs::remove_file(&path).await?;
            }
        }

        info!("Generating SSH key pair in {}", self.dir.display());
        let private_key = self.private_key_file();
        let output = AsyncCommand::new(&keygen)
            .arg("-t")
            .arg("rsa")
            .arg("-N")
            .arg("")
            .arg("-f")
            .arg(&private_key)
            .arg("-q")
            .output()
            .await?;

        if !output.status.success() {
            return Err(VastError::subprocess("ssh-keygen", &output));
        }
        Ok(())
    }
}

/// Whether the account key had to be replaced
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyStatus {
    Matched,
    Updated,
}

/// Keeps the account's registered key in line with the local key pair
pub struct KeyReconciler {
    account: Arc<dyn AccountService>,
    keys: KeyPair,
    confirm: Arc<dyn Confirmation>,
    sink: Arc<dyn ProgressSink>,
}

impl KeyReconciler {
    pub fn new(
        account: Arc<dyn AccountService>,
        keys: KeyPair,
        confirm: Arc<dyn Confirmation>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        Self {
            account,
            keys,
            confirm,
            sink,
        }
    }

    /// Private key matching the account key once reconciled
    pub fn private_key_file(&self) -> PathBuf {
        self.keys.private_key_file()
    }

    /// Fetch the account binding and reconcile it
    pub async fn ensure_key_matches(&self) -> Result<KeyStatus> {
        let user = self.account.show_user().await?;
        self.reconcile(&user).await
    }

    /// Reconcile against an already fetched account binding
    pub async fn reconcile(&self, user: &AccountUser) -> Result<KeyStatus> {
        let local = self.keys.public_key().await?;
        let remote = user.ssh_key.as_deref().map(str::trim).unwrap_or_default();

        if remote == local {
            debug!(user_id = user.id, "Account SSH key matches the local key");
            return Ok(KeyStatus::Matched);
        }

        if remote.is_empty() {
            self.sink.line("The Vast.ai account has no SSH key registered.");
        } else {
            self.sink
                .line("The Vast.ai account has a different SSH key registered.");
            self.sink.line(&format!("  account key: {}", abbreviate(remote)));
        }
        self.sink.line(&format!(
            "  local key:   {} ({})",
            abbreviate(&local),
            self.keys.public_key_file().display()
        ));

        let approved = self.confirm.confirm(
            "Replace the account SSH key with the local key? Instances using the old key will lose access.",
        )?;
        if !approved {
            return Err(VastError::KeyMismatch {
                private_key_path: self.keys.private_key_file(),
            });
        }

        self.sink.line("Updating the account SSH key...");
        self.account.update_ssh_key(user.id, &local).await?;
        info!(user_id = user.id, "Account SSH key updated");
        Ok(KeyStatus::Updated)
    }
}

/// `ssh-rsa AAAAB3Nz...Xk9 me@host` without the middle of the key body
fn abbreviate(key: &str) -> String {
    let mut parts = key.split_whitespace();
    let kind = parts.next().unwrap_or_default();
    let body = parts.next().unwrap_or_default();
    let comment = parts.collect::<Vec<_>>().join(" ");

    let body = if body.len() > 24 && body.is_ascii() {
        format!("{}...{}", &body[..12], &body[body.len() - 8..])
    } else {
        body.to_string()
    };

    [kind, body.as_str(), comment.as_str()]
        .iter()
        .filter(|s| !s.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join(" ")
}
