//! Remote handoff over SSH
//!
//! Once an instance is ready the project is pushed with `rsync` and commands
//! run through `ssh`, both as subprocesses using the reconciled key pair.
//! Vast.ai containers expose their SSH daemon on a host port mapped to
//! container port 22 and log in as `root`.
//!
//! ## Prerequisites
//!
//! `ssh` and `rsync` must be on `PATH`.

use crate::config::ProjectConfig;
use crate::error::{Result, VastError};
use crate::provider::RemoteInstance;
use async_trait::async_trait;
use std::path::PathBuf;
use tokio::process::Command as AsyncCommand;
use tracing::{debug, info};

/// Login user of Vast.ai containers
pub const SSH_USER: &str = "root";

/// Options that keep ssh from prompting about unknown hosts
const SSH_OPTIONS: &[&str] = &[
    "-o",
    "StrictHostKeyChecking=no",
    "-o",
    "UserKnownHostsFile=/dev/null",
    "-o",
    "LogLevel=ERROR",
];

/// Where and how to reach the instance
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SshTarget {
    pub host: String,
    pub port: u16,
    pub user: String,
    pub key_path: PathBuf,
}

impl SshTarget {
    /// Target of a ready instance
    ///
    /// Fails with [`VastError::ProvisioningFailed`] when the instance has no
    /// public address or no host port for container port 22.
    pub fn from_instance(instance: &RemoteInstance, key_path: PathBuf) -> Result<Self> {
        let failed = |status: &str| VastError::ProvisioningFailed {
            instance_id: instance.id,
            status: status.to_string(),
        };

        let host = instance
            .public_ipaddr
            .as_deref()
            .map(str::trim)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| failed("the instance has no public IP address"))?;
        let port = instance
            .ssh_port()
            .ok_or_else(|| failed("no host port is mapped to container port 22"))?;

        Ok(Self {
            host: host.to_string(),
            port,
            user: SSH_USER.to_string(),
            key_path,
        })
    }

    /// `user@host`
    pub fn destination(&self) -> String {
        format!("{}@{}", self.user, self.host)
    }

    /// Arguments for `ssh`, ending with the remote command
    pub fn ssh_args(&self, command: &str, tty: bool) -> Vec<String> {
        let mut args = vec![
            "-i".to_string(),
            self.key_path.display().to_string(),
            "-p".to_string(),
            self.port.to_string(),
        ];
        args.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        if tty {
            args.push("-t".to_string());
        }
        args.push(self.destination());
        if !command.is_empty() {
            args.push(command.to_string());
        }
        args
    }

    /// Remote shell command handed to `rsync -e`
    pub fn rsync_shell(&self) -> String {
        let mut parts = vec![
            "ssh".to_string(),
            "-i".to_string(),
            shell_quote(&self.key_path.display().to_string()),
            "-p".to_string(),
            self.port.to_string(),
        ];
        parts.extend(SSH_OPTIONS.iter().map(|s| s.to_string()));
        parts.join(" ")
    }
}

/// Single-quote a value for a POSIX shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// `rsync` arguments pushing the project directory into `remote_dir`
pub fn rsync_args(target: &SshTarget, project: &ProjectConfig, remote_dir: &str) -> Vec<String> {
    let mut args = vec![
        "-av".to_string(),
        "--no-owner".to_string(),
        "--no-group".to_string(),
        "-e".to_string(),
        target.rsync_shell(),
    ];

    for filter in &project.sync_filters {
        args.extend(filter.include.iter().map(|p| format!("--include={}", p)));
        args.extend(filter.exclude.iter().map(|p| format!("--exclude={}", p)));
    }

    let source = format!("{}/", project.project_dir.display().to_string().trim_end_matches('/'));
    args.push(source);
    args.push(format!(
        "{}:{}/",
        target.destination(),
        remote_dir.trim_end_matches('/')
    ));
    args
}

/// Copies the project to the instance
#[async_trait]
pub trait FileSync: Send + Sync {
    async fn sync(&self, target: &SshTarget, project: &ProjectConfig, remote_dir: &str)
    -> Result<()>;
}

/// Runs commands on the instance
#[async_trait]
pub trait RemoteExec: Send + Sync {
    /// Run `command`, returning its exit code
    async fn exec(&self, target: &SshTarget, command: &str, tty: bool) -> Result<i32>;
}

fn require_tool(program: &str) -> Result<PathBuf> {
    which::which(program)
        .map_err(|_| VastError::config(format!("\"{}\" command not found.", program)))
}

/// [`FileSync`] backed by `rsync` over `ssh`
#[derive(Debug, Default, Clone, Copy)]
pub struct RsyncFileSync;

#[async_trait]
impl FileSync for RsyncFileSync {
    async fn sync(
        &self,
        target: &SshTarget,
        project: &ProjectConfig,
        remote_dir: &str,
    ) -> Result<()> {
        let rsync = require_tool("rsync")?;
        let args = rsync_args(target, project, remote_dir);
        info!(
            host = %target.host,
            port = target.port,
            "Syncing {} to {}",
            project.project_dir.display(),
            remote_dir
        );
        debug!("rsync {}", args.join(" "));

        let output = AsyncCommand::new(rsync).args(&args).output().await?;
        if !output.status.success() {
            return Err(VastError::subprocess("rsync", &output));
        }
        Ok(())
    }
}

/// [`RemoteExec`] backed by `ssh`, inheriting the terminal
#[derive(Debug, Default, Clone, Copy)]
pub struct SshRemoteExec;

#[async_trait]
impl RemoteExec for SshRemoteExec {
    async fn exec(&self, target: &SshTarget, command: &str, tty: bool) -> Result<i32> {
        let ssh = require_tool("ssh")?;
        debug!(host = %target.host, port = target.port, command = %command, "Running remote command");

        let status = AsyncCommand::new(ssh)
            .args(target.ssh_args(command, tty))
            .status()
            .await?;

        status.code().ok_or_else(|| VastError::Subprocess {
            program: "ssh".to_string(),
            code: None,
            stderr: "terminated by a signal".to_string(),
        })
    }
}
