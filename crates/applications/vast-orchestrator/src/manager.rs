//! Instance manager
//!
//! Entry point used by the CLI. Coordinates the full start sequence:
//!
//! 1. Confirm and tear down an existing instance with the same label
//! 2. Select an offer ([`OfferSelector`])
//! 3. Create and wait for readiness ([`InstanceLifecycle`])
//! 4. Reconcile the account SSH key ([`KeyReconciler`])
//! 5. Sync the project and prepare the remote shell
//!
//! The manager caches the last snapshot of its instance. The cache is dropped
//! after every create, stop and delete, and readiness checks never use it.

use crate::client::VastClient;
use crate::config::{InstanceConfig, InstanceRequirements, LifecyclePolicy};
use crate::error::{Result, VastError};
use crate::keys::{KeyPair, KeyReconciler};
use crate::lifecycle::{InstanceLifecycle, LifecycleState, TeardownOutcome};
use crate::offer::OfferSelector;
use crate::operator::{Confirmation, ProgressSink};
use crate::provider::{
    AccountService, CreateInstanceRequest, InstanceProvider, Offer, OfferQueryService,
    RemoteInstance,
};
use crate::remote::{FileSync, RemoteExec, RsyncFileSync, SshRemoteExec, SshTarget};
use crate::status;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::process::Command as AsyncCommand;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Makes login shells start in the workspace
const BASHRC_COMMAND: &str = "echo 'HOME=/workspace && cd' >> /root/.bashrc";

/// Provider services used by the manager
#[derive(Clone)]
pub struct ProviderServices {
    pub offers: Arc<dyn OfferQueryService>,
    pub instances: Arc<dyn InstanceProvider>,
    pub account: Arc<dyn AccountService>,
}

impl ProviderServices {
    /// All services backed by one REST client
    pub fn from_client(client: VastClient) -> Self {
        let client = Arc::new(client);
        Self {
            offers: client.clone(),
            instances: client.clone(),
            account: client,
        }
    }
}

/// Result of [`InstanceManager::start`]
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    /// The instance is ready and the project is synced
    Started(RemoteInstance),
    /// Nothing was created
    DryRun {
        offer: Offer,
        request: CreateInstanceRequest,
    },
}

/// Resolve the `imageLogin` parameter into registry credentials
///
/// A value containing `docker login` is used as is; anything else is a shell
/// command whose first output line is taken. The `docker login ` prefix is
/// stripped either way.
pub async fn resolve_image_login(image_login: Option<&str>) -> Result<Option<String>> {
    let Some(raw) = image_login.map(str::trim).filter(|s| !s.is_empty()) else {
        return Ok(None);
    };

    let line = if raw.contains("docker login") {
        raw.to_string()
    } else {
        let output = AsyncCommand::new("sh").arg("-c").arg(raw).output().await?;
        if !output.status.success() {
            return Err(VastError::subprocess("imageLogin", &output));
        }
        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .unwrap_or_default()
            .to_string()
    };

    let login = match line.rsplit_once("docker login ") {
        Some((_, rest)) => rest,
        None => line.as_str(),
    }
    .trim()
    .to_string();

    Ok(Some(login).filter(|l| !l.is_empty()))
}

/// Manages the single instance described by an [`InstanceConfig`]
pub struct InstanceManager {
    config: InstanceConfig,
    policy: LifecyclePolicy,
    selector: OfferSelector,
    lifecycle: InstanceLifecycle,
    keys: KeyReconciler,
    file_sync: Arc<dyn FileSync>,
    remote_exec: Arc<dyn RemoteExec>,
    confirm: Arc<dyn Confirmation>,
    sink: Arc<dyn ProgressSink>,
    cancel: CancellationToken,
    cached: Option<RemoteInstance>,
}

impl InstanceManager {
    pub fn new(
        config: InstanceConfig,
        services: ProviderServices,
        keys: KeyPair,
        confirm: Arc<dyn Confirmation>,
        sink: Arc<dyn ProgressSink>,
    ) -> Self {
        let policy = config.parameters.lifecycle_policy();
        Self {
            selector: OfferSelector::new(services.offers, policy.port_rule),
            lifecycle: InstanceLifecycle::new(services.instances, policy.clone(), &config.name),
            keys: KeyReconciler::new(services.account, keys, confirm.clone(), sink.clone()),
            file_sync: Arc::new(RsyncFileSync),
            remote_exec: Arc::new(SshRemoteExec),
            cancel: CancellationToken::new(),
            cached: None,
            config,
            policy,
            confirm,
            sink,
        }
    }

    /// Replace the sync collaborator
    pub fn with_file_sync(mut self, file_sync: Arc<dyn FileSync>) -> Self {
        self.file_sync = file_sync;
        self
    }

    /// Replace the exec collaborator
    pub fn with_remote_exec(mut self, remote_exec: Arc<dyn RemoteExec>) -> Self {
        self.remote_exec = remote_exec;
        self
    }

    /// Token that interrupts readiness polling
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn instance_name(&self) -> &str {
        &self.config.name
    }

    pub fn lifecycle_state(&self) -> LifecycleState {
        self.lifecycle.state()
    }

    /// Requirements derived from the current configuration
    pub fn requirements(&self) -> InstanceRequirements {
        self.config.requirements(&self.policy)
    }

    /// Snapshot of the instance carrying the configured label
    pub async fn get_instance(&mut self, force_update: bool) -> Result<Option<RemoteInstance>> {
        if force_update || self.cached.is_none() {
            self.cached = self.lifecycle.find_by_label().await?;
        }
        Ok(self.cached.clone())
    }

    fn invalidate(&mut self) {
        self.cached = None;
    }

    /// Whether the instance is running
    ///
    /// An evicted instance is reported as [`VastError::Outbid`].
    pub async fn is_running(&mut self) -> Result<bool> {
        match self.get_instance(true).await? {
            Some(instance) if instance.is_evicted() => Err(VastError::Outbid {
                instance_id: instance.id,
            }),
            Some(instance) => Ok(instance.is_running()),
            None => Ok(false),
        }
    }

    /// Rent, provision and prepare the instance
    ///
    /// Any instance already carrying the label, including a stopped one, is
    /// destroyed after confirmation before the new one is created, so two
    /// instances never share a label.
    pub async fn start(&mut self, dry_run: bool) -> Result<StartOutcome> {
        let req = self.requirements();

        if !dry_run {
            self.replace_existing().await?;
        }

        self.sink.line(&format!(
            "Finding an offer for \"{}\" sorted by \"{}\"...",
            req.query, req.sort
        ));
        let offer = self.selector.select(&req).await?;
        self.sink.line(&describe_offer(&offer));

        let login = resolve_image_login(self.config.parameters.image_login.as_deref()).await?;

        if dry_run {
            let request =
                self.lifecycle
                    .creation_request(&offer, &req, &self.config.container, login);
            self.sink.line(&format!(
                "Dry run: would rent offer {} with image {} at {}",
                request.offer_id,
                request.image,
                request
                    .price
                    .map(|p| format!("${:.4}/h", p))
                    .unwrap_or_else(|| "the listed price".to_string())
            ));
            return Ok(StartOutcome::DryRun { offer, request });
        }

        let pending = self
            .lifecycle
            .create(&offer, &req, &self.config.container, login)
            .await;
        self.invalidate();
        let pending = match pending {
            Ok(pending) => pending,
            Err(e) => {
                if let VastError::CreationUnconfirmed { label, .. } = &e {
                    self.sink.line(&format!(
                        "An instance labelled \"{}\" may still be starting. \
                         Check the Vast.ai console or run `vastctl delete`.",
                        label
                    ));
                }
                return Err(e);
            }
        };
        self.sink
            .line(&format!("Instance {} created, waiting for it to start...", pending.instance_id));

        let instance = match self.lifecycle.await_ready(&pending, &self.cancel).await {
            Ok(instance) => instance,
            Err(e) => {
                if let Some(id) = e.instance_id() {
                    self.sink.line(&format!(
                        "Instance {} was stopped. Run `vastctl delete` to remove it.",
                        id
                    ));
                }
                return Err(e);
            }
        };
        self.sink.line("Instance created successfully.");
        self.cached = Some(instance.clone());

        if let Err(e) = self.hand_off(&instance).await {
            self.sink.line(&format!(
                "Instance {} is running but could not be prepared. Stop it with `vastctl stop`.",
                instance.id
            ));
            return Err(e);
        }

        self.lifecycle.mark_running();
        info!(instance_id = instance.id, "Instance is up");
        Ok(StartOutcome::Started(instance))
    }

    /// Key reconciliation, project sync and shell setup on a ready instance
    async fn hand_off(&mut self, instance: &RemoteInstance) -> Result<()> {
        self.keys.ensure_key_matches().await?;
        let target = SshTarget::from_instance(instance, self.keys.private_key_file())?;

        self.sink.line("Syncing the project with the instance...");
        self.file_sync
            .sync(
                &target,
                &self.config.project,
                &self.config.container.working_dir,
            )
            .await?;

        let code = self.remote_exec.exec(&target, BASHRC_COMMAND, false).await?;
        if code != 0 {
            warn!(code, "Failed to update the remote .bashrc");
        }
        Ok(())
    }

    /// Ask before replacing an instance that already uses the label
    async fn replace_existing(&mut self) -> Result<()> {
        let Some(existing) = self.get_instance(true).await? else {
            return Ok(());
        };

        let prompt = if existing.is_evicted() {
            self.sink.line(&format!(
                "Instance {} was outbid and has exited.",
                existing.id
            ));
            "Delete it and create a new instance?"
        } else {
            self.sink.line(&format!(
                "Instance {} is already {}.",
                existing.id,
                existing.actual_status.as_deref().unwrap_or("created")
            ));
            "Are you sure you want to restart it? Data on the instance disk will be lost."
        };

        if !self.confirm.confirm(prompt)? {
            return Err(VastError::Aborted);
        }

        self.sink.line("Terminating the instance...");
        let outcome = self.lifecycle.destroy(Some(existing.id)).await;
        self.invalidate();
        outcome?;
        Ok(())
    }

    /// Stop (`only_shutdown`) or destroy the instance
    pub async fn stop(&mut self, only_shutdown: bool) -> Result<TeardownOutcome> {
        let instance_id = self.get_instance(false).await?.map(|i| i.id);

        let outcome = if only_shutdown {
            self.lifecycle.stop(instance_id).await
        } else {
            self.lifecycle.destroy(instance_id).await
        };
        self.invalidate();

        let outcome = outcome?;
        self.sink.line(&match outcome {
            TeardownOutcome::Stopped(id) => format!("Instance {} stopped.", id),
            TeardownOutcome::Destroyed(id) => format!("Instance {} deleted.", id),
            TeardownOutcome::NotRunning => "Instance is not running.".to_string(),
        });
        Ok(outcome)
    }

    /// Destroy the instance
    pub async fn delete(&mut self) -> Result<TeardownOutcome> {
        self.stop(false).await
    }

    /// Nothing is left behind on the provider once the instance is destroyed
    pub async fn clean(&mut self) -> Result<()> {
        Ok(())
    }

    /// Run a command on the instance, returning its exit code
    pub async fn exec(&mut self, command: &str, tty: bool) -> Result<i32> {
        if command.trim() == "$SHELL" {
            return Err(VastError::unsupported(
                "Vast.ai instances give no access to the host OS, so a host shell can't be opened",
            ));
        }

        self.keys.ensure_key_matches().await?;
        let target = self.ssh_target().await?;
        self.remote_exec.exec(&target, command, tty).await
    }

    /// Push the project to the instance
    pub async fn sync(&mut self) -> Result<()> {
        self.keys.ensure_key_matches().await?;
        let target = self.ssh_target().await?;
        self.file_sync
            .sync(
                &target,
                &self.config.project,
                &self.config.container.working_dir,
            )
            .await
    }

    /// Status table of the instance
    pub async fn status_text(&mut self) -> Result<String> {
        match self.get_instance(true).await? {
            Some(instance) if instance.is_evicted() => Err(VastError::Outbid {
                instance_id: instance.id,
            }),
            Some(instance) => Ok(status::status_text(&instance)),
            None => Err(VastError::NotRunning(self.config.name.clone())),
        }
    }

    /// SSH target of the running instance
    pub async fn ssh_target(&mut self) -> Result<SshTarget> {
        let instance = match self.get_instance(false).await? {
            Some(instance) if instance.is_evicted() => {
                return Err(VastError::Outbid {
                    instance_id: instance.id,
                });
            }
            Some(instance) => instance,
            None => return Err(VastError::NotRunning(self.config.name.clone())),
        };
        SshTarget::from_instance(&instance, self.ssh_key_path())
    }

    pub async fn ssh_host(&mut self) -> Result<String> {
        Ok(self.ssh_target().await?.host)
    }

    pub async fn ssh_port(&mut self) -> Result<u16> {
        Ok(self.ssh_target().await?.port)
    }

    pub fn ssh_key_path(&self) -> PathBuf {
        self.keys.private_key_file()
    }

    /// The host OS is not reachable, so tmux can't be installed
    pub fn use_tmux(&self) -> bool {
        false
    }
}

fn describe_offer(offer: &Offer) -> String {
    format!(
        "Selected offer {}: {}x {} | ${:.4}/h | {:.0} GB disk | {} direct ports",
        offer.id,
        offer.num_gpus.unwrap_or(0),
        offer.gpu_name.as_deref().unwrap_or("unknown GPU"),
        offer.price,
        offer.disk_space,
        offer.direct_port_count
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ProjectConfig;
    use crate::operator::AutoConfirm;
    use crate::testing::{FakeProvider, MemorySink, instance, offer, ready_instance};
    use async_trait::async_trait;
    use std::sync::Mutex;
    use tempfile::TempDir;

    const PUBLIC_KEY: &str = "ssh-rsa AAAAB3NzaC1yc2EAAAADAQABAAABAQCtest me@laptop";

    const PROJECT: &str = r#"
project:
  name: demo
containers:
  - image: pytorch/pytorch:latest
    env: { WANDB_MODE: offline }
    ports: [{ containerPort: 8888 }]
instances:
  - name: vast-1
    provider: vast
    parameters:
      query: num_gpus=1 gpu_name=RTX_3090
      type: bid
      pollIntervalSecs: 0
      maxPollAttempts: 3
"#;

    #[derive(Default)]
    struct RecordingRemote {
        synced: Mutex<Vec<(SshTarget, String)>>,
        commands: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl FileSync for RecordingRemote {
        async fn sync(
            &self,
            target: &SshTarget,
            _project: &ProjectConfig,
            remote_dir: &str,
        ) -> Result<()> {
            self.synced
                .lock()
                .unwrap()
                .push((target.clone(), remote_dir.to_string()));
            Ok(())
        }
    }

    #[async_trait]
    impl RemoteExec for RecordingRemote {
        async fn exec(&self, _target: &SshTarget, command: &str, _tty: bool) -> Result<i32> {
            self.commands.lock().unwrap().push(command.to_string());
            Ok(0)
        }
    }

    struct Harness {
        fake: Arc<FakeProvider>,
        remote: Arc<RecordingRemote>,
        sink: Arc<MemorySink>,
        manager: InstanceManager,
        _keys_dir: TempDir,
    }

    fn harness(confirm: AutoConfirm) -> Harness {
        let keys_dir = tempfile::tempdir().unwrap();
        std::fs::write(keys_dir.path().join("ssh-key"), "PRIVATE").unwrap();
        std::fs::write(keys_dir.path().join("ssh-key.pub"), PUBLIC_KEY).unwrap();

        let fake = Arc::new(FakeProvider::with_offers(vec![offer(42, 0.4)]));
        fake.set_remote_key(Some(PUBLIC_KEY));
        let remote = Arc::new(RecordingRemote::default());
        let sink = Arc::new(MemorySink::default());

        let config =
            InstanceConfig::from_yaml(PROJECT, PathBuf::from("/home/me/demo"), None).unwrap();
        let services = ProviderServices {
            offers: fake.clone(),
            instances: fake.clone(),
            account: fake.clone(),
        };
        let manager = InstanceManager::new(
            config,
            services,
            KeyPair::new(keys_dir.path()),
            Arc::new(confirm),
            sink.clone(),
        )
        .with_file_sync(remote.clone())
        .with_remote_exec(remote.clone());

        Harness {
            fake,
            remote,
            sink,
            manager,
            _keys_dir: keys_dir,
        }
    }

    #[tokio::test]
    async fn test_start_provisions_and_hands_off() {
        let mut h = harness(AutoConfirm::no());
        // label lookup before creating, then two readiness checks
        h.fake.push_listing(vec![]);
        h.fake.push_listing(vec![instance(100, "vast-1", "loading", "Pulling image")]);
        h.fake.push_listing(vec![ready_instance(100, "vast-1")]);

        let outcome = h.manager.start(false).await.unwrap();

        assert!(matches!(outcome, StartOutcome::Started(ref i) if i.id == 100));
        assert_eq!(h.manager.lifecycle_state(), LifecycleState::Running);

        let created = h.fake.created();
        assert_eq!(created.len(), 1);
        assert_eq!(created[0].offer_id, 42);
        assert_eq!(created[0].env, "-e WANDB_MODE=offline -p 8888:8888");
        assert_eq!(created[0].price, Some(0.48));

        let queries = h.fake.queries.lock().unwrap();
        assert_eq!(
            queries[0].query,
            "num_gpus=1 gpu_name=RTX_3090 disk_space>=16 direct_port_count>=1 rentable=True"
        );

        let synced = h.remote.synced.lock().unwrap();
        assert_eq!(synced[0].0.port, 40022);
        assert_eq!(synced[0].1, "/workspace");
        assert_eq!(h.remote.commands.lock().unwrap().as_slice(), &[BASHRC_COMMAND]);
        assert!(h.fake.key_updates().is_empty());
        assert!(h.sink.contains("Instance created successfully."));
    }

    #[tokio::test]
    async fn test_start_rejected_before_polling() {
        let mut h = harness(AutoConfirm::no());
        h.fake.reject_creation("offer no longer available");

        let err = h.manager.start(false).await.unwrap_err();

        assert!(matches!(err, VastError::CreateRejected(_)));
        // only the label lookup before creation
        assert_eq!(h.fake.show_calls(), 1);
        assert!(h.remote.synced.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_start_timeout_stops_and_reports_id() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![]);
        h.fake.push_listing(vec![instance(100, "vast-1", "loading", "Pulling image")]);

        let err = h.manager.start(false).await.unwrap_err();

        assert!(matches!(err, VastError::ProvisioningTimeout { instance_id: 100, attempts: 3, .. }));
        assert_eq!(h.fake.stopped(), vec![100]);
        assert!(h.sink.contains("Instance 100 was stopped"));
    }

    #[tokio::test]
    async fn test_start_reports_unconfirmed_creation() {
        let mut h = harness(AutoConfirm::no());
        h.fake.accept_without_contract();
        h.fake.push_listing(vec![]);

        let err = h.manager.start(false).await.unwrap_err();

        assert!(matches!(err, VastError::CreationUnconfirmed { .. }));
        assert_eq!(h.manager.lifecycle_state(), LifecycleState::Failed);
        assert!(h.sink.contains("may still be starting"));
        assert!(h.sink.contains("vastctl delete"));
    }

    #[tokio::test]
    async fn test_stopped_instance_needs_confirmation() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![instance(7, "vast-1", "stopped", "")]);

        let err = h.manager.start(false).await.unwrap_err();

        assert!(matches!(err, VastError::Aborted));
        assert!(h.fake.created().is_empty());
        assert!(h.sink.contains("Instance 7 is already stopped."));
    }

    #[tokio::test]
    async fn test_restart_declined_has_no_side_effects() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);

        let err = h.manager.start(false).await.unwrap_err();

        assert!(matches!(err, VastError::Aborted));
        assert!(h.fake.created().is_empty());
        assert!(h.fake.destroyed().is_empty());
        assert!(h.fake.stopped().is_empty());
    }

    #[tokio::test]
    async fn test_restart_confirmed_replaces_instance() {
        let mut h = harness(AutoConfirm::yes());
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);
        h.fake.push_listing(vec![ready_instance(100, "vast-1")]);

        h.manager.start(false).await.unwrap();

        assert_eq!(h.fake.destroyed(), vec![7]);
        assert_eq!(h.fake.created().len(), 1);
    }

    #[tokio::test]
    async fn test_outbid_instance_is_replaced_after_confirmation() {
        let mut h = harness(AutoConfirm::yes());
        h.fake.push_listing(vec![instance(7, "vast-1", "exited", "outbid")]);
        h.fake.push_listing(vec![ready_instance(100, "vast-1")]);

        h.manager.start(false).await.unwrap();

        assert!(h.sink.contains("outbid"));
        assert_eq!(h.fake.destroyed(), vec![7]);
    }

    #[tokio::test]
    async fn test_dry_run_creates_nothing() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);

        let outcome = h.manager.start(true).await.unwrap();

        match outcome {
            StartOutcome::DryRun { offer, request } => {
                assert_eq!(offer.id, 42);
                assert_eq!(request.label, "vast-1");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert!(h.fake.created().is_empty());
        assert_eq!(h.fake.show_calls(), 0);
    }

    #[tokio::test]
    async fn test_is_running_reports_outbid() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![instance(7, "vast-1", "exited", "")]);

        let err = h.manager.is_running().await.unwrap_err();
        assert!(matches!(err, VastError::Outbid { instance_id: 7 }));
        assert!(matches!(
            h.manager.status_text().await,
            Err(VastError::Outbid { .. })
        ));
    }

    #[tokio::test]
    async fn test_is_running() {
        let mut h = harness(AutoConfirm::no());
        assert!(!h.manager.is_running().await.unwrap());

        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);
        assert!(h.manager.is_running().await.unwrap());
    }

    #[tokio::test]
    async fn test_stop_and_delete_without_instance() {
        let mut h = harness(AutoConfirm::no());

        assert_eq!(h.manager.stop(true).await.unwrap(), TeardownOutcome::NotRunning);
        assert_eq!(h.manager.delete().await.unwrap(), TeardownOutcome::NotRunning);
        h.manager.clean().await.unwrap();
        assert!(h.fake.stopped().is_empty());
        assert!(h.fake.destroyed().is_empty());
        assert!(h.sink.contains("not running"));
    }

    #[tokio::test]
    async fn test_stop_uses_label_lookup() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![
            ready_instance(3, "other"),
            ready_instance(7, "vast-1"),
        ]);

        assert_eq!(h.manager.stop(true).await.unwrap(), TeardownOutcome::Stopped(7));
        assert_eq!(h.manager.delete().await.unwrap(), TeardownOutcome::Destroyed(7));
        assert_eq!(h.fake.stopped(), vec![7]);
        assert_eq!(h.fake.destroyed(), vec![7]);
    }

    #[tokio::test]
    async fn test_exec_refuses_host_shell() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);

        let err = h.manager.exec("$SHELL", true).await.unwrap_err();

        assert!(matches!(err, VastError::UnsupportedOperation(_)));
        assert!(h.remote.commands.lock().unwrap().is_empty());
        assert_eq!(h.fake.show_calls(), 0);
    }

    #[tokio::test]
    async fn test_exec_runs_command() {
        let mut h = harness(AutoConfirm::no());
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);

        let code = h.manager.exec("nvidia-smi", true).await.unwrap();

        assert_eq!(code, 0);
        assert_eq!(h.remote.commands.lock().unwrap().as_slice(), &["nvidia-smi"]);
        assert_eq!(h.manager.ssh_port().await.unwrap(), 40022);
        assert_eq!(h.manager.ssh_host().await.unwrap(), "203.0.113.7");
        assert!(!h.manager.use_tmux());
    }

    #[tokio::test]
    async fn test_exec_without_instance() {
        let mut h = harness(AutoConfirm::no());
        let err = h.manager.exec("ls", false).await.unwrap_err();
        assert!(matches!(err, VastError::NotRunning(ref name) if name == "vast-1"));
    }

    #[tokio::test]
    async fn test_exec_with_mismatched_key_declined() {
        let mut h = harness(AutoConfirm::no());
        h.fake.set_remote_key(Some("ssh-rsa OTHER other@host"));
        h.fake.push_listing(vec![ready_instance(7, "vast-1")]);

        let err = h.manager.exec("ls", false).await.unwrap_err();

        assert!(matches!(err, VastError::KeyMismatch { .. }));
        assert!(h.remote.commands.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_resolve_image_login() {
        assert_eq!(resolve_image_login(None).await.unwrap(), None);
        assert_eq!(
            resolve_image_login(Some("docker login -u me -p secret registry.io"))
                .await
                .unwrap()
                .as_deref(),
            Some("-u me -p secret registry.io")
        );
        assert_eq!(
            resolve_image_login(Some("printf '%s\\n' '-u ci -p tok ghcr.io' extra"))
                .await
                .unwrap()
                .as_deref(),
            Some("-u ci -p tok ghcr.io")
        );
        assert!(matches!(
            resolve_image_login(Some("exit 3")).await,
            Err(VastError::Subprocess { code: Some(3), .. })
        ));
    }
}
