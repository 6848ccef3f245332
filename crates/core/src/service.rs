use crate::binary::locate_restic;
use crate::catalog::{Repository, RepositoryCatalog};
use crate::command::{BuiltCommand, CommandBuilder, ResticCommand};
use crate::config::DeckConfig;
use crate::coordinator::{Coordinator, CoordinatorHandle, RunId, StateEvent};
use crate::mount::MountPoint;
use crate::output::OutputSink;
use crate::progress::BackupMessage;
use crate::runner::{CommandExecutor, OutputListener, ProcessRunner, RunOutput};
use crate::scanner::{RepositoryScanner, ScanResult};
use crate::secret::{Secret, SecretStore};
use crate::snapshot::{parse_snapshots, parse_version, ResticVersion, SnapshotSummary};
use crate::{DeckError, Result};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Result of a finished backup.
#[derive(Debug, Clone)]
pub struct BackupReport {
    pub run: RunId,
    pub snapshot_id: Option<String>,
    pub files_new: u64,
    pub files_changed: u64,
    pub data_added: u64,
    /// Items restic could not read. The backup still succeeded.
    pub errors: Vec<String>,
}

/// A mount whose restic process is serving in the background.
pub struct ActiveMount {
    pub mount: MountPoint,
    /// Resolves when the mount process exits.
    pub task: JoinHandle<Result<RunOutput>>,
}

/// Front door for everything a front-end does with restic.
///
/// Each call resolves secrets, builds the command, runs it through the
/// coordinator-backed sink and turns failures into a visible error on that
/// run before returning them.
pub struct ResticService {
    builder: CommandBuilder,
    executor: Arc<dyn CommandExecutor>,
    secrets: Arc<dyn SecretStore>,
    catalog: RepositoryCatalog,
    coordinator: CoordinatorHandle,
    scan_depth: usize,
}

impl ResticService {
    /// Build a service from config, locating restic and starting the
    /// coordinator and mount refresher. Must be called inside a tokio runtime.
    pub fn from_config(config: &DeckConfig, secrets: Arc<dyn SecretStore>) -> Result<Self> {
        config.validate()?;
        let program = locate_restic(config.restic.binary.as_deref())?;
        let builder = CommandBuilder::new(program).with_env(config.restic.extra_env.clone());
        let catalog = RepositoryCatalog::new(config.catalog_path()?);

        let service = Self::new(
            builder,
            Arc::new(ProcessRunner::new()),
            secrets,
            catalog,
            config.output.max_lines,
        )
        .with_scan_depth(config.scan.max_depth);
        service.coordinator.spawn_mount_refresh(config.refresh_interval());
        Ok(service)
    }

    pub fn new(
        builder: CommandBuilder,
        executor: Arc<dyn CommandExecutor>,
        secrets: Arc<dyn SecretStore>,
        catalog: RepositoryCatalog,
        max_lines: usize,
    ) -> Self {
        Self {
            builder,
            executor,
            secrets,
            catalog,
            coordinator: Coordinator::spawn(max_lines),
            scan_depth: 3,
        }
    }

    pub fn with_scan_depth(mut self, depth: usize) -> Self {
        self.scan_depth = depth;
        self
    }

    pub fn subscribe(&self) -> broadcast::Receiver<StateEvent> {
        self.coordinator.subscribe()
    }

    pub fn coordinator(&self) -> &CoordinatorHandle {
        &self.coordinator
    }

    pub async fn sink(&self, run: RunId) -> Result<Option<OutputSink>> {
        self.coordinator.sink(run).await
    }

    pub async fn cancel(&self, run: RunId) -> Result<bool> {
        self.coordinator.cancel_run(run).await
    }

    /// Record a failure that happened before any process was started.
    fn fail_early(&self, label: &str, err: DeckError) -> DeckError {
        let run = Uuid::new_v4();
        error!("{} failed: {}", label, err);
        if self.coordinator.start_run(run, label, label).is_ok() {
            let _ = self.coordinator.complete_run(run, Some(err.user_message()));
        }
        err
    }

    fn password_for(&self, label: &str, repository: &str) -> Result<Secret> {
        self.secrets
            .require(repository)
            .map_err(|e| self.fail_early(label, e))
    }

    fn build(&self, command: &ResticCommand) -> Result<BuiltCommand> {
        self.builder
            .build(command)
            .map_err(|e| self.fail_early(command.name(), e))
    }

    /// Start a run and wait for its process. The run stays open until
    /// [`ResticService::conclude`].
    async fn launch(&self, command: &ResticCommand) -> Result<(RunId, Result<RunOutput>)> {
        let built = self.build(command)?;
        let run = Uuid::new_v4();
        let cancel = self.coordinator.start_run(run, command.name(), &built.display)?;

        let reporter: Arc<dyn OutputListener> = Arc::new(self.coordinator.reporter(run));
        let result = self.executor.execute(&built, reporter, cancel).await;
        Ok((run, result))
    }

    /// Finish a run with the outcome of the whole operation.
    fn conclude<T>(&self, run: RunId, label: &str, result: Result<T>) -> Result<(RunId, T)> {
        finish(&self.coordinator, run, label, &result)?;
        result.map(|value| (run, value))
    }

    /// Run a command to completion, recording its outcome on its sink.
    pub async fn run(&self, command: &ResticCommand) -> Result<(RunId, RunOutput)> {
        self.run_with(command, Ok).await
    }

    /// Run a command and turn its output into `T` before the run is marked
    /// finished, so a bad output fails the run.
    pub async fn run_with<T>(
        &self,
        command: &ResticCommand,
        interpret: impl FnOnce(RunOutput) -> Result<T>,
    ) -> Result<(RunId, T)> {
        let (run, result) = self.launch(command).await?;
        self.conclude(run, command.name(), result.and_then(interpret))
    }

    pub async fn version(&self) -> Result<ResticVersion> {
        let (_, version) = self
            .run_with(&ResticCommand::Version, |output| parse_version(&output.stdout))
            .await?;
        Ok(version)
    }

    /// Create a repository, remember its password and add it to the catalog.
    pub async fn init_repository(
        &self,
        path: &str,
        name: &str,
        password: Secret,
    ) -> Result<Repository> {
        let command = ResticCommand::Init {
            repository: path.to_string(),
            password: password.clone(),
        };
        let (run, result) = self.launch(&command).await?;
        let result = match result {
            Ok(_) => self.remember(path, name, password).await,
            Err(e) => Err(e),
        };
        let (_, repository) = self.conclude(run, command.name(), result)?;

        info!("Initialized repository {} at {}", name, path);
        Ok(repository)
    }

    async fn remember(&self, path: &str, name: &str, password: Secret) -> Result<Repository> {
        let repository = Repository::new(path, name);
        self.catalog.upsert(repository.clone()).await?;
        self.secrets.put(path, password)?;
        Ok(repository)
    }

    pub async fn backup(&self, repository: &str, paths: Vec<PathBuf>) -> Result<BackupReport> {
        let password = self.password_for("backup", repository)?;
        let command = ResticCommand::Backup {
            repository: repository.to_string(),
            paths,
            password,
        };
        let (run, mut report) = self
            .run_with(&command, |output| Ok(summarize_backup(&output.stdout)))
            .await?;
        report.run = run;

        info!(
            "Backup of {} finished, snapshot {}",
            repository,
            report.snapshot_id.as_deref().unwrap_or("unknown")
        );
        Ok(report)
    }

    pub async fn snapshots(&self, repository: &str) -> Result<Vec<SnapshotSummary>> {
        let password = self.password_for("snapshots", repository)?;
        let command = ResticCommand::Snapshots {
            repository: repository.to_string(),
            password,
        };
        let (_, snapshots) = self
            .run_with(&command, |output| parse_snapshots(&output.stdout))
            .await?;
        Ok(snapshots)
    }

    pub async fn check(&self, repository: &str) -> Result<RunId> {
        let password = self.password_for("check", repository)?;
        let (run, _) = self
            .run(&ResticCommand::Check {
                repository: repository.to_string(),
                password,
            })
            .await?;
        Ok(run)
    }

    /// Mount `repository` at `target` in the background.
    ///
    /// The path is reserved before restic starts, so a second mount at the
    /// same place fails with `MountConflict`. The entry goes away when the
    /// process exits, whatever the reason.
    pub async fn mount(
        &self,
        repository: &str,
        target: &Path,
        snapshot: Option<String>,
    ) -> Result<ActiveMount> {
        let password = self.password_for("mount", repository)?;
        let command = ResticCommand::Mount {
            repository: repository.to_string(),
            mountpoint: target.to_path_buf(),
            snapshot: snapshot.clone(),
            password,
        };
        let built = self.build(&command)?;

        let run = Uuid::new_v4();
        let mount = MountPoint::new(target, repository, snapshot, run);
        if let Err(e) = self.coordinator.mount(mount.clone()).await {
            return Err(self.fail_early("mount", e));
        }

        let cancel = self.coordinator.start_run(run, command.name(), &built.display)?;
        let reporter: Arc<dyn OutputListener> = Arc::new(self.coordinator.reporter(run));
        let executor = self.executor.clone();
        let coordinator = self.coordinator.clone();

        let task = tokio::spawn(async move {
            let result = executor.execute(&built, reporter, cancel).await;
            if let Err(e) = coordinator.run_exited(run) {
                warn!("Could not release mount for run {}: {}", run, e);
            }
            finish(&coordinator, run, "mount", &result)?;
            result
        });

        info!("Mounting {} at {}", repository, target.display());
        Ok(ActiveMount { mount, task })
    }

    /// Stop the mount at `target`: release the registry entry, stop the
    /// serving process and ask the OS to unmount the path.
    pub async fn unmount(&self, target: &Path) -> Result<MountPoint> {
        let mount = self
            .coordinator
            .unmount(target.to_path_buf())
            .await
            .map_err(|e| self.fail_early("unmount", e))?;

        if !self.coordinator.cancel_run(mount.run).await? {
            debug!("Mount process for {} had already exited", target.display());
        }

        let command = platform_unmount(target);
        let reporter: Arc<dyn OutputListener> = Arc::new(self.coordinator.reporter(mount.run));
        if let Err(e) = self
            .executor
            .execute(&command, reporter, tokio_util::sync::CancellationToken::new())
            .await
        {
            // restic usually unmounts on its own when stopped
            warn!("{} failed: {}", command.display, e);
        }

        info!("Unmounted {}", target.display());
        Ok(mount)
    }

    pub async fn mounts(&self) -> Result<Vec<MountPoint>> {
        self.coordinator.mounts().await
    }

    /// Find repositories under `root`. Valid ones with a stored password
    /// also get their snapshot listing.
    pub async fn scan(&self, root: &Path) -> Result<Vec<ScanResult>> {
        let scanner = RepositoryScanner::new(self.scan_depth);
        let owned_root = root.to_path_buf();
        let mut results = tokio::task::spawn_blocking(move || scanner.scan(&owned_root))
            .await
            .map_err(|e| DeckError::SpawnFailure(format!("scan task failed: {}", e)))
            .and_then(|scanned| scanned)
            .map_err(|e| self.fail_early("scan", e))?;

        for result in results.iter_mut().filter(|r| r.valid) {
            let location = result.path.to_string_lossy().into_owned();
            let stored = self
                .secrets
                .get(&location)
                .map_err(|e| self.fail_early("scan", e))?;
            if stored.is_none() {
                continue;
            }
            match self.snapshots(&location).await {
                Ok(snapshots) => result.snapshots = snapshots,
                Err(e) => warn!("Could not list snapshots for {}: {}", location, e),
            }
        }

        Ok(results)
    }

    pub async fn repositories(&self) -> Result<Vec<Repository>> {
        self.catalog.load().await
    }

    /// Add an existing repository, optionally remembering its password.
    pub async fn add_repository(
        &self,
        repository: Repository,
        password: Option<Secret>,
    ) -> Result<Vec<Repository>> {
        if let Some(password) = password {
            self.secrets.put(&repository.path, password)?;
        }
        self.catalog.upsert(repository).await
    }

    /// Forget a repository and its password. The repository itself is untouched.
    pub async fn remove_repository(&self, path: &str) -> Result<bool> {
        self.secrets.delete(path)?;
        self.catalog.remove(path).await
    }
}

fn summarize_backup(stdout: &str) -> BackupReport {
    let mut report = BackupReport {
        run: Uuid::nil(),
        snapshot_id: None,
        files_new: 0,
        files_changed: 0,
        data_added: 0,
        errors: Vec::new(),
    };

    for line in stdout.lines() {
        match BackupMessage::parse(line) {
            Some(BackupMessage::Summary {
                files_new,
                files_changed,
                data_added,
                snapshot_id,
                ..
            }) => {
                report.snapshot_id = snapshot_id;
                report.files_new = files_new;
                report.files_changed = files_changed;
                report.data_added = data_added;
            }
            Some(BackupMessage::Error {
                error,
                during,
                item,
            }) => {
                let message = error.map(|e| e.message).unwrap_or_default();
                let entry = match (item, during) {
                    (Some(item), _) => format!("{}: {}", item, message),
                    (None, Some(during)) => format!("{} ({})", message, during),
                    (None, None) => message,
                };
                warn!("restic reported: {}", entry);
                report.errors.push(entry);
            }
            _ => {}
        }
    }

    report
}

/// Mark the run finished. Failures get a user-facing message on the sink.
fn finish<T>(
    coordinator: &CoordinatorHandle,
    run: RunId,
    label: &str,
    result: &Result<T>,
) -> Result<()> {
    match result {
        Ok(_) => {
            info!("{} finished", label);
            coordinator.complete_run(run, None)
        }
        Err(e) => {
            error!("{} failed: {}", label, e);
            coordinator.complete_run(run, Some(e.user_message()))
        }
    }
}

fn platform_unmount(target: &Path) -> BuiltCommand {
    let target = target.to_string_lossy().into_owned();
    if cfg!(target_os = "linux") {
        BuiltCommand::plain("fusermount", vec!["-u".to_string(), target])
    } else {
        BuiltCommand::plain("umount", vec![target])
    }
}
