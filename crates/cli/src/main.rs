use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use dialoguer::Password;
use resticdeck_core::{
    catalog::Repository,
    logging::{init_file_logging, init_logging},
    output::LineKind,
    DeckConfig, MemorySecretStore, RepositoryCatalog, ResticService, Secret, SecretStore,
    StateEvent,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "resticdeck")]
#[command(about = "Manage restic repositories, backups and mounts")]
#[command(version, author)]
struct Cli {
    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
    /// Config file (defaults to the per-user config directory)
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Read the repository password from this file
    #[arg(long, global = true)]
    password_file: Option<PathBuf>,
    /// Append logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Show the installed restic version
    Version,
    /// Create a new repository and add it to the catalog
    Init {
        /// Repository location
        repository: String,
        /// Name shown in the catalog
        #[arg(long)]
        name: Option<String>,
    },
    /// Back up paths into a repository
    Backup {
        /// Repository location
        repository: String,
        /// Paths to back up
        #[arg(required = true)]
        paths: Vec<PathBuf>,
    },
    /// List snapshots in a repository
    Snapshots {
        /// Repository location
        repository: String,
        /// Print raw JSON
        #[arg(long)]
        json: bool,
    },
    /// Verify repository integrity
    Check {
        /// Repository location
        repository: String,
    },
    /// Mount a repository until interrupted
    Mount {
        /// Repository location
        repository: String,
        /// Directory to mount at
        mountpoint: PathBuf,
        /// Snapshot to open once mounted
        #[arg(long)]
        snapshot: Option<String>,
    },
    /// Find repositories under a directory
    Scan {
        /// Directory to search
        root: PathBuf,
    },
    /// Repository catalog operations
    Repos {
        #[command(subcommand)]
        command: ReposCommands,
    },
}

#[derive(Subcommand)]
enum ReposCommands {
    /// List known repositories
    List,
    /// Add an existing repository
    Add {
        /// Repository location
        path: String,
        /// Name shown in the catalog
        #[arg(long)]
        name: Option<String>,
    },
    /// Forget a repository (its data is left alone)
    Remove {
        /// Repository location
        path: String,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let logging = match cli.log_file {
        Some(ref file) => init_file_logging(file, cli.verbose),
        None => init_logging(cli.verbose),
    };
    if let Err(e) = logging {
        eprintln!("Failed to initialize logging: {}", e);
    }

    if let Err(e) = run(cli).await {
        error!("{:#}", e);
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> anyhow::Result<()> {
    let config = match cli.config {
        Some(ref path) => DeckConfig::load_from(path)?,
        None => DeckConfig::load()?,
    };
    let password_file = cli.password_file.as_deref();

    match cli.command {
        Commands::Repos { command } => handle_repos_command(command, &config).await,
        Commands::Version => {
            let service = ResticService::from_config(&config, Arc::new(MemorySecretStore::new()))?;
            let version = service.version().await?;
            println!("restic {}", version.version);
            if let Some(go) = version.go_version {
                println!("Go:       {}", go);
            }
            if let Some(platform) = version.platform {
                println!("Platform: {}", platform);
            }
            Ok(())
        }
        Commands::Init { repository, name } => {
            let service = ResticService::from_config(&config, Arc::new(MemorySecretStore::new()))?;
            let password = match password_file {
                Some(file) => read_password_file(file)?,
                None => prompt_new_password()?,
            };
            let name = name.unwrap_or_else(|| Repository::from_path(repository.as_str()).name);
            let repo = service.init_repository(&repository, &name, password).await?;

            println!("Repository created!");
            println!("===================");
            println!("Name:     {}", repo.name);
            println!("Location: {}", repo.path);
            Ok(())
        }
        Commands::Backup { repository, paths } => {
            let service = service_for(&config, &repository, password_file)?;
            let printer = spawn_printer(service.subscribe(), cli.verbose);

            info!("Starting backup of {} path(s) into {}", paths.len(), repository);
            let report = service.backup(&repository, paths).await;
            printer.abort();
            eprintln!();
            let report = report?;

            println!("Backup completed successfully!");
            println!("==============================");
            println!("Snapshot:      {}", report.snapshot_id.as_deref().unwrap_or("unknown"));
            println!("New files:     {}", report.files_new);
            println!("Changed files: {}", report.files_changed);
            println!("Data added:    {} bytes", report.data_added);
            if !report.errors.is_empty() {
                println!("Skipped items: {}", report.errors.len());
                for entry in &report.errors {
                    println!("  - {}", entry);
                }
            }
            Ok(())
        }
        Commands::Snapshots { repository, json } => {
            let service = service_for(&config, &repository, password_file)?;
            let snapshots = service.snapshots(&repository).await?;

            if json {
                println!("{}", serde_json::to_string_pretty(&snapshots)?);
                return Ok(());
            }
            if snapshots.is_empty() {
                println!("No snapshots in {}", repository);
                return Ok(());
            }

            println!("{:<10} {:<20} {:<20} {}", "ID", "Time", "Host", "Paths");
            println!("{}", "-".repeat(80));
            for snapshot in &snapshots {
                println!(
                    "{:<10} {:<20} {:<20} {}",
                    snapshot.display_id(),
                    snapshot.time.format("%Y-%m-%d %H:%M:%S"),
                    snapshot.hostname,
                    snapshot.paths.join(", ")
                );
            }
            println!("{} snapshot(s)", snapshots.len());
            Ok(())
        }
        Commands::Check { repository } => {
            let service = service_for(&config, &repository, password_file)?;
            let printer = spawn_printer(service.subscribe(), true);
            let result = service.check(&repository).await;
            printer.abort();
            result?;
            println!("No errors were found in {}", repository);
            Ok(())
        }
        Commands::Mount {
            repository,
            mountpoint,
            snapshot,
        } => {
            let service = service_for(&config, &repository, password_file)?;
            handle_mount(&service, &repository, &mountpoint, snapshot).await
        }
        Commands::Scan { root } => {
            let secrets = Arc::new(MemorySecretStore::new());
            let service = ResticService::from_config(&config, secrets.clone())?;
            let mut results = service.scan(&root).await?;

            if results.is_empty() {
                println!("No repositories found under {}", root.display());
                return Ok(());
            }

            // one password for every repository found, if the user gave one
            if let Some(password) = known_password(password_file)? {
                for result in results.iter_mut().filter(|r| r.valid) {
                    let location = result.path.to_string_lossy().into_owned();
                    secrets.put(&location, password.clone())?;
                    match service.snapshots(&location).await {
                        Ok(snapshots) => result.snapshots = snapshots,
                        Err(e) => warn!("Could not list snapshots for {}: {}", location, e),
                    }
                }
            }

            println!("{:<60} {:<12} {}", "Location", "Status", "Snapshots");
            println!("{}", "-".repeat(84));
            for result in &results {
                let status = if result.valid { "ok" } else { "incomplete" };
                let snapshots = match result.snapshots.len() {
                    0 => "-".to_string(),
                    n => n.to_string(),
                };
                println!("{:<60} {:<12} {}", result.path.display(), status, snapshots);
            }
            Ok(())
        }
    }
}

async fn handle_repos_command(command: ReposCommands, config: &DeckConfig) -> anyhow::Result<()> {
    let catalog = RepositoryCatalog::new(config.catalog_path()?);

    match command {
        ReposCommands::List => {
            let repositories = catalog.load().await?;
            if repositories.is_empty() {
                println!("No repositories in {}", catalog.file().display());
                return Ok(());
            }

            println!("{:<24} {:<14} {}", "Name", "Provider", "Location");
            println!("{}", "-".repeat(80));
            for repo in &repositories {
                let provider = repo
                    .cloud_provider
                    .map(|p| p.to_string())
                    .unwrap_or_else(|| "local".to_string());
                println!("{:<24} {:<14} {}", repo.name, provider, repo.path);
            }
        }
        ReposCommands::Add { path, name } => {
            let repository = match name {
                Some(name) => Repository::new(path, name),
                None => Repository::from_path(path),
            };
            info!("Adding {} to the catalog", repository.path);
            let repositories = catalog.upsert(repository).await?;
            println!("{} repositories in catalog", repositories.len());
        }
        ReposCommands::Remove { path } => {
            if !catalog.remove(&path).await? {
                bail!("{} is not in the catalog", path);
            }
            println!("Removed {}", path);
        }
    }

    Ok(())
}

async fn handle_mount(
    service: &ResticService,
    repository: &str,
    mountpoint: &Path,
    snapshot: Option<String>,
) -> anyhow::Result<()> {
    std::fs::create_dir_all(mountpoint)
        .with_context(|| format!("creating mountpoint {}", mountpoint.display()))?;

    let mut active = service.mount(repository, mountpoint, snapshot).await?;
    println!("Mounted {} at {}", repository, mountpoint.display());
    if active.mount.snapshot.is_some() {
        println!("Snapshot: {}", active.mount.browse_path().display());
    }
    println!("Press Ctrl-C to unmount");

    tokio::select! {
        signal = tokio::signal::ctrl_c() => {
            signal?;
            info!("Interrupted, unmounting {}", mountpoint.display());
            service.unmount(mountpoint).await?;
            let _ = active.task.await;
        }
        exited = &mut active.task => {
            exited.context("mount task panicked")??;
            println!("Mount process exited");
        }
    }

    Ok(())
}

/// Service with the password for `repository` loaded into memory.
fn service_for(
    config: &DeckConfig,
    repository: &str,
    password_file: Option<&Path>,
) -> anyhow::Result<ResticService> {
    let password = resolve_password(repository, password_file)?;
    let secrets = MemorySecretStore::with_secret(repository, password);
    Ok(ResticService::from_config(config, Arc::new(secrets))?)
}

/// Password from `--password-file` or `RESTIC_PASSWORD`, without prompting.
fn known_password(password_file: Option<&Path>) -> anyhow::Result<Option<Secret>> {
    if let Some(file) = password_file {
        return read_password_file(file).map(Some);
    }
    Ok(std::env::var("RESTIC_PASSWORD").ok().map(Secret::new))
}

fn resolve_password(repository: &str, password_file: Option<&Path>) -> anyhow::Result<Secret> {
    if let Some(password) = known_password(password_file)? {
        return Ok(password);
    }

    let value = Password::new()
        .with_prompt(format!("Password for {}", repository))
        .interact()?;
    Ok(Secret::new(value))
}

fn prompt_new_password() -> anyhow::Result<Secret> {
    if let Ok(value) = std::env::var("RESTIC_PASSWORD") {
        return Ok(Secret::new(value));
    }

    let value = Password::new()
        .with_prompt("New repository password")
        .with_confirmation("Confirm password", "Passwords do not match")
        .interact()?;
    if value.is_empty() {
        bail!("An empty password is not allowed");
    }
    Ok(Secret::new(value))
}

fn read_password_file(file: &Path) -> anyhow::Result<Secret> {
    let content = std::fs::read_to_string(file)
        .with_context(|| format!("reading password file {}", file.display()))?;
    let password = content.lines().next().unwrap_or_default().to_string();
    if password.is_empty() {
        bail!("Password file {} is empty", file.display());
    }
    Ok(Secret::new(password))
}

/// Print progress and restic's stderr while a command runs.
fn spawn_printer(
    mut events: broadcast::Receiver<StateEvent>,
    verbose: bool,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(StateEvent::Progress { fraction, .. }) => {
                    eprint!("\r{:5.1}%", fraction * 100.0);
                }
                Ok(StateEvent::Output { line, .. }) => {
                    if line.kind == LineKind::Error || verbose {
                        eprintln!("{}", line.text);
                    }
                }
                Ok(_) => {}
                Err(broadcast::error::RecvError::Lagged(_)) => continue,
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_password_file_is_used_without_prompting() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("password");
        std::fs::write(&file, "hunter2\nignored\n").unwrap();

        let password = known_password(Some(&file)).unwrap().unwrap();
        assert_eq!(password.expose(), "hunter2");
    }

    #[test]
    fn test_empty_password_file_is_rejected() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("password");
        std::fs::write(&file, "\n").unwrap();

        assert!(known_password(Some(&file)).is_err());
    }
}
