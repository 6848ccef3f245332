use crate::secret::Secret;
use crate::{DeckError, Result};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Environment variable restic reads the repository password from.
pub const PASSWORD_ENV: &str = "RESTIC_PASSWORD";

/// A restic operation with everything needed to run it.
#[derive(Debug, Clone)]
pub enum ResticCommand {
    Version,
    Init {
        repository: String,
        password: Secret,
    },
    Backup {
        repository: String,
        paths: Vec<PathBuf>,
        password: Secret,
    },
    Snapshots {
        repository: String,
        password: Secret,
    },
    Mount {
        repository: String,
        mountpoint: PathBuf,
        snapshot: Option<String>,
        password: Secret,
    },
    Check {
        repository: String,
        password: Secret,
    },
}

impl ResticCommand {
    pub fn name(&self) -> &'static str {
        match self {
            ResticCommand::Version => "version",
            ResticCommand::Init { .. } => "init",
            ResticCommand::Backup { .. } => "backup",
            ResticCommand::Snapshots { .. } => "snapshots",
            ResticCommand::Mount { .. } => "mount",
            ResticCommand::Check { .. } => "check",
        }
    }

    pub fn repository(&self) -> Option<&str> {
        match self {
            ResticCommand::Version => None,
            ResticCommand::Init { repository, .. }
            | ResticCommand::Backup { repository, .. }
            | ResticCommand::Snapshots { repository, .. }
            | ResticCommand::Mount { repository, .. }
            | ResticCommand::Check { repository, .. } => Some(repository),
        }
    }

    fn password(&self) -> Option<&Secret> {
        match self {
            ResticCommand::Version => None,
            ResticCommand::Init { password, .. }
            | ResticCommand::Backup { password, .. }
            | ResticCommand::Snapshots { password, .. }
            | ResticCommand::Mount { password, .. }
            | ResticCommand::Check { password, .. } => Some(password),
        }
    }

    fn validate(&self) -> Result<()> {
        if let Some(repository) = self.repository() {
            if repository.trim().is_empty() {
                return Err(DeckError::InvalidConfiguration(
                    "repository location is empty".to_string(),
                ));
            }
        }

        match self {
            ResticCommand::Backup { paths, .. } if paths.is_empty() => Err(
                DeckError::InvalidConfiguration("no paths selected for backup".to_string()),
            ),
            ResticCommand::Mount { mountpoint, .. } if mountpoint.as_os_str().is_empty() => Err(
                DeckError::InvalidConfiguration("mount target is empty".to_string()),
            ),
            _ => Ok(()),
        }
    }

    fn args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(repository) = self.repository() {
            args.push("-r".to_string());
            args.push(repository.to_string());
        }

        match self {
            ResticCommand::Version => args.push("version".to_string()),
            ResticCommand::Init { .. } => args.push("init".to_string()),
            ResticCommand::Backup { paths, .. } => {
                args.push("backup".to_string());
                args.push("--json".to_string());
                args.extend(paths.iter().map(|p| p.to_string_lossy().into_owned()));
            }
            ResticCommand::Snapshots { .. } => {
                args.push("snapshots".to_string());
                args.push("--json".to_string());
            }
            // restic mounts the whole repository; a chosen snapshot is
            // browsed under <mountpoint>/ids/<id>
            ResticCommand::Mount { mountpoint, .. } => {
                args.push("mount".to_string());
                args.push(mountpoint.to_string_lossy().into_owned());
            }
            ResticCommand::Check { .. } => args.push("check".to_string()),
        }

        args
    }
}

/// A fully rendered invocation.
#[derive(Debug, Clone)]
pub struct BuiltCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    /// Non-secret environment additions.
    pub env: Vec<(String, String)>,
    pub secret: Option<Secret>,
    /// Safe to show and log.
    pub display: String,
}

impl BuiltCommand {
    /// An arbitrary invocation with no secret. Used for auxiliary tools
    /// such as `umount`.
    pub fn plain(program: impl Into<PathBuf>, args: Vec<String>) -> Self {
        let program = program.into();
        let display = render_display(&program, &args, None);
        Self {
            program,
            args,
            env: Vec::new(),
            secret: None,
            display,
        }
    }

    /// The environment slot carrying the credential, if any.
    pub fn credential(&self) -> Option<(&'static str, &str)> {
        self.secret.as_ref().map(|s| (PASSWORD_ENV, s.expose()))
    }
}

/// Turns [`ResticCommand`]s into [`BuiltCommand`]s for one restic binary.
#[derive(Debug, Clone)]
pub struct CommandBuilder {
    program: PathBuf,
    extra_env: Vec<(String, String)>,
}

impl CommandBuilder {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            extra_env: Vec::new(),
        }
    }

    pub fn with_env(mut self, env: impl IntoIterator<Item = (String, String)>) -> Self {
        self.extra_env.extend(env);
        self
    }

    pub fn build(&self, command: &ResticCommand) -> Result<BuiltCommand> {
        command.validate()?;

        let args = command.args();
        let secret = command.password().cloned();
        let shown = render_display(&self.program, &args, secret.as_ref());

        debug!("Built {} command: {}", command.name(), shown);

        Ok(BuiltCommand {
            program: self.program.clone(),
            args,
            env: self.extra_env.clone(),
            secret,
            display: shown,
        })
    }
}

/// Shell-like rendering of the invocation. Any word that would reveal
/// `secret` is shown as a placeholder as a whole.
fn render_display(program: &Path, args: &[String], secret: Option<&Secret>) -> String {
    let name = program
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| program.to_string_lossy().into_owned());

    let mut parts = Vec::with_capacity(args.len() + 2);
    if let Some(secret) = secret {
        parts.push(format!("{}={}", PASSWORD_ENV, secret.placeholder()));
    }
    parts.push(shell_quote(&name));
    parts.extend(args.iter().map(|a| shell_quote(a)));

    let Some(secret) = secret else {
        return parts.join(" ");
    };
    let placeholder = secret.placeholder();
    for part in parts.iter_mut() {
        if secret.appears_in(part) {
            *part = placeholder.to_string();
        }
    }

    let shown = parts.join(" ");
    // a secret spanning word boundaries
    if secret.appears_in(&shown) {
        return placeholder.to_string();
    }
    shown
}

fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./:=@%+,".contains(c));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', "'\\''"))
    }
}
