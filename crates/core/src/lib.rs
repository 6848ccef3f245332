pub mod binary;
pub mod catalog;
pub mod command;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod logging;
pub mod mount;
pub mod output;
pub mod progress;
pub mod runner;
pub mod scanner;
pub mod secret;
pub mod service;
pub mod snapshot;

pub use catalog::{Repository, RepositoryCatalog};
pub use command::{BuiltCommand, CommandBuilder, ResticCommand};
pub use config::DeckConfig;
pub use coordinator::{CoordinatorHandle, RunId, StateEvent};
pub use error::{DeckError, Result};
pub use mount::{MountPoint, MountRegistry};
pub use output::OutputSink;
pub use runner::{CommandExecutor, ProcessRunner};
pub use secret::{MemorySecretStore, Secret, SecretStore};
pub use service::ResticService;
