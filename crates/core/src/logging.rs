use crate::Result;
use tracing_subscriber::EnvFilter;

/// Install the global tracing subscriber. `RUST_LOG` wins over `verbose`.
pub fn init_logging(verbose: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(verbose));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_writer(std::io::stderr)
        .init();

    Ok(())
}

/// Append logs to `log_file` without ANSI colours.
pub fn init_file_logging(log_file: &std::path::Path, verbose: bool) -> Result<()> {
    use std::fs::OpenOptions;

    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(log_file)?;

    tracing_subscriber::fmt()
        .with_env_filter(default_filter(verbose))
        .with_writer(std::sync::Mutex::new(file))
        .with_ansi(false)
        .init();

    Ok(())
}

fn default_filter(verbose: bool) -> EnvFilter {
    if verbose {
        EnvFilter::new("resticdeck=debug,resticdeck_core=debug")
    } else {
        EnvFilter::new("resticdeck=info,resticdeck_core=info")
    }
}
