use crate::Result;
use std::fs;
use std::path::Path;
use std::sync::Mutex;
use tracing_subscriber::EnvFilter;

/// Filter used when `RUST_LOG` is unset
fn default_filter(level: &str) -> EnvFilter {
    EnvFilter::new(format!("warn,proxy_sieve={}", level))
}

/// Initialize structured logging.
///
/// `RUST_LOG` takes precedence over `level`. Output goes to stderr, or is
/// appended to `log_file` without ANSI colors when one is given.
pub fn init_logging(level: &str, log_file: Option<&Path>) -> Result<()> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| default_filter(level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_target(false);

    match log_file {
        Some(path) => {
            if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
                fs::create_dir_all(parent)?;
            }
            let file = fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)?;

            builder
                .with_writer(Mutex::new(file))
                .with_ansi(false)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
            tracing::info!("logging to {}", path.display());
        }
        None => {
            builder
                .with_writer(std::io::stderr)
                .try_init()
                .map_err(|e| anyhow::anyhow!("failed to initialize logging: {}", e))?;
        }
    }

    Ok(())
}
