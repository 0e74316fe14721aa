use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter};
use std::path::{Path, PathBuf};

use directories::ProjectDirs;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::APP_NAME;

const MAX_LOG_SIZE: u64 = 1024 * 1024; // 1MB

/// Initialize logging for a component.
///
/// - `component_name`: Name of the component (e.g. "server"), used as the log file name
/// - `default_level`: Filter used when `RUST_LOG` is unset
/// - `to_file`: Also log to `<data dir>/logs/<component_name>.log`
///
/// Returns a guard that must be kept alive for the duration of the program.
pub fn init_logging(
    component_name: &str,
    default_level: &str,
    to_file: bool,
) -> io::Result<Option<WorkerGuard>> {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));

    if !to_file {
        tracing_subscriber::fmt().with_env_filter(env_filter).init();
        return Ok(None);
    }

    let log_path = prepare_log_file(&log_directory()?, component_name)?;
    let file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&log_path)?;
    let (non_blocking_file, guard) = tracing_appender::non_blocking(BufWriter::new(file));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(fmt::layer().with_writer(io::stdout).with_ansi(true))
        .with(
            fmt::layer()
                .with_writer(non_blocking_file)
                .with_ansi(false)
                .with_target(true),
        )
        .init();

    tracing::info!("Logging to file: {}", log_path.display());
    Ok(Some(guard))
}

/// Default filter for a `-d` count from the command line
pub fn level_for_verbosity(debug: u8) -> &'static str {
    match debug {
        0 => "info",
        1 => "debug",
        _ => "trace",
    }
}

fn log_directory() -> io::Result<PathBuf> {
    let dirs = ProjectDirs::from("", "", APP_NAME)
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "Failed to find home directory"))?;
    Ok(dirs.data_dir().join("logs"))
}

/// Create `dir` and return the log file path inside it, emptying the file
/// first if it grew past [`MAX_LOG_SIZE`]
fn prepare_log_file(dir: &Path, component_name: &str) -> io::Result<PathBuf> {
    fs::create_dir_all(dir)?;
    let log_path = dir.join(format!("{component_name}.log"));
    truncate_if_needed(&log_path)?;
    Ok(log_path)
}

fn truncate_if_needed(log_path: &Path) -> io::Result<()> {
    if log_path.exists() && fs::metadata(log_path)?.len() > MAX_LOG_SIZE {
        File::create(log_path)?.set_len(0)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_oversized_log_is_truncated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("server.log");
        fs::write(&path, vec![b'x'; MAX_LOG_SIZE as usize + 1]).unwrap();

        let prepared = prepare_log_file(dir.path(), "server").unwrap();
        assert_eq!(prepared, path);
        assert_eq!(fs::metadata(&path).unwrap().len(), 0);
    }

    #[test]
    fn test_small_log_is_kept() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        prepare_log_file(&logs, "server").unwrap();
        let path = logs.join("server.log");
        fs::write(&path, b"previous run").unwrap();

        prepare_log_file(&logs, "server").unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"previous run");
    }

    #[test]
    fn test_verbosity_levels() {
        assert_eq!(level_for_verbosity(0), "info");
        assert_eq!(level_for_verbosity(1), "debug");
        assert_eq!(level_for_verbosity(5), "trace");
    }
}
