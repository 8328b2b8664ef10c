// Logging setup
//
// env_logger on stderr, Info by default, overridable through RUST_LOG. When
// file logging is enabled the log file is recreated with a short header so
// each run starts clean.

use crate::config::Config;
use std::fs::OpenOptions;
use std::io::Write;
use std::path::Path;

/// Initialize logging with optional file output for validation errors
pub fn init_logging(config: &Config) {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    // A second init (tests, embedding) keeps the first logger.
    if builder.try_init().is_err() {
        log::debug!("Logger already initialized");
    }

    if config.debug.log_to_file {
        if let Err(e) = write_log_header(Path::new(&config.debug.log_file)) {
            log::warn!("Could not create log file {}: {}", config.debug.log_file, e);
        }
    }
}

/// Create or truncate `path` and write the run header.
pub fn write_log_header(path: &Path) -> std::io::Result<()> {
    let mut file = OpenOptions::new().create(true).write(true).truncate(true).open(path)?;
    writeln!(file, "=== RT Renderer Log ===")?;
    writeln!(file, "Started: {:?}", std::time::SystemTime::now())?;
    writeln!(file)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_truncates_previous_run() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("run.log");
        std::fs::write(&path, "stale line from an old run\n".repeat(100)).unwrap();

        write_log_header(&path).unwrap();

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("=== RT Renderer Log ==="));
        assert!(!contents.contains("stale"));
    }

    #[test]
    fn init_twice_is_harmless() {
        let config = Config::default();
        init_logging(&config);
        init_logging(&config);
    }
}
