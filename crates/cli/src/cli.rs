use clap::Parser;
use clap_verbosity_flag::{InfoLevel, Verbosity};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// procscan: watch the process table for instrumentable processes
///
/// procscan polls procfs and reports each process running a supported tracer
/// once it has been alive for the configured start delay, and again when it
/// exits. It is a diagnostic front end to the discovery engine; it attaches
/// nothing.
#[derive(Debug, Parser, Clone)]
#[command(about, long_about, version)]
pub struct Cli {
    /// Path to configuration file.
    ///
    /// If not provided, the default locations are checked. They are
    /// `/etc/dyninst/config.toml` and `/etc/dyninst/config.d/*.toml`,
    /// where the latter being a glob pattern. If they don't exist, the default
    /// configuration is used.
    #[arg(short, long, value_parser = validate_file)]
    pub config: Option<PathBuf>,

    /// Procfs mount to scan. Overrides `discovery.procfs_root`.
    #[arg(long, value_parser = validate_dir)]
    pub procfs_root: Option<PathBuf>,

    /// Milliseconds between scans. Overrides `discovery.scan_interval`.
    #[arg(short, long, value_parser = validate_interval)]
    pub interval: Option<Duration>,

    /// Run a single scan and exit.
    #[arg(long)]
    pub once: bool,

    #[command(flatten)]
    pub verbosity: Verbosity<InfoLevel>,
}

/// Check if the file exists.
#[inline(always)]
fn validate_file(file: &str) -> Result<PathBuf, String> {
    let path = Path::new(file);
    if path.is_file() {
        Ok(path.to_owned())
    } else {
        Err(format!("File not found: {:?}", path))
    }
}

#[inline(always)]
fn validate_dir(dir: &str) -> Result<PathBuf, String> {
    let path = Path::new(dir);
    if path.is_dir() {
        Ok(path.to_owned())
    } else {
        Err(format!("Directory not found: {:?}", path))
    }
}

/// Validate the scan interval
#[inline(always)]
fn validate_interval(millis: &str) -> Result<Duration, String> {
    let millis: u64 = millis
        .parse()
        .map_err(|_| format!("`{millis}` is not a valid number of milliseconds"))?;
    if millis == 0 {
        Err("Scan interval must be positive".to_string())
    } else {
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_paths() {
        let dir = tempdir().unwrap();
        let file = dir.path().join("config.toml");
        std::fs::write(&file, "").unwrap();
        let dir_str = dir.path().to_str().unwrap();
        let file_str = file.to_str().unwrap();

        assert_eq!(validate_file(file_str), Ok(file.clone()));
        assert!(validate_file(dir_str).is_err());
        assert_eq!(validate_dir(dir_str), Ok(dir.path().to_owned()));
        assert!(validate_dir(file_str).is_err());
    }

    fn interval_candidates() -> impl Strategy<Value = String> {
        prop_oneof![
            2 => (0u64..5_000).prop_map(|i| format!("{}", i)),
            1 => (-1000i64..0).prop_map(|i| format!("{}", i)),
            1 => ".*",
        ]
    }

    proptest! {
        #[test]
        fn test_validate_interval(millis in interval_candidates()) {
            let result = validate_interval(&millis);
            match result {
                Ok(interval) => prop_assert!(interval >= Duration::from_millis(1)),
                Err(err) => {
                    let error_msg = format!("`{}` is not a valid number of milliseconds", millis);
                    prop_assert!(err == error_msg || err == "Scan interval must be positive");
                },
            }
        }
    }
}
