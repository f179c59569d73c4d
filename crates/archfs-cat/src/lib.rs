// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! `archfs-cat`: copies files to standard output, looking through archives
//! on the way, e.g. `archfs-cat backup.tar.gz/etc/hosts`.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use archfs_kernel::{DriverRegistry, FsContext, FsManager, KernelConfig};
use archfs_logging::{CliLoggingArgs, LoggingConfig};
use clap::Parser;
use serde::{Deserialize, Serialize};

pub const COMPONENT: &str = "archfs-cat";

pub const EXIT_OK: u8 = 0;
pub const EXIT_FAILURE: u8 = 1;
pub const EXIT_USAGE: u8 = 2;

#[derive(Parser, Debug)]
#[command(
    name = "archfs-cat",
    version,
    about = "Print files to standard output, reading through nested archives"
)]
pub struct Cli {
    /// Files to print; archive members are addressed as `a.tar.gz/dir/file`
    #[arg(value_name = "PATH", required = true)]
    pub paths: Vec<String>,

    /// TOML configuration file with kernel and `[logging]` settings
    #[arg(long, env = "ARCHFS_CONFIG")]
    pub config: Option<PathBuf>,

    #[command(flatten)]
    pub logging: CliLoggingArgs,
}

/// Contents of the `--config` file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CatConfig {
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(flatten)]
    pub kernel: KernelConfig,
}

impl CatConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
        toml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
    }
}

/// Registry with every driver this binary ships.
pub fn drivers() -> Result<DriverRegistry> {
    let mut drivers = DriverRegistry::new();
    archfs_tar::register(&mut drivers)?;
    Ok(drivers)
}

/// Relative host paths are taken from the working directory; `scheme:` forms
/// are passed through.
fn absolute(path: &str) -> Result<String> {
    let has_scheme = matches!(path.split_once(':'), Some((head, _)) if !head.is_empty() && !head.contains('/'));
    if has_scheme || Path::new(path).is_absolute() {
        return Ok(path.to_string());
    }
    let cwd = std::env::current_dir().context("resolving the working directory")?;
    Ok(cwd.join(path).display().to_string())
}

/// Copies every path to `out`. Failing paths are reported to `err` and the
/// remaining ones are still printed.
pub fn cat(paths: &[String], config: KernelConfig, out: &mut dyn Write, err: &mut dyn Write) -> Result<bool> {
    let manager = FsManager::new(FsContext::new(config, drivers()?));
    let mut all_ok = true;

    for path in paths {
        let copied = absolute(path).and_then(|resolved| {
            let mut input = manager.open(&resolved)?;
            let bytes = io::copy(&mut input, out)?;
            tracing::debug!(path = %resolved, bytes, "copied");
            Ok(())
        });
        if let Err(error) = copied {
            all_ok = false;
            tracing::warn!(path = %path, error = %error, "cannot print");
            writeln!(err, "{}: {}: {:#}", COMPONENT, path, error)?;
        }
    }
    out.flush()?;
    manager.umount_all().context("unmounting archives")?;
    Ok(all_ok)
}

/// Runs the command line and returns the process exit code.
pub fn run<I, T>(args: I, out: &mut dyn Write, err: &mut dyn Write) -> u8
where
    I: IntoIterator<Item = T>,
    T: Into<OsString> + Clone,
{
    let cli = match Cli::try_parse_from(args) {
        Ok(cli) => cli,
        Err(error) if error.use_stderr() => {
            let _ = write!(err, "{}", error.render());
            return EXIT_USAGE;
        }
        Err(help) => {
            let _ = write!(out, "{}", help.render());
            return EXIT_OK;
        }
    };

    let config = match &cli.config {
        Some(path) => match CatConfig::load(path) {
            Ok(config) => config,
            Err(error) => {
                let _ = writeln!(err, "{}: {:#}", COMPONENT, error);
                return EXIT_USAGE;
            }
        },
        None => CatConfig::default(),
    };

    if let Err(error) = cli.logging.clone().with_config(&config.logging).init(COMPONENT) {
        // A subscriber may already be installed when embedded.
        tracing::debug!(error = %error, "logging not initialized");
    }

    match cat(&cli.paths, config.kernel, out, err) {
        Ok(true) => EXIT_OK,
        Ok(false) => EXIT_FAILURE,
        Err(error) => {
            tracing::error!(error = %error, "archfs-cat failed");
            let _ = writeln!(err, "{}: {:#}", COMPONENT, error);
            EXIT_FAILURE
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_file_combines_kernel_and_logging() {
        let config: CatConfig = toml::from_str(
            r#"
            [logging]
            level = "debug"

            [sync]
            wait_close_timeout_ms = 100
            "#,
        )
        .unwrap();
        assert_eq!(config.logging.level, Some(archfs_logging::CliLogLevel::Debug));
        assert_eq!(config.kernel.sync.wait_close_timeout_ms, 100);
        assert_eq!(config.kernel.keys, KernelConfig::default().keys);
    }

    #[test]
    fn scheme_paths_are_left_alone() {
        assert_eq!(absolute("tar:file:/tmp/a.tar!/x").unwrap(), "tar:file:/tmp/a.tar!/x");
        assert_eq!(absolute("/tmp/a.tar/x").unwrap(), "/tmp/a.tar/x");
        let relative = absolute("a.tar/x").unwrap();
        assert!(Path::new(&relative).is_absolute());
        assert!(relative.ends_with("a.tar/x"));
    }

    #[test]
    fn shipped_drivers_include_tar() {
        let drivers = drivers().unwrap();
        assert!(drivers.schemes().contains(&"tar.gz"));
    }
}
