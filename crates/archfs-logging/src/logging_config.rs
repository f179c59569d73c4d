// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{CliLogLevel, LogFormat};

/// `[logging]` section of a configuration file.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "kebab-case", deny_unknown_fields)]
pub struct LoggingConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<CliLogLevel>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format: Option<LogFormat>,
    /// Log to `<dir>/<component>.log` instead of stderr.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub dir: Option<PathBuf>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_a_logging_section() {
        let config: LoggingConfig = toml::from_str(
            r#"
            level = "debug"
            format = "json"
            dir = "/var/log/archfs"
            "#,
        )
        .unwrap();
        assert_eq!(config.level, Some(CliLogLevel::Debug));
        assert_eq!(config.format, Some(LogFormat::Json));
        assert_eq!(config.dir, Some(PathBuf::from("/var/log/archfs")));
    }

    #[test]
    fn empty_section_keeps_defaults() {
        let config: LoggingConfig = toml::from_str("").unwrap();
        assert_eq!(config, LoggingConfig::default());
    }

    #[test]
    fn unknown_keys_are_rejected() {
        assert!(toml::from_str::<LoggingConfig>("colour = true").is_err());
    }
}
