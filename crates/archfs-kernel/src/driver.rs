// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Archive driver boundary and driver registry

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::address::{NodeName, Scheme};
use crate::config::FsContext;
use crate::controller::{self, Controller, TargetArchiveController};
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::pool::IoBufferPool;
use crate::scanner::ArchiveDetector;
use crate::types::{Entry, InputStream, OutputStream};

/// Format peculiarities the output multiplexer has to honor.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DriverQuirks {
    /// Entry that must be written before any other, e.g. `mimetype` in ODF.
    pub privileged_entry: Option<&'static str>,
    /// Entry headers carry the size, so it must be known before streaming.
    pub requires_size: bool,
    /// The format cannot be written; every change fails with
    /// [`FsError::ReadOnlyFileSystem`].
    pub read_only: bool,
}

/// Read side of a mounted archive.
pub trait InputArchive: Send {
    /// Every entry of the archive, in archive order.
    fn entries(&self) -> Vec<Entry>;

    fn open(&mut self, name: &NodeName) -> FsResult<InputStream>;

    fn close(&mut self) -> FsResult<()>;
}

/// Write side of an archive: one entry at a time, in order.
pub trait OutputService: Send {
    fn begin(&mut self, entry: &Entry) -> FsResult<()>;

    fn write(&mut self, buf: &[u8]) -> FsResult<()>;

    fn end(&mut self) -> FsResult<()>;

    /// Writes trailing metadata and closes the sink.
    fn finish(self: Box<Self>) -> FsResult<()>;
}

/// Adapter between an archive format and the kernel.
pub trait ArchiveDriver: Send + Sync + fmt::Debug {
    fn quirks(&self) -> DriverQuirks {
        DriverQuirks::default()
    }

    fn new_input(
        &self,
        model: &FsModel,
        source: InputStream,
        pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn InputArchive>>;

    /// Read-only formats keep the default.
    fn new_output(
        &self,
        model: &FsModel,
        _sink: Box<dyn OutputStream>,
        _pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn OutputService>> {
        Err(FsError::ReadOnlyFileSystem(model.mount_point().to_string()))
    }

    /// Wraps the archive target in the controller chain for one mount point.
    fn new_controller(
        &self,
        target: TargetArchiveController,
        lock_model: Arc<LockModel>,
        context: &FsContext,
    ) -> Arc<dyn Controller> {
        controller::decorate(target, lock_model, context)
    }
}

/// Maps archive extensions to drivers. Each extension is its own scheme.
#[derive(Clone, Default)]
pub struct DriverRegistry {
    drivers: HashMap<String, Arc<dyn ArchiveDriver>>,
}

impl DriverRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `driver` for a `|` separated list of extensions, e.g. `"tar.gz|tgz"`.
    pub fn register(&mut self, extensions: &str, driver: Arc<dyn ArchiveDriver>) -> FsResult<()> {
        for extension in extensions.split('|').map(str::trim).filter(|e| !e.is_empty()) {
            let scheme = Scheme::new(extension)?;
            tracing::debug!(scheme = %scheme, driver = ?driver, "registering archive driver");
            self.drivers.insert(scheme.as_str().to_string(), Arc::clone(&driver));
        }
        Ok(())
    }

    pub fn with(mut self, extensions: &str, driver: Arc<dyn ArchiveDriver>) -> FsResult<Self> {
        self.register(extensions, driver)?;
        Ok(self)
    }

    pub fn driver(&self, scheme: &Scheme) -> FsResult<Arc<dyn ArchiveDriver>> {
        self.drivers
            .get(scheme.as_str())
            .cloned()
            .ok_or_else(|| FsError::UnknownScheme(scheme.to_string()))
    }

    pub fn schemes(&self) -> Vec<&str> {
        let mut schemes: Vec<&str> = self.drivers.keys().map(String::as_str).collect();
        schemes.sort_unstable();
        schemes
    }
}

impl ArchiveDetector for DriverRegistry {
    fn detect(&self, name: &str) -> Option<Scheme> {
        let lower = name.to_ascii_lowercase();
        self.drivers
            .keys()
            .filter(|extension| {
                lower.len() > extension.len() + 1
                    && lower.ends_with(extension.as_str())
                    && lower.as_bytes()[lower.len() - extension.len() - 1] == b'.'
            })
            .max_by_key(|extension| extension.len())
            .and_then(|extension| Scheme::new(extension).ok())
    }
}

impl fmt::Debug for DriverRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DriverRegistry").field("schemes", &self.schemes()).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::RecordDriver;

    fn registry() -> DriverRegistry {
        let driver: Arc<dyn ArchiveDriver> = Arc::new(RecordDriver::new());
        DriverRegistry::new()
            .with("zip|jar", Arc::clone(&driver))
            .unwrap()
            .with("tar|tar.gz|tgz", driver)
            .unwrap()
    }

    #[test]
    fn longest_extension_wins() {
        let registry = registry();
        assert_eq!(registry.detect("backup.tar.gz").unwrap().as_str(), "tar.gz");
        assert_eq!(registry.detect("backup.tar").unwrap().as_str(), "tar");
        assert_eq!(registry.detect("Lib.JAR").unwrap().as_str(), "jar");
    }

    #[test]
    fn stem_must_not_be_empty() {
        let registry = registry();
        assert!(registry.detect(".zip").is_none());
        assert!(registry.detect("zip").is_none());
        assert!(registry.detect("notes.txt").is_none());
        assert!(registry.detect("archivezip").is_none());
    }

    #[test]
    fn unknown_scheme_is_reported() {
        let registry = registry();
        let scheme = Scheme::new("rar").unwrap();
        assert!(matches!(registry.driver(&scheme), Err(FsError::UnknownScheme(s)) if s == "rar"));
        assert_eq!(registry.schemes(), vec!["jar", "tar", "tar.gz", "tgz", "zip"]);
    }
}
