// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Turns user paths into node paths with nested archive mount points

use std::sync::Arc;

use crate::address::{AddressError, MountPoint, NodeName, NodePath, Scheme};
use crate::error::FsResult;

/// Recognizes archive files by name.
pub trait ArchiveDetector {
    /// Scheme of the archive named `name`, if it is one.
    fn detect(&self, name: &str) -> Option<Scheme>;
}

pub struct PathScanner<'a> {
    detector: &'a dyn ArchiveDetector,
    base: Option<Arc<MountPoint>>,
}

impl<'a> PathScanner<'a> {
    pub fn new(detector: &'a dyn ArchiveDetector) -> Self {
        Self { detector, base: None }
    }

    /// Resolves relative paths against `base`.
    pub fn with_base(mut self, base: Arc<MountPoint>) -> Self {
        self.base = Some(base);
        self
    }

    /// Scans `path`, opening a nested mount point at every archive segment.
    ///
    /// Absolute paths start at the host root. Inputs that already carry a
    /// scheme (`zip:file:/a.zip!/x`) are parsed as node paths.
    pub fn scan(&self, path: &str) -> FsResult<NodePath> {
        if has_scheme(path) {
            return Ok(NodePath::parse(path)?);
        }
        let (mut mount_point, relative) = if let Some(stripped) = path.strip_prefix('/') {
            (Arc::new(MountPoint::platform("/")?), stripped)
        } else {
            let base = self
                .base
                .clone()
                .ok_or_else(|| AddressError::malformed(path, path, "relative path without a base"))?;
            (base, path)
        };
        let relative = NodeName::new(relative)?;
        let mut pending: Vec<&str> = Vec::new();
        for segment in relative.segments() {
            pending.push(segment);
            if let Some(scheme) = self.detector.detect(segment) {
                let entry = NodeName::new(&pending.join("/"))?;
                mount_point = Arc::new(MountPoint::nested(scheme, mount_point, &entry)?);
                pending.clear();
            }
        }
        Ok(NodePath::new(mount_point, NodeName::new(&pending.join("/"))?))
    }
}

/// Whether `path` starts with `scheme:` rather than a plain path.
fn has_scheme(path: &str) -> bool {
    match path.find(':') {
        Some(idx) => {
            let candidate = &path[..idx];
            !candidate.contains('/') && Scheme::new(candidate).is_ok()
        }
        None => false,
    }
}
