// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! TAR drivers for the archfs kernel
//!
//! Reading loads every regular file into pooled buffers, so the parent stream
//! is released right after mounting. Writing emits GNU headers, so entry
//! sizes must be known up front and the kernel buffers entries of unknown
//! size before they reach the driver.

use std::sync::Arc;

use archfs_kernel::driver::{ArchiveDriver, DriverQuirks, DriverRegistry, InputArchive, OutputService};
use archfs_kernel::{FsError, FsModel, FsResult, InputStream, IoBufferPool, OutputStream};
use flate2::read::GzDecoder;

mod input;
mod output;

use input::TarInput;
use output::{TarOutput, TarSink};

/// Extensions of uncompressed TAR archives.
pub const TAR_EXTENSIONS: &str = "tar";
/// Extensions of gzip-compressed TAR archives.
pub const TAR_GZ_EXTENSIONS: &str = "tar.gz|tgz|tar.gzip";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Compression {
    None,
    Gzip,
}

#[derive(Debug, Clone)]
pub struct TarDriver {
    compression: Compression,
    level: flate2::Compression,
}

impl TarDriver {
    pub fn plain() -> Self {
        Self {
            compression: Compression::None,
            level: flate2::Compression::default(),
        }
    }

    pub fn gzip() -> Self {
        Self {
            compression: Compression::Gzip,
            level: flate2::Compression::default(),
        }
    }

    /// Gzip level, 0 to 9.
    pub fn with_level(mut self, level: u32) -> Self {
        self.level = flate2::Compression::new(level.min(9));
        self
    }

    pub fn compression(&self) -> Compression {
        self.compression
    }
}

/// Registers the plain and gzip drivers under their usual extensions.
pub fn register(registry: &mut DriverRegistry) -> FsResult<()> {
    registry.register(TAR_EXTENSIONS, Arc::new(TarDriver::plain()))?;
    registry.register(TAR_GZ_EXTENSIONS, Arc::new(TarDriver::gzip()))
}

impl ArchiveDriver for TarDriver {
    fn quirks(&self) -> DriverQuirks {
        DriverQuirks {
            privileged_entry: None,
            requires_size: true,
            read_only: false,
        }
    }

    fn new_input(
        &self,
        model: &FsModel,
        source: InputStream,
        pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn InputArchive>> {
        let source: InputStream = match self.compression {
            Compression::None => source,
            Compression::Gzip => Box::new(GzDecoder::new(source)),
        };
        let input = TarInput::read(source, pool).map_err(|err| match err {
            FsError::Io(io) => FsError::NotAnArchive(format!("{}: {}", model.mount_point(), io)),
            other => other,
        })?;
        tracing::debug!(
            mount_point = %model.mount_point(),
            entries = input.len(),
            compression = ?self.compression,
            "read tar archive"
        );
        Ok(Box::new(input))
    }

    fn new_output(
        &self,
        _model: &FsModel,
        sink: Box<dyn OutputStream>,
        _pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn OutputService>> {
        let sink = match self.compression {
            Compression::None => TarSink::Plain(sink),
            Compression::Gzip => TarSink::Gzip(flate2::write::GzEncoder::new(sink, self.level)),
        };
        Ok(Box::new(TarOutput::new(sink)))
    }
}
