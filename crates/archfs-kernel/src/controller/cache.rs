// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Entry content cache
//!
//! Reads are served from pooled buffers once loaded. Writes are staged in a
//! buffer and copied to the target on close, after which the buffer serves
//! re-reads of entries the output archive cannot read back.

use std::collections::HashMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::Mutex;

use super::Controller;
use crate::address::NodeName;
use crate::error::FsResult;
use crate::model::FsModel;
use crate::pool::{IoBuffer, IoBufferPool};
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

type Cache = Arc<Mutex<HashMap<NodeName, IoBuffer>>>;

pub struct CacheController {
    delegate: Arc<dyn Controller>,
    pool: Arc<dyn IoBufferPool>,
    cache: Cache,
}

impl CacheController {
    pub fn new(delegate: Arc<dyn Controller>, pool: Arc<dyn IoBufferPool>) -> Self {
        Self {
            delegate,
            pool,
            cache: Arc::default(),
        }
    }

    /// Number of cached entries.
    pub fn cached(&self) -> usize {
        self.cache.lock().len()
    }

    fn evict(&self, name: &NodeName) {
        if let Some(buffer) = self.cache.lock().remove(name) {
            buffer.release();
        }
    }
}

impl Controller for CacheController {
    fn model(&self) -> &Arc<FsModel> {
        self.delegate.model()
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        self.delegate.parent()
    }

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        self.delegate.node(options, name)
    }

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        self.delegate.list(options, name)
    }

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        if let Some(buffer) = self.cache.lock().get(name) {
            return buffer.reader();
        }
        let mut source = self.delegate.input(options, name)?;
        let mut buffer = self.pool.allocate()?;
        buffer.fill_from(&mut source)?;
        let reader = buffer.reader()?;
        tracing::trace!(mount_point = %self.mount_point(), entry = %name, size = buffer.len(), "cached entry");
        self.cache.lock().insert(name.clone(), buffer);
        Ok(reader)
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        // The target is opened right away so its checks run before any bytes are staged.
        let sink = self.delegate.output(options, name, template)?;
        self.evict(name);
        Ok(Box::new(CacheOutput {
            buffer: Some(self.pool.allocate()?),
            sink: Some(sink),
            name: name.clone(),
            cache: Arc::clone(&self.cache),
        }))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.delegate.make(options, name, kind, template)?;
        self.evict(name);
        Ok(())
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.delegate.unlink(options, name)?;
        self.evict(name);
        Ok(())
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        self.delegate.set_time(options, name, modified)
    }

    fn sync(&self, options: SyncOptions) -> FsResult<()> {
        let result = self.delegate.sync(options);
        let synced = match &result {
            Ok(()) => true,
            Err(err) => err.is_warning(),
        };
        if options.clear_cache && synced {
            let mut cache = self.cache.lock();
            tracing::debug!(mount_point = %self.mount_point(), entries = cache.len(), "clearing entry cache");
            cache.clear();
        }
        result
    }
}

struct CacheOutput {
    buffer: Option<IoBuffer>,
    sink: Option<Box<dyn OutputStream>>,
    name: NodeName,
    cache: Cache,
}

impl Write for CacheOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "output closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for CacheOutput {
    fn close(&mut self) -> FsResult<()> {
        let (Some(mut buffer), Some(mut sink)) = (self.buffer.take(), self.sink.take()) else {
            return Ok(());
        };
        buffer.flush()?;
        buffer.copy_to(&mut sink)?;
        sink.close()?;
        self.cache.lock().insert(self.name.clone(), buffer);
        Ok(())
    }
}
