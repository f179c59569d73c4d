// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Archive target: the driver specific base of an archive controller chain
//!
//! Mounts lazily by reading the archive file through the parent controller,
//! keeps the entry table in memory and writes changed entries into a
//! multiplexed output archive that streams into the parent entry. A sync
//! copies every untouched entry into the output, closes output then input and
//! unmounts.

use std::collections::BTreeMap;
use std::io::{self, Write};
use std::sync::Arc;
use std::time::SystemTime;

use parking_lot::{Mutex, MutexGuard};

use super::Controller;
use crate::address::{NodeName, NodePath};
use crate::driver::{ArchiveDriver, InputArchive};
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::{FsModel, MountState};
use crate::mux::MultiplexedOutput;
use crate::pool::IoBufferPool;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Source {
    /// Contents live in the input archive.
    Input,
    /// Written to the current output archive.
    Output,
    /// Directory made since mount.
    Created,
    /// Directory implied by deeper entries; never written on its own.
    Implied,
}

#[derive(Clone)]
struct Node {
    entry: Entry,
    source: Source,
}

#[derive(Default)]
struct ArchiveState {
    nodes: BTreeMap<String, Node>,
    input: Option<Box<dyn InputArchive>>,
    output: Option<MultiplexedOutput>,
    touched: bool,
}

impl ArchiveState {
    fn with_root() -> Self {
        let mut state = Self::default();
        state.nodes.insert(
            String::new(),
            Node {
                entry: Entry::directory(NodeName::root()),
                source: Source::Implied,
            },
        );
        state
    }

    fn insert(&mut self, entry: Entry, source: Source) {
        let mut dir = entry.name.parent();
        while let Some(name) = dir {
            if self.nodes.contains_key(name.as_str()) {
                break;
            }
            dir = name.parent();
            self.nodes.insert(
                name.as_str().to_string(),
                Node {
                    entry: Entry::directory(name),
                    source: Source::Implied,
                },
            );
        }
        self.nodes.insert(entry.name.as_str().to_string(), Node { entry, source });
    }

    fn get(&self, name: &NodeName) -> Option<&Node> {
        self.nodes.get(name.as_str())
    }

    fn has_children(&self, name: &NodeName) -> bool {
        self.nodes.values().any(|node| node.entry.name.is_child_of(name))
    }

    /// Whether `name` was already written to the current output archive.
    fn in_output(&self, name: &NodeName) -> bool {
        self.output.as_ref().map(|output| output.contains(name.as_str())).unwrap_or(false)
    }
}

/// Driver specific archive controller. Wrapped by the standard layers.
pub struct TargetArchiveController {
    lock_model: Arc<LockModel>,
    parent: Arc<dyn Controller>,
    driver: Arc<dyn ArchiveDriver>,
    pool: Arc<dyn IoBufferPool>,
    state: Arc<Mutex<ArchiveState>>,
}

impl TargetArchiveController {
    pub fn new(
        lock_model: Arc<LockModel>,
        parent: Arc<dyn Controller>,
        driver: Arc<dyn ArchiveDriver>,
        pool: Arc<dyn IoBufferPool>,
    ) -> Self {
        Self {
            lock_model,
            parent,
            driver,
            pool,
            state: Arc::new(Mutex::new(ArchiveState::with_root())),
        }
    }

    fn describe(&self, name: &NodeName) -> String {
        format!("{}{}", self.mount_point(), name)
    }

    fn check_writable(&self, name: &NodeName) -> FsResult<()> {
        if self.driver.quirks().read_only {
            return Err(FsError::ReadOnlyFileSystem(self.describe(name)));
        }
        Ok(())
    }

    fn archive_entry(&self) -> FsResult<NodePath> {
        self.mount_point()
            .parent_entry()
            .ok_or_else(|| FsError::Consistency(format!("{} has no parent mount point", self.mount_point())))
    }

    /// Returns the entry table, mounting the archive first if needed.
    /// Mounting requires the write lock.
    fn mount(&self, options: AccessOptions, autocreate: bool) -> FsResult<MutexGuard<'_, ArchiveState>> {
        let mut state = self.state.lock();
        let model = self.model();
        if model.is_mounted() {
            return Ok(state);
        }
        if !self.lock_model.is_write_locked_by_current_thread() {
            return Err(FsError::NeedsWriteLock);
        }
        self.lock_model.set_state(MountState::Mounting)?;
        match self.load(&mut state, options, autocreate) {
            Ok(()) => {
                self.lock_model.set_mounted(true)?;
                tracing::debug!(mount_point = %self.mount_point(), entries = state.nodes.len(), "mounted archive");
                Ok(state)
            }
            Err(err) => {
                *state = ArchiveState::with_root();
                self.lock_model.set_mounted(false)?;
                tracing::debug!(mount_point = %self.mount_point(), error = %err, "mount failed");
                Err(err)
            }
        }
    }

    fn load(&self, state: &mut ArchiveState, options: AccessOptions, autocreate: bool) -> FsResult<()> {
        let archive = self.archive_entry()?;
        *state = ArchiveState::with_root();
        match self.parent.node(options, &archive.name)? {
            Some(entry) if entry.is_file() => {
                let source = self.parent.input(options, &archive.name)?;
                let input = self.driver.new_input(self.model(), source, &self.pool)?;
                for entry in input.entries() {
                    if entry.name.is_root() {
                        continue;
                    }
                    state.insert(entry, Source::Input);
                }
                state.input = Some(input);
                Ok(())
            }
            Some(_) => Err(FsError::NotAnArchive(archive.to_string())),
            None if autocreate => {
                tracing::debug!(archive = %archive, "creating new archive");
                state.touched = true;
                Ok(())
            }
            None => Err(FsError::NotFound(archive.to_string())),
        }
    }

    /// Fails unless the parent directory of `name` exists or may be created.
    fn check_parents(&self, state: &ArchiveState, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        let mut dir = name.parent();
        while let Some(current) = dir {
            match state.get(&current) {
                Some(node) if node.entry.is_directory() => return Ok(()),
                Some(_) => return Err(FsError::NotADirectory(self.describe(&current))),
                None if options.create_parents => dir = current.parent(),
                None => return Err(FsError::NotFound(self.describe(&current))),
            }
        }
        Ok(())
    }

    fn output_archive(&self, state: &mut ArchiveState, options: AccessOptions) -> FsResult<MultiplexedOutput> {
        if let Some(output) = &state.output {
            return Ok(output.clone());
        }
        let archive = self.archive_entry()?;
        let sink = self.parent.output(options, &archive.name, None)?;
        let service = self.driver.new_output(self.model(), sink, &self.pool)?;
        let output = MultiplexedOutput::new(service, Arc::clone(&self.pool), self.driver.quirks());
        state.output = Some(output.clone());
        Ok(output)
    }

    /// Writes everything still pending into the output archive. Returns
    /// non-fatal problems.
    fn commit(&self, state: &mut ArchiveState) -> FsResult<Vec<String>> {
        let mut warnings = Vec::new();
        if state.touched {
            let output = self.output_archive(state, AccessOptions::default())?;
            let pending: Vec<Entry> = state
                .nodes
                .values()
                .filter(|node| !node.entry.name.is_root())
                .filter(|node| matches!(node.source, Source::Input | Source::Created))
                .filter(|node| !output.contains(node.entry.name.as_str()))
                .map(|node| node.entry.clone())
                .collect();
            for entry in pending {
                match entry.kind {
                    EntryType::Directory => {
                        let mut out = output.output(Entry {
                            size: Some(0),
                            ..entry
                        })?;
                        out.close()?;
                    }
                    EntryType::File => {
                        let input = state
                            .input
                            .as_mut()
                            .ok_or_else(|| FsError::Consistency(format!("no input archive for {}", entry.name)))?;
                        let mut reader = input.open(&entry.name)?;
                        let mut out = output.output(entry)?;
                        io::copy(&mut reader, &mut out)?;
                        out.close()?;
                    }
                    EntryType::Special => {
                        warnings.push(format!("dropped special entry {}", entry.name));
                    }
                }
            }
            output.close()?;
        }
        if let Some(mut input) = state.input.take() {
            if let Err(err) = input.close() {
                warnings.push(format!("closing input archive: {}", err));
            }
        }
        Ok(warnings)
    }

    fn unlink_archive(&self, options: AccessOptions) -> FsResult<()> {
        let archive = self.archive_entry()?;
        {
            let mut state = self.mount(options, false)?;
            if state.nodes.len() > 1 {
                return Err(FsError::DirectoryNotEmpty(self.mount_point().to_string()));
            }
            if let Some(mut input) = state.input.take() {
                input.close()?;
            }
            *state = ArchiveState::with_root();
            self.lock_model.set_mounted(false)?;
        }
        self.parent.unlink(options, &archive.name)
    }
}

impl Controller for TargetArchiveController {
    fn model(&self) -> &Arc<FsModel> {
        self.lock_model.model()
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        Some(&self.parent)
    }

    fn node(&self, options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        let state = match self.mount(options, false) {
            Ok(state) => state,
            Err(FsError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err),
        };
        Ok(state.get(name).map(|node| node.entry.clone()))
    }

    fn list(&self, options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        let state = self.mount(options, false)?;
        match state.get(name) {
            None => return Err(FsError::NotFound(self.describe(name))),
            Some(node) if !node.entry.is_directory() => return Err(FsError::NotADirectory(self.describe(name))),
            Some(_) => {}
        }
        Ok(state
            .nodes
            .values()
            .filter(|node| node.entry.name.is_child_of(name))
            .map(|node| node.entry.clone())
            .collect())
    }

    fn input(&self, options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        let mut state = self.mount(options, false)?;
        if state.in_output(name) {
            return Err(FsError::NeedsSync);
        }
        match state.get(name) {
            None => return Err(FsError::NotFound(self.describe(name))),
            Some(node) if node.entry.is_directory() => return Err(FsError::IsADirectory(self.describe(name))),
            Some(node) if node.source != Source::Input => return Err(FsError::NotFound(self.describe(name))),
            Some(_) => {}
        }
        let description = self.describe(name);
        let input = state.input.as_mut().ok_or(FsError::NotFound(description))?;
        input.open(name)
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        self.check_writable(name)?;
        let mut state = self.mount(options, options.create_parents)?;
        if state.in_output(name) {
            return Err(FsError::NeedsSync);
        }
        match state.get(name) {
            Some(node) if node.entry.is_directory() => return Err(FsError::IsADirectory(self.describe(name))),
            Some(_) if options.exclusive => return Err(FsError::AlreadyExists(self.describe(name))),
            _ => {}
        }
        self.check_parents(&state, options, name)?;
        let output = self.output_archive(&mut state, options)?;
        let modified = template.and_then(|t| t.modified).or_else(|| Some(SystemTime::now()));
        let entry = Entry::file(name.clone(), template.and_then(|t| t.size)).with_modified(modified);
        let stream = output.output(entry.clone())?;
        let previous = state.get(name).cloned();
        state.insert(entry, Source::Output);
        state.touched = true;
        Ok(Box::new(TargetOutput {
            inner: Some(stream),
            output,
            state: Arc::clone(&self.state),
            name: name.clone(),
            previous,
            written: 0,
            closed: false,
        }))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.check_writable(name)?;
        match kind {
            EntryType::File => {
                let mut out = self.output(options, name, template)?;
                out.close()
            }
            EntryType::Directory => {
                let mut state = self.mount(options, options.create_parents)?;
                if let Some(node) = state.get(name) {
                    if node.entry.is_directory() && !options.exclusive {
                        return Ok(());
                    }
                    return Err(FsError::AlreadyExists(self.describe(name)));
                }
                self.check_parents(&state, options, name)?;
                let modified = template.and_then(|t| t.modified).or_else(|| Some(SystemTime::now()));
                state.insert(Entry::directory(name.clone()).with_modified(modified), Source::Created);
                state.touched = true;
                Ok(())
            }
            EntryType::Special => Err(FsError::Unsupported(format!(
                "cannot create special entry {}",
                self.describe(name)
            ))),
        }
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.check_writable(name)?;
        if name.is_root() {
            return self.unlink_archive(options);
        }
        let mut state = self.mount(options, false)?;
        if state.in_output(name) {
            return Err(FsError::NeedsSync);
        }
        match state.get(name) {
            None => return Err(FsError::NotFound(self.describe(name))),
            Some(node) if node.entry.is_directory() && state.has_children(name) => {
                return Err(FsError::DirectoryNotEmpty(self.describe(name)))
            }
            Some(_) => {}
        }
        state.nodes.remove(name.as_str());
        state.touched = true;
        Ok(())
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        if name.is_root() {
            let archive = self.archive_entry()?;
            return self.parent.set_time(options, &archive.name, modified);
        }
        self.check_writable(name)?;
        let mut state = self.mount(options, false)?;
        if state.in_output(name) {
            return Err(FsError::NeedsSync);
        }
        let description = self.describe(name);
        let node = state.nodes.get_mut(name.as_str()).ok_or(FsError::NotFound(description))?;
        node.entry.modified = Some(modified);
        if node.source == Source::Implied {
            node.source = Source::Created;
        }
        state.touched = true;
        Ok(())
    }

    fn sync(&self, _options: SyncOptions) -> FsResult<()> {
        self.lock_model.assert_write_locked_by_current_thread()?;
        let mut state = self.state.lock();
        if !self.model().is_mounted() {
            return Ok(());
        }
        if state.output.as_ref().map(MultiplexedOutput::is_busy).unwrap_or(false) {
            return Err(FsError::Busy(format!("{} has entries still being written", self.mount_point())));
        }
        self.lock_model.set_state(MountState::Syncing)?;
        let result = self.commit(&mut state);
        *state = ArchiveState::with_root();
        let mount_point = self.mount_point().to_string();
        match result {
            Ok(warnings) => {
                self.lock_model.set_mounted(false)?;
                tracing::debug!(mount_point = %mount_point, "synced and unmounted archive");
                if warnings.is_empty() {
                    Ok(())
                } else {
                    Err(FsError::SyncWarning {
                        mount_point,
                        message: warnings.join("; "),
                    })
                }
            }
            Err(err) => {
                self.lock_model.set_state(MountState::Failed)?;
                tracing::warn!(mount_point = %mount_point, error = %err, "sync failed, archive changes dropped");
                Err(FsError::SyncFailed {
                    mount_point,
                    source: Box::new(err),
                })
            }
        }
    }
}

/// Output stream that records the final entry size in the table on close.
/// Dropped unclosed, it puts back the entry it was replacing unless bytes
/// already reached the output archive.
struct TargetOutput {
    inner: Option<Box<dyn OutputStream>>,
    output: MultiplexedOutput,
    state: Arc<Mutex<ArchiveState>>,
    name: NodeName,
    previous: Option<Node>,
    written: u64,
    closed: bool,
}

impl TargetOutput {
    fn record_size(&self, state: &mut ArchiveState) {
        if let Some(node) = state.nodes.get_mut(self.name.as_str()) {
            if node.source == Source::Output {
                node.entry.size = Some(self.written);
            }
        }
    }
}

impl Write for TargetOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let inner = self
            .inner
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::Other, "entry writer closed"))?;
        let n = inner.write(buf)?;
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for TargetOutput {
    fn close(&mut self) -> FsResult<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        if let Some(inner) = self.inner.as_mut() {
            inner.close()?;
        }
        let mut state = self.state.lock();
        self.record_size(&mut state);
        Ok(())
    }
}

impl Drop for TargetOutput {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        drop(self.inner.take());
        let started = self.output.contains(self.name.as_str());
        let mut state = self.state.lock();
        if started {
            self.record_size(&mut state);
            return;
        }
        let is_output = state.get(&self.name).map(|node| node.source == Source::Output).unwrap_or(false);
        if !is_output {
            return;
        }
        match self.previous.take() {
            Some(previous) => {
                tracing::debug!(entry = %self.name, "output dropped unwritten, keeping the previous entry");
                state.nodes.insert(self.name.as_str().to_string(), previous);
            }
            None => {
                state.nodes.remove(self.name.as_str());
            }
        }
    }
}
