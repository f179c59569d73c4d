// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Stream accounting
//!
//! Every stream handed out by the chain is registered with an accountant. A
//! sync waits for streams owned by other threads, then either fails or, when
//! forced, closes whatever is still open and reports a warning. Streams are
//! closed under the mount point's write lock, so a sync holding that lock
//! gives it up while it waits.

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Instant, SystemTime};

use parking_lot::{Condvar, Mutex};

use super::Controller;
use crate::address::NodeName;
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

type SharedInput = Arc<Mutex<Option<InputStream>>>;
type SharedOutput = Arc<Mutex<Option<Box<dyn OutputStream>>>>;

enum Resource {
    Input(SharedInput),
    Output(SharedOutput),
}

struct Slot {
    owner: ThreadId,
    resource: Resource,
}

#[derive(Default)]
struct Accountant {
    slots: Mutex<HashMap<u64, Slot>>,
    next_id: AtomicU64,
    closed: Condvar,
}

impl Accountant {
    fn register(&self, resource: Resource) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) + 1;
        self.slots.lock().insert(
            id,
            Slot {
                owner: thread::current().id(),
                resource,
            },
        );
        id
    }

    fn unregister(&self, id: u64) {
        let mut slots = self.slots.lock();
        if slots.remove(&id).is_some() {
            self.closed.notify_all();
        }
    }

    fn open_count(&self) -> usize {
        self.slots.lock().len()
    }

    fn has_foreign(&self) -> bool {
        let me = thread::current().id();
        self.slots.lock().values().any(|slot| slot.owner != me)
    }

    /// Waits until no stream of another thread is open or `deadline` passes.
    fn wait_foreign(&self, deadline: Instant) {
        let me = thread::current().id();
        let mut slots = self.slots.lock();
        while slots.values().any(|slot| slot.owner != me) {
            if self.closed.wait_until(&mut slots, deadline).timed_out() {
                break;
            }
        }
    }

    /// Closes every open stream. Returns the number closed and the failures.
    fn close_all(&self) -> (usize, Vec<String>) {
        let slots: Vec<Slot> = self.slots.lock().drain().map(|(_, slot)| slot).collect();
        self.closed.notify_all();
        let mut failures = Vec::new();
        for slot in &slots {
            match &slot.resource {
                Resource::Input(shared) => {
                    shared.lock().take();
                }
                Resource::Output(shared) => {
                    if let Some(mut stream) = shared.lock().take() {
                        if let Err(err) = stream.close() {
                            failures.push(err.to_string());
                        }
                    }
                }
            }
        }
        (slots.len(), failures)
    }
}

pub struct ResourceController {
    delegate: Arc<dyn Controller>,
    accountant: Arc<Accountant>,
    lock_model: Option<Arc<LockModel>>,
}

impl ResourceController {
    pub fn new(delegate: Arc<dyn Controller>, lock_model: Option<Arc<LockModel>>) -> Self {
        Self {
            delegate,
            accountant: Arc::default(),
            lock_model,
        }
    }

    fn wait_foreign(&self, deadline: Instant) -> FsResult<()> {
        match &self.lock_model {
            Some(lock_model) if lock_model.is_write_locked_by_current_thread() => loop {
                lock_model.while_write_released(|| self.accountant.wait_foreign(deadline))?;
                // Others may have opened streams while the lock was released.
                if !self.accountant.has_foreign() || Instant::now() >= deadline {
                    return Ok(());
                }
            },
            _ => {
                self.accountant.wait_foreign(deadline);
                Ok(())
            }
        }
    }

    /// Streams currently open on this mount point.
    pub fn open_streams(&self) -> usize {
        self.accountant.open_count()
    }
}

impl Controller for ResourceController {
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
        let inner = self.delegate.input(options, name)?;
        let shared: SharedInput = Arc::new(Mutex::new(Some(inner)));
        let id = self.accountant.register(Resource::Input(Arc::clone(&shared)));
        Ok(Box::new(AccountedInput {
            shared,
            id,
            accountant: Arc::clone(&self.accountant),
        }))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        let inner = self.delegate.output(options, name, template)?;
        let shared: SharedOutput = Arc::new(Mutex::new(Some(inner)));
        let id = self.accountant.register(Resource::Output(Arc::clone(&shared)));
        Ok(Box::new(AccountedOutput {
            shared,
            id,
            accountant: Arc::clone(&self.accountant),
        }))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        self.delegate.make(options, name, kind, template)
    }

    fn unlink(&self, options: AccessOptions, name: &NodeName) -> FsResult<()> {
        self.delegate.unlink(options, name)
    }

    fn set_time(&self, options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        self.delegate.set_time(options, name, modified)
    }

    fn sync(&self, options: SyncOptions) -> FsResult<()> {
        if let Some(wait) = options.wait_close_io {
            self.wait_foreign(Instant::now() + wait)?;
        }
        let mut warning = None;
        let open = self.accountant.open_count();
        if open > 0 {
            if !options.force_close_io {
                return Err(FsError::Busy(format!("{} has {} open streams", self.mount_point(), open)));
            }
            let (closed, failures) = self.accountant.close_all();
            let mut message = format!("forced {} open streams closed", closed);
            if !failures.is_empty() {
                message.push_str(&format!(" ({} failed: {})", failures.len(), failures.join("; ")));
            }
            tracing::warn!(mount_point = %self.mount_point(), "{}", message);
            warning = Some(FsError::SyncWarning {
                mount_point: self.mount_point().to_string(),
                message,
            });
        }
        self.delegate.sync(options)?;
        match warning {
            Some(warning) => Err(warning),
            None => Ok(()),
        }
    }
}

fn disconnected() -> io::Error {
    io::Error::new(io::ErrorKind::Other, "stream was closed by a filesystem sync")
}

struct AccountedInput {
    shared: SharedInput,
    id: u64,
    accountant: Arc<Accountant>,
}

impl Read for AccountedInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.shared.lock().as_mut() {
            Some(inner) => inner.read(buf),
            None => Err(disconnected()),
        }
    }
}

impl Drop for AccountedInput {
    fn drop(&mut self) {
        self.shared.lock().take();
        self.accountant.unregister(self.id);
    }
}

struct AccountedOutput {
    shared: SharedOutput,
    id: u64,
    accountant: Arc<Accountant>,
}

impl Write for AccountedOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.shared.lock().as_mut() {
            Some(inner) => inner.write(buf),
            None => Err(disconnected()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.shared.lock().as_mut() {
            Some(inner) => inner.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for AccountedOutput {
    fn close(&mut self) -> FsResult<()> {
        let stream = self.shared.lock().take();
        let result = match stream {
            Some(mut stream) => stream.close(),
            None => Ok(()),
        };
        self.accountant.unregister(self.id);
        result
    }
}

impl Drop for AccountedOutput {
    fn drop(&mut self) {
        if self.shared.lock().take().is_some() {
            tracing::debug!("output stream dropped without close");
        }
        self.accountant.unregister(self.id);
    }
}
