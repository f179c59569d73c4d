// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Reentrant reader/writer lock with per-thread introspection
//!
//! Any number of threads may hold read holds, or exactly one thread may hold
//! the write lock. Both are reentrant per thread. While the write lock is held
//! no thread takes a new read hold, the writer included: the writer's reads
//! run under its write hold. A thread holding only read holds cannot upgrade
//! and gets [`FsError::LockUpgrade`] instead of deadlocking. Waiting writers
//! block new readers that do not already hold the lock.

use std::collections::HashMap;
use std::marker::PhantomData;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use crate::error::{FsError, FsResult};
use crate::model::{FsModel, MountState};

#[derive(Debug, Default)]
struct LockState {
    writer: Option<ThreadId>,
    write_holds: usize,
    readers: HashMap<ThreadId, usize>,
    waiting_writers: usize,
}

#[derive(Debug, Default)]
pub struct ReentrantRwLock {
    state: Mutex<LockState>,
    cond: Condvar,
}

impl ReentrantRwLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn read(&self) -> ReadGuard<'_> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) && !state.readers.contains_key(&me) {
            // Covered by the write hold; no read hold is taken.
            return ReadGuard {
                lock: self,
                counted: false,
                _thread_bound: PhantomData,
            };
        }
        loop {
            let reentrant = state.readers.contains_key(&me);
            if reentrant || (state.writer.is_none() && state.waiting_writers == 0) {
                break;
            }
            self.cond.wait(&mut state);
        }
        *state.readers.entry(me).or_insert(0) += 1;
        ReadGuard {
            lock: self,
            counted: true,
            _thread_bound: PhantomData,
        }
    }

    pub fn write(&self) -> FsResult<WriteGuard<'_>> {
        self.acquire_write(None)?;
        Ok(WriteGuard {
            lock: self,
            _thread_bound: PhantomData,
        })
    }

    /// Like [`write`](Self::write) but gives up after `timeout`.
    pub fn try_write_for(&self, timeout: Duration) -> FsResult<Option<WriteGuard<'_>>> {
        if !self.acquire_write(Some(Instant::now() + timeout))? {
            return Ok(None);
        }
        Ok(Some(WriteGuard {
            lock: self,
            _thread_bound: PhantomData,
        }))
    }

    fn acquire_write(&self, deadline: Option<Instant>) -> FsResult<bool> {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if state.writer == Some(me) {
            state.write_holds += 1;
            return Ok(true);
        }
        if state.readers.contains_key(&me) {
            return Err(FsError::LockUpgrade);
        }
        state.waiting_writers += 1;
        while state.writer.is_some() || !state.readers.is_empty() {
            match deadline {
                None => self.cond.wait(&mut state),
                Some(deadline) => {
                    let timed_out = self.cond.wait_until(&mut state, deadline).timed_out();
                    if timed_out && (state.writer.is_some() || !state.readers.is_empty()) {
                        state.waiting_writers -= 1;
                        self.cond.notify_all();
                        return Ok(false);
                    }
                }
            }
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        state.write_holds = 1;
        Ok(true)
    }

    /// Gives up every write hold of the calling thread while `wait` runs, then
    /// takes the write lock back with the same hold count. Other threads may
    /// write in between.
    pub fn while_write_released<T>(&self, wait: impl FnOnce() -> T) -> FsResult<T> {
        let me = thread::current().id();
        let holds = {
            let mut state = self.state.lock();
            if state.writer != Some(me) {
                return Err(FsError::NotWriteLocked);
            }
            let holds = state.write_holds;
            state.writer = None;
            state.write_holds = 0;
            self.cond.notify_all();
            holds
        };
        let result = wait();
        let mut state = self.state.lock();
        state.waiting_writers += 1;
        while state.writer.is_some() || state.readers.keys().any(|reader| *reader != me) {
            self.cond.wait(&mut state);
        }
        state.waiting_writers -= 1;
        state.writer = Some(me);
        state.write_holds = holds;
        Ok(result)
    }

    fn release_read(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock();
        if let Some(holds) = state.readers.get_mut(&me) {
            *holds -= 1;
            if *holds == 0 {
                state.readers.remove(&me);
            }
        }
        if state.readers.is_empty() {
            self.cond.notify_all();
        }
    }

    fn release_write(&self) {
        let mut state = self.state.lock();
        if state.writer != Some(thread::current().id()) {
            return;
        }
        state.write_holds = state.write_holds.saturating_sub(1);
        if state.write_holds == 0 {
            state.writer = None;
            self.cond.notify_all();
        }
    }

    pub fn is_write_locked(&self) -> bool {
        self.state.lock().writer.is_some()
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.state.lock().writer == Some(thread::current().id())
    }

    /// Read holds of the calling thread.
    pub fn read_hold_count(&self) -> usize {
        let me = thread::current().id();
        self.state.lock().readers.get(&me).copied().unwrap_or(0)
    }

    /// Threads currently holding read holds.
    pub fn reader_count(&self) -> usize {
        self.state.lock().readers.len()
    }
}

/// Read hold, released on drop. Bound to the acquiring thread.
pub struct ReadGuard<'a> {
    lock: &'a ReentrantRwLock,
    counted: bool,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for ReadGuard<'_> {
    fn drop(&mut self) {
        if self.counted {
            self.lock.release_read();
        }
    }
}

/// Write hold, released on drop. Bound to the acquiring thread.
pub struct WriteGuard<'a> {
    lock: &'a ReentrantRwLock,
    _thread_bound: PhantomData<*const ()>,
}

impl Drop for WriteGuard<'_> {
    fn drop(&mut self) {
        self.lock.release_write();
    }
}

/// Filesystem model guarded by a reentrant reader/writer lock.
#[derive(Debug)]
pub struct LockModel {
    model: Arc<FsModel>,
    lock: ReentrantRwLock,
}

impl LockModel {
    pub fn new(model: Arc<FsModel>) -> Self {
        Self {
            model,
            lock: ReentrantRwLock::new(),
        }
    }

    pub fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    pub fn read_lock(&self) -> ReadGuard<'_> {
        self.lock.read()
    }

    pub fn write_lock(&self) -> FsResult<WriteGuard<'_>> {
        self.lock.write()
    }

    pub fn try_write_lock_for(&self, timeout: Duration) -> FsResult<Option<WriteGuard<'_>>> {
        self.lock.try_write_for(timeout)
    }

    pub fn is_write_locked_by_current_thread(&self) -> bool {
        self.lock.is_write_locked_by_current_thread()
    }

    pub fn while_write_released<T>(&self, wait: impl FnOnce() -> T) -> FsResult<T> {
        self.lock.while_write_released(wait)
    }

    pub fn read_hold_count(&self) -> usize {
        self.lock.read_hold_count()
    }

    pub fn assert_write_locked_by_current_thread(&self) -> FsResult<()> {
        if self.is_write_locked_by_current_thread() {
            Ok(())
        } else {
            Err(FsError::NotWriteLocked)
        }
    }

    /// Fails with `cause` chained if the calling thread holds any read hold.
    pub fn assert_not_read_locked_by_current_thread(&self, cause: FsError) -> FsResult<()> {
        if self.read_hold_count() > 0 {
            Err(FsError::ReadLocked {
                cause: Box::new(cause),
            })
        } else {
            Ok(())
        }
    }

    pub fn set_mounted(&self, mounted: bool) -> FsResult<()> {
        self.assert_write_locked_by_current_thread()?;
        self.model.set_mounted(mounted);
        Ok(())
    }

    pub fn set_state(&self, state: MountState) -> FsResult<()> {
        self.assert_write_locked_by_current_thread()?;
        self.model.set_state(state);
        Ok(())
    }
}
