// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Multiplexing output archive
//!
//! An archive output service accepts one entry at a time. Entries that cannot
//! be streamed directly are captured in pooled buffers and flushed once they
//! are closed and next in line: the privileged entry first, then in the order
//! the entries were requested. A direct entry is begun on its first write or
//! on close, so a writer dropped before either leaves nothing behind.

use std::collections::{HashSet, VecDeque};
use std::io::{self, Read, Write};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::driver::{DriverQuirks, OutputService};
use crate::error::{FsError, FsResult};
use crate::pool::{IoBuffer, IoBufferPool};
use crate::types::{Entry, OutputStream};

const COPY_CHUNK: usize = 64 * 1024;

struct Pending {
    id: u64,
    entry: Entry,
    /// Set once the writer is closed.
    buffer: Option<IoBuffer>,
}

struct MuxState {
    service: Option<Box<dyn OutputService>>,
    quirks: DriverQuirks,
    direct_open: bool,
    privileged_written: bool,
    next_id: u64,
    pending: VecDeque<Pending>,
    names: HashSet<String>,
    open_writers: usize,
}

impl MuxState {
    fn service(&mut self) -> FsResult<&mut Box<dyn OutputService>> {
        self.service
            .as_mut()
            .ok_or_else(|| FsError::Consistency("output archive already closed".into()))
    }

    fn holds_back_ordinary_entries(&self) -> bool {
        self.quirks.privileged_entry.is_some() && !self.privileged_written
    }

    fn is_privileged(&self, entry: &Entry) -> bool {
        self.quirks.privileged_entry == Some(entry.name.as_str())
    }

    /// Flushes closed buffered entries that are next in line. With `draining`
    /// set, ordinary entries no longer wait for a missing privileged entry.
    fn flush_ready(&mut self, draining: bool) -> FsResult<()> {
        while !self.direct_open {
            let index = if let Some(name) = self.quirks.privileged_entry.filter(|_| !self.privileged_written) {
                match self.pending.iter().position(|p| p.entry.name.as_str() == name) {
                    Some(index) => index,
                    None if draining => 0,
                    None => return Ok(()),
                }
            } else {
                0
            };
            let ready = self.pending.get(index).map(|p| p.buffer.is_some()).unwrap_or(false);
            if !ready {
                return Ok(());
            }
            let Some(pending) = self.pending.remove(index) else {
                return Ok(());
            };
            self.flush_one(pending)?;
        }
        Ok(())
    }

    fn flush_one(&mut self, pending: Pending) -> FsResult<()> {
        let Pending { entry, buffer, .. } = pending;
        let Some(buffer) = buffer else {
            return Ok(());
        };
        let mut entry = entry;
        entry.size = Some(buffer.len());
        if self.is_privileged(&entry) {
            self.privileged_written = true;
        }
        tracing::trace!(entry = %entry.name, size = buffer.len(), "flushing buffered entry");
        let service = self.service()?;
        service.begin(&entry)?;
        let mut reader = buffer.reader()?;
        let mut chunk = vec![0u8; COPY_CHUNK];
        loop {
            let n = reader.read(&mut chunk)?;
            if n == 0 {
                break;
            }
            service.write(&chunk[..n])?;
        }
        service.end()?;
        buffer.release();
        Ok(())
    }
}

/// Output archive that accepts concurrent entry writers.
#[derive(Clone)]
pub struct MultiplexedOutput {
    state: Arc<Mutex<MuxState>>,
    pool: Arc<dyn IoBufferPool>,
}

impl MultiplexedOutput {
    pub fn new(service: Box<dyn OutputService>, pool: Arc<dyn IoBufferPool>, quirks: DriverQuirks) -> Self {
        Self {
            state: Arc::new(Mutex::new(MuxState {
                service: Some(service),
                quirks,
                direct_open: false,
                privileged_written: false,
                next_id: 0,
                pending: VecDeque::new(),
                names: HashSet::new(),
                open_writers: 0,
            })),
            pool,
        }
    }

    /// Opens a writer for `entry`, streaming directly when possible.
    pub fn output(&self, entry: Entry) -> FsResult<Box<dyn OutputStream>> {
        let mut state = self.state.lock();
        state.service()?;
        let privileged = state.is_privileged(&entry);
        let in_order = privileged || (state.pending.is_empty() && !state.holds_back_ordinary_entries());
        let size_ok = !state.quirks.requires_size || entry.size.is_some();
        state.names.insert(entry.name.as_str().to_string());
        state.open_writers += 1;

        if !state.direct_open && in_order && size_ok {
            state.direct_open = true;
            if privileged {
                state.privileged_written = true;
            }
            tracing::trace!(entry = %entry.name, "streaming entry directly");
            return Ok(Box::new(DirectWriter {
                state: Arc::clone(&self.state),
                name: entry.name.as_str().to_string(),
                unbegun: Some(entry),
                privileged,
                done: false,
            }));
        }

        let buffer = match self.pool.allocate() {
            Ok(buffer) => buffer,
            Err(err) => {
                state.open_writers -= 1;
                return Err(err);
            }
        };
        let id = state.next_id;
        state.next_id += 1;
        let name = entry.name.as_str().to_string();
        tracing::trace!(entry = %name, "buffering entry");
        state.pending.push_back(Pending {
            id,
            entry,
            buffer: None,
        });
        Ok(Box::new(BufferedWriter {
            state: Arc::clone(&self.state),
            id,
            name,
            buffer: Some(buffer),
        }))
    }

    /// Whether an entry of this name was started in this output archive.
    pub fn contains(&self, name: &str) -> bool {
        self.state.lock().names.contains(name)
    }

    /// Whether any entry writer is still open.
    pub fn is_busy(&self) -> bool {
        self.state.lock().open_writers > 0
    }

    /// Flushes every buffered entry and finishes the archive.
    pub fn close(&self) -> FsResult<()> {
        let mut state = self.state.lock();
        if state.open_writers > 0 {
            return Err(FsError::Busy(format!("{} entry writers still open", state.open_writers)));
        }
        state.flush_ready(true)?;
        match state.service.take() {
            Some(service) => service.finish(),
            None => Ok(()),
        }
    }
}

struct DirectWriter {
    state: Arc<Mutex<MuxState>>,
    name: String,
    /// Entry not yet begun in the service.
    unbegun: Option<Entry>,
    privileged: bool,
    done: bool,
}

impl DirectWriter {
    fn begin(&mut self, state: &mut MuxState) -> FsResult<()> {
        if let Some(entry) = self.unbegun.take() {
            state.service()?.begin(&entry)?;
        }
        Ok(())
    }
}

impl Write for DirectWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.done {
            return Err(io::Error::new(io::ErrorKind::Other, "entry writer closed"));
        }
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        self.begin(&mut state).map_err(FsError::into_io)?;
        state
            .service()
            .and_then(|service| service.write(buf))
            .map_err(FsError::into_io)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl OutputStream for DirectWriter {
    fn close(&mut self) -> FsResult<()> {
        if self.done {
            return Ok(());
        }
        self.done = true;
        let state = Arc::clone(&self.state);
        let mut state = state.lock();
        state.open_writers -= 1;
        let ended = self.begin(&mut state).and_then(|()| state.service()?.end());
        state.direct_open = false;
        ended?;
        state.flush_ready(false)
    }
}

impl Drop for DirectWriter {
    fn drop(&mut self) {
        if self.done {
            return;
        }
        self.done = true;
        let mut state = self.state.lock();
        state.open_writers -= 1;
        state.direct_open = false;
        if self.unbegun.take().is_some() {
            tracing::debug!(entry = %self.name, "direct entry writer dropped before writing, abandoning entry");
            state.names.remove(&self.name);
            if self.privileged {
                state.privileged_written = false;
            }
        } else {
            tracing::warn!(entry = %self.name, "direct entry writer dropped without close, ending entry");
            if let Err(err) = state.service().and_then(|service| service.end()) {
                tracing::warn!(entry = %self.name, error = %err, "failed to end entry");
            }
        }
        if let Err(err) = state.flush_ready(false) {
            tracing::warn!(error = %err, "failed to flush buffered entries");
        }
    }
}

struct BufferedWriter {
    state: Arc<Mutex<MuxState>>,
    id: u64,
    name: String,
    buffer: Option<IoBuffer>,
}

impl Write for BufferedWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "entry writer closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.buffer.as_mut() {
            Some(buffer) => buffer.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for BufferedWriter {
    fn close(&mut self) -> FsResult<()> {
        let Some(mut buffer) = self.buffer.take() else {
            return Ok(());
        };
        buffer.flush()?;
        let mut state = self.state.lock();
        state.open_writers -= 1;
        if let Some(pending) = state.pending.iter_mut().find(|p| p.id == self.id) {
            pending.buffer = Some(buffer);
        }
        state.flush_ready(false)
    }
}

impl Drop for BufferedWriter {
    fn drop(&mut self) {
        if self.buffer.take().is_some() {
            tracing::warn!(entry = %self.name, "buffered entry writer dropped without close, abandoning entry");
            let mut state = self.state.lock();
            state.open_writers -= 1;
            state.pending.retain(|p| p.id != self.id);
            state.names.remove(&self.name);
            if let Err(err) = state.flush_ready(false) {
                tracing::warn!(error = %err, "failed to flush buffered entries");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::NodeName;
    use crate::pool::MemoryBufferPool;

    type Log = Arc<Mutex<Vec<(String, Vec<u8>)>>>;

    /// Records finished entries in write order.
    struct RecordingService {
        log: Log,
        current: Option<(String, Vec<u8>)>,
        finished: Arc<Mutex<bool>>,
        requires_size: bool,
    }

    impl OutputService for RecordingService {
        fn begin(&mut self, entry: &Entry) -> FsResult<()> {
            assert!(self.current.is_none(), "entries must not interleave");
            if self.requires_size {
                assert!(entry.size.is_some(), "size required for {}", entry.name);
            }
            self.current = Some((entry.name.as_str().to_string(), Vec::new()));
            Ok(())
        }

        fn write(&mut self, buf: &[u8]) -> FsResult<()> {
            self.current.as_mut().expect("entry open").1.extend_from_slice(buf);
            Ok(())
        }

        fn end(&mut self) -> FsResult<()> {
            let entry = self.current.take().expect("entry open");
            self.log.lock().push(entry);
            Ok(())
        }

        fn finish(self: Box<Self>) -> FsResult<()> {
            *self.finished.lock() = true;
            Ok(())
        }
    }

    fn mux(quirks: DriverQuirks) -> (MultiplexedOutput, Log, Arc<Mutex<bool>>) {
        let log: Log = Arc::default();
        let finished = Arc::new(Mutex::new(false));
        let service = RecordingService {
            log: Arc::clone(&log),
            current: None,
            finished: Arc::clone(&finished),
            requires_size: quirks.requires_size,
        };
        let pool: Arc<dyn IoBufferPool> = Arc::new(MemoryBufferPool::new());
        (MultiplexedOutput::new(Box::new(service), pool, quirks), log, finished)
    }

    fn file(name: &str) -> Entry {
        Entry::file(NodeName::new(name).unwrap(), None)
    }

    fn names(log: &Log) -> Vec<String> {
        log.lock().iter().map(|(name, _)| name.clone()).collect()
    }

    #[test]
    fn privileged_entry_comes_first_then_request_order() {
        let quirks = DriverQuirks {
            privileged_entry: Some("mimetype"),
            ..DriverQuirks::default()
        };
        let (mux, log, finished) = mux(quirks);

        let mut b = mux.output(file("b")).unwrap();
        let mut a = mux.output(file("a")).unwrap();
        b.write_all(b"bee").unwrap();
        a.write_all(b"ay").unwrap();
        a.close().unwrap();
        b.close().unwrap();
        assert!(log.lock().is_empty());

        let mut mimetype = mux.output(file("mimetype")).unwrap();
        mimetype.write_all(b"application/vnd.oasis.opendocument.text").unwrap();
        mimetype.close().unwrap();
        mux.close().unwrap();

        assert_eq!(names(&log), vec!["mimetype", "b", "a"]);
        let log = log.lock();
        assert_eq!(log[1].1, b"bee");
        assert_eq!(log[2].1, b"ay");
        assert!(*finished.lock());
    }

    #[test]
    fn interleaving_matches_direct_writes() {
        let contents: Vec<(&str, Vec<u8>)> = vec![
            ("one", vec![1u8; 10]),
            ("two", vec![2u8; 70_000]),
            ("three", b"third".to_vec()),
        ];

        let (direct, direct_log, _) = mux(DriverQuirks::default());
        for (name, data) in &contents {
            let mut writer = direct.output(file(name)).unwrap();
            writer.write_all(data).unwrap();
            writer.close().unwrap();
        }
        direct.close().unwrap();

        let (mixed, mixed_log, _) = mux(DriverQuirks::default());
        let mut writers: Vec<_> = contents.iter().map(|(name, _)| mixed.output(file(name)).unwrap()).collect();
        assert!(mixed.is_busy());
        for (writer, (_, data)) in writers.iter_mut().zip(&contents).rev() {
            writer.write_all(data).unwrap();
        }
        for writer in writers.iter_mut().rev() {
            writer.close().unwrap();
        }
        assert!(!mixed.is_busy());
        mixed.close().unwrap();

        assert_eq!(*direct_log.lock(), *mixed_log.lock());
    }

    #[test]
    fn unknown_size_is_buffered_when_required() {
        let quirks = DriverQuirks {
            requires_size: true,
            ..DriverQuirks::default()
        };
        let (mux, log, _) = mux(quirks);
        let mut writer = mux.output(file("data")).unwrap();
        writer.write_all(b"12345").unwrap();
        assert!(log.lock().is_empty());
        writer.close().unwrap();
        assert_eq!(names(&log), vec!["data"]);
        mux.close().unwrap();
    }

    #[test]
    fn close_refuses_open_writers_and_abandons_dropped_ones() {
        let (mux, log, _) = mux(DriverQuirks::default());
        let mut direct = mux.output(file("kept")).unwrap();
        let mut dropped = mux.output(file("dropped")).unwrap();
        dropped.write_all(b"lost").unwrap();
        assert!(mux.contains("dropped"));
        assert!(matches!(mux.close(), Err(FsError::Busy(_))));

        drop(dropped);
        assert!(!mux.contains("dropped"));
        direct.write_all(b"kept").unwrap();
        direct.close().unwrap();
        mux.close().unwrap();
        assert_eq!(names(&log), vec!["kept"]);
        assert!(matches!(mux.output(file("late")), Err(FsError::Consistency(_))));
    }

    #[test]
    fn direct_writer_dropped_before_writing_leaves_no_entry() {
        let (mux, log, _) = mux(DriverQuirks::default());
        let untouched = mux.output(file("untouched")).unwrap();
        assert!(mux.contains("untouched"));
        drop(untouched);
        assert!(!mux.contains("untouched"));
        assert!(!mux.is_busy());

        let mut started = mux.output(file("started")).unwrap();
        started.write_all(b"half").unwrap();
        drop(started);
        assert!(mux.contains("started"));

        let mut empty = mux.output(file("empty")).unwrap();
        empty.close().unwrap();
        mux.close().unwrap();

        let log = log.lock();
        let written: Vec<&str> = log.iter().map(|(name, _)| name.as_str()).collect();
        assert_eq!(written, vec!["started", "empty"]);
        assert_eq!(log[0].1, b"half");
        assert!(log[1].1.is_empty());
    }

    #[test]
    fn dropped_privileged_writer_keeps_others_waiting() {
        let quirks = DriverQuirks {
            privileged_entry: Some("mimetype"),
            ..DriverQuirks::default()
        };
        let (mux, log, _) = mux(quirks);
        drop(mux.output(file("mimetype")).unwrap());
        let mut other = mux.output(file("other")).unwrap();
        other.write_all(b"o").unwrap();
        other.close().unwrap();
        assert!(log.lock().is_empty());

        let mut mimetype = mux.output(file("mimetype")).unwrap();
        mimetype.write_all(b"text/plain").unwrap();
        mimetype.close().unwrap();
        mux.close().unwrap();
        assert_eq!(names(&log), vec!["mimetype", "other"]);
    }

    #[test]
    fn missing_privileged_entry_does_not_lose_others() {
        let quirks = DriverQuirks {
            privileged_entry: Some("mimetype"),
            ..DriverQuirks::default()
        };
        let (mux, log, _) = mux(quirks);
        let mut only = mux.output(file("content.xml")).unwrap();
        only.write_all(b"<doc/>").unwrap();
        only.close().unwrap();
        mux.close().unwrap();
        assert_eq!(names(&log), vec!["content.xml"]);
    }
}
