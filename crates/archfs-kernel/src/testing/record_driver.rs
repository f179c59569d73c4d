// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use super::{CallLog, CountingController};
use crate::address::NodeName;
use crate::config::FsContext;
use crate::controller::{self, Controller, TargetArchiveController};
use crate::driver::{ArchiveDriver, DriverQuirks, InputArchive, OutputService};
use crate::error::{FsError, FsResult};
use crate::lock::LockModel;
use crate::model::FsModel;
use crate::pool::{IoBuffer, IoBufferPool};
use crate::types::{Entry, EntryType, InputStream, OutputStream};

const MAGIC: &[u8; 8] = b"ARCREC01";
const END: u8 = b'$';

/// Record archive layout:
///
/// ```text
/// magic
/// { kind:u8 name_len:u32 name mtime_flag:u8 [mtime_ms:u64] { chunk_len:u32 chunk } 0u32 }*
/// '$'
/// ```
///
/// All integers are little endian.
#[derive(Debug, Default, Clone)]
pub struct RecordDriver {
    quirks: DriverQuirks,
    log: Option<CallLog>,
}

impl RecordDriver {
    pub fn new() -> Self {
        Self::default()
    }

    /// Entry that has to come first in every archive written.
    pub fn with_privileged_entry(mut self, name: &'static str) -> Self {
        self.quirks.privileged_entry = Some(name);
        self
    }

    /// Refuses to begin entries of unknown size, like formats with sized headers.
    pub fn requiring_size(mut self) -> Self {
        self.quirks.requires_size = true;
        self
    }

    /// Mounts archives but refuses every change to them.
    pub fn read_only(mut self) -> Self {
        self.quirks.read_only = true;
        self
    }

    /// Logs every call made on chains built by this driver.
    pub fn with_call_log(mut self, log: CallLog) -> Self {
        self.log = Some(log);
        self
    }

    /// Encodes `entries` as an archive, for seeding test fixtures. `None`
    /// contents make a directory.
    pub fn encode(entries: &[(&str, Option<&[u8]>)]) -> FsResult<Vec<u8>> {
        let mut out = RecordOutput {
            sink: Vec::new(),
            requires_size: false,
            expected: None,
            written: 0,
        };
        out.sink.write_all(MAGIC)?;
        for (name, data) in entries {
            let name = NodeName::new(name)?;
            let entry = match data {
                Some(data) => Entry::file(name, Some(data.len() as u64)),
                None => Entry::directory(name),
            };
            out.begin_entry(&entry)?;
            if let Some(data) = data {
                out.write_chunk(data)?;
            }
            out.end_entry()?;
        }
        out.sink.push(END);
        Ok(out.sink)
    }
}

impl ArchiveDriver for RecordDriver {
    fn quirks(&self) -> DriverQuirks {
        self.quirks
    }

    fn new_input(
        &self,
        model: &FsModel,
        mut source: InputStream,
        pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn InputArchive>> {
        let input = RecordInput::read(&mut source, pool).map_err(|err| match err {
            FsError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof || io.kind() == io::ErrorKind::InvalidData => {
                FsError::NotAnArchive(format!("{}: {}", model.mount_point(), io))
            }
            other => other,
        })?;
        Ok(Box::new(input))
    }

    fn new_output(
        &self,
        _model: &FsModel,
        mut sink: Box<dyn OutputStream>,
        _pool: &Arc<dyn IoBufferPool>,
    ) -> FsResult<Box<dyn OutputService>> {
        sink.write_all(MAGIC)?;
        Ok(Box::new(RecordOutput {
            sink,
            requires_size: self.quirks.requires_size,
            expected: None,
            written: 0,
        }))
    }

    fn new_controller(
        &self,
        target: TargetArchiveController,
        lock_model: Arc<LockModel>,
        context: &FsContext,
    ) -> Arc<dyn Controller> {
        let chain = controller::decorate(target, lock_model, context);
        match &self.log {
            Some(log) => Arc::new(CountingController::new(chain, log.clone())),
            None => chain,
        }
    }
}

fn invalid(message: &str) -> FsError {
    FsError::Io(io::Error::new(io::ErrorKind::InvalidData, message.to_string()))
}

fn read_u8(source: &mut dyn Read) -> FsResult<u8> {
    let mut buf = [0u8; 1];
    source.read_exact(&mut buf)?;
    Ok(buf[0])
}

fn read_u32(source: &mut dyn Read) -> FsResult<u32> {
    let mut buf = [0u8; 4];
    source.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

fn read_u64(source: &mut dyn Read) -> FsResult<u64> {
    let mut buf = [0u8; 8];
    source.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

struct RecordInput {
    entries: Vec<Entry>,
    contents: HashMap<String, IoBuffer>,
}

impl RecordInput {
    fn read(source: &mut dyn Read, pool: &Arc<dyn IoBufferPool>) -> FsResult<Self> {
        let mut magic = [0u8; 8];
        source.read_exact(&mut magic)?;
        if &magic != MAGIC {
            return Err(invalid("bad record archive magic"));
        }
        let mut entries = Vec::new();
        let mut contents = HashMap::new();
        loop {
            let kind = match read_u8(source)? {
                END => break,
                b'F' => EntryType::File,
                b'D' => EntryType::Directory,
                b'S' => EntryType::Special,
                _ => return Err(invalid("unknown record kind")),
            };
            let len = read_u32(source)? as usize;
            let mut name = vec![0u8; len];
            source.read_exact(&mut name)?;
            let name = String::from_utf8(name).map_err(|_| invalid("entry name is not UTF-8"))?;
            let name = NodeName::new(&name)?;
            let modified = match read_u8(source)? {
                0 => None,
                _ => Some(UNIX_EPOCH + Duration::from_millis(read_u64(source)?)),
            };
            let mut buffer = pool.allocate()?;
            loop {
                let chunk = read_u32(source)? as u64;
                if chunk == 0 {
                    break;
                }
                let copied = io::copy(&mut (&mut *source).take(chunk), &mut buffer)?;
                if copied != chunk {
                    return Err(FsError::Io(io::ErrorKind::UnexpectedEof.into()));
                }
            }
            let size = match kind {
                EntryType::Directory => None,
                _ => Some(buffer.len()),
            };
            entries.push(Entry {
                name: name.clone(),
                kind,
                size,
                modified,
            });
            if kind == EntryType::File {
                contents.insert(name.as_str().to_string(), buffer);
            }
        }
        Ok(Self { entries, contents })
    }
}

impl InputArchive for RecordInput {
    fn entries(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    fn open(&mut self, name: &NodeName) -> FsResult<InputStream> {
        self.contents
            .get(name.as_str())
            .ok_or_else(|| FsError::NotFound(name.to_string()))?
            .reader()
    }

    fn close(&mut self) -> FsResult<()> {
        for (_, buffer) in self.contents.drain() {
            buffer.release();
        }
        Ok(())
    }
}

struct RecordOutput<W: Write> {
    sink: W,
    requires_size: bool,
    expected: Option<u64>,
    written: u64,
}

impl<W: Write> RecordOutput<W> {
    fn begin_entry(&mut self, entry: &Entry) -> FsResult<()> {
        if self.requires_size && entry.is_file() && entry.size.is_none() {
            return Err(FsError::Unsupported(format!("size of {} must be known in advance", entry.name)));
        }
        let kind = match entry.kind {
            EntryType::File => b'F',
            EntryType::Directory => b'D',
            EntryType::Special => b'S',
        };
        let name = entry.name.as_str().as_bytes();
        self.sink.write_all(&[kind])?;
        self.sink.write_all(&(name.len() as u32).to_le_bytes())?;
        self.sink.write_all(name)?;
        match entry.modified.and_then(|t| t.duration_since(UNIX_EPOCH).ok()) {
            Some(since_epoch) => {
                self.sink.write_all(&[1])?;
                self.sink.write_all(&(since_epoch.as_millis() as u64).to_le_bytes())?;
            }
            None => self.sink.write_all(&[0])?,
        }
        self.expected = if self.requires_size { entry.size } else { None };
        self.written = 0;
        Ok(())
    }

    fn write_chunk(&mut self, buf: &[u8]) -> FsResult<()> {
        if buf.is_empty() {
            return Ok(());
        }
        self.sink.write_all(&(buf.len() as u32).to_le_bytes())?;
        self.sink.write_all(buf)?;
        self.written += buf.len() as u64;
        Ok(())
    }

    fn end_entry(&mut self) -> FsResult<()> {
        if let Some(expected) = self.expected.take() {
            if expected != self.written {
                return Err(FsError::Consistency(format!(
                    "entry announced {} bytes but {} were written",
                    expected, self.written
                )));
            }
        }
        self.sink.write_all(&0u32.to_le_bytes())?;
        Ok(())
    }
}

impl OutputService for RecordOutput<Box<dyn OutputStream>> {
    fn begin(&mut self, entry: &Entry) -> FsResult<()> {
        self.begin_entry(entry)
    }

    fn write(&mut self, buf: &[u8]) -> FsResult<()> {
        self.write_chunk(buf)
    }

    fn end(&mut self) -> FsResult<()> {
        self.end_entry()
    }

    fn finish(mut self: Box<Self>) -> FsResult<()> {
        self.sink.write_all(&[END])?;
        self.sink.close()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::MountPoint;
    use crate::pool::MemoryBufferPool;

    fn model() -> FsModel {
        FsModel::new(Arc::new(MountPoint::parse("rec:file:/tmp/a.rec!/").unwrap()), None)
    }

    #[test]
    fn encoded_archives_are_readable() {
        let bytes = RecordDriver::encode(&[("dir", None), ("dir/a.txt", Some(b"alpha".as_slice()))]).unwrap();
        let pool: Arc<dyn IoBufferPool> = Arc::new(MemoryBufferPool::new());
        let mut input = RecordDriver::new()
            .new_input(&model(), Box::new(io::Cursor::new(bytes)), &pool)
            .unwrap();
        let entries = input.entries();
        assert_eq!(entries.len(), 2);
        assert!(entries[0].is_directory());
        assert_eq!(entries[1].size, Some(5));
        let mut text = String::new();
        input
            .open(&NodeName::new("dir/a.txt").unwrap())
            .unwrap()
            .read_to_string(&mut text)
            .unwrap();
        assert_eq!(text, "alpha");
    }

    #[test]
    fn garbage_is_not_an_archive() {
        let pool: Arc<dyn IoBufferPool> = Arc::new(MemoryBufferPool::new());
        let result = RecordDriver::new().new_input(&model(), Box::new(io::Cursor::new(b"PK\x03\x04".to_vec())), &pool);
        assert!(matches!(result, Err(FsError::NotAnArchive(_))));
    }
}
