// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::io::{self, Write};
use std::time::UNIX_EPOCH;

use archfs_kernel::driver::OutputService;
use archfs_kernel::{Entry, EntryType, FsError, FsResult, OutputStream};
use flate2::write::GzEncoder;

const BLOCK: u64 = 512;
const NAME_FIELD: usize = 100;
const LONG_LINK: &str = "././@LongLink";

pub(crate) enum TarSink {
    Plain(Box<dyn OutputStream>),
    Gzip(GzEncoder<Box<dyn OutputStream>>),
}

impl TarSink {
    /// Flushes compression state and closes the parent stream.
    fn close(self) -> FsResult<()> {
        let mut sink = match self {
            TarSink::Plain(sink) => sink,
            TarSink::Gzip(encoder) => encoder.finish()?,
        };
        sink.close()
    }
}

impl Write for TarSink {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            TarSink::Plain(sink) => sink.write(buf),
            TarSink::Gzip(encoder) => encoder.write(buf),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            TarSink::Plain(sink) => sink.flush(),
            TarSink::Gzip(encoder) => encoder.flush(),
        }
    }
}

struct Current {
    name: String,
    expected: u64,
    written: u64,
}

/// Streams entries as GNU tar records.
pub(crate) struct TarOutput {
    sink: TarSink,
    current: Option<Current>,
}

impl TarOutput {
    pub(crate) fn new(sink: TarSink) -> Self {
        Self { sink, current: None }
    }

    fn pad(&mut self, written: u64) -> io::Result<()> {
        let rem = written % BLOCK;
        if rem != 0 {
            self.sink.write_all(&[0u8; BLOCK as usize][..(BLOCK - rem) as usize])?;
        }
        Ok(())
    }

    fn write_header(&mut self, header: &mut tar::Header, name: &str) -> io::Result<()> {
        let bytes = name.as_bytes();
        if bytes.len() > NAME_FIELD {
            let mut long = tar::Header::new_gnu();
            set_name(&mut long, LONG_LINK.as_bytes());
            long.set_mode(0o644);
            long.set_uid(0);
            long.set_gid(0);
            long.set_mtime(0);
            long.set_size(bytes.len() as u64 + 1);
            long.set_entry_type(tar::EntryType::GNULongName);
            long.set_cksum();
            self.sink.write_all(long.as_bytes())?;
            self.sink.write_all(bytes)?;
            self.sink.write_all(&[0])?;
            self.pad(bytes.len() as u64 + 1)?;
        }
        set_name(header, &bytes[..bytes.len().min(NAME_FIELD)]);
        header.set_cksum();
        self.sink.write_all(header.as_bytes())
    }
}

fn set_name(header: &mut tar::Header, name: &[u8]) {
    let field = &mut header.as_old_mut().name;
    field.fill(0);
    field[..name.len()].copy_from_slice(name);
}

impl OutputService for TarOutput {
    fn begin(&mut self, entry: &Entry) -> FsResult<()> {
        if self.current.is_some() {
            return Err(FsError::Consistency(format!("tar entry {} begun inside another", entry.name)));
        }
        let mut header = tar::Header::new_gnu();
        let (name, size) = match entry.kind {
            EntryType::File => {
                let size = entry.size.ok_or_else(|| {
                    FsError::Unsupported(format!("size of tar entry {} must be known in advance", entry.name))
                })?;
                header.set_entry_type(tar::EntryType::Regular);
                header.set_mode(0o644);
                (entry.name.as_str().to_string(), size)
            }
            EntryType::Directory => {
                header.set_entry_type(tar::EntryType::Directory);
                header.set_mode(0o755);
                (format!("{}/", entry.name), 0)
            }
            EntryType::Special => {
                return Err(FsError::Unsupported(format!("cannot write special tar entry {}", entry.name)));
            }
        };
        let mtime = entry
            .modified
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_secs())
            .unwrap_or(0);
        header.set_size(size);
        header.set_mtime(mtime);
        header.set_uid(0);
        header.set_gid(0);
        self.write_header(&mut header, &name)?;
        self.current = Some(Current {
            name,
            expected: size,
            written: 0,
        });
        Ok(())
    }

    fn write(&mut self, buf: &[u8]) -> FsResult<()> {
        let current = self
            .current
            .as_mut()
            .ok_or_else(|| FsError::Consistency("tar data written outside an entry".into()))?;
        current.written += buf.len() as u64;
        if current.written > current.expected {
            return Err(FsError::Consistency(format!(
                "tar entry {} exceeds its announced size of {} bytes",
                current.name, current.expected
            )));
        }
        self.sink.write_all(buf)?;
        Ok(())
    }

    fn end(&mut self) -> FsResult<()> {
        let current = self
            .current
            .take()
            .ok_or_else(|| FsError::Consistency("tar entry ended twice".into()))?;
        if current.written != current.expected {
            return Err(FsError::Consistency(format!(
                "tar entry {} announced {} bytes but {} were written",
                current.name, current.expected, current.written
            )));
        }
        self.pad(current.written)?;
        Ok(())
    }

    fn finish(mut self: Box<Self>) -> FsResult<()> {
        if let Some(current) = self.current.take() {
            return Err(FsError::Consistency(format!("tar entry {} was never ended", current.name)));
        }
        self.sink.write_all(&[0u8; 2 * BLOCK as usize])?;
        let TarOutput { sink, .. } = *self;
        sink.close()
    }
}
