// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, UNIX_EPOCH};

use archfs_kernel::driver::InputArchive;
use archfs_kernel::{Entry, EntryType, FsError, FsResult, InputStream, IoBuffer, IoBufferPool, NodeName};

/// A fully loaded TAR archive.
pub(crate) struct TarInput {
    entries: Vec<Entry>,
    contents: HashMap<String, IoBuffer>,
}

impl TarInput {
    pub(crate) fn read(source: InputStream, pool: &Arc<dyn IoBufferPool>) -> FsResult<Self> {
        let mut archive = tar::Archive::new(source);
        let mut entries: Vec<Entry> = Vec::new();
        let mut index: HashMap<String, usize> = HashMap::new();
        let mut contents = HashMap::new();

        for entry in archive.entries()? {
            let mut entry = entry?;
            let raw_path = entry.path()?.to_string_lossy().into_owned();
            let name = match NodeName::new(&raw_path) {
                Ok(name) if !name.is_root() => name,
                Ok(_) => continue,
                Err(err) => {
                    tracing::warn!(path = %raw_path, error = %err, "skipping tar entry with unusable name");
                    continue;
                }
            };
            let header = entry.header();
            let kind = match header.entry_type() {
                tar::EntryType::Regular | tar::EntryType::Continuous => EntryType::File,
                tar::EntryType::Directory => EntryType::Directory,
                _ => EntryType::Special,
            };
            let modified = header.mtime().ok().map(|secs| UNIX_EPOCH + Duration::from_secs(secs));
            let size = match kind {
                EntryType::Directory => None,
                _ => Some(entry.size()),
            };

            if kind == EntryType::File {
                let mut buffer = pool.allocate()?;
                buffer.fill_from(&mut entry)?;
                if let Some(previous) = contents.insert(name.as_str().to_string(), buffer) {
                    previous.release();
                }
            }

            let record = Entry {
                name: name.clone(),
                kind,
                size,
                modified,
            };
            // Later entries replace earlier ones of the same name.
            match index.get(name.as_str()) {
                Some(&at) => entries[at] = record,
                None => {
                    index.insert(name.as_str().to_string(), entries.len());
                    entries.push(record);
                }
            }
        }
        Ok(Self { entries, contents })
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }
}

impl InputArchive for TarInput {
    fn entries(&self) -> Vec<Entry> {
        self.entries.clone()
    }

    fn open(&mut self, name: &NodeName) -> FsResult<InputStream> {
        match self.contents.get(name.as_str()) {
            Some(buffer) => buffer.reader(),
            None => Err(FsError::NotFound(name.to_string())),
        }
    }

    fn close(&mut self) -> FsResult<()> {
        for (_, buffer) in self.contents.drain() {
            buffer.release();
        }
        Ok(())
    }
}
