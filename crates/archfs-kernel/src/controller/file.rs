// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Platform controller backed by the host filesystem

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use tempfile::NamedTempFile;

use super::Controller;
use crate::address::NodeName;
use crate::error::{FsError, FsResult};
use crate::model::FsModel;
use crate::types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};

/// Lock-free controller for a `file:` mount point.
pub struct FileController {
    model: Arc<FsModel>,
    root: PathBuf,
}

impl FileController {
    pub fn new(model: Arc<FsModel>) -> Self {
        let root = PathBuf::from(model.mount_point().path());
        model.set_mounted(true);
        Self { model, root }
    }

    fn resolve(&self, name: &NodeName) -> PathBuf {
        if name.is_root() {
            self.root.clone()
        } else {
            self.root.join(name.as_str())
        }
    }

    fn ensure_parent_dir(&self, options: AccessOptions, path: &Path) -> FsResult<PathBuf> {
        let parent = path.parent().map(Path::to_path_buf).unwrap_or_else(|| self.root.clone());
        if !parent.is_dir() {
            if !options.create_parents {
                return Err(FsError::NotFound(parent.display().to_string()));
            }
            fs::create_dir_all(&parent).map_err(|err| map_io(&parent, err))?;
        }
        Ok(parent)
    }
}

fn map_io(path: &Path, err: io::Error) -> FsError {
    match err.kind() {
        io::ErrorKind::NotFound => FsError::NotFound(path.display().to_string()),
        io::ErrorKind::AlreadyExists => FsError::AlreadyExists(path.display().to_string()),
        _ => FsError::Io(err),
    }
}

fn entry_from_metadata(name: NodeName, metadata: &fs::Metadata) -> Entry {
    let kind = if metadata.is_file() {
        EntryType::File
    } else if metadata.is_dir() {
        EntryType::Directory
    } else {
        EntryType::Special
    };
    Entry {
        name,
        kind,
        size: metadata.is_file().then(|| metadata.len()),
        modified: metadata.modified().ok(),
    }
}

impl Controller for FileController {
    fn model(&self) -> &Arc<FsModel> {
        &self.model
    }

    fn parent(&self) -> Option<&Arc<dyn Controller>> {
        None
    }

    fn node(&self, _options: AccessOptions, name: &NodeName) -> FsResult<Option<Entry>> {
        let path = self.resolve(name);
        match fs::metadata(&path) {
            Ok(metadata) => Ok(Some(entry_from_metadata(name.clone(), &metadata))),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(map_io(&path, err)),
        }
    }

    fn list(&self, _options: AccessOptions, name: &NodeName) -> FsResult<Vec<Entry>> {
        let path = self.resolve(name);
        let metadata = fs::metadata(&path).map_err(|err| map_io(&path, err))?;
        if !metadata.is_dir() {
            return Err(FsError::NotADirectory(path.display().to_string()));
        }
        let mut entries = Vec::new();
        for dir_entry in fs::read_dir(&path).map_err(|err| map_io(&path, err))? {
            let dir_entry = dir_entry?;
            let file_name = dir_entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                tracing::debug!(path = %path.display(), "skipping non UTF-8 file name");
                continue;
            };
            let child = name.join(file_name)?;
            entries.push(entry_from_metadata(child, &dir_entry.metadata()?));
        }
        entries.sort_by(|a, b| a.name.as_str().cmp(b.name.as_str()));
        Ok(entries)
    }

    fn input(&self, _options: AccessOptions, name: &NodeName) -> FsResult<InputStream> {
        let path = self.resolve(name);
        if path.is_dir() {
            return Err(FsError::IsADirectory(path.display().to_string()));
        }
        let file = File::open(&path).map_err(|err| map_io(&path, err))?;
        Ok(Box::new(file))
    }

    fn output(
        &self,
        options: AccessOptions,
        name: &NodeName,
        template: Option<&Entry>,
    ) -> FsResult<Box<dyn OutputStream>> {
        let path = self.resolve(name);
        if path.is_dir() {
            return Err(FsError::IsADirectory(path.display().to_string()));
        }
        if options.exclusive && path.exists() {
            return Err(FsError::AlreadyExists(path.display().to_string()));
        }
        let dir = self.ensure_parent_dir(options, &path)?;
        // Written next to the target and renamed over it on close.
        let temp = NamedTempFile::new_in(&dir).map_err(|err| map_io(&dir, err))?;
        Ok(Box::new(FileOutput {
            temp: Some(temp),
            target: path,
            modified: template.and_then(|t| t.modified),
        }))
    }

    fn make(
        &self,
        options: AccessOptions,
        name: &NodeName,
        kind: EntryType,
        template: Option<&Entry>,
    ) -> FsResult<()> {
        let path = self.resolve(name);
        match kind {
            EntryType::Directory => {
                if path.is_dir() && !options.exclusive {
                    return Ok(());
                }
                if path.exists() {
                    return Err(FsError::AlreadyExists(path.display().to_string()));
                }
                self.ensure_parent_dir(options, &path)?;
                fs::create_dir(&path).map_err(|err| map_io(&path, err))
            }
            EntryType::File => {
                if path.is_dir() {
                    return Err(FsError::IsADirectory(path.display().to_string()));
                }
                self.ensure_parent_dir(options, &path)?;
                let mut open = OpenOptions::new();
                open.write(true);
                if options.exclusive {
                    open.create_new(true);
                } else {
                    open.create(true).truncate(true);
                }
                let file = open.open(&path).map_err(|err| map_io(&path, err))?;
                if let Some(modified) = template.and_then(|t| t.modified) {
                    file.set_modified(modified)?;
                }
                Ok(())
            }
            EntryType::Special => Err(FsError::Unsupported(format!(
                "cannot create special file {}",
                path.display()
            ))),
        }
    }

    fn unlink(&self, _options: AccessOptions, name: &NodeName) -> FsResult<()> {
        let path = self.resolve(name);
        let metadata = fs::metadata(&path).map_err(|err| map_io(&path, err))?;
        if metadata.is_dir() {
            if fs::read_dir(&path)?.next().is_some() {
                return Err(FsError::DirectoryNotEmpty(path.display().to_string()));
            }
            fs::remove_dir(&path).map_err(|err| map_io(&path, err))
        } else {
            fs::remove_file(&path).map_err(|err| map_io(&path, err))
        }
    }

    fn set_time(&self, _options: AccessOptions, name: &NodeName, modified: SystemTime) -> FsResult<()> {
        let path = self.resolve(name);
        let file = File::open(&path).map_err(|err| map_io(&path, err))?;
        file.set_modified(modified)?;
        Ok(())
    }

    fn sync(&self, _options: SyncOptions) -> FsResult<()> {
        Ok(())
    }
}

struct FileOutput {
    temp: Option<NamedTempFile>,
    target: PathBuf,
    modified: Option<SystemTime>,
}

impl Write for FileOutput {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.temp.as_mut() {
            Some(temp) => temp.write(buf),
            None => Err(io::Error::new(io::ErrorKind::Other, "output closed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.temp.as_mut() {
            Some(temp) => temp.flush(),
            None => Ok(()),
        }
    }
}

impl OutputStream for FileOutput {
    fn close(&mut self) -> FsResult<()> {
        let Some(mut temp) = self.temp.take() else {
            return Ok(());
        };
        temp.flush()?;
        let file = temp.persist(&self.target).map_err(|err| map_io(&self.target, err.error))?;
        if let Some(modified) = self.modified {
            file.set_modified(modified)?;
        }
        tracing::trace!(path = %self.target.display(), "replaced file");
        Ok(())
    }
}
