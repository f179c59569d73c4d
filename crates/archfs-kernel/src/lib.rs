// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Federated virtual filesystem kernel
//!
//! Every archive file, at any nesting depth, is a mount point served by its
//! own controller chain. Chains of nested archives talk to the chain of their
//! enclosing mount point, down to the host filesystem. The [`FsManager`]
//! keeps one chain per mount point and syncs them deepest first.
//!
//! ```text
//! FsManager
//!   tar.gz:zip:file:/tmp/outer.zip!/inner.tar.gz!/   Sync -> Lock -> Resource -> Cache -> Target(tar.gz)
//!   zip:file:/tmp/outer.zip!/                         Sync -> Lock -> Resource -> Cache -> Target(zip)
//!   file:/tmp/                                        File
//! ```

pub mod address;
pub mod config;
pub mod controller;
pub mod driver;
pub mod error;
pub mod keys;
pub mod lock;
pub mod manager;
pub mod model;
pub mod mux;
pub mod pool;
pub mod scanner;
pub mod testing;
pub mod types;

pub use address::{AddressError, MountPoint, NodeName, NodePath, Scheme};
pub use config::{FsContext, KernelConfig};
pub use controller::Controller;
pub use driver::{ArchiveDriver, DriverQuirks, DriverRegistry, InputArchive, OutputService};
pub use error::{FsError, FsResult, SyncAggregate};
pub use manager::FsManager;
pub use model::{FsModel, MountState};
pub use pool::{IoBuffer, IoBufferPool};
pub use types::{AccessOptions, Entry, EntryType, InputStream, OutputStream, SyncOptions};
