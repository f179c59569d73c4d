// Copyright 2025 Schelling Point Labs Inc
// SPDX-License-Identifier: AGPL-3.0-only

//! Per mount point filesystem model

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::address::MountPoint;

/// Lifecycle of a mount point as observed through its model.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MountState {
    Unmounted,
    Mounting,
    Mounted,
    Syncing,
    /// A sync failed part way; the next access remounts.
    Failed,
}

/// Mutable state shared by every controller layered on one mount point.
pub struct FsModel {
    mount_point: Arc<MountPoint>,
    parent: Option<Arc<FsModel>>,
    state: Mutex<MountState>,
}

impl FsModel {
    pub fn new(mount_point: Arc<MountPoint>, parent: Option<Arc<FsModel>>) -> Self {
        Self {
            mount_point,
            parent,
            state: Mutex::new(MountState::Unmounted),
        }
    }

    pub fn mount_point(&self) -> &Arc<MountPoint> {
        &self.mount_point
    }

    pub fn parent(&self) -> Option<&Arc<FsModel>> {
        self.parent.as_ref()
    }

    pub fn state(&self) -> MountState {
        *self.state.lock()
    }

    pub fn is_mounted(&self) -> bool {
        matches!(self.state(), MountState::Mounted | MountState::Syncing)
    }

    /// Callers must hold the write lock of a lockable model.
    pub fn set_mounted(&self, mounted: bool) {
        self.set_state(if mounted { MountState::Mounted } else { MountState::Unmounted });
    }

    pub fn set_state(&self, state: MountState) {
        let mut current = self.state.lock();
        if *current != state {
            tracing::trace!(mount_point = %self.mount_point, from = ?*current, to = ?state, "mount state");
            *current = state;
        }
    }
}

impl fmt::Debug for FsModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FsModel")
            .field("mount_point", &self.mount_point.as_str())
            .field("state", &self.state())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mounted_flag_tracks_state() {
        let mp = Arc::new(MountPoint::parse("zip:file:/tmp/a.zip!/").unwrap());
        let model = FsModel::new(mp, None);
        assert!(!model.is_mounted());
        model.set_state(MountState::Mounting);
        assert!(!model.is_mounted());
        model.set_mounted(true);
        assert!(model.is_mounted());
        model.set_state(MountState::Syncing);
        assert!(model.is_mounted());
        model.set_mounted(false);
        assert_eq!(model.state(), MountState::Unmounted);
    }
}
