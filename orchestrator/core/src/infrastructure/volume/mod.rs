// Copyright (c) 2026 SecFlow Contributors
// SPDX-License-Identifier: AGPL-3.0

//! Isolated volume backends
//!
//! - [`local`]: host scratch directories, bind mounted (Docker only)
//! - [`configmap`]: Kubernetes ConfigMaps (cluster only)
//! - [`object_store`]: SeaweedFS filer prefixes behind a volume/CSI driver

pub mod configmap;
pub mod local;
pub mod object_store;

pub use configmap::{ConfigMapVolume, ConfigMapVolumeProvider};
pub use local::{LocalVolume, LocalVolumeProvider};
pub use object_store::{ObjectStoreVolume, ObjectStoreVolumeProvider};

use parking_lot::Mutex;

use crate::domain::naming::label_value;
use crate::domain::volume::{VolumeError, VolumeScope};

/// Where a volume is in its lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Lifecycle<T> {
    Fresh,
    Ready(T),
    Released,
}

/// Lifecycle cell shared by the backends. `T` is the backend handle
/// (directory, object name, prefix) recorded by a successful initialize.
#[derive(Debug)]
pub(crate) struct VolumeState<T: Clone>(Mutex<Lifecycle<T>>);

impl<T: Clone> VolumeState<T> {
    pub(crate) fn new() -> Self {
        Self(Mutex::new(Lifecycle::Fresh))
    }

    pub(crate) fn ensure_fresh(&self, scope: &VolumeScope) -> Result<(), VolumeError> {
        match &*self.0.lock() {
            Lifecycle::Fresh => Ok(()),
            _ => Err(VolumeError::AlreadyInitialized(scope.leaf_name())),
        }
    }

    pub(crate) fn set_ready(&self, handle: T) {
        *self.0.lock() = Lifecycle::Ready(handle);
    }

    pub(crate) fn ready(&self) -> Option<T> {
        match &*self.0.lock() {
            Lifecycle::Ready(handle) => Some(handle.clone()),
            _ => None,
        }
    }

    pub(crate) fn require_ready(&self, scope: &VolumeScope) -> Result<T, VolumeError> {
        self.ready()
            .ok_or_else(|| VolumeError::NotInitialized(scope.leaf_name()))
    }

    /// Marks the volume released and returns the handle if there was one
    /// to release. Later calls return `None`.
    pub(crate) fn release(&self) -> Option<T> {
        match std::mem::replace(&mut *self.0.lock(), Lifecycle::Released) {
            Lifecycle::Ready(handle) => Some(handle),
            _ => None,
        }
    }
}

/// `<tenant>/<run>` path segments, safe for directories and object prefixes.
pub(crate) fn scope_segments(scope: &VolumeScope) -> (String, String) {
    (label_value(scope.tenant.as_str()), label_value(scope.run_id.as_str()))
}
