// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The matrix handle registry.
//!
//! The registry is the driver's only record of what exists in the cluster:
//! for every handle ever given to the client, the shape the matrix was
//! declared with and the partition layout it was created from. Entries are
//! never mutated or removed.

use std::collections::BTreeMap;

use alchemist_protocol::command::MatrixHandle;
use thiserror::Error;

/// The first handle allocated when no other seed is configured.
pub const DEFAULT_FIRST_HANDLE: u32 = 42;

/// Error returned in response to a request to register a handle that is
/// already registered.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("matrix exists already: {0}")]
pub struct HandleExists(pub MatrixHandle);

/// Error returned in response to a reference to an unknown handle.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("matrix does not exist: {0}")]
pub struct HandleMissing(pub MatrixHandle);

/// Error returned when every handle has been allocated.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("matrix handles exhausted")]
pub struct HandlesExhausted;

/// What the driver knows about one matrix.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MatrixEntry {
    /// The matrix's handle.
    pub handle: MatrixHandle,
    /// The number of rows.
    pub num_rows: u64,
    /// The number of columns.
    pub num_cols: u64,
    /// The partition layout the matrix was created with. For derived
    /// matrices, whose physical layout is chosen by the workers, this is
    /// [`MatrixEntry::PLACEHOLDER_LAYOUT`].
    pub layout: Vec<u32>,
}

impl MatrixEntry {
    /// The layout recorded for matrices whose layout the driver does not know.
    pub const PLACEHOLDER_LAYOUT: [u32; 1] = [0];
}

/// Allocates matrix handles and records their entries.
#[derive(Debug)]
pub struct Registry {
    /// The next handle to allocate, or `None` once the space is used up.
    next_id: Option<u32>,
    entries: BTreeMap<MatrixHandle, MatrixEntry>,
}

impl Default for Registry {
    fn default() -> Registry {
        Registry::new(DEFAULT_FIRST_HANDLE)
    }
}

impl Registry {
    /// Creates an empty registry whose first allocated handle is `first_id`.
    pub fn new(first_id: u32) -> Registry {
        Registry {
            next_id: Some(first_id),
            entries: BTreeMap::new(),
        }
    }

    /// Allocates a new handle and advances the allocator.
    ///
    /// Handles are strictly increasing and never reused, whether or not they
    /// end up registered.
    pub fn allocate(&mut self) -> Result<MatrixHandle, HandlesExhausted> {
        let id = self.next_id.ok_or(HandlesExhausted)?;
        self.next_id = id.checked_add(1);
        Ok(MatrixHandle(id))
    }

    /// Registers an entry under its handle.
    pub fn insert(&mut self, entry: MatrixEntry) -> Result<(), HandleExists> {
        let handle = entry.handle;
        if self.entries.contains_key(&handle) {
            return Err(HandleExists(handle));
        }
        self.entries.insert(handle, entry);
        Ok(())
    }

    /// Looks up the entry for a handle.
    pub fn lookup(&self, handle: MatrixHandle) -> Result<&MatrixEntry, HandleMissing> {
        self.entries.get(&handle).ok_or(HandleMissing(handle))
    }

    /// Returns the number of registered matrices.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Reports whether no matrix is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
