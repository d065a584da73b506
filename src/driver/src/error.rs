// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Errors returned by the driver.
//!
//! Every error is fatal to the session. The variants exist to tell the
//! operator what went wrong, not to let callers recover.

use alchemist_protocol::codec::CodecError;
use alchemist_protocol::command::{MatrixHandle, UnknownOpcode};
use thiserror::Error;

use crate::registry::{HandleExists, HandleMissing, HandlesExhausted};

/// Error returned when the client opens the session with an unexpected value.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("handshake failed: expected {field} {expected:#x}, got {actual:#x}")]
pub struct HandshakeError {
    /// The handshake field that did not match.
    pub field: &'static str,
    /// The value this driver requires.
    pub expected: u32,
    /// The value the client sent.
    pub actual: u32,
}

/// Errors that end a driver session.
#[derive(Error, Debug)]
pub enum DriverError {
    /// Reading from or writing to the client failed.
    #[error("client connection: {0}")]
    Codec(#[from] CodecError),
    /// The client failed the handshake.
    #[error(transparent)]
    Handshake(#[from] HandshakeError),
    /// The client sent an opcode this driver does not understand.
    #[error(transparent)]
    UnknownOpcode(#[from] UnknownOpcode),
    /// A handle was registered twice.
    #[error(transparent)]
    HandleExists(#[from] HandleExists),
    /// A request referenced a handle that was never registered.
    #[error(transparent)]
    HandleMissing(#[from] HandleMissing),
    /// The handle space is used up.
    #[error(transparent)]
    HandlesExhausted(#[from] HandlesExhausted),
    /// A partition layout does not assign exactly one partition per worker.
    #[error("layout has {len} partitions, but the pool has {workers} workers")]
    LayoutMismatch {
        /// The number of partitions in the layout.
        len: usize,
        /// The number of workers in the pool.
        workers: usize,
    },
    /// The operands of a multiplication have incompatible shapes.
    #[error(
        "cannot multiply {left} ({left_rows}x{left_cols}) by {right} ({right_rows}x{right_cols})"
    )]
    DimensionMismatch {
        left: MatrixHandle,
        left_rows: u64,
        left_cols: u64,
        right: MatrixHandle,
        right_rows: u64,
        right_cols: u64,
    },
    /// Communicating with the worker pool failed.
    #[error("worker pool: {0:#}")]
    Worker(anyhow::Error),
}

impl DriverError {
    /// Reports whether the error was caused by the client stream ending.
    pub fn is_client_eof(&self) -> bool {
        matches!(self, DriverError::Codec(CodecError::UnexpectedEof))
    }
}
