// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Driver commands and the identifiers they carry.

use std::fmt;

use proptest_derive::Arbitrary;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The magic number a client opens the handshake with.
pub const CLIENT_MAGIC: u32 = 0xABCD;

/// The magic number the driver answers the handshake with.
pub const DRIVER_MAGIC: u32 = 0xDCBA;

/// The client protocol version spoken by this driver.
pub const PROTOCOL_VERSION: u32 = 0x1;

/// The status code that begins every successful response.
pub const STATUS_OK: u32 = 0x1;

/// An opaque identifier for a logical matrix known to the cluster.
#[derive(
    Arbitrary, Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct MatrixHandle(pub u32);

impl MatrixHandle {
    /// Returns the raw identifier sent over the wire.
    pub fn id(&self) -> u32 {
        self.0
    }
}

impl fmt::Display for MatrixHandle {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "m{}", self.0)
    }
}

/// The network endpoint of a worker, announced once at startup.
///
/// A worker's index in the pool is its rank.
#[derive(Arbitrary, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkerInfo {
    /// The hostname the client should use to reach the worker.
    pub hostname: String,
    /// The port the worker listens on for row data.
    pub port: u16,
}

/// Request opcodes of the client protocol.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Opcode {
    /// Create a matrix from a shape and a partition layout.
    NewMatrix,
    /// Multiply two existing matrices into a new one.
    MatrixMultiply,
    /// Report the shape of an existing matrix.
    MatrixDims,
    /// Ship the rows of an existing matrix back to the client.
    GetMatrixRows,
    /// Shut the cluster down.
    Halt,
}

/// Error returned for an opcode this driver does not understand.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("unknown opcode: {0:#x}")]
pub struct UnknownOpcode(pub u32);

impl Opcode {
    /// Returns the wire encoding of the opcode.
    pub fn code(&self) -> u32 {
        match self {
            Opcode::NewMatrix => 0x1,
            Opcode::MatrixMultiply => 0x2,
            Opcode::MatrixDims => 0x3,
            Opcode::GetMatrixRows => 0x4,
            Opcode::Halt => 0xFFFF_FFFF,
        }
    }
}

impl TryFrom<u32> for Opcode {
    type Error = UnknownOpcode;

    fn try_from(code: u32) -> Result<Opcode, UnknownOpcode> {
        match code {
            0x1 => Ok(Opcode::NewMatrix),
            0x2 => Ok(Opcode::MatrixMultiply),
            0x3 => Ok(Opcode::MatrixDims),
            0x4 => Ok(Opcode::GetMatrixRows),
            0xFFFF_FFFF => Ok(Opcode::Halt),
            code => Err(UnknownOpcode(code)),
        }
    }
}

/// A command broadcast from the driver to every worker.
///
/// Commands carry only identifiers and metadata. Matrix contents travel
/// directly between the client and the workers.
#[derive(Arbitrary, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Allocate storage for a new matrix and prepare to receive its rows.
    ///
    /// `layout[i]` is the number of rows assigned to the worker of rank `i`.
    NewMatrix {
        handle: MatrixHandle,
        num_rows: u64,
        num_cols: u64,
        layout: Vec<u32>,
    },
    /// Compute `dest = left * right`.
    MatrixMultiply {
        dest: MatrixHandle,
        left: MatrixHandle,
        right: MatrixHandle,
    },
    /// Redistribute the rows of a matrix according to `layout` and send them
    /// to the client.
    GetMatrixRows {
        handle: MatrixHandle,
        layout: Vec<u32>,
    },
    /// Stop processing commands and proceed to the final rendezvous.
    Halt,
}

impl Command {
    /// Returns a short name for the command, for use in log messages.
    pub fn name(&self) -> &'static str {
        match self {
            Command::NewMatrix { .. } => "new_matrix",
            Command::MatrixMultiply { .. } => "matrix_multiply",
            Command::GetMatrixRows { .. } => "get_matrix_rows",
            Command::Halt => "halt",
        }
    }
}
