// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Decoding and planning of client requests.
//!
//! Each request goes through the same stages:
//!
//!  1. [`Request::decode`] reads the arguments for an [`Opcode`] from the
//!     client.
//!  2. [`Request::plan`] applies the request to the registry and produces a
//!     [`Plan`]: the command to broadcast, if any, the response that accepts
//!     the request, and how the request completes.
//!  3. The coordinator executes the plan against the worker channel. See
//!     [`crate::coordinator`].
//!
//! Planning is synchronous and never touches the workers, so every registry
//! effect is in place before a command is broadcast or a response is sent.

use alchemist_protocol::codec::{ClientConn, CodecError};
use alchemist_protocol::command::{Command, MatrixHandle, Opcode, STATUS_OK};
use tokio::io::{AsyncRead, AsyncWrite};

use crate::error::DriverError;
use crate::pool::WorkerPool;
use crate::registry::{MatrixEntry, Registry};

/// A decoded client request.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Request {
    NewMatrix {
        num_rows: u64,
        num_cols: u64,
        layout: Vec<u32>,
    },
    MatrixMultiply {
        left: MatrixHandle,
        right: MatrixHandle,
    },
    MatrixDims {
        handle: MatrixHandle,
    },
    GetMatrixRows {
        handle: MatrixHandle,
        layout: Vec<u32>,
    },
    Halt,
}

/// A response to the client. Every response begins with [`STATUS_OK`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Response {
    /// Just the status.
    Ok,
    /// The status and a newly minted handle.
    Handle(MatrixHandle),
    /// The status and a matrix shape.
    Dims { num_rows: u64, num_cols: u64 },
}

/// How a request finishes after its acceptance response has been flushed.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Completion {
    /// Nothing further; the request is done.
    Immediate,
    /// Wait for the workers at a barrier, then send a second [`Response::Ok`].
    AfterBarrier,
    /// Stop serving requests and proceed to the final rendezvous.
    Shutdown,
}

/// The effects of a request that remain after the registry is updated.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Plan {
    /// The command to broadcast to every worker, if any.
    pub command: Option<Command>,
    /// The response that tells the client the request was accepted.
    pub accepted: Response,
    /// What happens after the acceptance response.
    pub completion: Completion,
}

impl Request {
    /// Reads the arguments of a request with the given opcode.
    pub async fn decode<R, W>(
        opcode: Opcode,
        conn: &mut ClientConn<R, W>,
    ) -> Result<Request, CodecError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        Ok(match opcode {
            Opcode::NewMatrix => Request::NewMatrix {
                num_rows: conn.read_u64().await?,
                num_cols: conn.read_u64().await?,
                layout: conn.read_layout().await?,
            },
            Opcode::MatrixMultiply => Request::MatrixMultiply {
                left: MatrixHandle(conn.read_u32().await?),
                right: MatrixHandle(conn.read_u32().await?),
            },
            Opcode::MatrixDims => Request::MatrixDims {
                handle: MatrixHandle(conn.read_u32().await?),
            },
            Opcode::GetMatrixRows => Request::GetMatrixRows {
                handle: MatrixHandle(conn.read_u32().await?),
                layout: conn.read_layout().await?,
            },
            Opcode::Halt => Request::Halt,
        })
    }

    /// Returns the opcode the request was decoded from.
    pub fn opcode(&self) -> Opcode {
        match self {
            Request::NewMatrix { .. } => Opcode::NewMatrix,
            Request::MatrixMultiply { .. } => Opcode::MatrixMultiply,
            Request::MatrixDims { .. } => Opcode::MatrixDims,
            Request::GetMatrixRows { .. } => Opcode::GetMatrixRows,
            Request::Halt => Opcode::Halt,
        }
    }

    /// Applies the request to the registry and plans its remaining effects.
    pub fn plan(self, registry: &mut Registry, pool: &WorkerPool) -> Result<Plan, DriverError> {
        match self {
            Request::NewMatrix {
                num_rows,
                num_cols,
                layout,
            } => {
                check_layout(&layout, pool)?;
                let handle = registry.allocate()?;
                registry.insert(MatrixEntry {
                    handle,
                    num_rows,
                    num_cols,
                    layout: layout.clone(),
                })?;
                Ok(Plan {
                    command: Some(Command::NewMatrix {
                        handle,
                        num_rows,
                        num_cols,
                        layout,
                    }),
                    accepted: Response::Handle(handle),
                    completion: Completion::AfterBarrier,
                })
            }
            Request::MatrixMultiply { left, right } => {
                let a = registry.lookup(left)?;
                let b = registry.lookup(right)?;
                if a.num_cols != b.num_rows {
                    return Err(DriverError::DimensionMismatch {
                        left,
                        left_rows: a.num_rows,
                        left_cols: a.num_cols,
                        right,
                        right_rows: b.num_rows,
                        right_cols: b.num_cols,
                    });
                }
                // The true result layout is up to the workers; record the
                // shape the product must have and a placeholder layout.
                let (num_rows, num_cols) = (a.num_rows, b.num_cols);
                let dest = registry.allocate()?;
                registry.insert(MatrixEntry {
                    handle: dest,
                    num_rows,
                    num_cols,
                    layout: MatrixEntry::PLACEHOLDER_LAYOUT.to_vec(),
                })?;
                Ok(Plan {
                    command: Some(Command::MatrixMultiply { dest, left, right }),
                    accepted: Response::Handle(dest),
                    completion: Completion::AfterBarrier,
                })
            }
            Request::MatrixDims { handle } => {
                let entry = registry.lookup(handle)?;
                Ok(Plan {
                    command: None,
                    accepted: Response::Dims {
                        num_rows: entry.num_rows,
                        num_cols: entry.num_cols,
                    },
                    completion: Completion::Immediate,
                })
            }
            Request::GetMatrixRows { handle, layout } => {
                registry.lookup(handle)?;
                check_layout(&layout, pool)?;
                Ok(Plan {
                    command: Some(Command::GetMatrixRows { handle, layout }),
                    accepted: Response::Ok,
                    completion: Completion::AfterBarrier,
                })
            }
            Request::Halt => Ok(Plan {
                command: Some(Command::Halt),
                accepted: Response::Ok,
                completion: Completion::Shutdown,
            }),
        }
    }
}

fn check_layout(layout: &[u32], pool: &WorkerPool) -> Result<(), DriverError> {
    if layout.len() != pool.len() {
        return Err(DriverError::LayoutMismatch {
            len: layout.len(),
            workers: pool.len(),
        });
    }
    Ok(())
}

impl Response {
    /// Buffers the response. The caller is responsible for flushing.
    pub async fn encode<R, W>(&self, conn: &mut ClientConn<R, W>) -> Result<(), CodecError>
    where
        R: AsyncRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        conn.write_u32(STATUS_OK).await?;
        match self {
            Response::Ok => {}
            Response::Handle(handle) => conn.write_u32(handle.id()).await?,
            Response::Dims { num_rows, num_cols } => {
                conn.write_u64(*num_rows).await?;
                conn.write_u64(*num_cols).await?;
            }
        }
        Ok(())
    }
}
