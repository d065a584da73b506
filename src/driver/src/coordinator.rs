// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The coordinator loop.
//!
//! A session with the client runs in four phases:
//!
//!  1. Collect the endpoint of every worker ([`WorkerPool::collect`]).
//!  2. Handshake with the client, telling it where the workers are.
//!  3. Serve requests one at a time until the client sends Halt.
//!  4. Meet the workers at a final barrier.
//!
//! Requests are never pipelined. For every request that involves the workers,
//! the command is broadcast, the acceptance response is flushed, and only then
//! does the coordinator block on the barrier; the completion response follows
//! once the barrier passes. The gap between the two responses is when the
//! client streams matrix rows to or from the workers.
//!
//! Any error ends the session. The workers are told to abort and the client
//! receives nothing further.

use std::ops::ControlFlow;

use alchemist_protocol::codec::ClientConn;
use alchemist_protocol::command::{CLIENT_MAGIC, DRIVER_MAGIC, Opcode, PROTOCOL_VERSION};
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, error, info};

use crate::dispatch::{Completion, Request, Response};
use crate::error::{DriverError, HandshakeError};
use crate::pool::{WorkerChannel, WorkerPool};
use crate::registry::{DEFAULT_FIRST_HANDLE, Registry};

/// Configures a driver session.
#[derive(Clone, Debug)]
pub struct Config {
    /// The first matrix handle to hand out.
    pub first_handle: u32,
}

impl Default for Config {
    fn default() -> Config {
        Config {
            first_handle: DEFAULT_FIRST_HANDLE,
        }
    }
}

/// Serves one client session against the workers behind `channel`.
///
/// Returns once the client has halted the cluster and the workers have passed
/// the final barrier. On error the workers are aborted before the error is
/// returned.
pub async fn serve<C, R, W>(
    config: Config,
    mut channel: C,
    conn: ClientConn<R, W>,
) -> Result<(), DriverError>
where
    C: WorkerChannel,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    match run(config, &mut channel, conn).await {
        Ok(()) => Ok(()),
        Err(err) => {
            if err.is_client_eof() {
                error!("client disconnected without halting the cluster");
            } else {
                error!("driver session failed: {err}");
            }
            channel.abort(&err.to_string()).await;
            Err(err)
        }
    }
}

async fn run<C, R, W>(
    config: Config,
    channel: &mut C,
    conn: ClientConn<R, W>,
) -> Result<(), DriverError>
where
    C: WorkerChannel,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let pool = WorkerPool::collect(channel)
        .await
        .map_err(DriverError::Worker)?;
    info!(workers = pool.len(), "workers ready");

    let mut coord = Coordinator {
        registry: Registry::new(config.first_handle),
        pool,
        channel,
        conn,
    };
    coord.handshake().await?;
    info!("client connected");

    while let ControlFlow::Continue(()) = coord.serve_request().await? {}

    info!("halting; waiting for workers to exit");
    coord.channel.barrier().await.map_err(DriverError::Worker)?;
    info!(matrices = coord.registry.len(), "session complete");
    Ok(())
}

/// The state of a session after the worker pool is known.
struct Coordinator<'a, C, R, W> {
    registry: Registry,
    pool: WorkerPool,
    channel: &'a mut C,
    conn: ClientConn<R, W>,
}

impl<C, R, W> Coordinator<'_, C, R, W>
where
    C: WorkerChannel,
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Validates the client's greeting and tells it about the workers.
    async fn handshake(&mut self) -> Result<(), DriverError> {
        let magic = self.conn.read_u32().await?;
        if magic != CLIENT_MAGIC {
            return Err(HandshakeError {
                field: "magic",
                expected: CLIENT_MAGIC,
                actual: magic,
            }
            .into());
        }
        let version = self.conn.read_u32().await?;
        if version != PROTOCOL_VERSION {
            return Err(HandshakeError {
                field: "version",
                expected: PROTOCOL_VERSION,
                actual: version,
            }
            .into());
        }

        self.conn.write_u32(DRIVER_MAGIC).await?;
        self.conn.write_u32(PROTOCOL_VERSION).await?;
        self.conn.write_u32(self.pool.count()).await?;
        for worker in self.pool.workers() {
            self.conn.write_string(&worker.hostname).await?;
            self.conn.write_u32(u32::from(worker.port)).await?;
        }
        self.conn.flush().await?;
        Ok(())
    }

    /// Serves one request, returning `Break` once the client has halted.
    async fn serve_request(&mut self) -> Result<ControlFlow<()>, DriverError> {
        let code = self.conn.read_u32().await?;
        let opcode = Opcode::try_from(code)?;
        let request = Request::decode(opcode, &mut self.conn).await?;
        debug!(?request, "received request");

        let plan = request.plan(&mut self.registry, &self.pool)?;

        if let Some(command) = &plan.command {
            self.channel
                .broadcast(command)
                .await
                .map_err(DriverError::Worker)?;
        }
        plan.accepted.encode(&mut self.conn).await?;
        self.conn.flush().await?;

        match plan.completion {
            Completion::Immediate => Ok(ControlFlow::Continue(())),
            Completion::AfterBarrier => {
                self.channel.barrier().await.map_err(DriverError::Worker)?;
                Response::Ok.encode(&mut self.conn).await?;
                self.conn.flush().await?;
                debug!(?opcode, "request complete");
                Ok(ControlFlow::Continue(()))
            }
            Completion::Shutdown => Ok(ControlFlow::Break(())),
        }
    }
}
