// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The worker pool and the channel used to reach it.
//!
//! The driver addresses the workers only as a group. A [`WorkerChannel`]
//! broadcasts commands to all of them and blocks on barriers until all of them
//! arrive; it never exposes an individual worker. The [`WorkerPool`] is the
//! list of client-facing worker endpoints, fixed once at startup.

use std::sync::{Arc, Mutex};

use alchemist_protocol::command::{Command, WorkerInfo};
use alchemist_protocol::transport::{
    DriverConnection, DriverMessage, TRANSPORT_VERSION, WorkerMessage,
};
use anyhow::{Context, anyhow, bail};
use async_trait::async_trait;
use futures::future;
use tokio::net::{TcpListener, ToSocketAddrs};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// A group-messaging capability over all workers.
///
/// Implementations must treat the pool as a unit: a broadcast reaches every
/// worker or fails, and a barrier returns only once every worker has arrived.
/// There are no timeouts; a hung worker blocks the caller forever.
#[async_trait]
pub trait WorkerChannel: Send {
    /// Returns the number of workers behind the channel.
    fn worker_count(&self) -> usize;

    /// Receives the endpoint announced by the worker of the given rank.
    ///
    /// Called exactly once per rank, in rank order, before any broadcast.
    async fn recv_worker_info(&mut self, rank: usize) -> anyhow::Result<WorkerInfo>;

    /// Sends a command to every worker.
    async fn broadcast(&mut self, cmd: &Command) -> anyhow::Result<()>;

    /// Blocks until every worker has reached the current barrier.
    async fn barrier(&mut self) -> anyhow::Result<()>;

    /// Tells every worker the driver is going away.
    ///
    /// Best effort: failures are logged and otherwise ignored. The channel is
    /// unusable afterwards.
    async fn abort(&mut self, reason: &str);
}

/// The workers of the cluster, indexed by rank.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct WorkerPool {
    workers: Vec<WorkerInfo>,
    /// `workers.len()`, in the width the client protocol announces it.
    count: u32,
}

impl WorkerPool {
    /// Collects the endpoint of every worker behind `channel`, in rank order.
    pub async fn collect<C>(channel: &mut C) -> anyhow::Result<WorkerPool>
    where
        C: WorkerChannel + ?Sized,
    {
        let count = channel.worker_count();
        let Ok(wire_count) = u32::try_from(count) else {
            bail!("worker count {count} does not fit the client protocol");
        };
        let mut workers = Vec::with_capacity(count);
        for rank in 0..count {
            let info = channel
                .recv_worker_info(rank)
                .await
                .with_context(|| format!("receiving endpoint of worker {rank}"))?;
            debug!(rank, hostname = %info.hostname, port = info.port, "worker endpoint");
            workers.push(info);
        }
        Ok(WorkerPool {
            workers,
            count: wire_count,
        })
    }

    /// Returns the number of workers.
    pub fn len(&self) -> usize {
        self.workers.len()
    }

    /// Returns the number of workers as announced to the client.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Reports whether the pool has no workers.
    pub fn is_empty(&self) -> bool {
        self.workers.is_empty()
    }

    /// Returns the endpoint of the worker with the given rank.
    pub fn get(&self, rank: usize) -> Option<&WorkerInfo> {
        self.workers.get(rank)
    }

    /// Returns all endpoints in rank order.
    pub fn workers(&self) -> &[WorkerInfo] {
        &self.workers
    }
}

/// A [`WorkerChannel`] over TCP connections from each worker.
#[derive(Debug)]
pub struct TcpWorkerChannel {
    /// Connections indexed by rank.
    conns: Vec<DriverConnection>,
    /// Endpoints announced at registration, taken by `recv_worker_info`.
    infos: Vec<Option<WorkerInfo>>,
}

impl TcpWorkerChannel {
    /// Listens on `address` until `workers` workers have connected.
    pub async fn listen<A: ToSocketAddrs>(address: A, workers: usize) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(address).await?;
        info!(
            address = %listener.local_addr()?,
            workers,
            "listening for worker connections"
        );
        Self::accept(&listener, workers).await
    }

    /// Accepts connections on `listener` until `workers` workers have
    /// registered.
    ///
    /// Workers may connect in any order; each announces its rank, and ranks
    /// must cover `0..workers` exactly once.
    pub async fn accept(listener: &TcpListener, workers: usize) -> anyhow::Result<Self> {
        let mut slots: Vec<Option<(DriverConnection, WorkerInfo)>> =
            (0..workers).map(|_| None).collect();

        for _ in 0..workers {
            let (stream, peer) = listener.accept().await?;
            stream.set_nodelay(true)?;
            let mut conn = DriverConnection::start(stream, TRANSPORT_VERSION)
                .await
                .with_context(|| format!("handshake with worker at {peer}"))?;

            let (rank, info) = match conn.recv().await? {
                WorkerMessage::Register { rank, info } => (rank, info),
                msg => bail!("worker at {peer} sent {msg:?} before registering"),
            };
            let slot = usize::try_from(rank)
                .ok()
                .and_then(|rank| slots.get_mut(rank))
                .ok_or_else(|| {
                    anyhow!("worker at {peer} claims rank {rank}, but the pool has {workers} workers")
                })?;
            if slot.is_some() {
                bail!("worker at {peer} claims rank {rank}, which is already taken");
            }
            info!(%peer, rank, "worker connected");
            *slot = Some((conn, info));
        }

        let mut conns = Vec::with_capacity(workers);
        let mut infos = Vec::with_capacity(workers);
        for (conn, info) in slots.into_iter().flatten() {
            conns.push(conn);
            infos.push(Some(info));
        }
        Ok(TcpWorkerChannel { conns, infos })
    }

    async fn send_all(&mut self, msg: &DriverMessage) -> anyhow::Result<()> {
        let sends = self
            .conns
            .iter_mut()
            .enumerate()
            .map(|(rank, conn)| async move {
                conn.send(msg)
                    .await
                    .with_context(|| format!("sending to worker {rank}"))
            });
        future::try_join_all(sends).await?;
        Ok(())
    }
}

#[async_trait]
impl WorkerChannel for TcpWorkerChannel {
    fn worker_count(&self) -> usize {
        self.conns.len()
    }

    async fn recv_worker_info(&mut self, rank: usize) -> anyhow::Result<WorkerInfo> {
        self.infos
            .get_mut(rank)
            .and_then(Option::take)
            .ok_or_else(|| anyhow!("no endpoint pending for worker {rank}"))
    }

    async fn broadcast(&mut self, cmd: &Command) -> anyhow::Result<()> {
        debug!(command = cmd.name(), "broadcasting command");
        self.send_all(&DriverMessage::Command(cmd.clone())).await
    }

    async fn barrier(&mut self) -> anyhow::Result<()> {
        let arrivals = self
            .conns
            .iter_mut()
            .enumerate()
            .map(|(rank, conn)| async move {
                match conn.recv().await {
                    Ok(WorkerMessage::Arrived) => Ok(()),
                    Ok(msg) => bail!("worker {rank} sent {msg:?} instead of arriving at barrier"),
                    Err(error) => Err(error.context(format!("waiting for worker {rank}"))),
                }
            });
        future::try_join_all(arrivals).await?;
        debug!("all workers arrived at barrier");
        self.send_all(&DriverMessage::Release).await
    }

    async fn abort(&mut self, reason: &str) {
        let msg = DriverMessage::Abort {
            reason: reason.to_string(),
        };
        for (rank, conn) in self.conns.iter_mut().enumerate() {
            if let Err(error) = conn.send(&msg).await {
                warn!(rank, "failed to notify worker of abort: {error:#}");
            }
        }
        self.conns.clear();
    }
}

/// Something that happened on a [`LocalWorkerChannel`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChannelEvent {
    /// The endpoint of the given rank was received.
    WorkerInfo(usize),
    /// A command was broadcast.
    Broadcast(Command),
    /// A barrier completed.
    Barrier,
    /// The channel was aborted with the given reason.
    Abort(String),
}

/// An in-process [`WorkerChannel`] with simulated workers.
///
/// The channel records every operation in a shared event log. Barriers pass
/// immediately unless the channel is [gated](LocalWorkerChannel::gated), in
/// which case each barrier waits for one release from the gate.
#[derive(Debug)]
pub struct LocalWorkerChannel {
    workers: Vec<WorkerInfo>,
    events: Arc<Mutex<Vec<ChannelEvent>>>,
    gate: Option<mpsc::UnboundedReceiver<()>>,
}

impl LocalWorkerChannel {
    /// Creates a channel to simulated workers with the given endpoints.
    pub fn new(workers: Vec<WorkerInfo>) -> LocalWorkerChannel {
        LocalWorkerChannel {
            workers,
            events: Arc::new(Mutex::new(Vec::new())),
            gate: None,
        }
    }

    /// Makes every subsequent barrier wait for a message on the returned
    /// sender.
    pub fn gated(mut self) -> (LocalWorkerChannel, mpsc::UnboundedSender<()>) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.gate = Some(rx);
        (self, tx)
    }

    /// Returns a handle to the event log.
    pub fn events(&self) -> Arc<Mutex<Vec<ChannelEvent>>> {
        Arc::clone(&self.events)
    }

    fn record(&self, event: ChannelEvent) {
        self.events.lock().expect("lock poisoned").push(event);
    }
}

#[async_trait]
impl WorkerChannel for LocalWorkerChannel {
    fn worker_count(&self) -> usize {
        self.workers.len()
    }

    async fn recv_worker_info(&mut self, rank: usize) -> anyhow::Result<WorkerInfo> {
        let info = self
            .workers
            .get(rank)
            .cloned()
            .ok_or_else(|| anyhow!("no worker with rank {rank}"))?;
        self.record(ChannelEvent::WorkerInfo(rank));
        Ok(info)
    }

    async fn broadcast(&mut self, cmd: &Command) -> anyhow::Result<()> {
        self.record(ChannelEvent::Broadcast(cmd.clone()));
        Ok(())
    }

    async fn barrier(&mut self) -> anyhow::Result<()> {
        if let Some(gate) = &mut self.gate {
            gate.recv()
                .await
                .ok_or_else(|| anyhow!("barrier gate closed"))?;
        }
        self.record(ChannelEvent::Barrier);
        Ok(())
    }

    async fn abort(&mut self, reason: &str) {
        self.record(ChannelEvent::Abort(reason.to_string()));
    }
}
