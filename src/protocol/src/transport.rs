// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! The worker transport.
//!
//! The worker transport carries [`Command`]s from the driver to every worker
//! and barrier arrivals from the workers back to the driver. It runs on top of
//! a reliable bidirectional byte stream, as provided by TCP, and adds a
//! handshake and message framing.
//!
//! Messages are encoded using the [`bincode`] format and sent over the wire
//! with a u64 length prefix.
//!
//! A worker's session looks like this:
//!
//!  1. Handshake: both ends send the transport magic number and a [`Hello`],
//!     and check the peer's.
//!  2. The worker sends [`WorkerMessage::Register`] with its rank and the
//!     endpoint the client should use to reach it.
//!  3. The driver sends [`DriverMessage::Command`]s. After acting on each
//!     command the worker joins a barrier by sending
//!     [`WorkerMessage::Arrived`]; the driver answers with
//!     [`DriverMessage::Release`] once every worker has arrived.
//!  4. After [`Command::Halt`] there is one final barrier, after which the
//!     driver closes the connection.
//!
//! At any point the driver may send [`DriverMessage::Abort`] and close the
//! connection if it hits a fatal error.

use std::fmt::Debug;
use std::marker::PhantomData;

use anyhow::{Context, bail};
use semver::Version;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{
    AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter, ReadHalf, WriteHalf,
};
use tokio::net::{TcpStream, ToSocketAddrs};
use tracing::{debug, info, trace};

use crate::command::{Command, WorkerInfo};

/// The version of the worker transport spoken by this build.
pub const TRANSPORT_VERSION: Version = Version::new(0, 1, 0);

/// The maximum allowable size of an encoded message.
pub const MAX_FRAME_LEN: u64 = 64 << 20;

/// A randomly chosen magic number identifying worker transport connections.
const MAGIC: u64 = 0x416c_6368_656d_6973;

/// Trait for messages that can be sent over the worker transport.
pub trait Message: Debug + Send + Serialize + DeserializeOwned + 'static {}
impl<T: Debug + Send + Serialize + DeserializeOwned + 'static> Message for T {}

/// Messages sent from the driver to a worker.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum DriverMessage {
    /// A command every worker must act on.
    Command(Command),
    /// Every worker has arrived at the current barrier.
    Release,
    /// The driver hit a fatal error and is shutting down.
    Abort { reason: String },
}

/// Messages sent from a worker to the driver.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkerMessage {
    /// Announces the worker's rank and client-facing endpoint. Sent exactly
    /// once, right after the handshake.
    Register { rank: u32, info: WorkerInfo },
    /// The worker has reached the current barrier.
    Arrived,
}

/// A message for exchanging compatibility information during the handshake.
#[derive(Debug, Serialize, Deserialize)]
struct Hello {
    /// The transport version of the originating endpoint.
    version: Version,
}

/// An established worker transport connection.
///
/// Used by both ends with swapped `Out`/`In` types; see [`DriverConnection`]
/// and [`WorkerConnection`].
#[derive(Debug)]
pub struct Connection<Out, In, S> {
    reader: BufReader<ReadHalf<S>>,
    writer: BufWriter<WriteHalf<S>>,
    _messages: PhantomData<fn(Out) -> In>,
}

/// The driver's end of a connection to one worker.
pub type DriverConnection<S = TcpStream> = Connection<DriverMessage, WorkerMessage, S>;

/// A worker's end of its connection to the driver.
pub type WorkerConnection<S = TcpStream> = Connection<WorkerMessage, DriverMessage, S>;

impl<Out, In, S> Connection<Out, In, S>
where
    Out: Message,
    In: Message,
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Starts a connection over the given stream by performing the handshake.
    pub async fn start(stream: S, version: Version) -> anyhow::Result<Self> {
        let (reader, writer) = tokio::io::split(stream);
        let mut reader = BufReader::new(reader);
        let mut writer = BufWriter::new(writer);

        handshake(&mut reader, &mut writer, version).await?;

        Ok(Connection {
            reader,
            writer,
            _messages: PhantomData,
        })
    }

    /// Sends a message and flushes it to the peer.
    pub async fn send(&mut self, msg: &Out) -> anyhow::Result<()> {
        trace!(?msg, "transport: sending message");
        write_message(&mut self.writer, msg).await?;
        self.writer.flush().await?;
        Ok(())
    }

    /// Receives the next message from the peer.
    pub async fn recv(&mut self) -> anyhow::Result<In> {
        let msg = read_message(&mut self.reader).await?;
        trace!(?msg, "transport: received message");
        Ok(msg)
    }
}

/// A worker's handle on the driver.
///
/// This is the worker half of the transport. It does not know how to act on
/// commands; callers receive them with [`WorkerEndpoint::recv_command`], do
/// their work, and then join the barrier with [`WorkerEndpoint::barrier`].
#[derive(Debug)]
pub struct WorkerEndpoint<S = TcpStream> {
    rank: u32,
    conn: WorkerConnection<S>,
}

impl WorkerEndpoint<TcpStream> {
    /// Connects to the driver at `address` and registers as worker `rank`.
    pub async fn connect<A: ToSocketAddrs>(
        address: A,
        rank: u32,
        info: WorkerInfo,
    ) -> anyhow::Result<Self> {
        let stream = TcpStream::connect(address)
            .await
            .context("connecting to driver")?;
        stream.set_nodelay(true)?;
        info!(rank, "transport: connected to driver");
        Self::start(stream, rank, info, TRANSPORT_VERSION).await
    }
}

impl<S> WorkerEndpoint<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Registers as worker `rank` over an already established stream.
    pub async fn start(
        stream: S,
        rank: u32,
        info: WorkerInfo,
        version: Version,
    ) -> anyhow::Result<Self> {
        let mut conn = Connection::start(stream, version).await?;
        conn.send(&WorkerMessage::Register { rank, info }).await?;
        Ok(WorkerEndpoint { rank, conn })
    }

    /// Returns this worker's rank.
    pub fn rank(&self) -> u32 {
        self.rank
    }

    /// Waits for the next command from the driver.
    pub async fn recv_command(&mut self) -> anyhow::Result<Command> {
        match self.conn.recv().await? {
            DriverMessage::Command(cmd) => {
                debug!(rank = self.rank, command = cmd.name(), "transport: received command");
                Ok(cmd)
            }
            DriverMessage::Release => bail!("received barrier release outside of a barrier"),
            DriverMessage::Abort { reason } => bail!("driver aborted: {reason}"),
        }
    }

    /// Joins the current barrier, returning once every worker has joined it.
    pub async fn barrier(&mut self) -> anyhow::Result<()> {
        self.conn.send(&WorkerMessage::Arrived).await?;
        match self.conn.recv().await? {
            DriverMessage::Release => Ok(()),
            DriverMessage::Command(cmd) => {
                bail!("received command {} while waiting at a barrier", cmd.name())
            }
            DriverMessage::Abort { reason } => bail!("driver aborted: {reason}"),
        }
    }
}

/// Performs the transport handshake.
///
/// Each endpoint sends the protocol magic number, followed by a `Hello`
/// message. Only if both endpoints agree on the version does the handshake
/// succeed.
async fn handshake<R, W>(reader: &mut R, writer: &mut W, version: Version) -> anyhow::Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    writer.write_u64(MAGIC).await?;
    write_message(&mut *writer, &Hello {
        version: version.clone(),
    })
    .await?;
    writer.flush().await?;

    let peer_magic = reader.read_u64().await?;
    if peer_magic != MAGIC {
        bail!("invalid protocol magic: {peer_magic:#x}");
    }

    let Hello {
        version: peer_version,
    } = read_message(&mut *reader).await?;
    if peer_version != version {
        bail!("version mismatch: {peer_version} != {version}");
    }

    Ok(())
}

/// Writes a message into the given writer.
async fn write_message<W, M>(writer: &mut W, msg: &M) -> anyhow::Result<()>
where
    W: AsyncWrite + Unpin,
    M: Serialize,
{
    let bytes = wire_encode(msg)?;

    let len = u64::try_from(bytes.len())?;
    writer.write_u64(len).await?;
    writer.write_all(&bytes).await?;

    Ok(())
}

/// Reads a message from the given reader.
async fn read_message<R, M>(reader: &mut R) -> anyhow::Result<M>
where
    R: AsyncRead + Unpin,
    M: DeserializeOwned,
{
    let len = reader.read_u64().await?;
    if len > MAX_FRAME_LEN {
        bail!("frame of {len} bytes exceeds limit of {MAX_FRAME_LEN}");
    }
    let mut bytes = vec![0; usize::try_from(len)?];
    reader.read_exact(&mut bytes).await?;

    wire_decode(&bytes)
}

/// Encodes a message for wire transport.
fn wire_encode<M: Serialize>(msg: &M) -> anyhow::Result<Vec<u8>> {
    use bincode::Options;
    let bytes = bincode::DefaultOptions::new().serialize(msg)?;
    Ok(bytes)
}

/// Decodes a wire frame back into a message.
fn wire_decode<M: DeserializeOwned>(bytes: &[u8]) -> anyhow::Result<M> {
    use bincode::Options;
    let msg = bincode::DefaultOptions::new().deserialize(bytes)?;
    Ok(msg)
}
