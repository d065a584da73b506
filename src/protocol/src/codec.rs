// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Encoding/decoding of values in the client protocol.
//!
//! The client protocol has no framing of its own. A request is an opcode
//! followed by a fixed sequence of arguments, and a response is a fixed
//! sequence of values, so this module only provides the lexical layer:
//!
//!  * 32-bit and 64-bit unsigned integers, big-endian (network byte order,
//!    matching Java's `DataInputStream`/`DataOutputStream`).
//!  * Strings, as a u64 byte length followed by the raw UTF-8 bytes.
//!  * Partition layouts, as a u64 element count followed by that many u32s.
//!
//! Writes are buffered. Nothing reaches the client until [`ClientConn::flush`]
//! is called, so callers must flush at every response boundary before they
//! block on anything else.

use std::io;

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter};
use tracing::trace;

/// The maximum byte length of a string accepted from the client.
pub const MAX_STRING_LEN: u64 = 64 << 10;

/// The maximum number of elements in a partition layout accepted from the
/// client.
pub const MAX_LAYOUT_LEN: u64 = 1 << 20;

/// Errors arising while decoding or encoding client protocol values.
#[derive(Error, Debug)]
pub enum CodecError {
    /// The stream ended in the middle of a value.
    #[error("unexpected end of client stream")]
    UnexpectedEof,
    /// A length prefix exceeded the permitted maximum.
    #[error("declared length {len} exceeds limit of {limit}")]
    LengthTooLarge {
        /// The length announced by the peer.
        len: u64,
        /// The maximum length accepted.
        limit: u64,
    },
    /// A string's bytes were not valid UTF-8.
    #[error("string is not valid UTF-8")]
    InvalidUtf8,
    /// The underlying stream failed.
    #[error(transparent)]
    Io(io::Error),
}

impl From<io::Error> for CodecError {
    fn from(error: io::Error) -> CodecError {
        match error.kind() {
            io::ErrorKind::UnexpectedEof => CodecError::UnexpectedEof,
            _ => CodecError::Io(error),
        }
    }
}

/// A connection to the client, split into a buffered read half and a
/// buffered write half.
///
/// The halves are independent streams. A client served over stdio sends
/// requests on stdin and receives responses on stdout; a TCP connection is
/// simply split in two.
#[derive(Debug)]
pub struct ClientConn<R, W> {
    reader: BufReader<R>,
    writer: BufWriter<W>,
}

impl<R, W> ClientConn<R, W>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    /// Wraps the given read and write halves.
    pub fn new(reader: R, writer: W) -> ClientConn<R, W> {
        ClientConn {
            reader: BufReader::new(reader),
            writer: BufWriter::new(writer),
        }
    }

    /// Reads a big-endian u32.
    pub async fn read_u32(&mut self) -> Result<u32, CodecError> {
        let n = self.reader.read_u32().await?;
        trace!(value = n, "codec: read u32");
        Ok(n)
    }

    /// Reads a big-endian u64.
    pub async fn read_u64(&mut self) -> Result<u64, CodecError> {
        let n = self.reader.read_u64().await?;
        trace!(value = n, "codec: read u64");
        Ok(n)
    }

    /// Reads a u64-length-prefixed UTF-8 string.
    pub async fn read_string(&mut self) -> Result<String, CodecError> {
        let len = self.read_len(MAX_STRING_LEN).await?;
        let mut bytes = vec![0; len];
        self.reader.read_exact(&mut bytes).await?;
        String::from_utf8(bytes).map_err(|_| CodecError::InvalidUtf8)
    }

    /// Reads a u64-count-prefixed sequence of u32s.
    pub async fn read_layout(&mut self) -> Result<Vec<u32>, CodecError> {
        let len = self.read_len(MAX_LAYOUT_LEN).await?;
        let mut layout = Vec::with_capacity(len);
        for _ in 0..len {
            layout.push(self.reader.read_u32().await?);
        }
        Ok(layout)
    }

    async fn read_len(&mut self, limit: u64) -> Result<usize, CodecError> {
        let len = self.reader.read_u64().await?;
        if len > limit {
            return Err(CodecError::LengthTooLarge { len, limit });
        }
        usize::try_from(len).map_err(|_| CodecError::LengthTooLarge { len, limit })
    }

    async fn write_len(&mut self, len: usize, limit: u64) -> Result<(), CodecError> {
        // Saturates only where usize is wider than u64, far above any limit.
        let len = u64::try_from(len).unwrap_or(u64::MAX);
        if len > limit {
            return Err(CodecError::LengthTooLarge { len, limit });
        }
        self.writer.write_u64(len).await?;
        Ok(())
    }

    /// Buffers a big-endian u32.
    pub async fn write_u32(&mut self, n: u32) -> Result<(), CodecError> {
        self.writer.write_u32(n).await?;
        Ok(())
    }

    /// Buffers a big-endian u64.
    pub async fn write_u64(&mut self, n: u64) -> Result<(), CodecError> {
        self.writer.write_u64(n).await?;
        Ok(())
    }

    /// Buffers a u64-length-prefixed string.
    ///
    /// Strings longer than [`MAX_STRING_LEN`] are rejected before anything is
    /// buffered, as the peer would refuse to read them.
    pub async fn write_string(&mut self, s: &str) -> Result<(), CodecError> {
        self.write_len(s.len(), MAX_STRING_LEN).await?;
        self.writer.write_all(s.as_bytes()).await?;
        Ok(())
    }

    /// Buffers a u64-count-prefixed sequence of u32s.
    ///
    /// Layouts longer than [`MAX_LAYOUT_LEN`] are rejected before anything is
    /// buffered.
    pub async fn write_layout(&mut self, layout: &[u32]) -> Result<(), CodecError> {
        self.write_len(layout.len(), MAX_LAYOUT_LEN).await?;
        for part in layout {
            self.writer.write_u32(*part).await?;
        }
        Ok(())
    }

    /// Flushes all buffered writes to the client.
    pub async fn flush(&mut self) -> Result<(), CodecError> {
        trace!("codec: flush");
        self.writer.flush().await?;
        Ok(())
    }

    /// Returns a reference to the underlying write half.
    ///
    /// Bytes still sitting in the write buffer are not visible through it.
    pub fn writer(&self) -> &W {
        self.writer.get_ref()
    }

    /// Consumes the connection, returning the underlying halves.
    ///
    /// Any unread buffered input and unflushed output is lost.
    pub fn into_inner(self) -> (R, W) {
        (self.reader.into_inner(), self.writer.into_inner())
    }
}
