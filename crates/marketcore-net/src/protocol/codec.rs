//! C5 — Direct Messaging Protocol wire codec.
//!
//! One named protocol, one message per stream: the client writes a single
//! length-prefixed CBOR frame, closes its write half, and the server replies
//! with a zero-payload `Ack` the moment the frame has been handed to the
//! ingress pipeline. No business-level reply ever travels on this stream —
//! any reply the ingress handler produces goes out as a fresh envelope
//! through C6, on its own stream. Built on `libp2p::request_response`
//! because its framing, timeout, and backpressure handling are exactly what
//! spec.md §4.5 asks for; the `Ack` adaptation is what keeps it from turning
//! into a request/reply pairing.

use std::io;

use async_trait::async_trait;
use futures::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use libp2p::{request_response, StreamProtocol};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use super::envelope::Envelope;

pub const DIRECT_PROTOCOL: StreamProtocol = StreamProtocol::new("/diiisco/direct/1.0.0");

/// Default `maxMessageSize` (spec.md §4.5): 10 MiB.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 10 * 1024 * 1024;

/// Empty acknowledgement sent back on the same stream.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Ack;

/// Frame-level failure, carried as the source of the `io::Error` codec
/// methods return so callers can tell an oversize frame apart from a plain
/// I/O failure by downcasting.
#[derive(Debug, Error, Clone)]
pub enum FrameError {
    #[error("frame of {got} bytes exceeds max_message_size of {max} bytes")]
    Oversize { got: usize, max: usize },
}

pub fn cbor_encode<T: serde::Serialize>(value: &T) -> io::Result<Vec<u8>> {
    let mut buf = Vec::new();
    ciborium::into_writer(value, &mut buf)
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
    Ok(buf)
}

pub fn cbor_decode<T: for<'de> serde::Deserialize<'de>>(data: &[u8]) -> io::Result<T> {
    ciborium::from_reader(data).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
}

async fn write_framed<W, T>(io: &mut W, value: &T, max: usize) -> io::Result<()>
where
    W: AsyncWrite + Unpin + Send,
    T: serde::Serialize,
{
    let payload = cbor_encode(value)?;
    if payload.len() > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::Oversize { got: payload.len(), max },
        ));
    }
    let len = payload.len() as u32;
    io.write_all(&len.to_be_bytes()).await?;
    io.write_all(&payload).await?;
    io.close().await
}

/// Reads the 4-byte length prefix and rejects an oversize frame before
/// allocating the payload buffer (spec.md §4.5's `OversizeFrame` requirement).
async fn read_framed<R, T>(io: &mut R, max: usize) -> io::Result<T>
where
    R: AsyncRead + Unpin + Send,
    T: for<'de> serde::Deserialize<'de>,
{
    let mut len_buf = [0u8; 4];
    io.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > max {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            FrameError::Oversize { got: len, max },
        ));
    }
    let mut payload = vec![0u8; len];
    io.read_exact(&mut payload).await?;
    cbor_decode(&payload)
}

/// Recover a [`FrameError`] from an `io::Error` returned by this codec, if
/// that is what actually failed.
pub fn as_frame_error(err: &io::Error) -> Option<&FrameError> {
    err.get_ref().and_then(|b| b.downcast_ref::<FrameError>())
}

/// `request_response::Codec` exchanging CBOR-framed `Envelope` / `Ack`
/// messages, with a configurable max frame size.
#[derive(Clone, Debug)]
pub struct DirectCodec {
    pub max_message_size: usize,
}

impl DirectCodec {
    pub fn new(max_message_size: usize) -> Self {
        Self { max_message_size }
    }
}

impl Default for DirectCodec {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

#[async_trait]
impl request_response::Codec for DirectCodec {
    type Protocol = StreamProtocol;
    type Request = Envelope;
    type Response = Ack;

    async fn read_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Envelope>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io, self.max_message_size).await
    }

    async fn read_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T) -> io::Result<Ack>
    where
        T: AsyncRead + Unpin + Send,
    {
        read_framed(io, self.max_message_size).await
    }

    async fn write_request<T>(&mut self, _proto: &StreamProtocol, io: &mut T, req: Envelope) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &req, self.max_message_size).await
    }

    async fn write_response<T>(&mut self, _proto: &StreamProtocol, io: &mut T, resp: Ack) -> io::Result<()>
    where
        T: AsyncWrite + Unpin + Send,
    {
        write_framed(io, &resp, self.max_message_size).await
    }
}
