//! Drive replication wire protocol
//!
//! One bidirectional QUIC stream per (connection, drive). The reader opens
//! the stream and subscribes; the serving side answers with the current
//! signed manifest and keeps pushing every later commit until either side
//! goes away.
//!
//! ```text
//! Reader                          Server
//!   |                               |
//!   |--- Subscribe ---------------->|
//!   |                               |
//!   |<-- Manifest (v3) -------------|
//!   |<-- Manifest (v4) -------------|   (on each commit)
//!   |         ...                   |
//! ```
//!
//! A server that does not hold the drive answers `NotHosted` and finishes
//! the stream. File content is not part of this protocol; readers fetch the
//! blobs named in a manifest over the iroh-blobs ALPN on the same endpoint.
//!
//! Frames are length-delimited postcard messages.

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite, LengthDelimitedCodec};

use crate::drive::SignedManifest;
use crate::error::{DriveError, DriveResult};
use crate::key::DRIVE_KEY_LEN;

/// ALPN protocol identifier for drive replication
pub const DRIVE_ALPN: &[u8] = b"/lingodrive/drive/1";

/// Largest accepted frame (4 MiB)
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// Drive protocol messages
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub enum DriveMessage {
    /// Ask for a drive's manifests
    Subscribe {
        /// Drive public key
        drive: [u8; DRIVE_KEY_LEN],
        /// Version the reader already has, if any
        known_version: Option<u64>,
    },

    /// A signed manifest newer than anything sent before on this stream
    Manifest(SignedManifest),

    /// The server does not hold this drive
    NotHosted,

    /// Error response
    Error {
        /// Error reason
        reason: String,
    },
}

impl DriveMessage {
    /// Encode message to bytes using postcard
    pub fn encode(&self) -> DriveResult<Vec<u8>> {
        postcard::to_allocvec(self).map_err(|e| {
            DriveError::Serialization(format!("Failed to encode drive message: {}", e))
        })
    }

    /// Decode message from bytes using postcard
    pub fn decode(bytes: &[u8]) -> DriveResult<Self> {
        postcard::from_bytes(bytes).map_err(|e| {
            DriveError::Serialization(format!("Failed to decode drive message: {}", e))
        })
    }
}

/// Read half of a framed drive stream
pub type FrameReader<R> = FramedRead<R, LengthDelimitedCodec>;

/// Write half of a framed drive stream
pub type FrameWriter<W> = FramedWrite<W, LengthDelimitedCodec>;

fn codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec()
}

/// Wrap both halves of a stream in the drive frame codec.
pub fn framed<W, R>(send: W, recv: R) -> (FrameWriter<W>, FrameReader<R>)
where
    W: AsyncWrite,
    R: AsyncRead,
{
    (FramedWrite::new(send, codec()), FramedRead::new(recv, codec()))
}

/// Send one message as a frame.
pub async fn send_message<W>(writer: &mut FrameWriter<W>, message: &DriveMessage) -> DriveResult<()>
where
    W: AsyncWrite + Unpin,
{
    let bytes = message.encode()?;
    writer
        .send(Bytes::from(bytes))
        .await
        .map_err(|e| DriveError::Network(format!("Failed to write frame: {}", e)))
}

/// Receive the next message, `None` once the peer finished the stream.
pub async fn recv_message<R>(reader: &mut FrameReader<R>) -> DriveResult<Option<DriveMessage>>
where
    R: AsyncRead + Unpin,
{
    match reader.next().await {
        Some(Ok(frame)) => DriveMessage::decode(&frame).map(Some),
        Some(Err(e)) => Err(DriveError::Network(format!("Failed to read frame: {}", e))),
        None => Ok(None),
    }
}
