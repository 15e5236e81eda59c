//! Frame definitions and framed I/O for the reference transport.
//!
//! Every frame is a length-prefixed (u32 big-endian) protobuf message.
//! Calls are multiplexed over one connection by client-assigned stream id.

use bytes::{BufMut, BytesMut};
use prost::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::{Error, Result};
use crate::metadata::{is_binary_key, Metadata, MetadataValue};

/// Hard ceiling on a single frame, prefix excluded.
pub const MAX_FRAME_SIZE: usize = 16 * 1024 * 1024;

/// A boxable duplex byte stream: plain TCP or a TLS session over it.
pub(crate) trait IoStream: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> IoStream for T {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct WireMetadataEntry {
    #[prost(string, tag = "1")]
    pub key: String,
    #[prost(bytes = "vec", tag = "2")]
    pub value: Vec<u8>,
}

/// Opens a call: emitted with the client's initial metadata.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct OpenFrame {
    #[prost(string, tag = "1")]
    pub path: String,
    #[prost(string, tag = "2")]
    pub authority: String,
    /// Milliseconds until the deadline; 0 means no deadline.
    #[prost(uint64, tag = "3")]
    pub timeout_ms: u64,
    #[prost(message, repeated, tag = "4")]
    pub metadata: Vec<WireMetadataEntry>,
}

/// Server initial metadata, sent before the first response message.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HeadersFrame {
    #[prost(message, repeated, tag = "1")]
    pub metadata: Vec<WireMetadataEntry>,
}

/// One user message in either direction.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct MessageFrame {
    #[prost(bytes = "vec", tag = "1")]
    pub body: Vec<u8>,
    #[prost(uint32, tag = "2")]
    pub flags: u32,
}

/// Sender-side signal that no further messages follow.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct HalfCloseFrame {}

/// Terminal status with trailing metadata. Server to client only.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct StatusFrame {
    #[prost(int32, tag = "1")]
    pub code: i32,
    #[prost(string, tag = "2")]
    pub details: String,
    #[prost(message, repeated, tag = "3")]
    pub trailers: Vec<WireMetadataEntry>,
}

/// Client-side teardown of a single call.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct CancelFrame {}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Frame {
    #[prost(uint32, tag = "1")]
    pub stream_id: u32,
    #[prost(oneof = "frame::Kind", tags = "2, 3, 4, 5, 6, 7")]
    pub kind: Option<frame::Kind>,
}

pub mod frame {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Kind {
        #[prost(message, tag = "2")]
        Open(super::OpenFrame),
        #[prost(message, tag = "3")]
        Headers(super::HeadersFrame),
        #[prost(message, tag = "4")]
        Message(super::MessageFrame),
        #[prost(message, tag = "5")]
        HalfClose(super::HalfCloseFrame),
        #[prost(message, tag = "6")]
        Status(super::StatusFrame),
        #[prost(message, tag = "7")]
        Cancel(super::CancelFrame),
    }
}

impl Frame {
    pub fn new(stream_id: u32, kind: frame::Kind) -> Frame {
        Frame {
            stream_id,
            kind: Some(kind),
        }
    }
}

/// Convert metadata to its wire entry list. Text values travel as their
/// UTF-8 bytes; the `-bin` suffix on the key distinguishes them.
pub fn metadata_to_wire(metadata: &Metadata) -> Vec<WireMetadataEntry> {
    metadata
        .iter()
        .map(|(key, value)| WireMetadataEntry {
            key: key.to_string(),
            value: value.as_bytes().to_vec(),
        })
        .collect()
}

/// Rebuild metadata from wire entries.
///
/// A non-UTF-8 value under a text key is a protocol error.
pub fn metadata_from_wire(entries: Vec<WireMetadataEntry>) -> Result<Metadata> {
    let mut metadata = Metadata::new();
    for entry in entries {
        if is_binary_key(&entry.key) {
            metadata.add(entry.key, MetadataValue::Binary(entry.value))?;
        } else {
            let text = String::from_utf8(entry.value).map_err(|_| {
                Error::Protocol(format!(
                    "non-UTF-8 value under text metadata key {:?}",
                    entry.key
                ))
            })?;
            metadata.add(entry.key, MetadataValue::Ascii(text))?;
        }
    }
    Ok(metadata)
}

/// Write one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &Frame) -> Result<()> {
    let len = frame.encoded_len();
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "outbound frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte cap"
        )));
    }
    let mut buf = BytesMut::with_capacity(4 + len);
    buf.put_u32(len as u32);
    frame
        .encode(&mut buf)
        .map_err(|e| Error::Protocol(format!("failed to encode frame: {e}")))?;
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one length-prefixed frame. `Ok(None)` on a clean end of stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Option<Frame>> {
    let mut prefix = [0u8; 4];
    match reader.read_exact(&mut prefix).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(prefix) as usize;
    if len > MAX_FRAME_SIZE {
        return Err(Error::Protocol(format!(
            "inbound frame of {len} bytes exceeds the {MAX_FRAME_SIZE}-byte cap"
        )));
    }
    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    let frame = Frame::decode(body.as_slice())
        .map_err(|e| Error::Protocol(format!("failed to decode frame: {e}")))?;
    Ok(Some(frame))
}
