// Copyright (C) 2025 SyncMyOrders Sp. z o.o.
// SPDX-License-Identifier: AGPL-3.0-or-later
//! Wire format for control-plane framing.
//!
//! Each connection carries a stream of frames with the following layout:
//! - 4 bytes: payload length (big-endian)
//! - N bytes: one JSON object

use bytes::{Buf, BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde::de::DeserializeOwned;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Maximum frame size (1 MiB).
///
/// QR payloads and log batches are small; anything beyond this is a
/// misbehaving peer.
pub const MAX_FRAME_SIZE: usize = 1024 * 1024;

/// Frame header size (4 bytes length).
pub const HEADER_SIZE: usize = 4;

/// Errors that can occur during frame encoding/decoding.
#[derive(Debug, Error)]
pub enum FrameError {
    #[error("frame too large: {0} bytes (max: {MAX_FRAME_SIZE})")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("connection closed")]
    ConnectionClosed,
}

/// A framed message payload.
#[derive(Debug, Clone)]
pub struct Frame {
    pub payload: Bytes,
}

impl Frame {
    /// Create a frame from a serializable message.
    pub fn from_msg<M: Serialize>(msg: &M) -> Result<Self, FrameError> {
        let payload = serde_json::to_vec(msg)?;
        if payload.len() > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(payload.len()));
        }
        Ok(Self {
            payload: Bytes::from(payload),
        })
    }

    /// Decode the payload as a typed message.
    pub fn decode<M: DeserializeOwned>(&self) -> Result<M, FrameError> {
        Ok(serde_json::from_slice(&self.payload)?)
    }

    /// Encode the frame to bytes for wire transmission.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(HEADER_SIZE + self.payload.len());
        buf.put_u32(self.payload.len() as u32);
        buf.put(self.payload.clone());
        buf.freeze()
    }

    /// Decode a frame from a contiguous byte buffer.
    pub fn decode_from_bytes(mut bytes: Bytes) -> Result<Self, FrameError> {
        if bytes.len() < HEADER_SIZE {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame header",
            )));
        }

        let length = bytes.get_u32() as usize;
        if length > MAX_FRAME_SIZE {
            return Err(FrameError::FrameTooLarge(length));
        }
        if bytes.len() < length {
            return Err(FrameError::Io(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                "incomplete frame payload",
            )));
        }

        let payload = bytes.split_to(length);
        Ok(Self { payload })
    }
}

/// Write a frame to an async writer.
pub async fn write_frame<W: AsyncWrite + Unpin>(
    writer: &mut W,
    frame: &Frame,
) -> Result<(), FrameError> {
    let encoded = frame.encode();
    writer.write_all(&encoded).await?;
    Ok(())
}

/// Read a frame from an async reader.
///
/// A clean EOF at a frame boundary maps to [`FrameError::ConnectionClosed`].
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Frame, FrameError> {
    let mut header = [0u8; HEADER_SIZE];
    match reader.read_exact(&mut header).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
            return Err(FrameError::ConnectionClosed);
        }
        Err(e) => return Err(e.into()),
    }

    let length = u32::from_be_bytes(header) as usize;
    if length > MAX_FRAME_SIZE {
        return Err(FrameError::FrameTooLarge(length));
    }

    let mut payload = vec![0u8; length];
    reader.read_exact(&mut payload).await?;

    Ok(Frame {
        payload: Bytes::from(payload),
    })
}

/// Framed codec for encoding/decoding frames on a stream.
pub struct FramedStream<S> {
    stream: S,
}

impl<S> FramedStream<S> {
    pub fn new(stream: S) -> Self {
        Self { stream }
    }

    pub fn into_inner(self) -> S {
        self.stream
    }
}

impl<S: AsyncRead + Unpin> FramedStream<S> {
    /// Read the next frame from the stream.
    pub async fn read_frame(&mut self) -> Result<Frame, FrameError> {
        read_frame(&mut self.stream).await
    }

    /// Read the next frame and decode it as a typed message.
    pub async fn read_json<M: DeserializeOwned>(&mut self) -> Result<M, FrameError> {
        self.read_frame().await?.decode()
    }
}

impl<S: AsyncWrite + Unpin> FramedStream<S> {
    /// Write a frame to the stream.
    pub async fn write_frame(&mut self, frame: &Frame) -> Result<(), FrameError> {
        write_frame(&mut self.stream, frame).await
    }

    /// Serialize a message and write it as one frame.
    pub async fn write_json<M: Serialize>(&mut self, msg: &M) -> Result<(), FrameError> {
        let frame = Frame::from_msg(msg)?;
        self.write_frame(&frame).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let msg = serde_json::json!({"type": "listInstances"});
        let frame = Frame::from_msg(&msg).unwrap();
        let encoded = frame.encode();
        let decoded = Frame::decode_from_bytes(encoded).unwrap();

        assert_eq!(frame.payload, decoded.payload);
        let value: serde_json::Value = decoded.decode().unwrap();
        assert_eq!(value, msg);
    }

    #[test]
    fn test_frame_encode_structure() {
        let msg = serde_json::json!({"type": "listInstances"});
        let frame = Frame::from_msg(&msg).unwrap();
        let encoded = frame.encode();

        assert_eq!(encoded.len(), HEADER_SIZE + frame.payload.len());
        let length = u32::from_be_bytes([encoded[0], encoded[1], encoded[2], encoded[3]]) as usize;
        assert_eq!(length, frame.payload.len());
    }

    #[test]
    fn test_decode_from_bytes_incomplete_header() {
        let bytes = Bytes::from_static(&[0, 0, 0]);
        let result = Frame::decode_from_bytes(bytes);
        match result.unwrap_err() {
            FrameError::Io(e) => assert!(e.to_string().contains("incomplete frame header")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_from_bytes_incomplete_payload() {
        let mut bytes = BytesMut::new();
        bytes.put_u32(100);
        bytes.put(&[0u8; 10][..]);

        let result = Frame::decode_from_bytes(bytes.freeze());
        match result.unwrap_err() {
            FrameError::Io(e) => assert!(e.to_string().contains("incomplete frame payload")),
            other => panic!("expected Io error, got {other:?}"),
        }
    }

    #[test]
    fn test_decode_from_bytes_frame_too_large() {
        let mut bytes = BytesMut::new();
        bytes.put_u32((MAX_FRAME_SIZE + 1) as u32);

        match Frame::decode_from_bytes(bytes.freeze()).unwrap_err() {
            FrameError::FrameTooLarge(size) => assert_eq!(size, MAX_FRAME_SIZE + 1),
            other => panic!("expected FrameTooLarge, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_read_write_frame() {
        use tokio::io::duplex;

        let msg = serde_json::json!({"type": "requestQr"});
        let frame = Frame::from_msg(&msg).unwrap();

        let (mut writer, mut reader) = duplex(1024);
        write_frame(&mut writer, &frame).await.unwrap();

        let read = read_frame(&mut reader).await.unwrap();
        assert_eq!(frame.payload, read.payload);
    }

    #[tokio::test]
    async fn test_read_frame_connection_closed() {
        use tokio::io::duplex;

        let (_, mut reader) = duplex(1024);
        // Writer is dropped, reader gets EOF at the frame boundary

        match read_frame(&mut reader).await.unwrap_err() {
            FrameError::ConnectionClosed => {}
            e => panic!("expected ConnectionClosed, got {e:?}"),
        }
    }

    #[tokio::test]
    async fn test_framed_stream_typed_round_trip() {
        use tokio::io::duplex;

        let (writer, reader) = duplex(4096);
        let mut writer = FramedStream::new(writer);
        let mut reader = FramedStream::new(reader);

        writer
            .write_json(&serde_json::json!({"type": "qr", "instanceId": "i1", "data": "ABC"}))
            .await
            .unwrap();
        writer
            .write_json(&serde_json::json!({"type": "listInstances"}))
            .await
            .unwrap();
        drop(writer);

        let first: serde_json::Value = reader.read_json().await.unwrap();
        let second: serde_json::Value = reader.read_json().await.unwrap();
        assert_eq!(first["data"], "ABC");
        assert_eq!(second["type"], "listInstances");
    }
}
