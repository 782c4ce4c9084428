//! Multiplexing frames carried over an authenticated link

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

/// Stream identifier
pub type StreamId = u32;

/// Frame types for multiplexing
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    Open = 0,
    Data = 1,
    Close = 2,
    /// Grants the peer more send credit on a stream
    WindowUpdate = 3,
}

impl TryFrom<u8> for FrameType {
    type Error = MuxError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameType::Open),
            1 => Ok(FrameType::Data),
            2 => Ok(FrameType::Close),
            3 => Ok(FrameType::WindowUpdate),
            _ => Err(MuxError::InvalidFrameType(value)),
        }
    }
}

/// Frame flags
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameFlags(u8);

impl FrameFlags {
    /// Sender will write no more data on this stream
    pub const FIN: u8 = 0b0000_0001;
    /// Stream is gone in both directions
    pub const RST: u8 = 0b0000_0100;

    pub fn new() -> Self {
        Self(0)
    }

    pub fn with_fin(mut self) -> Self {
        self.0 |= Self::FIN;
        self
    }

    pub fn with_rst(mut self) -> Self {
        self.0 |= Self::RST;
        self
    }

    pub fn has_fin(&self) -> bool {
        self.0 & Self::FIN != 0
    }

    pub fn has_rst(&self) -> bool {
        self.0 & Self::RST != 0
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

impl Default for FrameFlags {
    fn default() -> Self {
        Self::new()
    }
}

/// Multiplexed frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub stream_id: StreamId,
    pub frame_type: FrameType,
    pub flags: FrameFlags,
    pub payload: Bytes,
}

impl Frame {
    /// Frame header size: stream_id (4) + frame_type (1) + flags (1) + length (4) = 10 bytes
    pub const HEADER_SIZE: usize = 10;

    pub fn new(stream_id: StreamId, frame_type: FrameType, payload: Bytes) -> Self {
        Self {
            stream_id,
            frame_type,
            flags: FrameFlags::new(),
            payload,
        }
    }

    pub fn open(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Open, Bytes::new())
    }

    pub fn data(stream_id: StreamId, payload: Bytes) -> Self {
        Self::new(stream_id, FrameType::Data, payload)
    }

    /// Half-close: the sender is done writing
    pub fn fin(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_fin())
    }

    /// Full close of the stream
    pub fn reset(stream_id: StreamId) -> Self {
        Self::new(stream_id, FrameType::Close, Bytes::new()).with_flags(FrameFlags::new().with_rst())
    }

    /// Let the peer send `credit` more bytes on the stream
    pub fn window_update(stream_id: StreamId, credit: u32) -> Self {
        Self::new(
            stream_id,
            FrameType::WindowUpdate,
            Bytes::copy_from_slice(&credit.to_be_bytes()),
        )
    }

    /// Credit carried by a window update, `None` for a malformed payload
    pub fn window_credit(&self) -> Option<u32> {
        let bytes: [u8; 4] = self.payload.as_ref().try_into().ok()?;
        Some(u32::from_be_bytes(bytes))
    }

    pub fn with_flags(mut self, flags: FrameFlags) -> Self {
        self.flags = flags;
        self
    }

    /// Encode the frame into `buf`
    pub fn encode_into(&self, buf: &mut BytesMut) -> Result<(), MuxError> {
        let payload_len = self.payload.len();
        if payload_len > crate::MAX_FRAME_SIZE as usize {
            return Err(MuxError::FrameTooLarge(payload_len));
        }

        buf.reserve(Self::HEADER_SIZE + payload_len);
        buf.put_u32(self.stream_id);
        buf.put_u8(self.frame_type as u8);
        buf.put_u8(self.flags.as_u8());
        buf.put_u32(payload_len as u32);
        buf.put_slice(&self.payload);

        Ok(())
    }

    /// Encode frame to bytes
    pub fn encode(&self) -> Result<Bytes, MuxError> {
        let mut buf = BytesMut::with_capacity(Self::HEADER_SIZE + self.payload.len());
        self.encode_into(&mut buf)?;
        Ok(buf.freeze())
    }

    /// Decode one frame from the front of `buf`.
    ///
    /// Returns `Ok(None)` and leaves `buf` untouched when the frame is not
    /// complete yet.
    pub fn decode_from(buf: &mut BytesMut) -> Result<Option<Self>, MuxError> {
        if buf.len() < Self::HEADER_SIZE {
            return Ok(None);
        }

        let mut header = &buf[..Self::HEADER_SIZE];
        let stream_id = header.get_u32();
        let frame_type = FrameType::try_from(header.get_u8())?;
        let flags = FrameFlags::from_u8(header.get_u8());
        let length = header.get_u32();

        if length > crate::MAX_FRAME_SIZE {
            return Err(MuxError::FrameTooLarge(length as usize));
        }

        if buf.len() < Self::HEADER_SIZE + length as usize {
            buf.reserve(Self::HEADER_SIZE + length as usize - buf.len());
            return Ok(None);
        }

        buf.advance(Self::HEADER_SIZE);
        let payload = buf.split_to(length as usize).freeze();

        Ok(Some(Self {
            stream_id,
            frame_type,
            flags,
            payload,
        }))
    }
}

/// Multiplexer errors
#[derive(Debug, Error)]
pub enum MuxError {
    #[error("Invalid frame type: {0}")]
    InvalidFrameType(u8),

    #[error("Frame too large: {0} bytes")]
    FrameTooLarge(usize),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_encode_decode() {
        let payload = Bytes::from("hello world");
        let frame = Frame::data(42, payload.clone());

        let mut buf = BytesMut::from(&frame.encode().unwrap()[..]);
        let decoded = Frame::decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.stream_id, 42);
        assert_eq!(decoded.frame_type, FrameType::Data);
        assert_eq!(decoded.payload, payload);
        assert!(buf.is_empty());
    }

    #[test]
    fn test_window_update_credit() {
        let frame = Frame::window_update(3, 65_536);
        let mut buf = BytesMut::from(&frame.encode().unwrap()[..]);
        let decoded = Frame::decode_from(&mut buf).unwrap().unwrap();

        assert_eq!(decoded.frame_type, FrameType::WindowUpdate);
        assert_eq!(decoded.window_credit(), Some(65_536));
        assert_eq!(Frame::data(3, Bytes::from_static(b"abc")).window_credit(), None);
    }

    #[test]
    fn test_close_flags() {
        let fin = Frame::fin(10);
        assert!(fin.flags.has_fin());
        assert!(!fin.flags.has_rst());

        let rst = Frame::reset(10);
        assert!(rst.flags.has_rst());
        assert!(!rst.flags.has_fin());
        assert_eq!(rst.frame_type, FrameType::Close);
    }

    #[test]
    fn test_decode_partial_frame() {
        let encoded = Frame::data(7, Bytes::from_static(b"abcdef")).encode().unwrap();

        let mut buf = BytesMut::from(&encoded[..4]);
        assert!(Frame::decode_from(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&encoded[4..12]);
        assert!(Frame::decode_from(&mut buf).unwrap().is_none());
        assert_eq!(buf.len(), 12);

        buf.extend_from_slice(&encoded[12..]);
        let frame = Frame::decode_from(&mut buf).unwrap().unwrap();
        assert_eq!(&frame.payload[..], b"abcdef");
    }

    #[test]
    fn test_invalid_frame_type() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(9);
        buf.put_u8(0);
        buf.put_u32(0);

        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(MuxError::InvalidFrameType(9))
        ));
    }

    #[test]
    fn test_oversized_length_rejected() {
        let mut buf = BytesMut::new();
        buf.put_u32(1);
        buf.put_u8(FrameType::Data as u8);
        buf.put_u8(0);
        buf.put_u32(crate::MAX_FRAME_SIZE + 1);

        assert!(matches!(
            Frame::decode_from(&mut buf),
            Err(MuxError::FrameTooLarge(_))
        ));
    }
}
