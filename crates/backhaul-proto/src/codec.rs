//! `tokio_util` codec for multiplexing frames

use bytes::BytesMut;
use tokio_util::codec::{Decoder, Encoder};

use crate::mux::{Frame, MuxError};

/// Frame codec used by `Framed` on an authenticated link
#[derive(Debug, Default, Clone, Copy)]
pub struct FrameCodec;

impl FrameCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Frame;
    type Error = MuxError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Frame>, MuxError> {
        Frame::decode_from(src)
    }
}

impl Encoder<Frame> for FrameCodec {
    type Error = MuxError;

    fn encode(&mut self, frame: Frame, dst: &mut BytesMut) -> Result<(), MuxError> {
        frame.encode_into(dst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    #[test]
    fn test_decode_multiple_frames() {
        let mut codec = FrameCodec::new();
        let mut buf = BytesMut::new();

        codec.encode(Frame::open(1), &mut buf).unwrap();
        codec
            .encode(Frame::data(1, Bytes::from_static(b"ping")), &mut buf)
            .unwrap();
        codec.encode(Frame::fin(1), &mut buf).unwrap();

        let first = codec.decode(&mut buf).unwrap().unwrap();
        let second = codec.decode(&mut buf).unwrap().unwrap();
        let third = codec.decode(&mut buf).unwrap().unwrap();

        assert_eq!(first, Frame::open(1));
        assert_eq!(&second.payload[..], b"ping");
        assert!(third.flags.has_fin());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }
}
