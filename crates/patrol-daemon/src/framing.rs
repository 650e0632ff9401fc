//! Stream-side frame codec for the endpoint sockets.
//!
//! Carves complete secure packets off the byte stream using the length
//! the packet header declares, and writes reply packets back out. The
//! cryptographic validation itself lives in `patrol_core::framing`; this
//! codec only finds frame boundaries, so a declared length outside the
//! protocol bound is unrecoverable and tears the connection down.

use bytes::{Buf, Bytes, BytesMut};
use patrol_core::framing::{FrameError, SecureCodec, HEADER_LEN};
use tokio_util::codec::{Decoder, Encoder};

/// Errors from stream framing.
#[derive(Debug, thiserror::Error)]
pub enum StreamError {
    /// Underlying socket I/O failed.
    #[error("socket error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream head cannot be a valid frame; resynchronisation is
    /// impossible on a bytestream, so the connection must close.
    #[error("unrecoverable framing error: {0}")]
    Frame(#[from] FrameError),
}

/// Codec pairing with [`tokio_util::codec::Framed`] on a connection.
#[derive(Debug, Clone, Copy, Default)]
pub struct FrameCodec;

impl FrameCodec {
    /// A new codec.
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FrameCodec {
    type Item = Bytes;
    type Error = StreamError;

    /// Decodes one complete secure packet.
    ///
    /// The declared length is validated against the protocol bound
    /// before any buffering decision, so a hostile length prefix cannot
    /// drive allocation.
    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Bytes>, StreamError> {
        match SecureCodec::frame_len(src.chunk()) {
            None => {
                src.reserve(HEADER_LEN);
                Ok(None)
            }
            Some(Err(err)) => Err(err.into()),
            Some(Ok(total)) => {
                if src.len() < total {
                    src.reserve(total - src.len());
                    return Ok(None);
                }
                Ok(Some(src.split_to(total).freeze()))
            }
        }
    }
}

impl Encoder<Vec<u8>> for FrameCodec {
    type Error = StreamError;

    /// Reply frames are already complete packets; they go out verbatim.
    fn encode(&mut self, item: Vec<u8>, dst: &mut BytesMut) -> Result<(), StreamError> {
        dst.extend_from_slice(&item);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use patrol_core::framing::Role;
    use patrol_core::SharedSecret;

    use super::*;

    fn frame() -> Vec<u8> {
        let secret = SharedSecret::from_bytes(b"0123456789abcdef0123456789abcdef".to_vec()).unwrap();
        SecureCodec::new(&secret, Role::Client).build(7, 1, b"payload")
    }

    #[test]
    fn partial_then_complete() {
        let mut codec = FrameCodec::new();
        let frame = frame();

        let mut buf = BytesMut::from(&frame[..HEADER_LEN - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[HEADER_LEN - 1..frame.len() - 1]);
        assert!(codec.decode(&mut buf).unwrap().is_none());

        buf.extend_from_slice(&frame[frame.len() - 1..]);
        let decoded = codec.decode(&mut buf).unwrap().unwrap();
        assert_eq!(&decoded[..], &frame[..]);
        assert!(buf.is_empty());
    }

    #[test]
    fn back_to_back_frames_split_cleanly() {
        let mut codec = FrameCodec::new();
        let frame = frame();

        let mut buf = BytesMut::new();
        buf.extend_from_slice(&frame);
        buf.extend_from_slice(&frame);

        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), frame.len());
        assert_eq!(codec.decode(&mut buf).unwrap().unwrap().len(), frame.len());
        assert!(codec.decode(&mut buf).unwrap().is_none());
    }

    #[test]
    fn hostile_length_is_fatal() {
        let mut codec = FrameCodec::new();
        let mut frame = frame();
        frame[16..20].copy_from_slice(&u32::MAX.to_le_bytes());

        let mut buf = BytesMut::from(&frame[..]);
        assert!(matches!(
            codec.decode(&mut buf),
            Err(StreamError::Frame(FrameError::PayloadTooLarge { .. }))
        ));
    }
}
