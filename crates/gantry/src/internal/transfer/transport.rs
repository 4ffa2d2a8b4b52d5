//! Framing of agent connections.
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

/// Frames carry a little endian `u32` length prefix and at most
/// [`crate::MAX_FRAME_SIZE`] bytes of payload.
pub(crate) fn agent_codec() -> LengthDelimitedCodec {
    LengthDelimitedCodec::builder()
        .little_endian()
        .length_field_type::<u32>()
        .max_frame_length(crate::MAX_FRAME_SIZE)
        .new_codec()
}

pub(crate) fn framed_agent_connection<T: AsyncRead + AsyncWrite>(
    io: T,
) -> Framed<T, LengthDelimitedCodec> {
    Framed::new(io, agent_codec())
}

#[cfg(test)]
mod tests {
    use bytes::{Bytes, BytesMut};
    use tokio_util::codec::{Decoder, Encoder};

    use super::*;

    #[test]
    fn test_frame_layout() {
        let mut buffer = BytesMut::new();
        agent_codec()
            .encode(Bytes::from_static(b"abc"), &mut buffer)
            .unwrap();
        assert_eq!(&buffer[..], &[3, 0, 0, 0, b'a', b'b', b'c']);
    }

    #[test]
    fn test_oversized_frames_are_refused() {
        let mut codec = agent_codec();
        let mut buffer = BytesMut::new();
        assert!(
            codec
                .encode(Bytes::from(vec![0; crate::MAX_FRAME_SIZE + 1]), &mut buffer)
                .is_err()
        );

        let mut incoming = BytesMut::new();
        incoming.extend_from_slice(&(crate::MAX_FRAME_SIZE as u32 + 1).to_le_bytes());
        assert!(codec.decode(&mut incoming).is_err());
    }
}
