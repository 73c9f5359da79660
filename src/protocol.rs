//! Wire protocol between clients and the relay: length-delimited frames
//! carrying one JSON-encoded `PoseFrame` each. Fire-and-forget; no
//! envelope, no versioning, no acknowledgements.

use anyhow::Result;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use crate::pose::PoseFrame;

/// Pose payloads are small; a 1MB frame cap is generous headroom.
pub const MAX_FRAME_LENGTH: usize = 1024 * 1024;

pub type MessageStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Create a framed message stream with length-delimited framing.
pub fn message_stream(stream: TcpStream) -> MessageStream {
    framed_with_max(stream, MAX_FRAME_LENGTH)
}

pub fn framed_with_max(stream: TcpStream, max_frame_length: usize) -> MessageStream {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(max_frame_length)
        .new_codec();
    Framed::new(stream, codec)
}

/// Encode a pose frame to its wire bytes.
pub fn encode_frame(frame: &PoseFrame) -> Result<Bytes> {
    let data = serde_json::to_vec(frame)?;
    Ok(Bytes::from(data))
}

/// Decode wire bytes into a pose frame. A failure here is a per-message
/// error; callers drop the message and keep the connection.
pub fn decode_frame(bytes: &[u8]) -> Result<PoseFrame> {
    let frame = serde_json::from_slice(bytes)?;
    Ok(frame)
}

/// Send one pose frame.
pub async fn send_frame(stream: &mut MessageStream, frame: &PoseFrame) -> Result<()> {
    stream.send(encode_frame(frame)?).await?;
    Ok(())
}

/// Receive one pose frame. Returns Ok(None) when the peer closed cleanly.
pub async fn recv_frame(stream: &mut MessageStream) -> Result<Option<PoseFrame>> {
    match stream.next().await {
        Some(Ok(bytes)) => Ok(Some(decode_frame(&bytes)?)),
        Some(Err(e)) => Err(e.into()),
        None => Ok(None),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pose::{ImageSize, Keypoint, Part, Pose};

    fn sample_frame() -> PoseFrame {
        PoseFrame::new(
            vec![Pose::new(
                0.9,
                vec![Keypoint::new(Part::Nose, 100.0, 50.0, 0.95)],
            )],
            ImageSize {
                width: 640,
                height: 480,
            },
        )
    }

    #[test]
    fn test_encode_decode() {
        let frame = sample_frame();
        let bytes = encode_frame(&frame).unwrap();
        let decoded = decode_frame(&bytes).unwrap();
        assert_eq!(decoded, frame);
    }

    #[test]
    fn test_decode_malformed_is_error_not_panic() {
        assert!(decode_frame(b"not json").is_err());
        assert!(decode_frame(b"{\"poses\": 3}").is_err());
        // valid JSON, wrong shape
        assert!(decode_frame(b"{\"image\":{\"width\":1,\"height\":1}}").is_err());
    }

    #[tokio::test]
    async fn test_send_recv_over_tcp() {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (sock, _) = listener.accept().await.unwrap();
            let mut stream = message_stream(sock);
            recv_frame(&mut stream).await.unwrap()
        });

        let sock = TcpStream::connect(addr).await.unwrap();
        let mut stream = message_stream(sock);
        send_frame(&mut stream, &sample_frame()).await.unwrap();

        let received = server.await.unwrap();
        assert_eq!(received, Some(sample_frame()));
    }
}
