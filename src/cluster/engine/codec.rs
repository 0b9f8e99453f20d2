//! Length-prefixed frame codec for consensus messages.
//!
//! One frame is a 4-byte big-endian length followed by a prost-encoded
//! `raft::prelude::Message`.  A frame is written with a single write
//! call, so on the websocket byte-stream adapter one frame is exactly
//! one binary websocket message.

use std::io;

use protobuf::Message as _;
use raft::prelude::Message;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single frame; a larger prefix means a corrupt or
/// hostile stream.
const MAX_FRAME: usize = 16 * 1024 * 1024;

/// Read one consensus message from the stream.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Message> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf).await?;
    let len = u32::from_be_bytes(len_buf) as usize;

    if len > MAX_FRAME {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {len} bytes exceeds maximum"),
        ));
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;

    Message::parse_from_bytes(&buf[..]).map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))
}

/// Write one consensus message to the stream as a single frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> io::Result<()> {
    let body = msg
        .write_to_bytes()
        .map_err(|err| io::Error::new(io::ErrorKind::InvalidData, err))?;
    let mut frame = Vec::with_capacity(4 + body.len());
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);

    // One buffer, one write: one websocket message per frame.
    writer.write_all(&frame).await?;
    writer.flush().await
}

#[cfg(test)]
mod tests {
    use super::*;
    use raft::prelude::MessageType;

    #[tokio::test]
    async fn test_round_trip() {
        let (mut a, mut b) = tokio::io::duplex(4096);

        let mut msg = Message::default();
        msg.set_msg_type(MessageType::MsgHeartbeat);
        msg.to = 7;
        msg.from = 3;
        msg.term = 42;

        write_frame(&mut a, &msg).await.unwrap();
        let back = read_frame(&mut b).await.unwrap();

        assert_eq!(back.msg_type, MessageType::MsgHeartbeat);
        assert_eq!(back.to, 7);
        assert_eq!(back.from, 3);
        assert_eq!(back.term, 42);
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64);

        let len = (MAX_FRAME as u32 + 1).to_be_bytes();
        a.write_all(&len).await.unwrap();

        let err = read_frame(&mut b).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn test_eof_mid_frame() {
        let (mut a, mut b) = tokio::io::duplex(64);

        a.write_all(&8u32.to_be_bytes()).await.unwrap();
        a.write_all(&[1, 2, 3]).await.unwrap();
        drop(a);

        assert!(read_frame(&mut b).await.is_err());
    }
}
