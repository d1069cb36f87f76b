//! Batch framing: a big-endian `u32` length followed by a MessagePack
//! encoded `Vec<Message>`.

use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::Message;

/// Largest batch accepted from a peer
pub const MAX_FRAME_BYTES: usize = 64 * 1024 * 1024;

#[derive(Debug, Error)]
pub enum CodecError {
    #[error("stream error: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode batch: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("failed to decode batch: {0}")]
    Decode(#[from] rmp_serde::decode::Error),

    #[error("incoming frame of {0} bytes exceeds limit")]
    FrameTooLarge(usize),

    #[error("outgoing batch of {0} bytes exceeds limit")]
    BatchTooLarge(usize),
}

impl CodecError {
    /// Whether the peer sent something we could not understand, as opposed
    /// to the connection itself failing
    pub fn is_decode(&self) -> bool {
        matches!(self, CodecError::Decode(_) | CodecError::FrameTooLarge(_))
    }

    /// Whether our own batch could not be turned into a frame. Nothing
    /// reached the peer.
    pub fn is_encode(&self) -> bool {
        matches!(self, CodecError::Encode(_) | CodecError::BatchTooLarge(_))
    }
}

pub fn encode_batch(batch: &[Message]) -> Result<Vec<u8>, CodecError> {
    Ok(rmp_serde::to_vec_named(batch)?)
}

pub fn decode_batch(bytes: &[u8]) -> Result<Vec<Message>, CodecError> {
    Ok(rmp_serde::from_slice(bytes)?)
}

/// Encode a batch together with its length prefix
pub fn encode_frame(batch: &[Message]) -> Result<Vec<u8>, CodecError> {
    encode_frame_within(batch, MAX_FRAME_BYTES)
}

fn encode_frame_within(batch: &[Message], limit: usize) -> Result<Vec<u8>, CodecError> {
    let body = encode_batch(batch)?;
    if body.len() > limit {
        return Err(CodecError::BatchTooLarge(body.len()));
    }
    let mut frame = Vec::with_capacity(body.len() + 4);
    frame.extend_from_slice(&(body.len() as u32).to_be_bytes());
    frame.extend_from_slice(&body);
    Ok(frame)
}

/// Write an already encoded frame and flush
pub async fn write_frame<W>(writer: &mut W, frame: &[u8]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    writer.write_all(frame).await?;
    writer.flush().await?;
    Ok(())
}

/// Write one framed batch and flush
pub async fn write_batch<W>(writer: &mut W, batch: &[Message]) -> Result<(), CodecError>
where
    W: AsyncWrite + Unpin,
{
    let frame = encode_frame(batch)?;
    write_frame(writer, &frame).await
}

/// Read one framed batch.
///
/// Returns `Ok(None)` when the peer closed the stream before sending a frame
/// header, which is how an empty response is signalled.
pub async fn read_batch<R>(reader: &mut R) -> Result<Option<Vec<Message>>, CodecError>
where
    R: AsyncRead + Unpin,
{
    let len = match reader.read_u32().await {
        Ok(len) => len as usize,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_BYTES {
        return Err(CodecError::FrameTooLarge(len));
    }

    let mut body = vec![0u8; len];
    reader.read_exact(&mut body).await?;
    decode_batch(&body).map(Some)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::Event;
    use crate::protocol::{Command, ReplayProgress, ServiceState};

    #[tokio::test]
    async fn test_mixed_batch_survives_framing() {
        let batch = vec![
            Message::Command(Command::FillReplayBuffer {
                sn: 3,
                num_events: 2,
                has_more: true,
            }),
            Message::Event(Event::input(0, 1, 3, 53, 420)),
            Message::Event(Event::activity_launch(10, 800, 77)),
            Message::ServiceState(ServiceState::Replaying(ReplayProgress {
                required_sn: 4,
                running_sn: 3,
                present_buffer_index: 1,
                present_buffer_size: 2,
            })),
            Message::Command(Command::RequestState),
        ];

        let (mut client, mut server) = tokio::io::duplex(4096);
        write_batch(&mut client, &batch).await.unwrap();
        drop(client);

        let decoded = read_batch(&mut server).await.unwrap();
        assert_eq!(decoded, Some(batch));
    }

    #[tokio::test]
    async fn test_closed_stream_means_no_batch() {
        let (client, mut server) = tokio::io::duplex(64);
        drop(client);
        assert!(read_batch(&mut server).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_oversized_header_is_rejected() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(u32::MAX).await.unwrap();
        drop(client);

        let err = read_batch(&mut server).await.unwrap_err();
        assert!(matches!(err, CodecError::FrameTooLarge(_)));
        assert!(err.is_decode());
    }

    #[test]
    fn test_oversized_outgoing_batch_is_a_local_error() {
        let batch = vec![
            Message::Event(Event::input(0, 1, 3, 53, 420)),
            Message::Event(Event::input(10, 1, 3, 53, 421)),
        ];
        let err = encode_frame_within(&batch, 8).unwrap_err();
        assert!(matches!(err, CodecError::BatchTooLarge(_)));
        assert!(err.is_encode());
        assert!(!err.is_decode());

        let frame = encode_frame(&batch).unwrap();
        let len = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]) as usize;
        assert_eq!(len, frame.len() - 4);
    }

    #[tokio::test]
    async fn test_garbage_body_is_a_decode_error() {
        let (mut client, mut server) = tokio::io::duplex(64);
        client.write_u32(3).await.unwrap();
        client.write_all(&[0xc1, 0xc1, 0xc1]).await.unwrap();
        drop(client);

        let err = read_batch(&mut server).await.unwrap_err();
        assert!(err.is_decode());
    }
}
