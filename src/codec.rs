//! Framing of [`Message`]s on a byte stream.
//!
//! A frame is a big-endian `u32` length followed by that many bytes of
//! bincode-encoded [`Message`]. The variant index of the message body is the
//! type discriminant, so an unknown discriminant fails to decode. Every frame
//! received by the server is answered with a single raw [`ACKNOWLEDGMENT`]
//! byte, written outside of the framing.

use std::io;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use bytes::BytesMut;
use futures::SinkExt;
use futures::TryStreamExt;
use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::io::AsyncWrite;
use tokio::io::AsyncWriteExt;
use tokio_serde::formats::Bincode;
use tokio_serde::formats::SymmetricalBincode;
use tokio_serde::Serializer;
use tokio_serde::SymmetricallyFramed;
use tokio_util::codec::Encoder;
use tokio_util::codec::Framed;
use tokio_util::codec::LengthDelimitedCodec;

use crate::models::message::Message;

/// Sentinel written back after each processed message. It means "received
/// and attempted", not "accepted".
pub const ACKNOWLEDGMENT: u8 = 1;

// Announcements carry a key ring and a few strings; 1MB is plenty.
pub const DEFAULT_MAX_FRAME_LENGTH_IN_BYTES: usize = 1024 * 1024;

#[derive(Debug, thiserror::Error)]
pub enum WireError {
    #[error("malformed message: {0}")]
    MalformedMessage(String),

    #[error("connection idle for more than {0:?}")]
    IdleTimeout(Duration),

    #[error("expected acknowledgment byte, got {0:#04x}")]
    UnexpectedAcknowledgment(u8),

    #[error(transparent)]
    Io(#[from] io::Error),
}

impl WireError {
    /// Errors coming out of the framed stream are either decoding failures
    /// or plain transport failures.
    fn from_stream_error(err: io::Error) -> Self {
        let is_bincode_error = err.get_ref().is_some_and(|inner| {
            inner.is::<bincode::ErrorKind>() || inner.is::<Box<bincode::ErrorKind>>()
        });

        if is_bincode_error
            || matches!(
                err.kind(),
                io::ErrorKind::InvalidData | io::ErrorKind::UnexpectedEof | io::ErrorKind::Other
            )
        {
            WireError::MalformedMessage(err.to_string())
        } else {
            WireError::Io(err)
        }
    }
}

pub type MessageStream<S> =
    tokio_serde::Framed<Framed<S, LengthDelimitedCodec>, Message, Message, Bincode<Message, Message>>;

/// Use this function to ensure that the same rules apply for both
/// ingoing and outgoing connections. This limits the size of messages
/// peers can send.
pub fn get_codec_rules(max_frame_length: usize) -> LengthDelimitedCodec {
    let mut codec_rules = LengthDelimitedCodec::new();
    codec_rules.set_max_frame_length(max_frame_length);
    codec_rules
}

/// Build the communication/serialization/frame handler
pub fn frame<S>(stream: S, max_frame_length: usize) -> MessageStream<S>
where
    S: AsyncRead + AsyncWrite,
{
    let length_delimited = Framed::new(stream, get_codec_rules(max_frame_length));
    SymmetricallyFramed::new(length_delimited, SymmetricalBincode::default())
}

/// Wait for the next complete message. `Ok(None)` means the peer closed its
/// side cleanly between messages.
pub async fn read_message<S>(
    peer: &mut MessageStream<S>,
    idle_timeout: Duration,
) -> Result<Option<Message>, WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match tokio::time::timeout(idle_timeout, peer.try_next()).await {
        Ok(result) => result.map_err(WireError::from_stream_error),
        Err(_elapsed) => Err(WireError::IdleTimeout(idle_timeout)),
    }
}

pub async fn send_message<S>(peer: &mut MessageStream<S>, message: Message) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    peer.send(message).await?;
    Ok(())
}

pub async fn write_acknowledgment<S>(peer: &mut MessageStream<S>) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = peer.get_mut().get_mut();
    stream.write_all(&[ACKNOWLEDGMENT]).await?;
    stream.flush().await?;
    Ok(())
}

pub async fn read_acknowledgment<S>(
    peer: &mut MessageStream<S>,
    timeout: Duration,
) -> Result<(), WireError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let stream = peer.get_mut().get_mut();
    let byte = tokio::time::timeout(timeout, stream.read_u8())
        .await
        .map_err(|_elapsed| WireError::IdleTimeout(timeout))??;
    if byte != ACKNOWLEDGMENT {
        return Err(WireError::UnexpectedAcknowledgment(byte));
    }
    Ok(())
}

/// The exact bytes `frame(..)` puts on the wire for `message`.
pub fn encode(message: &Message) -> Result<Bytes, WireError> {
    let mut transport = LengthDelimitedCodec::new();
    let mut formatting = SymmetricalBincode::<Message>::default();
    let mut buf = BytesMut::new();
    transport.encode(Pin::new(&mut formatting).serialize(message)?, &mut buf)?;
    Ok(buf.freeze())
}
