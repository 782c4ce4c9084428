//! Handshake framing used once per physical link before multiplexing starts
//!
//! Every message is a 2-byte header `[cmd, length]` followed by exactly
//! `length` bytes of payload, so payloads are capped at 255 bytes.
//!
//! ```text
//! agent                                exposure server
//!   │ ── ShakeHands{token} ─────────────────▶ │
//!   │ ◀──────────── ShakeHandsOk / Error{why} │
//!   │ ═════════ multiplexed frames ═════════ │
//! ```

use std::time::Duration;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Header size: cmd (1) + length (1)
pub const HEADER_SIZE: usize = 2;

/// Largest payload a single handshake message can carry
pub const MAX_PAYLOAD_SIZE: usize = u8::MAX as usize;

/// Reason sent to agents presenting a token the server does not know
pub const INVALID_TOKEN: &str = "invalid token";

/// Handshake commands
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Command {
    /// Server → agent failure, payload is a human readable reason
    Error = 0x00,
    /// Agent → server, payload is the service token
    ShakeHands = 0x7d,
    /// Server → agent success acknowledgement
    ShakeHandsOk = 0x7e,
}

impl TryFrom<u8> for Command {
    type Error = HandshakeError;

    fn try_from(value: u8) -> Result<Self, HandshakeError> {
        match value {
            0x00 => Ok(Command::Error),
            0x7d => Ok(Command::ShakeHands),
            0x7e => Ok(Command::ShakeHandsOk),
            _ => Err(HandshakeError::UnknownCommand(value)),
        }
    }
}

/// Handshake errors
#[derive(Debug, Error)]
pub enum HandshakeError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Handshake timed out after {0:?}")]
    Timeout(Duration),

    #[error("Unknown handshake command: {0:#04x}")]
    UnknownCommand(u8),

    #[error("Unexpected handshake command: {0:?}")]
    UnexpectedCommand(Command),

    #[error("Payload too large: {0} bytes")]
    PayloadTooLarge(usize),

    #[error("Rejected by server: {0}")]
    Rejected(String),
}

impl HandshakeError {
    /// Whether the physical connection failed (short read, reset, deadline)
    /// rather than the peer speaking the protocol wrongly
    pub fn is_transport(&self) -> bool {
        matches!(self, HandshakeError::Io(_) | HandshakeError::Timeout(_))
    }
}

/// A decoded handshake message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub command: Command,
    pub payload: String,
}

impl Message {
    pub fn new(command: Command, payload: impl Into<String>) -> Self {
        Self {
            command,
            payload: payload.into(),
        }
    }

    pub fn shake_hands(token: &str) -> Self {
        Self::new(Command::ShakeHands, token)
    }

    pub fn shake_hands_ok() -> Self {
        Self::new(Command::ShakeHandsOk, "ok")
    }

    pub fn error(reason: &str) -> Self {
        Self::new(Command::Error, reason)
    }

    /// Encode to wire format
    pub fn encode(&self) -> Result<Vec<u8>, HandshakeError> {
        let payload = self.payload.as_bytes();
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(HandshakeError::PayloadTooLarge(payload.len()));
        }

        let mut buf = Vec::with_capacity(HEADER_SIZE + payload.len());
        buf.push(self.command as u8);
        buf.push(payload.len() as u8);
        buf.extend_from_slice(payload);
        Ok(buf)
    }
}

/// Read one handshake message.
///
/// The deadline covers header and payload together and only lives as long as
/// this call; a zero `timeout` waits indefinitely.
pub async fn read_message<R>(reader: &mut R, timeout: Duration) -> Result<Message, HandshakeError>
where
    R: AsyncRead + Unpin,
{
    with_deadline(timeout, async {
        let mut header = [0u8; HEADER_SIZE];
        reader.read_exact(&mut header).await?;

        let mut payload = vec![0u8; header[1] as usize];
        reader.read_exact(&mut payload).await?;

        let command = Command::try_from(header[0])?;
        Ok(Message {
            command,
            payload: String::from_utf8_lossy(&payload).into_owned(),
        })
    })
    .await
}

/// Write one handshake message, bounded by `timeout` (zero = no deadline)
pub async fn write_message<W>(
    writer: &mut W,
    message: &Message,
    timeout: Duration,
) -> Result<(), HandshakeError>
where
    W: AsyncWrite + Unpin,
{
    let buf = message.encode()?;
    with_deadline(timeout, async {
        writer.write_all(&buf).await?;
        writer.flush().await?;
        Ok(())
    })
    .await
}

async fn with_deadline<T, F>(timeout: Duration, fut: F) -> Result<T, HandshakeError>
where
    F: std::future::Future<Output = Result<T, HandshakeError>>,
{
    if timeout.is_zero() {
        return fut.await;
    }
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| HandshakeError::Timeout(timeout))?
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_then_read() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_message(&mut a, &Message::shake_hands("abc123"), Duration::from_secs(1))
            .await
            .unwrap();
        let msg = read_message(&mut b, Duration::from_secs(1)).await.unwrap();

        assert_eq!(msg.command, Command::ShakeHands);
        assert_eq!(msg.payload, "abc123");
    }

    #[test]
    fn test_wire_layout() {
        let encoded = Message::error(INVALID_TOKEN).encode().unwrap();
        assert_eq!(encoded[0], 0x00);
        assert_eq!(encoded[1] as usize, INVALID_TOKEN.len());
        assert_eq!(&encoded[2..], INVALID_TOKEN.as_bytes());

        let ok = Message::shake_hands_ok().encode().unwrap();
        assert_eq!(ok[0], 0x7e);
    }

    #[test]
    fn test_payload_limit() {
        let long = "x".repeat(MAX_PAYLOAD_SIZE + 1);
        let err = Message::shake_hands(&long).encode().unwrap_err();
        assert!(matches!(err, HandshakeError::PayloadTooLarge(256)));

        let max = "x".repeat(MAX_PAYLOAD_SIZE);
        assert_eq!(Message::shake_hands(&max).encode().unwrap().len(), 257);
    }

    #[tokio::test]
    async fn test_short_payload_is_transport_error() {
        let (mut a, mut b) = tokio::io::duplex(64);
        // Header promises 10 bytes, only 3 arrive before EOF
        a.write_all(&[0x7d, 10, b'a', b'b', b'c']).await.unwrap();
        drop(a);

        let err = read_message(&mut b, Duration::from_secs(1)).await.unwrap_err();
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_unknown_command() {
        let (mut a, mut b) = tokio::io::duplex(64);
        a.write_all(&[0x42, 0]).await.unwrap();

        let err = read_message(&mut b, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::UnknownCommand(0x42)));
        assert!(!err.is_transport());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout() {
        let (_a, mut b) = tokio::io::duplex(64);

        let err = read_message(&mut b, Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(err, HandshakeError::Timeout(_)));
        assert!(err.is_transport());
    }

    #[tokio::test]
    async fn test_deadline_does_not_outlive_call() {
        let (mut a, mut b) = tokio::io::duplex(64);

        write_message(&mut a, &Message::shake_hands_ok(), Duration::from_millis(50))
            .await
            .unwrap();
        read_message(&mut b, Duration::from_millis(50)).await.unwrap();

        // Well past the earlier deadline, the same stream still reads fine
        tokio::time::sleep(Duration::from_millis(100)).await;
        a.write_all(b"raw").await.unwrap();
        let mut buf = [0u8; 3];
        b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"raw");
    }
}
