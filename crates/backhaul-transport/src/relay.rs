//! Bidirectional byte pump between two streams

use std::io;
use tokio::io::{AsyncRead, AsyncWrite, BufReader};

/// Buffer used for each direction of a relay
pub const COPY_BUFFER_SIZE: usize = 16 * 1024;

/// Copy bytes both ways between `a` and `b` until either direction stops.
///
/// Returns the outcome of whichever direction finished first; end-of-stream
/// is `Ok(())`. The other direction is abandoned and both values are dropped
/// on return, so closing them is the caller dropping them.
pub async fn dual_copy<A, B>(a: A, b: B) -> io::Result<()>
where
    A: AsyncRead + AsyncWrite + Send + Unpin,
    B: AsyncRead + AsyncWrite + Send + Unpin,
{
    let (a_read, mut a_write) = tokio::io::split(a);
    let (b_read, mut b_write) = tokio::io::split(b);

    let mut a_read = BufReader::with_capacity(COPY_BUFFER_SIZE, a_read);
    let mut b_read = BufReader::with_capacity(COPY_BUFFER_SIZE, b_read);

    let result = tokio::select! {
        r = tokio::io::copy_buf(&mut a_read, &mut b_write) => r,
        r = tokio::io::copy_buf(&mut b_read, &mut a_write) => r,
    };

    result.map(|_| ())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadBuf};

    #[tokio::test]
    async fn test_dual_copy_relays_both_directions() {
        let (mut client, a) = tokio::io::duplex(1024);
        let (b, mut backend) = tokio::io::duplex(1024);

        let relay = tokio::spawn(dual_copy(a, b));

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        backend.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        backend.write_all(b"pong").await.unwrap();
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one side ends the relay cleanly
        drop(client);
        assert!(relay.await.unwrap().is_ok());

        // Relay dropped its end of the backend pipe
        let mut rest = Vec::new();
        backend.read_to_end(&mut rest).await.unwrap();
        assert!(rest.is_empty());
    }

    #[tokio::test]
    async fn test_dual_copy_large_payload() {
        let (mut client, a) = tokio::io::duplex(4096);
        let (b, mut backend) = tokio::io::duplex(4096);

        tokio::spawn(dual_copy(a, b));

        let payload: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        let expected = payload.clone();
        let writer = tokio::spawn(async move {
            client.write_all(&payload).await.unwrap();
            client
        });

        let mut received = vec![0u8; expected.len()];
        backend.read_exact(&mut received).await.unwrap();
        assert_eq!(received, expected);
        drop(writer.await.unwrap());
    }

    struct FailingReader;

    impl AsyncRead for FailingReader {
        fn poll_read(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            _buf: &mut ReadBuf<'_>,
        ) -> Poll<io::Result<()>> {
            Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")))
        }
    }

    impl AsyncWrite for FailingReader {
        fn poll_write(
            self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Ready(Ok(()))
        }
    }

    #[tokio::test]
    async fn test_dual_copy_reports_first_error() {
        let (_client, a) = tokio::io::duplex(1024);

        let err = dual_copy(a, FailingReader).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionReset);
    }
}
