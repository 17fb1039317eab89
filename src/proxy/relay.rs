//! Bidirectional byte relay.
//!
//! Two one-directional copies run side by side. Whichever finishes first
//! fires a shared [`CancellationToken`]; the other copy observes it at its
//! next I/O boundary and returns [`Error::Timeout`], so a one-sided EOF
//! tears the whole relay down instead of leaving a parked task behind.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio_util::sync::CancellationToken;

use crate::error::{Error, Result};

/// Copy buffer size. Matches the largest AEAD chunk payload plus slack.
const COPY_BUF_SIZE: usize = 16 * 1024;

/// Result of a finished relay.
#[derive(Debug, Default)]
pub struct RelayOutcome {
    /// Bytes flushed to `right` (read from `left`).
    pub left_to_right: u64,
    /// Bytes flushed to `left` (read from `right`).
    pub right_to_left: u64,
    /// First error observed. Non-timeout errors win over forced teardown.
    pub error: Option<Error>,
}

impl RelayOutcome {
    /// Error worth reporting, i.e. anything but a forced teardown.
    pub fn failure(&self) -> Option<&Error> {
        self.error.as_ref().filter(|e| !e.is_timeout())
    }
}

/// Relay bytes between `left` and `right` until either side closes.
pub async fn relay<L, R>(left: L, right: R) -> RelayOutcome
where
    L: AsyncRead + AsyncWrite + Unpin,
    R: AsyncRead + AsyncWrite + Unpin,
{
    let (mut left_rd, mut left_wr) = tokio::io::split(left);
    let (mut right_rd, mut right_wr) = tokio::io::split(right);
    let token = CancellationToken::new();

    let ((left_to_right, err_lr), (right_to_left, err_rl)) = tokio::join!(
        copy_half(&mut left_rd, &mut right_wr, &token),
        copy_half(&mut right_rd, &mut left_wr, &token),
    );

    let error = match (err_lr, err_rl) {
        (Some(a), Some(b)) => Some(if a.is_timeout() { b } else { a }),
        (a, b) => a.or(b),
    };

    RelayOutcome {
        left_to_right,
        right_to_left,
        error,
    }
}

/// Copy `reader` into `writer` until EOF, error or cancellation, then cancel
/// the peer direction. Returns the bytes flushed and the terminating error.
async fn copy_half<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &CancellationToken,
) -> (u64, Option<Error>)
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut copied = 0u64;
    let result = copy_loop(reader, writer, token, &mut copied).await;
    token.cancel();
    (copied, result.err())
}

async fn copy_loop<R, W>(
    reader: &mut R,
    writer: &mut W,
    token: &CancellationToken,
    copied: &mut u64,
) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = vec![0u8; COPY_BUF_SIZE];

    loop {
        let n = tokio::select! {
            _ = token.cancelled() => return Err(Error::Timeout),
            res = reader.read(&mut buf) => res?,
        };

        if n == 0 {
            // Propagate EOF so buffered ciphertext reaches the peer.
            tokio::select! {
                _ = token.cancelled() => return Err(Error::Timeout),
                res = writer.shutdown() => res?,
            }
            return Ok(());
        }

        let mut off = 0;
        while off < n {
            let written = tokio::select! {
                _ = token.cancelled() => return Err(Error::Timeout),
                res = writer.write(&buf[off..n]) => res?,
            };
            if written == 0 {
                return Err(Error::Network(std::io::ErrorKind::WriteZero.into()));
            }
            off += written;
        }

        // A sealing writer may still hold the chunk until flushed.
        tokio::select! {
            _ = token.cancelled() => return Err(Error::Timeout),
            res = writer.flush() => res?,
        }
        *copied += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;
    use std::pin::Pin;
    use std::task::{Context, Poll};
    use std::time::Duration;
    use tokio::io::duplex;
    use tokio::time::timeout;

    /// Accepts every write but never completes a flush.
    #[derive(Default)]
    struct StalledFlush {
        accepted: usize,
    }

    impl AsyncWrite for StalledFlush {
        fn poll_write(
            mut self: Pin<&mut Self>,
            _cx: &mut Context<'_>,
            buf: &[u8],
        ) -> Poll<io::Result<usize>> {
            self.accepted += buf.len();
            Poll::Ready(Ok(buf.len()))
        }

        fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }

        fn poll_shutdown(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<()>> {
            Poll::Pending
        }
    }

    #[tokio::test]
    async fn test_counts_and_eof_teardown() {
        let (mut client, left) = duplex(1024);
        let (right, mut target) = duplex(1024);

        let relay_task = tokio::spawn(relay(left, right));

        client.write_all(b"hello").await.unwrap();
        let mut buf = [0u8; 5];
        target.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hello");

        target.write_all(b"world!").await.unwrap();
        let mut buf = [0u8; 6];
        client.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"world!");

        drop(client);

        let outcome = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay must finish after EOF")
            .unwrap();
        assert_eq!(outcome.left_to_right, 5);
        assert_eq!(outcome.right_to_left, 6);
        assert!(outcome.failure().is_none());
    }

    #[tokio::test]
    async fn test_cancellation_is_timeout() {
        let (client, left) = duplex(64);
        let (right, target) = duplex(64);

        let relay_task = tokio::spawn(relay(left, right));

        // The target hangs up without sending anything while the client
        // stays silent: the left-to-right copy is parked on read.
        drop(target);

        let outcome = timeout(Duration::from_secs(5), relay_task)
            .await
            .expect("relay must not hang on a one-sided EOF")
            .unwrap();
        assert_eq!(outcome.left_to_right, 0);
        assert_eq!(outcome.right_to_left, 0);
        assert!(outcome.error.as_ref().map_or(false, |e| e.is_timeout()));
        assert!(outcome.failure().is_none());

        drop(client);
    }

    #[tokio::test]
    async fn test_bulk_transfer_counts() {
        let (mut client, left) = duplex(4096);
        let (right, mut target) = duplex(4096);

        let relay_task = tokio::spawn(relay(left, right));
        let payload: Vec<u8> = (0..100_000u32).map(|i| i as u8).collect();

        let expected = payload.clone();
        let reader = tokio::spawn(async move {
            let mut got = vec![0u8; expected.len()];
            target.read_exact(&mut got).await.unwrap();
            assert_eq!(got, expected);
            target
        });

        client.write_all(&payload).await.unwrap();
        let target = reader.await.unwrap();
        drop(client);

        let outcome = timeout(Duration::from_secs(5), relay_task).await.unwrap().unwrap();
        assert_eq!(outcome.left_to_right, 100_000);
        assert_eq!(outcome.right_to_left, 0);
        drop(target);
    }

    #[tokio::test]
    async fn test_unflushed_bytes_not_counted() {
        let token = CancellationToken::new();
        let mut reader: &[u8] = b"hello";
        let mut writer = StalledFlush::default();

        let cancel = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            cancel.cancel();
        });

        let (copied, error) = timeout(
            Duration::from_secs(5),
            copy_half(&mut reader, &mut writer, &token),
        )
        .await
        .expect("cancellation ends the copy");

        assert_eq!(writer.accepted, 5);
        assert_eq!(copied, 0);
        assert!(error.map_or(false, |e| e.is_timeout()));
    }
}
