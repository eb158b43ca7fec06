use std::time::Duration;

use tokio::{
    io::{AsyncRead, AsyncWrite},
    sync::watch,
};

use crate::culvert::tunnel::shutdown_requested;

struct ActiveRelayGuard;

impl ActiveRelayGuard {
    fn new() -> Self {
        metrics::counter!("culvert_relays_total").increment(1);
        metrics::gauge!("culvert_active_relays").increment(1.0);
        Self
    }
}

impl Drop for ActiveRelayGuard {
    fn drop(&mut self) {
        metrics::gauge!("culvert_active_relays").decrement(1.0);
    }
}

/// Copy bytes both ways until either side closes. When `session` signals
/// shutdown (or its sender is gone) the pair gets `grace` to finish in
/// flight traffic, then is force-closed. Returns bytes copied (a->b, b->a).
pub async fn run_pair<A, B>(
    a: &mut A,
    b: &mut B,
    mut session: watch::Receiver<bool>,
    grace: Duration,
) -> std::io::Result<(u64, u64)>
where
    A: AsyncRead + AsyncWrite + Unpin,
    B: AsyncRead + AsyncWrite + Unpin,
{
    let _guard = ActiveRelayGuard::new();

    let copy = tokio::io::copy_bidirectional(a, b);
    tokio::pin!(copy);

    tokio::select! {
        res = &mut copy => res,
        _ = shutdown_requested(&mut session) => {
            match tokio::time::timeout(grace, &mut copy).await {
                Ok(res) => res,
                Err(_) => Err(std::io::Error::new(
                    std::io::ErrorKind::TimedOut,
                    "relay pair force-closed after drain grace",
                )),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn bytes_flow_both_ways_and_close_propagates() {
        let (mut outer_a, mut a) = tokio::io::duplex(256);
        let (mut b, mut outer_b) = tokio::io::duplex(256);
        let (_tx, rx) = watch::channel(false);

        let pair = tokio::spawn(async move {
            run_pair(&mut a, &mut b, rx, Duration::from_secs(1)).await
        });

        outer_a.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        outer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        outer_b.write_all(b"pong").await.unwrap();
        outer_a.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"pong");

        // Closing one outer end unwinds the pair.
        drop(outer_a);
        drop(outer_b);
        let (ab, ba) = pair.await.unwrap().unwrap();
        assert_eq!(ab, 4);
        assert_eq!(ba, 4);
    }

    #[tokio::test]
    async fn shutdown_drains_in_flight_bytes() {
        let (mut outer_a, mut a) = tokio::io::duplex(256);
        let (mut b, mut outer_b) = tokio::io::duplex(256);
        let (tx, rx) = watch::channel(false);

        let pair = tokio::spawn(async move {
            run_pair(&mut a, &mut b, rx, Duration::from_secs(1)).await
        });

        tx.send(true).unwrap();
        outer_a.write_all(b"tail").await.unwrap();
        outer_a.shutdown().await.unwrap();
        drop(outer_a);

        let mut buf = [0u8; 4];
        outer_b.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"tail");

        drop(outer_b);
        assert!(pair.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn idle_pair_is_force_closed_after_grace() {
        let (_outer_a, mut a) = tokio::io::duplex(256);
        let (mut b, _outer_b) = tokio::io::duplex(256);
        let (tx, rx) = watch::channel(false);

        let pair = tokio::spawn(async move {
            run_pair(&mut a, &mut b, rx, Duration::from_millis(50)).await
        });

        tx.send(true).unwrap();
        let err = pair.await.unwrap().unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::TimedOut);
    }
}
