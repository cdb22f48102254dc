//! C3: bidirectional byte pump with token-bucket-style pacing and atomic
//! byte counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::bufferpool::POOL;

/// Copy from `src` to `dst`, pacing so that throughput stays close to
/// `rate_limit` bytes/sec (0 disables pacing). `counter` is added to on every
/// successful write, for the caller's live-stats sampler. Returns the total
/// bytes successfully written.
pub async fn copy<R, W>(mut dst: W, mut src: R, rate_limit: u64, counter: &AtomicU64) -> u64
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut window_start = Instant::now();
    let mut bytes_in_window: u64 = 0;
    let mut total: u64 = 0;

    loop {
        let mut buf = POOL.get();
        let n = match src.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => n,
            Err(_) => break,
        };

        if dst.write_all(&buf[..n]).await.is_err() {
            break;
        }

        total += n as u64;
        counter.fetch_add(n as u64, Ordering::Relaxed);

        if rate_limit == 0 {
            continue;
        }

        bytes_in_window += n as u64;
        let elapsed = window_start.elapsed();
        if elapsed >= Duration::from_millis(100) {
            let allowed = (rate_limit as f64 * elapsed.as_secs_f64()) as u64;
            if bytes_in_window > allowed {
                let excess = bytes_in_window - allowed;
                let sleep_secs = (excess as f64 / rate_limit as f64).min(1.0);
                if sleep_secs > 0.0 {
                    tokio::time::sleep(Duration::from_secs_f64(sleep_secs)).await;
                }
            }
            window_start = Instant::now();
            bytes_in_window = 0;
        }
    }

    let _ = dst.flush().await;
    total
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn copies_all_bytes_and_updates_counter() {
        let data = vec![7u8; 200_000];
        let mut dst = Vec::new();
        let counter = AtomicU64::new(0);

        let n = copy(&mut dst, &data[..], 0, &counter).await;
        assert_eq!(n, data.len() as u64);
        assert_eq!(dst, data);
        assert_eq!(counter.load(Ordering::Relaxed), data.len() as u64);
    }

    #[tokio::test]
    async fn zero_rate_limit_never_sleeps() {
        let data = vec![1u8; 500_000];
        let mut dst = Vec::new();
        let counter = AtomicU64::new(0);

        let start = Instant::now();
        copy(&mut dst, &data[..], 0, &counter).await;
        assert!(start.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn rate_limited_copy_paces_throughput() {
        let data = vec![3u8; 400_000];
        let mut dst = Vec::new();
        let counter = AtomicU64::new(0);

        let start = Instant::now();
        let n = copy(&mut dst, &data[..], 200_000, &counter).await;
        assert_eq!(n, data.len() as u64);
        assert!(start.elapsed() >= Duration::from_millis(800));
    }
}
