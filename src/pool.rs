//! C2: one outbound TCP connection pool per forward rule, keyed by
//! `(target host, target port)`.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::net::TcpStream;
use tokio::sync::{Mutex, Notify};
use tokio::time::timeout;
use tracing::debug;

use crate::error::{AppError, Result};

#[derive(Debug, Clone)]
pub struct PoolConfig {
    pub initial_size: u32,
    pub max_size: u32,
    pub max_idle_size: u32,
    pub connect_timeout: Duration,
    pub idle_timeout: Duration,
    pub max_lifetime: Duration,
    pub wait_timeout: Duration,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            initial_size: 0,
            max_size: 32,
            max_idle_size: 8,
            connect_timeout: Duration::from_secs(10),
            idle_timeout: Duration::from_secs(60),
            max_lifetime: Duration::from_secs(30 * 60),
            wait_timeout: Duration::from_secs(5),
        }
    }
}

struct IdleConn {
    stream: TcpStream,
    created_at: Instant,
    last_used: Instant,
}

impl IdleConn {
    fn is_valid(&self, cfg: &PoolConfig, now: Instant) -> bool {
        if now.duration_since(self.created_at) >= cfg.max_lifetime {
            return false;
        }
        if now.duration_since(self.last_used) >= cfg.idle_timeout {
            return false;
        }
        probe_readable(&self.stream)
    }
}

/// A non-blocking EOF probe: if the peer has sent data or closed its side,
/// `try_read` with a zero-length buffer reports it without consuming bytes.
fn probe_readable(stream: &TcpStream) -> bool {
    match stream.try_read(&mut []) {
        Ok(0) => false,
        Ok(_) => true,
        Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => true,
        Err(_) => false,
    }
}

struct Inner {
    idle: VecDeque<IdleConn>,
    closed: bool,
}

/// A lease on a pooled connection. `release` (explicit, not `Drop`) returns
/// it to the pool — ownership never chases a back-pointer from the stream
/// itself.
pub struct Leased {
    pub stream: TcpStream,
}

pub struct ConnectionPool {
    target_host: String,
    target_port: u16,
    config: PoolConfig,
    inner: Mutex<Inner>,
    open_count: AtomicU32,
    notify: Notify,
}

impl ConnectionPool {
    pub fn new(target_host: impl Into<String>, target_port: u16, config: PoolConfig) -> Arc<Self> {
        Arc::new(Self {
            target_host: target_host.into(),
            target_port,
            config,
            inner: Mutex::new(Inner {
                idle: VecDeque::new(),
                closed: false,
            }),
            open_count: AtomicU32::new(0),
            notify: Notify::new(),
        })
    }

    pub fn open_count(&self) -> u32 {
        self.open_count.load(Ordering::SeqCst)
    }

    async fn idle_len(&self) -> usize {
        self.inner.lock().await.idle.len()
    }

    /// Serve from the idle queue first; otherwise open a new connection if
    /// under `max_size`; otherwise block until one is released,
    /// `wait_timeout` elapses, or `stop` fires (§4.2/§5: every indefinite
    /// wait must observe the rule's stop signal).
    pub async fn acquire(&self, stop: &mut tokio::sync::watch::Receiver<bool>) -> Result<Leased> {
        loop {
            {
                let mut inner = self.inner.lock().await;
                if inner.closed {
                    return Err(AppError::PoolClosed);
                }
                let now = Instant::now();
                while let Some(candidate) = inner.idle.pop_front() {
                    if candidate.is_valid(&self.config, now) {
                        return Ok(Leased {
                            stream: candidate.stream,
                        });
                    }
                    self.open_count.fetch_sub(1, Ordering::SeqCst);
                }
            }

            if self.open_count.load(Ordering::SeqCst) < self.config.max_size {
                match self.dial().await {
                    Ok(stream) => {
                        self.open_count.fetch_add(1, Ordering::SeqCst);
                        return Ok(Leased { stream });
                    }
                    Err(e) => return Err(e),
                }
            }

            tokio::select! {
                wait = timeout(self.config.wait_timeout, self.notify.notified()) => {
                    if wait.is_err() {
                        return Err(AppError::PoolExhausted);
                    }
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        return Err(AppError::Cancelled);
                    }
                }
            }
        }
    }

    async fn dial(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.target_host, self.target_port);
        let stream = timeout(self.config.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| AppError::ConnectFailed(format!("{addr}: timed out")))?
            .map_err(|e| AppError::ConnectFailed(format!("{addr}: {e}")))?;
        stream.set_nodelay(true).ok();
        Ok(stream)
    }

    /// Validate and either enqueue the connection (refreshing last-used) or
    /// force-close it and decrement `open-count`.
    pub async fn release(&self, leased: Leased) {
        let now = Instant::now();
        let candidate = IdleConn {
            stream: leased.stream,
            created_at: now,
            last_used: now,
        };

        let mut inner = self.inner.lock().await;
        let valid = !inner.closed && candidate.is_valid(&self.config, now);
        if valid && inner.idle.len() < self.config.max_idle_size as usize {
            inner.idle.push_back(candidate);
            drop(inner);
            self.notify.notify_one();
        } else {
            drop(inner);
            drop(candidate);
            self.open_count.fetch_sub(1, Ordering::SeqCst);
            self.notify.notify_one();
        }
    }

    /// Mark closed, drain and force-close all idle connections.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        inner.closed = true;
        let dropped = inner.idle.len() as u32;
        inner.idle.clear();
        drop(inner);
        self.open_count.fetch_sub(dropped.min(self.open_count.load(Ordering::SeqCst)), Ordering::SeqCst);
        self.notify.notify_waiters();
    }

    /// Revalidate the idle queue, discarding anything invalid. Intended to be
    /// driven by a 30-second background ticker per rule.
    pub async fn sweep(&self) {
        let now = Instant::now();
        let mut inner = self.inner.lock().await;
        let before = inner.idle.len();
        inner.idle.retain(|c| c.is_valid(&self.config, now));
        let removed = before - inner.idle.len();
        drop(inner);
        if removed > 0 {
            self.open_count.fetch_sub(removed as u32, Ordering::SeqCst);
            debug!(removed, "pool sweeper discarded invalid idle connections");
        }
    }

    pub fn spawn_sweeper(self: &Arc<Self>, mut stop: tokio::sync::watch::Receiver<bool>) {
        let pool = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(30));
            loop {
                tokio::select! {
                    _ = ticker.tick() => pool.sweep().await,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    async fn echo_server() -> (std::net::SocketAddr, tokio::task::JoinHandle<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let handle = tokio::spawn(async move {
            loop {
                let Ok((mut sock, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(async move {
                    let mut buf = [0u8; 1024];
                    use tokio::io::AsyncReadExt;
                    while let Ok(n) = sock.read(&mut buf).await {
                        if n == 0 || sock.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                });
            }
        });
        (addr, handle)
    }

    fn no_stop() -> tokio::sync::watch::Receiver<bool> {
        tokio::sync::watch::channel(false).1
    }

    #[tokio::test]
    async fn acquire_then_release_reuses_connection() {
        let (addr, _server) = echo_server().await;
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), PoolConfig::default());

        let leased = pool.acquire(&mut no_stop()).await.unwrap();
        assert_eq!(pool.open_count(), 1);
        pool.release(leased).await;
        assert_eq!(pool.idle_len().await, 1);

        let _leased2 = pool.acquire(&mut no_stop()).await.unwrap();
        assert_eq!(pool.open_count(), 1);
        assert_eq!(pool.idle_len().await, 0);
    }

    #[tokio::test]
    async fn exhausted_pool_returns_error_after_wait_timeout() {
        let (addr, _server) = echo_server().await;
        let mut cfg = PoolConfig::default();
        cfg.max_size = 1;
        cfg.wait_timeout = Duration::from_millis(100);
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), cfg);

        let _leased = pool.acquire(&mut no_stop()).await.unwrap();
        let err = pool.acquire(&mut no_stop()).await.unwrap_err();
        assert!(matches!(err, AppError::PoolExhausted));
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let (addr, _server) = echo_server().await;
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), PoolConfig::default());
        pool.close().await;
        let err = pool.acquire(&mut no_stop()).await.unwrap_err();
        assert!(matches!(err, AppError::PoolClosed));
    }

    #[tokio::test]
    async fn acquire_is_cancelled_by_stop_signal_while_waiting() {
        let (addr, _server) = echo_server().await;
        let mut cfg = PoolConfig::default();
        cfg.max_size = 1;
        cfg.wait_timeout = Duration::from_secs(5);
        let pool = ConnectionPool::new(addr.ip().to_string(), addr.port(), cfg);

        let _leased = pool.acquire(&mut no_stop()).await.unwrap();
        let (stop_tx, mut stop_rx) = tokio::sync::watch::channel(false);
        let pool2 = pool.clone();
        let waiter = tokio::spawn(async move { pool2.acquire(&mut stop_rx).await });

        tokio::time::sleep(Duration::from_millis(50)).await;
        stop_tx.send(true).unwrap();
        let err = tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("acquire did not observe stop signal in time")
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, AppError::Cancelled));
    }
}
