//! C5: UDP forwarder — session table keyed by source address, sharded
//! reader workers, idle eviction.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::Ordering;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::{Duration, Instant};

use tokio::net::UdpSocket;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::error::{AppError, Result};
use crate::forward::Counters;
use crate::store::ForwardRule;

const NUM_WORKERS: usize = 4;
const RESPONSE_READ_DEADLINE: Duration = Duration::from_secs(30);
const READ_BUF_SIZE: usize = 4 * 1024 * 1024;
/// Upper bound on how long `serve` waits for response tasks to notice their
/// session was evicted or the rule was stopped (§5: bounded termination).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session table timing, factored out of constants so tests can shrink it
/// instead of waiting on the real 30s/120s production values.
#[derive(Clone, Copy)]
pub struct SessionTiming {
    pub idle_timeout: Duration,
    pub janitor_interval: Duration,
}

impl Default for SessionTiming {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(120),
            janitor_interval: Duration::from_secs(30),
        }
    }
}

struct Session {
    socket: Arc<UdpSocket>,
    last_active: std::sync::atomic::AtomicU64,
    #[allow(dead_code)]
    created: Instant,
    /// UDP has no half-close, so eviction can't "close the socket" the way
    /// §4.5 step 4 puts it for a stream protocol; this is the practical
    /// equivalent — it wakes the blocked response task immediately instead
    /// of leaving it to its 30s read deadline.
    cancel: watch::Sender<bool>,
}

impl Session {
    fn touch(&self, epoch: Instant) {
        let secs = epoch.elapsed().as_secs();
        self.last_active.store(secs, Ordering::SeqCst);
    }
}

type SessionTable = RwLock<HashMap<String, Arc<Session>>>;
type TaskList = Arc<StdMutex<Vec<JoinHandle<()>>>>;

pub async fn bind(rule: &ForwardRule) -> Result<Arc<UdpSocket>> {
    let addr = format!("0.0.0.0:{}", rule.listen_port);
    let socket = UdpSocket::bind(&addr)
        .await
        .map_err(|_| AppError::PortInUse(rule.listen_port))?;

    let sock_ref = socket2::SockRef::from(&socket);
    let _ = sock_ref.set_recv_buffer_size(READ_BUF_SIZE);
    let _ = sock_ref.set_send_buffer_size(READ_BUF_SIZE);

    Ok(Arc::new(socket))
}

pub async fn serve(
    inbound: Arc<UdpSocket>,
    rule: ForwardRule,
    counters: Arc<Counters>,
    stop: watch::Receiver<bool>,
) {
    serve_with_timing(inbound, rule, counters, stop, SessionTiming::default()).await
}

pub async fn serve_with_timing(
    inbound: Arc<UdpSocket>,
    rule: ForwardRule,
    counters: Arc<Counters>,
    stop: watch::Receiver<bool>,
    timing: SessionTiming,
) {
    let sessions: Arc<SessionTable> = Arc::new(RwLock::new(HashMap::new()));
    let response_tasks: TaskList = Arc::new(StdMutex::new(Vec::new()));
    let epoch = Instant::now();
    let rule = Arc::new(rule);

    let mut workers = Vec::with_capacity(NUM_WORKERS);
    for _ in 0..NUM_WORKERS {
        let inbound = inbound.clone();
        let rule = rule.clone();
        let counters = counters.clone();
        let sessions = sessions.clone();
        let response_tasks = response_tasks.clone();
        let mut stop = stop.clone();
        let stop_for_responses = stop.clone();
        workers.push(tokio::spawn(async move {
            reader_loop(
                inbound,
                rule,
                counters,
                sessions,
                response_tasks,
                epoch,
                &mut stop,
                stop_for_responses,
            )
            .await;
        }));
    }

    let janitor = {
        let sessions = sessions.clone();
        let counters = counters.clone();
        let mut stop = stop.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(timing.janitor_interval);
            loop {
                tokio::select! {
                    _ = ticker.tick() => evict_idle(&sessions, &counters, epoch, timing.idle_timeout).await,
                    _ = stop.changed() => {
                        if *stop.borrow() {
                            break;
                        }
                    }
                }
            }
        })
    };

    for w in workers {
        let _ = w.await;
    }
    let _ = janitor.await;

    let pending: Vec<JoinHandle<()>> = std::mem::take(&mut *response_tasks.lock().unwrap());
    let join_all = async {
        for h in pending {
            let _ = h.await;
        }
    };
    if timeout(SHUTDOWN_GRACE, join_all).await.is_err() {
        debug!(rule_id = rule.id, "some udp response tasks outlived the shutdown grace period");
    }
}

async fn reader_loop(
    inbound: Arc<UdpSocket>,
    rule: Arc<ForwardRule>,
    counters: Arc<Counters>,
    sessions: Arc<SessionTable>,
    response_tasks: TaskList,
    epoch: Instant,
    stop: &mut watch::Receiver<bool>,
    stop_for_responses: watch::Receiver<bool>,
) {
    let mut buf = vec![0u8; 64 * 1024];
    loop {
        if *stop.borrow() {
            break;
        }
        let received = timeout(Duration::from_secs(1), inbound.recv_from(&mut buf)).await;
        let (n, source) = match received {
            Ok(Ok(pair)) => pair,
            Ok(Err(_)) | Err(_) => continue,
        };

        counters.bytes_received.fetch_add(n as u64, Ordering::SeqCst);

        let key = source.to_string();
        let session = {
            let existing = sessions.read().await.get(&key).cloned();
            match existing {
                Some(s) => s,
                None => {
                    match new_session(
                        &rule,
                        source,
                        inbound.clone(),
                        &counters,
                        &sessions,
                        &response_tasks,
                        epoch,
                        stop_for_responses.clone(),
                    )
                    .await
                    {
                        Ok(s) => s,
                        Err(e) => {
                            debug!(rule_id = rule.id, error = %e, "udp session creation failed, dropping packet");
                            continue;
                        }
                    }
                }
            }
        };

        session.touch(epoch);
        let _ = session.socket.send(&buf[..n]).await;
    }
}

async fn new_session(
    rule: &ForwardRule,
    source: SocketAddr,
    inbound: Arc<UdpSocket>,
    counters: &Arc<Counters>,
    sessions: &Arc<SessionTable>,
    response_tasks: &TaskList,
    epoch: Instant,
    rule_stop: watch::Receiver<bool>,
) -> Result<Arc<Session>> {
    let target_addr = format!("{}:{}", rule.target_host, rule.target_port);
    let local_bind = if source.is_ipv6() { "[::]:0" } else { "0.0.0.0:0" };
    let socket = UdpSocket::bind(local_bind)
        .await
        .map_err(|e| AppError::ConnectFailed(e.to_string()))?;
    socket
        .connect(&target_addr)
        .await
        .map_err(|e| AppError::ConnectFailed(format!("{target_addr}: {e}")))?;

    let (cancel_tx, cancel_rx) = watch::channel(false);
    let session = Arc::new(Session {
        socket: Arc::new(socket),
        last_active: std::sync::atomic::AtomicU64::new(epoch.elapsed().as_secs()),
        created: Instant::now(),
        cancel: cancel_tx,
    });

    sessions
        .write()
        .await
        .insert(source.to_string(), session.clone());
    counters.total_conn.fetch_add(1, Ordering::SeqCst);
    counters.current_conn.fetch_add(1, Ordering::SeqCst);

    let handle = spawn_response_task(
        session.clone(),
        source,
        inbound,
        counters.clone(),
        sessions.clone(),
        epoch,
        cancel_rx,
        rule_stop,
    );
    response_tasks.lock().unwrap().retain(|h| !h.is_finished());
    response_tasks.lock().unwrap().push(handle);
    Ok(session)
}

fn spawn_response_task(
    session: Arc<Session>,
    source: SocketAddr,
    inbound: Arc<UdpSocket>,
    counters: Arc<Counters>,
    sessions: Arc<SessionTable>,
    epoch: Instant,
    mut cancel: watch::Receiver<bool>,
    mut rule_stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            tokio::select! {
                received = timeout(RESPONSE_READ_DEADLINE, session.socket.recv(&mut buf)) => {
                    let n = match received {
                        Ok(Ok(n)) => n,
                        Ok(Err(_)) | Err(_) => break,
                    };
                    session.touch(epoch);
                    counters.bytes_sent.fetch_add(n as u64, Ordering::SeqCst);
                    if inbound.send_to(&buf[..n], source).await.is_err() {
                        break;
                    }
                }
                _ = cancel.changed() => {
                    if *cancel.borrow() {
                        break;
                    }
                }
                _ = rule_stop.changed() => {
                    if *rule_stop.borrow() {
                        break;
                    }
                }
            }
        }
        let removed = sessions.write().await.remove(&source.to_string());
        if removed.is_some() {
            counters.current_conn.fetch_sub(1, Ordering::SeqCst);
        }
    })
}

async fn evict_idle(
    sessions: &Arc<SessionTable>,
    counters: &Arc<Counters>,
    epoch: Instant,
    idle_timeout: Duration,
) {
    let now_secs = epoch.elapsed().as_secs();
    let idle_secs = idle_timeout.as_secs();
    let mut table = sessions.write().await;
    let before = table.len();
    table.retain(|_, session| {
        let last = session.last_active.load(Ordering::SeqCst);
        let keep = now_secs.saturating_sub(last) < idle_secs;
        if !keep {
            let _ = session.cancel.send(true);
        }
        keep
    });
    let evicted = before - table.len();
    drop(table);
    if evicted > 0 {
        counters
            .current_conn
            .fetch_sub(evicted as i64, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::Protocol;
    use tokio::net::UdpSocket as TokioUdp;

    async fn echo_udp_server() -> SocketAddr {
        let socket = TokioUdp::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        tokio::spawn(async move {
            let mut buf = [0u8; 2048];
            loop {
                let Ok((n, src)) = socket.recv_from(&mut buf).await else {
                    break;
                };
                let _ = socket.send_to(&buf[..n], src).await;
            }
        });
        addr
    }

    fn sample_rule(target: SocketAddr) -> ForwardRule {
        ForwardRule {
            id: 1,
            name: "u".into(),
            protocol: Protocol::Udp,
            listen_port: 0,
            target_host: target.ip().to_string(),
            target_port: target.port(),
            enabled: true,
            max_conn: 1000,
            upload_limit: 0,
            download_limit: 0,
            total_upload: 0,
            total_download: 0,
            description: String::new(),
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    #[tokio::test]
    async fn fan_in_from_multiple_sources_all_get_echoed() {
        let target = echo_udp_server().await;
        let rule = sample_rule(target);
        let inbound = bind(&rule).await.unwrap();
        let listen_addr = inbound.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        tokio::spawn(serve(inbound, rule, counters.clone(), stop_rx));

        let mut clients = Vec::new();
        for _ in 0..5 {
            let client = TokioUdp::bind("127.0.0.1:0").await.unwrap();
            client.connect(listen_addr).await.unwrap();
            client.send(b"hello").await.unwrap();
            clients.push(client);
        }

        for client in &clients {
            let mut buf = [0u8; 16];
            let n = timeout(Duration::from_secs(2), client.recv(&mut buf))
                .await
                .expect("timed out waiting for echo")
                .unwrap();
            assert_eq!(&buf[..n], b"hello");
        }

        assert_eq!(counters.current_conn.load(Ordering::SeqCst), 5);
        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn idle_session_is_evicted_by_the_janitor() {
        let target = echo_udp_server().await;
        let rule = sample_rule(target);
        let inbound = bind(&rule).await.unwrap();
        let listen_addr = inbound.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let timing = SessionTiming {
            idle_timeout: Duration::from_secs(1),
            janitor_interval: Duration::from_millis(200),
        };
        tokio::spawn(serve_with_timing(
            inbound,
            rule,
            counters.clone(),
            stop_rx,
            timing,
        ));

        let client = TokioUdp::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        client.send(b"hi").await.unwrap();
        let mut buf = [0u8; 16];
        timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .expect("timed out waiting for echo")
            .unwrap();
        assert_eq!(counters.current_conn.load(Ordering::SeqCst), 1);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert_eq!(counters.current_conn.load(Ordering::SeqCst), 0);

        let _ = stop_tx.send(true);
    }

    #[tokio::test]
    async fn stop_signal_drains_response_tasks_within_grace_period() {
        let target = echo_udp_server().await;
        let rule = sample_rule(target);
        let inbound = bind(&rule).await.unwrap();
        let listen_addr = inbound.local_addr().unwrap();
        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = watch::channel(false);
        let serve_handle = tokio::spawn(serve(inbound, rule, counters.clone(), stop_rx));

        let client = TokioUdp::bind("127.0.0.1:0").await.unwrap();
        client.connect(listen_addr).await.unwrap();
        client.send(b"hi").await.unwrap();
        let mut buf = [0u8; 16];
        timeout(Duration::from_secs(2), client.recv(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(counters.current_conn.load(Ordering::SeqCst), 1);

        stop_tx.send(true).unwrap();
        timeout(Duration::from_secs(2), serve_handle)
            .await
            .expect("serve did not shut down within the grace period")
            .unwrap();
    }
}
