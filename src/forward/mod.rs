//! C6: rule registry and live stats. Owns the process-wide map from rule id
//! to running rule and is the only thing allowed to start/stop a listener.

pub mod tcp;
pub mod udp;

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::pool::{ConnectionPool, PoolConfig};
use crate::store::{ForwardRule, ForwardRuleInput, Protocol, Store};

/// Upper bound `stop` waits for the rule's serve task to actually finish
/// draining connections before it reads final byte counts (§3: persisted
/// totals must reflect fully-committed per-session deltas, not a snapshot
/// taken while a connection is still copying).
const STOP_JOIN_GRACE: Duration = Duration::from_secs(3);

/// Live, atomic counters for a running rule (§3 "Running rule").
#[derive(Default)]
pub struct Counters {
    pub total_conn: AtomicU64,
    pub current_conn: AtomicI64,
    pub bytes_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    last_sent: AtomicU64,
    last_received: AtomicU64,
    pub upload_speed: AtomicU64,
    pub download_speed: AtomicU64,
}

/// A point-in-time projection of a rule for callers (`List`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct RuleStats {
    pub id: i64,
    pub running: bool,
    pub current_conn: i64,
    pub total_conn: u64,
    pub upload_speed: u64,
    pub download_speed: u64,
    pub total_upload: u64,
    pub total_download: u64,
}

struct RunningRule {
    counters: Arc<Counters>,
    pool: Option<Arc<ConnectionPool>>,
    stop_tx: watch::Sender<bool>,
    serve_handle: JoinHandle<()>,
    start_time: Instant,
}

/// Holds every currently-running forward rule and mediates Start/Stop.
pub struct ForwardRegistry {
    store: Arc<Store>,
    running: RwLock<HashMap<i64, RunningRule>>,
}

impl ForwardRegistry {
    pub fn new(store: Arc<Store>) -> Arc<Self> {
        Arc::new(Self {
            store,
            running: RwLock::new(HashMap::new()),
        })
    }

    pub async fn create(&self, input: &ForwardRuleInput) -> Result<ForwardRule> {
        self.store.create_forward_rule(input).await
    }

    pub async fn update(&self, id: i64, input: &ForwardRuleInput) -> Result<ForwardRule> {
        let was_running = self.running.read().await.contains_key(&id);
        if was_running {
            self.stop(id).await?;
        }
        let rule = self.store.update_forward_rule(id, input).await?;
        if was_running && rule.enabled {
            self.start(id).await?;
        }
        Ok(rule)
    }

    pub async fn delete(&self, id: i64) -> Result<()> {
        self.stop(id).await?;
        self.store.delete_forward_rule(id).await
    }

    /// Idempotent: starting an already-running rule does nothing.
    pub async fn start(self: &Arc<Self>, id: i64) -> Result<()> {
        if self.running.read().await.contains_key(&id) {
            return Ok(());
        }
        let rule = self.store.get_forward_rule(id).await?;
        let counters = Arc::new(Counters::default());
        let (stop_tx, stop_rx) = watch::channel(false);

        let pool = match rule.protocol {
            Protocol::Tcp => Some(ConnectionPool::new(
                rule.target_host.clone(),
                rule.target_port,
                PoolConfig::default(),
            )),
            Protocol::Udp => None,
        };

        let serve_handle = match rule.protocol {
            Protocol::Tcp => {
                let rule = rule.clone();
                let counters = counters.clone();
                let pool = pool.clone();
                let stop_rx = stop_rx.clone();
                let listener = tcp::bind(&rule).await?;
                tokio::spawn(tcp::serve(listener, rule, counters, pool, stop_rx))
            }
            Protocol::Udp => {
                let rule = rule.clone();
                let counters = counters.clone();
                let stop_rx = stop_rx.clone();
                let socket = udp::bind(&rule).await?;
                tokio::spawn(udp::serve(socket, rule, counters, stop_rx))
            }
        };

        if let Some(pool) = &pool {
            pool.spawn_sweeper(stop_rx.clone());
        }
        spawn_sampler(counters.clone(), stop_rx.clone());

        self.running.write().await.insert(
            id,
            RunningRule {
                counters,
                pool,
                stop_tx,
                serve_handle,
                start_time: Instant::now(),
            },
        );
        info!(rule_id = id, "forward rule started");
        Ok(())
    }

    /// Idempotent: stopping an already-stopped rule does nothing.
    pub async fn stop(&self, id: i64) -> Result<()> {
        let running = self.running.write().await.remove(&id);
        let Some(running) = running else {
            return Ok(());
        };
        let _ = running.stop_tx.send(true);
        if let Some(pool) = &running.pool {
            pool.close().await;
        }
        // Wait for the serve task to actually drain its connections before
        // reading counters, so the persisted totals include every byte a
        // still-copying connection commits during teardown (§3).
        if timeout(STOP_JOIN_GRACE, running.serve_handle).await.is_err() {
            debug!(rule_id = id, "serve task outlived the stop grace period, persisting counters anyway");
        }
        let sent = running.counters.bytes_sent.load(Ordering::SeqCst);
        let received = running.counters.bytes_received.load(Ordering::SeqCst);
        self.store
            .accumulate_forward_bytes(id, sent, received)
            .await?;
        info!(rule_id = id, sent, received, "forward rule stopped");
        Ok(())
    }

    pub async fn list(&self) -> Result<Vec<RuleStats>> {
        let rows = self.store.list_forward_rules().await?;
        let running = self.running.read().await;
        Ok(rows
            .into_iter()
            .map(|row| {
                if let Some(r) = running.get(&row.id) {
                    RuleStats {
                        id: row.id,
                        running: true,
                        current_conn: r.counters.current_conn.load(Ordering::SeqCst),
                        total_conn: r.counters.total_conn.load(Ordering::SeqCst),
                        upload_speed: r.counters.upload_speed.load(Ordering::SeqCst),
                        download_speed: r.counters.download_speed.load(Ordering::SeqCst),
                        total_upload: row.total_upload + r.counters.bytes_sent.load(Ordering::SeqCst),
                        total_download: row.total_download
                            + r.counters.bytes_received.load(Ordering::SeqCst),
                    }
                } else {
                    RuleStats {
                        id: row.id,
                        running: false,
                        current_conn: 0,
                        total_conn: 0,
                        upload_speed: 0,
                        download_speed: 0,
                        total_upload: row.total_upload,
                        total_download: row.total_download,
                    }
                }
            })
            .collect())
    }

    pub async fn total_active_connections(&self) -> i64 {
        self.running
            .read()
            .await
            .values()
            .map(|r| r.counters.current_conn.load(Ordering::SeqCst))
            .sum()
    }

    pub async fn uptime(&self, id: i64) -> Option<Duration> {
        self.running
            .read()
            .await
            .get(&id)
            .map(|r| r.start_time.elapsed())
    }

    /// Start every persisted rule with `enabled = 1`. Bind failures for one
    /// rule are logged and do not prevent the remaining rules from starting.
    pub async fn init_forward_rules(self: &Arc<Self>) -> Result<()> {
        let rows = self.store.list_forward_rules().await?;
        for row in rows.into_iter().filter(|r| r.enabled) {
            if let Err(e) = self.start(row.id).await {
                warn!(rule_id = row.id, error = %e, "failed to start forward rule at init");
            }
        }
        Ok(())
    }
}

fn spawn_sampler(counters: Arc<Counters>, mut stop: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(1));
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let sent = counters.bytes_sent.load(Ordering::SeqCst);
                    let received = counters.bytes_received.load(Ordering::SeqCst);
                    let last_sent = counters.last_sent.swap(sent, Ordering::SeqCst);
                    let last_received = counters.last_received.swap(received, Ordering::SeqCst);
                    counters.upload_speed.store(sent.saturating_sub(last_sent), Ordering::SeqCst);
                    counters.download_speed.store(received.saturating_sub(last_received), Ordering::SeqCst);
                }
                _ = stop.changed() => {
                    if *stop.borrow() {
                        break;
                    }
                }
            }
        }
    });
}
