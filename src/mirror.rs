//! Remote Mirror (C2) — best-effort, at-least-once shipper of config
//! changes, strategy counters, position snapshots and supervisor
//! heartbeats to an external Postgres store (§4.2).
//!
//! Degraded or absent mirroring must never degrade trading: every
//! `send()` is synchronous, non-blocking, and infallible from the
//! caller's point of view.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::config::StrategyConfig;

const QUEUE_CAPACITY: usize = 1024;
const MIN_BACKOFF: Duration = Duration::from_millis(100);
const MAX_BACKOFF: Duration = Duration::from_secs(30);

#[derive(Debug, Clone)]
pub enum MirrorEvent {
    ConfigUpserted(StrategyConfig),
    ConfigDeleted(String),
    StrategyStats {
        instance_id: String,
        name: String,
        total_actions: u64,
        successful_orders: u64,
        failed_orders: u64,
        actions_per_minute: f64,
        ts: DateTime<Utc>,
    },
    PositionSnapshot {
        instance_id: String,
        trading_pair: String,
        side: String,
        size: f64,
        entry_price: f64,
        mark_price: f64,
        unrealized_pnl: f64,
        attributed_strategy: Option<String>,
        ts: DateTime<Utc>,
    },
    InstanceHeartbeat {
        instance_id: String,
        hostname: String,
        api_port: u16,
        status: String,
        ts: DateTime<Utc>,
    },
}

struct Queue {
    events: Mutex<VecDeque<MirrorEvent>>,
    notify: Notify,
    dropped: AtomicU64,
    last_drop_warning: Mutex<Option<Instant>>,
}

#[derive(Clone)]
pub struct RemoteMirror {
    queue: Arc<Queue>,
    pub enabled: bool,
}

impl RemoteMirror {
    /// Construct the mirror and spawn its drain worker. `dsn = None`
    /// disables remote mirroring entirely; `send` remains a cheap no-op.
    pub fn new(dsn: Option<String>) -> Self {
        let queue = Arc::new(Queue {
            events: Mutex::new(VecDeque::with_capacity(QUEUE_CAPACITY)),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            last_drop_warning: Mutex::new(None),
        });

        let enabled = dsn.is_some();
        let mirror = Self {
            queue: queue.clone(),
            enabled,
        };

        tokio::spawn(async move { drain_loop(queue, dsn).await });

        mirror
    }

    /// Disabled instance, for tests and for the `enabled=false` case
    /// without spawning a background task.
    pub fn disabled() -> Self {
        Self {
            queue: Arc::new(Queue {
                events: Mutex::new(VecDeque::new()),
                notify: Notify::new(),
                dropped: AtomicU64::new(0),
                last_drop_warning: Mutex::new(None),
            }),
            enabled: false,
        }
    }

    /// Enqueue an event. Never blocks and never awaits: the critical
    /// section is an O(1) `VecDeque` push behind a short-lived lock.
    /// Drops the oldest queued event on overflow and counts it (§4.2).
    pub fn send(&self, event: MirrorEvent) {
        if !self.enabled {
            return;
        }
        {
            let mut events = self.queue.events.lock();
            if events.len() >= QUEUE_CAPACITY {
                events.pop_front();
                let dropped = self.queue.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                let mut last = self.queue.last_drop_warning.lock();
                let should_warn = last.map(|t| t.elapsed() >= Duration::from_secs(60)).unwrap_or(true);
                if should_warn {
                    warn!(dropped, "remote mirror queue overflow, dropping oldest events");
                    *last = Some(Instant::now());
                }
            }
            events.push_back(event);
        }
        self.queue.notify.notify_one();
    }

    pub fn dropped_count(&self) -> u64 {
        self.queue.dropped.load(Ordering::Relaxed)
    }
}

async fn drain_loop(queue: Arc<Queue>, dsn: Option<String>) {
    let Some(dsn) = dsn else {
        return;
    };

    let pool = match PgPoolOptions::new().max_connections(5).connect(&dsn).await {
        Ok(pool) => {
            info!("remote mirror connected");
            Some(pool)
        }
        Err(e) => {
            warn!(error = %e, "remote mirror failed to connect at startup, will retry lazily");
            None
        }
    };
    let mut pool = pool;

    loop {
        let event = queue.events.lock().pop_front();

        let Some(event) = event else {
            queue.notify.notified().await;
            continue;
        };

        if pool.is_none() {
            pool = PgPoolOptions::new().max_connections(5).connect(&dsn).await.ok();
        }

        let Some(ref p) = pool else {
            // No connection yet: back off before trying the next event so
            // we don't spin hot while the database is unreachable.
            tokio::time::sleep(MIN_BACKOFF).await;
            continue;
        };

        let mut backoff = MIN_BACKOFF;
        loop {
            match apply(p, &event).await {
                Ok(()) => break,
                Err(e) => {
                    warn!(error = %e, "remote mirror write failed, retrying");
                    tokio::time::sleep(backoff).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF);
                    if backoff >= MAX_BACKOFF {
                        warn!("remote mirror giving up on event after max backoff");
                        break;
                    }
                }
            }
        }
    }
}

async fn apply(pool: &PgPool, event: &MirrorEvent) -> Result<(), sqlx::Error> {
    match event {
        MirrorEvent::ConfigUpserted(cfg) => {
            sqlx::query(
                "INSERT INTO hive_strategy_configs (name, kind, trading_pairs, parameters, refresh_interval_ms, enabled, created_at, updated_at) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8) \
                 ON CONFLICT (name) DO UPDATE SET kind = $2, trading_pairs = $3, parameters = $4, \
                 refresh_interval_ms = $5, enabled = $6, updated_at = $8",
            )
            .bind(&cfg.name)
            .bind(serde_json::to_value(cfg.kind).unwrap_or_default())
            .bind(serde_json::to_value(&cfg.trading_pairs).unwrap_or_default())
            .bind(&cfg.parameters)
            .bind(cfg.refresh_interval_ms as i64)
            .bind(cfg.enabled)
            .bind(cfg.created_at)
            .bind(cfg.updated_at)
            .execute(pool)
            .await?;
        }
        MirrorEvent::ConfigDeleted(name) => {
            sqlx::query("DELETE FROM hive_strategy_configs WHERE name = $1")
                .bind(name)
                .execute(pool)
                .await?;
        }
        MirrorEvent::StrategyStats {
            instance_id,
            name,
            total_actions,
            successful_orders,
            failed_orders,
            actions_per_minute,
            ts,
        } => {
            sqlx::query(
                "INSERT INTO hive_strategy_stats (instance_id, name, total_actions, successful_orders, failed_orders, actions_per_minute, ts) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7) \
                 ON CONFLICT (instance_id, name) DO UPDATE SET total_actions = $3, successful_orders = $4, \
                 failed_orders = $5, actions_per_minute = $6, ts = $7",
            )
            .bind(instance_id)
            .bind(name)
            .bind(*total_actions as i64)
            .bind(*successful_orders as i64)
            .bind(*failed_orders as i64)
            .bind(actions_per_minute)
            .bind(ts)
            .execute(pool)
            .await?;
        }
        MirrorEvent::PositionSnapshot {
            instance_id,
            trading_pair,
            side,
            size,
            entry_price,
            mark_price,
            unrealized_pnl,
            attributed_strategy,
            ts,
        } => {
            sqlx::query(
                "INSERT INTO hive_position_snapshots (instance_id, trading_pair, side, size, entry_price, mark_price, unrealized_pnl, attributed_strategy, ts) \
                 VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)",
            )
            .bind(instance_id)
            .bind(trading_pair)
            .bind(side)
            .bind(size)
            .bind(entry_price)
            .bind(mark_price)
            .bind(unrealized_pnl)
            .bind(attributed_strategy)
            .bind(ts)
            .execute(pool)
            .await?;
        }
        MirrorEvent::InstanceHeartbeat {
            instance_id,
            hostname,
            api_port,
            status,
            ts,
        } => {
            sqlx::query(
                "INSERT INTO hive_instances (instance_id, hostname, api_port, status, last_seen) \
                 VALUES ($1, $2, $3, $4, $5) \
                 ON CONFLICT (instance_id) DO UPDATE SET status = $4, last_seen = $5",
            )
            .bind(instance_id)
            .bind(hostname)
            .bind(*api_port as i32)
            .bind(status)
            .bind(ts)
            .execute(pool)
            .await?;
        }
    }
    Ok(())
}
