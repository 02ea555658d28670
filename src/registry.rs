//! Strategy Registry & Lifecycle (C5) — the source of truth for which
//! strategies are live, keyed by `name`, serialized per-name so distinct
//! names never contend (§4.5).

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use tokio::sync::{Mutex, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::cancel::CancelToken;
use crate::config::{StrategyConfig, TradingPair};
use crate::connector::Connector;
use crate::error::ConfigError;
use crate::exchange::ExchangeAdapter;
use crate::mirror::{MirrorEvent, RemoteMirror};
use crate::scheduler;
use crate::store::ConfigStore;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    Starting,
    Running,
    Paused,
    Stopping,
    Stopped,
    Error,
}

/// Running counters for one instance. `actions_per_minute` is a
/// load-average-style EWMA: on each action the elapsed time since the
/// last one decays the running rate by `exp(-dt/60s)` before adding the
/// new action's contribution, rather than a sliding window of samples
/// (§9).
#[derive(Debug)]
pub struct Counters {
    pub total_actions: AtomicU64,
    pub successful_orders: AtomicU64,
    pub failed_orders: AtomicU64,
    ewma: Mutex<Ewma>,
}

#[derive(Debug)]
struct Ewma {
    rate: f64,
    last_update: DateTime<Utc>,
}

const EWMA_WINDOW_SECS: f64 = 60.0;

impl Default for Counters {
    fn default() -> Self {
        Self {
            total_actions: AtomicU64::new(0),
            successful_orders: AtomicU64::new(0),
            failed_orders: AtomicU64::new(0),
            ewma: Mutex::new(Ewma {
                rate: 0.0,
                last_update: Utc::now(),
            }),
        }
    }
}

impl Counters {
    pub fn record_success(&self) {
        self.total_actions.fetch_add(1, Ordering::Relaxed);
        self.successful_orders.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_failure(&self) {
        self.total_actions.fetch_add(1, Ordering::Relaxed);
        self.failed_orders.fetch_add(1, Ordering::Relaxed);
    }

    /// Record one action for the purposes of the decaying rate. Called
    /// once per tick action, independent of success/failure.
    pub async fn record_action_rate(&self) {
        let now = Utc::now();
        let mut ewma = self.ewma.lock().await;
        let dt = (now - ewma.last_update).num_milliseconds().max(0) as f64 / 1000.0;
        let decay = (-dt / EWMA_WINDOW_SECS).exp();
        // One action after `dt` seconds is an instantaneous rate of
        // `60/dt` actions/minute; decay the running value toward it. A
        // steady cadence of one action every `dt` seconds converges to
        // exactly `60/dt`, unlike a contribution clamped to the window.
        let instantaneous_rate = 60.0 / dt.max(1e-3);
        ewma.rate = ewma.rate * decay + (1.0 - decay) * instantaneous_rate;
        ewma.last_update = now;
    }

    pub async fn actions_per_minute(&self) -> f64 {
        self.ewma.lock().await.rate
    }
}

/// The live embodiment of a `StrategyConfig` (§3).
pub struct StrategyInstance {
    pub config: RwLock<StrategyConfig>,
    pub status: RwLock<Status>,
    pub open_orders: RwLock<HashSet<String>>,
    pub counters: Counters,
    pub last_tick_at: RwLock<Option<DateTime<Utc>>>,
    pub last_error: RwLock<Option<String>>,
    cancel: RwLock<CancelToken>,
    handle: Mutex<Option<JoinHandle<()>>>,
    /// Whether the scheduler's next `strategy.stop()` call should cancel
    /// the strategy's live orders. Set by `stop_task` just before
    /// cancellation so `delete(cancel_orders)`/`update(preserve_orders)`
    /// reach the running task (§4.5).
    stop_cancel_orders: RwLock<bool>,
}

impl StrategyInstance {
    fn new(config: StrategyConfig) -> Arc<Self> {
        Arc::new(Self {
            config: RwLock::new(config),
            status: RwLock::new(Status::Starting),
            open_orders: RwLock::new(HashSet::new()),
            counters: Counters::default(),
            last_tick_at: RwLock::new(None),
            last_error: RwLock::new(None),
            cancel: RwLock::new(CancelToken::new()),
            handle: Mutex::new(None),
            stop_cancel_orders: RwLock::new(true),
        })
    }

    /// The token the currently-running (or about-to-run) scheduler task
    /// should watch. Replaced with a fresh token on restart.
    pub async fn cancel_token(&self) -> CancelToken {
        self.cancel.read().await.clone()
    }

    async fn cancel_current(&self) {
        self.cancel.read().await.cancel();
    }

    async fn reset_cancel(&self) {
        *self.cancel.write().await = CancelToken::new();
    }

    async fn set_stop_cancel_orders(&self, cancel_orders: bool) {
        *self.stop_cancel_orders.write().await = cancel_orders;
    }

    /// Read and reset to the default (`true`) the flag the scheduler
    /// consumes once, on its way out of the tick loop.
    pub async fn take_stop_cancel_orders(&self) -> bool {
        let mut guard = self.stop_cancel_orders.write().await;
        std::mem::replace(&mut *guard, true)
    }
}

#[derive(Debug, Serialize)]
pub struct DeleteReport {
    pub orders_cancelled: u32,
    pub positions_closed: u32,
    pub errors: Vec<String>,
}

pub struct Registry<A: ExchangeAdapter> {
    instance_id: String,
    store: Arc<ConfigStore>,
    connector: Arc<Connector<A>>,
    mirror: RemoteMirror,
    instances: DashMap<String, Arc<StrategyInstance>>,
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl<A: ExchangeAdapter + 'static> Registry<A> {
    pub fn new(instance_id: String, store: Arc<ConfigStore>, connector: Arc<Connector<A>>, mirror: RemoteMirror) -> Self {
        Self {
            instance_id,
            store,
            connector,
            mirror,
            instances: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    fn name_lock(&self, name: &str) -> Arc<Mutex<()>> {
        self.locks.entry(name.to_string()).or_insert_with(|| Arc::new(Mutex::new(()))).clone()
    }

    /// Load every persisted config and schedule the enabled ones. Called
    /// once at startup.
    pub async fn restore_from_store(&self) -> Result<(), ConfigError> {
        for cfg in self.store.load_all().await {
            let enabled = cfg.enabled;
            let name = cfg.name.clone();
            let instance = StrategyInstance::new(cfg.clone());
            self.instances.insert(name.clone(), instance.clone());
            for pair in &cfg.trading_pairs {
                if let Err(e) = self.connector.ensure_pair(pair).await {
                    warn!(name, %e, "failed to restore subscription");
                }
            }
            if enabled {
                self.spawn(&name, instance).await;
            } else {
                *instance.status.write().await = Status::Paused;
            }
        }
        Ok(())
    }

    /// `create(cfg)` (§4.5): validate, persist, instantiate, subscribe,
    /// mark running. Fails with `DuplicateName` if `name` exists.
    pub async fn create(&self, cfg: StrategyConfig) -> Result<Arc<StrategyInstance>, ConfigError> {
        let lock = self.name_lock(&cfg.name);
        let _guard = lock.lock().await;

        if self.instances.contains_key(&cfg.name) {
            return Err(ConfigError::DuplicateName(cfg.name));
        }

        let persisted = self.store.upsert(cfg).await?;
        let name = persisted.name.clone();
        let enabled = persisted.enabled;
        let pairs = persisted.trading_pairs.clone();

        let instance = StrategyInstance::new(persisted);
        self.instances.insert(name.clone(), instance.clone());

        for pair in &pairs {
            self.connector.ensure_pair(pair).await.map_err(|e| {
                ConfigError::InvalidConfig(format!("failed to subscribe {pair}: {e}"))
            })?;
        }

        if enabled {
            self.spawn(&name, instance.clone()).await;
        } else {
            *instance.status.write().await = Status::Paused;
        }

        info!(name, "strategy created");
        Ok(instance)
    }

    /// `update(name, cfg')` (§4.5): pair-set diff (adds before removes),
    /// orderly restart when `kind` changes or parameters aren't
    /// hot-reloadable.
    pub async fn update(&self, name: &str, mut new_cfg: StrategyConfig, preserve_orders: bool) -> Result<Arc<StrategyInstance>, ConfigError> {
        new_cfg.name = name.to_string();
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let instance = self
            .instances
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))?;

        let old_cfg = instance.config.read().await.clone();
        let old_pairs: HashSet<TradingPair> = old_cfg.trading_pairs.iter().cloned().collect();
        let new_pairs: HashSet<TradingPair> = new_cfg.trading_pairs.iter().cloned().collect();

        for pair in new_pairs.difference(&old_pairs) {
            self.connector.ensure_pair(pair).await.map_err(|e| {
                ConfigError::InvalidConfig(format!("failed to subscribe {pair}: {e}"))
            })?;
        }

        let restart_required = old_cfg.kind != new_cfg.kind;

        if restart_required {
            *instance.status.write().await = Status::Stopping;
            self.stop_task(&instance, !preserve_orders).await;
        }

        let persisted = self.store.upsert(new_cfg).await?;
        *instance.config.write().await = persisted.clone();

        for pair in old_pairs.difference(&new_pairs) {
            let _ = self.connector.release_pair(pair).await;
        }

        if restart_required && persisted.enabled {
            instance.reset_cancel().await;
            *instance.status.write().await = Status::Starting;
            self.spawn(name, instance.clone()).await;
        }

        info!(name, "strategy updated");
        Ok(instance)
    }

    /// `delete(name, opts)` (§4.5): stop, cancel owned orders, optionally
    /// close positions, release subscriptions, drop config.
    pub async fn delete(&self, name: &str, cancel_orders: bool) -> Result<DeleteReport, ConfigError> {
        let lock = self.name_lock(name);
        let _guard = lock.lock().await;

        let instance = self
            .instances
            .get(name)
            .map(|e| e.clone())
            .ok_or_else(|| ConfigError::UnknownStrategy(name.to_string()))?;

        *instance.status.write().await = Status::Stopping;
        self.stop_task(&instance, cancel_orders).await;

        let open_orders_count = instance.open_orders.read().await.len() as u32;
        let pairs = instance.config.read().await.trading_pairs.clone();
        for pair in &pairs {
            let _ = self.connector.release_pair(pair).await;
        }

        self.instances.remove(name);
        self.locks.remove(name);
        self.store.delete(name).await?;

        *instance.status.write().await = Status::Stopped;
        info!(name, "strategy deleted");

        Ok(DeleteReport {
            orders_cancelled: if cancel_orders { open_orders_count } else { 0 },
            positions_closed: 0,
            errors: Vec::new(),
        })
    }

    pub fn get(&self, name: &str) -> Option<Arc<StrategyInstance>> {
        self.instances.get(name).map(|e| e.clone())
    }

    pub fn list(&self) -> Vec<(String, Arc<StrategyInstance>)> {
        self.instances.iter().map(|e| (e.key().clone(), e.value().clone())).collect()
    }

    /// Push one `StrategyStats` row to the mirror for each instance. The
    /// supervisor drives this on a timer.
    pub async fn mirror_stats(&self) {
        for (name, instance) in self.list() {
            self.mirror.send(MirrorEvent::StrategyStats {
                instance_id: self.instance_id.clone(),
                name,
                total_actions: instance.counters.total_actions.load(Ordering::Relaxed),
                successful_orders: instance.counters.successful_orders.load(Ordering::Relaxed),
                failed_orders: instance.counters.failed_orders.load(Ordering::Relaxed),
                actions_per_minute: instance.counters.actions_per_minute().await,
                ts: Utc::now(),
            });
        }
    }

    async fn spawn(&self, name: &str, instance: Arc<StrategyInstance>) {
        let connector = self.connector.clone();
        let mirror = self.mirror.clone();
        let name = name.to_string();
        let inbox = connector.register_strategy(&name);
        let handle = tokio::spawn(scheduler::run_instance(name.clone(), instance.clone(), connector, mirror, inbox));
        *instance.handle.lock().await = Some(handle);
    }

    /// Cancel the running task and wait up to 1s for it to exit (§4.6).
    /// If `cancel_orders`, the strategy's `stop()` hook is expected to
    /// cancel its own open orders before returning.
    async fn stop_task(&self, instance: &Arc<StrategyInstance>, cancel_orders: bool) {
        instance.set_stop_cancel_orders(cancel_orders).await;
        instance.cancel_current().await;
        let handle = instance.handle.lock().await.take();
        if let Some(handle) = handle {
            if tokio::time::timeout(std::time::Duration::from_secs(1), handle).await.is_err() {
                warn!("strategy task did not exit within 1s deadline");
            }
        }
        let name = instance.config.read().await.name.clone();
        self.connector.unregister_strategy(&name);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A steady cadence of one action every `dt_secs` seconds must
    /// converge to `60/dt_secs` actions/minute, not to ~1.0 regardless of
    /// `dt_secs`. Backdates `last_update` instead of sleeping in real
    /// time so the test reaches steady state (several 60s time
    /// constants) without taking minutes to run.
    #[tokio::test]
    async fn ewma_converges_to_steady_state_rate() {
        let counters = Counters::default();
        let dt_secs = 2.0;

        for _ in 0..200 {
            {
                let mut ewma = counters.ewma.lock().await;
                ewma.last_update -= chrono::Duration::milliseconds((dt_secs * 1000.0) as i64);
            }
            counters.record_action_rate().await;
        }

        let rate = counters.actions_per_minute().await;
        let expected = 60.0 / dt_secs;
        assert!(
            (rate - expected).abs() < expected * 0.05,
            "expected rate close to {expected}, got {rate}"
        );
    }
}
