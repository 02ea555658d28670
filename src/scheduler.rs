//! Scheduler (C6) — one cooperative task per `StrategyInstance` driving
//! `start`/`tick`/`stop` against a monotonic, jitter-tolerant cadence
//! (§4.6).

use std::any::Any;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::FutureExt;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use crate::config::{StrategyConfig, StrategyKind, StrategyParameters};
use crate::connector::{Connector, StrategyEvent};
use crate::exchange::ExchangeAdapter;
use crate::mirror::RemoteMirror;
use crate::registry::{Status, StrategyInstance};
use crate::strategy::pmm::PureMarketMaking;
use crate::strategy::passive::PassiveQuoter;
use crate::strategy::{Strategy, StrategyContext};

const CONSECUTIVE_FAILURES_TO_ERROR: u32 = 3;

/// Build the `Strategy` implementation for a config's `kind`. Algorithms
/// beyond pure market making are out of scope (§1 Non-goals); other
/// kinds tick without submitting orders so the scheduler, registry and
/// reconciler can still be exercised end to end for them.
fn build_strategy<A: ExchangeAdapter + 'static>(cfg: &StrategyConfig) -> Box<dyn Strategy<A>> {
    let params = StrategyParameters::parse(cfg.kind, &cfg.parameters)
        .expect("parameters already validated at config-write time");
    match (cfg.kind, params) {
        (StrategyKind::PureMarketMaking, StrategyParameters::Pmm(p)) => {
            Box::new(PureMarketMaking::new(p, 1.0))
        }
        _ => Box::new(PassiveQuoter::new(cfg.kind)),
    }
}

pub async fn run_instance<A: ExchangeAdapter + 'static>(
    name: String,
    instance: Arc<StrategyInstance>,
    connector: Arc<Connector<A>>,
    mirror: RemoteMirror,
    mut inbox: mpsc::Receiver<StrategyEvent>,
) {
    let cancel = instance.cancel_token().await;
    let mut cfg = instance.config.read().await.clone();
    let trading_pairs = cfg.trading_pairs.clone();
    let refresh_interval = Duration::from_millis(cfg.refresh_interval_ms);
    let tick_deadline = refresh_interval.min(Duration::from_secs(5));

    let mut strategy = build_strategy::<A>(&cfg);
    let ctx = StrategyContext::new(&name, &trading_pairs, &connector);

    if let Err(e) = strategy.start(&ctx).await {
        warn!(name, %e, "strategy start failed");
        *instance.last_error.write().await = Some(e.to_string());
    }
    *instance.status.write().await = Status::Running;
    info!(name, refresh_interval_ms = cfg.refresh_interval_ms, "strategy scheduler started");

    let start = Instant::now();
    let mut k: u32 = 0;
    let mut consecutive_failures: u32 = 0;

    loop {
        k += 1;
        let target = start + refresh_interval * k;
        let now = Instant::now();
        if target > now {
            tokio::select! {
                _ = tokio::time::sleep_until(target) => {}
                _ = cancel.cancelled() => break,
            }
        } else {
            // Overrun: skip straight to one catch-up tick, no burst (§4.6).
            let behind = ((now - start).as_millis() / refresh_interval.as_millis().max(1)) as u32;
            if behind > k {
                k = behind;
            }
        }

        if cancel.is_cancelled() {
            break;
        }

        // Pick up parameter-only updates on a running instance without a
        // restart (only a `kind` change forces one, see registry::update).
        let current_cfg = instance.config.read().await.clone();
        if current_cfg.parameters != cfg.parameters {
            match strategy.reload(&current_cfg.parameters).await {
                Ok(()) => debug!(name, "strategy parameters hot-reloaded"),
                Err(e) => warn!(name, %e, "strategy reload rejected, keeping previous parameters"),
            }
        }
        cfg = current_cfg;

        let mut events = Vec::new();
        while let Ok(event) = inbox.try_recv() {
            events.push(event);
        }

        // A panicking `tick()` is isolated here rather than taking down
        // this task: the instance is recorded as a tick failure instead
        // of silently vanishing from the registry (§7).
        let tick_result = tokio::time::timeout(
            tick_deadline,
            std::panic::AssertUnwindSafe(strategy.tick(&ctx, events)).catch_unwind(),
        )
        .await;

        match tick_result {
            Ok(Ok(Ok(()))) => {
                consecutive_failures = 0;
                instance.counters.record_success();
                instance.counters.record_action_rate().await;
                *instance.last_error.write().await = None;
                let mut status = instance.status.write().await;
                if *status == Status::Error {
                    *status = Status::Running;
                }
            }
            Ok(Ok(Err(e))) => {
                consecutive_failures += 1;
                instance.counters.record_failure();
                instance.counters.record_action_rate().await;
                *instance.last_error.write().await = Some(e.to_string());
                debug!(name, %e, consecutive_failures, "tick failed");
                if consecutive_failures >= CONSECUTIVE_FAILURES_TO_ERROR {
                    *instance.status.write().await = Status::Error;
                }
            }
            Ok(Err(panic)) => {
                consecutive_failures += 1;
                instance.counters.record_failure();
                instance.counters.record_action_rate().await;
                let msg = panic_message(&*panic);
                *instance.last_error.write().await = Some(format!("tick panicked: {msg}"));
                error!(name, %msg, "strategy tick panicked, isolated by scheduler");
                if consecutive_failures >= CONSECUTIVE_FAILURES_TO_ERROR {
                    *instance.status.write().await = Status::Error;
                }
            }
            Err(_) => {
                consecutive_failures += 1;
                instance.counters.record_failure();
                instance.counters.record_action_rate().await;
                *instance.last_error.write().await = Some("tick exceeded deadline".to_string());
                warn!(name, "tick deadline exceeded, computation abandoned");
                if consecutive_failures >= CONSECUTIVE_FAILURES_TO_ERROR {
                    *instance.status.write().await = Status::Error;
                }
            }
        }

        *instance.last_tick_at.write().await = Some(Utc::now());
        let _ = &mirror; // reserved: per-tick mirroring is driven by the supervisor's periodic sweep
    }

    let cancel_orders = instance.take_stop_cancel_orders().await;
    if let Err(e) = strategy.stop(&ctx, cancel_orders).await {
        error!(name, %e, "strategy stop hook failed");
    }
    *instance.status.write().await = Status::Stopped;
    info!(name, "strategy scheduler exited");
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
