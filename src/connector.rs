//! Shared Connector Multiplexer (C4) — holds the one `ExchangeAdapter`,
//! owns trading-pair subscription ref-counts, tags every outbound order
//! with its owning strategy, and demultiplexes inbound events back to
//! per-strategy inboxes (§4.4).

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, warn};

use crate::config::TradingPair;
use crate::error::AdapterError;
use crate::exchange::{
    AdapterEvent, Balance, ExchangeAdapter, ExchangePosition, LiveOrder, OrderType,
    PositionAction, Side,
};

const ADAPTER_DEADLINE: Duration = Duration::from_secs(5);
const RETRY_BACKOFFS: [Duration; 3] = [
    Duration::from_millis(50),
    Duration::from_millis(200),
    Duration::from_secs(1),
];
const STRATEGY_INBOX_CAPACITY: usize = 256;

/// Delivered to a strategy's inbox by the demultiplexer.
#[derive(Debug, Clone)]
pub enum StrategyEvent {
    Order(AdapterEvent),
    /// The inbox overflowed and dropped an update; the strategy must
    /// force a full `open_orders()` reconciliation on its next tick.
    ReconciliationRequired,
}

struct Inbox {
    tx: mpsc::Sender<StrategyEvent>,
    order_counter: AtomicU64,
}

/// One reference-counted subscription, serialized per pair by virtue of
/// `DashMap`'s per-shard locking plus the `Mutex<u32>` guarding the count
/// itself (so concurrent `ensure_pair`/`release_pair` on the same pair
/// never race on the 0↔1 transition).
struct Subscription {
    count: Mutex<u32>,
}

pub struct Connector<A: ExchangeAdapter> {
    adapter: Arc<A>,
    subscriptions: DashMap<TradingPair, Arc<Subscription>>,
    strategies: DashMap<String, Inbox>,
    orphan_tx: mpsc::Sender<AdapterEvent>,
    orphan_rx: Mutex<mpsc::Receiver<AdapterEvent>>,
    /// Counter source for administrative orders (e.g. reconciler force-
    /// closes against an `unknown`-attributed position) that have no
    /// registered strategy inbox of their own.
    admin_counter: AtomicU64,
}

impl<A: ExchangeAdapter + 'static> Connector<A> {
    pub fn new(adapter: Arc<A>) -> Self {
        let (orphan_tx, orphan_rx) = mpsc::channel(1024);
        Self {
            adapter,
            subscriptions: DashMap::new(),
            strategies: DashMap::new(),
            orphan_tx,
            orphan_rx: Mutex::new(orphan_rx),
            admin_counter: AtomicU64::new(0),
        }
    }

    pub fn adapter(&self) -> &A {
        &self.adapter
    }

    /// Register a strategy's inbox. Must be called before any order is
    /// placed on its behalf.
    pub fn register_strategy(&self, name: &str) -> mpsc::Receiver<StrategyEvent> {
        let (tx, rx) = mpsc::channel(STRATEGY_INBOX_CAPACITY);
        self.strategies.insert(
            name.to_string(),
            Inbox {
                tx,
                order_counter: AtomicU64::new(0),
            },
        );
        rx
    }

    pub fn unregister_strategy(&self, name: &str) {
        self.strategies.remove(name);
    }

    /// `ensure_pair` increments the ref-count and subscribes only on the
    /// 0→1 transition (§4.4).
    pub async fn ensure_pair(&self, pair: &TradingPair) -> Result<(), AdapterError> {
        let sub = self
            .subscriptions
            .entry(pair.clone())
            .or_insert_with(|| Arc::new(Subscription { count: Mutex::new(0) }))
            .clone();

        let mut count = sub.count.lock().await;
        if *count == 0 {
            self.call_with_retry(|| self.adapter.subscribe(pair)).await?;
        }
        *count += 1;
        Ok(())
    }

    /// `release_pair` decrements the ref-count and unsubscribes only on
    /// the 1→0 transition (§4.4).
    pub async fn release_pair(&self, pair: &TradingPair) -> Result<(), AdapterError> {
        let Some(sub) = self.subscriptions.get(pair).map(|e| e.clone()) else {
            return Ok(());
        };

        let mut count = sub.count.lock().await;
        if *count == 0 {
            return Ok(());
        }
        *count -= 1;
        if *count == 0 {
            self.call_with_retry(|| self.adapter.unsubscribe(pair)).await?;
            drop(count);
            self.subscriptions.remove(pair);
        }
        Ok(())
    }

    /// Compose a `client_id` of the form
    /// `<strategy_name>-<pair>-<buy|sell>-<counter>` (§6) and place the
    /// order, tagging ownership for inbound demultiplexing.
    #[allow(clippy::too_many_arguments)]
    pub async fn place_order(
        &self,
        strategy_name: &str,
        trading_pair: &TradingPair,
        side: Side,
        order_type: OrderType,
        amount: f64,
        price: f64,
        position_action: PositionAction,
    ) -> Result<String, AdapterError> {
        let counter = match self.strategies.get(strategy_name) {
            Some(inbox) => inbox.order_counter.fetch_add(1, Ordering::Relaxed),
            // No live strategy inbox (e.g. a reconciler force-close
            // against an `unknown`-attributed position): still a valid,
            // attributable order, just counted from a shared sequence.
            None => self.admin_counter.fetch_add(1, Ordering::Relaxed),
        };

        let client_id = compose_client_id(strategy_name, trading_pair, side, counter);

        self.call_with_retry(|| {
            self.adapter.place_order(
                &client_id,
                trading_pair,
                side,
                order_type,
                amount,
                price,
                position_action,
            )
        })
        .await
    }

    pub async fn cancel(&self, exchange_id: &str) -> Result<(), AdapterError> {
        self.call_with_retry(|| self.adapter.cancel(exchange_id)).await
    }

    pub async fn open_orders(&self) -> Result<Vec<LiveOrder>, AdapterError> {
        self.call_with_retry(|| self.adapter.open_orders()).await
    }

    pub async fn positions(&self) -> Result<Vec<ExchangePosition>, AdapterError> {
        self.call_with_retry(|| self.adapter.positions()).await
    }

    pub async fn balance(&self) -> Result<Balance, AdapterError> {
        self.call_with_retry(|| self.adapter.balance()).await
    }

    /// Pull and demultiplex whatever adapter events have arrived,
    /// routing each `OrderUpdate` by its `client_id` prefix (§4.4). Call
    /// this from a single demux loop — never concurrently.
    pub async fn pump_events(&self) {
        let events = self.adapter.poll_events().await;
        for event in events {
            match &event {
                AdapterEvent::OrderUpdate { client_id, .. } => {
                    let owner = client_id.as_deref().and_then(owning_strategy);
                    match owner.and_then(|name| self.strategies.get(&name)) {
                        Some(inbox) => {
                            if let Err(mpsc::error::TrySendError::Full(_)) =
                                inbox.tx.try_send(StrategyEvent::Order(event.clone()))
                            {
                                warn!(
                                    exchange_id = %exchange_id_of(&event),
                                    "strategy inbox overflow, forcing reconciliation"
                                );
                                let _ = inbox.tx.try_send(StrategyEvent::ReconciliationRequired);
                            }
                        }
                        None => {
                            let _ = self.orphan_tx.try_send(event.clone());
                        }
                    }
                }
                AdapterEvent::PositionUpdate { .. } => {
                    let _ = self.orphan_tx.try_send(event.clone());
                }
            }
        }
    }

    /// Drain events routed to no known strategy (exchange-initiated
    /// orders, or orders from a now-deleted strategy); consumed by the
    /// Position Reconciler for attribution.
    pub async fn drain_orphans(&self) -> Vec<AdapterEvent> {
        let mut rx = self.orphan_rx.lock().await;
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    /// Every adapter call carries a 5s hard deadline and bounded retry on
    /// transient failure (§4.4): 50ms, 200ms, 1s, then surface the error.
    async fn call_with_retry<F, Fut, T>(&self, mut f: F) -> Result<T, AdapterError>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T, AdapterError>>,
    {
        let mut attempt = 0usize;
        loop {
            let result = tokio::time::timeout(ADAPTER_DEADLINE, f()).await;
            let err = match result {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(e)) => e,
                Err(_) => AdapterError::Timeout,
            };

            if !err.is_recoverable_internal() || attempt >= RETRY_BACKOFFS.len() {
                return Err(err);
            }
            debug!(attempt, %err, "retrying adapter call");
            tokio::time::sleep(RETRY_BACKOFFS[attempt]).await;
            attempt += 1;
        }
    }
}

fn compose_client_id(strategy_name: &str, pair: &TradingPair, side: Side, counter: u64) -> String {
    let side_str = match side {
        Side::Buy => "buy",
        Side::Sell => "sell",
    };
    let escape = |s: &str| s.to_lowercase().replace('-', "_");
    format!(
        "{}-{}-{}-{}",
        escape(strategy_name),
        escape(&pair.0),
        side_str,
        counter
    )
}

/// Parse the strategy-name prefix out of a `client_id`. The prefix is
/// everything before the trailing `-<pair>-<side>-<counter>` triple.
fn owning_strategy(client_id: &str) -> Option<String> {
    let mut parts: Vec<&str> = client_id.split('-').collect();
    if parts.len() < 4 {
        return None;
    }
    // Drop counter, side, pair — what remains is the (possibly
    // underscore-escaped) strategy name.
    parts.truncate(parts.len() - 3);
    Some(parts.join("-"))
}

fn exchange_id_of(event: &AdapterEvent) -> String {
    match event {
        AdapterEvent::OrderUpdate { exchange_id, .. } => exchange_id.clone(),
        AdapterEvent::PositionUpdate { .. } => String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_roundtrip() {
        let pair = TradingPair::new("BTC-USD");
        let id = compose_client_id("btc_mm", &pair, Side::Buy, 7);
        assert_eq!(id, "btc_mm-btc_usd-buy-7");
        assert_eq!(owning_strategy(&id), Some("btc_mm".to_string()));
    }

    #[test]
    fn client_id_parse_requires_four_segments() {
        assert_eq!(owning_strategy("exchange-native-order-42"), Some("exchange".to_string()));
        assert_eq!(owning_strategy("garbage"), None);
    }
}
