//! Position Reconciler (C7) — periodic position snapshot, substring
//! attribution heuristic, and forced close (§4.7).

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{debug, info, warn};

use crate::connector::Connector;
use crate::error::AdapterError;
use crate::exchange::{AdapterEvent, ExchangeAdapter, ExchangePosition, OrderType, PositionAction, PositionSide, Side};
use crate::mirror::{MirrorEvent, RemoteMirror};
use crate::registry::Registry;

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Attribution {
    Strategy(String),
    Unknown,
}

impl Attribution {
    pub fn as_option(&self) -> Option<String> {
        match self {
            Attribution::Strategy(name) => Some(name.clone()),
            Attribution::Unknown => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AttributedPosition {
    pub position: ExchangePosition,
    pub attribution: Attribution,
}

#[derive(Debug, serde::Serialize)]
pub struct ForceCloseReport {
    pub positions_closed: u32,
    pub errors: Vec<String>,
}

pub struct Reconciler<A: ExchangeAdapter> {
    instance_id: String,
    connector: Arc<Connector<A>>,
    registry: Arc<Registry<A>>,
    mirror: RemoteMirror,
}

impl<A: ExchangeAdapter + 'static> Reconciler<A> {
    pub fn new(instance_id: String, connector: Arc<Connector<A>>, registry: Arc<Registry<A>>, mirror: RemoteMirror) -> Self {
        Self {
            instance_id,
            connector,
            registry,
            mirror,
        }
    }

    /// One reconciliation cycle: read `positions()`, persist a snapshot
    /// row per non-zero position, and return the attributed set. Also
    /// drains whatever order/position events the demux loop (C4) routed
    /// to no live strategy, so they don't dead-end silently (§4.4/§4.7).
    pub async fn run_once(&self) -> Result<Vec<AttributedPosition>, AdapterError> {
        self.consume_orphans().await;
        let positions = self.connector.positions().await?;
        let strategies: Vec<_> = self.registry.list();

        let mut out = Vec::with_capacity(positions.len());
        for position in positions {
            if position.size == 0.0 {
                continue;
            }
            let attribution = self.attribute(&position, &strategies).await;

            self.mirror.send(MirrorEvent::PositionSnapshot {
                instance_id: self.instance_id.clone(),
                trading_pair: position.trading_pair.0.clone(),
                side: match position.side {
                    PositionSide::Long => "long".to_string(),
                    PositionSide::Short => "short".to_string(),
                },
                size: position.size,
                entry_price: position.entry_price,
                mark_price: position.mark_price,
                unrealized_pnl: position.unrealized_pnl,
                attributed_strategy: attribution.as_option(),
                ts: Utc::now(),
            });

            out.push(AttributedPosition { position, attribution });
        }
        Ok(out)
    }

    /// Drain events the connector's demux loop could not route to a
    /// live strategy inbox (exchange-initiated orders, or updates for a
    /// strategy deleted since submission) and log them; the owning
    /// position still surfaces in the next `positions()` read above.
    async fn consume_orphans(&self) {
        for event in self.connector.drain_orphans().await {
            match event {
                AdapterEvent::OrderUpdate { exchange_id, state, .. } => {
                    debug!(exchange_id, ?state, "unattributed order update");
                }
                AdapterEvent::PositionUpdate { position, .. } => {
                    debug!(pair = %position.trading_pair, size = position.size, "unattributed position update");
                }
            }
        }
    }

    /// A position is attributed to the strategy whose `name` contains
    /// the base asset as a case-insensitive substring AND whose
    /// `trading_pairs` contains the position's pair; ties go to the
    /// earliest `created_at`; otherwise `Unknown` (§4.7).
    async fn attribute(
        &self,
        position: &ExchangePosition,
        strategies: &[(String, Arc<crate::registry::StrategyInstance>)],
    ) -> Attribution {
        let base = position
            .trading_pair
            .0
            .split('-')
            .next()
            .unwrap_or(&position.trading_pair.0)
            .to_lowercase();

        let mut candidates = Vec::new();
        for (name, instance) in strategies {
            let cfg = instance.config.read().await;
            if !cfg.trading_pairs.contains(&position.trading_pair) {
                continue;
            }
            if name.to_lowercase().contains(&base) {
                candidates.push((cfg.created_at, name.clone()));
            }
        }

        candidates.sort_by_key(|(created_at, _)| *created_at);
        match candidates.into_iter().next() {
            Some((_, name)) => Attribution::Strategy(name),
            None => Attribution::Unknown,
        }
    }

    /// `force_close(strategy_name?)` (§4.7): opens a reducing market
    /// order on the opposite side for every attributed position matched
    /// by `strategy_name` (or all, if `None`). Never retries on failure.
    pub async fn force_close(&self, strategy_name: Option<&str>) -> Result<ForceCloseReport, AdapterError> {
        let attributed = self.run_once().await?;
        let mut closed = 0u32;
        let mut errors = Vec::new();

        for ap in attributed {
            let matches = match (&ap.attribution, strategy_name) {
                (_, None) => true,
                (Attribution::Strategy(name), Some(target)) => name == target,
                (Attribution::Unknown, Some(_)) => false,
            };
            if !matches {
                continue;
            }

            let side = match ap.position.side {
                PositionSide::Long => Side::Sell,
                PositionSide::Short => Side::Buy,
            };
            let owner = ap.attribution.as_option().unwrap_or_else(|| "unknown".to_string());

            match self
                .connector
                .place_order(
                    &owner,
                    &ap.position.trading_pair,
                    side,
                    OrderType::Market,
                    ap.position.size.abs(),
                    ap.position.mark_price,
                    PositionAction::Close,
                )
                .await
            {
                Ok(_) => closed += 1,
                Err(e) => {
                    warn!(pair = %ap.position.trading_pair, %e, "force close order failed");
                    errors.push(format!("{}: {e}", ap.position.trading_pair));
                }
            }
        }

        info!(closed, errors = errors.len(), "force_close completed");
        Ok(ForceCloseReport {
            positions_closed: closed,
            errors,
        })
    }

    pub async fn run_forever(self: Arc<Self>, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = self.run_once().await {
                warn!(%e, "reconciliation cycle failed");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{StrategyConfig, StrategyKind, TradingPair};
    use crate::exchange::mock::MockAdapter;
    use crate::store::ConfigStore;
    use chrono::Utc;

    async fn registry_with(names_and_pairs: &[(&str, &str)]) -> (Arc<Registry<MockAdapter>>, Arc<Connector<MockAdapter>>) {
        let mirror = RemoteMirror::disabled();
        let path = std::env::temp_dir().join(format!("hive_reconciler_test_{}.json", uuid::Uuid::new_v4()));
        let store = Arc::new(ConfigStore::open(path, mirror.clone()).await.unwrap());
        let connector = Arc::new(Connector::new(Arc::new(MockAdapter::new())));
        let registry = Arc::new(Registry::new("test".to_string(), store, connector.clone(), mirror));

        for (name, pair) in names_and_pairs {
            registry
                .create(StrategyConfig {
                    name: name.to_string(),
                    kind: StrategyKind::PureMarketMaking,
                    trading_pairs: vec![TradingPair::new(*pair)],
                    parameters: serde_json::json!({
                        "bid_spread": 0.001, "ask_spread": 0.001, "order_amount": 1.0, "order_levels": 1, "leverage": 1
                    }),
                    refresh_interval_ms: 60_000,
                    enabled: true,
                    created_at: Utc::now(),
                    updated_at: Utc::now(),
                })
                .await
                .unwrap();
        }
        (registry, connector)
    }

    fn position(pair: &str, size: f64) -> ExchangePosition {
        ExchangePosition {
            trading_pair: TradingPair::new(pair),
            side: if size > 0.0 { PositionSide::Long } else { PositionSide::Short },
            size,
            entry_price: 100.0,
            mark_price: 101.0,
            unrealized_pnl: 1.0,
            leverage: 1,
        }
    }

    #[tokio::test]
    async fn attributes_by_case_insensitive_substring_and_pair_match() {
        let (registry, connector) = registry_with(&[("btc_mm", "BTC-USD")]).await;
        let mirror = RemoteMirror::disabled();
        let reconciler = Reconciler::new("test".to_string(), connector, registry, mirror);

        let attribution = reconciler.attribute(&position("BTC-USD", 1.0), &reconciler.registry.list()).await;
        assert_eq!(attribution, Attribution::Strategy("btc_mm".to_string()));
    }

    #[tokio::test]
    async fn no_matching_strategy_is_unknown() {
        let (registry, connector) = registry_with(&[("btc_mm", "BTC-USD")]).await;
        let mirror = RemoteMirror::disabled();
        let reconciler = Reconciler::new("test".to_string(), connector, registry, mirror);

        let attribution = reconciler.attribute(&position("ETH-USD", 1.0), &reconciler.registry.list()).await;
        assert_eq!(attribution, Attribution::Unknown);
    }

    #[tokio::test]
    async fn pair_mismatch_is_unknown_even_with_name_match() {
        let (registry, connector) = registry_with(&[("eth_mm", "BTC-USD")]).await;
        let mirror = RemoteMirror::disabled();
        let reconciler = Reconciler::new("test".to_string(), connector, registry, mirror);

        let attribution = reconciler.attribute(&position("ETH-USD", 1.0), &reconciler.registry.list()).await;
        assert_eq!(attribution, Attribution::Unknown);
    }
}
