//! Strategy capability set (§9 Design Notes) — the interface the core
//! drives on each tick. Individual market-making algorithms are out of
//! scope; `pmm` below is a minimal reference implementation used to
//! exercise the scheduler end to end in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TradingPair;
use crate::connector::{Connector, StrategyEvent};
use crate::error::AdapterError;
use crate::exchange::{ExchangeAdapter, OrderType, PositionAction, Side};

/// A snapshot of which pairs are currently live. The content of the
/// order book itself flows through the adapter's own market-data
/// channel, which sits outside this core's specified interface (§4.3).
#[derive(Debug, Clone)]
pub struct MarketSnapshot {
    pub subscribed_pairs: Vec<TradingPair>,
}

#[derive(Debug, Clone)]
pub struct SubmitOrder {
    pub trading_pair: TradingPair,
    pub side: Side,
    pub order_type: OrderType,
    pub amount: f64,
    pub price: f64,
    pub position_action: PositionAction,
}

/// The bounded context a `Strategy` is given on `start`/`tick`/`stop`
/// (§4.6): `market_snapshot`, `open_orders`, `submit`, `cancel`, `now`.
pub struct StrategyContext<'a, A: ExchangeAdapter> {
    pub strategy_name: &'a str,
    pub trading_pairs: &'a [TradingPair],
    connector: &'a Connector<A>,
}

impl<'a, A: ExchangeAdapter + 'static> StrategyContext<'a, A> {
    pub fn new(strategy_name: &'a str, trading_pairs: &'a [TradingPair], connector: &'a Connector<A>) -> Self {
        Self {
            strategy_name,
            trading_pairs,
            connector,
        }
    }

    pub fn market_snapshot(&self) -> MarketSnapshot {
        MarketSnapshot {
            subscribed_pairs: self.trading_pairs.to_vec(),
        }
    }

    pub async fn open_orders(&self) -> Result<Vec<crate::exchange::LiveOrder>, AdapterError> {
        self.connector.open_orders().await
    }

    pub async fn submit(&self, order: SubmitOrder) -> Result<String, AdapterError> {
        self.connector
            .place_order(
                self.strategy_name,
                &order.trading_pair,
                order.side,
                order.order_type,
                order.amount,
                order.price,
                order.position_action,
            )
            .await
    }

    pub async fn cancel(&self, exchange_id: &str) -> Result<(), AdapterError> {
        self.connector.cancel(exchange_id).await
    }

    pub fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// The capability set every strategy implementation provides.
#[async_trait]
pub trait Strategy<A: ExchangeAdapter>: Send + Sync {
    async fn start(&mut self, ctx: &StrategyContext<'_, A>) -> Result<(), AdapterError>;
    async fn tick(
        &mut self,
        ctx: &StrategyContext<'_, A>,
        events: Vec<StrategyEvent>,
    ) -> Result<(), AdapterError>;

    /// `cancel_orders` reflects the caller's intent (`delete(cancel_orders)`,
    /// `update(preserve_orders)`, §4.5): only cancel live orders when true.
    async fn stop(&mut self, ctx: &StrategyContext<'_, A>, cancel_orders: bool) -> Result<(), AdapterError>;

    /// Apply a parameter change to an already-running instance without a
    /// restart (§4.5: only a `kind` change requires one). Default is a
    /// no-op for strategies with nothing to hot-reload.
    async fn reload(&mut self, _parameters: &serde_json::Value) -> Result<(), AdapterError> {
        Ok(())
    }

    /// JSON schema describing this strategy's accepted parameters, for
    /// operator tooling.
    fn describe_parameters(&self) -> serde_json::Value;
}

pub mod passive;
pub mod pmm;
