//! Exchange Adapter contract (C3) — external collaborator, specified only
//! at its interface (§4.3). The core never implements the real exchange
//! protocol; `MockAdapter` in `exchange::mock` exists purely to exercise
//! C4–C7 in tests.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::config::TradingPair;
use crate::error::AdapterError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Buy,
    Sell,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderType {
    Limit,
    Market,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionAction {
    Open,
    Close,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum OrderState {
    Submitted,
    Open,
    PartiallyFilled,
    Filled,
    Cancelled,
    Rejected,
}

impl OrderState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderState::Filled | OrderState::Cancelled | OrderState::Rejected)
    }
}

#[derive(Debug, Clone)]
pub struct LiveOrder {
    pub client_id: Option<String>,
    pub exchange_id: String,
    pub trading_pair: TradingPair,
    pub side: Side,
    pub amount: f64,
    pub price: f64,
    pub state: OrderState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PositionSide {
    Long,
    Short,
}

#[derive(Debug, Clone)]
pub struct ExchangePosition {
    pub trading_pair: TradingPair,
    pub side: PositionSide,
    pub size: f64,
    pub entry_price: f64,
    pub mark_price: f64,
    pub unrealized_pnl: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone)]
pub struct Balance {
    pub account_value: f64,
    pub withdrawable: f64,
}

/// Order and position events delivered on the adapter's single ordered
/// event stream (§4.3). Per-`exchange_id` ordering is preserved;
/// cross-order ordering is not guaranteed.
#[derive(Debug, Clone)]
pub enum AdapterEvent {
    OrderUpdate {
        exchange_id: String,
        client_id: Option<String>,
        state: OrderState,
        filled_amount: f64,
        ts: DateTime<Utc>,
    },
    PositionUpdate {
        position: ExchangePosition,
        ts: DateTime<Utc>,
    },
}

/// Authenticated order placement, cancellation, position/balance reads,
/// and market-data subscription (§4.3). Implementations live outside this
/// crate; the core only depends on this trait.
#[async_trait]
pub trait ExchangeAdapter: Send + Sync {
    async fn subscribe(&self, pair: &TradingPair) -> Result<(), AdapterError>;
    async fn unsubscribe(&self, pair: &TradingPair) -> Result<(), AdapterError>;

    #[allow(clippy::too_many_arguments)]
    async fn place_order(
        &self,
        client_id: &str,
        trading_pair: &TradingPair,
        side: Side,
        order_type: OrderType,
        amount: f64,
        price: f64,
        position_action: PositionAction,
    ) -> Result<String, AdapterError>;

    async fn cancel(&self, exchange_id: &str) -> Result<(), AdapterError>;

    async fn open_orders(&self) -> Result<Vec<LiveOrder>, AdapterError>;

    async fn positions(&self) -> Result<Vec<ExchangePosition>, AdapterError>;

    async fn balance(&self) -> Result<Balance, AdapterError>;

    /// Drain whatever adapter events have arrived since the last call.
    /// A real implementation backs this with its own WS task and an
    /// internal channel; the core only ever pulls from here.
    async fn poll_events(&self) -> Vec<AdapterEvent>;
}

pub mod mock;
