//! In-memory `ExchangeAdapter` used by integration tests (C14) to drive
//! the scheduler, multiplexer and reconciler without a real exchange.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::Utc;
use parking_lot::Mutex;

use super::{
    AdapterEvent, Balance, ExchangeAdapter, ExchangePosition, LiveOrder, OrderState, OrderType,
    PositionAction, Side,
};
use crate::config::TradingPair;
use crate::error::AdapterError;

#[derive(Default)]
struct State {
    subscriptions: HashMap<TradingPair, ()>,
    orders: HashMap<String, LiveOrder>,
    positions: Vec<ExchangePosition>,
    events: Vec<AdapterEvent>,
    reject_next: bool,
    timeout_next: bool,
}

/// A fully synchronous, fully deterministic stand-in for a real
/// perpetual-derivative exchange connection.
pub struct MockAdapter {
    state: Mutex<State>,
    next_id: AtomicU64,
}

impl Default for MockAdapter {
    fn default() -> Self {
        Self::new()
    }
}

impl MockAdapter {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State::default()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Test hook: force the next `place_order` to return `OrderRejected`.
    pub fn reject_next_order(&self) {
        self.state.lock().reject_next = true;
    }

    /// Test hook: force the next adapter call to time out.
    pub fn timeout_next_call(&self) {
        self.state.lock().timeout_next = true;
    }

    /// Test hook: simulate the exchange filling an order.
    pub fn fill_order(&self, exchange_id: &str, filled_amount: f64) {
        let mut state = self.state.lock();
        if let Some(order) = state.orders.get_mut(exchange_id) {
            order.state = OrderState::Filled;
            let client_id = order.client_id.clone();
            state.events.push(AdapterEvent::OrderUpdate {
                exchange_id: exchange_id.to_string(),
                client_id,
                state: OrderState::Filled,
                filled_amount,
                ts: Utc::now(),
            });
        }
    }

    pub fn set_position(&self, position: ExchangePosition) {
        self.state.lock().positions.push(position);
    }

    pub fn subscription_count(&self, pair: &TradingPair) -> bool {
        self.state.lock().subscriptions.contains_key(pair)
    }
}

#[async_trait::async_trait]
impl ExchangeAdapter for MockAdapter {
    async fn subscribe(&self, pair: &TradingPair) -> Result<(), AdapterError> {
        self.state.lock().subscriptions.insert(pair.clone(), ());
        Ok(())
    }

    async fn unsubscribe(&self, pair: &TradingPair) -> Result<(), AdapterError> {
        self.state.lock().subscriptions.remove(pair);
        Ok(())
    }

    async fn place_order(
        &self,
        client_id: &str,
        trading_pair: &TradingPair,
        side: Side,
        _order_type: OrderType,
        amount: f64,
        price: f64,
        _position_action: PositionAction,
    ) -> Result<String, AdapterError> {
        let mut state = self.state.lock();
        if state.timeout_next {
            state.timeout_next = false;
            return Err(AdapterError::Timeout);
        }
        if state.reject_next {
            state.reject_next = false;
            return Err(AdapterError::OrderRejected("mock rejection".into()));
        }

        let exchange_id = format!("mock-{}", self.next_id.fetch_add(1, Ordering::Relaxed));
        state.orders.insert(
            exchange_id.clone(),
            LiveOrder {
                client_id: Some(client_id.to_string()),
                exchange_id: exchange_id.clone(),
                trading_pair: trading_pair.clone(),
                side,
                amount,
                price,
                state: OrderState::Open,
            },
        );
        Ok(exchange_id)
    }

    async fn cancel(&self, exchange_id: &str) -> Result<(), AdapterError> {
        let mut state = self.state.lock();
        match state.orders.get_mut(exchange_id) {
            Some(order) => {
                order.state = OrderState::Cancelled;
                Ok(())
            }
            None => Err(AdapterError::CancelFailed("unknown order".into())),
        }
    }

    async fn open_orders(&self) -> Result<Vec<LiveOrder>, AdapterError> {
        Ok(self
            .state
            .lock()
            .orders
            .values()
            .filter(|o| !o.state.is_terminal())
            .cloned()
            .collect())
    }

    async fn positions(&self) -> Result<Vec<ExchangePosition>, AdapterError> {
        Ok(self.state.lock().positions.clone())
    }

    async fn balance(&self) -> Result<Balance, AdapterError> {
        Ok(Balance {
            account_value: 10_000.0,
            withdrawable: 10_000.0,
        })
    }

    async fn poll_events(&self) -> Vec<AdapterEvent> {
        std::mem::take(&mut self.state.lock().events)
    }
}
