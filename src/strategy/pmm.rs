//! Pure market making: quote a fixed bid/ask spread around the last
//! trade price, one level per side, replacing the full ladder on
//! every tick. The reference strategy exercised by the integration
//! tests (§8, C14).

use async_trait::async_trait;
use tracing::debug;

use crate::config::PmmParams;
use crate::connector::StrategyEvent;
use crate::error::AdapterError;
use crate::exchange::{ExchangeAdapter, OrderType, PositionAction, Side};

use super::{Strategy, StrategyContext, SubmitOrder};

pub struct PureMarketMaking {
    params: PmmParams,
    live_orders: Vec<String>,
    reference_price: f64,
}

impl PureMarketMaking {
    pub fn new(params: PmmParams, reference_price: f64) -> Self {
        Self {
            params,
            live_orders: Vec::new(),
            reference_price,
        }
    }

    async fn cancel_all<A: ExchangeAdapter + 'static>(&mut self, ctx: &StrategyContext<'_, A>) {
        for exchange_id in self.live_orders.drain(..) {
            if let Err(err) = ctx.cancel(&exchange_id).await {
                debug!(%exchange_id, %err, "cancel failed during requote, order may already be gone");
            }
        }
    }
}

#[async_trait]
impl<A: ExchangeAdapter + 'static> Strategy<A> for PureMarketMaking {
    async fn start(&mut self, _ctx: &StrategyContext<'_, A>) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn tick(
        &mut self,
        ctx: &StrategyContext<'_, A>,
        events: Vec<StrategyEvent>,
    ) -> Result<(), AdapterError> {
        for event in events {
            if let StrategyEvent::ReconciliationRequired = event {
                debug!(strategy = ctx.strategy_name, "reconciliation requested, requoting");
            }
        }

        self.cancel_all(ctx).await;

        let pair = ctx
            .trading_pairs
            .first()
            .cloned()
            .ok_or_else(|| AdapterError::OrderRejected("no trading pair configured".into()))?;

        let bid_price = self.reference_price * (1.0 - self.params.bid_spread);
        let ask_price = self.reference_price * (1.0 + self.params.ask_spread);

        let bid_id = ctx
            .submit(SubmitOrder {
                trading_pair: pair.clone(),
                side: Side::Buy,
                order_type: OrderType::Limit,
                amount: self.params.order_amount,
                price: bid_price,
                position_action: PositionAction::Open,
            })
            .await?;
        let ask_id = ctx
            .submit(SubmitOrder {
                trading_pair: pair,
                side: Side::Sell,
                order_type: OrderType::Limit,
                amount: self.params.order_amount,
                price: ask_price,
                position_action: PositionAction::Open,
            })
            .await?;

        self.live_orders.push(bid_id);
        self.live_orders.push(ask_id);
        Ok(())
    }

    async fn stop(&mut self, ctx: &StrategyContext<'_, A>, cancel_orders: bool) -> Result<(), AdapterError> {
        if cancel_orders {
            self.cancel_all(ctx).await;
        }
        Ok(())
    }

    async fn reload(&mut self, parameters: &serde_json::Value) -> Result<(), AdapterError> {
        let parsed: PmmParams = serde_json::from_value(parameters.clone())
            .map_err(|e| AdapterError::OrderRejected(format!("invalid parameters on reload: {e}")))?;
        self.params = parsed;
        Ok(())
    }

    fn describe_parameters(&self) -> serde_json::Value {
        serde_json::json!({
            "kind": "pure_market_making",
            "fields": {
                "bid_spread": "f64, fraction below reference price",
                "ask_spread": "f64, fraction above reference price",
                "order_amount": "f64",
                "order_levels": "u32 (reference implementation only quotes one level)",
                "leverage": "u32",
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Connector;
    use crate::exchange::mock::MockAdapter;
    use std::sync::Arc;

    fn params() -> PmmParams {
        PmmParams {
            bid_spread: 0.001,
            ask_spread: 0.001,
            order_amount: 1.0,
            order_levels: 1,
            leverage: 1,
        }
    }

    #[tokio::test]
    async fn tick_places_one_bid_and_one_ask() {
        let adapter = Arc::new(MockAdapter::new());
        let connector = Connector::new(adapter);
        connector.register_strategy("pmm_test");
        let pairs = vec![crate::config::TradingPair::new("BTC-USD")];
        let ctx = StrategyContext::new("pmm_test", &pairs, &connector);

        let mut strategy = PureMarketMaking::new(params(), 100.0);
        strategy.start(&ctx).await.unwrap();
        strategy.tick(&ctx, vec![]).await.unwrap();

        let open = ctx.open_orders().await.unwrap();
        assert_eq!(open.len(), 2);
        assert_eq!(strategy.live_orders.len(), 2);
    }

    #[tokio::test]
    async fn requote_cancels_previous_orders() {
        let adapter = Arc::new(MockAdapter::new());
        let connector = Connector::new(adapter);
        connector.register_strategy("pmm_test");
        let pairs = vec![crate::config::TradingPair::new("BTC-USD")];
        let ctx = StrategyContext::new("pmm_test", &pairs, &connector);

        let mut strategy = PureMarketMaking::new(params(), 100.0);
        strategy.tick(&ctx, vec![]).await.unwrap();
        let first_round = strategy.live_orders.clone();
        strategy.tick(&ctx, vec![]).await.unwrap();

        let open = ctx.open_orders().await.unwrap();
        for id in &first_round {
            assert!(!open.iter().any(|o| &o.exchange_id == id));
        }
        assert_eq!(open.len(), 2);
    }
}
