//! A no-op strategy body for kinds whose algorithm is out of scope
//! (§1 Non-goals: "Strategy algorithms themselves are not redefined
//! here"). Still ticks, still reports counters, never submits orders —
//! enough to exercise the scheduler, registry and reconciler for
//! `avellaneda_market_making` and `cross_exchange_market_making` rows.

use async_trait::async_trait;

use crate::config::StrategyKind;
use crate::connector::StrategyEvent;
use crate::error::AdapterError;
use crate::exchange::ExchangeAdapter;

use super::{Strategy, StrategyContext};

pub struct PassiveQuoter {
    kind: StrategyKind,
}

impl PassiveQuoter {
    pub fn new(kind: StrategyKind) -> Self {
        Self { kind }
    }
}

#[async_trait]
impl<A: ExchangeAdapter + 'static> Strategy<A> for PassiveQuoter {
    async fn start(&mut self, _ctx: &StrategyContext<'_, A>) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn tick(&mut self, _ctx: &StrategyContext<'_, A>, _events: Vec<StrategyEvent>) -> Result<(), AdapterError> {
        Ok(())
    }

    async fn stop(&mut self, _ctx: &StrategyContext<'_, A>, _cancel_orders: bool) -> Result<(), AdapterError> {
        Ok(())
    }

    fn describe_parameters(&self) -> serde_json::Value {
        serde_json::json!({ "kind": self.kind, "note": "algorithm not implemented, schema-only" })
    }
}
