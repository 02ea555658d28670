//! StrategyConfig and the kind-tagged parameter schema (§3, §9).

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// The three strategy kinds the core recognizes. Individual algorithms are
/// out of scope; only the wire-level shape of their parameters is here.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StrategyKind {
    PureMarketMaking,
    AvellanedaMarketMaking,
    CrossExchangeMarketMaking,
}

/// Kind-specific parameters, validated and parsed from the free-form wire
/// JSON. Unknown keys are rejected (`deny_unknown_fields`).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct PmmParams {
    pub bid_spread: f64,
    pub ask_spread: f64,
    pub order_amount: f64,
    pub order_levels: u32,
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct AvellanedaParams {
    pub order_amount: f64,
    pub risk_aversion: f64,
    pub order_book_depth: u32,
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CrossExchangeParams {
    pub order_amount: f64,
    pub min_profitability: f64,
    pub leverage: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StrategyParameters {
    Pmm(PmmParams),
    Avellaneda(AvellanedaParams),
    CrossExchange(CrossExchangeParams),
}

impl StrategyParameters {
    /// Parse and validate a free-form JSON value against `kind`'s schema.
    pub fn parse(kind: StrategyKind, raw: &serde_json::Value) -> Result<Self, ConfigError> {
        let invalid = |e: serde_json::Error| ConfigError::InvalidConfig(format!("parameters: {e}"));
        match kind {
            StrategyKind::PureMarketMaking => Ok(StrategyParameters::Pmm(
                serde_json::from_value(raw.clone()).map_err(invalid)?,
            )),
            StrategyKind::AvellanedaMarketMaking => Ok(StrategyParameters::Avellaneda(
                serde_json::from_value(raw.clone()).map_err(invalid)?,
            )),
            StrategyKind::CrossExchangeMarketMaking => Ok(StrategyParameters::CrossExchange(
                serde_json::from_value(raw.clone()).map_err(invalid)?,
            )),
        }
    }
}

/// Canonical `BASE-QUOTE` trading pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TradingPair(pub String);

impl TradingPair {
    pub fn new(s: impl Into<String>) -> Self {
        TradingPair(s.into())
    }
}

impl std::fmt::Display for TradingPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The declarative definition of one strategy (§3).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyConfig {
    pub name: String,
    pub kind: StrategyKind,
    pub trading_pairs: Vec<TradingPair>,
    pub parameters: serde_json::Value,
    pub refresh_interval_ms: u64,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default = "Utc::now")]
    pub created_at: DateTime<Utc>,
    #[serde(default = "Utc::now")]
    pub updated_at: DateTime<Utc>,
}

fn default_enabled() -> bool {
    true
}

impl StrategyConfig {
    /// Validate invariants from §3: non-empty unique name, non-empty
    /// pairs, refresh interval floor, and kind-specific parameter schema.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.name.trim().is_empty() {
            return Err(ConfigError::InvalidConfig("name must not be empty".into()));
        }
        if self.trading_pairs.is_empty() {
            return Err(ConfigError::InvalidConfig(
                "trading_pairs must not be empty".into(),
            ));
        }
        if self.refresh_interval_ms < 100 {
            return Err(ConfigError::InvalidConfig(
                "refresh_interval_ms must be >= 100".into(),
            ));
        }
        StrategyParameters::parse(self.kind, &self.parameters)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base() -> StrategyConfig {
        StrategyConfig {
            name: "btc_mm".to_string(),
            kind: StrategyKind::PureMarketMaking,
            trading_pairs: vec![TradingPair::new("BTC-USD")],
            parameters: serde_json::json!({
                "bid_spread": 0.002,
                "ask_spread": 0.002,
                "order_amount": 0.001,
                "order_levels": 1,
                "leverage": 1,
            }),
            refresh_interval_ms: 5000,
            enabled: true,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn refresh_interval_floor_100_is_accepted() {
        let mut cfg = base();
        cfg.refresh_interval_ms = 100;
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn refresh_interval_below_floor_is_rejected() {
        let mut cfg = base();
        cfg.refresh_interval_ms = 50;
        assert!(matches!(cfg.validate(), Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn empty_trading_pairs_is_rejected() {
        let mut cfg = base();
        cfg.trading_pairs = vec![];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn unknown_parameter_field_is_rejected() {
        let mut cfg = base();
        cfg.parameters["unexpected_field"] = serde_json::json!(true);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn mismatched_kind_and_parameters_is_rejected() {
        let mut cfg = base();
        cfg.kind = StrategyKind::CrossExchangeMarketMaking;
        assert!(cfg.validate().is_err());
    }
}
