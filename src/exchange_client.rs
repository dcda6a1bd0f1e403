// =============================================================================
// Exchange Client registry — pluggable venues with EMA-smoothed telemetry
// =============================================================================
//
// Generalizes the donor's single hardcoded `BinanceClient` into a trait any
// venue adapter can implement, plus a router that scores registered venues
// on a weighted blend of latency, slippage, fill quality, volume, and spread
// and hands the order to whichever scores highest. Telemetry updates use an
// EMA with alpha 0.1, the same smoothing constant the donor uses for its
// order-flow-imbalance running average.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

use crate::binance::client::BinanceClient;
use crate::errors::{EngineError, EngineResult};

const TELEMETRY_ALPHA: f64 = 0.1;

/// Fixed spread-normalization threshold: 10 bps (0.001), independent of the
/// configured slippage threshold.
const SPREAD_THRESHOLD_BPS: f64 = 10.0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub struct ExchangeId(&'static str);

impl ExchangeId {
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    pub fn as_str(&self) -> &'static str {
        self.0
    }
}

impl std::fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

pub const BINANCE: ExchangeId = ExchangeId::new("binance");

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Market,
    Limit,
}

#[derive(Debug, Clone)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: String,
    pub order_type: OrderType,
    pub quantity: f64,
    pub price: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderState {
    Pending,
    Filled,
    PartiallyFilled,
    Cancelled,
    Rejected,
}

#[derive(Debug, Clone)]
pub struct OrderAck {
    pub exchange_order_id: String,
    pub state: OrderState,
    pub filled_quantity: f64,
    pub avg_fill_price: f64,
    pub raw: serde_json::Value,
}

/// A venue adapter. `BinanceExchangeClient` is the only implementor shipped
/// here; the registry exists so a second venue can be added without
/// touching `OrderRouter` or `ExecutionEngine`.
#[async_trait]
pub trait ExchangeClient: Send + Sync {
    fn id(&self) -> ExchangeId;

    /// Whether this venue lists `symbol`. Defaults to true; venues with a
    /// restricted listing set override this.
    fn supports(&self, _symbol: &str) -> bool {
        true
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck>;
}

pub struct BinanceExchangeClient {
    client: Arc<BinanceClient>,
}

impl BinanceExchangeClient {
    pub fn new(client: Arc<BinanceClient>) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ExchangeClient for BinanceExchangeClient {
    fn id(&self) -> ExchangeId {
        BINANCE
    }

    async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
        let order_type_str = match order.order_type {
            OrderType::Market => "MARKET",
            OrderType::Limit => "LIMIT",
        };
        let time_in_force = match order.order_type {
            OrderType::Limit => Some("GTC"),
            OrderType::Market => None,
        };

        let raw = self
            .client
            .place_order(
                &order.symbol,
                &order.side,
                order_type_str,
                order.quantity,
                order.price,
                time_in_force,
                None,
            )
            .await?;

        let filled_quantity = raw
            .get("executedQty")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .unwrap_or(order.quantity);
        let avg_fill_price = raw
            .get("price")
            .and_then(|v| v.as_str())
            .and_then(|s| s.parse::<f64>().ok())
            .filter(|p| *p > 0.0)
            .or(order.price)
            .unwrap_or(0.0);

        let state = match raw.get("status").and_then(|v| v.as_str()) {
            Some("FILLED") => OrderState::Filled,
            Some("PARTIALLY_FILLED") => OrderState::PartiallyFilled,
            Some("CANCELED") | Some("EXPIRED") => OrderState::Cancelled,
            Some("REJECTED") => OrderState::Rejected,
            _ => OrderState::Pending,
        };

        Ok(OrderAck {
            exchange_order_id: raw
                .get("orderId")
                .map(|v| v.to_string())
                .unwrap_or_default(),
            state,
            filled_quantity,
            avg_fill_price,
            raw,
        })
    }
}

/// EMA-smoothed routing signals for one venue. Each field starts at a
/// neutral value so a brand-new venue with no fills isn't unfairly
/// penalized or favored until telemetry accumulates.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ExchangeTelemetry {
    pub latency_ms: f64,
    pub slippage_bps: f64,
    pub fill_quality: f64,
    pub volume: f64,
    pub spread_bps: f64,
    pub samples: u64,
}

impl Default for ExchangeTelemetry {
    fn default() -> Self {
        Self {
            latency_ms: 100.0,
            slippage_bps: 2.0,
            fill_quality: 0.9,
            volume: 0.0,
            spread_bps: 5.0,
            samples: 0,
        }
    }
}

impl ExchangeTelemetry {
    fn update(&mut self, latency_ms: f64, slippage_bps: f64, fill_quality: f64, volume: f64, spread_bps: f64) {
        if self.samples == 0 {
            self.latency_ms = latency_ms;
            self.slippage_bps = slippage_bps;
            self.fill_quality = fill_quality;
            self.volume = volume;
            self.spread_bps = spread_bps;
        } else {
            self.latency_ms = ema(self.latency_ms, latency_ms);
            self.slippage_bps = ema(self.slippage_bps, slippage_bps);
            self.fill_quality = ema(self.fill_quality, fill_quality);
            self.volume = ema(self.volume, volume);
            self.spread_bps = ema(self.spread_bps, spread_bps);
        }
        self.samples += 1;
    }
}

fn ema(previous: f64, sample: f64) -> f64 {
    TELEMETRY_ALPHA * sample + (1.0 - TELEMETRY_ALPHA) * previous
}

/// Weighted routing score: latency 0.30 / slippage 0.30 / fill-quality 0.20
/// / volume 0.10 / spread 0.10 for limit orders. Market orders care less
/// about posted spread and more about certainty of fill, so fill-quality
/// and latency are weighted up at spread's expense.
fn score(telemetry: &ExchangeTelemetry, order_type: OrderType, max_latency_ms: f64, max_slippage_bps: f64) -> f64 {
    let latency_score = (1.0 - (telemetry.latency_ms / max_latency_ms).min(1.0)) * 100.0;
    let slippage_score = (1.0 - (telemetry.slippage_bps / max_slippage_bps).min(1.0)) * 100.0;
    let fill_quality_score = telemetry.fill_quality.clamp(0.0, 1.0) * 100.0;
    let volume_score = (telemetry.volume / 10_000_000.0).min(1.0) * 100.0;
    let spread_score = (1.0 - (telemetry.spread_bps / SPREAD_THRESHOLD_BPS).min(1.0)).max(0.0) * 100.0;

    let (w_latency, w_slippage, w_fill, w_volume, w_spread) = match order_type {
        OrderType::Limit => (0.30, 0.30, 0.20, 0.10, 0.10),
        OrderType::Market => (0.35, 0.20, 0.30, 0.10, 0.05),
    };

    latency_score * w_latency
        + slippage_score * w_slippage
        + fill_quality_score * w_fill
        + volume_score * w_volume
        + spread_score * w_spread
}

pub struct OrderRouter {
    clients: HashMap<ExchangeId, Arc<dyn ExchangeClient>>,
    telemetry: HashMap<ExchangeId, RwLock<ExchangeTelemetry>>,
    min_routing_confidence: f64,
    max_latency_ms: f64,
    max_slippage_bps: f64,
}

impl OrderRouter {
    pub fn new(min_routing_confidence: f64) -> Self {
        Self::with_thresholds(min_routing_confidence, 1000.0, 50.0)
    }

    pub fn with_thresholds(min_routing_confidence: f64, max_latency_ms: f64, max_slippage_bps: f64) -> Self {
        Self {
            clients: HashMap::new(),
            telemetry: HashMap::new(),
            min_routing_confidence,
            max_latency_ms,
            max_slippage_bps,
        }
    }

    pub fn register(&mut self, client: Arc<dyn ExchangeClient>) {
        let id = client.id();
        self.telemetry.entry(id).or_insert_with(|| RwLock::new(ExchangeTelemetry::default()));
        self.clients.insert(id, client);
    }

    /// Pick the highest-scoring exchange registered for `symbol`, rejecting
    /// any whose normalized score (0-100 scale, divided by 100) falls below
    /// the configured minimum routing confidence. Ties are broken
    /// lexicographically by exchange id.
    pub fn choose_exchange(&self, symbol: &str, order_type: OrderType) -> EngineResult<ExchangeId> {
        self.telemetry
            .iter()
            .filter(|(id, _)| self.clients.get(id).map(|c| c.supports(symbol)).unwrap_or(false))
            .map(|(id, t)| (*id, score(&t.read(), order_type, self.max_latency_ms, self.max_slippage_bps)))
            .max_by(|a, b| {
                a.1.partial_cmp(&b.1)
                    .unwrap()
                    .then_with(|| b.0.as_str().cmp(a.0.as_str()))
            })
            .filter(|(_, s)| s / 100.0 >= self.min_routing_confidence)
            .map(|(id, _)| id)
            .ok_or(EngineError::NoEligibleExchange)
    }

    pub async fn place_order(&self, exchange: ExchangeId, order: &OrderRequest) -> EngineResult<OrderAck> {
        let client = self
            .clients
            .get(&exchange)
            .ok_or(EngineError::NoEligibleExchange)?;

        let started = std::time::Instant::now();
        let result = client.place_order(order).await;
        let latency_ms = started.elapsed().as_secs_f64() * 1000.0;

        match result {
            Ok(ack) => {
                let slippage_bps = match (order.price, ack.avg_fill_price) {
                    (Some(requested), filled) if requested > 0.0 && filled > 0.0 => {
                        ((filled - requested).abs() / requested) * 10_000.0
                    }
                    _ => 0.0,
                };
                let fill_quality = if ack.state == OrderState::Filled { 1.0 } else { 0.5 };
                if let Some(telemetry) = self.telemetry.get(&exchange) {
                    telemetry
                        .write()
                        .update(latency_ms, slippage_bps, fill_quality, ack.filled_quantity * ack.avg_fill_price, 0.0);
                }
                Ok(ack)
            }
            Err(e) => {
                if let Some(telemetry) = self.telemetry.get(&exchange) {
                    telemetry.write().update(latency_ms, 50.0, 0.0, 0.0, 0.0);
                }
                Err(EngineError::InvalidOrder(e.to_string()))
            }
        }
    }

    pub fn telemetry_snapshot(&self) -> HashMap<ExchangeId, ExchangeTelemetry> {
        self.telemetry.iter().map(|(id, t)| (*id, *t.read())).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct StubClient {
        id: ExchangeId,
    }

    #[async_trait]
    impl ExchangeClient for StubClient {
        fn id(&self) -> ExchangeId {
            self.id
        }

        async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
            Ok(OrderAck {
                exchange_order_id: "1".to_string(),
                state: OrderState::Filled,
                filled_quantity: order.quantity,
                avg_fill_price: order.price.unwrap_or(100.0),
                raw: serde_json::json!({}),
            })
        }
    }

    const STUB_A: ExchangeId = ExchangeId::new("stub_a");
    const STUB_B: ExchangeId = ExchangeId::new("stub_b");

    #[test]
    fn choose_exchange_fails_with_no_registrations() {
        let router = OrderRouter::new(0.5);
        assert!(router.choose_exchange("BTCUSDT", OrderType::Limit).is_err());
    }

    #[tokio::test]
    async fn order_placement_updates_telemetry() {
        let mut router = OrderRouter::new(0.0);
        router.register(Arc::new(StubClient { id: STUB_A }));

        let order = OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: "buy".to_string(),
            order_type: OrderType::Limit,
            quantity: 1.0,
            price: Some(100.0),
        };
        router.place_order(STUB_A, &order).await.unwrap();

        let telemetry = router.telemetry_snapshot();
        assert_eq!(telemetry[&STUB_A].samples, 1);
    }

    #[test]
    fn higher_fill_quality_scores_higher() {
        let mut good = ExchangeTelemetry::default();
        good.update(50.0, 1.0, 1.0, 500_000.0, 2.0);
        let mut bad = ExchangeTelemetry::default();
        bad.update(500.0, 40.0, 0.3, 0.0, 40.0);

        assert!(score(&good, OrderType::Limit, 1000.0, 50.0) > score(&bad, OrderType::Limit, 1000.0, 50.0));
    }

    #[test]
    fn min_routing_confidence_rejects_weak_venues() {
        let mut router = OrderRouter::new(0.99);
        router.register(Arc::new(StubClient { id: STUB_B }));
        assert!(router.choose_exchange("BTCUSDT", OrderType::Limit).is_err());
    }

    #[test]
    fn ties_break_lexicographically_by_id() {
        let mut router = OrderRouter::new(0.0);
        router.register(Arc::new(StubClient { id: STUB_B }));
        router.register(Arc::new(StubClient { id: STUB_A }));
        // Both venues start at the default telemetry, so their scores tie;
        // "stub_a" must win over "stub_b".
        assert_eq!(router.choose_exchange("BTCUSDT", OrderType::Limit).unwrap(), STUB_A);
    }

    #[test]
    fn symbol_without_supporting_venue_is_rejected() {
        struct RestrictedClient;
        #[async_trait]
        impl ExchangeClient for RestrictedClient {
            fn id(&self) -> ExchangeId {
                STUB_A
            }
            fn supports(&self, symbol: &str) -> bool {
                symbol == "ETHUSDT"
            }
            async fn place_order(&self, order: &OrderRequest) -> Result<OrderAck> {
                Ok(OrderAck {
                    exchange_order_id: "1".to_string(),
                    state: OrderState::Filled,
                    filled_quantity: order.quantity,
                    avg_fill_price: order.price.unwrap_or(100.0),
                    raw: serde_json::json!({}),
                })
            }
        }

        let mut router = OrderRouter::new(0.0);
        router.register(Arc::new(RestrictedClient));
        assert!(router.choose_exchange("BTCUSDT", OrderType::Limit).is_err());
        assert!(router.choose_exchange("ETHUSDT", OrderType::Limit).is_ok());
    }
}
