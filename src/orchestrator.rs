// =============================================================================
// Data Orchestrator — drives one processing cycle over a symbol universe
// =============================================================================
//
// Each cycle: detect regime -> route symbols by priority -> fetch (cache then
// live) -> enrich with historical candles -> filter by regime criteria ->
// compute indicators -> validate against risk -> write through the cache ->
// publish. `start_flow` refuses to overlap itself (single-flight via
// `AtomicBool::compare_exchange`) and refuses outright while the
// orchestrator's own circuit breaker is open — a cycle-failure breaker,
// independent of the risk engine's trading circuit breaker.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use futures_util::stream::{self, StreamExt};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::binance::client::BinanceClient;
use crate::cache::{CacheKey, MultiTierCache};
use crate::event_bus::{EventBus, EventKind};
use crate::indicator_engine::IndicatorEngine;
use crate::market_data::{CandleBuffer, CandleKey};
use crate::regime::{MarketRegime, RegimeDetector, RegimeState};
use crate::risk::RiskEngine;
use crate::types::{DataQuality, DataSource, MarketDataPoint, Timeframe};

const HISTORICAL_BATCH_CONCURRENCY: usize = 10;
const WEIGHT_SAFETY_MARGIN: u32 = 50;

// ---------------------------------------------------------------------------
// API weight budget
// ---------------------------------------------------------------------------

/// Process-wide request-weight meter generalized from the donor's
/// `RateLimitTracker`: instead of reading a response header, callers debit a
/// known weight up front and wait on a `Notify` if the window is nearly
/// exhausted.
pub struct WeightBudget {
    used: AtomicU32,
    capacity: u32,
    notify: Notify,
}

impl WeightBudget {
    pub fn new(capacity: u32) -> Arc<Self> {
        Arc::new(Self {
            used: AtomicU32::new(0),
            capacity,
            notify: Notify::new(),
        })
    }

    /// Spawn the periodic reset task for this budget's window.
    pub fn spawn_reset_task(self: &Arc<Self>, window: Duration) {
        let budget = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(window);
            loop {
                interval.tick().await;
                budget.used.store(0, Ordering::Relaxed);
                budget.notify.notify_waiters();
            }
        });
    }

    /// Debit `weight` from the budget, awaiting a window reset if the
    /// remaining capacity (minus the safety margin) can't cover it.
    pub async fn acquire(&self, weight: u32) {
        loop {
            let current = self.used.load(Ordering::Relaxed);
            if current + weight + WEIGHT_SAFETY_MARGIN <= self.capacity {
                if self
                    .used
                    .compare_exchange(current, current + weight, Ordering::Relaxed, Ordering::Relaxed)
                    .is_ok()
                {
                    return;
                }
                continue;
            }
            self.notify.notified().await;
        }
    }

    pub fn remaining(&self) -> u32 {
        self.capacity.saturating_sub(self.used.load(Ordering::Relaxed))
    }
}

// ---------------------------------------------------------------------------
// Circuit breaker (cycle-failure breaker, distinct from the risk engine's)
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct CycleBreaker {
    state: RwLock<BreakerState>,
    consecutive_failures: AtomicU32,
    opened_at: RwLock<Option<Instant>>,
    failure_threshold: u32,
    open_duration: Duration,
}

impl CycleBreaker {
    fn new(failure_threshold: u32, open_duration: Duration) -> Self {
        Self {
            state: RwLock::new(BreakerState::Closed),
            consecutive_failures: AtomicU32::new(0),
            opened_at: RwLock::new(None),
            failure_threshold,
            open_duration,
        }
    }

    /// Whether a cycle may attempt to run. Side-effects the `open ->
    /// half_open` transition once `open_duration` has elapsed.
    fn can_attempt(&self) -> bool {
        let current = *self.state.read();
        match current {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                let opened_at = *self.opened_at.read();
                let elapsed = opened_at.map(|t| t.elapsed()).unwrap_or_default();
                if elapsed >= self.open_duration {
                    *self.state.write() = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&self) {
        self.consecutive_failures.store(0, Ordering::Relaxed);
        *self.state.write() = BreakerState::Closed;
    }

    fn record_failure(&self) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        let was_half_open = *self.state.read() == BreakerState::HalfOpen;
        if was_half_open || failures >= self.failure_threshold {
            *self.state.write() = BreakerState::Open;
            *self.opened_at.write() = Some(Instant::now());
        }
    }

    fn state(&self) -> BreakerState {
        *self.state.read()
    }
}

// ---------------------------------------------------------------------------
// Cycle outcome / metrics
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub enum CycleStatus {
    Completed { symbols_processed: usize, duration_ms: u64 },
    SkippedOverlap,
    SkippedBreakerOpen,
    Failed { reason: String },
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OrchestratorMetrics {
    pub cycles_completed: u64,
    pub cycles_failed: u64,
    pub last_cycle_duration_ms: u64,
    pub breaker_state: Option<BreakerState>,
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

pub struct DataOrchestrator {
    client: Arc<BinanceClient>,
    cache: Arc<MultiTierCache>,
    indicator_engine: Arc<IndicatorEngine>,
    risk_engine: Arc<RiskEngine>,
    regime_detector: Arc<RwLock<RegimeDetector>>,
    candle_buffer: Arc<CandleBuffer>,
    event_bus: Arc<EventBus>,
    weight_budget: Arc<WeightBudget>,
    breaker: CycleBreaker,
    running: AtomicBool,
    continuous_cancel: RwLock<Option<Arc<AtomicBool>>>,
    market_data: RwLock<HashMap<String, MarketDataPoint>>,
    cycles_completed: AtomicU32,
    cycles_failed: AtomicU32,
    last_cycle_duration_ms: AtomicU32,
    klines_limit: usize,
    batch_size: usize,
    cache_duration_ms: i64,
}

/// Tunables the orchestrator needs at construction time. Mirrors the
/// relevant subset of the process-wide runtime configuration.
#[derive(Debug, Clone, Copy)]
pub struct OrchestratorTuning {
    pub weight_max_per_window: u32,
    pub weight_window_ms: u64,
    pub circuit_failure_threshold: u32,
    pub circuit_open_duration_ms: u64,
    pub klines_limit: usize,
    pub batch_size: usize,
    pub cache_duration_ms: i64,
}

impl Default for OrchestratorTuning {
    fn default() -> Self {
        Self {
            weight_max_per_window: 6000,
            weight_window_ms: 60_000,
            circuit_failure_threshold: 5,
            circuit_open_duration_ms: 60_000,
            klines_limit: 100,
            batch_size: 10,
            cache_duration_ms: 300_000,
        }
    }
}

impl DataOrchestrator {
    pub fn new(
        client: Arc<BinanceClient>,
        cache: Arc<MultiTierCache>,
        indicator_engine: Arc<IndicatorEngine>,
        risk_engine: Arc<RiskEngine>,
        regime_detector: Arc<RwLock<RegimeDetector>>,
        candle_buffer: Arc<CandleBuffer>,
        event_bus: Arc<EventBus>,
    ) -> Arc<Self> {
        Self::with_tuning(
            client,
            cache,
            indicator_engine,
            risk_engine,
            regime_detector,
            candle_buffer,
            event_bus,
            OrchestratorTuning::default(),
        )
    }

    pub fn with_tuning(
        client: Arc<BinanceClient>,
        cache: Arc<MultiTierCache>,
        indicator_engine: Arc<IndicatorEngine>,
        risk_engine: Arc<RiskEngine>,
        regime_detector: Arc<RwLock<RegimeDetector>>,
        candle_buffer: Arc<CandleBuffer>,
        event_bus: Arc<EventBus>,
        tuning: OrchestratorTuning,
    ) -> Arc<Self> {
        let weight_budget = WeightBudget::new(tuning.weight_max_per_window);
        weight_budget.spawn_reset_task(Duration::from_millis(tuning.weight_window_ms));

        Arc::new(Self {
            client,
            cache,
            indicator_engine,
            risk_engine,
            regime_detector,
            candle_buffer,
            event_bus,
            weight_budget,
            breaker: CycleBreaker::new(
                tuning.circuit_failure_threshold,
                Duration::from_millis(tuning.circuit_open_duration_ms),
            ),
            running: AtomicBool::new(false),
            continuous_cancel: RwLock::new(None),
            market_data: RwLock::new(HashMap::new()),
            cycles_completed: AtomicU32::new(0),
            cycles_failed: AtomicU32::new(0),
            last_cycle_duration_ms: AtomicU32::new(0),
            klines_limit: tuning.klines_limit,
            batch_size: tuning.batch_size,
            cache_duration_ms: tuning.cache_duration_ms,
        })
    }

    /// Run one processing cycle. Refuses to overlap itself and refuses while
    /// the breaker is open.
    pub async fn start_flow(self: &Arc<Self>, symbols: &[String]) -> CycleStatus {
        if !self.breaker.can_attempt() {
            return CycleStatus::SkippedBreakerOpen;
        }
        if self
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return CycleStatus::SkippedOverlap;
        }

        let started = Instant::now();
        let outcome = self.run_cycle(symbols).await;
        self.running.store(false, Ordering::SeqCst);

        let duration_ms = started.elapsed().as_millis() as u32;
        self.last_cycle_duration_ms.store(duration_ms, Ordering::Relaxed);

        match outcome {
            Ok(processed) => {
                self.breaker.record_success();
                self.cycles_completed.fetch_add(1, Ordering::Relaxed);
                self.event_bus.publish(
                    EventKind::SystemHealthUpdate,
                    serde_json::json!({ "symbols_processed": processed, "duration_ms": duration_ms }),
                );
                CycleStatus::Completed { symbols_processed: processed, duration_ms: duration_ms as u64 }
            }
            Err(reason) => {
                self.breaker.record_failure();
                self.cycles_failed.fetch_add(1, Ordering::Relaxed);
                warn!(error = %reason, "orchestrator cycle failed");
                CycleStatus::Failed { reason }
            }
        }
    }

    /// Schedule `start_flow` on a fixed interval until `stop_continuous` is
    /// called. The cancellation flag is only checked between ticks, so an
    /// in-progress cycle always runs to completion.
    pub fn start_continuous(self: &Arc<Self>, symbols: Vec<String>, interval: Duration) {
        let cancel = Arc::new(AtomicBool::new(false));
        *self.continuous_cancel.write() = Some(Arc::clone(&cancel));

        let orchestrator = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                if cancel.load(Ordering::Relaxed) {
                    break;
                }
                let status = orchestrator.start_flow(&symbols).await;
                debug!(?status, "continuous orchestrator cycle finished");
            }
        });
    }

    pub fn stop_continuous(&self) {
        if let Some(cancel) = self.continuous_cancel.read().as_ref() {
            cancel.store(true, Ordering::Relaxed);
        }
    }

    pub fn get_market_data(&self, symbols: Option<&[String]>) -> Vec<MarketDataPoint> {
        let data = self.market_data.read();
        match symbols {
            Some(syms) => syms.iter().filter_map(|s| data.get(s).cloned()).collect(),
            None => data.values().cloned().collect(),
        }
    }

    pub fn get_symbol_data(&self, symbol: &str) -> Option<MarketDataPoint> {
        self.market_data.read().get(symbol).cloned()
    }

    pub fn get_regime(&self) -> Option<RegimeState> {
        self.regime_detector.read().current_regime()
    }

    pub fn get_metrics(&self) -> OrchestratorMetrics {
        OrchestratorMetrics {
            cycles_completed: self.cycles_completed.load(Ordering::Relaxed) as u64,
            cycles_failed: self.cycles_failed.load(Ordering::Relaxed) as u64,
            last_cycle_duration_ms: self.last_cycle_duration_ms.load(Ordering::Relaxed) as u64,
            breaker_state: Some(self.breaker.state()),
        }
    }

    // -----------------------------------------------------------------
    // Processing cycle
    // -----------------------------------------------------------------

    async fn run_cycle(&self, symbols: &[String]) -> Result<usize, String> {
        if symbols.is_empty() {
            return Ok(0);
        }

        // 1. Regime detection, sampled off the first symbol's 5-minute buffer.
        let regime_state = {
            let key = CandleKey { symbol: symbols[0].clone(), interval: "5m".to_string() };
            let candles = self.candle_buffer.get_closed_candles(&key, 100);
            let closes = self.candle_buffer.get_closes(&key, 100);
            if candles.len() >= 20 {
                self.regime_detector.read().detect(&candles, &closes)
            } else {
                self.regime_detector.read().current_regime()
            }
        };
        let regime = regime_state.as_ref().map(|r| r.regime).unwrap_or(MarketRegime::Ranging);

        if let Some(rs) = &regime_state {
            self.event_bus.publish(
                EventKind::MarketRegimeUpdate,
                serde_json::json!({ "regime": rs.regime.to_string(), "confidence": rs.confidence }),
            );
        }

        // 2. Priority routing.
        let (high_priority, normal) = self.route_by_priority(symbols, regime);
        let ordered: Vec<String> = high_priority.into_iter().chain(normal).collect();

        // 3. Parallel fetch (cache, else live, weight-budgeted).
        let fetched = self.fetch_all(&ordered).await?;

        // 4. Historical enrichment in bounded-concurrency batches.
        self.enrich_historical(&ordered).await;

        // 5. Regime-aware filtering.
        let retained: Vec<String> = fetched
            .into_iter()
            .filter(|(symbol, point)| self.passes_regime_filter(symbol, point, regime))
            .map(|(symbol, _)| symbol)
            .collect();

        // 6. Parallel indicator computation.
        for symbol in &retained {
            let key = CandleKey { symbol: symbol.clone(), interval: "5m".to_string() };
            let candles = self.candle_buffer.get_closed_candles(&key, 200);
            if !candles.is_empty() {
                let _ = self.indicator_engine.enqueue(symbol.clone(), candles);
            }
        }
        self.indicator_engine.drain_batch(retained.len().max(1).min(self.batch_size.max(1))).await.ok();

        // 7. Risk validation + 8. cache write-through + 9. publish.
        let mut processed = 0usize;
        for symbol in &retained {
            if self.risk_engine.is_breaker_open() {
                debug!(symbol, "skipped — trading circuit breaker open");
                continue;
            }

            let mut point = {
                let data = self.market_data.read();
                match data.get(symbol) {
                    Some(p) => p.clone(),
                    None => continue,
                }
            };
            point.indicators = self.indicator_engine.results(symbol);

            let assessment = self.risk_engine.assess(symbol, point.price);
            if assessment.level == crate::risk::RiskLevel::Critical {
                debug!(symbol, "dropped by risk validation — critical risk level");
                continue;
            }

            let key = CacheKey::new(symbol.clone(), Timeframe::M5);
            let value = serde_json::to_value(&point).map_err(|e| e.to_string())?;
            self.cache.put(key, value, Some(self.cache_duration_ms));

            self.market_data.write().insert(symbol.clone(), point.clone());
            self.event_bus.publish(EventKind::MarketDataUpdate, serde_json::to_value(&point).unwrap_or_default());
            processed += 1;
        }

        Ok(processed)
    }

    /// Partition symbols into (high_priority, normal) per the regime's
    /// routing rule.
    fn route_by_priority(&self, symbols: &[String], regime: MarketRegime) -> (Vec<String>, Vec<String>) {
        match regime {
            MarketRegime::Volatile => (symbols.to_vec(), Vec::new()),
            MarketRegime::Ranging => (Vec::new(), symbols.to_vec()),
            MarketRegime::Trending => self.split_top_fraction(symbols, 0.30, |s| self.momentum(s)),
            MarketRegime::Breakout => self.split_top_fraction(symbols, 0.50, |s| self.volume_delta(s)),
        }
    }

    fn split_top_fraction(
        &self,
        symbols: &[String],
        fraction: f64,
        score_fn: impl Fn(&str) -> f64,
    ) -> (Vec<String>, Vec<String>) {
        let mut scored: Vec<(String, f64)> = symbols.iter().map(|s| (s.clone(), score_fn(s))).collect();
        scored.sort_by(|a, b| b.1.partial_cmp(&a.1).unwrap_or(std::cmp::Ordering::Equal));
        let cut = ((scored.len() as f64) * fraction).ceil() as usize;
        let high: Vec<String> = scored.iter().take(cut).map(|(s, _)| s.clone()).collect();
        let normal: Vec<String> = scored.iter().skip(cut).map(|(s, _)| s.clone()).collect();
        (high, normal)
    }

    fn momentum(&self, symbol: &str) -> f64 {
        let key = CandleKey { symbol: symbol.to_string(), interval: "5m".to_string() };
        let closes = self.candle_buffer.get_closes(&key, 20);
        match (closes.first(), closes.last()) {
            (Some(first), Some(last)) if *first != 0.0 => (last - first) / first,
            _ => 0.0,
        }
    }

    fn volume_delta(&self, symbol: &str) -> f64 {
        let key = CandleKey { symbol: symbol.to_string(), interval: "5m".to_string() };
        let candles = self.candle_buffer.get_closed_candles(&key, 20);
        if candles.len() < 2 {
            return 0.0;
        }
        let mid = candles.len() / 2;
        let recent: f64 = candles[mid..].iter().map(|c| c.volume).sum();
        let prior: f64 = candles[..mid].iter().map(|c| c.volume).sum();
        recent - prior
    }

    /// Cache-first, live-fallback fetch for each symbol, weight-budgeted on
    /// the live path. Returns the assembled `MarketDataPoint` for each
    /// symbol that could be fetched.
    async fn fetch_all(&self, symbols: &[String]) -> Result<Vec<(String, MarketDataPoint)>, String> {
        let results = stream::iter(symbols.iter().cloned())
            .map(|symbol| self.fetch_one(symbol))
            .buffer_unordered(HISTORICAL_BATCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;

        let mut out = Vec::new();
        for result in results {
            if let Some((symbol, point)) = result {
                out.push((symbol, point));
            }
        }
        Ok(out)
    }

    async fn fetch_one(&self, symbol: String) -> Option<(String, MarketDataPoint)> {
        let cache_key = CacheKey::new(symbol.clone(), Timeframe::M5);
        if let Some(cached) = self.cache.get(&cache_key) {
            if let Ok(mut point) = serde_json::from_value::<MarketDataPoint>(cached) {
                point.source = DataSource::Cache;
                return Some((symbol, point));
            }
        }

        self.weight_budget.acquire(2).await;
        match self.client.get_klines(&symbol, "5m", 2).await {
            Ok(candles) => {
                let latest = candles.last()?;
                let change_pct = if candles.len() >= 2 {
                    let prev = candles[candles.len() - 2].close;
                    if prev != 0.0 { (latest.close - prev) / prev * 100.0 } else { 0.0 }
                } else {
                    0.0
                };
                let point = MarketDataPoint {
                    symbol: symbol.clone(),
                    timestamp_ms: latest.close_time,
                    price: latest.close,
                    volume: latest.volume,
                    change_24h_pct: change_pct,
                    indicators: None,
                    source: DataSource::Live,
                    quality: DataQuality::High,
                    confidence: 1.0,
                    data_age_ms: 0,
                };
                self.market_data.write().insert(symbol.clone(), point.clone());
                Some((symbol, point))
            }
            Err(e) => {
                warn!(symbol = %symbol, error = %e, "live fetch failed — skipping symbol this cycle");
                None
            }
        }
    }

    /// Fetch a deeper rolling window of candles per symbol so the indicator
    /// engine has enough history, in bounded-concurrency batches.
    async fn enrich_historical(&self, symbols: &[String]) {
        stream::iter(symbols.iter().cloned())
            .map(|symbol| async move {
                self.weight_budget.acquire(5).await;
                match self.client.get_klines(&symbol, "5m", self.klines_limit as u32).await {
                    Ok(candles) => {
                        let key = CandleKey { symbol: symbol.clone(), interval: "5m".to_string() };
                        for candle in candles {
                            self.candle_buffer.update(key.clone(), candle);
                        }
                    }
                    Err(e) => warn!(symbol = %symbol, error = %e, "historical enrichment fetch failed"),
                }
                if self.weight_budget.remaining() < WEIGHT_SAFETY_MARGIN * 2 {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                }
            })
            .buffer_unordered(HISTORICAL_BATCH_CONCURRENCY)
            .collect::<Vec<_>>()
            .await;
    }

    fn passes_regime_filter(&self, _symbol: &str, point: &MarketDataPoint, regime: MarketRegime) -> bool {
        match regime {
            MarketRegime::Trending => point.change_24h_pct.abs() > 2.0 && point.volume > 1_000_000.0,
            MarketRegime::Volatile => point.volume > 5_000_000.0 && point.change_24h_pct.abs() < 10.0,
            MarketRegime::Ranging => point.volume > 100_000.0,
            MarketRegime::Breakout => point.volume > 500_000.0,
        }
    }
}

impl std::fmt::Debug for DataOrchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataOrchestrator")
            .field("breaker_state", &self.breaker.state())
            .field("running", &self.running.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn breaker_opens_after_threshold_failures() {
        let breaker = CycleBreaker::new(5, Duration::from_secs(60));
        for _ in 0..5 {
            breaker.record_failure();
        }
        assert_eq!(breaker.state(), BreakerState::Open);
        assert!(!breaker.can_attempt());
    }

    #[test]
    fn breaker_closes_on_success() {
        let breaker = CycleBreaker::new(5, Duration::from_secs(60));
        breaker.record_failure();
        breaker.record_failure();
        breaker.record_success();
        assert_eq!(breaker.state(), BreakerState::Closed);
    }

    #[tokio::test]
    async fn weight_budget_serializes_acquisitions_within_capacity() {
        let budget = WeightBudget::new(100);
        budget.acquire(40).await;
        assert_eq!(budget.remaining(), 60);
        budget.acquire(10).await;
        assert_eq!(budget.remaining(), 50);
    }
}
