// =============================================================================
// Aurora Spot Nexus — Main Entry Point
// =============================================================================
//
// The engine starts in Demo + Paused mode for safety. Users must explicitly
// switch to Live mode through the runtime configuration.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod app_state;
mod binance;
mod cache;
mod errors;
mod event_bus;
mod exchange_client;
mod execution;
mod exit_plan;
mod indicator_engine;
mod indicators;
mod market_data;
mod orchestrator;
mod position_engine;
mod reconcile;
mod regime;
mod risk;
mod runtime_config;
mod types;

use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::app_state::AppState;
use crate::execution::ExecutionEngine;
use crate::indicator_engine::Signal;
use crate::runtime_config::RuntimeConfig;
use crate::types::AccountMode;

/// ATR multiples for the exit ladder synthesized from each composite signal.
/// Matches the donor's stop-loss / TP1 / TP2 spacing.
const SL_ATR_MULTIPLIER: f64 = 1.5;
const TP1_ATR_MULTIPLIER: f64 = 2.5;
const TP2_ATR_MULTIPLIER: f64 = 4.0;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("╔══════════════════════════════════════════════════════════╗");
    info!("║        Aurora Spot Nexus — Starting Up                  ║");
    info!("╚══════════════════════════════════════════════════════════╝");

    let mut config = RuntimeConfig::load("runtime_config.json").unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RuntimeConfig::default()
    });

    // SAFETY: Force Demo + Paused on startup.
    config.trading_mode = types::TradingMode::Paused;
    config.account_mode = AccountMode::Demo;

    // Override symbols from env if available.
    if let Ok(syms) = std::env::var("AURORA_SYMBOLS") {
        config.symbols = syms
            .split(',')
            .map(|s| s.trim().to_uppercase())
            .filter(|s| !s.is_empty())
            .collect();
    }
    if config.symbols.is_empty() {
        config.symbols = vec![
            "BTCUSDT".into(),
            "ETHUSDT".into(),
            "BNBUSDT".into(),
            "XRPUSDT".into(),
            "SOLUSDT".into(),
        ];
    }

    info!(symbols = ?config.symbols, "Configured trading pairs");
    info!(
        trading_mode = %config.trading_mode,
        account_mode = %config.account_mode,
        "Engine starting in SAFE mode (Demo + Paused)"
    );

    // ── 2. Build shared state ────────────────────────────────────────────
    let state = Arc::new(AppState::new(config));

    // ── 3. Build Binance client ──────────────────────────────────────────
    let api_key = std::env::var("BINANCE_API_KEY").unwrap_or_default();
    let api_secret = std::env::var("BINANCE_API_SECRET").unwrap_or_default();
    let binance_client = Arc::new(binance::client::BinanceClient::new(api_key, api_secret));

    // ── 4. Spawn market data streams ─────────────────────────────────────
    let symbols = state.runtime_config.read().symbols.clone();

    // ── 3b. Data orchestrator ─────────────────────────────────────────────
    let (orchestrator_tuning, update_interval_ms) = {
        let cfg = state.runtime_config.read();
        (
            crate::orchestrator::OrchestratorTuning {
                weight_max_per_window: cfg.weight_max_per_window,
                weight_window_ms: cfg.weight_window_ms,
                circuit_failure_threshold: cfg.circuit_failure_threshold,
                circuit_open_duration_ms: cfg.circuit_open_duration_ms,
                klines_limit: cfg.klines_limit,
                batch_size: cfg.batch_size,
                cache_duration_ms: cfg.cache_duration_ms,
            },
            cfg.update_interval_ms,
        )
    };
    let orchestrator = crate::orchestrator::DataOrchestrator::with_tuning(
        binance_client.clone(),
        state.cache.clone(),
        state.indicator_engine.clone(),
        state.risk_engine.clone(),
        state.regime_detector.clone(),
        state.candle_buffer.clone(),
        state.event_bus.clone(),
        orchestrator_tuning,
    );
    orchestrator.start_continuous(symbols.clone(), tokio::time::Duration::from_millis(update_interval_ms));

    for symbol in &symbols {
        // Kline 1m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "1m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 1m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Kline 5m stream
        let cb = state.candle_buffer.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) =
                    market_data::candle_buffer::run_kline_stream(&sym, "5m", &cb).await
                {
                    error!(symbol = %sym, error = %e, "Kline 5m stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });

        // Trade stream
        {
            let procs = state.trade_processors.read();
            if let Some(tp) = procs.get(symbol) {
                let processor = tp.clone();
                let sym = symbol.clone();
                tokio::spawn(async move {
                    loop {
                        if let Err(e) =
                            market_data::trade_stream::run_trade_stream(&sym, &processor).await
                        {
                            error!(symbol = %sym, error = %e, "Trade stream error — reconnecting in 5s");
                        }
                        tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
                    }
                });
            }
        }

        // Orderbook stream
        let ob = state.orderbook_manager.clone();
        let sym = symbol.clone();
        tokio::spawn(async move {
            loop {
                if let Err(e) = market_data::orderbook::run_depth_stream(&sym, &ob).await {
                    error!(symbol = %sym, error = %e, "Depth stream error — reconnecting in 5s");
                }
                tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
            }
        });
    }

    info!(count = symbols.len(), "Market data streams launched");

    // ── 6. Execution engine ──────────────────────────────────────────────
    let exit_plans = Arc::new(crate::exit_plan::ExitPlanManager::new());

    let (min_routing_confidence, max_latency_threshold_ms, max_slippage_threshold_bps) = {
        let cfg = state.runtime_config.read();
        (cfg.min_routing_confidence, cfg.max_latency_threshold_ms, cfg.max_slippage_threshold_bps)
    };
    let mut order_router = crate::exchange_client::OrderRouter::with_thresholds(
        min_routing_confidence,
        max_latency_threshold_ms,
        max_slippage_threshold_bps,
    );
    order_router.register(Arc::new(crate::exchange_client::BinanceExchangeClient::new(
        binance_client.clone(),
    )));
    let order_router = Arc::new(order_router);

    let exec_engine = Arc::new(
        ExecutionEngine::new(
            order_router,
            state.position_manager.clone(),
            state.risk_engine.clone(),
            exit_plans.clone(),
        )
        .with_event_bus(state.event_bus.clone()),
    );

    // ── 7. Composite-signal loop (every 5 seconds) ───────────────────────
    // Pulls the indicator engine's ranked composite signals directly and
    // drives them through risk sizing and execution — no intermediate
    // strategy layer.
    let sig_state = state.clone();
    let sig_exec = exec_engine.clone();
    tokio::spawn(async move {
        // Wait for initial data
        tokio::time::sleep(tokio::time::Duration::from_secs(30)).await;
        info!("Composite signal loop starting");

        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;

            let (syms, is_demo, min_confidence) = {
                let cfg = sig_state.runtime_config.read();
                (cfg.symbols.clone(), cfg.account_mode == AccountMode::Demo, cfg.min_routing_confidence)
            };

            let ranked = sig_state.indicator_engine.top(syms.len(), min_confidence);

            for (symbol, suite) in ranked {
                let side = match suite.signal {
                    Signal::Bullish => "buy",
                    Signal::Bearish => "sell",
                    Signal::Neutral => continue,
                };

                let (price, reference_volume) = {
                    let procs = sig_state.trade_processors.read();
                    match procs.get(&symbol) {
                        Some(tp) => (tp.last_price(), tp.cvd().abs()),
                        None => continue,
                    }
                };
                if price <= 0.0 {
                    continue;
                }

                let quantity = sig_state.risk_engine.recommended_size(&symbol, price, suite.confidence);
                if quantity <= 0.0 {
                    continue;
                }

                let atr = suite.atr;
                let (stop_loss, take_profit_1, take_profit_2) = if side == "buy" {
                    (
                        price - atr * SL_ATR_MULTIPLIER,
                        price + atr * TP1_ATR_MULTIPLIER,
                        price + atr * TP2_ATR_MULTIPLIER,
                    )
                } else {
                    (
                        price + atr * SL_ATR_MULTIPLIER,
                        price - atr * TP1_ATR_MULTIPLIER,
                        price - atr * TP2_ATR_MULTIPLIER,
                    )
                };

                let result = sig_exec
                    .execute_proposal(
                        &symbol,
                        side,
                        price,
                        quantity,
                        stop_loss,
                        take_profit_1,
                        take_profit_2,
                        reference_volume,
                        is_demo,
                    )
                    .await;
                info!(symbol = %symbol, side, result = %result, "trade execution result");
            }
        }
    });

    // ── 8. Exit monitor loop — drives price ticks into the risk engine and
    //        the exit-plan ladder, closing positions whose ladder fires ──
    let exit_state = state.clone();
    let exit_exec = exec_engine.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(5));
        loop {
            interval.tick().await;
            let open_positions = exit_state.position_manager.get_open_positions();
            for pos in &open_positions {
                let price = {
                    let procs = exit_state.trade_processors.read();
                    procs.get(&pos.symbol).map(|tp| tp.last_price()).unwrap_or(0.0)
                };
                if price <= 0.0 {
                    continue;
                }

                exit_state.risk_engine.on_price(&pos.symbol, price);

                if let Some(action) = exit_exec.exit_plans.on_price(&pos.symbol, price) {
                    let close_side = match pos.side {
                        crate::position_engine::PositionSide::Long => "sell",
                        crate::position_engine::PositionSide::Short => "buy",
                    };
                    let close_qty = pos.size * action.close_fraction;
                    exit_state.risk_engine.on_fill(&pos.symbol, close_side, close_qty, action.price);

                    if action.close_fraction >= 1.0 {
                        exit_exec.exit_plans.clear(&pos.symbol);
                    }

                    info!(
                        symbol = %pos.symbol,
                        reason = ?action.reason,
                        close_fraction = action.close_fraction,
                        "exit plan action applied"
                    );
                }
            }
        }
    });

    // ── 9. Reconciliation loop ───────────────────────────────────────────
    let recon_state = state.clone();
    let recon_client = binance_client.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(60));
        loop {
            interval.tick().await;

            if recon_state.runtime_config.read().account_mode == AccountMode::Demo {
                continue;
            }

            match recon_client.get_account().await {
                Ok(account_info) => {
                    if let Some(balances) =
                        account_info.get("balances").and_then(|v| v.as_array())
                    {
                        let mut new_balances = Vec::new();
                        for b in balances {
                            let asset =
                                b.get("asset").and_then(|v| v.as_str()).unwrap_or("");
                            let free: f64 = b
                                .get("free")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0.0);
                            let locked: f64 = b
                                .get("locked")
                                .and_then(|v| v.as_str())
                                .and_then(|s| s.parse().ok())
                                .unwrap_or(0.0);
                            if free > 0.0 || locked > 0.0 {
                                new_balances.push(types::BalanceInfo {
                                    asset: asset.to_string(),
                                    free,
                                    locked,
                                });
                            }
                        }
                        *recon_state.balances.write() = new_balances;
                        *recon_state.last_reconcile_ok.write() =
                            Some(std::time::Instant::now());
                        *recon_state.last_reconcile_error.write() = None;
                        recon_state.increment_version();
                    }
                }
                Err(e) => {
                    *recon_state.last_reconcile_error.write() = Some(format!("{e}"));
                    warn!(error = %e, "reconciliation failed");
                }
            }
        }
    });

    // ── 10. Regime detection loop ────────────────────────────────────────
    let regime_state = state.clone();
    tokio::spawn(async move {
        tokio::time::sleep(tokio::time::Duration::from_secs(60)).await;
        let mut interval = tokio::time::interval(tokio::time::Duration::from_secs(30));
        loop {
            interval.tick().await;
            let syms = regime_state.runtime_config.read().symbols.clone();
            if let Some(symbol) = syms.first() {
                let key = market_data::CandleKey {
                    symbol: symbol.clone(),
                    interval: "5m".to_string(),
                };
                let candles = regime_state.candle_buffer.get_closed_candles(&key, 100);
                if candles.len() >= 50 {
                    regime_state.regime_detector.write().update(&candles);
                    regime_state.increment_version();
                }
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 11. Graceful shutdown ────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    if let Err(e) = state.runtime_config.read().save("runtime_config.json") {
        error!(error = %e, "Failed to save runtime config on shutdown");
    }

    info!("Aurora Spot Nexus shut down complete.");
    Ok(())
}
