// =============================================================================
// Execution Engine — routes trade proposals through risk checks and the
// exchange client, with full demo-mode simulation support
// =============================================================================

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::event_bus::{EventBus, EventKind};
use crate::exchange_client::{OrderRequest, OrderRouter, OrderType};
use crate::exit_plan::ExitPlanManager;
use crate::position_engine::PositionManager;
use crate::risk::RiskEngine;

// ---------------------------------------------------------------------------
// Result type
// ---------------------------------------------------------------------------

/// Outcome of an execution attempt.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum ExecutionResult {
    /// Order was placed on the exchange (live mode).
    Placed(serde_json::Value),
    /// Order was simulated locally (demo mode).
    Simulated(String),
    /// Order was blocked by the risk engine.
    Blocked(String),
    /// An error occurred during execution.
    Error(String),
}

impl std::fmt::Display for ExecutionResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Placed(v) => write!(f, "Placed({})", v),
            Self::Simulated(msg) => write!(f, "Simulated({msg})"),
            Self::Blocked(reason) => write!(f, "Blocked({reason})"),
            Self::Error(err) => write!(f, "Error({err})"),
        }
    }
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

/// The execution engine ties together the order router, position manager,
/// and risk engine to execute (or simulate) trade proposals.
pub struct ExecutionEngine {
    pub router: Arc<OrderRouter>,
    pub position_manager: Arc<PositionManager>,
    pub risk_engine: Arc<RiskEngine>,
    pub exit_plans: Arc<ExitPlanManager>,
    pub event_bus: Option<Arc<EventBus>>,
}

impl ExecutionEngine {
    /// Create a new execution engine.
    pub fn new(
        router: Arc<OrderRouter>,
        position_manager: Arc<PositionManager>,
        risk_engine: Arc<RiskEngine>,
        exit_plans: Arc<ExitPlanManager>,
    ) -> Self {
        Self {
            router,
            position_manager,
            risk_engine,
            exit_plans,
            event_bus: None,
        }
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = Some(event_bus);
        self
    }

    /// Execute a trade proposal.
    ///
    /// In **demo mode** the order is simulated locally: no request reaches
    /// Binance, and a synthetic fill is created.
    ///
    /// In **live mode** the risk engine is consulted first; if all circuit
    /// breakers are clear the order is forwarded to Binance via the REST
    /// client.
    ///
    /// Regardless of mode, a new position is opened in the position manager
    /// upon successful (or simulated) fill.
    pub async fn execute_proposal(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
        reference_volume: f64,
        is_demo: bool,
    ) -> ExecutionResult {
        info!(
            symbol,
            side,
            price,
            quantity,
            stop_loss,
            take_profit_1,
            take_profit_2,
            is_demo,
            "execution proposal received"
        );

        // -----------------------------------------------------------------
        // Risk pre-check (applies to both demo and live)
        // -----------------------------------------------------------------
        if let Err(reason) = self.risk_engine.can_open(symbol, quantity, price, reference_volume) {
            warn!(symbol, side, reason = %reason, "execution blocked by risk engine");
            return ExecutionResult::Blocked(reason.to_string());
        }

        if is_demo {
            return self.execute_demo(symbol, side, price, quantity, stop_loss, take_profit_1, take_profit_2);
        }

        self.execute_live(symbol, side, price, quantity, stop_loss, take_profit_1, take_profit_2).await
    }

    // -------------------------------------------------------------------------
    // Demo execution
    // -------------------------------------------------------------------------

    fn execute_demo(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
    ) -> ExecutionResult {
        let sim_order_id = Uuid::new_v4().to_string();

        self.open_position(symbol, side, price, quantity, stop_loss, take_profit_1, take_profit_2);
        self.publish_fill_events(symbol, side, price, quantity, &sim_order_id);

        let msg = format!(
            "Demo fill: symbol={symbol} side={side} price={price} qty={quantity} \
             sim_order_id={sim_order_id}"
        );
        info!("{}", msg);
        ExecutionResult::Simulated(msg)
    }

    fn publish_fill_events(&self, symbol: &str, side: &str, price: f64, quantity: f64, order_id: &str) {
        let Some(bus) = &self.event_bus else { return };
        let payload = serde_json::json!({
            "symbol": symbol,
            "side": side,
            "price": price,
            "quantity": quantity,
            "order_id": order_id,
        });
        bus.publish(EventKind::OrderPlaced, payload.clone());
        bus.publish(EventKind::OrderFilled, payload);
    }

    /// Apply the fill to the risk engine's position book and arm the
    /// exit-plan ladder for this symbol.
    fn open_position(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
    ) {
        self.risk_engine.on_fill(symbol, side, quantity, price);
        let position_side = if side.eq_ignore_ascii_case("buy") {
            crate::position_engine::PositionSide::Long
        } else {
            crate::position_engine::PositionSide::Short
        };
        self.exit_plans
            .register(symbol, position_side, price, stop_loss, take_profit_1, take_profit_2);
    }

    // -------------------------------------------------------------------------
    // Live execution
    // -------------------------------------------------------------------------

    async fn execute_live(
        &self,
        symbol: &str,
        side: &str,
        price: f64,
        quantity: f64,
        stop_loss: f64,
        take_profit_1: f64,
        take_profit_2: f64,
    ) -> ExecutionResult {
        let exchange = match self.router.choose_exchange(symbol, OrderType::Limit) {
            Ok(id) => id,
            Err(e) => {
                warn!(symbol, side, error = %e, "no eligible exchange for live order");
                return ExecutionResult::Error(format!("routing failed: {e}"));
            }
        };

        debug!(symbol, side, price, quantity, exchange = %exchange, "sending live order");

        let order = OrderRequest {
            symbol: symbol.to_string(),
            side: side.to_string(),
            order_type: OrderType::Limit,
            quantity,
            price: Some(price),
        };

        match self.router.place_order(exchange, &order).await {
            Ok(ack) => {
                self.open_position(symbol, side, price, quantity, stop_loss, take_profit_1, take_profit_2);
                self.publish_fill_events(symbol, side, ack.avg_fill_price, ack.filled_quantity, &ack.exchange_order_id);

                info!(
                    symbol,
                    side,
                    exchange = %exchange,
                    order_id = %ack.exchange_order_id,
                    "live order placed and position created"
                );

                ExecutionResult::Placed(ack.raw)
            }
            Err(e) => {
                warn!(
                    symbol,
                    side,
                    exchange = %exchange,
                    error = %e,
                    "live order placement failed"
                );
                ExecutionResult::Error(format!("Order placement failed: {e}"))
            }
        }
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("router", &"<OrderRouter>")
            .field("position_manager", &self.position_manager)
            .field("risk_engine", &self.risk_engine)
            .finish()
    }
}
