// =============================================================================
// Engine-wide error taxonomy
// =============================================================================
//
// One `thiserror`-derived enum rather than one type per subsystem: several
// call sites (the data orchestrator's cycle driver in particular) need to
// match across kinds raised by different components. `FetchFailure` and
// `RiskRejected` carry a further typed reason enum instead of a bare
// `String`, following the barter-rs convention of matchable error payloads.

use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum FetchFailureKind {
    #[error("rate limited by exchange")]
    RateLimited,
    #[error("network error reaching exchange")]
    Network,
    #[error("exchange returned a 5xx response")]
    Upstream5xx,
    #[error("failed to decode exchange response")]
    Decode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RiskRejectionReason {
    #[error("position size exceeds max_position_size")]
    PositionSize,
    #[error("total exposure exceeds max_total_exposure")]
    TotalExposure,
    #[error("symbol exposure exceeds max_symbol_exposure")]
    SymbolExposure,
    #[error("daily drawdown exceeds max_daily_drawdown")]
    DailyDrawdown,
    #[error("total drawdown exceeds max_total_drawdown")]
    TotalDrawdown,
    #[error("volatility exceeds max_volatility")]
    Volatility,
    #[error("correlation exceeds max_correlation")]
    Correlation,
    #[error("leverage exceeds max_leverage")]
    Leverage,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("fetch failed for {symbol}: {kind}")]
    FetchFailure {
        symbol: String,
        kind: FetchFailureKind,
    },

    #[error("insufficient data for {symbol}: have {have} bars, need {need}")]
    InsufficientData {
        symbol: String,
        have: usize,
        need: usize,
    },

    #[error("worker batch timed out after {0:?}")]
    WorkerTimeout(std::time::Duration),

    #[error("queue depth {depth} exceeds max_queue_depth {max}")]
    Overloaded { depth: usize, max: usize },

    #[error("circuit breaker open: {component}")]
    CircuitOpen { component: &'static str },

    #[error("no exchange meets the minimum routing confidence")]
    NoEligibleExchange,

    #[error("order rejected by risk manager: {0}")]
    RiskRejected(RiskRejectionReason),

    #[error("invalid order: {0}")]
    InvalidOrder(String),
}

pub type EngineResult<T> = Result<T, EngineError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_failure_message_includes_symbol_and_kind() {
        let err = EngineError::FetchFailure {
            symbol: "BTCUSDT".to_string(),
            kind: FetchFailureKind::RateLimited,
        };
        let msg = err.to_string();
        assert!(msg.contains("BTCUSDT"));
        assert!(msg.contains("rate limited"));
    }

    #[test]
    fn risk_rejected_wraps_reason() {
        let err = EngineError::RiskRejected(RiskRejectionReason::DailyDrawdown);
        assert!(err.to_string().contains("daily drawdown"));
    }
}
