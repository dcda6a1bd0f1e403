// =============================================================================
// Indicator Engine
// =============================================================================
//
// Computes the per-symbol indicator suite and a category-weighted composite
// signal, behind a bounded worker pool so CPU-heavy suite computation never
// blocks the async runtime's I/O tasks.

mod composite;
mod engine;
mod suite;

pub use composite::top_n;
pub use engine::{default_worker_count, EngineStats, IndicatorEngine};
pub use suite::{compute_suite, IndicatorSuite, Signal, MIN_SUITE_PERIOD};
