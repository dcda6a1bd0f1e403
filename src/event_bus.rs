// =============================================================================
// Event Bus — typed pub/sub over the fixed event-kind set
// =============================================================================
//
// Delivery is single-threaded cooperative: handlers run synchronously on the
// publisher's thread of control. The publisher clones the subscriber list
// out from under the read lock before invoking handlers, so a handler that
// calls subscribe/unsubscribe/publish again never deadlocks.

use std::collections::{HashMap, VecDeque};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde_json::Value;
use tracing::error;

const RING_CAPACITY: usize = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    MarketDataUpdate,
    MarketRegimeUpdate,
    SignalGenerated,
    SignalRankingUpdate,
    SignalConfirmed,
    TradeSignal,
    OrderPlaced,
    OrderFilled,
    RiskLimitBreach,
    SystemHealthUpdate,
    PerformanceMetric,
    EnhancedMetricsUpdated,
}

#[derive(Debug, Clone)]
pub struct Event {
    pub kind: EventKind,
    pub payload: Value,
    pub timestamp: DateTime<Utc>,
}

pub type Handler = Arc<dyn Fn(&Event) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

#[derive(Debug, Default, Clone)]
pub struct EventBusStats {
    pub total_events: u64,
    pub per_kind_counts: HashMap<EventKind, u64>,
    pub listener_count: usize,
}

struct Subscribers {
    handlers: RwLock<HashMap<EventKind, Vec<(SubscriptionId, Handler)>>>,
}

pub struct EventBus {
    subscribers: Subscribers,
    rings: RwLock<HashMap<EventKind, VecDeque<Event>>>,
    next_id: AtomicU64,
    total_events: AtomicU64,
    per_kind_counts: RwLock<HashMap<EventKind, u64>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: Subscribers {
                handlers: RwLock::new(HashMap::new()),
            },
            rings: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            total_events: AtomicU64::new(0),
            per_kind_counts: RwLock::new(HashMap::new()),
        }
    }

    pub fn subscribe(&self, kind: EventKind, handler: Handler) -> SubscriptionId {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscribers
            .handlers
            .write()
            .entry(kind)
            .or_default()
            .push((id, handler));
        id
    }

    pub fn unsubscribe(&self, kind: EventKind, id: SubscriptionId) {
        if let Some(list) = self.subscribers.handlers.write().get_mut(&kind) {
            list.retain(|(sub_id, _)| *sub_id != id);
        }
    }

    /// Deliver to all current subscribers in registration order and append
    /// to the kind's bounded ring. Non-blocking from the caller's point of
    /// view: handlers run synchronously but must not suspend indefinitely.
    pub fn publish(&self, kind: EventKind, payload: Value) {
        let event = Event {
            kind,
            payload,
            timestamp: Utc::now(),
        };

        let handlers: Vec<(SubscriptionId, Handler)> = self
            .subscribers
            .handlers
            .read()
            .get(&kind)
            .cloned()
            .unwrap_or_default();

        for (_, handler) in &handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler(&event)));
            if outcome.is_err() {
                error!(?kind, "event handler panicked");
            }
        }

        let mut rings = self.rings.write();
        let ring = rings.entry(kind).or_insert_with(VecDeque::new);
        ring.push_back(event);
        if ring.len() > RING_CAPACITY {
            ring.pop_front();
        }

        self.total_events.fetch_add(1, Ordering::Relaxed);
        *self.per_kind_counts.write().entry(kind).or_insert(0) += 1;
    }

    pub fn history(&self, kind: EventKind, n: usize) -> Vec<Event> {
        self.rings
            .read()
            .get(&kind)
            .map(|ring| ring.iter().rev().take(n).rev().cloned().collect())
            .unwrap_or_default()
    }

    pub fn stats(&self) -> EventBusStats {
        let listener_count = self
            .subscribers
            .handlers
            .read()
            .values()
            .map(|v| v.len())
            .sum();

        EventBusStats {
            total_events: self.total_events.load(Ordering::Relaxed),
            per_kind_counts: self.per_kind_counts.read().clone(),
            listener_count,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use serde_json::json;

    #[test]
    fn publish_delivers_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(RwLock::new(Vec::new()));

        let o1 = Arc::clone(&order);
        bus.subscribe(
            EventKind::MarketDataUpdate,
            Arc::new(move |_| o1.write().push(1)),
        );
        let o2 = Arc::clone(&order);
        bus.subscribe(
            EventKind::MarketDataUpdate,
            Arc::new(move |_| o2.write().push(2)),
        );

        bus.publish(EventKind::MarketDataUpdate, json!({}));
        assert_eq!(*order.read(), vec![1, 2]);
    }

    #[test]
    fn unsubscribe_stops_delivery() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let id = bus.subscribe(
            EventKind::SystemHealthUpdate,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );
        bus.publish(EventKind::SystemHealthUpdate, json!({}));
        bus.unsubscribe(EventKind::SystemHealthUpdate, id);
        bus.publish(EventKind::SystemHealthUpdate, json!({}));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn failing_handler_is_isolated() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));

        bus.subscribe(
            EventKind::OrderPlaced,
            Arc::new(|_| panic!("boom")),
        );
        let c = Arc::clone(&count);
        bus.subscribe(
            EventKind::OrderPlaced,
            Arc::new(move |_| {
                c.fetch_add(1, Ordering::Relaxed);
            }),
        );

        bus.publish(EventKind::OrderPlaced, json!({}));
        assert_eq!(count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn ring_is_capped_and_history_is_chronological() {
        let bus = EventBus::new();
        for i in 0..(RING_CAPACITY + 10) {
            bus.publish(EventKind::PerformanceMetric, json!({ "i": i }));
        }
        let hist = bus.history(EventKind::PerformanceMetric, 5);
        assert_eq!(hist.len(), 5);
        let values: Vec<i64> = hist
            .iter()
            .map(|e| e.payload.get("i").and_then(Value::as_i64).unwrap())
            .collect();
        assert!(values.windows(2).all(|w| w[0] < w[1]));
    }

    #[test]
    fn stats_count_total_and_per_kind() {
        let bus = EventBus::new();
        bus.publish(EventKind::TradeSignal, json!({}));
        bus.publish(EventKind::TradeSignal, json!({}));
        bus.publish(EventKind::OrderFilled, json!({}));

        let stats = bus.stats();
        assert_eq!(stats.total_events, 3);
        assert_eq!(stats.per_kind_counts[&EventKind::TradeSignal], 2);
        assert_eq!(stats.per_kind_counts[&EventKind::OrderFilled], 1);
    }
}
