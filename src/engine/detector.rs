//! Fill detector - decides when a pending order counts as filled
//!
//! The venue gives no fill confirmations, so a fill is inferred from the
//! price stream: the trigger condition (price <= limit for BUY, >= for
//! SELL) must hold continuously for a confirmation window before the order
//! is declared filled. A single tick that breaks the condition resets the
//! timer to zero, which suppresses false fills from transient wicks.

use std::collections::HashMap;
use std::fmt;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::ledger::OrderSide;

/// Default confirmation window
pub const DEFAULT_CONFIRM_SECS: u64 = 3;

/// Tracker identity: side, trigger price and ledger order id.
///
/// The price is stored in thousandth-of-quote ticks so the key stays
/// hashable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TrackerKey {
    pub side: OrderSide,
    pub price_ticks: i64,
    pub order_id: u64,
}

impl TrackerKey {
    pub fn new(side: OrderSide, price: f64, order_id: u64) -> Self {
        Self {
            side,
            price_ticks: (price * 1000.0).round() as i64,
            order_id,
        }
    }
}

impl fmt::Display for TrackerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}",
            self.side.as_str(),
            self.price_ticks as f64 / 1000.0,
            self.order_id
        )
    }
}

/// Per-order trigger state
#[derive(Debug)]
struct PendingFillTracker {
    side: OrderSide,
    trigger_price: f64,
    /// When the condition last became continuously true
    condition_since: Option<Instant>,
}

/// Emitted once per detected fill
#[derive(Debug, Clone)]
pub struct FillEvent {
    pub key: TrackerKey,
    /// Market price at confirmation
    pub price: f64,
    pub trigger_price: f64,
    /// How long the condition held before confirmation
    pub duration: Duration,
    pub filled_at: DateTime<Utc>,
}

/// Tracks pending orders and declares fills from the price stream.
///
/// Fills are delivered on an unbounded channel rather than a callback, so
/// one slow or dead consumer can never stall price evaluation.
pub struct FillDetector {
    confirm: Duration,
    trackers: Mutex<HashMap<TrackerKey, PendingFillTracker>>,
    fills_tx: UnboundedSender<FillEvent>,
}

impl FillDetector {
    /// Create a detector and the receiving end of its fill channel
    pub fn new(confirm: Duration) -> (Self, UnboundedReceiver<FillEvent>) {
        let (fills_tx, fills_rx) = mpsc::unbounded_channel();
        (
            Self {
                confirm,
                trackers: Mutex::new(HashMap::new()),
                fills_tx,
            },
            fills_rx,
        )
    }

    /// Start monitoring an order. Re-registering the same key replaces the
    /// tracker and restarts its confirmation window.
    pub fn register(&self, key: TrackerKey, trigger_price: f64) {
        let mut trackers = self.trackers.lock().expect("tracker map poisoned");
        trackers.insert(
            key,
            PendingFillTracker {
                side: key.side,
                trigger_price,
                condition_since: None,
            },
        );
        info!(
            "Monitoring order {}: {} @ {} (confirm {:?})",
            key,
            key.side.as_str(),
            trigger_price,
            self.confirm
        );
    }

    /// Stop monitoring; no-op if the key is unknown
    pub fn cancel(&self, key: &TrackerKey) {
        let mut trackers = self.trackers.lock().expect("tracker map poisoned");
        if trackers.remove(key).is_some() {
            info!("Stopped monitoring order {}", key);
        }
    }

    /// Evaluate every tracker against a new price sample
    pub fn update_price(&self, price: f64) {
        self.update_price_at(price, Instant::now());
    }

    /// Evaluation with an explicit clock, for deterministic tests
    pub fn update_price_at(&self, price: f64, now: Instant) {
        let mut trackers = self.trackers.lock().expect("tracker map poisoned");
        let mut filled: Vec<(TrackerKey, Duration)> = Vec::new();

        for (key, tracker) in trackers.iter_mut() {
            let condition_met = match tracker.side {
                OrderSide::Buy => price <= tracker.trigger_price,
                OrderSide::Sell => price >= tracker.trigger_price,
            };

            if condition_met {
                let since = *tracker.condition_since.get_or_insert(now);
                let held = now.duration_since(since);
                if held >= self.confirm {
                    filled.push((*key, held));
                } else {
                    debug!("Order {}: condition held {:?}/{:?}", key, held, self.confirm);
                }
            } else if tracker.condition_since.take().is_some() {
                // The window does not accumulate across interruptions
                debug!("Order {}: condition broken at {}, timer reset", key, price);
            }
        }

        for (key, duration) in filled {
            if let Some(tracker) = trackers.remove(&key) {
                info!("Order {} filled after {:?} at price {}", key, duration, price);
                let event = FillEvent {
                    key,
                    price,
                    trigger_price: tracker.trigger_price,
                    duration,
                    filled_at: Utc::now(),
                };
                // A dead consumer must not stop the remaining fills; the
                // tracker is already removed either way.
                if self.fills_tx.send(event).is_err() {
                    warn!("Fill channel closed, dropping fill for {}", key);
                }
            }
        }
    }

    pub fn pending_keys(&self) -> Vec<TrackerKey> {
        let trackers = self.trackers.lock().expect("tracker map poisoned");
        trackers.keys().copied().collect()
    }

    pub fn pending_count(&self) -> usize {
        let trackers = self.trackers.lock().expect("tracker map poisoned");
        trackers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secs(s: f64) -> Duration {
        Duration::from_secs_f64(s)
    }

    #[test]
    fn test_buy_fires_after_confirm_window() {
        let (detector, mut rx) = FillDetector::new(secs(3.0));
        let key = TrackerKey::new(OrderSide::Buy, 90.0, 1);
        detector.register(key, 90.0);

        let t0 = Instant::now();
        detector.update_price_at(89.0, t0);
        assert!(rx.try_recv().is_err());

        detector.update_price_at(89.5, t0 + secs(3.0));
        let fill = rx.try_recv().unwrap();
        assert_eq!(fill.key, key);
        assert_eq!(fill.price, 89.5);
        assert_eq!(fill.trigger_price, 90.0);
        assert!(fill.duration >= secs(3.0));

        // Fires exactly once; the tracker is gone
        detector.update_price_at(89.0, t0 + secs(10.0));
        assert!(rx.try_recv().is_err());
        assert_eq!(detector.pending_count(), 0);
    }

    #[test]
    fn test_sell_trigger_direction() {
        let (detector, mut rx) = FillDetector::new(secs(3.0));
        let key = TrackerKey::new(OrderSide::Sell, 110.0, 2);
        detector.register(key, 110.0);

        let t0 = Instant::now();
        detector.update_price_at(109.0, t0);
        detector.update_price_at(109.0, t0 + secs(5.0));
        assert!(rx.try_recv().is_err());

        detector.update_price_at(110.0, t0 + secs(6.0));
        detector.update_price_at(111.0, t0 + secs(9.0));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_break_resets_window() {
        let (detector, mut rx) = FillDetector::new(secs(3.0));
        let key = TrackerKey::new(OrderSide::Buy, 90.0, 3);
        detector.register(key, 90.0);

        let t0 = Instant::now();
        detector.update_price_at(89.0, t0);
        detector.update_price_at(89.0, t0 + secs(2.9));
        assert!(rx.try_recv().is_err());

        // One tick above the trigger wipes the accumulated window
        detector.update_price_at(91.0, t0 + secs(2.95));
        detector.update_price_at(89.0, t0 + secs(3.0));
        detector.update_price_at(89.0, t0 + secs(5.9));
        assert!(rx.try_recv().is_err());

        // A fresh full window must elapse
        detector.update_price_at(89.0, t0 + secs(6.0));
        assert!(rx.try_recv().is_ok());
    }

    #[test]
    fn test_cancel_unknown_is_noop() {
        let (detector, _rx) = FillDetector::new(secs(3.0));
        detector.cancel(&TrackerKey::new(OrderSide::Buy, 90.0, 99));
        assert_eq!(detector.pending_count(), 0);
    }

    #[test]
    fn test_reregister_replaces_tracker() {
        let (detector, mut rx) = FillDetector::new(secs(3.0));
        let key = TrackerKey::new(OrderSide::Buy, 90.0, 4);

        let t0 = Instant::now();
        detector.register(key, 90.0);
        detector.update_price_at(89.0, t0);

        // Replacement restarts the window
        detector.register(key, 90.0);
        detector.update_price_at(89.0, t0 + secs(3.0));
        assert!(rx.try_recv().is_err());
        assert_eq!(detector.pending_count(), 1);
    }

    #[test]
    fn test_closed_channel_still_removes_trackers() {
        let (detector, rx) = FillDetector::new(secs(3.0));
        drop(rx);

        let a = TrackerKey::new(OrderSide::Buy, 90.0, 5);
        let b = TrackerKey::new(OrderSide::Buy, 95.0, 6);
        detector.register(a, 90.0);
        detector.register(b, 95.0);

        let t0 = Instant::now();
        detector.update_price_at(89.0, t0);
        detector.update_price_at(89.0, t0 + secs(3.0));

        // Both fills were dropped, both trackers evaluated and removed
        assert_eq!(detector.pending_count(), 0);
    }
}
