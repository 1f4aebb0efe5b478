//! Event broadcaster - fans engine events out to subscribers
//!
//! Delivery is at-most-once best effort per subscriber; a lagging or
//! dropped subscriber never affects the others or the engine.

use log::debug;
use serde::Serialize;
use tokio::sync::broadcast;

use crate::ledger::{OrderSide, OrderStatus};

const CHANNEL_CAPACITY: usize = 256;

/// Engine events, serialized as `{"type": ..., "data": {...}}`
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum EngineEvent {
    OrderCreated {
        strategy_id: u64,
        order_id: u64,
        side: OrderSide,
        price: f64,
        qty: f64,
        status: OrderStatus,
    },
    StrategyStarted {
        strategy_id: u64,
        orders_count: usize,
    },
    OrderFilled {
        strategy_id: u64,
        order_id: u64,
        side: OrderSide,
        price: f64,
        profit: f64,
    },
    StrategyStopped {
        strategy_id: u64,
        cancelled_orders: usize,
    },
    PriceTick {
        pair_code: String,
        price: f64,
    },
}

/// Cloneable handle to the broadcast channel
#[derive(Clone)]
pub struct EventBroadcaster {
    tx: broadcast::Sender<EngineEvent>,
}

impl EventBroadcaster {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish to all current subscribers; nobody listening is fine
    pub fn publish(&self, event: EngineEvent) {
        debug!("Broadcasting {:?}", event);
        let _ = self.tx.send(event);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EngineEvent> {
        self.tx.subscribe()
    }
}

impl Default for EventBroadcaster {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_publish_reaches_all_subscribers() {
        let broadcaster = EventBroadcaster::new();
        let mut a = broadcaster.subscribe();
        let mut b = broadcaster.subscribe();

        broadcaster.publish(EngineEvent::StrategyStarted {
            strategy_id: 1,
            orders_count: 2,
        });

        assert!(matches!(
            a.recv().await.unwrap(),
            EngineEvent::StrategyStarted { strategy_id: 1, .. }
        ));
        assert!(matches!(
            b.recv().await.unwrap(),
            EngineEvent::StrategyStarted { strategy_id: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_publish_without_subscribers() {
        let broadcaster = EventBroadcaster::new();
        broadcaster.publish(EngineEvent::StrategyStopped {
            strategy_id: 1,
            cancelled_orders: 0,
        });
    }

    #[test]
    fn test_event_wire_shape() {
        let event = EngineEvent::OrderFilled {
            strategy_id: 3,
            order_id: 7,
            side: OrderSide::Sell,
            price: 110.0,
            profit: 0.1,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "order_filled");
        assert_eq!(json["data"]["side"], "SELL");
        assert_eq!(json["data"]["order_id"], 7);
    }
}
