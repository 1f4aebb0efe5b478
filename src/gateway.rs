//! Order placement gateway - the venue-side effect of an order
//!
//! The real venue is driven through browser automation, which is slow,
//! flaky and not reentrant; this trait keeps that behind a seam the engine
//! can mock. The engine serializes every call through a single gate, so
//! implementations may assume no concurrent invocations.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use log::info;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::errors::{EngineError, EngineResult};
use crate::ledger::{OrderKind, OrderSide};

/// A venue order to submit
#[derive(Debug, Clone)]
pub struct PlacementRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub qty: f64,
    pub kind: OrderKind,
    pub price: Option<f64>,
}

/// Venue acknowledgement of a placed order
#[derive(Debug, Clone)]
pub struct PlacementReceipt {
    pub venue_order_id: String,
}

/// Venue operations. May fail or lag; never called concurrently.
#[async_trait]
pub trait OrderGateway: Send + Sync {
    async fn place(&self, request: &PlacementRequest) -> EngineResult<PlacementReceipt>;

    /// Best-effort venue-side cancellation
    async fn cancel(&self, venue_order_id: &str) -> EngineResult<bool>;
}

/// Simulated gateway: records requests, answers with `SIM-` receipts after
/// a configurable delay. Doubles as the test mock via `set_should_fail`.
pub struct SimulatedGateway {
    delay: Duration,
    pub placed: Mutex<Vec<PlacementRequest>>,
    pub cancelled: Mutex<Vec<String>>,
    should_fail: AtomicBool,
}

impl SimulatedGateway {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            placed: Mutex::new(Vec::new()),
            cancelled: Mutex::new(Vec::new()),
            should_fail: AtomicBool::new(false),
        }
    }

    /// Zero-latency gateway for tests
    pub fn instant() -> Self {
        Self::new(Duration::ZERO)
    }

    pub fn set_should_fail(&self, fail: bool) {
        self.should_fail.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl OrderGateway for SimulatedGateway {
    async fn place(&self, request: &PlacementRequest) -> EngineResult<PlacementReceipt> {
        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }

        if self.should_fail.load(Ordering::SeqCst) {
            return Err(EngineError::Gateway("simulated placement failure".into()));
        }

        self.placed.lock().await.push(request.clone());
        let venue_order_id = format!("SIM-{}", Uuid::new_v4().simple());
        info!(
            "Simulated order: {} {} {} @ {:?} -> {}",
            request.side.as_str(),
            request.qty,
            request.symbol,
            request.price,
            venue_order_id
        );

        Ok(PlacementReceipt { venue_order_id })
    }

    async fn cancel(&self, venue_order_id: &str) -> EngineResult<bool> {
        self.cancelled.lock().await.push(venue_order_id.to_string());
        Ok(true)
    }
}
