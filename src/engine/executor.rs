//! Grid strategy engine - ladder construction, fill processing, stop
//!
//! The engine orchestrates the calculator, the fill detector, the ledger
//! and the placement gateway. Each entry point runs against its own ledger
//! transaction and reloads entities rather than trusting in-memory copies;
//! truth lives in the ledger.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use log::{debug, error, info, warn};
use serde::Serialize;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use crate::errors::{EngineError, EngineResult};
use crate::feed::PriceFeed;
use crate::gateway::{OrderGateway, PlacementRequest};
use crate::ledger::{Ledger, Order, OrderDraft, OrderKind, OrderSide, StrategyStatus};
use crate::notifier::{EngineEvent, EventBroadcaster};

use super::calculator::{self, PricePrecision};
use super::detector::{FillDetector, FillEvent, TrackerKey};

/// Engine tuning knobs
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// Live price older than this falls back to the band midpoint
    pub price_max_age: Duration,
    /// Skip ladder levels closer than this fraction of a grid step to the
    /// current price, to avoid immediately crossing the spread
    pub self_fill_guard_ratio: f64,
    pub precision: PricePrecision,
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            price_max_age: Duration::from_secs(30),
            self_fill_guard_ratio: 0.3,
            precision: PricePrecision::default(),
        }
    }
}

/// Outcome of a successful `start_strategy`
#[derive(Debug, Clone, Serialize)]
pub struct StartReport {
    pub orders_created: usize,
    pub levels: Vec<f64>,
    /// True when no fresh live price existed and the band midpoint was used
    pub used_fallback_price: bool,
}

/// Outcome of `stop_strategy`
#[derive(Debug, Clone, Serialize)]
pub struct StopReport {
    pub cancelled_orders: usize,
}

/// Live state of a running strategy
#[derive(Debug, Clone, Serialize)]
pub struct RunSnapshot {
    pub levels: Vec<f64>,
    pub current_price: f64,
}

/// What one fill transaction decided, carried out of the ledger closure
struct FillOutcome {
    strategy_id: u64,
    side: OrderSide,
    fill_price: f64,
    profit: f64,
    replenishment: Option<Order>,
}

pub struct GridEngine {
    ledger: Arc<Ledger>,
    detector: Arc<FillDetector>,
    gateway: Arc<dyn OrderGateway>,
    broadcaster: EventBroadcaster,
    feed: Arc<PriceFeed>,
    settings: EngineSettings,
    /// Active-run arena, keyed by strategy id; insert on start, remove on stop
    active_runs: RwLock<HashMap<u64, RunSnapshot>>,
    /// The venue automation is not reentrant; every placement goes through
    /// this one gate
    placement_gate: Mutex<()>,
}

impl GridEngine {
    pub fn new(
        ledger: Arc<Ledger>,
        detector: Arc<FillDetector>,
        gateway: Arc<dyn OrderGateway>,
        broadcaster: EventBroadcaster,
        feed: Arc<PriceFeed>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            ledger,
            detector,
            gateway,
            broadcaster,
            feed,
            settings,
            active_runs: RwLock::new(HashMap::new()),
            placement_gate: Mutex::new(()),
        }
    }

    /// Consume fill events, spawning one independent unit of work per fill.
    /// Units of work may run concurrently with each other and with start or
    /// stop operations on the same strategy.
    pub fn spawn_fill_worker(
        self: &Arc<Self>,
        mut fills_rx: UnboundedReceiver<FillEvent>,
    ) -> JoinHandle<()> {
        let engine = Arc::clone(self);
        tokio::spawn(async move {
            while let Some(fill) = fills_rx.recv().await {
                let engine = Arc::clone(&engine);
                tokio::spawn(async move {
                    let order_id = fill.key.order_id;
                    if let Err(e) = engine.process_fill(fill).await {
                        error!("Fill processing failed for order {}: {}", order_id, e);
                    }
                });
            }
        })
    }

    /// Build the initial ladder for a strategy already flipped to RUNNING.
    ///
    /// Gateway failures mark the affected order FAILED and the build
    /// continues; every created order is committed and broadcast
    /// individually so observers see incremental construction.
    pub async fn start_strategy(&self, strategy_id: u64) -> EngineResult<StartReport> {
        let strategy = self
            .ledger
            .read(|state| state.strategy(strategy_id).cloned())
            .await?;

        // The external status flip and this invocation can race; treat a
        // mismatch as a fatal precondition, not something to retry.
        if strategy.status != StrategyStatus::Running {
            return Err(EngineError::WrongStrategyStatus {
                id: strategy_id,
                status: strategy.status.as_str().to_string(),
                expected: StrategyStatus::Running.as_str().to_string(),
            });
        }

        let levels = calculator::levels(
            strategy.lower_price,
            strategy.upper_price,
            strategy.grid_count,
            self.settings.precision,
        );
        let step = calculator::step(
            strategy.lower_price,
            strategy.upper_price,
            strategy.grid_count,
        );

        let (current_price, used_fallback_price) = match self.feed.latest() {
            Some(sample) if sample.age() <= self.settings.price_max_age => {
                info!(
                    "Live price {} ({:.1}s old)",
                    sample.price,
                    sample.age().as_secs_f64()
                );
                (sample.price, false)
            }
            _ => {
                let mid = strategy.mid_price();
                warn!("No fresh live price, using band midpoint {}", mid);
                (mid, true)
            }
        };

        info!(
            "Strategy [{}] starting: band {}-{}, {} grids, {} per grid, price {}",
            strategy.name,
            strategy.lower_price,
            strategy.upper_price,
            strategy.grid_count,
            strategy.investment_per_grid,
            current_price
        );

        let mut orders_created = 0usize;

        for (i, &level) in levels.iter().enumerate() {
            // Anti-self-fill guard
            if (level - current_price).abs() < step * self.settings.self_fill_guard_ratio {
                debug!("Skipping level {} ({}, too close to current price)", i, level);
                continue;
            }

            let side = if level < current_price {
                OrderSide::Buy
            } else {
                OrderSide::Sell
            };
            let qty = calculator::quantity_per_level(strategy.investment_per_grid, level);

            let order_id = self
                .ledger
                .write(|state| {
                    Ok(state.create_order(OrderDraft {
                        strategy_id: Some(strategy_id),
                        symbol: strategy.symbol.clone(),
                        side,
                        price: level,
                        qty,
                        kind: OrderKind::Limit,
                        grid_level: Some(i as i32),
                        paired_order_id: None,
                        is_entry: true,
                    }))
                })
                .await?;

            let status = self.place_and_track(order_id, side, level, qty, &strategy.symbol).await?;

            orders_created += 1;
            self.broadcaster.publish(EngineEvent::OrderCreated {
                strategy_id,
                order_id,
                side,
                price: level,
                qty,
                status,
            });
        }

        {
            let mut runs = self.active_runs.write().expect("active-run map poisoned");
            runs.insert(
                strategy_id,
                RunSnapshot {
                    levels: levels.clone(),
                    current_price,
                },
            );
        }

        self.broadcaster.publish(EngineEvent::StrategyStarted {
            strategy_id,
            orders_count: orders_created,
        });

        Ok(StartReport {
            orders_created,
            levels,
            used_fallback_price,
        })
    }

    /// Submit one order to the venue and register its fill tracker.
    ///
    /// A gateway failure marks the order FAILED (with the error text) and
    /// is not propagated; the returned status tells the caller which way
    /// it went.
    async fn place_and_track(
        &self,
        order_id: u64,
        side: OrderSide,
        price: f64,
        qty: f64,
        symbol: &str,
    ) -> EngineResult<crate::ledger::OrderStatus> {
        let request = PlacementRequest {
            symbol: symbol.to_string(),
            side,
            qty,
            kind: OrderKind::Limit,
            price: Some(price),
        };

        let placed = {
            let _gate = self.placement_gate.lock().await;
            self.gateway.place(&request).await
        };

        match placed {
            Ok(receipt) => {
                self.ledger
                    .write(|state| {
                        state.order_mut(order_id)?.venue_order_id = Some(receipt.venue_order_id);
                        Ok(())
                    })
                    .await?;
                self.detector
                    .register(TrackerKey::new(side, price, order_id), price);
                Ok(crate::ledger::OrderStatus::Pending)
            }
            Err(e) => {
                error!("Placement failed for order {}: {}", order_id, e);
                self.ledger
                    .write(|state| state.order_mut(order_id)?.mark_failed(e.to_string()))
                    .await?;
                Ok(crate::ledger::OrderStatus::Failed)
            }
        }
    }

    /// Process one detected fill: record the trade, realize profit on a
    /// paired SELL, and replenish the ladder one grid step away.
    pub async fn process_fill(&self, fill: FillEvent) -> EngineResult<()> {
        let order_id = fill.key.order_id;

        let outcome = self
            .ledger
            .write(|state| {
                let order = state.order(order_id)?.clone();
                let strategy_id = match order.strategy_id {
                    Some(id) => id,
                    None => return Ok(None),
                };
                let strategy = state.strategy(strategy_id)?.clone();

                // Stale-fill guard: a stop or pause that committed before
                // this unit of work reloaded wins, and the fill is dropped.
                if strategy.status != StrategyStatus::Running {
                    info!(
                        "Strategy {} is {}, discarding fill for order {}",
                        strategy_id,
                        strategy.status.as_str(),
                        order_id
                    );
                    return Ok(None);
                }

                state.order_mut(order_id)?.mark_filled()?;

                let step = calculator::step(
                    strategy.lower_price,
                    strategy.upper_price,
                    strategy.grid_count,
                );

                // Only a SELL closing a paired BUY realizes profit
                let mut profit = 0.0;
                if order.side == OrderSide::Sell {
                    if let Some(paired_id) = order.paired_order_id {
                        if let Ok(buy) = state.order(paired_id) {
                            profit = (order.price - buy.price) * order.qty;
                            state.strategy_mut(strategy_id)?.total_profit += profit;
                        }
                    }
                }

                state.record_trade(strategy_id, order_id, order.side, fill.price, order.qty, profit);
                state.strategy_mut(strategy_id)?.total_trades += 1;

                let draft = match order.side {
                    OrderSide::Buy => {
                        let new_price = self.settings.precision.round(order.price + step);
                        (new_price <= strategy.upper_price).then(|| OrderDraft {
                            strategy_id: Some(strategy_id),
                            symbol: strategy.symbol.clone(),
                            side: OrderSide::Sell,
                            price: new_price,
                            qty: order.qty,
                            kind: OrderKind::Limit,
                            grid_level: order.grid_level.map(|l| l + 1),
                            paired_order_id: Some(order.id),
                            is_entry: false,
                        })
                    }
                    OrderSide::Sell => {
                        let new_price = self.settings.precision.round(order.price - step);
                        (new_price >= strategy.lower_price).then(|| OrderDraft {
                            strategy_id: Some(strategy_id),
                            symbol: strategy.symbol.clone(),
                            side: OrderSide::Buy,
                            price: new_price,
                            qty: calculator::quantity_per_level(
                                strategy.investment_per_grid,
                                new_price,
                            ),
                            kind: OrderKind::Limit,
                            grid_level: order.grid_level.map(|l| l - 1),
                            paired_order_id: None,
                            is_entry: true,
                        })
                    }
                };

                let replenishment = draft.map(|draft| {
                    let id = state.create_order(draft);
                    state.order(id).map(Clone::clone)
                });
                let replenishment = match replenishment {
                    Some(result) => Some(result?),
                    None => None,
                };

                Ok(Some(FillOutcome {
                    strategy_id,
                    side: order.side,
                    fill_price: fill.price,
                    profit,
                    replenishment,
                }))
            })
            .await?;

        let outcome = match outcome {
            Some(outcome) => outcome,
            None => return Ok(()),
        };

        if let Some(new_order) = &outcome.replenishment {
            info!(
                "Replenishing: {} @ {} (paired {:?})",
                new_order.side.as_str(),
                new_order.price,
                new_order.paired_order_id
            );
            self.place_and_track(
                new_order.id,
                new_order.side,
                new_order.price,
                new_order.qty,
                &new_order.symbol,
            )
            .await?;
        } else {
            debug!("No replenishment for order {} (band edge)", order_id);
        }

        self.broadcaster.publish(EngineEvent::OrderFilled {
            strategy_id: outcome.strategy_id,
            order_id,
            side: outcome.side,
            price: outcome.fill_price,
            profit: outcome.profit,
        });

        Ok(())
    }

    /// Cancel every pending order of a strategy and retire its run.
    ///
    /// Venue-side cancellation is out of scope here; ledger cancellation is
    /// authoritative for callers.
    pub async fn stop_strategy(&self, strategy_id: u64) -> EngineResult<StopReport> {
        let detector = Arc::clone(&self.detector);

        let cancelled_orders = self
            .ledger
            .write(|state| {
                let pending = state.pending_order_ids(strategy_id);
                let mut cancelled = 0usize;
                for order_id in pending {
                    let order = state.order_mut(order_id)?;
                    detector.cancel(&TrackerKey::new(order.side, order.price, order.id));
                    order.mark_cancelled()?;
                    cancelled += 1;
                }
                Ok(cancelled)
            })
            .await?;

        {
            let mut runs = self.active_runs.write().expect("active-run map poisoned");
            runs.remove(&strategy_id);
        }

        info!(
            "Strategy {} stopped, {} orders cancelled",
            strategy_id, cancelled_orders
        );

        self.broadcaster.publish(EngineEvent::StrategyStopped {
            strategy_id,
            cancelled_orders,
        });

        Ok(StopReport { cancelled_orders })
    }

    /// Live run state, or None when the strategy has no active run
    pub fn strategy_status(&self, strategy_id: u64) -> Option<RunSnapshot> {
        let runs = self.active_runs.read().expect("active-run map poisoned");
        runs.get(&strategy_id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::SimulatedGateway;
    use crate::ledger::{NewStrategy, OrderStatus};
    use chrono::Utc;

    struct Harness {
        engine: Arc<GridEngine>,
        ledger: Arc<Ledger>,
        gateway: Arc<SimulatedGateway>,
        detector: Arc<FillDetector>,
        feed: Arc<PriceFeed>,
    }

    fn harness() -> Harness {
        let ledger = Arc::new(Ledger::in_memory());
        let (detector, _fills_rx) = FillDetector::new(Duration::from_secs(3));
        let detector = Arc::new(detector);
        let gateway = Arc::new(SimulatedGateway::instant());
        let feed = Arc::new(PriceFeed::new("btc"));

        let engine = Arc::new(GridEngine::new(
            Arc::clone(&ledger),
            Arc::clone(&detector),
            gateway.clone() as Arc<dyn OrderGateway>,
            EventBroadcaster::new(),
            Arc::clone(&feed),
            EngineSettings::default(),
        ));

        Harness {
            engine,
            ledger,
            gateway,
            detector,
            feed,
        }
    }

    async fn running_strategy(h: &Harness) -> u64 {
        let id = h
            .ledger
            .write(|state| {
                state.create_strategy(NewStrategy {
                    name: "grid".into(),
                    symbol: "BTCUSDT".into(),
                    lower_price: 90.0,
                    upper_price: 110.0,
                    grid_count: 2,
                    investment_per_grid: 50.0,
                    stop_loss: None,
                    take_profit: None,
                    max_orders: 50,
                })
            })
            .await
            .unwrap();
        h.ledger
            .write(|state| state.strategy_mut(id)?.set_status(StrategyStatus::Running))
            .await
            .unwrap();
        id
    }

    fn fill_event(side: OrderSide, trigger: f64, order_id: u64, price: f64) -> FillEvent {
        FillEvent {
            key: TrackerKey::new(side, trigger, order_id),
            price,
            trigger_price: trigger,
            duration: Duration::from_secs(3),
            filled_at: Utc::now(),
        }
    }

    #[tokio::test]
    async fn test_start_builds_ladder_and_skips_current_level() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);

        let report = h.engine.start_strategy(sid).await.unwrap();

        assert_eq!(report.levels, vec![90.0, 100.0, 110.0]);
        assert!(!report.used_fallback_price);
        // Level 100 is within 0.3 * step of the current price and skipped
        assert_eq!(report.orders_created, 2);

        let orders = h.ledger.read(|state| {
            state
                .orders_for(sid)
                .iter()
                .map(|o| (o.side, o.price, o.status, o.is_entry))
                .collect::<Vec<_>>()
        }).await;
        assert_eq!(
            orders,
            vec![
                (OrderSide::Buy, 90.0, OrderStatus::Pending, true),
                (OrderSide::Sell, 110.0, OrderStatus::Pending, true),
            ]
        );

        assert_eq!(h.detector.pending_count(), 2);
        assert_eq!(h.gateway.placed.lock().await.len(), 2);
        assert!(h.engine.strategy_status(sid).is_some());
    }

    #[tokio::test]
    async fn test_start_requires_running_status() {
        let h = harness();
        let sid = h
            .ledger
            .write(|state| {
                state.create_strategy(NewStrategy {
                    name: "grid".into(),
                    symbol: "BTCUSDT".into(),
                    lower_price: 90.0,
                    upper_price: 110.0,
                    grid_count: 2,
                    investment_per_grid: 50.0,
                    stop_loss: None,
                    take_profit: None,
                    max_orders: 50,
                })
            })
            .await
            .unwrap();

        let err = h.engine.start_strategy(sid).await.unwrap_err();
        assert!(matches!(err, EngineError::WrongStrategyStatus { .. }));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_start_falls_back_to_midpoint() {
        let h = harness();
        let sid = running_strategy(&h).await;
        // No price recorded at all

        let report = h.engine.start_strategy(sid).await.unwrap();
        assert!(report.used_fallback_price);
        // Midpoint is 100, so the ladder looks the same as the live case
        assert_eq!(report.orders_created, 2);
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_order_failed() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);
        h.gateway.set_should_fail(true);

        let report = h.engine.start_strategy(sid).await.unwrap();
        // Orders are still created and counted, just FAILED
        assert_eq!(report.orders_created, 2);

        h.ledger
            .read(|state| {
                for order in state.orders_for(sid) {
                    assert_eq!(order.status, OrderStatus::Failed);
                    assert!(order.error_message.is_some());
                }
            })
            .await;
        assert_eq!(h.detector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_buy_fill_replenishes_sell_one_step_up() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);
        h.engine.start_strategy(sid).await.unwrap();

        let buy_id = h
            .ledger
            .read(|state| {
                state
                    .orders_for(sid)
                    .iter()
                    .find(|o| o.side == OrderSide::Buy)
                    .map(|o| o.id)
                    .unwrap()
            })
            .await;

        h.engine
            .process_fill(fill_event(OrderSide::Buy, 90.0, buy_id, 89.5))
            .await
            .unwrap();

        h.ledger
            .read(|state| {
                assert_eq!(state.order(buy_id).unwrap().status, OrderStatus::Filled);

                let replenishment = state
                    .orders_for(sid)
                    .into_iter()
                    .find(|o| o.paired_order_id == Some(buy_id))
                    .cloned()
                    .unwrap();
                assert_eq!(replenishment.side, OrderSide::Sell);
                assert_eq!(replenishment.price, 100.0);
                assert!(!replenishment.is_entry);
                assert_eq!(replenishment.status, OrderStatus::Pending);

                // BUY fill records a zero-profit trade
                let trades = state.trades_for(sid);
                assert_eq!(trades.len(), 1);
                assert_eq!(trades[0].profit, 0.0);
                assert_eq!(trades[0].price, 89.5);
                assert_eq!(state.strategy(sid).unwrap().total_trades, 1);
            })
            .await;

        // The replenishment order is being tracked
        assert!(h
            .detector
            .pending_keys()
            .iter()
            .any(|k| k.side == OrderSide::Sell && k.price_ticks == 100_000));
    }

    #[tokio::test]
    async fn test_sell_fill_realizes_profit_of_paired_buy() {
        let h = harness();
        let sid = running_strategy(&h).await;

        let (buy_id, sell_id) = h
            .ledger
            .write(|state| {
                let symbol = state.strategy(sid)?.symbol.clone();
                let buy_id = state.create_order(OrderDraft {
                    strategy_id: Some(sid),
                    symbol: symbol.clone(),
                    side: OrderSide::Buy,
                    price: 100.0,
                    qty: 0.01,
                    kind: OrderKind::Limit,
                    grid_level: Some(1),
                    paired_order_id: None,
                    is_entry: true,
                });
                state.order_mut(buy_id)?.mark_filled()?;
                let sell_id = state.create_order(OrderDraft {
                    strategy_id: Some(sid),
                    symbol,
                    side: OrderSide::Sell,
                    price: 110.0,
                    qty: 0.01,
                    kind: OrderKind::Limit,
                    grid_level: Some(2),
                    paired_order_id: Some(buy_id),
                    is_entry: false,
                });
                Ok((buy_id, sell_id))
            })
            .await
            .unwrap();

        h.engine
            .process_fill(fill_event(OrderSide::Sell, 110.0, sell_id, 110.2))
            .await
            .unwrap();

        h.ledger
            .read(|state| {
                let trades = state.trades_for(sid);
                assert_eq!(trades.len(), 1);
                assert!((trades[0].profit - 0.10).abs() < 1e-9);
                assert!((state.strategy(sid).unwrap().total_profit - 0.10).abs() < 1e-9);

                // SELL replenishes an unpaired BUY one step down
                let replenishment = state
                    .orders_for(sid)
                    .into_iter()
                    .find(|o| o.side == OrderSide::Buy && o.status == OrderStatus::Pending)
                    .cloned()
                    .unwrap();
                assert_eq!(replenishment.price, 100.0);
                assert!(replenishment.paired_order_id.is_none());
                assert!(replenishment.is_entry);
            })
            .await;
    }

    #[tokio::test]
    async fn test_fill_at_band_edge_retires_rung() {
        let h = harness();
        let sid = running_strategy(&h).await;

        let buy_id = h
            .ledger
            .write(|state| {
                Ok(state.create_order(OrderDraft {
                    strategy_id: Some(sid),
                    symbol: "BTCUSDT".into(),
                    side: OrderSide::Buy,
                    price: 110.0,
                    qty: 50.0,
                    kind: OrderKind::Limit,
                    grid_level: Some(2),
                    paired_order_id: None,
                    is_entry: true,
                }))
            })
            .await
            .unwrap();

        h.engine
            .process_fill(fill_event(OrderSide::Buy, 110.0, buy_id, 110.0))
            .await
            .unwrap();

        // 110 + 10 > upper bound: no replacement is created
        h.ledger
            .read(|state| {
                assert_eq!(state.orders_for(sid).len(), 1);
                assert_eq!(state.trades_for(sid).len(), 1);
            })
            .await;
        assert_eq!(h.detector.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_stop_cancels_all_pending_and_trackers() {
        let h = harness();
        let sid = running_strategy(&h).await;

        for price in [90.0, 100.0, 110.0] {
            let order_id = h
                .ledger
                .write(|state| {
                    Ok(state.create_order(OrderDraft {
                        strategy_id: Some(sid),
                        symbol: "BTCUSDT".into(),
                        side: OrderSide::Buy,
                        price,
                        qty: 50.0,
                        kind: OrderKind::Limit,
                        grid_level: None,
                        paired_order_id: None,
                        is_entry: true,
                    }))
                })
                .await
                .unwrap();
            h.detector
                .register(TrackerKey::new(OrderSide::Buy, price, order_id), price);
        }
        assert_eq!(h.detector.pending_count(), 3);

        let report = h.engine.stop_strategy(sid).await.unwrap();
        assert_eq!(report.cancelled_orders, 3);
        assert_eq!(h.detector.pending_count(), 0);
        assert!(h.engine.strategy_status(sid).is_none());

        h.ledger
            .read(|state| {
                for order in state.orders_for(sid) {
                    assert_eq!(order.status, OrderStatus::Cancelled);
                }
            })
            .await;
    }

    #[tokio::test]
    async fn test_stale_fill_after_stop_is_discarded() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);
        h.engine.start_strategy(sid).await.unwrap();

        let buy_id = h
            .ledger
            .read(|state| {
                state
                    .orders_for(sid)
                    .iter()
                    .find(|o| o.side == OrderSide::Buy)
                    .map(|o| o.id)
                    .unwrap()
            })
            .await;

        // Stop commits first: external status flip plus engine stop
        h.engine.stop_strategy(sid).await.unwrap();
        h.ledger
            .write(|state| state.strategy_mut(sid)?.set_status(StrategyStatus::Stopped))
            .await
            .unwrap();

        // The racing fill reloads, sees STOPPED, and drops everything
        h.engine
            .process_fill(fill_event(OrderSide::Buy, 90.0, buy_id, 89.5))
            .await
            .unwrap();

        h.ledger
            .read(|state| {
                assert!(state.trades_for(sid).is_empty());
                assert_eq!(state.orders_for(sid).len(), 2); // no replenishment
                assert_eq!(state.order(buy_id).unwrap().status, OrderStatus::Cancelled);
            })
            .await;
    }

    #[tokio::test]
    async fn test_fill_while_paused_is_discarded() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);
        h.engine.start_strategy(sid).await.unwrap();

        h.ledger
            .write(|state| state.strategy_mut(sid)?.set_status(StrategyStatus::Paused))
            .await
            .unwrap();

        let buy_id = h
            .ledger
            .read(|state| {
                state
                    .orders_for(sid)
                    .iter()
                    .find(|o| o.side == OrderSide::Buy)
                    .map(|o| o.id)
                    .unwrap()
            })
            .await;

        h.engine
            .process_fill(fill_event(OrderSide::Buy, 90.0, buy_id, 89.5))
            .await
            .unwrap();

        h.ledger
            .read(|state| {
                assert!(state.trades_for(sid).is_empty());
                assert_eq!(state.order(buy_id).unwrap().status, OrderStatus::Pending);
            })
            .await;
    }

    #[tokio::test]
    async fn test_replenishment_gateway_failure_marks_failed() {
        let h = harness();
        let sid = running_strategy(&h).await;
        h.feed.record(100.0);
        h.engine.start_strategy(sid).await.unwrap();

        let buy_id = h
            .ledger
            .read(|state| {
                state
                    .orders_for(sid)
                    .iter()
                    .find(|o| o.side == OrderSide::Buy)
                    .map(|o| o.id)
                    .unwrap()
            })
            .await;

        h.gateway.set_should_fail(true);
        h.engine
            .process_fill(fill_event(OrderSide::Buy, 90.0, buy_id, 89.5))
            .await
            .unwrap();

        h.ledger
            .read(|state| {
                let replenishment = state
                    .orders_for(sid)
                    .into_iter()
                    .find(|o| o.paired_order_id == Some(buy_id))
                    .cloned()
                    .unwrap();
                // One uniform policy: unplaced means FAILED, here as in the
                // initial ladder build
                assert_eq!(replenishment.status, OrderStatus::Failed);
            })
            .await;
    }
}
