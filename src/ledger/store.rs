//! Ledger store - the sole writer of persisted trading state
//!
//! Strategies, orders and trade history live in one arena-style state
//! behind a lock. Writers acquire the lock with a bounded try-retry so
//! sustained contention surfaces as a retryable `StoreBusy` instead of
//! an unbounded stall. When a ledger file is configured, every committed
//! write is persisted as JSON via write-to-temp-then-rename.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::Utc;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;

use crate::errors::{EngineError, EngineResult};

use super::entities::{
    Order, OrderKind, OrderSide, OrderStatus, Strategy, StrategyKind, StrategyStatus, TradeHistory,
};

const LOCK_ATTEMPTS: u32 = 10;
const LOCK_BACKOFF_MS: u64 = 50;

/// Parameters for creating a strategy
#[derive(Debug, Clone, Deserialize)]
pub struct NewStrategy {
    pub name: String,
    #[serde(default = "default_symbol")]
    pub symbol: String,
    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_count: u32,
    pub investment_per_grid: f64,
    #[serde(default)]
    pub stop_loss: Option<f64>,
    #[serde(default)]
    pub take_profit: Option<f64>,
    #[serde(default = "default_max_orders")]
    pub max_orders: u32,
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_max_orders() -> u32 {
    50
}

impl NewStrategy {
    pub fn validate(&self) -> EngineResult<()> {
        if self.upper_price <= self.lower_price {
            return Err(EngineError::InvalidConfig(
                "upper price must be greater than lower price".into(),
            ));
        }
        if self.grid_count < 2 {
            return Err(EngineError::InvalidConfig(
                "grid count must be at least 2".into(),
            ));
        }
        if self.investment_per_grid <= 0.0 {
            return Err(EngineError::InvalidConfig(
                "investment per grid must be positive".into(),
            ));
        }
        Ok(())
    }
}

/// Parameters for creating an order
#[derive(Debug, Clone)]
pub struct OrderDraft {
    pub strategy_id: Option<u64>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    pub kind: OrderKind,
    pub grid_level: Option<i32>,
    pub paired_order_id: Option<u64>,
    pub is_entry: bool,
}

/// The full persisted trading state
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct LedgerState {
    strategies: HashMap<u64, Strategy>,
    orders: HashMap<u64, Order>,
    trades: Vec<TradeHistory>,
    next_strategy_id: u64,
    next_order_id: u64,
    next_trade_id: u64,
}

impl LedgerState {
    /// Create a strategy in CREATED status, returning its assigned id
    pub fn create_strategy(&mut self, new: NewStrategy) -> EngineResult<u64> {
        new.validate()?;

        self.next_strategy_id += 1;
        let id = self.next_strategy_id;
        let now = Utc::now();

        self.strategies.insert(
            id,
            Strategy {
                id,
                name: new.name,
                symbol: new.symbol,
                kind: StrategyKind::Grid,
                status: StrategyStatus::Created,
                lower_price: new.lower_price,
                upper_price: new.upper_price,
                grid_count: new.grid_count,
                investment_per_grid: new.investment_per_grid,
                stop_loss: new.stop_loss,
                take_profit: new.take_profit,
                max_orders: new.max_orders,
                total_profit: 0.0,
                total_trades: 0,
                created_at: now,
                started_at: None,
                stopped_at: None,
                updated_at: now,
            },
        );

        Ok(id)
    }

    pub fn strategy(&self, id: u64) -> EngineResult<&Strategy> {
        self.strategies
            .get(&id)
            .ok_or(EngineError::StrategyNotFound(id))
    }

    pub fn strategy_mut(&mut self, id: u64) -> EngineResult<&mut Strategy> {
        self.strategies
            .get_mut(&id)
            .ok_or(EngineError::StrategyNotFound(id))
    }

    pub fn strategies(&self) -> impl Iterator<Item = &Strategy> {
        self.strategies.values()
    }

    /// Replace a strategy's configuration. Only allowed before it ever ran.
    pub fn update_strategy(&mut self, id: u64, new: NewStrategy) -> EngineResult<()> {
        new.validate()?;
        let strategy = self.strategy_mut(id)?;
        if strategy.status != StrategyStatus::Created {
            return Err(EngineError::WrongStrategyStatus {
                id,
                status: strategy.status.as_str().to_string(),
                expected: StrategyStatus::Created.as_str().to_string(),
            });
        }

        strategy.name = new.name;
        strategy.symbol = new.symbol;
        strategy.lower_price = new.lower_price;
        strategy.upper_price = new.upper_price;
        strategy.grid_count = new.grid_count;
        strategy.investment_per_grid = new.investment_per_grid;
        strategy.stop_loss = new.stop_loss;
        strategy.take_profit = new.take_profit;
        strategy.max_orders = new.max_orders;
        strategy.updated_at = Utc::now();
        Ok(())
    }

    /// Delete a strategy and cascade its orders and trades.
    ///
    /// Only allowed in CREATED or STOPPED status.
    pub fn delete_strategy(&mut self, id: u64) -> EngineResult<()> {
        let strategy = self.strategy(id)?;
        if !matches!(
            strategy.status,
            StrategyStatus::Created | StrategyStatus::Stopped
        ) {
            return Err(EngineError::WrongStrategyStatus {
                id,
                status: strategy.status.as_str().to_string(),
                expected: "CREATED or STOPPED".to_string(),
            });
        }

        self.trades.retain(|t| t.strategy_id != id);
        self.orders.retain(|_, o| o.strategy_id != Some(id));
        self.strategies.remove(&id);
        Ok(())
    }

    /// Create an order in PENDING status, assigning its id immediately so
    /// side effects (gateway placement, tracker registration) can reference
    /// it before the batch finishes.
    pub fn create_order(&mut self, draft: OrderDraft) -> u64 {
        self.next_order_id += 1;
        let id = self.next_order_id;
        let now = Utc::now();

        self.orders.insert(
            id,
            Order {
                id,
                strategy_id: draft.strategy_id,
                symbol: draft.symbol,
                side: draft.side,
                price: draft.price,
                qty: draft.qty,
                kind: draft.kind,
                status: OrderStatus::Pending,
                venue_order_id: None,
                error_message: None,
                grid_level: draft.grid_level,
                paired_order_id: draft.paired_order_id,
                is_entry: draft.is_entry,
                created_at: now,
                updated_at: now,
            },
        );

        id
    }

    pub fn order(&self, id: u64) -> EngineResult<&Order> {
        self.orders.get(&id).ok_or(EngineError::OrderNotFound(id))
    }

    pub fn order_mut(&mut self, id: u64) -> EngineResult<&mut Order> {
        self.orders
            .get_mut(&id)
            .ok_or(EngineError::OrderNotFound(id))
    }

    /// Every order across all strategies, by id
    pub fn orders(&self) -> Vec<&Order> {
        let mut orders: Vec<&Order> = self.orders.values().collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    pub fn orders_for(&self, strategy_id: u64) -> Vec<&Order> {
        let mut orders: Vec<&Order> = self
            .orders
            .values()
            .filter(|o| o.strategy_id == Some(strategy_id))
            .collect();
        orders.sort_by_key(|o| o.id);
        orders
    }

    pub fn pending_order_ids(&self, strategy_id: u64) -> Vec<u64> {
        let mut ids: Vec<u64> = self
            .orders
            .values()
            .filter(|o| o.strategy_id == Some(strategy_id) && o.status == OrderStatus::Pending)
            .map(|o| o.id)
            .collect();
        ids.sort_unstable();
        ids
    }

    /// Append an immutable trade record
    pub fn record_trade(
        &mut self,
        strategy_id: u64,
        order_id: u64,
        side: OrderSide,
        price: f64,
        qty: f64,
        profit: f64,
    ) -> u64 {
        self.next_trade_id += 1;
        let id = self.next_trade_id;

        self.trades.push(TradeHistory {
            id,
            strategy_id,
            order_id,
            side,
            price,
            qty,
            profit,
            filled_at: Utc::now(),
        });

        id
    }

    pub fn trades_for(&self, strategy_id: u64) -> Vec<&TradeHistory> {
        self.trades
            .iter()
            .filter(|t| t.strategy_id == strategy_id)
            .collect()
    }

    fn load_from_file(path: impl AsRef<Path>) -> EngineResult<Self> {
        let content = std::fs::read_to_string(path)?;
        let state: Self = serde_json::from_str(&content)?;
        Ok(state)
    }

    /// Write to temp, then rename
    fn save_to_file_atomic(&self, path: &Path) -> EngineResult<()> {
        let temp_path = path.with_extension("tmp");
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(&temp_path, content)?;
        std::fs::rename(&temp_path, path)?;
        Ok(())
    }
}

/// Ledger facade: per-operation transactions over the arena state
pub struct Ledger {
    state: RwLock<LedgerState>,
    save_path: Option<PathBuf>,
}

impl Ledger {
    /// In-memory ledger, no persistence
    pub fn in_memory() -> Self {
        Self {
            state: RwLock::new(LedgerState::default()),
            save_path: None,
        }
    }

    /// Load state from file or start empty
    pub fn load_or_create(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let state = if path.exists() {
            match LedgerState::load_from_file(&path) {
                Ok(state) => {
                    info!(
                        "Loaded ledger from {:?}: {} strategies, {} orders",
                        path,
                        state.strategies.len(),
                        state.orders.len()
                    );
                    state
                }
                Err(e) => {
                    warn!("Failed to load ledger: {}, starting empty", e);
                    LedgerState::default()
                }
            }
        } else {
            info!("No ledger file at {:?}, starting empty", path);
            LedgerState::default()
        };

        Self {
            state: RwLock::new(state),
            save_path: Some(path),
        }
    }

    /// Read-only access
    pub async fn read<R>(&self, f: impl FnOnce(&LedgerState) -> R) -> R {
        let state = self.state.read().await;
        f(&state)
    }

    /// One read-modify-write transaction.
    ///
    /// The lock is acquired with a bounded try-retry; exhaustion surfaces
    /// as `StoreBusy`, which callers may retry. The closure's error aborts
    /// the transaction without persisting (in-memory mutations made before
    /// the error are the closure's responsibility to avoid).
    pub async fn write<R>(
        &self,
        f: impl FnOnce(&mut LedgerState) -> EngineResult<R>,
    ) -> EngineResult<R> {
        for attempt in 1..=LOCK_ATTEMPTS {
            match self.state.try_write() {
                Ok(mut state) => {
                    let result = f(&mut state)?;
                    if let Some(path) = &self.save_path {
                        state.save_to_file_atomic(path)?;
                        debug!("Ledger persisted to {:?}", path);
                    }
                    return Ok(result);
                }
                Err(_) => {
                    debug!(
                        "Ledger busy (attempt {}/{}), backing off",
                        attempt, LOCK_ATTEMPTS
                    );
                    tokio::time::sleep(Duration::from_millis(LOCK_BACKOFF_MS)).await;
                }
            }
        }

        warn!("Ledger write gave up after {} attempts", LOCK_ATTEMPTS);
        Err(EngineError::StoreBusy {
            attempts: LOCK_ATTEMPTS,
        })
    }
}
