//! Persisted trading entities and their state transitions

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::{EngineError, EngineResult};

/// Order side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderSide {
    Buy,
    Sell,
}

impl OrderSide {
    pub fn as_str(&self) -> &'static str {
        match self {
            OrderSide::Buy => "BUY",
            OrderSide::Sell => "SELL",
        }
    }
}

/// Order kind as understood by the venue
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderKind {
    Limit,
    Market,
}

/// Lifecycle status of an order.
///
/// Transitions only move forward: Submitting -> {Pending, Failed} and
/// Pending -> {Filled, Cancelled, Failed}. Filled, Cancelled and Failed
/// are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OrderStatus {
    Submitting,
    Pending,
    Filled,
    Cancelled,
    Failed,
}

impl OrderStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
        )
    }

    fn can_become(&self, next: OrderStatus) -> bool {
        match self {
            OrderStatus::Submitting => {
                matches!(next, OrderStatus::Pending | OrderStatus::Failed)
            }
            OrderStatus::Pending => matches!(
                next,
                OrderStatus::Filled | OrderStatus::Cancelled | OrderStatus::Failed
            ),
            _ => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OrderStatus::Submitting => "SUBMITTING",
            OrderStatus::Pending => "PENDING",
            OrderStatus::Filled => "FILLED",
            OrderStatus::Cancelled => "CANCELLED",
            OrderStatus::Failed => "FAILED",
        }
    }
}

/// Strategy flavor; only the grid exists today
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyKind {
    #[default]
    Grid,
}

/// Strategy lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StrategyStatus {
    Created,
    Running,
    Paused,
    Stopped,
}

impl StrategyStatus {
    fn can_become(&self, next: StrategyStatus) -> bool {
        match self {
            StrategyStatus::Created => matches!(next, StrategyStatus::Running),
            StrategyStatus::Running => {
                matches!(next, StrategyStatus::Paused | StrategyStatus::Stopped)
            }
            StrategyStatus::Paused => {
                matches!(next, StrategyStatus::Running | StrategyStatus::Stopped)
            }
            StrategyStatus::Stopped => false,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StrategyStatus::Created => "CREATED",
            StrategyStatus::Running => "RUNNING",
            StrategyStatus::Paused => "PAUSED",
            StrategyStatus::Stopped => "STOPPED",
        }
    }
}

/// A configured grid trading plan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Strategy {
    pub id: u64,
    pub name: String,
    pub symbol: String,
    #[serde(default)]
    pub kind: StrategyKind,
    pub status: StrategyStatus,

    pub lower_price: f64,
    pub upper_price: f64,
    pub grid_count: u32,
    /// Investment per grid, denominated in the quote currency
    pub investment_per_grid: f64,

    /// Stored for the record; not enforced by the engine
    pub stop_loss: Option<f64>,
    pub take_profit: Option<f64>,
    pub max_orders: u32,

    pub total_profit: f64,
    pub total_trades: u32,

    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub stopped_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

impl Strategy {
    pub fn grid_step(&self) -> f64 {
        (self.upper_price - self.lower_price) / self.grid_count as f64
    }

    /// Band midpoint, used when no trustworthy live price exists
    pub fn mid_price(&self) -> f64 {
        (self.upper_price + self.lower_price) / 2.0
    }

    /// Apply a status transition, maintaining the timestamp invariants
    pub fn set_status(&mut self, next: StrategyStatus) -> EngineResult<()> {
        if !self.status.can_become(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }

        let now = Utc::now();
        match next {
            StrategyStatus::Running if self.started_at.is_none() => {
                self.started_at = Some(now);
            }
            StrategyStatus::Stopped => {
                self.stopped_at = Some(now);
            }
            _ => {}
        }

        self.status = next;
        self.updated_at = now;
        Ok(())
    }
}

/// One ladder rung, live or historical
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Order {
    pub id: u64,
    pub strategy_id: Option<u64>,
    pub symbol: String,
    pub side: OrderSide,
    pub price: f64,
    /// Quantity in quote currency
    pub qty: f64,
    pub kind: OrderKind,
    pub status: OrderStatus,
    pub venue_order_id: Option<String>,
    pub error_message: Option<String>,

    /// Index into the strategy's ladder
    pub grid_level: Option<i32>,
    /// Weak back-reference to the order this one replenishes
    pub paired_order_id: Option<u64>,
    /// True for original ladder orders, false for replenishment sells
    pub is_entry: bool,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Order {
    fn transition(&mut self, next: OrderStatus) -> EngineResult<()> {
        if !self.status.can_become(next) {
            return Err(EngineError::InvalidTransition {
                from: self.status.as_str().to_string(),
                to: next.as_str().to_string(),
            });
        }
        self.status = next;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn mark_pending(&mut self) -> EngineResult<()> {
        self.transition(OrderStatus::Pending)
    }

    pub fn mark_filled(&mut self) -> EngineResult<()> {
        self.transition(OrderStatus::Filled)
    }

    pub fn mark_cancelled(&mut self) -> EngineResult<()> {
        self.transition(OrderStatus::Cancelled)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> EngineResult<()> {
        self.transition(OrderStatus::Failed)?;
        self.error_message = Some(error.into());
        Ok(())
    }
}

/// Immutable record created exactly once per fill
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeHistory {
    pub id: u64,
    pub strategy_id: u64,
    pub order_id: u64,
    pub side: OrderSide,
    pub price: f64,
    pub qty: f64,
    /// Realized profit; zero unless a SELL closing a paired BUY
    pub profit: f64,
    pub filled_at: DateTime<Utc>,
}
