//! Order ledger - entities, state transitions and the persisted store

mod entities;
mod store;

pub use entities::{
    Order, OrderKind, OrderSide, OrderStatus, Strategy, StrategyKind, StrategyStatus, TradeHistory,
};
pub use store::{Ledger, LedgerState, NewStrategy, OrderDraft};
