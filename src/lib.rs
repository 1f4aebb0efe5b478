#![deny(unreachable_pub)]
pub mod config;
pub mod engine;
mod errors;
pub mod feed;
pub mod gateway;
pub mod ledger;
pub mod notifier;
pub mod server;

pub use config::Settings;
pub use engine::{
    EngineSettings, FillDetector, FillEvent, GridEngine, PricePrecision, RunSnapshot, StartReport,
    StopReport, TrackerKey,
};
pub use errors::{EngineError, EngineResult};
pub use feed::{PriceFeed, PriceSample};
pub use gateway::{OrderGateway, PlacementReceipt, PlacementRequest, SimulatedGateway};
pub use ledger::{
    Ledger, NewStrategy, Order, OrderDraft, OrderKind, OrderSide, OrderStatus, Strategy,
    StrategyKind, StrategyStatus, TradeHistory,
};
pub use notifier::{EngineEvent, EventBroadcaster};
