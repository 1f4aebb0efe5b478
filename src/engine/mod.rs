//! Grid strategy execution engine

pub mod calculator;
mod detector;
mod executor;

pub use calculator::PricePrecision;
pub use detector::{FillDetector, FillEvent, TrackerKey, DEFAULT_CONFIRM_SECS};
pub use executor::{EngineSettings, GridEngine, RunSnapshot, StartReport, StopReport};
