//! Arena Backend Library
//!
//! Exposes the contest engine modules for use by the binary and tests.

pub mod cycles;
pub mod models;
pub mod wallet;

pub use cycles::{AdminOps, CycleStore, EntryPath, SettlementEngine, TickProcessor};
pub use models::{Cycle, EngineConfig, Phase, Template};
pub use wallet::AccountStore;
