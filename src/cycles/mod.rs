//! Cycles Module - Contest Lifecycle & Settlement
//!
//! This module owns:
//! 1. The cycle store and its conditional-write primitives
//! 2. The tick processor (phase state machine)
//! 3. Settlement, refunds, and recurrence
//! 4. The entry/comment submission paths and admin overrides
//!
//! Architecture:
//! - An external timer invokes the tick processor roughly once per second
//! - All correctness derives from guarded store writes, never in-memory state
//! - Settlement runs at most once per cycle via the `settled_at` claim

pub mod admin;
pub mod entry;
pub mod recurrence;
pub mod refund;
pub mod settlement;
pub mod store;
pub mod tick;

pub use admin::AdminOps;
pub use entry::{CommentOutcome, EntryPath, JoinOutcome};
pub use recurrence::RecurrenceScheduler;
pub use refund::RefundEngine;
pub use settlement::{
    compute_prizes, rank_points_for_position, FailedDisbursement, SettlementEngine,
    SettlementOutcome, SettlementSnapshot, SnapshotWinner,
};
pub use store::CycleStore;
pub use tick::{TickProcessor, TickSummary};
