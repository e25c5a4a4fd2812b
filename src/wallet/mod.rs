//! Wallet Module - Account Balances & Ledger
//!
//! One balance per user, shared across all cycles. Every mutation is an
//! atomic in-database increment, never a read-modify-write, because
//! concurrent settlements may touch the same user.

pub mod accounts;

pub use accounts::{Account, AccountStore, LedgerEntry, LedgerKind};
