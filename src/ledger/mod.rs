//! Order ledger and balance reconciliation.
//!
//! The coordinator owns one [`OrderLedger`] per task and a pair of
//! [`BalanceBook`]s per `exchange|account`. Algorithms never touch these
//! directly; they read and mutate through the strategy context.

pub mod balance;
pub mod orders;

pub use balance::{BalanceBook, BalancePair, BalanceRecord};
pub use orders::{LedgerOutcome, OrderEvent, OrderLedger, OrderSnapshot, RefIdGen};
