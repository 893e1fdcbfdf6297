//! Side services sharing the bus with the per-task coordinators.
//!
//! Each runs as its own single-threaded loop and is stateless across
//! restarts, except that the order service reads finished tasks' order
//! snapshots back from disk.

pub mod balance;
pub mod oms;

pub use balance::BalanceService;
pub use oms::OrderService;
