//! The per-task strategy coordinator and its moving parts.

pub mod command;
pub mod master;
pub mod state;
pub mod status;
pub mod subscriptions;

pub use command::{CommandEnvelope, CommandKind, CommandResponse};
pub use master::{Coordinator, StrategyRuntime};
pub use state::{MasterShared, OrderRef, Outbound};
pub use status::{StatusSnapshot, StrategyStatus};
pub use subscriptions::{ChannelHealth, Subscriptions};
