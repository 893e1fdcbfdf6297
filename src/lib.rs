pub mod bus;
pub mod config;
pub mod coordinator;
pub mod domain;
pub mod error;
pub mod gateway;
pub mod ledger;
pub mod persistence;
pub mod report;
pub mod services;
pub mod strategy;
pub mod util;

pub use bus::{Bus, BusMessage, ChannelPlan, InMemoryBus};
pub use config::AppConfig;
pub use coordinator::{Coordinator, MasterShared, StrategyRuntime};
pub use domain::{
    AlgorithmKind, Direction, Order, OrderAction, OrderResponse, OrderStatus, StrategyParams,
    Task, TaskStatus,
};
pub use error::{GatewayErrorKind, Result, SlicerError};
pub use gateway::{SimFeed, SimGateway};
pub use ledger::{BalanceBook, BalancePair, LedgerOutcome, OrderEvent, OrderLedger};
pub use persistence::SnapshotStore;
pub use report::{NoopReportSink, OrderStats, ReportSink};
pub use services::{BalanceService, OrderService};
pub use strategy::{Algorithm, StrategyCtx, StrategyState};
