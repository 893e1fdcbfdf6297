//! Domain types: orders, tasks, market data.

pub mod market;
pub mod order;
pub mod task;

pub use market::{BookLevel, KlineBar, MarketDataEnvelope, MarketDataKind, OrderBook, TradeTick};
pub use order::{
    Direction, Order, OrderAction, OrderNotes, OrderResponse, OrderStatus, OrderType,
};
pub use task::{
    AlarmCode, AlgorithmKind, CurrencyType, ExecutionMode, PairRule, StrategyParams, SymbolTriple,
    Task, TaskStatus, TradeRole, VwapOrderMode,
};
