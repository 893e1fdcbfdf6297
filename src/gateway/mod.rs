//! Simulation environment: a matching gateway and a synthetic market
//! data feed, both speaking the real wire protocol over the bus. Tasks
//! flagged `test_mode` route their trade and position traffic here via
//! the `Test` channel prefix.

pub mod feed;
pub mod sim;

pub use feed::SimFeed;
pub use sim::SimGateway;
