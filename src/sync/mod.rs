pub mod depth; // order-book instantiation
pub mod engine; // generic reconciliation state machine
pub mod trades; // trade-history instantiation


pub use depth::{spawn_depth_engine, DepthBaseline, DepthSync};
pub use engine::{EngineHandle, EngineMetrics, Reconcile, SnapshotSource, SyncState};
pub use trades::{spawn_trade_engine, TradeBaseline, TradeSync};
