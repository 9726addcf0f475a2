//! Ports - 抽象化レイヤー
//!
//! dispatch loop が外部システム（task store, broker, 時計）に触れる境界です。
//! 実装は `impls` にあります。

pub mod broker;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::broker::{BrokerConnector, BrokerSession};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{DueTaskCursor, StoreConnector, TaskStore, UpdateOutcome};
