//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **SqliteTaskStore / SqliteConnector**: sqlx + SQLite の task store
//! - **MqttConnector**: rumqttc による MQTT 3.1.1 接続
//! - **InMemoryTaskStore / InMemoryBroker**: テスト・開発用

pub mod inmem_broker;
pub mod inmem_store;
pub mod mqtt;
pub mod sqlite_store;

#[cfg(test)]
pub(crate) mod faulty;

pub use self::inmem_broker::{InMemoryBroker, PublishedMessage};
pub use self::inmem_store::InMemoryTaskStore;
pub use self::mqtt::MqttConnector;
pub use self::sqlite_store::{SqliteConnector, SqliteTaskStore};
