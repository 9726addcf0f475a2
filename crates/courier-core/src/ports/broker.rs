//! Broker port - pub/sub broker への配送
//!
//! # 実装
//! - MqttConnector（rumqttc、本番用）
//! - InMemoryBroker（開発・テスト用）

use std::time::Duration;

use async_trait::async_trait;

use crate::domain::PublishError;

/// BrokerSession は確立済みの 1 接続
///
/// invocation の間だけ生きる。プールも永続セッションも持たない。
#[async_trait]
pub trait BrokerSession: Send {
    fn is_connected(&self) -> bool;

    /// QoS 1（at-least-once）、retain なしで publish し、ack を待つ
    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError>;

    /// `grace` の間だけ後始末を待って切断する
    async fn disconnect(self: Box<Self>, grace: Duration);
}

/// BrokerConnector は invocation ごとに 1 接続を作る
#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, PublishError>;
}
