//! BrokerLink - invocation 単位の broker 接続
//!
//! 「接続できなかった」を null ではなく `Unavailable` として明示します。
//! publish は失敗しても raise せず、ログを出して PublishOutcome を返すだけです。

use std::time::Duration;

use tracing::{error, info, warn};

use crate::ports::{BrokerConnector, BrokerSession};

/// 1 回の publish の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// broker が ack した
    Delivered,

    /// 接続がないので送っていない
    Skipped,

    /// 送信または ack 待ちに失敗した
    Failed,
}

pub enum BrokerLink {
    Connected(Box<dyn BrokerSession>),
    Unavailable,
}

impl BrokerLink {
    /// 接続を試みる。失敗してもエラーにはせず、原因をログに出して Unavailable を返す
    pub async fn establish<B: BrokerConnector + ?Sized>(connector: &B) -> Self {
        match connector.connect().await {
            Ok(session) => BrokerLink::Connected(session),
            Err(e) => {
                error!(error = %e, "failed to connect to broker; publishing is unavailable for this run");
                BrokerLink::Unavailable
            }
        }
    }

    pub fn is_connected(&self) -> bool {
        match self {
            BrokerLink::Connected(session) => session.is_connected(),
            BrokerLink::Unavailable => false,
        }
    }

    pub async fn publish(&mut self, topic: &str, payload: &[u8]) -> PublishOutcome {
        let session = match self {
            BrokerLink::Connected(session) if session.is_connected() => session,
            _ => {
                warn!(topic, "broker is not connected; skipping publish");
                return PublishOutcome::Skipped;
            }
        };

        match session.publish(topic, payload).await {
            Ok(()) => {
                info!(topic, bytes = payload.len(), "published");
                PublishOutcome::Delivered
            }
            Err(e) => {
                error!(topic, error = %e, "publish failed");
                PublishOutcome::Failed
            }
        }
    }

    pub async fn close(self, grace: Duration) {
        if let BrokerLink::Connected(session) = self {
            session.disconnect(grace).await;
        }
    }
}
