//! Errors - エラー型と分類
//!
//! - StoreError: task store（open / query / update）の失敗
//! - PublishError: broker への接続・配送の失敗
//! - DispatchError: 1 回の invocation を中断させる失敗（fatal のみ）
//!
//! publish / update の失敗は task 単位で回復可能なので DispatchError には含めません。

use std::time::Duration;

use thiserror::Error;

use super::TaskRef;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("failed to open task store: {0}")]
    Connect(String),

    #[error("task query failed: {0}")]
    Query(String),

    #[error("document {reference} is corrupt: {reason}")]
    Corrupt { reference: TaskRef, reason: String },

    #[error("status update failed for {reference}: {reason}")]
    Update { reference: TaskRef, reason: String },
}

#[derive(Debug, Error)]
pub enum PublishError {
    #[error("failed to connect to broker {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error("broker did not accept the connection within {0:?}")]
    ConnectTimeout(Duration),

    #[error("publish to {topic} was rejected: {reason}")]
    Rejected { topic: String, reason: String },

    #[error("no acknowledgment for {topic} within {timeout:?}")]
    AckTimeout { topic: String, timeout: Duration },

    #[error("broker connection lost: {0}")]
    ConnectionLost(String),
}

/// DispatchError は invocation 全体を失敗させるエラー
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("failed to create task store client: {0}")]
    StoreUnavailable(#[source] StoreError),

    /// Tasks updated before the failure stay processed.
    #[error("failed to iterate tasks ({processed} processed before the failure): {source}")]
    Enumeration {
        processed: usize,
        #[source]
        source: StoreError,
    },
}

impl DispatchError {
    /// Short message safe to hand back to the trigger's caller.
    pub fn public_message(&self) -> &'static str {
        match self {
            DispatchError::StoreUnavailable(_) => "Failed to create task store client",
            DispatchError::Enumeration { .. } => "Failed to iterate tasks",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn public_messages_hide_details() {
        let err = DispatchError::StoreUnavailable(StoreError::Connect("secret dsn".into()));
        assert_eq!(err.public_message(), "Failed to create task store client");
        assert!(err.to_string().contains("secret dsn"));

        let err = DispatchError::Enumeration {
            processed: 2,
            source: StoreError::Query("connection reset".into()),
        };
        assert_eq!(err.public_message(), "Failed to iterate tasks");
        assert!(err.to_string().contains("2 processed"));
    }
}
