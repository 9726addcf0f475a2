//! InMemoryBroker - 開発・テスト用の broker
//!
//! publish されたメッセージを記録するだけの broker です。
//! 接続拒否・topic 単位の ack 失敗・接続断を切り替えられるので、
//! dispatch loop の失敗系をネットワークなしで再現できます。

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::PublishError;
use crate::ports::{BrokerConnector, BrokerSession};

/// 記録された 1 件の publish
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

#[derive(Default)]
struct BrokerState {
    published: Vec<PublishedMessage>,
    rejected_topics: HashSet<String>,
    connects: usize,
    disconnects: usize,
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<BrokerState>>,
    refuse_connections: Arc<AtomicBool>,
    link_up: Arc<AtomicBool>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self {
            link_up: Arc::new(AtomicBool::new(true)),
            ..Self::default()
        }
    }

    /// 以降の connect を拒否する
    pub fn refuse_connections(&self) {
        self.refuse_connections.store(true, Ordering::SeqCst);
    }

    /// この topic への publish は ack されない
    pub async fn reject_topic(&self, topic: impl Into<String>) {
        self.state.lock().await.rejected_topics.insert(topic.into());
    }

    /// 開いている session をすべて「切断済み」にする
    pub fn sever_link(&self) {
        self.link_up.store(false, Ordering::SeqCst);
    }

    pub async fn published(&self) -> Vec<PublishedMessage> {
        self.state.lock().await.published.clone()
    }

    pub async fn connects(&self) -> usize {
        self.state.lock().await.connects
    }

    pub async fn disconnects(&self) -> usize {
        self.state.lock().await.disconnects
    }
}

#[async_trait]
impl BrokerConnector for InMemoryBroker {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, PublishError> {
        if self.refuse_connections.load(Ordering::SeqCst) {
            return Err(PublishError::Connect {
                address: "in-memory".to_string(),
                reason: "connection refused".to_string(),
            });
        }
        self.state.lock().await.connects += 1;
        self.link_up.store(true, Ordering::SeqCst);
        Ok(Box::new(InMemorySession {
            state: Arc::clone(&self.state),
            link_up: Arc::clone(&self.link_up),
        }))
    }
}

struct InMemorySession {
    state: Arc<Mutex<BrokerState>>,
    link_up: Arc<AtomicBool>,
}

#[async_trait]
impl BrokerSession for InMemorySession {
    fn is_connected(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        if !self.is_connected() {
            return Err(PublishError::ConnectionLost("link severed".to_string()));
        }
        let mut state = self.state.lock().await;
        if state.rejected_topics.contains(topic) {
            return Err(PublishError::Rejected {
                topic: topic.to_string(),
                reason: "not authorized".to_string(),
            });
        }
        state.published.push(PublishedMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        });
        Ok(())
    }

    async fn disconnect(self: Box<Self>, _grace: Duration) {
        self.state.lock().await.disconnects += 1;
    }
}
