//! MqttConnector - rumqttc を使った broker 接続
//!
//! # 実装詳細
//! - connect: ConnAck を `connect_timeout` まで待つ。失敗・timeout は PublishError
//! - 接続後は EventLoop を専用 task で回し、publish 関連のイベントだけ channel で session に流す
//! - publish: QoS 1 / retain なしで送信し、同じ packet id の PUBACK を `ack_timeout` まで待つ
//! - disconnect: DISCONNECT を送り、EventLoop task の終了を grace の間だけ待つ（超えたら abort）
//!
//! invocation ごとに clean session で 1 接続。再接続はしない。

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::config::BrokerConfig;
use crate::domain::PublishError;
use crate::ports::{BrokerConnector, BrokerSession};

const REQUEST_CHANNEL_CAPACITY: usize = 16;

pub struct MqttConnector {
    config: BrokerConfig,
}

impl MqttConnector {
    pub fn new(config: BrokerConfig) -> Self {
        Self { config }
    }
}

fn mqtt_options(config: &BrokerConfig) -> MqttOptions {
    let mut options = MqttOptions::new(
        config.client_id.clone(),
        config.address.host.clone(),
        config.address.port,
    );
    options.set_keep_alive(config.keep_alive);
    options.set_clean_session(true);
    if let Some(username) = &config.username {
        options.set_credentials(username.clone(), config.password.clone().unwrap_or_default());
    }
    options
}

async fn wait_for_connack(eventloop: &mut EventLoop) -> Result<(), ConnectionError> {
    // 拒否された ConnAck は poll が ConnectionRefused として返す
    loop {
        if let Event::Incoming(Packet::ConnAck(_)) = eventloop.poll().await? {
            return Ok(());
        }
    }
}

#[async_trait]
impl BrokerConnector for MqttConnector {
    async fn connect(&self) -> Result<Box<dyn BrokerSession>, PublishError> {
        let config = &self.config;
        let (client, mut eventloop) =
            AsyncClient::new(mqtt_options(config), REQUEST_CHANNEL_CAPACITY);

        match tokio::time::timeout(config.connect_timeout, wait_for_connack(&mut eventloop)).await
        {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                return Err(PublishError::Connect {
                    address: config.address.to_string(),
                    reason: e.to_string(),
                });
            }
            Err(_) => return Err(PublishError::ConnectTimeout(config.connect_timeout)),
        }
        debug!(broker = %config.address, client_id = %config.client_id, "broker connected");

        let connected = Arc::new(AtomicBool::new(true));
        let (events_tx, events) = mpsc::unbounded_channel();
        let driver = tokio::spawn(drive(eventloop, Arc::clone(&connected), events_tx));

        Ok(Box::new(MqttSession {
            client,
            events,
            acks: AckMatcher::default(),
            connected,
            driver,
            ack_timeout: config.ack_timeout,
        }))
    }
}

/// EventLoop task から session に渡すイベント
#[derive(Debug, PartialEq, Eq)]
enum LinkEvent {
    Sent(u16),
    Acked(u16),
    Closed(String),
}

async fn drive(
    mut eventloop: EventLoop,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<LinkEvent>,
) {
    loop {
        let event = match eventloop.poll().await {
            Ok(Event::Outgoing(Outgoing::Publish(pkid))) => LinkEvent::Sent(pkid),
            Ok(Event::Incoming(Packet::PubAck(ack))) => LinkEvent::Acked(ack.pkid),
            Ok(Event::Outgoing(Outgoing::Disconnect)) => {
                connected.store(false, Ordering::SeqCst);
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                connected.store(false, Ordering::SeqCst);
                let _ = events.send(LinkEvent::Closed(e.to_string()));
                break;
            }
        };
        if events.send(event).is_err() {
            break;
        }
    }
}

struct MqttSession {
    client: AsyncClient,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    acks: AckMatcher,
    connected: Arc<AtomicBool>,
    driver: JoinHandle<()>,
    ack_timeout: Duration,
}

/// publish 要求と EventLoop のイベントを対応づける
///
/// EventLoop は要求を受け取った順に送信するので、k 番目の `Sent` が k 番目の要求。
/// timeout した publish の `Sent` / `Acked` が channel に残っていても、
/// 次の publish がそれを自分の ack と取り違えない。
#[derive(Debug, Default)]
struct AckMatcher {
    requested: u64,
    sent_seen: u64,
    awaiting: Option<u16>,
}

impl AckMatcher {
    /// 新しい publish 要求を出したことを記録する
    fn request(&mut self) {
        self.requested += 1;
        self.awaiting = None;
    }

    /// 直近の要求が ack されたら `Some(Ok)`、接続が閉じたら `Some(Err)`
    fn observe(&mut self, event: LinkEvent) -> Option<Result<(), String>> {
        match event {
            LinkEvent::Sent(pkid) => {
                self.sent_seen += 1;
                if self.sent_seen == self.requested {
                    self.awaiting = Some(pkid);
                }
                None
            }
            LinkEvent::Acked(pkid) if self.awaiting == Some(pkid) => {
                self.awaiting = None;
                Some(Ok(()))
            }
            LinkEvent::Acked(_) => None,
            LinkEvent::Closed(reason) => Some(Err(reason)),
        }
    }
}

impl MqttSession {
    /// 直近に要求した publish の PUBACK を待つ
    async fn await_ack(&mut self) -> Result<(), String> {
        while let Some(event) = self.events.recv().await {
            if let Some(result) = self.acks.observe(event) {
                return result;
            }
        }
        Err("event loop stopped".to_string())
    }
}

#[async_trait]
impl BrokerSession for MqttSession {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    async fn publish(&mut self, topic: &str, payload: &[u8]) -> Result<(), PublishError> {
        self.client
            .publish(topic, QoS::AtLeastOnce, false, payload.to_vec())
            .await
            .map_err(|e| PublishError::Rejected {
                topic: topic.to_string(),
                reason: e.to_string(),
            })?;
        self.acks.request();

        let timeout = self.ack_timeout;
        match tokio::time::timeout(timeout, self.await_ack()).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(reason)) => Err(PublishError::ConnectionLost(reason)),
            Err(_) => Err(PublishError::AckTimeout {
                topic: topic.to_string(),
                timeout,
            }),
        }
    }

    async fn disconnect(self: Box<Self>, grace: Duration) {
        let MqttSession {
            client, mut driver, ..
        } = *self;
        if let Err(e) = client.disconnect().await {
            debug!(error = %e, "disconnect request was not delivered");
        }
        if tokio::time::timeout(grace, &mut driver).await.is_err() {
            driver.abort();
        }
    }
}
