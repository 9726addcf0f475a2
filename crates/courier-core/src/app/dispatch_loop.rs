//! Dispatcher - due task を broker に流して processed にするループ
//!
//! # フロー（1 invocation）
//! 1. StoreConnector::open() で store client を作る（失敗は fatal）
//! 2. Clock::now() を 1 回だけ読む（batch 全体の eligibility を固定）
//! 3. BrokerLink を 1 本張る（張れなくても続行、publish は no-op になる）
//! 4. TaskStore::query_due_tasks() を 1 件ずつ読み、publish → mark_processed
//! 5. 列挙エラーで即中断（それまでの更新はロールバックしない）
//! 6. 成否にかかわらず broker を切断し、store を close してから結果を返す
//!
//! task の状態遷移: discovered → publish-attempted → {updated, update-failed}
//!
//! 並行 invocation は排他しない。同じ task が 2 回 publish されることはあるが、
//! mark_processed が compare-and-set なので processed として数えるのは 1 回だけ。

use tracing::{debug, error, info, warn};

use super::publisher::{BrokerLink, PublishOutcome};
use super::status::DispatchReport;
use crate::config::{DeliveryPolicy, DispatchOptions};
use crate::domain::{DispatchError, TaskDocument};
use crate::ports::{BrokerConnector, Clock, StoreConnector, TaskStore, UpdateOutcome};

pub struct Dispatcher<S, B, K> {
    stores: S,
    broker: B,
    clock: K,
    options: DispatchOptions,
}

impl<S, B, K> Dispatcher<S, B, K>
where
    S: StoreConnector,
    B: BrokerConnector,
    K: Clock,
{
    pub fn new(stores: S, broker: B, clock: K, options: DispatchOptions) -> Self {
        Self {
            stores,
            broker,
            clock,
            options,
        }
    }

    /// 1 回分の dispatch を実行する
    pub async fn run(&self) -> Result<DispatchReport, DispatchError> {
        let store = self.stores.open().await.map_err(|e| {
            error!(error = %e, "failed to create task store client");
            DispatchError::StoreUnavailable(e)
        })?;

        let now = self.clock.now();
        let mut link = BrokerLink::establish(&self.broker).await;

        let result = self.drain(&store, &mut link, now).await;

        link.close(self.options.disconnect_grace).await;
        store.close().await;

        match &result {
            Ok(report) => info!(
                processed = report.processed,
                delivered = report.delivered,
                publish_skipped = report.publish_skipped,
                publish_failed = report.publish_failed,
                advanced_unconfirmed = report.advanced_unconfirmed,
                held_back = report.held_back,
                update_failed = report.update_failed,
                conflicts = report.conflicts,
                malformed = report.malformed,
                "task check completed"
            ),
            Err(e) => error!(error = %e, "task check aborted"),
        }
        result
    }

    async fn drain(
        &self,
        store: &S::Store,
        link: &mut BrokerLink,
        now: chrono::DateTime<chrono::Utc>,
    ) -> Result<DispatchReport, DispatchError> {
        let mut report = DispatchReport::new(now);
        let mut cursor = store
            .query_due_tasks(now)
            .await
            .map_err(|source| DispatchError::Enumeration {
                processed: 0,
                source,
            })?;

        loop {
            let document = match cursor.next().await {
                Ok(Some(document)) => document,
                Ok(None) => break,
                Err(source) => {
                    error!(error = %source, processed = report.processed, "failed to iterate tasks");
                    return Err(DispatchError::Enumeration {
                        processed: report.processed,
                        source,
                    });
                }
            };
            self.dispatch_one(store, link, document, &mut report).await;
        }

        Ok(report)
    }

    async fn dispatch_one(
        &self,
        store: &S::Store,
        link: &mut BrokerLink,
        document: TaskDocument,
        report: &mut DispatchReport,
    ) {
        let reference = &document.reference;
        let task = match document.decode() {
            Ok(task) => task,
            Err(e) => {
                warn!(task = %reference, error = %e, "skipping malformed task; it stays pending");
                report.malformed += 1;
                return;
            }
        };

        info!(task = %reference, topic = %task.topic, "processing task");
        debug!(task = %reference, payload = %task.message, "task payload");

        let outcome = link.publish(&task.topic, task.message.as_bytes()).await;
        match outcome {
            PublishOutcome::Delivered => report.delivered += 1,
            PublishOutcome::Skipped => report.publish_skipped += 1,
            PublishOutcome::Failed => report.publish_failed += 1,
        }

        let unconfirmed = outcome != PublishOutcome::Delivered;
        if unconfirmed && self.options.delivery_policy == DeliveryPolicy::RequireDelivery {
            warn!(task = %reference, ?outcome, "delivery not confirmed; leaving task pending");
            report.held_back += 1;
            return;
        }

        match store.mark_processed(reference).await {
            Ok(UpdateOutcome::Applied) => {
                report.processed += 1;
                if unconfirmed {
                    warn!(task = %reference, ?outcome, "marked processed without confirmed delivery");
                    report.advanced_unconfirmed += 1;
                }
            }
            Ok(UpdateOutcome::NotPending) => {
                warn!(task = %reference, "task was no longer pending; another run updated it first");
                report.conflicts += 1;
            }
            Err(e) => {
                error!(task = %reference, error = %e, "failed to update task status; it stays pending");
                report.update_failed += 1;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{TaskRecord, TaskRef, TaskStatus};
    use crate::impls::faulty::{FaultyStore, UnreachableStore};
    use crate::impls::{InMemoryBroker, InMemoryTaskStore};
    use crate::ports::FixedClock;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use rstest::rstest;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noon() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 12, 0, 0).unwrap()
    }

    fn past(minutes: i64) -> DateTime<Utc> {
        noon() - Duration::minutes(minutes)
    }

    fn dispatcher<S: StoreConnector>(
        stores: S,
        broker: InMemoryBroker,
        policy: DeliveryPolicy,
    ) -> Dispatcher<S, InMemoryBroker, FixedClock> {
        let options = DispatchOptions {
            delivery_policy: policy,
            ..DispatchOptions::default()
        };
        Dispatcher::new(stores, broker, FixedClock::new(noon()), options)
    }

    async fn seed_due(store: &InMemoryTaskStore, n: usize) -> Vec<TaskRef> {
        let mut refs = Vec::new();
        for i in 0..n {
            let task = TaskRecord::pending(past(i as i64 + 1), format!("topic/{i}"), format!("m{i}"));
            refs.push(store.insert(&task).await);
        }
        refs
    }

    async fn count_with_status(store: &InMemoryTaskStore, refs: &[TaskRef], status: TaskStatus) -> usize {
        let mut count = 0;
        for reference in refs {
            if store.status_of(reference).await == Some(status) {
                count += 1;
            }
        }
        count
    }

    #[tokio::test]
    async fn only_due_pending_task_is_published_and_updated() {
        let store = InMemoryTaskStore::new();
        let a = store
            .insert(&TaskRecord::pending(past(5), "home/lamp", "on"))
            .await;
        let b = store
            .insert(&TaskRecord::pending(noon() + Duration::minutes(5), "home/fan", "off"))
            .await;
        let mut done = TaskRecord::pending(past(5), "home/door", "lock");
        done.status = TaskStatus::Processed;
        let c = store.insert(&done).await;
        let c_before = store.get(&c).await;

        let broker = InMemoryBroker::new();
        let report = dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.to_string(), "Task check completed. 1 tasks processed.");

        let published = broker.published().await;
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "home/lamp");
        assert_eq!(published[0].payload, b"on".to_vec());

        assert_eq!(store.status_of(&a).await, Some(TaskStatus::Processed));
        assert_eq!(store.status_of(&b).await, Some(TaskStatus::Pending));
        assert_eq!(store.get(&c).await, c_before);
    }

    #[tokio::test]
    async fn second_run_processes_nothing() {
        let store = InMemoryTaskStore::new();
        seed_due(&store, 3).await;
        let broker = InMemoryBroker::new();
        let dispatcher = dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance);

        assert_eq!(dispatcher.run().await.unwrap().processed, 3);
        assert_eq!(dispatcher.run().await.unwrap().processed, 0);
        assert_eq!(broker.published().await.len(), 3);
    }

    #[tokio::test]
    async fn payload_is_delivered_verbatim() {
        let store = InMemoryTaskStore::new();
        let payload = "{\"temp\": 21.5, \"unit\": \"°C\"}\n";
        store
            .insert(&TaskRecord::pending(past(1), "sensors/cmd", payload))
            .await;
        let broker = InMemoryBroker::new();

        dispatcher(store, broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(broker.published().await[0].payload, payload.as_bytes().to_vec());
    }

    #[tokio::test]
    async fn unavailable_broker_still_advances_every_due_task() {
        let store = InMemoryTaskStore::new();
        let refs = seed_due(&store, 3).await;
        let broker = InMemoryBroker::new();
        broker.refuse_connections();

        let report = dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.processed, 3);
        assert_eq!(report.publish_skipped, 3);
        assert_eq!(report.advanced_unconfirmed, 3);
        assert!(broker.published().await.is_empty());
        assert_eq!(count_with_status(&store, &refs, TaskStatus::Processed).await, 3);
    }

    #[tokio::test]
    async fn require_delivery_keeps_tasks_pending_until_broker_returns() {
        let store = InMemoryTaskStore::new();
        let refs = seed_due(&store, 2).await;
        let down = InMemoryBroker::new();
        down.refuse_connections();

        let report = dispatcher(store.clone(), down, DeliveryPolicy::RequireDelivery)
            .run()
            .await
            .unwrap();
        assert_eq!(report.processed, 0);
        assert_eq!(report.held_back, 2);
        assert_eq!(count_with_status(&store, &refs, TaskStatus::Pending).await, 2);

        let up = InMemoryBroker::new();
        let report = dispatcher(store.clone(), up.clone(), DeliveryPolicy::RequireDelivery)
            .run()
            .await
            .unwrap();
        assert_eq!(report.processed, 2);
        assert_eq!(up.published().await.len(), 2);
    }

    #[rstest]
    #[case::always_advance(DeliveryPolicy::AlwaysAdvance, TaskStatus::Processed, 1)]
    #[case::require_delivery(DeliveryPolicy::RequireDelivery, TaskStatus::Pending, 0)]
    #[tokio::test]
    async fn failed_publish_follows_delivery_policy(
        #[case] policy: DeliveryPolicy,
        #[case] expected_status: TaskStatus,
        #[case] expected_processed: usize,
    ) {
        let store = InMemoryTaskStore::new();
        let reference = store
            .insert(&TaskRecord::pending(past(1), "locked/topic", "x"))
            .await;
        let broker = InMemoryBroker::new();
        broker.reject_topic("locked/topic").await;

        let report = dispatcher(store.clone(), broker, policy).run().await.unwrap();

        assert_eq!(report.publish_failed, 1);
        assert_eq!(report.processed, expected_processed);
        assert_eq!(store.status_of(&reference).await, Some(expected_status));
    }

    #[tokio::test]
    async fn failed_update_leaves_task_for_next_run() {
        let store = InMemoryTaskStore::new();
        let stuck = store
            .insert(&TaskRecord::pending(past(2), "a/stuck", "retry me"))
            .await;
        let fine = store
            .insert(&TaskRecord::pending(past(1), "a/fine", "ok"))
            .await;
        let broker = InMemoryBroker::new();

        let flaky = FaultyStore::new(store.clone()).fail_updates_for([stuck.clone()]);
        let report = dispatcher(flaky, broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.processed, 1);
        assert_eq!(report.update_failed, 1);
        assert_eq!(broker.published().await.len(), 2);
        assert_eq!(store.status_of(&stuck).await, Some(TaskStatus::Pending));
        assert_eq!(store.status_of(&fine).await, Some(TaskStatus::Processed));

        let mut cursor = store.query_due_tasks(noon()).await.unwrap();
        let candidate = cursor.next().await.unwrap().unwrap();
        assert!(cursor.next().await.unwrap().is_none());
        drop(cursor);
        assert_eq!(candidate.reference, stuck);
        let task = candidate.decode().unwrap();
        assert_eq!(task.deadline, Some(past(2)));
        assert_eq!(task.topic, "a/stuck");
        assert_eq!(task.message, "retry me");

        let report = dispatcher(store.clone(), broker, DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();
        assert_eq!(report.processed, 1);
        assert_eq!(store.status_of(&stuck).await, Some(TaskStatus::Processed));
    }

    #[tokio::test]
    async fn enumeration_error_aborts_without_rollback() {
        let store = InMemoryTaskStore::new();
        let refs = seed_due(&store, 5).await;
        let broker = InMemoryBroker::new();

        let failing = FaultyStore::new(store.clone()).fail_enumeration_after(2);
        let err = dispatcher(failing, broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::Enumeration { processed: 2, .. }));
        assert_eq!(err.public_message(), "Failed to iterate tasks");
        assert_eq!(count_with_status(&store, &refs, TaskStatus::Processed).await, 2);
        assert_eq!(count_with_status(&store, &refs, TaskStatus::Pending).await, 3);

        // 中断しても接続と client は解放される
        assert_eq!(broker.disconnects().await, 1);
        assert_eq!(store.close_count(), 1);

        let report = dispatcher(store.clone(), broker, DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();
        assert_eq!(report.processed, 3);
    }

    #[tokio::test]
    async fn store_open_failure_is_fatal() {
        let broker = InMemoryBroker::new();

        let err = dispatcher(UnreachableStore, broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap_err();

        assert!(matches!(err, DispatchError::StoreUnavailable(_)));
        assert_eq!(err.public_message(), "Failed to create task store client");
        assert_eq!(broker.connects().await, 0);
    }

    #[tokio::test]
    async fn malformed_document_is_skipped_and_batch_continues() {
        let store = InMemoryTaskStore::new();
        let mut broken = TaskRecord::pending(past(2), "x", "y").to_document();
        broken.insert("mqttTopic".into(), serde_json::json!(42));
        let broken = store.insert_document(broken).await;
        let good = store
            .insert(&TaskRecord::pending(past(1), "a/b", "fine"))
            .await;
        let broker = InMemoryBroker::new();

        let report = dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.malformed, 1);
        assert_eq!(report.processed, 1);
        assert_eq!(broker.published().await.len(), 1);
        assert_eq!(store.get(&broken).await.unwrap()["status"], "pending");
        assert_eq!(store.status_of(&good).await, Some(TaskStatus::Processed));
    }

    #[tokio::test]
    async fn concurrent_update_is_not_counted() {
        let store = InMemoryTaskStore::new();
        let reference = store
            .insert(&TaskRecord::pending(past(1), "a/b", "dup"))
            .await;
        let racing = FaultyStore::new(store.clone()).with_racing_writer();

        let report = dispatcher(racing, InMemoryBroker::new(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.processed, 0);
        assert_eq!(report.conflicts, 1);
        assert_eq!(store.status_of(&reference).await, Some(TaskStatus::Processed));
    }

    #[tokio::test]
    async fn connections_are_released_after_success() {
        let store = InMemoryTaskStore::new();
        seed_due(&store, 1).await;
        let broker = InMemoryBroker::new();

        dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(broker.connects().await, 1);
        assert_eq!(broker.disconnects().await, 1);
        assert_eq!(store.close_count(), 1);
    }

    struct CountingClock {
        calls: AtomicUsize,
    }

    impl Clock for CountingClock {
        fn now(&self) -> DateTime<Utc> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            noon()
        }
    }

    #[tokio::test]
    async fn clock_is_read_once_per_run() {
        let store = InMemoryTaskStore::new();
        seed_due(&store, 4).await;
        let clock = CountingClock {
            calls: AtomicUsize::new(0),
        };
        let dispatcher = Dispatcher::new(
            store,
            InMemoryBroker::new(),
            clock,
            DispatchOptions::default(),
        );

        let report = dispatcher.run().await.unwrap();

        assert_eq!(report.processed, 4);
        assert_eq!(report.as_of, noon());
        assert_eq!(dispatcher.clock.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn every_due_task_is_counted_exactly_once() {
        let store = InMemoryTaskStore::new().with_page_size(3);
        let refs = seed_due(&store, 10).await;
        let broker = InMemoryBroker::new();

        let report = dispatcher(store.clone(), broker.clone(), DeliveryPolicy::AlwaysAdvance)
            .run()
            .await
            .unwrap();

        assert_eq!(report.processed, refs.len());
        let topics: HashSet<String> = broker
            .published()
            .await
            .into_iter()
            .map(|message| message.topic)
            .collect();
        assert_eq!(topics.len(), refs.len());
        assert_eq!(count_with_status(&store, &refs, TaskStatus::Processed).await, 10);
    }
}
