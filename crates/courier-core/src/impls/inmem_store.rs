//! InMemoryTaskStore - 開発・テスト用の document store
//!
//! # 実装詳細
//! - BTreeMap<TaskRef, Document> で document を保持（natural order = TaskRef 昇順）
//! - tokio::sync::Mutex で排他制御
//! - clone は同じ状態を共有する（StoreConnector::open は clone を返す）
//! - cursor は keyset（`reference > last_seen`）で page_size 件ずつ読む

use std::collections::{BTreeMap, VecDeque};
use std::ops::Bound;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::task::{FIELD_STATUS, document_is_due};
use crate::domain::{Document, StoreError, TaskDocument, TaskRecord, TaskRef, TaskStatus};
use crate::ports::{
    DueTaskCursor, IdGenerator, StoreConnector, SystemClock, TaskStore, UlidGenerator,
    UpdateOutcome,
};

const DEFAULT_PAGE_SIZE: usize = 100;

#[derive(Clone)]
pub struct InMemoryTaskStore {
    documents: Arc<Mutex<BTreeMap<TaskRef, Document>>>,
    ids: Arc<dyn IdGenerator>,
    page_size: usize,
    /// client が解放された回数
    closes: Arc<AtomicUsize>,
}

impl InMemoryTaskStore {
    pub fn new() -> Self {
        Self::with_id_generator(Arc::new(UlidGenerator::new(SystemClock)))
    }

    pub fn with_id_generator(ids: Arc<dyn IdGenerator>) -> Self {
        Self {
            documents: Arc::new(Mutex::new(BTreeMap::new())),
            ids,
            page_size: DEFAULT_PAGE_SIZE,
            closes: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_page_size(mut self, page_size: usize) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    /// producer 用：task を追加して採番された参照を返す
    pub async fn insert(&self, task: &TaskRecord) -> TaskRef {
        self.insert_document(task.to_document()).await
    }

    pub async fn insert_document(&self, document: Document) -> TaskRef {
        let reference = self.ids.generate_task_ref();
        self.documents
            .lock()
            .await
            .insert(reference.clone(), document);
        reference
    }

    pub async fn get(&self, reference: &TaskRef) -> Option<Document> {
        self.documents.lock().await.get(reference).cloned()
    }

    pub async fn status_of(&self, reference: &TaskRef) -> Option<TaskStatus> {
        let document = self.get(reference).await?;
        TaskRecord::from_document(&document)
            .ok()
            .map(|record| record.status)
    }

    pub fn close_count(&self) -> usize {
        self.closes.load(Ordering::SeqCst)
    }

    /// `after` より後ろにある due document を最大 `limit` 件返す
    async fn due_page(
        &self,
        now: DateTime<Utc>,
        after: Option<&TaskRef>,
        limit: usize,
    ) -> Vec<TaskDocument> {
        let documents = self.documents.lock().await;
        let lower = match after {
            Some(reference) => Bound::Excluded(reference),
            None => Bound::Unbounded,
        };
        documents
            .range::<TaskRef, _>((lower, Bound::Unbounded))
            .filter(|(_, document)| document_is_due(document, now))
            .take(limit)
            .map(|(reference, document)| TaskDocument::new(reference.clone(), document.clone()))
            .collect()
    }
}

impl Default for InMemoryTaskStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl TaskStore for InMemoryTaskStore {
    async fn query_due_tasks<'a>(
        &'a self,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn DueTaskCursor + 'a>, StoreError> {
        Ok(Box::new(InMemoryCursor {
            store: self,
            now,
            last_seen: None,
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    async fn mark_processed(&self, reference: &TaskRef) -> Result<UpdateOutcome, StoreError> {
        let mut documents = self.documents.lock().await;
        let Some(document) = documents.get_mut(reference) else {
            return Ok(UpdateOutcome::NotPending);
        };
        let pending = serde_json::Value::from(TaskStatus::Pending.as_str());
        if document.get(FIELD_STATUS) != Some(&pending) {
            return Ok(UpdateOutcome::NotPending);
        }
        document.insert(
            FIELD_STATUS.to_string(),
            serde_json::Value::from(TaskStatus::Processed.as_str()),
        );
        Ok(UpdateOutcome::Applied)
    }

    async fn close(&self) {
        self.closes.fetch_add(1, Ordering::SeqCst);
    }
}

#[async_trait]
impl StoreConnector for InMemoryTaskStore {
    type Store = InMemoryTaskStore;

    async fn open(&self) -> Result<Self::Store, StoreError> {
        Ok(self.clone())
    }
}

struct InMemoryCursor<'a> {
    store: &'a InMemoryTaskStore,
    now: DateTime<Utc>,
    last_seen: Option<TaskRef>,
    buffer: VecDeque<TaskDocument>,
    exhausted: bool,
}

#[async_trait]
impl DueTaskCursor for InMemoryCursor<'_> {
    async fn next(&mut self) -> Result<Option<TaskDocument>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page_size = self.store.page_size;
            let page = self
                .store
                .due_page(self.now, self.last_seen.as_ref(), page_size)
                .await;
            self.exhausted = page.len() < page_size;
            if let Some(last) = page.last() {
                self.last_seen = Some(last.reference.clone());
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }
}
