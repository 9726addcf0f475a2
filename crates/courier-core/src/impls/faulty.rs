//! テスト用の故障注入 store
//!
//! InMemoryTaskStore を包んで、列挙の途中失敗・特定 task の更新失敗・
//! 他 invocation による先回り更新を再現します。

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::InMemoryTaskStore;
use crate::domain::{StoreError, TaskDocument, TaskRef};
use crate::ports::{DueTaskCursor, StoreConnector, TaskStore, UpdateOutcome};

#[derive(Clone)]
pub(crate) struct FaultyStore {
    inner: InMemoryTaskStore,
    fail_enumeration_after: Option<usize>,
    failing_updates: Arc<HashSet<TaskRef>>,
    racing_writer: bool,
}

impl FaultyStore {
    pub(crate) fn new(inner: InMemoryTaskStore) -> Self {
        Self {
            inner,
            fail_enumeration_after: None,
            failing_updates: Arc::new(HashSet::new()),
            racing_writer: false,
        }
    }

    /// `yielded` 件返したあと transport エラーにする
    pub(crate) fn fail_enumeration_after(mut self, yielded: usize) -> Self {
        self.fail_enumeration_after = Some(yielded);
        self
    }

    pub(crate) fn fail_updates_for(mut self, references: impl IntoIterator<Item = TaskRef>) -> Self {
        self.failing_updates = Arc::new(references.into_iter().collect());
        self
    }

    /// 更新の直前に別の writer が同じ task を processed にする
    pub(crate) fn with_racing_writer(mut self) -> Self {
        self.racing_writer = true;
        self
    }
}

#[async_trait]
impl TaskStore for FaultyStore {
    async fn query_due_tasks<'a>(
        &'a self,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn DueTaskCursor + 'a>, StoreError> {
        let inner = self.inner.query_due_tasks(now).await?;
        Ok(Box::new(FaultyCursor {
            inner,
            remaining: self.fail_enumeration_after,
        }))
    }

    async fn mark_processed(&self, reference: &TaskRef) -> Result<UpdateOutcome, StoreError> {
        if self.failing_updates.contains(reference) {
            return Err(StoreError::Update {
                reference: reference.clone(),
                reason: "deadline exceeded".to_string(),
            });
        }
        if self.racing_writer {
            self.inner.mark_processed(reference).await?;
        }
        self.inner.mark_processed(reference).await
    }

    async fn close(&self) {
        self.inner.close().await;
    }
}

#[async_trait]
impl StoreConnector for FaultyStore {
    type Store = FaultyStore;

    async fn open(&self) -> Result<Self::Store, StoreError> {
        Ok(self.clone())
    }
}

struct FaultyCursor<'a> {
    inner: Box<dyn DueTaskCursor + 'a>,
    remaining: Option<usize>,
}

#[async_trait]
impl DueTaskCursor for FaultyCursor<'_> {
    async fn next(&mut self) -> Result<Option<TaskDocument>, StoreError> {
        match &mut self.remaining {
            Some(0) => Err(StoreError::Query("connection reset by peer".to_string())),
            Some(left) => {
                *left -= 1;
                self.inner.next().await
            }
            None => self.inner.next().await,
        }
    }
}

/// open が必ず失敗する connector
pub(crate) struct UnreachableStore;

#[async_trait]
impl StoreConnector for UnreachableStore {
    type Store = InMemoryTaskStore;

    async fn open(&self) -> Result<Self::Store, StoreError> {
        Err(StoreError::Connect("connection refused".to_string()))
    }
}
