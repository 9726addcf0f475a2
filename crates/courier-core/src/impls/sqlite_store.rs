//! SqliteTaskStore - sqlx を使った task store
//!
//! # テーブル
//! ```sql
//! scheduled_tasks(id TEXT PRIMARY KEY, status TEXT, deadline_ns INTEGER, document TEXT NOT NULL)
//! ```
//! - `document` が正本（producer の field 名そのままの JSON）
//! - `status` / `deadline_ns` は query 用の射影で、書き込みのたびに document から計算する
//! - `deadline_ns` は UTC epoch からのナノ秒。chrono の精度のまま比較する（範囲外の deadline は NULL で due にならない）
//! - natural order は `id` 昇順（ULID なので作成順）

use std::collections::VecDeque;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;
use tracing::debug;

use crate::config::StoreConfig;
use crate::domain::task::{document_deadline, document_status};
use crate::domain::{Document, StoreError, TaskDocument, TaskRecord, TaskRef};
use crate::ports::{
    DueTaskCursor, IdGenerator, StoreConnector, SystemClock, TaskStore, UlidGenerator,
    UpdateOutcome,
};

const CREATE_TABLE: &str = "CREATE TABLE IF NOT EXISTS scheduled_tasks (
    id          TEXT PRIMARY KEY,
    status      TEXT,
    deadline_ns INTEGER,
    document    TEXT NOT NULL
)";

const CREATE_DUE_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS scheduled_tasks_due ON scheduled_tasks (status, deadline_ns)";

const SELECT_DUE_PAGE: &str = "SELECT id, document FROM scheduled_tasks
    WHERE status = 'pending' AND deadline_ns <= ?1 AND id > ?2
    ORDER BY id
    LIMIT ?3";

const MARK_PROCESSED: &str = "UPDATE scheduled_tasks
    SET status = 'processed', document = json_set(document, '$.status', 'processed')
    WHERE id = ?1 AND status = 'pending'";

/// SqliteConnector は invocation ごとに pool を開く
pub struct SqliteConnector {
    config: StoreConfig,
}

impl SqliteConnector {
    pub fn new(config: StoreConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl StoreConnector for SqliteConnector {
    type Store = SqliteTaskStore;

    async fn open(&self) -> Result<Self::Store, StoreError> {
        SqliteTaskStore::open(&self.config).await
    }
}

pub struct SqliteTaskStore {
    pool: SqlitePool,
    page_size: usize,
    ids: Arc<dyn IdGenerator>,
}

impl SqliteTaskStore {
    /// pool を開き、テーブルがなければ作る
    pub async fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(&config.url)
            .map_err(|e| StoreError::Connect(e.to_string()))?
            .create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(config.max_connections.max(1))
            .connect_with(options)
            .await
            .map_err(|e| StoreError::Connect(e.to_string()))?;

        for statement in [CREATE_TABLE, CREATE_DUE_INDEX] {
            sqlx::query(statement)
                .execute(&pool)
                .await
                .map_err(|e| StoreError::Connect(e.to_string()))?;
        }

        debug!(url = %config.url, "task store opened");
        Ok(Self {
            pool,
            page_size: config.page_size.max(1),
            ids: Arc::new(UlidGenerator::new(SystemClock)),
        })
    }

    /// producer 用：task を追加して採番された参照を返す
    pub async fn insert(&self, task: &TaskRecord) -> Result<TaskRef, StoreError> {
        self.insert_document(task.to_document()).await
    }

    pub async fn insert_document(&self, document: Document) -> Result<TaskRef, StoreError> {
        let reference = self.ids.generate_task_ref();
        let status = document_status(&document).map(str::to_string);
        let deadline_ns =
            document_deadline(&document).and_then(|deadline| deadline.timestamp_nanos_opt());
        let body = serde_json::Value::Object(document).to_string();

        sqlx::query(
            "INSERT INTO scheduled_tasks (id, status, deadline_ns, document) VALUES (?1, ?2, ?3, ?4)",
        )
        .bind(reference.as_str())
        .bind(status)
        .bind(deadline_ns)
        .bind(body)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::Query(e.to_string()))?;

        Ok(reference)
    }

    pub async fn get(&self, reference: &TaskRef) -> Result<Option<Document>, StoreError> {
        let row = sqlx::query("SELECT id, document FROM scheduled_tasks WHERE id = ?1")
            .bind(reference.as_str())
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        row.map(|row| decode_row(&row).map(|doc| doc.fields))
            .transpose()
    }

    async fn due_page(
        &self,
        now: DateTime<Utc>,
        after: &str,
    ) -> Result<Vec<TaskDocument>, StoreError> {
        let now_ns = now
            .timestamp_nanos_opt()
            .ok_or_else(|| StoreError::Query(format!("{now} is outside the comparable range")))?;
        let rows = sqlx::query(SELECT_DUE_PAGE)
            .bind(now_ns)
            .bind(after)
            .bind(self.page_size as i64)
            .fetch_all(&self.pool)
            .await
            .map_err(|e| StoreError::Query(e.to_string()))?;

        rows.iter().map(decode_row).collect()
    }
}

fn decode_row(row: &SqliteRow) -> Result<TaskDocument, StoreError> {
    let id: String = row
        .try_get("id")
        .map_err(|e| StoreError::Query(e.to_string()))?;
    let reference = TaskRef::new(id);
    let body: String = row
        .try_get("document")
        .map_err(|e| StoreError::Query(e.to_string()))?;

    match serde_json::from_str::<serde_json::Value>(&body) {
        Ok(serde_json::Value::Object(fields)) => Ok(TaskDocument::new(reference, fields)),
        Ok(other) => Err(StoreError::Corrupt {
            reference,
            reason: format!("expected a JSON object, found {other}"),
        }),
        Err(e) => Err(StoreError::Corrupt {
            reference,
            reason: e.to_string(),
        }),
    }
}

#[async_trait]
impl TaskStore for SqliteTaskStore {
    async fn query_due_tasks<'a>(
        &'a self,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn DueTaskCursor + 'a>, StoreError> {
        Ok(Box::new(SqliteCursor {
            store: self,
            now,
            last_seen: String::new(),
            buffer: VecDeque::new(),
            exhausted: false,
        }))
    }

    async fn mark_processed(&self, reference: &TaskRef) -> Result<UpdateOutcome, StoreError> {
        let result = sqlx::query(MARK_PROCESSED)
            .bind(reference.as_str())
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::Update {
                reference: reference.clone(),
                reason: e.to_string(),
            })?;

        if result.rows_affected() == 1 {
            Ok(UpdateOutcome::Applied)
        } else {
            Ok(UpdateOutcome::NotPending)
        }
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}

struct SqliteCursor<'a> {
    store: &'a SqliteTaskStore,
    now: DateTime<Utc>,
    /// 空文字列はどの id よりも小さい
    last_seen: String,
    buffer: VecDeque<TaskDocument>,
    exhausted: bool,
}

#[async_trait]
impl DueTaskCursor for SqliteCursor<'_> {
    async fn next(&mut self) -> Result<Option<TaskDocument>, StoreError> {
        if self.buffer.is_empty() && !self.exhausted {
            let page = self.store.due_page(self.now, &self.last_seen).await?;
            self.exhausted = page.len() < self.store.page_size;
            if let Some(last) = page.last() {
                self.last_seen = last.reference.as_str().to_string();
            }
            self.buffer.extend(page);
        }
        Ok(self.buffer.pop_front())
    }
}
