//! TaskStore port - task の正本（source of truth）
//!
//! TaskStore は以下を提供します：
//! - due task の lazy な列挙（`status == pending AND deadline <= now`）
//! - `status` フィールドだけの条件付き更新（pending -> processed）
//!
//! # 実装
//! - InMemoryTaskStore（開発・テスト用）
//! - SqliteTaskStore（sqlx）

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{StoreError, TaskDocument, TaskRef};

/// DueTaskCursor は 1 回の query 結果を順に取り出す
///
/// - `Ok(Some(doc))`: 次の due task
/// - `Ok(None)`: 終端（これ以上の結果なし）
/// - `Err(_)`: transport エラー（終端とは区別される）
#[async_trait]
pub trait DueTaskCursor: Send {
    async fn next(&mut self) -> Result<Option<TaskDocument>, StoreError>;
}

/// 条件付き status 更新の結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
    /// pending -> processed を適用した
    Applied,

    /// すでに pending ではなかった（別 invocation が先に処理した / document が消えた）
    NotPending,
}

/// TaskStore は 1 invocation の間だけ使う store client
///
/// # 設計原則
/// - status を invocation をまたいでキャッシュしない（毎回 query し直す）
/// - 更新は `status` フィールドのみ、`status == pending` を条件にする
/// - document を削除しない
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// `now` 時点で due な task を store の natural order で列挙する
    async fn query_due_tasks<'a>(
        &'a self,
        now: DateTime<Utc>,
    ) -> Result<Box<dyn DueTaskCursor + 'a>, StoreError>;

    async fn mark_processed(&self, reference: &TaskRef) -> Result<UpdateOutcome, StoreError>;

    /// client を解放する（invocation の終わりに必ず呼ばれる）
    async fn close(&self);
}

/// StoreConnector は invocation ごとに store client を作る
///
/// open の失敗は invocation 全体にとって fatal。
#[async_trait]
pub trait StoreConnector: Send + Sync {
    type Store: TaskStore;

    async fn open(&self) -> Result<Self::Store, StoreError>;
}
