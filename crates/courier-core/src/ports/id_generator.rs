//! IdGenerator port - TaskRef 採番の抽象化
//!
//! # 実装
//! - **UlidGenerator**: ULID ベース（store の insert で使用）

use crate::domain::TaskRef;
use crate::ports::Clock;
use ulid::Ulid;

/// IdGenerator は store が払い出す document 参照を生成
///
/// # ULID の特性
/// - 時刻でソート可能（store の natural order = 作成順）
/// - 分散環境で生成可能（調整不要）
pub trait IdGenerator: Send + Sync {
    fn generate_task_ref(&self) -> TaskRef;
}

/// UlidGenerator は Clock の時刻を timestamp 部に使う
pub struct UlidGenerator<C> {
    clock: C,
}

impl<C: Clock> UlidGenerator<C> {
    pub fn new(clock: C) -> Self {
        Self { clock }
    }
}

impl<C: Clock> IdGenerator for UlidGenerator<C> {
    fn generate_task_ref(&self) -> TaskRef {
        let timestamp_ms = self.clock.now().timestamp_millis() as u64;
        TaskRef::from_ulid(Ulid::from_parts(timestamp_ms, rand::random()))
    }
}
