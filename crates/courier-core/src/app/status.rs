//! DispatchReport - 1 回の invocation の集計
//!
//! trigger の呼び出し元に返すのは `processed` だけ。
//! それ以外のカウンタはログ用です。

use std::fmt;

use chrono::{DateTime, Utc};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchReport {
    /// eligibility 判定に使った時刻（invocation 開始時に 1 回だけ取得）
    pub as_of: DateTime<Utc>,

    /// status 更新に成功した task 数
    pub processed: usize,

    pub delivered: usize,
    pub publish_skipped: usize,
    pub publish_failed: usize,

    /// 配送未確認のまま processed にした数（AlwaysAdvance のみ）
    pub advanced_unconfirmed: usize,

    /// 配送未確認のため pending のまま残した数（RequireDelivery のみ）
    pub held_back: usize,

    pub update_failed: usize,

    /// 更新時にすでに pending ではなかった数
    pub conflicts: usize,

    pub malformed: usize,
}

impl DispatchReport {
    pub fn new(as_of: DateTime<Utc>) -> Self {
        Self {
            as_of,
            processed: 0,
            delivered: 0,
            publish_skipped: 0,
            publish_failed: 0,
            advanced_unconfirmed: 0,
            held_back: 0,
            update_failed: 0,
            conflicts: 0,
            malformed: 0,
        }
    }
}

impl fmt::Display for DispatchReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Task check completed. {} tasks processed.", self.processed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn summary_reports_processed_count_only() {
        let report = DispatchReport {
            processed: 3,
            update_failed: 1,
            ..DispatchReport::new(Utc::now())
        };
        assert_eq!(report.to_string(), "Task check completed. 3 tasks processed.");
    }
}
