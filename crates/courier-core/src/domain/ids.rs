//! Task reference（store が払い出す document ID）
//!
//! Store 側で一意に採番され、document の生存期間中は変わりません。
//! このリポジトリの store は ULID 文字列を払い出すため、
//! 辞書順 = 作成順になります（外部 producer が任意の文字列を使っても動作はします）。

use serde::{Deserialize, Serialize};
use std::fmt;
use ulid::Ulid;

/// TaskRef は 1 つの task document への参照
///
/// dispatch loop は enumerate 時に受け取った TaskRef を使って
/// `status` フィールドだけを狙い撃ちで更新します。
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TaskRef(String);

impl TaskRef {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// ULID から TaskRef を作成
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self(ulid.to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<Ulid> for TaskRef {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl fmt::Display for TaskRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}
