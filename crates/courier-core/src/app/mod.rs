//! App - アプリケーション層
//!
//! ports を組み合わせて 1 回分の dispatch を実装します。
//!
//! # 主要コンポーネント
//! - **Dispatcher**: due task の列挙 → publish → status 更新
//! - **BrokerLink**: invocation 単位の broker 接続（未接続も値として表す）
//! - **DispatchReport**: invocation の集計

pub mod dispatch_loop;
pub mod publisher;
pub mod status;

pub use self::dispatch_loop::Dispatcher;
pub use self::publisher::{BrokerLink, PublishOutcome};
pub use self::status::DispatchReport;
