//! courier-core
//!
//! Scheduled MQTT dispatch: 期限の来た pending task を broker に publish し、
//! task store 上で processed に進めます。
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, BrokerConnector, Clock, IdGenerator）
//! - **app**: dispatch ループと集計
//! - **impls**: 実装（SQLite, MQTT, in-memory）
//! - **config**: 接続設定と dispatch の挙動設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod ports;
