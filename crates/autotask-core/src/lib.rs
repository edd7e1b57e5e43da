//! autotask-core
//!
//! Core building blocks for the AutoTask distributed task dispatcher.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, task, record, report, cluster, errors）
//! - **ports**: 抽象化レイヤー（TaskStore, DispatcherApi, DispatcherAdmin, Clock, HeartbeatSink）
//! - **queue**: dispatcher の作業集合（TaskQueue, TaskState, BlockSet）
//! - **dispatcher**: DispatcherCore と HTTP server
//! - **store**: InMemoryTaskStore（永続 record の状態機械）
//! - **rpc**: retry 付き RPC transport と HTTP client
//! - **cluster**: supervisor、worker slot、process launcher、pipe protocol
//! - **app**: アプリケーションロジック（builder, runtime, worker_loop, reaper_loop, status）
//! - **typed**: 型付き Task API（Task trait, Handler trait, TypedRegistry, PayloadCodec）
//! - **config** / **observability**: 設定と counters
//!
//! # プロセス構成
//! Supervisor → Worker →（RPC）→ Dispatcher → Task Store。
//! Supervisor と dispatcher は定期的に ping を交換する。

pub mod app;
pub mod cluster;
pub mod config;
pub mod dispatcher;
pub mod domain;
pub mod observability;
pub mod ports;
pub mod queue;
pub mod rpc;
pub mod store;
pub mod typed;
