//! Errors - エラー型と分類
//!
//! モジュールごとの error enum は各モジュールに置き、
//! ここには store / dispatcher が共有するものだけを置く。

use std::net::SocketAddr;

use super::ids::{PackageSn, SchemeSn, TaskSn};

/// ErrorKind は運用上の分類
///
/// - Transient: 一時的なエラー（リトライ推奨）
/// - Permanent: 恒久的なエラー（リトライ無意味）
/// - Infrastructure: インフラエラー（store / network の障害）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Transient,
    Permanent,
    Infrastructure,
}

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("task {0} does not exist")]
    NotFound(TaskSn),

    #[error("previous task {previous} of {task_sn} does not exist")]
    MissingPrevious { task_sn: TaskSn, previous: TaskSn },

    #[error("package {0} does not exist")]
    UnknownPackage(PackageSn),

    #[error("scheme {0} does not exist")]
    UnknownScheme(SchemeSn),

    #[error("scheme rejected: {0}")]
    InvalidScheme(&'static str),

    #[error("task store unavailable: {0}")]
    Unavailable(String),

    #[error("payload encoding failed: {0}")]
    Codec(String),
}

impl StoreError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound(_)
            | Self::MissingPrevious { .. }
            | Self::UnknownPackage(_)
            | Self::UnknownScheme(_)
            | Self::InvalidScheme(_)
            | Self::Codec(_) => ErrorKind::Permanent,
            Self::Unavailable(_) => ErrorKind::Infrastructure,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("rpc server failed: {0}")]
    Serve(#[source] std::io::Error),
}
