//! Domain identifiers (strongly-typed IDs).
//!
//! # 二種類の ID
//! - **TaskSn / PackageSn / SchemeSn**: Task Store が払い出す単調増加の serial。
//!   TaskSn は優先度の同順位を解く tie-breaker でもある。
//! - **Id<T>**: ULID ベースの incarnation ID（dispatcher / cluster の起動ごとに 1 つ）。
//!
//! ## Phantom Type パターン
//! `Id<T>` は `T` を PhantomData として持つだけなので実行時コストはゼロ。
//! `DispatcherId` と `ClusterRunId` はコンパイル時に混同できない。

use serde::{Deserialize, Serialize};
use std::fmt;
use std::marker::PhantomData;
use ulid::Ulid;

/// Store-issued serial. `prefix` is used by Display.
macro_rules! serial_id {
    ($(#[$meta:meta])* $name:ident, $prefix:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(u64);

        impl $name {
            pub const fn new(value: u64) -> Self {
                Self(value)
            }

            pub const fn get(self) -> u64 {
                self.0
            }
        }

        impl From<u64> for $name {
            fn from(value: u64) -> Self {
                Self(value)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($prefix, "-{}"), self.0)
            }
        }
    };
}

serial_id!(
    /// Serial number of a task record. Lower serials were created earlier.
    TaskSn,
    "task"
);

serial_id!(
    /// Serial of a task package (tasks submitted and tracked as one group).
    PackageSn,
    "package"
);

serial_id!(
    /// Serial of a recurring task scheme.
    SchemeSn,
    "scheme"
);

/// Per-slot spawn counter. Every respawn gets a strictly greater value.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Generation(u64);

impl Generation {
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for Generation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gen-{}", self.0)
    }
}

/// IdMarker は各 ID 型のマーカー trait
pub trait IdMarker: Send + Sync + 'static {
    /// Display で使うプレフィックス（例: "dispatcher-"）
    fn prefix() -> &'static str;
}

/// ULID backed incarnation id.
#[repr(transparent)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Id<T: IdMarker> {
    ulid: Ulid,
    #[serde(skip)]
    _marker: PhantomData<T>,
}

impl<T: IdMarker> Id<T> {
    pub fn from_ulid(ulid: Ulid) -> Self {
        Self {
            ulid,
            _marker: PhantomData,
        }
    }

    pub fn as_ulid(&self) -> Ulid {
        self.ulid
    }
}

impl<T: IdMarker> From<Ulid> for Id<T> {
    fn from(ulid: Ulid) -> Self {
        Self::from_ulid(ulid)
    }
}

impl<T: IdMarker> fmt::Display for Id<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", T::prefix(), self.ulid)
    }
}

// ========================================
// マーカー型の定義
// ========================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Dispatcher {}

impl IdMarker for Dispatcher {
    fn prefix() -> &'static str {
        "dispatcher-"
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ClusterRun {}

impl IdMarker for ClusterRun {
    fn prefix() -> &'static str {
        "cluster-"
    }
}

pub type DispatcherId = Id<Dispatcher>;
pub type ClusterRunId = Id<ClusterRun>;
