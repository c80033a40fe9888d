pub mod layout;
pub mod redb_index;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use thiserror::Error;

use crate::core::{JoinKey, ProjectedRow};
use crate::feed::{ChangeBatch, FeedError};

pub use layout::KeyLayout;
pub use redb_index::{RedbIndex, RedbIndexFactory};

#[derive(Debug, Error)]
pub enum IndexError {
    #[error("storage error: {0}")]
    Storage(#[from] redb::Error),

    #[error("row codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("record is missing key column {0:?}")]
    MissingKeyColumn(String),

    #[error("{0}")]
    InvalidState(&'static str),

    #[error("index is closed")]
    Closed,

    /// 批次记录流在应用途中失败（本批整体回滚）
    #[error("batch stream failed: {0}")]
    Feed(#[from] FeedError),
}

/// 索引生命周期：Empty → Loading → Ready，Ready 后不再回退
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum IndexState {
    Empty,
    Loading,
    Ready,
}

impl fmt::Display for IndexState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            IndexState::Empty => "empty",
            IndexState::Loading => "loading",
            IndexState::Ready => "ready",
        };
        f.write_str(s)
    }
}

/// 一个批次的应用结果
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct ApplyStats {
    pub upserts: usize,
    pub deletes: usize,
}

impl ApplyStats {
    pub fn records(&self) -> usize {
        self.upserts + self.deletes
    }
}

/// 本地 KV 索引抽象
///
/// ## 契约（重要）
/// - `initialize` 只在 Empty/Loading 下合法；`upsert` 只在 Ready 下合法。
/// - 单次 `initialize`/`upsert` 对读者原子可见：`get` 要么看到批前状态，要么看到批后状态。
/// - `get` 在首次全量加载完成前阻塞，绝不因索引未加载完而返回假阴性。
/// - `close` 幂等；关闭后所有操作返回 `IndexError::Closed`。
pub trait KeyValueIndex: Send + Sync {
    fn initialize(&self, batch: &mut ChangeBatch) -> Result<ApplyStats, IndexError>;

    fn upsert(&self, batch: &mut ChangeBatch) -> Result<ApplyStats, IndexError>;

    fn get(&self, key: &JoinKey) -> Result<Vec<ProjectedRow>, IndexError>;

    fn initialized(&self) -> bool;

    fn state(&self) -> IndexState;

    /// 等待进行中的加载结束并切换到 Ready（空源冷启动时落一个零记录 initialize）
    fn wait_initialization_completed(&self) -> Result<(), IndexError>;

    /// 记录数（按记录 key 计）
    fn len(&self) -> Result<u64, IndexError>;

    /// 本地存储占用（字节），未知时为 0
    fn disk_usage(&self) -> u64 {
        0
    }

    fn close(&self) -> Result<(), IndexError>;
}

/// 在 `LookupCache::open` 时创建索引
pub trait IndexFactory: Send + Sync {
    fn create(
        &self,
        table_name: &str,
        storage_dir: &Path,
        layout: KeyLayout,
    ) -> Result<Arc<dyn KeyValueIndex>, IndexError>;
}
