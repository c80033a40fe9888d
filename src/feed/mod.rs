pub mod directory;
pub mod filter;
pub mod memory;

use std::fmt;

use thiserror::Error;

use crate::core::ChangeRecord;

pub use directory::DirectoryChangeFeed;
pub use filter::{RowFilter, RowFilterRule};
pub use memory::{MemoryChangeFeed, MemoryFeedProducer};

#[derive(Debug, Error)]
pub enum FeedError {
    #[error("feed io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("malformed change record at line {line}: {message}")]
    Decode { line: usize, message: String },

    /// `has_next()` 为 false 时调用 `next_batch()`
    #[error("no batch available")]
    Exhausted,

    #[error("source unavailable: {0}")]
    Unavailable(String),
}

/// 变更源内部游标（对调用方不透明）
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FeedPosition(u64);

impl FeedPosition {
    pub fn new(raw: u64) -> Self {
        Self(raw)
    }

    pub fn raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for FeedPosition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

type RecordIter = Box<dyn Iterator<Item = Result<ChangeRecord, FeedError>> + Send>;

/// 一次 `next_batch()` 产出的惰性记录序列
///
/// 底层 I/O 资源由迭代器持有，drop 即释放；调用方可以中途停止而不必物化整个批次。
pub struct ChangeBatch {
    position: FeedPosition,
    records: RecordIter,
}

impl ChangeBatch {
    pub fn new<I>(position: FeedPosition, records: I) -> Self
    where
        I: Iterator<Item = Result<ChangeRecord, FeedError>> + Send + 'static,
    {
        Self {
            position,
            records: Box::new(records),
        }
    }

    pub fn from_records(position: FeedPosition, records: Vec<ChangeRecord>) -> Self {
        Self::new(position, records.into_iter().map(Ok))
    }

    /// 应用成功后用于 `ChangeFeed::commit`
    pub fn position(&self) -> FeedPosition {
        self.position
    }

    pub fn close(self) {}
}

impl Iterator for ChangeBatch {
    type Item = Result<ChangeRecord, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.records.next()
    }
}

impl fmt::Debug for ChangeBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChangeBatch")
            .field("position", &self.position)
            .finish_non_exhaustive()
    }
}

/// 增量变更源抽象
///
/// ## 契约
/// - `has_next` 不阻塞：只比较游标与已知的源端进度。
/// - `next_batch` 可能阻塞在远端 I/O；每次调用产出有限序列，跨调用可无限。
/// - 游标只在 `commit` 时前移；未提交的批次在下一轮会被重新投递（at-least-once）。
pub trait ChangeFeed: Send {
    fn open(&mut self) -> Result<(), FeedError> {
        Ok(())
    }

    fn has_next(&self) -> bool;

    fn next_batch(&mut self) -> Result<ChangeBatch, FeedError>;

    fn commit(&mut self, position: FeedPosition);

    fn close(&mut self) {}

    fn name(&self) -> &str {
        "feed"
    }
}
