use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::core::ChangeRecord;
use crate::feed::{ChangeBatch, ChangeFeed, FeedError, FeedPosition};

#[derive(Debug, Default)]
struct Shared {
    /// (batch id, records)，id 单调递增
    pending: VecDeque<(u64, Vec<ChangeRecord>)>,
    next_id: u64,
}

/// 进程内变更源：批次由 `MemoryFeedProducer` 推入，提交前可重复投递
pub struct MemoryChangeFeed {
    shared: Arc<Mutex<Shared>>,
    committed: u64,
    name: String,
}

/// 生产端句柄（可克隆，跨线程推批次）
#[derive(Clone)]
pub struct MemoryFeedProducer {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryChangeFeed {
    pub fn new(name: impl Into<String>) -> (Self, MemoryFeedProducer) {
        let shared = Arc::new(Mutex::new(Shared {
            pending: VecDeque::new(),
            next_id: 1,
        }));
        (
            Self {
                shared: shared.clone(),
                committed: 0,
                name: name.into(),
            },
            MemoryFeedProducer { shared },
        )
    }
}

impl MemoryFeedProducer {
    /// 追加一个批次，返回批次 id
    pub fn push(&self, records: Vec<ChangeRecord>) -> u64 {
        let mut g = self.shared.lock();
        let id = g.next_id;
        g.next_id += 1;
        g.pending.push_back((id, records));
        id
    }

    /// 尚未提交的批次数
    pub fn pending(&self) -> usize {
        self.shared.lock().pending.len()
    }
}

impl ChangeFeed for MemoryChangeFeed {
    fn has_next(&self) -> bool {
        let g = self.shared.lock();
        g.pending.iter().any(|(id, _)| *id > self.committed)
    }

    fn next_batch(&mut self) -> Result<ChangeBatch, FeedError> {
        let g = self.shared.lock();
        let Some((id, records)) = g.pending.iter().find(|(id, _)| *id > self.committed) else {
            return Err(FeedError::Exhausted);
        };
        Ok(ChangeBatch::from_records(
            FeedPosition::new(*id),
            records.clone(),
        ))
    }

    fn commit(&mut self, position: FeedPosition) {
        let raw = position.raw();
        if raw <= self.committed {
            return;
        }
        self.committed = raw;
        self.shared.lock().pending.retain(|(id, _)| *id > raw);
    }

    fn name(&self) -> &str {
        &self.name
    }
}
