use std::sync::Arc;

use thiserror::Error;

use crate::feed::FeedError;
use crate::index::IndexError;

/// lookup cache 对外错误
#[derive(Debug, Error)]
pub enum LookupError {
    /// 变更源 I/O / 解码失败（刷新周期内捕获后记入失败槽）
    #[error("change feed unavailable: {0}")]
    SourceUnavailable(#[source] FeedError),

    /// 本地索引存储失败（同上）
    #[error("local index storage failure: {0}")]
    StorageFailure(#[source] IndexError),

    /// API 误用：立即失败，不重试，不记入失败槽
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    /// 后台刷新曾经失败：此后每次 lookup 都携带首个失败原因
    #[error("background refresh failed, cache is unusable until restart")]
    BackgroundRefreshFailed(#[source] Arc<LookupError>),

    #[error("refresh task panicked: {0}")]
    RefreshPanicked(String),

    #[error("failed to start refresh worker: {0}")]
    WorkerSpawn(#[source] std::io::Error),
}

impl LookupError {
    /// 后台失败时取出原始原因
    pub fn refresh_cause(&self) -> Option<&LookupError> {
        match self {
            LookupError::BackgroundRefreshFailed(cause) => Some(cause.as_ref()),
            _ => None,
        }
    }

    pub fn is_invalid_state(&self) -> bool {
        matches!(self, LookupError::InvalidState(_))
    }
}

impl From<FeedError> for LookupError {
    fn from(e: FeedError) -> Self {
        match e {
            FeedError::Exhausted => {
                LookupError::InvalidState("next_batch called without has_next".to_string())
            }
            other => LookupError::SourceUnavailable(other),
        }
    }
}

impl From<IndexError> for LookupError {
    fn from(e: IndexError) -> Self {
        match e {
            // 批次流在应用途中失败：归因到源端
            IndexError::Feed(fe) => LookupError::from(fe),
            IndexError::InvalidState(msg) => LookupError::InvalidState(msg.to_string()),
            IndexError::Closed => LookupError::InvalidState("index is closed".to_string()),
            other => LookupError::StorageFailure(other),
        }
    }
}

pub type Result<T, E = LookupError> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::error::Error as _;

    #[test]
    fn exhausted_feed_is_caller_bug() {
        let e = LookupError::from(FeedError::Exhausted);
        assert!(e.is_invalid_state());
    }

    #[test]
    fn feed_failure_inside_batch_is_source_unavailable() {
        let e = LookupError::from(IndexError::Feed(FeedError::Unavailable("down".into())));
        assert!(matches!(e, LookupError::SourceUnavailable(_)));
    }

    #[test]
    fn background_failure_exposes_original_cause() {
        let cause = Arc::new(LookupError::SourceUnavailable(FeedError::Unavailable(
            "s3 timeout".into(),
        )));
        let e = LookupError::BackgroundRefreshFailed(cause);
        assert!(matches!(
            e.refresh_cause(),
            Some(LookupError::SourceUnavailable(_))
        ));
        let src = e.source().map(|s| s.to_string()).unwrap_or_default();
        assert!(src.contains("s3 timeout"));
    }
}
