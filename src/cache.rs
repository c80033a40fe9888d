use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};

use crate::config::LookupConfig;
use crate::core::{FailureSlot, JoinKey, ProjectedRow, RefreshScheduler, ScalarValue};
use crate::error::{LookupError, Result};
use crate::feed::{ChangeBatch, ChangeFeed};
use crate::index::{ApplyStats, IndexError, IndexFactory, KeyValueIndex, RedbIndexFactory};
use crate::stats::CacheStats;

/// Created → Open → Closed
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum CacheState {
    Created = 0,
    Open = 1,
    Closed = 2,
}

impl CacheState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => CacheState::Created,
            1 => CacheState::Open,
            _ => CacheState::Closed,
        }
    }
}

impl fmt::Display for CacheState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            CacheState::Created => "created",
            CacheState::Open => "open",
            CacheState::Closed => "closed",
        };
        f.write_str(s)
    }
}

/// 刷新周期的执行体：后台线程与 `open()` 共用
struct Refresher {
    table: String,
    interval: Duration,
    /// 整个周期持有：周期体串行（synchronized）
    feed: Mutex<Box<dyn ChangeFeed>>,
    index: RwLock<Option<Arc<dyn KeyValueIndex>>>,
    /// 下一次允许真正执行的时间点；None 表示立即可执行
    next_load_at: Mutex<Option<Instant>>,
    last_cycle_ms: AtomicU64,
    cycles: AtomicU64,
    batches: AtomicU64,
    records: AtomicU64,
}

impl Refresher {
    fn current_index(&self) -> Option<Arc<dyn KeyValueIndex>> {
        self.index.read().clone()
    }

    fn run_cycle(&self) -> Result<()> {
        let mut feed = self.feed.lock();
        let Some(index) = self.current_index() else {
            return Ok(());
        };

        {
            let mut next = self.next_load_at.lock();
            let now = Instant::now();
            if let Some(at) = *next {
                if now < at {
                    tracing::debug!("Refresh of {} not due yet, skipping tick", self.table);
                    return Ok(());
                }
            }
            // 先推进水位线再干活：慢周期不会立刻被再次触发
            *next = Some(now + self.interval);
        }

        let started = Instant::now();
        let mut batches = 0u64;
        let mut records = 0u64;
        let outcome = self.drain(&mut **feed, index.as_ref(), &mut batches, &mut records);

        let elapsed = started.elapsed();
        self.last_cycle_ms
            .store(elapsed.as_millis() as u64, Ordering::Relaxed);
        self.cycles.fetch_add(1, Ordering::Relaxed);

        match outcome {
            Ok(true) => {
                if batches > 0 {
                    tracing::info!(
                        "Refresh of {} applied {} batches ({} records) in {}ms",
                        self.table,
                        batches,
                        records,
                        elapsed.as_millis()
                    );
                } else {
                    tracing::debug!("Refresh of {} found no changes", self.table);
                }
                Ok(())
            }
            Ok(false) => {
                tracing::debug!("Refresh of {} stopped: index closed", self.table);
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    /// 返回 false 表示索引在周期中被关闭（安静退出，不算失败）
    fn drain(
        &self,
        feed: &mut dyn ChangeFeed,
        index: &dyn KeyValueIndex,
        batches: &mut u64,
        records: &mut u64,
    ) -> Result<bool> {
        while feed.has_next() {
            let mut batch = feed.next_batch()?;
            let position = batch.position();
            let started = Instant::now();

            let applied = apply_batch(index, &mut batch, &self.table);
            // 无论成功与否都先释放批次的 I/O 资源
            batch.close();
            let Some(stats) = applied? else {
                return Ok(false);
            };

            feed.commit(position);
            *batches += 1;
            *records += stats.records() as u64;
            self.batches.fetch_add(1, Ordering::Relaxed);
            self.records
                .fetch_add(stats.records() as u64, Ordering::Relaxed);
            tracing::debug!(
                "Batch {} of {} applied: {} upserts, {} deletes, cost {:?}",
                position,
                self.table,
                stats.upserts,
                stats.deletes,
                started.elapsed()
            );
        }

        if !index.initialized() {
            match index.wait_initialization_completed() {
                Ok(()) => {}
                Err(IndexError::Closed) => return Ok(false),
                Err(e) => return Err(e.into()),
            }
        }
        Ok(true)
    }
}

fn apply_batch(
    index: &dyn KeyValueIndex,
    batch: &mut ChangeBatch,
    table: &str,
) -> Result<Option<ApplyStats>> {
    let r = if index.initialized() {
        index.upsert(batch)
    } else {
        tracing::info!("Lookup table {} is still under initialization", table);
        index.initialize(batch)
    };
    match r {
        Ok(stats) => Ok(Some(stats)),
        Err(IndexError::Closed) => Ok(None),
        Err(e) => Err(e.into()),
    }
}

/// lookup cache 编排器
///
/// ## 生命周期
/// - `open()`：打开变更源、创建本地索引、同步跑一轮刷新（首次全量），再交给后台调度。
/// - `lookup()`：先查失败槽，再读索引；首次全量完成前阻塞。
/// - `close()`：幂等；有界等待进行中的刷新，然后释放本地存储。
pub struct LookupCache {
    config: LookupConfig,
    factory: Arc<dyn IndexFactory>,
    refresher: Arc<Refresher>,
    slot: Arc<FailureSlot>,
    /// open/close 串行化，并持有调度器
    lifecycle: Mutex<Option<RefreshScheduler>>,
    state: AtomicU8,
}

impl LookupCache {
    pub fn new(
        config: LookupConfig,
        feed: Box<dyn ChangeFeed>,
        factory: Arc<dyn IndexFactory>,
    ) -> Result<Self> {
        config.validate()?;
        let refresher = Arc::new(Refresher {
            table: config.table_name.clone(),
            interval: config.refresh_interval,
            feed: Mutex::new(feed),
            index: RwLock::new(None),
            next_load_at: Mutex::new(None),
            last_cycle_ms: AtomicU64::new(0),
            cycles: AtomicU64::new(0),
            batches: AtomicU64::new(0),
            records: AtomicU64::new(0),
        });
        Ok(Self {
            config,
            factory,
            refresher,
            slot: Arc::new(FailureSlot::new()),
            lifecycle: Mutex::new(None),
            state: AtomicU8::new(CacheState::Created as u8),
        })
    }

    /// 默认 redb 本地索引
    pub fn with_redb(config: LookupConfig, feed: Box<dyn ChangeFeed>) -> Result<Self> {
        Self::new(config, feed, Arc::new(RedbIndexFactory))
    }

    pub fn state(&self) -> CacheState {
        CacheState::from_u8(self.state.load(Ordering::Acquire))
    }

    pub fn config(&self) -> &LookupConfig {
        &self.config
    }

    pub fn open(&self) -> Result<()> {
        let mut scheduler = self.lifecycle.lock();
        let state = self.state();
        if state != CacheState::Created {
            return Err(LookupError::InvalidState(format!(
                "open() called on a {state} cache"
            )));
        }

        let started = Instant::now();
        tracing::info!(
            "Opening lookup cache {} (join keys {:?}, refresh every {:?})",
            self.config.table_name,
            self.config.join_keys,
            self.config.refresh_interval
        );

        if let Err(e) = self.bootstrap(&mut scheduler) {
            self.rollback_open();
            return Err(e);
        }

        self.state.store(CacheState::Open as u8, Ordering::Release);
        tracing::info!(
            "Lookup cache {} open in {:?}",
            self.config.table_name,
            started.elapsed()
        );
        Ok(())
    }

    fn bootstrap(&self, scheduler: &mut Option<RefreshScheduler>) -> Result<()> {
        {
            let mut feed = self.refresher.feed.lock();
            feed.open()?;
            tracing::info!(
                "Change feed {} opened for {}",
                feed.name(),
                self.config.table_name
            );
        }

        let index = self.factory.create(
            &self.config.table_name,
            &self.config.local_storage_path,
            self.config.layout(),
        )?;
        *self.refresher.index.write() = Some(index);

        // 同步首轮：open 返回后的 lookup 不会撞上空索引
        self.refresher.run_cycle()?;

        let refresher = self.refresher.clone();
        *scheduler = Some(RefreshScheduler::start(
            &self.config.table_name,
            self.config.refresh_interval,
            self.slot.clone(),
            move || refresher.run_cycle(),
        )?);
        Ok(())
    }

    /// open 失败：拆掉半成品索引
    ///
    /// 变更源游标已前移（有批次被提交）时不能再重放，缓存直接进入 Closed。
    fn rollback_open(&self) {
        if let Some(index) = self.refresher.index.write().take() {
            if let Err(e) = index.close() {
                tracing::warn!("Failed to close half-built index: {}", e);
            }
        }
        *self.refresher.next_load_at.lock() = None;

        if self.refresher.batches.load(Ordering::Relaxed) > 0 {
            self.refresher.feed.lock().close();
            self.state.store(CacheState::Closed as u8, Ordering::Release);
            tracing::warn!(
                "Lookup cache {} failed to open after consuming changes; closed",
                self.config.table_name
            );
        } else {
            tracing::warn!(
                "Lookup cache {} failed to open; open() may be retried",
                self.config.table_name
            );
        }
    }

    pub fn lookup(&self, key: &JoinKey) -> Result<Vec<ProjectedRow>> {
        let state = self.state();
        if state != CacheState::Open {
            return Err(LookupError::InvalidState(format!(
                "lookup() called on a {state} cache"
            )));
        }
        if key.len() != self.config.join_keys.len() {
            return Err(LookupError::InvalidState(format!(
                "lookup key {} has {} values, join keys are {:?}",
                key,
                key.len(),
                self.config.join_keys
            )));
        }
        if let Some(cause) = self.slot.get() {
            return Err(LookupError::BackgroundRefreshFailed(cause));
        }
        let index = self
            .refresher
            .current_index()
            .ok_or_else(|| LookupError::InvalidState("cache is closed".to_string()))?;
        Ok(index.get(key)?)
    }

    pub fn lookup_values<I, V>(&self, values: I) -> Result<Vec<ProjectedRow>>
    where
        I: IntoIterator<Item = V>,
        V: Into<ScalarValue>,
    {
        self.lookup(&values.into_iter().collect())
    }

    pub fn close(&self) -> Result<()> {
        let mut scheduler = self.lifecycle.lock();
        if self.state() == CacheState::Closed {
            return Ok(());
        }
        self.state.store(CacheState::Closed as u8, Ordering::Release);

        if let Some(mut s) = scheduler.take() {
            s.stop(self.config.close_grace);
        }

        let index = self.refresher.index.write().take();
        // 卡住的周期仍持有变更源；交给被分离的 worker 自行结束
        match self.refresher.feed.try_lock() {
            Some(mut feed) => feed.close(),
            None => tracing::warn!(
                "Change feed of {} is held by a stuck refresh, not closing it",
                self.config.table_name
            ),
        }
        if let Some(index) = index {
            index.close()?;
        }

        tracing::info!("Lookup cache {} closed", self.config.table_name);
        Ok(())
    }

    /// 最近一次刷新周期耗时（毫秒）
    pub fn last_cycle_millis(&self) -> u64 {
        self.refresher.last_cycle_ms.load(Ordering::Relaxed)
    }

    pub fn failure(&self) -> Option<Arc<LookupError>> {
        self.slot.get()
    }

    pub fn stats(&self) -> CacheStats {
        let index = self.refresher.current_index();
        CacheStats {
            table: self.config.table_name.clone(),
            state: self.state().to_string(),
            index_state: index.as_ref().map(|i| i.state().to_string()),
            entries: index.as_ref().and_then(|i| i.len().ok()).unwrap_or(0),
            storage_bytes: index.as_ref().map(|i| i.disk_usage()).unwrap_or(0),
            cycles: self.refresher.cycles.load(Ordering::Relaxed),
            batches: self.refresher.batches.load(Ordering::Relaxed),
            records: self.refresher.records.load(Ordering::Relaxed),
            last_cycle_ms: self.last_cycle_millis(),
            failure: self.slot.get().map(|e| e.to_string()),
            process_rss_bytes: CacheStats::read_process_rss(),
        }
    }
}

impl Drop for LookupCache {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("Failed to close lookup cache on drop: {}", e);
        }
    }
}
