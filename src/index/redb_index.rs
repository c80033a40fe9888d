use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use arc_swap::ArcSwapOption;
use parking_lot::{Condvar, Mutex};
use redb::{Database, ReadableDatabase, ReadableTable, ReadableTableMetadata, TableDefinition};

use crate::core::{ChangeRecord, JoinKey, ProjectedRow};
use crate::feed::ChangeBatch;
use crate::index::{
    ApplyStats, IndexError, IndexFactory, IndexState, KeyLayout, KeyValueIndex,
};

/// 记录 key → bincode(ProjectedRow)
const ROWS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("rows");
/// join key → bincode(Vec<记录 key>)，仅二级索引使用
const JOIN_MEMBERS: TableDefinition<&[u8], &[u8]> = TableDefinition::new("join_members");

static OPEN_SEQ: AtomicU64 = AtomicU64::new(0);

fn storage<E: Into<redb::Error>>(e: E) -> IndexError {
    IndexError::Storage(e.into())
}

/// redb 支撑的本地索引
///
/// - 每次 `initialize`/`upsert` 是一个写事务：提交前读者看不到任何一条，失败整体回滚。
/// - 读走 MVCC 读事务，与后台写并发。
/// - 存储句柄放在 `ArcSwapOption` 里：`close` 摘掉句柄后，进行中的写仍持有自己的 Arc，
///   但每条记录前都会检查 closed 标志并放弃事务。
pub struct RedbIndex {
    name: String,
    path: PathBuf,
    layout: KeyLayout,
    db: ArcSwapOption<Database>,
    closed: AtomicBool,
    state: Mutex<IndexState>,
    ready: Condvar,
    /// 串行化所有写（initialize / upsert / wait_initialization_completed）
    apply_gate: Mutex<()>,
}

impl RedbIndex {
    pub fn open(name: &str, path: PathBuf, layout: KeyLayout) -> Result<Self, IndexError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| IndexError::Storage(redb::Error::Io(e)))?;
        }
        let db = Database::create(&path).map_err(storage)?;

        // 先建表，保证首次加载前的读也不会因表不存在而失败
        {
            let txn = db.begin_write().map_err(storage)?;
            let _ = txn.open_table(ROWS).map_err(storage)?;
            let _ = txn.open_table(JOIN_MEMBERS).map_err(storage)?;
            txn.commit().map_err(storage)?;
        }

        tracing::info!(
            "Local index opened: table={} path={:?} unique={}",
            name,
            path,
            layout.is_unique()
        );

        Ok(Self {
            name: name.to_string(),
            path,
            layout,
            db: ArcSwapOption::from(Some(Arc::new(db))),
            closed: AtomicBool::new(false),
            state: Mutex::new(IndexState::Empty),
            ready: Condvar::new(),
            apply_gate: Mutex::new(()),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn handle(&self) -> Result<Arc<Database>, IndexError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        self.db.load_full().ok_or(IndexError::Closed)
    }

    fn await_ready(&self) -> Result<(), IndexError> {
        let mut st = self.state.lock();
        while *st != IndexState::Ready {
            if self.closed.load(Ordering::Acquire) {
                return Err(IndexError::Closed);
            }
            self.ready.wait(&mut st);
        }
        Ok(())
    }

    /// 整批放进一个写事务；任一记录失败则丢弃事务（读者看不到半批）
    fn apply_batch(&self, batch: &mut ChangeBatch) -> Result<ApplyStats, IndexError> {
        let db = self.handle()?;
        let txn = db.begin_write().map_err(storage)?;
        let mut stats = ApplyStats::default();
        {
            let mut rows = txn.open_table(ROWS).map_err(storage)?;
            let mut members = txn.open_table(JOIN_MEMBERS).map_err(storage)?;

            for rec in batch {
                if self.closed.load(Ordering::Acquire) {
                    return Err(IndexError::Closed);
                }
                match rec? {
                    ChangeRecord::Upsert(row) => {
                        self.apply_upsert(&mut rows, &mut members, &row)?;
                        stats.upserts += 1;
                    }
                    ChangeRecord::Delete(key) => {
                        self.apply_delete(&mut rows, &mut members, &key)?;
                        stats.deletes += 1;
                    }
                }
            }
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        txn.commit().map_err(storage)?;
        Ok(stats)
    }

    fn apply_upsert(
        &self,
        rows: &mut redb::Table<&'static [u8], &'static [u8]>,
        members: &mut redb::Table<&'static [u8], &'static [u8]>,
        row: &ProjectedRow,
    ) -> Result<(), IndexError> {
        let rk = self.layout.record_key(row)?.encode()?;
        let value = bincode::serialize(row)?;

        if !self.layout.is_unique() {
            let jk = self.layout.join_key(row)?.encode()?;
            let old_jk = match read_row(rows, &rk)? {
                Some(old) => Some(self.layout.join_key(&old)?.encode()?),
                None => None,
            };
            if old_jk.as_deref() != Some(jk.as_slice()) {
                if let Some(old_jk) = old_jk {
                    remove_member(members, &old_jk, &rk)?;
                }
                add_member(members, &jk, &rk)?;
            }
        }

        rows.insert(rk.as_slice(), value.as_slice())
            .map_err(storage)?;
        Ok(())
    }

    fn apply_delete(
        &self,
        rows: &mut redb::Table<&'static [u8], &'static [u8]>,
        members: &mut redb::Table<&'static [u8], &'static [u8]>,
        key: &JoinKey,
    ) -> Result<(), IndexError> {
        let rk = key.encode()?;
        if !self.layout.is_unique() {
            if let Some(old) = read_row(rows, &rk)? {
                let old_jk = self.layout.join_key(&old)?.encode()?;
                remove_member(members, &old_jk, &rk)?;
            }
        }
        rows.remove(rk.as_slice()).map_err(storage)?;
        Ok(())
    }
}

impl KeyValueIndex for RedbIndex {
    fn initialize(&self, batch: &mut ChangeBatch) -> Result<ApplyStats, IndexError> {
        let _gate = self.apply_gate.lock();
        {
            let mut st = self.state.lock();
            if *st == IndexState::Ready {
                return Err(IndexError::InvalidState(
                    "initialize called on an index that is already ready",
                ));
            }
            *st = IndexState::Loading;
        }
        self.apply_batch(batch)
    }

    fn upsert(&self, batch: &mut ChangeBatch) -> Result<ApplyStats, IndexError> {
        let _gate = self.apply_gate.lock();
        if *self.state.lock() != IndexState::Ready {
            return Err(IndexError::InvalidState(
                "upsert called before the first full load completed",
            ));
        }
        self.apply_batch(batch)
    }

    fn get(&self, key: &JoinKey) -> Result<Vec<ProjectedRow>, IndexError> {
        self.await_ready()?;
        let db = self.handle()?;
        let kb = key.encode()?;

        let txn = db.begin_read().map_err(storage)?;
        let rows = txn.open_table(ROWS).map_err(storage)?;

        if self.layout.is_unique() {
            return Ok(read_row(&rows, &kb)?.into_iter().collect());
        }

        // 同一读事务内解析成员与行：多行结果来自同一快照
        let members = txn.open_table(JOIN_MEMBERS).map_err(storage)?;
        let mut out = Vec::new();
        for rk in read_members(&members, &kb)? {
            if let Some(row) = read_row(&rows, &rk)? {
                out.push(row);
            }
        }
        Ok(out)
    }

    fn initialized(&self) -> bool {
        *self.state.lock() == IndexState::Ready
    }

    fn state(&self) -> IndexState {
        *self.state.lock()
    }

    fn wait_initialization_completed(&self) -> Result<(), IndexError> {
        // 拿到写闸门即意味着进行中的加载已结束
        let _gate = self.apply_gate.lock();
        if self.closed.load(Ordering::Acquire) {
            return Err(IndexError::Closed);
        }
        let mut st = self.state.lock();
        match *st {
            IndexState::Ready => return Ok(()),
            IndexState::Empty => {
                tracing::info!(
                    "Index {} completed initialization with an empty source",
                    self.name
                );
            }
            IndexState::Loading => {
                tracing::info!("Index {} first full load completed", self.name);
            }
        }
        *st = IndexState::Ready;
        self.ready.notify_all();
        Ok(())
    }

    fn len(&self) -> Result<u64, IndexError> {
        let db = self.handle()?;
        let txn = db.begin_read().map_err(storage)?;
        let rows = txn.open_table(ROWS).map_err(storage)?;
        rows.len().map_err(storage)
    }

    fn disk_usage(&self) -> u64 {
        std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0)
    }

    fn close(&self) -> Result<(), IndexError> {
        {
            let _st = self.state.lock();
            if self.closed.swap(true, Ordering::AcqRel) {
                return Ok(());
            }
            // 唤醒阻塞在首次加载上的读者
            self.ready.notify_all();
        }

        drop(self.db.swap(None));

        match std::fs::remove_file(&self.path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                tracing::warn!("Failed to remove local index file {:?}: {}", self.path, e);
            }
        }
        tracing::info!("Local index closed: table={}", self.name);
        Ok(())
    }
}

impl Drop for RedbIndex {
    fn drop(&mut self) {
        let _ = KeyValueIndex::close(self);
    }
}

fn read_row<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    key: &[u8],
) -> Result<Option<ProjectedRow>, IndexError> {
    match table.get(key).map_err(storage)? {
        Some(guard) => Ok(Some(bincode::deserialize(guard.value())?)),
        None => Ok(None),
    }
}

fn read_members<T: ReadableTable<&'static [u8], &'static [u8]>>(
    table: &T,
    join_key: &[u8],
) -> Result<Vec<Vec<u8>>, IndexError> {
    match table.get(join_key).map_err(storage)? {
        Some(guard) => Ok(bincode::deserialize(guard.value())?),
        None => Ok(Vec::new()),
    }
}

fn add_member(
    table: &mut redb::Table<&'static [u8], &'static [u8]>,
    join_key: &[u8],
    record_key: &[u8],
) -> Result<(), IndexError> {
    let mut set = read_members(table, join_key)?;
    if !set.iter().any(|k| k.as_slice() == record_key) {
        set.push(record_key.to_vec());
    }
    let encoded = bincode::serialize(&set)?;
    table
        .insert(join_key, encoded.as_slice())
        .map_err(storage)?;
    Ok(())
}

fn remove_member(
    table: &mut redb::Table<&'static [u8], &'static [u8]>,
    join_key: &[u8],
    record_key: &[u8],
) -> Result<(), IndexError> {
    let mut set = read_members(table, join_key)?;
    set.retain(|k| k.as_slice() != record_key);
    if set.is_empty() {
        table.remove(join_key).map_err(storage)?;
    } else {
        let encoded = bincode::serialize(&set)?;
        table
            .insert(join_key, encoded.as_slice())
            .map_err(storage)?;
    }
    Ok(())
}

/// 每个 cache 实例一个独立文件：`<dir>/<table>-lookup-<xxh3>.redb`
#[derive(Clone, Debug, Default)]
pub struct RedbIndexFactory;

impl RedbIndexFactory {
    pub fn index_path(storage_dir: &Path, table_name: &str) -> PathBuf {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let seq = OPEN_SEQ.fetch_add(1, Ordering::Relaxed);

        let mut seed = Vec::with_capacity(table_name.len() + 20);
        seed.extend_from_slice(table_name.as_bytes());
        seed.extend_from_slice(&std::process::id().to_le_bytes());
        seed.extend_from_slice(&nanos.to_le_bytes());
        seed.extend_from_slice(&seq.to_le_bytes());
        let suffix = xxhash_rust::xxh3::xxh3_64(&seed);

        let safe: String = table_name
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        storage_dir.join(format!("{safe}-lookup-{suffix:016x}.redb"))
    }
}

impl IndexFactory for RedbIndexFactory {
    fn create(
        &self,
        table_name: &str,
        storage_dir: &Path,
        layout: KeyLayout,
    ) -> Result<Arc<dyn KeyValueIndex>, IndexError> {
        let path = Self::index_path(storage_dir, table_name);
        Ok(Arc::new(RedbIndex::open(table_name, path, layout)?))
    }
}
