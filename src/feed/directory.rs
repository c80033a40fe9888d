use std::fs::File;
use std::io::{BufRead, BufReader, Lines};
use std::path::{Path, PathBuf};

use serde::Deserialize;

use crate::core::{ChangeRecord, JoinKey, ProjectedRow, ScalarValue};
use crate::feed::filter::RowFilter;
use crate::feed::{ChangeBatch, ChangeFeed, FeedError, FeedPosition};

const BATCH_PREFIX: &str = "batch-";
const BATCH_SUFFIX: &str = ".jsonl";

/// 批次文件中的一行
#[derive(Deserialize)]
#[serde(tag = "op", rename_all = "lowercase")]
enum WireRecord {
    Upsert {
        row: serde_json::Map<String, serde_json::Value>,
    },
    Delete {
        key: Vec<serde_json::Value>,
    },
}

/// 目录变更源：`batch-<16 位 hex>.jsonl`，按 id 升序消费
///
/// - 每个文件是一个批次；文件句柄就是该批次的 I/O 资源，逐行惰性解析。
/// - 行过滤在这里（读端）完成：不再满足过滤的 upsert 改写为按记录 key 的 delete。
/// - 游标不落盘：进程重启后从头全量加载。
pub struct DirectoryChangeFeed {
    dir: PathBuf,
    key_columns: Vec<String>,
    filter: RowFilter,
    committed: Option<u64>,
    name: String,
}

impl DirectoryChangeFeed {
    pub fn new(dir: PathBuf, key_columns: Vec<String>, filter: RowFilter) -> Self {
        let name = format!("dir:{}", dir.display());
        Self {
            dir,
            key_columns,
            filter,
            committed: None,
            name,
        }
    }

    pub fn batch_file_name(id: u64) -> String {
        format!("{BATCH_PREFIX}{id:016x}{BATCH_SUFFIX}")
    }

    /// 未提交的批次文件，按 id 升序；打开时直接用列出的路径
    fn pending_batches(&self) -> std::io::Result<Vec<(u64, PathBuf)>> {
        let mut batches = Vec::new();
        for ent in std::fs::read_dir(&self.dir)? {
            let Ok(ent) = ent else { continue };
            let path = ent.path();
            if let Some(id) = parse_batch_id(&path) {
                if self.committed.map_or(true, |c| id > c) {
                    batches.push((id, path));
                }
            }
        }
        batches.sort_unstable_by_key(|(id, _)| *id);
        Ok(batches)
    }
}

impl ChangeFeed for DirectoryChangeFeed {
    fn open(&mut self) -> Result<(), FeedError> {
        let md = std::fs::metadata(&self.dir)?;
        if !md.is_dir() {
            return Err(FeedError::Unavailable(format!(
                "{} is not a directory",
                self.dir.display()
            )));
        }
        tracing::info!(
            "Directory feed opened: {:?} (filter: {})",
            self.dir,
            self.filter
        );
        Ok(())
    }

    fn has_next(&self) -> bool {
        match self.pending_batches() {
            Ok(batches) => !batches.is_empty(),
            Err(e) => {
                // 交给 next_batch 重新列目录并把 I/O 错误抛给刷新周期
                tracing::warn!("{}: listing failed: {}", self.name(), e);
                true
            }
        }
    }

    fn next_batch(&mut self) -> Result<ChangeBatch, FeedError> {
        let Some((id, path)) = self.pending_batches()?.into_iter().next() else {
            return Err(FeedError::Exhausted);
        };
        let file = File::open(&path)?;
        tracing::debug!("Directory feed batch opened: {:?}", path);

        let reader = BatchReader {
            lines: BufReader::new(file).lines(),
            line_no: 0,
            key_columns: self.key_columns.clone(),
            filter: self.filter.clone(),
        };
        Ok(ChangeBatch::new(FeedPosition::new(id), reader))
    }

    fn commit(&mut self, position: FeedPosition) {
        let raw = position.raw();
        if self.committed.map_or(true, |c| raw > c) {
            self.committed = Some(raw);
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

struct BatchReader {
    lines: Lines<BufReader<File>>,
    line_no: usize,
    key_columns: Vec<String>,
    filter: RowFilter,
}

impl BatchReader {
    fn decode(&self, line: &str) -> Result<ChangeRecord, FeedError> {
        let bad = |message: String| FeedError::Decode {
            line: self.line_no,
            message,
        };
        let wire: WireRecord = serde_json::from_str(line).map_err(|e| bad(e.to_string()))?;
        match wire {
            WireRecord::Upsert { row } => {
                let mut columns = std::collections::BTreeMap::new();
                for (k, v) in row {
                    let v = ScalarValue::from_json(v).map_err(|m| bad(format!("column {k}: {m}")))?;
                    columns.insert(k, v);
                }
                let row = ProjectedRow::new(columns);
                if self.filter.is_empty() || self.filter.matches(&row) {
                    return Ok(ChangeRecord::Upsert(row));
                }
                // 移出过滤范围：按记录 key 删除
                let key = row
                    .key_for(&self.key_columns)
                    .map_err(|c| bad(format!("missing key column {c}")))?;
                Ok(ChangeRecord::Delete(key))
            }
            WireRecord::Delete { key } => {
                let values = key
                    .into_iter()
                    .map(ScalarValue::from_json)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(bad)?;
                if values.len() != self.key_columns.len() {
                    return Err(bad(format!(
                        "delete key has {} values, expected {}",
                        values.len(),
                        self.key_columns.len()
                    )));
                }
                Ok(ChangeRecord::Delete(JoinKey::new(values)))
            }
        }
    }
}

impl Iterator for BatchReader {
    type Item = Result<ChangeRecord, FeedError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let line = match self.lines.next()? {
                Ok(l) => l,
                Err(e) => return Some(Err(FeedError::Io(e))),
            };
            self.line_no += 1;
            if line.trim().is_empty() {
                continue;
            }
            return Some(self.decode(&line));
        }
    }
}

/// 只认 `batch_file_name` 产出的名字：恰好 16 位小写 hex
fn parse_batch_id(path: &Path) -> Option<u64> {
    let name = path.file_name()?.to_str()?;
    let hex = name.strip_prefix(BATCH_PREFIX)?.strip_suffix(BATCH_SUFFIX)?;
    if hex.len() != 16 || !hex.bytes().all(|b| matches!(b, b'0'..=b'9' | b'a'..=b'f')) {
        return None;
    }
    u64::from_str_radix(hex, 16).ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feed::filter::RowFilterRule;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("lookup-cache-feed-{}-{}", tag, nanos))
    }

    fn write_batch(dir: &Path, id: u64, lines: &[&str]) {
        std::fs::write(
            dir.join(DirectoryChangeFeed::batch_file_name(id)),
            lines.join("\n"),
        )
        .unwrap();
    }

    #[test]
    fn batches_consumed_in_id_order_and_only_after_commit() {
        let dir = unique_tmp_dir("order");
        std::fs::create_dir_all(&dir).unwrap();
        write_batch(&dir, 2, &[r#"{"op":"delete","key":[2]}"#]);
        write_batch(&dir, 1, &[r#"{"op":"upsert","row":{"id":1,"name":"a"}}"#, ""]);
        std::fs::write(dir.join("README.txt"), b"ignored").unwrap();

        let mut feed = DirectoryChangeFeed::new(dir.clone(), vec!["id".into()], RowFilter::default());
        feed.open().unwrap();
        assert!(feed.has_next());

        let b = feed.next_batch().unwrap();
        assert_eq!(b.position(), FeedPosition::new(1));
        let recs: Vec<_> = b.map(|r| r.unwrap()).collect();
        assert_eq!(
            recs,
            vec![ChangeRecord::Upsert(ProjectedRow::from_pairs([
                ("id", ScalarValue::Int64(1)),
                ("name", ScalarValue::Utf8("a".into())),
            ]))]
        );
        feed.commit(FeedPosition::new(1));

        let b = feed.next_batch().unwrap();
        assert_eq!(b.position(), FeedPosition::new(2));
        feed.commit(b.position());
        assert!(!feed.has_next());
        assert!(matches!(feed.next_batch(), Err(FeedError::Exhausted)));

        // 新文件到达后可继续消费
        write_batch(&dir, 3, &[r#"{"op":"delete","key":[1]}"#]);
        assert!(feed.has_next());
    }

    #[test]
    fn filtered_upsert_becomes_delete() {
        let dir = unique_tmp_dir("filter");
        std::fs::create_dir_all(&dir).unwrap();
        write_batch(
            &dir,
            1,
            &[
                r#"{"op":"upsert","row":{"id":1,"region":"eu-west"}}"#,
                r#"{"op":"upsert","row":{"id":2,"region":"us-east"}}"#,
            ],
        );
        let filter = RowFilter::compile(&[RowFilterRule {
            column: "region".into(),
            pattern: "^eu-".into(),
        }])
        .unwrap();
        let mut feed = DirectoryChangeFeed::new(dir, vec!["id".into()], filter);
        let recs: Vec<_> = feed.next_batch().unwrap().map(|r| r.unwrap()).collect();
        assert!(!recs[0].is_delete());
        assert_eq!(
            recs[1],
            ChangeRecord::Delete(JoinKey::new(vec![ScalarValue::Int64(2)]))
        );
    }

    #[test]
    fn malformed_line_reports_line_number() {
        let dir = unique_tmp_dir("bad");
        std::fs::create_dir_all(&dir).unwrap();
        write_batch(
            &dir,
            1,
            &[r#"{"op":"delete","key":[1]}"#, r#"{"op":"explode"}"#],
        );
        let mut feed = DirectoryChangeFeed::new(dir, vec!["id".into()], RowFilter::default());
        let mut b = feed.next_batch().unwrap();
        assert!(b.next().unwrap().is_ok());
        match b.next().unwrap() {
            Err(FeedError::Decode { line, .. }) => assert_eq!(line, 2),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn open_fails_for_missing_directory() {
        let mut feed = DirectoryChangeFeed::new(
            unique_tmp_dir("missing"),
            vec!["id".into()],
            RowFilter::default(),
        );
        assert!(matches!(feed.open(), Err(FeedError::Io(_))));
    }

    #[test]
    fn parse_batch_id_rejects_other_names() {
        assert_eq!(
            parse_batch_id(Path::new("/x/batch-00000000000000ff.jsonl")),
            Some(255)
        );
        assert_eq!(parse_batch_id(Path::new("/x/batch-zz.jsonl")), None);
        assert_eq!(parse_batch_id(Path::new("/x/other-01.jsonl")), None);
        assert_eq!(parse_batch_id(Path::new("/x/batch-2.jsonl")), None);
        assert_eq!(parse_batch_id(Path::new("/x/batch-00000000000000FF.jsonl")), None);
        assert_eq!(parse_batch_id(Path::new("/x/batch-+000000000000001.jsonl")), None);
    }

    #[test]
    fn stray_batch_like_files_are_ignored() {
        let dir = unique_tmp_dir("stray");
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(dir.join("batch-2.jsonl"), r#"{"op":"delete","key":[2]}"#).unwrap();
        std::fs::write(dir.join("batch-+000000000000003.jsonl"), b"").unwrap();

        let mut feed = DirectoryChangeFeed::new(dir.clone(), vec!["id".into()], RowFilter::default());
        feed.open().unwrap();
        assert!(!feed.has_next());

        write_batch(&dir, 5, &[r#"{"op":"delete","key":[5]}"#]);
        assert!(feed.has_next());
        let b = feed.next_batch().unwrap();
        assert_eq!(b.position(), FeedPosition::new(5));
        assert_eq!(b.count(), 1);
    }

    #[test]
    fn listing_failure_surfaces_from_next_batch() {
        let dir = unique_tmp_dir("vanished");
        std::fs::create_dir_all(&dir).unwrap();
        let mut feed = DirectoryChangeFeed::new(dir.clone(), vec!["id".into()], RowFilter::default());
        feed.open().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();

        // 列目录失败不能被当成“没有新批次”
        assert!(feed.has_next());
        assert!(matches!(feed.next_batch(), Err(FeedError::Io(_))));
    }
}
