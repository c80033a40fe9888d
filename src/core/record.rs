use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::core::value::{JoinKey, ScalarValue};

/// 投影行：只含查询所需列 + key 列，构造后不可变
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProjectedRow {
    columns: BTreeMap<String, ScalarValue>,
}

impl ProjectedRow {
    pub fn new(columns: BTreeMap<String, ScalarValue>) -> Self {
        Self { columns }
    }

    pub fn from_pairs<K, V, I>(pairs: I) -> Self
    where
        K: Into<String>,
        V: Into<ScalarValue>,
        I: IntoIterator<Item = (K, V)>,
    {
        Self {
            columns: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        }
    }

    pub fn get(&self, column: &str) -> Option<&ScalarValue> {
        self.columns.get(column)
    }

    /// 按列顺序抽取 key；缺列时返回缺失的列名
    pub fn key_for<S: AsRef<str>>(&self, key_columns: &[S]) -> Result<JoinKey, String> {
        let mut values = Vec::with_capacity(key_columns.len());
        for c in key_columns {
            let c = c.as_ref();
            match self.columns.get(c) {
                Some(v) => values.push(v.clone()),
                None => return Err(c.to_string()),
            }
        }
        Ok(JoinKey::new(values))
    }

    pub fn to_json(&self) -> serde_json::Value {
        let map = self
            .columns
            .iter()
            .map(|(k, v)| (k.clone(), v.to_json()))
            .collect::<serde_json::Map<_, _>>();
        serde_json::Value::Object(map)
    }
}

/// 源端观察到的一条行级变更
///
/// 同一批次内按顺序应用；同一 key 的后一条覆盖前一条。
/// `Delete` 携带记录 key（唯一索引时即 join key）。
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeRecord {
    Upsert(ProjectedRow),
    Delete(JoinKey),
}

impl ChangeRecord {
    pub fn is_delete(&self) -> bool {
        matches!(self, ChangeRecord::Delete(_))
    }
}
