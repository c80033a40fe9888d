use crate::core::{JoinKey, ProjectedRow};
use crate::index::IndexError;

/// 记录 key 与 join key 的布局
///
/// - 两者列表相同：唯一索引，行直接存在 join key 下。
/// - 否则：二级索引，行存在主键下，另维护 join key → 主键集合。
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyLayout {
    primary_keys: Vec<String>,
    join_keys: Vec<String>,
}

impl KeyLayout {
    pub fn new(primary_keys: Vec<String>, join_keys: Vec<String>) -> Self {
        Self {
            primary_keys,
            join_keys,
        }
    }

    pub fn unique(join_keys: Vec<String>) -> Self {
        Self {
            primary_keys: join_keys.clone(),
            join_keys,
        }
    }

    pub fn is_unique(&self) -> bool {
        self.primary_keys == self.join_keys
    }

    pub fn primary_keys(&self) -> &[String] {
        &self.primary_keys
    }

    pub fn join_keys(&self) -> &[String] {
        &self.join_keys
    }

    pub fn record_key(&self, row: &ProjectedRow) -> Result<JoinKey, IndexError> {
        row.key_for(&self.primary_keys)
            .map_err(IndexError::MissingKeyColumn)
    }

    pub fn join_key(&self, row: &ProjectedRow) -> Result<JoinKey, IndexError> {
        row.key_for(&self.join_keys)
            .map_err(IndexError::MissingKeyColumn)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScalarValue;

    #[test]
    fn layout_uniqueness_depends_on_column_lists() {
        assert!(KeyLayout::unique(vec!["id".into()]).is_unique());
        assert!(!KeyLayout::new(vec!["id".into()], vec!["city".into()]).is_unique());
        // 列顺序不同也按二级索引处理
        assert!(!KeyLayout::new(
            vec!["a".into(), "b".into()],
            vec!["b".into(), "a".into()]
        )
        .is_unique());
    }

    #[test]
    fn missing_key_column_is_reported() {
        let layout = KeyLayout::new(vec!["id".into()], vec!["city".into()]);
        let row = ProjectedRow::from_pairs([("id", ScalarValue::Int64(1))]);
        assert!(layout.record_key(&row).is_ok());
        assert!(matches!(
            layout.join_key(&row),
            Err(IndexError::MissingKeyColumn(c)) if c == "city"
        ));
    }
}
