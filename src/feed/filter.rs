use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::core::ProjectedRow;

/// 单列过滤规则（配置形态）
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RowFilterRule {
    pub column: String,
    pub pattern: String,
}

/// 读端行过滤：所有规则都匹配列的显示值才保留
///
/// 不满足过滤的 upsert 由数据读取方改写为 delete，保证“移出过滤范围”的行从索引消失。
#[derive(Clone, Debug, Default)]
pub struct RowFilter {
    rules: Vec<(String, Regex)>,
}

impl RowFilter {
    pub fn compile(rules: &[RowFilterRule]) -> Result<Self, regex::Error> {
        let mut compiled = Vec::with_capacity(rules.len());
        for r in rules {
            compiled.push((r.column.clone(), Regex::new(&r.pattern)?));
        }
        Ok(Self { rules: compiled })
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    pub fn matches(&self, row: &ProjectedRow) -> bool {
        self.rules.iter().all(|(col, re)| match row.get(col) {
            Some(v) if !v.is_null() => re.is_match(&v.to_string()),
            // 缺列或 NULL：视为不匹配
            _ => false,
        })
    }
}

impl std::fmt::Display for RowFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.rules.is_empty() {
            return write!(f, "<none>");
        }
        for (i, (col, re)) in self.rules.iter().enumerate() {
            if i > 0 {
                write!(f, " AND ")?;
            }
            write!(f, "{} ~ /{}/", col, re.as_str())?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::ScalarValue;

    fn rule(column: &str, pattern: &str) -> RowFilterRule {
        RowFilterRule {
            column: column.to_string(),
            pattern: pattern.to_string(),
        }
    }

    #[test]
    fn all_rules_must_match() {
        let f = RowFilter::compile(&[rule("region", "^eu-"), rule("tier", "gold|silver")]).unwrap();
        let ok = ProjectedRow::from_pairs([("region", "eu-west"), ("tier", "gold")]);
        let wrong_tier = ProjectedRow::from_pairs([("region", "eu-west"), ("tier", "bronze")]);
        assert!(f.matches(&ok));
        assert!(!f.matches(&wrong_tier));
    }

    #[test]
    fn null_or_missing_column_does_not_match() {
        let f = RowFilter::compile(&[rule("region", ".*")]).unwrap();
        let null = ProjectedRow::from_pairs([("region", ScalarValue::Null)]);
        let missing = ProjectedRow::from_pairs([("other", 1i64)]);
        assert!(!f.matches(&null));
        assert!(!f.matches(&missing));
    }

    #[test]
    fn empty_filter_keeps_everything() {
        let f = RowFilter::default();
        assert!(f.matches(&ProjectedRow::from_pairs([("a", 1i64)])));
        assert_eq!(f.to_string(), "<none>");
    }

    #[test]
    fn bad_pattern_is_rejected() {
        assert!(RowFilter::compile(&[rule("a", "(")]).is_err());
    }
}
