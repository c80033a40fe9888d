use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;

use crate::error::LookupError;
use crate::feed::{RowFilter, RowFilterRule};
use crate::index::KeyLayout;

const DEFAULT_REFRESH_INTERVAL_SECS: u64 = 10;
const DEFAULT_CLOSE_GRACE_MS: u64 = 5000;

/// 单个 lookup cache 的配置
#[derive(Clone, Debug)]
pub struct LookupConfig {
    pub table_name: String,
    /// 刷新周期（fixed delay）
    pub refresh_interval: Duration,
    /// 本地索引文件所在目录
    pub local_storage_path: PathBuf,
    pub join_keys: Vec<String>,
    /// 记录 key；为空时等于 join_keys
    pub primary_keys: Vec<String>,
    pub row_filter: Vec<RowFilterRule>,
    /// close 时等待进行中刷新的上限
    pub close_grace: Duration,
}

/// TOML 形态
#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawConfig {
    table_name: String,
    #[serde(default = "default_refresh_interval_secs")]
    refresh_interval_secs: u64,
    #[serde(default)]
    local_storage_path: Option<PathBuf>,
    join_keys: Vec<String>,
    #[serde(default)]
    primary_keys: Vec<String>,
    #[serde(default)]
    row_filter: Vec<RowFilterRule>,
    #[serde(default = "default_close_grace_ms")]
    close_grace_ms: u64,
}

fn default_refresh_interval_secs() -> u64 {
    DEFAULT_REFRESH_INTERVAL_SECS
}

fn default_close_grace_ms() -> u64 {
    DEFAULT_CLOSE_GRACE_MS
}

/// 默认落在用户缓存目录，没有则退回系统临时目录
pub fn default_storage_path() -> PathBuf {
    dirs::cache_dir()
        .map(|d| d.join("lookup-cache"))
        .unwrap_or_else(|| std::env::temp_dir().join("lookup-cache"))
}

impl LookupConfig {
    pub fn new(table_name: impl Into<String>, join_keys: Vec<String>) -> Self {
        Self {
            table_name: table_name.into(),
            refresh_interval: Duration::from_secs(DEFAULT_REFRESH_INTERVAL_SECS),
            local_storage_path: default_storage_path(),
            join_keys,
            primary_keys: Vec::new(),
            row_filter: Vec::new(),
            close_grace: Duration::from_millis(DEFAULT_CLOSE_GRACE_MS),
        }
    }

    pub fn with_refresh_interval(mut self, interval: Duration) -> Self {
        self.refresh_interval = interval;
        self
    }

    pub fn with_local_storage_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.local_storage_path = path.into();
        self
    }

    pub fn with_primary_keys(mut self, primary_keys: Vec<String>) -> Self {
        self.primary_keys = primary_keys;
        self
    }

    pub fn with_row_filter(mut self, rules: Vec<RowFilterRule>) -> Self {
        self.row_filter = rules;
        self
    }

    pub fn with_close_grace(mut self, grace: Duration) -> Self {
        self.close_grace = grace;
        self
    }

    pub fn from_toml_str(s: &str) -> Result<Self, LookupError> {
        let raw: RawConfig =
            toml::from_str(s).map_err(|e| LookupError::Config(format!("parse error: {e}")))?;
        let cfg = Self {
            table_name: raw.table_name,
            refresh_interval: Duration::from_secs(raw.refresh_interval_secs),
            local_storage_path: raw.local_storage_path.unwrap_or_else(default_storage_path),
            join_keys: raw.join_keys,
            primary_keys: raw.primary_keys,
            row_filter: raw.row_filter,
            close_grace: Duration::from_millis(raw.close_grace_ms),
        };
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn load(path: &Path) -> Result<Self, LookupError> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| LookupError::Config(format!("cannot read {}: {e}", path.display())))?;
        Self::from_toml_str(&contents)
    }

    pub fn validate(&self) -> Result<(), LookupError> {
        if self.table_name.trim().is_empty() {
            return Err(LookupError::Config("table_name must not be empty".into()));
        }
        if self.join_keys.is_empty() {
            return Err(LookupError::Config("join_keys must not be empty".into()));
        }
        if self.refresh_interval.is_zero() {
            return Err(LookupError::Config("refresh interval must be > 0".into()));
        }
        check_columns("join_keys", &self.join_keys)?;
        check_columns("primary_keys", &self.primary_keys)?;
        self.row_filter()?;
        Ok(())
    }

    /// 记录 key 与 join key 的布局
    pub fn layout(&self) -> KeyLayout {
        if self.primary_keys.is_empty() {
            KeyLayout::unique(self.join_keys.clone())
        } else {
            KeyLayout::new(self.primary_keys.clone(), self.join_keys.clone())
        }
    }

    pub fn row_filter(&self) -> Result<RowFilter, LookupError> {
        RowFilter::compile(&self.row_filter)
            .map_err(|e| LookupError::Config(format!("invalid row_filter pattern: {e}")))
    }
}

fn check_columns(field: &str, columns: &[String]) -> Result<(), LookupError> {
    let mut seen = HashSet::new();
    for c in columns {
        if c.trim().is_empty() {
            return Err(LookupError::Config(format!("{field} contains an empty column name")));
        }
        if !seen.insert(c.as_str()) {
            return Err(LookupError::Config(format!("{field} lists column {c:?} twice")));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn toml_with_defaults() {
        let cfg = LookupConfig::from_toml_str(
            r#"
table_name = "dim_user"
join_keys = ["user_id"]
"#,
        )
        .unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(10));
        assert_eq!(cfg.close_grace, Duration::from_millis(5000));
        assert!(cfg.layout().is_unique());
        assert!(cfg.row_filter().unwrap().is_empty());
        assert!(cfg.local_storage_path.ends_with("lookup-cache"));
    }

    #[test]
    fn toml_full() {
        let cfg = LookupConfig::from_toml_str(
            r#"
table_name = "dim_user"
refresh_interval_secs = 3
local_storage_path = "/var/tmp/lc"
join_keys = ["city"]
primary_keys = ["user_id"]
close_grace_ms = 250

[[row_filter]]
column = "region"
pattern = "^eu-"
"#,
        )
        .unwrap();
        assert_eq!(cfg.refresh_interval, Duration::from_secs(3));
        assert_eq!(cfg.local_storage_path, PathBuf::from("/var/tmp/lc"));
        assert_eq!(cfg.close_grace, Duration::from_millis(250));
        assert!(!cfg.layout().is_unique());
        assert_eq!(cfg.row_filter.len(), 1);
    }

    #[test]
    fn invalid_values_are_config_errors() {
        let cases = [
            "table_name = \"\"\njoin_keys = [\"id\"]",
            "table_name = \"t\"\njoin_keys = []",
            "table_name = \"t\"\njoin_keys = [\"id\"]\nrefresh_interval_secs = 0",
            "table_name = \"t\"\njoin_keys = [\"id\", \"id\"]",
            "table_name = \"t\"\njoin_keys = [\"id\"]\n[[row_filter]]\ncolumn = \"x\"\npattern = \"(\"",
            "table_name = \"t\"\njoin_keys = [\"id\"]\nunknown = 1",
        ];
        for c in cases {
            assert!(
                matches!(LookupConfig::from_toml_str(c), Err(LookupError::Config(_))),
                "accepted: {c}"
            );
        }
    }

    #[test]
    fn builder_matches_toml_semantics() {
        let cfg = LookupConfig::new("t", vec!["id".into()])
            .with_refresh_interval(Duration::from_millis(50))
            .with_primary_keys(vec!["id".into()]);
        cfg.validate().unwrap();
        assert!(cfg.layout().is_unique());
    }
}
