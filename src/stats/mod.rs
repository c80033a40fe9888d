use std::fmt;

use serde::Serialize;

/// lookup cache 运行快照（`/status` 与周期日志共用）
#[derive(Clone, Debug, Default, Serialize)]
pub struct CacheStats {
    pub table: String,
    /// created / open / closed
    pub state: String,
    /// 未打开时为 None
    pub index_state: Option<String>,
    /// 本地索引记录数
    pub entries: u64,
    /// 本地索引文件大小
    pub storage_bytes: u64,
    /// 真正执行过的刷新周期（不含 no-op tick）
    pub cycles: u64,
    pub batches: u64,
    pub records: u64,
    /// 最近一次刷新周期耗时（gauge）
    pub last_cycle_ms: u64,
    /// 首个后台失败原因
    pub failure: Option<String>,
    /// 进程级 RSS（从 /proc/self/statm 读取）
    pub process_rss_bytes: u64,
}

impl CacheStats {
    /// 从 /proc/self/statm 读取进程 RSS
    pub fn read_process_rss() -> u64 {
        std::fs::read_to_string("/proc/self/statm")
            .ok()
            .and_then(|s| {
                // statm 格式: size resident shared text lib data dt (单位: 页)
                let parts: Vec<&str> = s.split_whitespace().collect();
                parts.get(1)?.parse::<u64>().ok()
            })
            .map(|pages| pages * 4096)
            .unwrap_or(0)
    }

    pub fn healthy(&self) -> bool {
        self.failure.is_none()
    }
}

fn human_bytes(bytes: u64) -> String {
    const KB: u64 = 1024;
    const MB: u64 = 1024 * KB;
    const GB: u64 = 1024 * MB;
    if bytes >= GB {
        format!("{:.2} GB", bytes as f64 / GB as f64)
    } else if bytes >= MB {
        format!("{:.2} MB", bytes as f64 / MB as f64)
    } else if bytes >= KB {
        format!("{:.2} KB", bytes as f64 / KB as f64)
    } else {
        format!("{} B", bytes)
    }
}

impl fmt::Display for CacheStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "╔══════════════════════════════════════════════════╗")?;
        writeln!(f, "║ Lookup Cache: {:<34} ║", self.table)?;
        writeln!(f, "╠══════════════════════════════════════════════════╣")?;
        writeln!(
            f,
            "║   state:        {:>10}  index: {:>10}      ║",
            self.state,
            self.index_state.as_deref().unwrap_or("-")
        )?;
        writeln!(
            f,
            "║   entries:      {:>10}  ({:>10})          ║",
            self.entries,
            human_bytes(self.storage_bytes)
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(f, "║ Refresh:                                         ║")?;
        writeln!(
            f,
            "║   cycles:       {:>10}                       ║",
            self.cycles
        )?;
        writeln!(
            f,
            "║   batches:      {:>10}                       ║",
            self.batches
        )?;
        writeln!(
            f,
            "║   records:      {:>10}                       ║",
            self.records
        )?;
        writeln!(
            f,
            "║   last cycle:   {:>8}ms                       ║",
            self.last_cycle_ms
        )?;
        writeln!(f, "╠──────────────────────────────────────────────────╣")?;
        writeln!(
            f,
            "║ Process RSS: {:>35} ║",
            human_bytes(self.process_rss_bytes)
        )?;
        if let Some(cause) = &self.failure {
            writeln!(f, "║ FAILED: {}", cause)?;
        }
        writeln!(f, "╚══════════════════════════════════════════════════╝")?;
        Ok(())
    }
}
