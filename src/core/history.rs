//! 运行历史 - 每行一个 JSON 格式的 RunReport，只追加不修改

use super::report::RunReport;
use crate::error::Result;
use std::path::{Path, PathBuf};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::warn;

pub const HISTORY_FILE: &str = "history.jsonl";

pub struct RunHistory {
    path: PathBuf,
    write_lock: Mutex<()>,
}

impl RunHistory {
    pub fn new(state_dir: &Path) -> Self {
        Self {
            path: state_dir.join(HISTORY_FILE),
            write_lock: Mutex::new(()),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// 追加一条报告
    pub async fn append(&self, report: &RunReport) -> Result<()> {
        let mut line = serde_json::to_vec(report).map_err(std::io::Error::other)?;
        line.push(b'\n');

        let _guard = self.write_lock.lock().await;
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(&line).await?;
        file.sync_data().await?;
        Ok(())
    }

    /// 读取最近的 limit 条报告（按时间正序）
    ///
    /// 无法解析的行（例如崩溃时写了一半）会被跳过。
    pub async fn read_recent(&self, limit: usize) -> Result<Vec<RunReport>> {
        let content = match tokio::fs::read_to_string(&self.path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };

        let mut reports: Vec<RunReport> = content
            .lines()
            .filter(|line| !line.trim().is_empty())
            .filter_map(|line| match serde_json::from_str(line) {
                Ok(report) => Some(report),
                Err(e) => {
                    warn!("跳过无法解析的历史记录: {}", e);
                    None
                }
            })
            .collect();

        if reports.len() > limit {
            reports.drain(..reports.len() - limit);
        }
        Ok(reports)
    }

    /// 最后一个周期的序号，没有历史时为 0
    pub async fn last_cycle(&self) -> Result<u64> {
        Ok(self
            .read_recent(1)
            .await?
            .last()
            .map(|r| r.cycle)
            .unwrap_or(0))
    }
}
