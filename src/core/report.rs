//! 运行报告 - 每个同步周期都会生成一份，无论成功与否

use super::conflict::ConflictRecord;
use super::planner::{ActionKind, SyncPlan};
use crate::error::{ErrorKind, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Instant;
use uuid::Uuid;

/// 各类动作的数量
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ActionCounts {
    pub upload: usize,
    pub download: usize,
    pub delete_local: usize,
    pub delete_remote: usize,
    pub track: usize,
    pub skip: usize,
}

impl ActionCounts {
    pub fn add(&mut self, kind: ActionKind) {
        match kind {
            ActionKind::Upload => self.upload += 1,
            ActionKind::Download => self.download += 1,
            ActionKind::DeleteLocal => self.delete_local += 1,
            ActionKind::DeleteRemote => self.delete_remote += 1,
            ActionKind::Track => self.track += 1,
            ActionKind::Skip => self.skip += 1,
        }
    }

    pub fn from_plan(plan: &SyncPlan) -> Self {
        let mut counts = Self::default();
        for action in &plan.actions {
            counts.add(action.kind);
        }
        counts
    }

    /// 除 skip 外的动作数
    pub fn changes(&self) -> usize {
        self.upload + self.download + self.delete_local + self.delete_remote + self.track
    }
}

/// 失败记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Failure {
    /// 出错的路径，整个存储不可用时为空
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub kind: ErrorKind,
    pub message: String,
}

impl Failure {
    pub fn for_path(path: &str, error: &SyncError) -> Self {
        Self {
            path: Some(path.to_string()),
            kind: error.kind(),
            message: error.to_string(),
        }
    }

    pub fn store_wide(error: &SyncError) -> Self {
        Self {
            path: None,
            kind: error.kind(),
            message: error.to_string(),
        }
    }
}

/// 周期结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// 所有动作都成功
    Completed,
    /// 部分文件失败
    Partial,
    /// 存储级错误，本周期未执行任何动作
    Degraded,
}

/// 运行报告
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RunReport {
    pub cycle: u64,
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub elapsed_ms: u64,
    pub status: RunStatus,
    /// 远程存储名称
    pub remote: String,
    /// 计划的动作数量
    pub planned: ActionCounts,
    /// 成功完成的动作数量
    pub completed: ActionCounts,
    pub bytes_transferred: u64,
    pub failures: Vec<Failure>,
    pub conflicts: Vec<ConflictRecord>,
    pub ambiguous: Vec<String>,
    /// 无法映射到同步目录内而被拒绝的路径
    #[serde(default)]
    pub invalid: Vec<String>,
    pub settled: usize,
    pub filtered: usize,
    /// 超过大小限制而未同步的路径数
    #[serde(default)]
    pub oversized: usize,
}

impl RunReport {
    pub fn is_degraded(&self) -> bool {
        self.status == RunStatus::Degraded
    }
}

impl fmt::Display for RunReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "周期 #{} [{:?}]: 上传 {}, 下载 {}, 删除本地 {}, 删除远程 {}, 登记 {}, 跳过 {}, 失败 {}, 冲突 {}, {} 字节, 耗时 {}ms",
            self.cycle,
            self.status,
            self.completed.upload,
            self.completed.download,
            self.completed.delete_local,
            self.completed.delete_remote,
            self.completed.track,
            self.completed.skip,
            self.failures.len(),
            self.conflicts.len(),
            self.bytes_transferred,
            self.elapsed_ms
        )
    }
}

/// 执行阶段的结果
#[derive(Debug, Clone, Default)]
pub struct ExecutionOutcome {
    pub completed: ActionCounts,
    pub bytes_transferred: u64,
    pub failures: Vec<Failure>,
    pub settled: usize,
}

/// 报告构建器：周期开始时创建，结束时生成报告
pub struct ReportBuilder {
    cycle: u64,
    run_id: Uuid,
    remote: String,
    started_at: DateTime<Utc>,
    started: Instant,
}

impl ReportBuilder {
    pub fn start(cycle: u64, remote: &str) -> Self {
        Self {
            cycle,
            run_id: Uuid::new_v4(),
            remote: remote.to_string(),
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }

    pub fn run_id(&self) -> Uuid {
        self.run_id
    }

    fn base(self, status: RunStatus) -> RunReport {
        RunReport {
            cycle: self.cycle,
            run_id: self.run_id,
            started_at: self.started_at,
            finished_at: Utc::now(),
            elapsed_ms: self.started.elapsed().as_millis() as u64,
            status,
            remote: self.remote,
            planned: ActionCounts::default(),
            completed: ActionCounts::default(),
            bytes_transferred: 0,
            failures: Vec::new(),
            conflicts: Vec::new(),
            ambiguous: Vec::new(),
            invalid: Vec::new(),
            settled: 0,
            filtered: 0,
            oversized: 0,
        }
    }

    /// 存储级错误：不执行任何动作
    pub fn degraded(self, error: &SyncError) -> RunReport {
        let mut report = self.base(RunStatus::Degraded);
        report.failures.push(Failure::store_wide(error));
        report
    }

    /// 根据计划和执行结果生成报告
    pub fn finish(self, plan: &SyncPlan, outcome: ExecutionOutcome) -> RunReport {
        let mut failures = outcome.failures;
        failures.extend(plan.ambiguous.iter().map(|path| {
            Failure::for_path(path, &SyncError::AmbiguousPath(path.clone()))
        }));
        failures.extend(
            plan.invalid
                .iter()
                .map(|path| Failure::for_path(path, &SyncError::InvalidPath(path.clone()))),
        );

        let status = if failures.is_empty() {
            RunStatus::Completed
        } else {
            RunStatus::Partial
        };

        let mut report = self.base(status);
        report.planned = ActionCounts::from_plan(plan);
        report.completed = outcome.completed;
        report.bytes_transferred = outcome.bytes_transferred;
        report.failures = failures;
        report.conflicts = plan.conflicts.clone();
        report.ambiguous = plan.ambiguous.clone();
        report.invalid = plan.invalid.clone();
        report.settled = outcome.settled;
        report.filtered = plan.filtered;
        report.oversized = plan.oversized.len();
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_degraded_report() {
        let err = SyncError::ConnectivityError("connection refused".into());
        let report = ReportBuilder::start(3, "s3://bucket").degraded(&err);
        assert_eq!(report.cycle, 3);
        assert!(report.is_degraded());
        assert_eq!(report.completed.changes(), 0);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::ConnectivityError);
        assert!(report.failures[0].path.is_none());
    }

    #[test]
    fn test_ambiguous_paths_make_report_partial() {
        let plan = SyncPlan {
            ambiguous: vec!["A.txt".into(), "a.txt".into()],
            ..Default::default()
        };
        let report = ReportBuilder::start(1, "mem").finish(&plan, ExecutionOutcome::default());
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.failures.len(), 2);
        assert_eq!(report.failures[0].kind, ErrorKind::AmbiguousPath);
    }

    #[test]
    fn test_invalid_paths_are_failures_and_oversized_are_counted() {
        let plan = SyncPlan {
            invalid: vec!["../escaped.txt".into()],
            oversized: vec!["big.iso".into(), "huge.iso".into()],
            ..Default::default()
        };
        let report = ReportBuilder::start(1, "mem").finish(&plan, ExecutionOutcome::default());
        assert_eq!(report.status, RunStatus::Partial);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].kind, ErrorKind::InvalidPath);
        assert_eq!(report.failures[0].path.as_deref(), Some("../escaped.txt"));
        assert_eq!(report.invalid, vec!["../escaped.txt".to_string()]);
        assert_eq!(report.oversized, 2);

        // 只有超限路径时仍算成功
        let plan = SyncPlan {
            oversized: vec!["big.iso".into()],
            ..Default::default()
        };
        let report = ReportBuilder::start(2, "mem").finish(&plan, ExecutionOutcome::default());
        assert_eq!(report.status, RunStatus::Completed);
    }

    #[test]
    fn test_report_serializes_as_one_line() {
        let report = ReportBuilder::start(1, "mem").finish(&SyncPlan::default(), ExecutionOutcome::default());
        let line = serde_json::to_string(&report).unwrap();
        assert!(!line.contains('\n'));
        let back: RunReport = serde_json::from_str(&line).unwrap();
        assert_eq!(back.run_id, report.run_id);
        assert_eq!(back.status, RunStatus::Completed);
    }
}
