//! 同步引擎 - 一个完整的同步周期
//!
//! 加载元数据 → 扫描两侧 → 按需计算 hash → 规划 → 执行 → 生成并保存报告。

use super::executor::{ExecutorOptions, SyncExecutor};
use super::file_state::{MetadataStore, ObjectRecord};
use super::fingerprint::{is_content_hash, root_fingerprint};
use super::history::RunHistory;
use super::planner::{DiffPlanner, PlanOptions, SyncPlan};
use super::report::{ReportBuilder, RunReport};
use super::scanner::{FileScanner, ScanConfig};
use crate::error::Result;
use crate::storage::{LocalEntry, LocalStorage, RemoteObject, RemoteStore};
use futures::{stream, StreamExt};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// 引擎配置
#[derive(Debug, Clone, Default)]
pub struct EngineOptions {
    pub plan: PlanOptions,
    pub scan: ScanConfig,
    pub executor: ExecutorOptions,
}

pub struct SyncEngine {
    remote: Arc<dyn RemoteStore>,
    local: Arc<LocalStorage>,
    scanner: FileScanner,
    planner: DiffPlanner,
    executor_options: ExecutorOptions,
    history: RunHistory,
    root_fingerprint: String,
    cycle: AtomicU64,
}

impl SyncEngine {
    pub async fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<LocalStorage>,
        options: EngineOptions,
    ) -> Result<Self> {
        let history = RunHistory::new(&local.state_dir());
        let last_cycle = history.last_cycle().await?;
        let root_fingerprint = root_fingerprint(remote.name(), local.root());

        info!(
            "同步引擎就绪: {} <-> {} (上次周期 #{})",
            local.name(),
            remote.name(),
            last_cycle
        );

        Ok(Self {
            remote,
            local,
            scanner: FileScanner::new(options.scan),
            planner: DiffPlanner::new(options.plan),
            executor_options: options.executor,
            history,
            root_fingerprint,
            cycle: AtomicU64::new(last_cycle),
        })
    }

    pub fn history(&self) -> &RunHistory {
        &self.history
    }

    pub fn remote(&self) -> &Arc<dyn RemoteStore> {
        &self.remote
    }

    pub fn local(&self) -> &Arc<LocalStorage> {
        &self.local
    }

    /// 只计算计划，不执行（元数据损坏时直接返回错误，不做隔离）
    pub async fn plan(&self) -> Result<SyncPlan> {
        let metadata = MetadataStore::open(&self.local.state_dir(), &self.root_fingerprint).await?;
        self.build_plan(&metadata).await
    }

    /// 执行一个同步周期，总是返回报告
    pub async fn run_cycle(&self) -> RunReport {
        let cycle = self.cycle.fetch_add(1, Ordering::SeqCst) + 1;
        let builder = ReportBuilder::start(cycle, self.remote.name());
        info!("开始同步周期 #{} ({})", cycle, builder.run_id());

        let report = match self.prepare().await {
            Ok((metadata, plan)) => {
                let executor = SyncExecutor::new(
                    self.remote.clone(),
                    self.local.clone(),
                    metadata,
                    self.executor_options.clone(),
                );
                let outcome = executor.execute(&plan).await;
                builder.finish(&plan, outcome)
            }
            Err(e) => {
                error!("同步周期 #{} 降级: {}", cycle, e);
                builder.degraded(&e)
            }
        };

        if let Err(e) = self.history.append(&report).await {
            warn!("写入运行历史失败: {}", e);
        }

        info!("{}", report);
        report
    }

    /// 加载元数据并生成计划，任何错误都意味着本周期不能执行
    async fn prepare(&self) -> Result<(Arc<MetadataStore>, SyncPlan)> {
        let (metadata, corrupt) =
            MetadataStore::open_or_recover(&self.local.state_dir(), &self.root_fingerprint).await?;
        if let Some(err) = corrupt {
            // 已隔离，下个周期从空记录重建
            return Err(err);
        }

        let plan = self.build_plan(&metadata).await?;
        Ok((Arc::new(metadata), plan))
    }

    async fn build_plan(&self, metadata: &MetadataStore) -> Result<SyncPlan> {
        // 远程列表不完整时不能规划，否则会把缺失的对象当作已删除
        let (remote, local) = tokio::try_join!(
            self.scanner.scan_remote(self.remote.as_ref(), ""),
            self.scanner.scan_local(&self.local),
        )?;

        let prior = metadata.snapshot().await;
        let local = self.fill_hashes(local, &remote, &prior).await;

        Ok(self.planner.plan(&remote, &local, &prior))
    }

    /// 为无法只靠大小和修改时间判断的文件计算 hash
    async fn fill_hashes(
        &self,
        mut local: BTreeMap<String, LocalEntry>,
        remote: &BTreeMap<String, RemoteObject>,
        prior: &BTreeMap<String, ObjectRecord>,
    ) -> BTreeMap<String, LocalEntry> {
        let needed: Vec<String> = local
            .values()
            .filter(|entry| !self.planner.exceeds_size_limit(entry.size))
            .filter(|entry| needs_hash(entry, remote.get(&entry.path), prior.get(&entry.path)))
            .map(|entry| entry.path.clone())
            .collect();

        if needed.is_empty() {
            return local;
        }
        debug!("计算 {} 个文件的 hash", needed.len());

        let concurrency = self.executor_options.max_concurrent_transfers.max(1);
        let results: Vec<_> = stream::iter(needed)
            .map(|path| async move {
                let result = self.local.hash(&path).await;
                (path, result)
            })
            .buffer_unordered(concurrency)
            .collect()
            .await;

        for (path, result) in results {
            match result {
                Ok((hash, _)) => {
                    if let Some(entry) = local.get_mut(&path) {
                        entry.hash = Some(hash);
                    }
                }
                Err(e) => warn!("计算 hash 失败，按已修改处理: {}: {}", path, e),
            }
        }

        local
    }
}

/// 规划时是否需要本地 hash
fn needs_hash(
    local: &LocalEntry,
    remote: Option<&RemoteObject>,
    prior: Option<&ObjectRecord>,
) -> bool {
    match (remote, prior) {
        (Some(r), Some(p)) => {
            let touched =
                local.size != p.size || p.local_modified_time != Some(local.modified_time);
            if !touched {
                return false;
            }
            // 大小相同但修改时间变了，需要确认内容是否真的变化；
            // 远程也变了且可按内容比较时，确认两边是否已经一致
            let remote_changed = p.remote_revision.as_deref() != Some(r.revision.as_str());
            local.size == p.size
                || (remote_changed && is_content_hash(&r.revision) && r.size == local.size)
        }
        // 两边都有但没有记录，可能内容相同
        (Some(r), None) => is_content_hash(&r.revision) && r.size == local.size,
        _ => false,
    }
}
