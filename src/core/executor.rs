//! 同步计划执行器
//!
//! 按阶段执行：删除 → 上传 → 下载 → 登记，阶段之间是屏障。
//! 阶段内的动作用信号量限制并发，单个文件失败只记入报告，不影响其他文件。
//! 完成的动作按批写入元数据，每批只落盘一次。

use super::file_state::{MetadataStore, ObjectRecord, RecordChange, SyncState};
use super::fingerprint::{hashing_stream, is_content_hash};
use super::planner::{Action, ActionKind, SyncPlan};
use super::report::{ExecutionOutcome, Failure};
use crate::error::{ErrorKind, Result, SyncError};
use crate::storage::{LocalStorage, RemoteObject, RemoteStore};
use chrono::Utc;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, error, info, warn};

/// 执行阶段，按顺序运行
const PHASES: [&[ActionKind]; 4] = [
    &[ActionKind::DeleteLocal, ActionKind::DeleteRemote],
    &[ActionKind::Upload],
    &[ActionKind::Download],
    &[ActionKind::Track],
];

/// 每累计这么多完成的动作提交一次元数据
const COMMIT_BATCH: usize = 64;

/// 执行器配置
#[derive(Debug, Clone)]
pub struct ExecutorOptions {
    pub max_concurrent_transfers: usize,
    pub transfer_timeout: Duration,
    /// 覆盖或删除本地文件前保留旧版本
    pub keep_versions: bool,
}

impl Default for ExecutorOptions {
    fn default() -> Self {
        Self {
            max_concurrent_transfers: 4,
            transfer_timeout: Duration::from_secs(300),
            keep_versions: false,
        }
    }
}

/// 已完成、等待提交记录的动作
struct Done {
    bytes: u64,
    change: Option<RecordChange>,
}

struct Pending {
    path: String,
    kind: ActionKind,
    done: Done,
}

/// 单个动作的执行上下文，在并发任务间共享
struct Worker {
    remote: Arc<dyn RemoteStore>,
    local: Arc<LocalStorage>,
    options: ExecutorOptions,
}

pub struct SyncExecutor {
    worker: Arc<Worker>,
    metadata: Arc<MetadataStore>,
}

impl SyncExecutor {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        local: Arc<LocalStorage>,
        metadata: Arc<MetadataStore>,
        options: ExecutorOptions,
    ) -> Self {
        Self {
            worker: Arc::new(Worker {
                remote,
                local,
                options,
            }),
            metadata,
        }
    }

    /// 执行计划，返回执行结果（不会因单个文件失败而中止）
    pub async fn execute(&self, plan: &SyncPlan) -> ExecutionOutcome {
        let mut outcome = ExecutionOutcome::default();

        for action in plan.actions.iter().filter(|a| a.kind == ActionKind::Skip) {
            debug!("跳过: {} ({})", action.path, action.reason);
            outcome.completed.add(ActionKind::Skip);
        }

        for kinds in PHASES {
            let actions: Vec<&Action> = plan
                .actions
                .iter()
                .filter(|a| kinds.contains(&a.kind))
                .collect();
            if actions.is_empty() {
                continue;
            }
            info!("执行阶段 {:?}: {} 个动作", kinds, actions.len());
            self.execute_phase(actions, &mut outcome).await;
        }

        if !plan.settled.is_empty() {
            let changes = plan
                .settled
                .iter()
                .map(|path| RecordChange::Remove(path.clone()))
                .collect();
            match self.metadata.apply(changes).await {
                Ok(()) => {
                    debug!("移除 {} 条已结清的记录", plan.settled.len());
                    outcome.settled = plan.settled.len();
                }
                Err(e) => {
                    warn!("移除已结清的记录失败: {}", e);
                    outcome
                        .failures
                        .extend(plan.settled.iter().map(|path| Failure::for_path(path, &e)));
                }
            }
        }

        outcome
    }

    /// 并行执行一个阶段内的所有动作，全部完成后返回
    async fn execute_phase(&self, actions: Vec<&Action>, outcome: &mut ExecutionOutcome) {
        let semaphore = Arc::new(Semaphore::new(
            self.worker.options.max_concurrent_transfers.max(1),
        ));
        let mut handles = Vec::with_capacity(actions.len());

        for action in actions {
            let Ok(permit) = semaphore.clone().acquire_owned().await else {
                break;
            };
            let worker = self.worker.clone();
            let action = action.clone();
            let path = action.path.clone();

            let handle = tokio::spawn(async move {
                let result = worker.run(&action).await;
                drop(permit);
                (action.kind, result)
            });
            handles.push((path, handle));
        }

        let mut pending = Vec::new();
        for (path, handle) in handles {
            match handle.await {
                Ok((kind, Ok(done))) => {
                    pending.push(Pending { path, kind, done });
                    if pending.len() >= COMMIT_BATCH {
                        self.commit_batch(&mut pending, outcome).await;
                    }
                }
                Ok((kind, Err(e))) => {
                    warn!("{} 失败: {}: {}", kind, path, e);
                    outcome.failures.push(Failure::for_path(&path, &e));
                }
                Err(e) => {
                    error!("任务失败: {}: {}", path, e);
                    outcome.failures.push(Failure {
                        path: Some(path),
                        kind: ErrorKind::Backend,
                        message: e.to_string(),
                    });
                }
            }
        }
        self.commit_batch(&mut pending, outcome).await;
    }

    /// 把一批完成的动作写入元数据；写盘失败时整批记为失败
    async fn commit_batch(&self, pending: &mut Vec<Pending>, outcome: &mut ExecutionOutcome) {
        if pending.is_empty() {
            return;
        }
        let batch = std::mem::take(pending);
        let changes = batch
            .iter()
            .filter_map(|p| p.done.change.clone())
            .collect();

        match self.metadata.apply(changes).await {
            Ok(()) => {
                for p in batch {
                    outcome.completed.add(p.kind);
                    outcome.bytes_transferred += p.done.bytes;
                }
            }
            Err(e) => {
                error!("提交 {} 条文件状态失败: {}", batch.len(), e);
                outcome
                    .failures
                    .extend(batch.iter().map(|p| Failure::for_path(&p.path, &e)));
            }
        }
    }
}

impl Worker {
    /// 执行单个动作，返回传输的字节数和待提交的记录变更
    async fn run(&self, action: &Action) -> Result<Done> {
        match action.kind {
            ActionKind::Upload => self.with_deadline(&action.path, self.upload(action)).await,
            ActionKind::Download => self.with_deadline(&action.path, self.download(action)).await,
            ActionKind::DeleteLocal => {
                self.with_deadline(&action.path, self.delete_local(action)).await
            }
            ActionKind::DeleteRemote => {
                self.with_deadline(&action.path, self.delete_remote(action)).await
            }
            ActionKind::Track => self.track(action),
            ActionKind::Skip => Ok(Done {
                bytes: 0,
                change: None,
            }),
        }
    }

    async fn with_deadline<F, T>(&self, path: &str, fut: F) -> Result<T>
    where
        F: Future<Output = Result<T>>,
    {
        let deadline = self.options.transfer_timeout;
        tokio::time::timeout(deadline, fut)
            .await
            .map_err(|_| SyncError::TransferTimeout {
                path: path.to_string(),
                secs: deadline.as_secs(),
            })?
    }

    async fn upload(&self, action: &Action) -> Result<Done> {
        let path = action.path.as_str();
        let entry = self
            .local
            .stat(path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;

        debug!("上传: {} ({} 字节, {})", path, entry.size, action.reason);

        let (data, digest) = hashing_stream(self.local.read_stream(path).await?);
        let object = self.remote.put(path, data, entry.size).await?;
        let (hash, size) = digest
            .await
            .map_err(|_| SyncError::Backend(format!("上传流未读完: {}", path)))?;

        if is_content_hash(&object.revision) && !object.revision.eq_ignore_ascii_case(&hash) {
            return Err(SyncError::IntegrityMismatch {
                path: path.to_string(),
                expected: hash,
                actual: object.revision,
            });
        }

        Ok(Done {
            bytes: size,
            change: Some(RecordChange::Upsert(ObjectRecord {
                path: path.to_string(),
                content_hash: hash,
                size,
                remote_revision: Some(object.revision),
                local_modified_time: Some(entry.modified_time),
                last_synced_at: Utc::now(),
                state: SyncState::InSync,
            })),
        })
    }

    async fn download(&self, action: &Action) -> Result<Done> {
        let path = action.path.as_str();
        let expected: RemoteObject = match &action.remote {
            Some(remote) => remote.clone(),
            None => self
                .remote
                .stat(path)
                .await?
                .ok_or_else(|| SyncError::NotFound(path.to_string()))?,
        };

        debug!("下载: {} ({} 字节, {})", path, expected.size, action.reason);

        let staged = self.local.stage(path, self.remote.get(path).await?).await?;

        if staged.size != expected.size {
            return Err(SyncError::IntegrityMismatch {
                path: path.to_string(),
                expected: format!("{} bytes", expected.size),
                actual: format!("{} bytes", staged.size),
            });
        }
        if is_content_hash(&expected.revision) && !expected.revision.eq_ignore_ascii_case(&staged.hash)
        {
            return Err(SyncError::IntegrityMismatch {
                path: path.to_string(),
                expected: expected.revision,
                actual: staged.hash,
            });
        }

        if self.options.keep_versions {
            self.local.archive_version(path).await?;
        }

        let hash = staged.hash.clone();
        let size = staged.size;
        staged.persist()?;

        let entry = self
            .local
            .stat(path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;

        Ok(Done {
            bytes: size,
            change: Some(RecordChange::Upsert(ObjectRecord {
                path: path.to_string(),
                content_hash: hash,
                size,
                remote_revision: Some(expected.revision),
                local_modified_time: Some(entry.modified_time),
                last_synced_at: Utc::now(),
                state: SyncState::InSync,
            })),
        })
    }

    async fn delete_local(&self, action: &Action) -> Result<Done> {
        debug!("删除本地: {} ({})", action.path, action.reason);
        if self.options.keep_versions {
            self.local.archive_version(&action.path).await?;
        } else {
            self.local.remove(&action.path).await?;
        }
        Ok(Done {
            bytes: 0,
            change: Some(RecordChange::Remove(action.path.clone())),
        })
    }

    async fn delete_remote(&self, action: &Action) -> Result<Done> {
        debug!("删除远程: {} ({})", action.path, action.reason);
        self.remote.delete(&action.path).await?;
        Ok(Done {
            bytes: 0,
            change: Some(RecordChange::Remove(action.path.clone())),
        })
    }

    /// 两边内容已相同，只生成记录
    fn track(&self, action: &Action) -> Result<Done> {
        let (Some(local), Some(remote)) = (&action.local, &action.remote) else {
            return Err(SyncError::Backend(format!("登记缺少列表信息: {}", action.path)));
        };
        let hash = local
            .hash
            .clone()
            .ok_or_else(|| SyncError::Backend(format!("登记缺少本地 hash: {}", action.path)))?;

        debug!("登记: {} ({})", action.path, action.reason);
        Ok(Done {
            bytes: 0,
            change: Some(RecordChange::Upsert(ObjectRecord {
                path: action.path.clone(),
                content_hash: hash,
                size: local.size,
                remote_revision: Some(remote.revision.clone()),
                local_modified_time: Some(local.modified_time),
                last_synced_at: Utc::now(),
                state: SyncState::InSync,
            })),
        })
    }
}
