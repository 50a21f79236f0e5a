//! 三方比较：远程列表 × 本地列表 × 上次同步记录 → 同步计划
//!
//! 规划是纯计算，不做任何 IO。需要本地 hash 的路径由调用方预先计算好填入 `LocalEntry::hash`。

use super::conflict::{ConflictPolicy, ConflictRecord, ConflictResolution, ConflictType};
use super::file_state::{ObjectRecord, SyncState};
use super::fingerprint::is_content_hash;
use crate::storage::local::is_mirror_path;
use crate::storage::{LocalEntry, RemoteObject};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use tracing::{debug, warn};

/// 动作类型，声明顺序即执行顺序
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionKind {
    DeleteLocal,
    DeleteRemote,
    Upload,
    Download,
    /// 两边内容相同但没有记录，只写入元数据
    Track,
    Skip,
}

impl fmt::Display for ActionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionKind::DeleteLocal => "delete-local",
            ActionKind::DeleteRemote => "delete-remote",
            ActionKind::Upload => "upload",
            ActionKind::Download => "download",
            ActionKind::Track => "track",
            ActionKind::Skip => "skip",
        };
        f.write_str(s)
    }
}

/// 动作原因
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ActionReason {
    NewRemote,
    NewLocal,
    RemoteDeleted,
    LocalDeleted,
    RemoteNewer,
    LocalNewer,
    RestoreRemote,
    RestoreLocal,
    Conflict,
    UntrackedBoth,
    Identical,
    Unchanged,
    ConflictUnresolved,
}

impl fmt::Display for ActionReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ActionReason::NewRemote => "new-remote",
            ActionReason::NewLocal => "new-local",
            ActionReason::RemoteDeleted => "remote-deleted",
            ActionReason::LocalDeleted => "local-deleted",
            ActionReason::RemoteNewer => "remote-newer",
            ActionReason::LocalNewer => "local-newer",
            ActionReason::RestoreRemote => "restore-remote",
            ActionReason::RestoreLocal => "restore-local",
            ActionReason::Conflict => "conflict",
            ActionReason::UntrackedBoth => "untracked-both",
            ActionReason::Identical => "identical",
            ActionReason::Unchanged => "unchanged",
            ActionReason::ConflictUnresolved => "conflict-unresolved",
        };
        f.write_str(s)
    }
}

/// 单个同步动作
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Action {
    pub path: String,
    pub kind: ActionKind,
    pub reason: ActionReason,
    /// 规划时该路径的同步状态
    pub state: SyncState,
    /// 规划时的远程对象（下载校验用）
    #[serde(skip)]
    pub remote: Option<RemoteObject>,
    /// 规划时的本地文件
    #[serde(skip)]
    pub local: Option<LocalEntry>,
}

impl Action {
    fn new(path: &str, kind: ActionKind, reason: ActionReason, state: SyncState) -> Self {
        Self {
            path: path.to_string(),
            kind,
            reason,
            state,
            remote: None,
            local: None,
        }
    }

    fn with_remote(mut self, remote: &RemoteObject) -> Self {
        self.remote = Some(remote.clone());
        self
    }

    fn with_local(mut self, local: &LocalEntry) -> Self {
        self.local = Some(local.clone());
        self
    }

    /// 是否需要传输内容
    pub fn is_transfer(&self) -> bool {
        matches!(self.kind, ActionKind::Upload | ActionKind::Download)
    }
}

/// 规划选项
#[derive(Debug, Clone)]
pub struct PlanOptions {
    pub conflict_policy: ConflictPolicy,
    /// 一侧删除时是否同步删除另一侧（false 时从另一侧恢复）
    pub propagate_deletions: bool,
    /// 扩展名白名单（None 表示不过滤）
    pub allowed_extensions: Option<Vec<String>>,
    /// 远程存储不区分大小写
    pub case_insensitive_remote: bool,
    /// 任一侧超过该大小（字节）的路径不参与同步，0 表示不限制
    pub max_file_size: u64,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            propagate_deletions: true,
            allowed_extensions: None,
            case_insensitive_remote: false,
            max_file_size: 0,
        }
    }
}

/// 同步计划（每个周期生成，不持久化）
#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncPlan {
    pub actions: Vec<Action>,
    /// 两边都已不存在的记录，执行时从元数据中删除
    pub settled: Vec<String>,
    pub conflicts: Vec<ConflictRecord>,
    /// 因大小写冲突被排除的路径
    pub ambiguous: Vec<String>,
    /// 无法映射到同步目录内的路径（如含 `..` 的远程键）
    pub invalid: Vec<String>,
    /// 超过大小限制、两侧都不动的路径
    pub oversized: Vec<String>,
    /// 被扩展名白名单排除的路径数
    pub filtered: usize,
}

impl SyncPlan {
    pub fn count(&self, kind: ActionKind) -> usize {
        self.actions.iter().filter(|a| a.kind == kind).count()
    }

    /// 没有任何需要执行的动作
    pub fn is_noop(&self) -> bool {
        self.settled.is_empty() && self.actions.iter().all(|a| a.kind == ActionKind::Skip)
    }
}

/// 差异规划器
pub struct DiffPlanner {
    options: PlanOptions,
    extensions: Option<BTreeSet<String>>,
}

impl DiffPlanner {
    pub fn new(options: PlanOptions) -> Self {
        let extensions = options.allowed_extensions.as_ref().map(|exts| {
            exts.iter()
                .map(|e| e.trim().trim_start_matches('.').to_lowercase())
                .collect()
        });
        Self { options, extensions }
    }

    pub fn options(&self) -> &PlanOptions {
        &self.options
    }

    /// 扩展名是否在白名单内
    pub fn is_allowed(&self, path: &str) -> bool {
        let Some(extensions) = &self.extensions else {
            return true;
        };
        let name = path.rsplit('/').next().unwrap_or(path);
        match name.rfind('.') {
            Some(pos) if pos > 0 => extensions.contains(&name[pos + 1..].to_lowercase()),
            _ => false,
        }
    }

    /// 是否超过大小限制
    pub fn exceeds_size_limit(&self, size: u64) -> bool {
        self.options.max_file_size > 0 && size > self.options.max_file_size
    }

    /// 计算同步计划
    pub fn plan(
        &self,
        remote: &BTreeMap<String, RemoteObject>,
        local: &BTreeMap<String, LocalEntry>,
        prior: &BTreeMap<String, ObjectRecord>,
    ) -> SyncPlan {
        let mut plan = SyncPlan::default();

        let mut paths: BTreeSet<&str> = remote
            .keys()
            .chain(local.keys())
            .chain(prior.keys())
            .map(String::as_str)
            .collect();

        if self.extensions.is_some() {
            let before = paths.len();
            paths.retain(|p| self.is_allowed(p));
            plan.filtered = before - paths.len();
        }

        plan.invalid = paths
            .iter()
            .filter(|p| !is_mirror_path(p))
            .map(|p| p.to_string())
            .collect();
        for path in &plan.invalid {
            warn!("路径不能映射到同步目录内，已排除: {}", path);
            paths.remove(path.as_str());
        }

        if self.options.max_file_size > 0 {
            plan.oversized = paths
                .iter()
                .filter(|p| {
                    let remote_size = remote.get(**p).map(|r| r.size);
                    let local_size = local.get(**p).map(|l| l.size);
                    remote_size
                        .into_iter()
                        .chain(local_size)
                        .any(|size| self.exceeds_size_limit(size))
                })
                .map(|p| p.to_string())
                .collect();
            for path in &plan.oversized {
                debug!("超过大小限制，已排除: {}", path);
                paths.remove(path.as_str());
            }
        }

        if self.options.case_insensitive_remote {
            plan.ambiguous = case_collisions(&paths);
            for path in &plan.ambiguous {
                debug!("路径大小写冲突，已排除: {}", path);
                paths.remove(path.as_str());
            }
        }

        for path in paths {
            let remote = remote.get(path);
            let local = local.get(path);
            let prior = prior.get(path);

            match (remote, local, prior) {
                (None, None, Some(_)) => plan.settled.push(path.to_string()),
                (None, None, None) => {}
                (Some(r), None, None) => plan.actions.push(
                    Action::new(path, ActionKind::Download, ActionReason::NewRemote, SyncState::RemoteOnly)
                        .with_remote(r),
                ),
                (None, Some(l), None) => plan.actions.push(
                    Action::new(path, ActionKind::Upload, ActionReason::NewLocal, SyncState::LocalOnly)
                        .with_local(l),
                ),
                (None, Some(l), Some(_)) => {
                    let action = if self.options.propagate_deletions {
                        Action::new(
                            path,
                            ActionKind::DeleteLocal,
                            ActionReason::RemoteDeleted,
                            SyncState::LocalOnly,
                        )
                    } else {
                        Action::new(
                            path,
                            ActionKind::Upload,
                            ActionReason::RestoreRemote,
                            SyncState::LocalOnly,
                        )
                    };
                    plan.actions.push(action.with_local(l));
                }
                (Some(r), None, Some(_)) => {
                    let action = if self.options.propagate_deletions {
                        Action::new(
                            path,
                            ActionKind::DeleteRemote,
                            ActionReason::LocalDeleted,
                            SyncState::RemoteOnly,
                        )
                    } else {
                        Action::new(
                            path,
                            ActionKind::Download,
                            ActionReason::RestoreLocal,
                            SyncState::RemoteOnly,
                        )
                    };
                    plan.actions.push(action.with_remote(r));
                }
                (Some(r), Some(l), Some(p)) => {
                    let remote_changed = p.remote_revision.as_deref() != Some(r.revision.as_str());
                    let local_changed = local_changed(l, p);

                    let action = match (remote_changed, local_changed) {
                        (false, false) => Action::new(
                            path,
                            ActionKind::Skip,
                            ActionReason::Unchanged,
                            SyncState::InSync,
                        ),
                        (true, false) => Action::new(
                            path,
                            ActionKind::Download,
                            ActionReason::RemoteNewer,
                            SyncState::RemoteNewer,
                        ),
                        (false, true) => Action::new(
                            path,
                            ActionKind::Upload,
                            ActionReason::LocalNewer,
                            SyncState::LocalNewer,
                        ),
                        // 两边改成了相同内容（例如上次下载已落盘但记录未提交）
                        (true, true) if same_content(l, r) => Action::new(
                            path,
                            ActionKind::Track,
                            ActionReason::Identical,
                            SyncState::InSync,
                        ),
                        (true, true) => {
                            self.resolve_conflict(&mut plan, path, r, l, ConflictType::BothModified)
                        }
                    };
                    plan.actions.push(action.with_remote(r).with_local(l));
                }
                (Some(r), Some(l), None) => {
                    let action = if same_content(l, r) {
                        Action::new(path, ActionKind::Track, ActionReason::Identical, SyncState::InSync)
                    } else {
                        self.resolve_conflict(&mut plan, path, r, l, ConflictType::UntrackedBoth)
                    };
                    plan.actions.push(action.with_remote(r).with_local(l));
                }
            }
        }

        plan.actions
            .sort_by(|a, b| a.kind.cmp(&b.kind).then_with(|| a.path.cmp(&b.path)));

        debug!(
            "计划: {} 个动作, {} 个冲突, {} 个已结清",
            plan.actions.len(),
            plan.conflicts.len(),
            plan.settled.len()
        );
        plan
    }

    fn resolve_conflict(
        &self,
        plan: &mut SyncPlan,
        path: &str,
        remote: &RemoteObject,
        local: &LocalEntry,
        conflict_type: ConflictType,
    ) -> Action {
        let resolution = self
            .options
            .conflict_policy
            .resolve(local.modified_time, remote.last_modified);

        plan.conflicts.push(ConflictRecord {
            path: path.to_string(),
            conflict_type,
            resolution,
            local_time: local.modified_time,
            remote_time: remote.last_modified,
        });

        let reason = match conflict_type {
            ConflictType::BothModified => ActionReason::Conflict,
            ConflictType::UntrackedBoth => ActionReason::UntrackedBoth,
        };

        match resolution {
            ConflictResolution::KeepLocal => {
                Action::new(path, ActionKind::Upload, reason, SyncState::Conflicted)
            }
            ConflictResolution::KeepRemote => {
                Action::new(path, ActionKind::Download, reason, SyncState::Conflicted)
            }
            ConflictResolution::Unresolved => Action::new(
                path,
                ActionKind::Skip,
                ActionReason::ConflictUnresolved,
                SyncState::Conflicted,
            ),
        }
    }
}

/// 本地文件自上次同步后是否变化
///
/// 大小不同一定变了；大小相同且修改时间相同视为未变；
/// 修改时间不同时比较 hash，hash 未知时按已变化处理。
fn local_changed(local: &LocalEntry, prior: &ObjectRecord) -> bool {
    if local.size != prior.size {
        return true;
    }
    if prior.local_modified_time == Some(local.modified_time) {
        return false;
    }
    match &local.hash {
        Some(hash) => !hash.eq_ignore_ascii_case(&prior.content_hash),
        None => true,
    }
}

/// 本地 hash 已知且与远程的内容 hash 相同
fn same_content(local: &LocalEntry, remote: &RemoteObject) -> bool {
    matches!(
        &local.hash,
        Some(hash) if is_content_hash(&remote.revision) && hash.eq_ignore_ascii_case(&remote.revision)
    )
}

/// 找出小写形式相同的所有路径
fn case_collisions(paths: &BTreeSet<&str>) -> Vec<String> {
    let mut groups: BTreeMap<String, Vec<&str>> = BTreeMap::new();
    for path in paths {
        groups.entry(path.to_lowercase()).or_default().push(*path);
    }
    let mut ambiguous: Vec<String> = groups
        .into_values()
        .filter(|group| group.len() > 1)
        .flatten()
        .map(str::to_string)
        .collect();
    ambiguous.sort();
    ambiguous
}
