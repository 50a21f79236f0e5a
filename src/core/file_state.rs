//! 文件状态管理 - 用于增量同步
//!
//! 每个同步根一个 JSON 元数据文件，记录每个相对路径上次成功同步时的状态。
//! 变更按批提交：整批写入临时文件、fsync 后原子重命名，崩溃时不会留下半条记录。

use crate::error::{Result, SyncError};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// 元数据文件名
pub const METADATA_FILE: &str = "metadata.json";
const METADATA_VERSION: u32 = 1;

/// 路径的同步状态
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SyncState {
    #[default]
    InSync,
    LocalOnly,
    RemoteOnly,
    LocalNewer,
    RemoteNewer,
    Conflicted,
}

/// 文件状态记录
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ObjectRecord {
    pub path: String,
    /// 上次同步时的内容 hash
    pub content_hash: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_revision: Option<String>,
    /// 本地修改时间（Unix 毫秒）
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_modified_time: Option<i64>,
    pub last_synced_at: DateTime<Utc>,
    #[serde(default)]
    pub state: SyncState,
}

/// 一条待提交的记录变更
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordChange {
    Upsert(ObjectRecord),
    Remove(String),
}

impl RecordChange {
    pub fn path(&self) -> &str {
        match self {
            RecordChange::Upsert(record) => &record.path,
            RecordChange::Remove(path) => path,
        }
    }
}

/// 磁盘上的元数据文件
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFile {
    version: u32,
    root: String,
    #[allow(dead_code)]
    updated_at: DateTime<Utc>,
    files: BTreeMap<String, ObjectRecord>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct MetadataFileRef<'a> {
    version: u32,
    root: &'a str,
    updated_at: DateTime<Utc>,
    files: &'a BTreeMap<String, ObjectRecord>,
}

/// 元数据存储
pub struct MetadataStore {
    path: PathBuf,
    root: String,
    records: RwLock<BTreeMap<String, ObjectRecord>>,
    /// 串行化所有提交，避免并发写入丢失更新
    write_lock: Mutex<()>,
}

impl MetadataStore {
    /// 加载同步根的元数据，文件不存在视为空
    pub async fn open(state_dir: &Path, root: &str) -> Result<Self> {
        tokio::fs::create_dir_all(state_dir).await?;
        let path = state_dir.join(METADATA_FILE);

        let records = match tokio::fs::read(&path).await {
            Ok(data) => Self::parse(&path, &data, root)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(e.into()),
        };

        debug!("加载 {} 条文件状态: {:?}", records.len(), path);

        Ok(Self {
            path,
            root: root.to_string(),
            records: RwLock::new(records),
            write_lock: Mutex::new(()),
        })
    }

    fn parse(path: &Path, data: &[u8], root: &str) -> Result<BTreeMap<String, ObjectRecord>> {
        let file: MetadataFile = serde_json::from_slice(data)
            .map_err(|e| SyncError::CorruptMetadata(format!("{}: {}", path.display(), e)))?;

        if file.version > METADATA_VERSION {
            return Err(SyncError::CorruptMetadata(format!(
                "{}: 不支持的版本 {}",
                path.display(),
                file.version
            )));
        }

        if file.root != root {
            return Err(SyncError::CorruptMetadata(format!(
                "{}: 属于其他同步根 ({})",
                path.display(),
                file.root
            )));
        }

        if let Some((key, _)) = file.files.iter().find(|(key, record)| **key != record.path) {
            return Err(SyncError::CorruptMetadata(format!(
                "{}: 记录路径不一致 ({})",
                path.display(),
                key
            )));
        }

        Ok(file.files)
    }

    /// 加载元数据；损坏时把原文件隔离改名，返回空存储和损坏错误供调用方报告
    pub async fn open_or_recover(state_dir: &Path, root: &str) -> Result<(Self, Option<SyncError>)> {
        match Self::open(state_dir, root).await {
            Ok(store) => Ok((store, None)),
            Err(err @ SyncError::CorruptMetadata(_)) => {
                let path = state_dir.join(METADATA_FILE);
                let quarantined = state_dir.join(format!(
                    "{}.corrupt-{}",
                    METADATA_FILE,
                    Utc::now().format("%Y%m%d%H%M%S")
                ));
                warn!("元数据损坏，隔离为 {:?}: {}", quarantined, err);
                tokio::fs::rename(&path, &quarantined).await?;
                let store = Self::open(state_dir, root).await?;
                Ok((store, Some(err)))
            }
            Err(e) => Err(e),
        }
    }

    /// 当前记录的只读副本
    pub async fn snapshot(&self) -> BTreeMap<String, ObjectRecord> {
        self.records.read().await.clone()
    }

    pub async fn get(&self, path: &str) -> Option<ObjectRecord> {
        self.records.read().await.get(path).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.records.read().await.is_empty()
    }

    /// 一次性应用一批变更，只写一次盘，落盘后才返回
    ///
    /// 写盘失败时内存中的记录保持不变，整批都不生效。
    pub async fn apply(&self, changes: Vec<RecordChange>) -> Result<()> {
        if changes.is_empty() {
            return Ok(());
        }
        let _guard = self.write_lock.lock().await;

        let mut next = self.records.read().await.clone();
        let count = changes.len();
        let mut modified = false;
        for change in changes {
            match change {
                RecordChange::Upsert(record) => {
                    next.insert(record.path.clone(), record);
                    modified = true;
                }
                RecordChange::Remove(path) => modified |= next.remove(&path).is_some(),
            }
        }
        if !modified {
            return Ok(());
        }
        self.persist(&next).await?;

        *self.records.write().await = next;
        debug!("已提交 {} 条文件状态变更", count);
        Ok(())
    }

    /// 更新或插入单条记录
    pub async fn commit(&self, record: ObjectRecord) -> Result<()> {
        self.apply(vec![RecordChange::Upsert(record)]).await
    }

    /// 删除单条记录，不存在时什么都不做
    pub async fn remove(&self, path: &str) -> Result<()> {
        self.apply(vec![RecordChange::Remove(path.to_string())]).await
    }

    async fn persist(&self, files: &BTreeMap<String, ObjectRecord>) -> Result<()> {
        let file = MetadataFileRef {
            version: METADATA_VERSION,
            root: &self.root,
            updated_at: Utc::now(),
            files,
        };
        let data = serde_json::to_vec_pretty(&file).map_err(std::io::Error::other)?;

        let temp_path = self.path.with_extension("json.tmp");
        let mut temp = tokio::fs::File::create(&temp_path).await?;
        temp.write_all(&data).await?;
        temp.sync_all().await?;
        drop(temp);

        tokio::fs::rename(&temp_path, &self.path).await?;
        Ok(())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for MetadataStore {
    fn drop(&mut self) {
        if let Ok(records) = self.records.try_read() {
            info!("关闭元数据存储 ({} 条记录)", records.len());
        }
    }
}
