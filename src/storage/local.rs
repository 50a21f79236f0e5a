use super::{is_safe_key, normalize_path, ByteStream, LocalEntry};
use crate::core::conflict::version_name;
use crate::core::fingerprint::{fingerprint_file, Fingerprinter, CHUNK_SIZE};
use crate::error::{Result, SyncError};
use futures::{StreamExt, TryStreamExt};
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;
use tempfile::NamedTempFile;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio_util::io::ReaderStream;
use tracing::{debug, warn};
use walkdir::WalkDir;

/// 同步根下的内部状态目录
pub const STATE_DIR: &str = ".bucketsync";
/// 历史版本目录（位于状态目录下）
pub const VERSIONS_DIR: &str = "versions";

/// 路径能否在镜像目录中落地：键本身安全且不在内部状态目录下
pub fn is_mirror_path(path: &str) -> bool {
    is_safe_key(path) && path.split('/').next() != Some(STATE_DIR)
}

/// 本地镜像目录
pub struct LocalStorage {
    base_path: PathBuf,
    name: String,
}

/// 已写入临时文件、尚未替换目标的下载内容
pub struct StagedFile {
    temp: NamedTempFile,
    target: PathBuf,
    pub hash: String,
    pub size: u64,
}

impl StagedFile {
    /// 原子重命名到目标路径
    pub fn persist(self) -> Result<()> {
        self.temp.persist(&self.target).map_err(|e| SyncError::Io(e.error))?;
        Ok(())
    }
}

impl LocalStorage {
    pub fn new(path: impl Into<PathBuf>) -> Result<Self> {
        let base_path = path.into();
        if !base_path.exists() {
            std::fs::create_dir_all(&base_path)?;
        }
        let name = format!("local:{}", base_path.display());
        Ok(Self { base_path, name })
    }

    pub fn root(&self) -> &Path {
        &self.base_path
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// 元数据、历史记录和历史版本所在目录
    pub fn state_dir(&self) -> PathBuf {
        self.base_path.join(STATE_DIR)
    }

    /// 相对路径对应的本地路径，落在镜像目录之外的路径返回 `InvalidPath`
    pub fn full_path(&self, path: &str) -> Result<PathBuf> {
        let path = normalize_path(path);
        if !is_mirror_path(&path) {
            return Err(SyncError::InvalidPath(path));
        }
        let relative = Path::new(&path);
        if !relative
            .components()
            .all(|c| matches!(c, Component::Normal(_)))
        {
            return Err(SyncError::InvalidPath(path));
        }
        Ok(self.base_path.join(relative))
    }

    /// 递归列出所有文件（跳过目录和内部状态目录）
    pub async fn list(&self) -> Result<Vec<LocalEntry>> {
        let base = self.base_path.clone();

        // 使用 spawn_blocking 避免阻塞 async runtime
        let entries = tokio::task::spawn_blocking(move || {
            WalkDir::new(&base)
                .follow_links(false)
                .into_iter()
                .filter_entry(|entry| entry.depth() != 1 || entry.file_name() != STATE_DIR)
                .filter_map(|entry| match entry {
                    Ok(entry) => Some(entry),
                    Err(e) => {
                        warn!("跳过无法读取的条目: {}", e);
                        None
                    }
                })
                .filter_map(|entry| {
                    // 指向文件的符号链接按普通文件处理
                    let metadata = if entry.path_is_symlink() {
                        std::fs::metadata(entry.path()).ok()?
                    } else {
                        entry.metadata().ok()?
                    };
                    if !metadata.is_file() {
                        return None;
                    }
                    let relative = entry.path().strip_prefix(&base).ok()?.to_str()?;
                    Some(entry_from_metadata(&normalize_path(relative), &metadata))
                })
                .collect::<Vec<_>>()
        })
        .await
        .map_err(std::io::Error::other)?;

        debug!("本地列出 {} 个文件: {}", entries.len(), self.name);
        Ok(entries)
    }

    /// 获取文件信息，不存在返回 None
    pub async fn stat(&self, path: &str) -> Result<Option<LocalEntry>> {
        match fs::metadata(self.full_path(path)?).await {
            Ok(metadata) if metadata.is_file() => {
                Ok(Some(entry_from_metadata(&normalize_path(path), &metadata)))
            }
            Ok(_) => Ok(None),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// 计算文件内容 hash
    pub async fn hash(&self, path: &str) -> Result<(String, u64)> {
        Ok(fingerprint_file(&self.full_path(path)?).await?)
    }

    /// 以流的方式读取文件
    pub async fn read_stream(&self, path: &str) -> Result<ByteStream> {
        let file = fs::File::open(self.full_path(path)?).await?;
        Ok(ReaderStream::with_capacity(file, CHUNK_SIZE)
            .map_err(SyncError::from)
            .boxed())
    }

    /// 把流写入目标目录下的临时文件，边写边计算 hash
    ///
    /// 出错时临时文件随 `NamedTempFile` 一起删除，目标文件不受影响。
    pub async fn stage(&self, path: &str, mut data: ByteStream) -> Result<StagedFile> {
        let target = self.full_path(path)?;
        let parent = target
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.base_path.clone());
        fs::create_dir_all(&parent).await?;

        let temp = tempfile::Builder::new()
            .prefix(".bucketsync-")
            .suffix(".tmp")
            .tempfile_in(&parent)?;
        let mut file = fs::File::from_std(temp.as_file().try_clone()?);

        let mut hasher = Fingerprinter::new();
        while let Some(chunk) = data.next().await {
            let chunk = chunk?;
            hasher.update(&chunk);
            file.write_all(&chunk).await?;
        }
        file.flush().await?;
        file.sync_all().await?;
        drop(file);

        let (hash, size) = hasher.finish();
        Ok(StagedFile {
            temp,
            target,
            hash,
            size,
        })
    }

    /// 删除文件，不存在视为成功
    pub async fn remove(&self, path: &str) -> Result<()> {
        match fs::remove_file(self.full_path(path)?).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// 把当前文件移动到历史版本目录，文件不存在返回 None
    pub async fn archive_version(&self, path: &str) -> Result<Option<PathBuf>> {
        let source = self.full_path(path)?;
        if fs::metadata(&source).await.is_err() {
            return Ok(None);
        }

        let timestamp = chrono::Utc::now().timestamp();
        let name = version_name(&normalize_path(path), timestamp);
        let versions = self.state_dir().join(VERSIONS_DIR);
        let mut dest = versions.join(&name);
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent).await?;
        }
        // 同一秒内多次归档同一路径时追加序号
        let mut counter = 1;
        while fs::try_exists(&dest).await? {
            dest = versions.join(numbered(&name, counter));
            counter += 1;
        }

        fs::rename(&source, &dest).await?;
        debug!("已保存历史版本: {} -> {:?}", path, dest);
        Ok(Some(dest))
    }
}

/// 在扩展名前插入序号：`a_20240101_000000.pdf` -> `a_20240101_000000-1.pdf`
fn numbered(name: &str, counter: u32) -> String {
    let (dir, file) = match name.rsplit_once('/') {
        Some((dir, file)) => (Some(dir), file),
        None => (None, name),
    };
    let file = match file.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{stem}-{counter}.{ext}"),
        _ => format!("{file}-{counter}"),
    };
    match dir {
        Some(dir) => format!("{dir}/{file}"),
        None => file,
    }
}

fn entry_from_metadata(path: &str, metadata: &std::fs::Metadata) -> LocalEntry {
    let modified_time = metadata
        .modified()
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0);

    LocalEntry {
        path: path.to_string(),
        size: metadata.len(),
        modified_time,
        hash: None,
    }
}
