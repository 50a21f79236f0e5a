//! 单个对象的上传、下载、删除和列表

use crate::core::fingerprint::{hashing_stream, is_content_hash};
use crate::error::{Result, SyncError};
use crate::storage::{normalize_path, ByteStream, LocalStorage, RemoteObject, RemoteStore};
use crate::AppState;
use anyhow::{bail, Context};
use futures::{StreamExt, TryStreamExt};
use std::path::Path;
use tracing::info;

/// 上传并校验：远程返回内容 MD5 时必须与实际上传的内容一致
///
/// 返回写入后的对象信息和上传的字节数。
pub(crate) async fn put_verified(
    remote: &dyn RemoteStore,
    key: &str,
    data: ByteStream,
    declared_size: u64,
) -> Result<(RemoteObject, u64)> {
    let (data, digest) = hashing_stream(data);
    let object = remote.put(key, data, declared_size).await?;
    let (hash, size) = digest
        .await
        .map_err(|_| SyncError::Backend(format!("上传流未读完: {}", key)))?;

    if is_content_hash(&object.revision) && !object.revision.eq_ignore_ascii_case(&hash) {
        return Err(SyncError::IntegrityMismatch {
            path: key.to_string(),
            expected: hash,
            actual: object.revision,
        });
    }
    Ok((object, size))
}

/// 下载到 `target` 下的相对路径：先写临时文件，大小和 hash 校验通过后原子替换
pub(crate) async fn fetch_verified(
    remote: &dyn RemoteStore,
    object: &RemoteObject,
    target: &LocalStorage,
    relative: &str,
) -> Result<u64> {
    let staged = target.stage(relative, remote.get(&object.path).await?).await?;

    if staged.size != object.size {
        return Err(SyncError::IntegrityMismatch {
            path: object.path.clone(),
            expected: format!("{} bytes", object.size),
            actual: format!("{} bytes", staged.size),
        });
    }
    if is_content_hash(&object.revision) && !object.revision.eq_ignore_ascii_case(&staged.hash) {
        return Err(SyncError::IntegrityMismatch {
            path: object.path.clone(),
            expected: object.revision.clone(),
            actual: staged.hash,
        });
    }

    let size = staged.size;
    staged.persist()?;
    Ok(size)
}

/// 上传本地文件，key 为空时使用文件名
pub async fn upload(state: &AppState, file: &Path, key: Option<String>) -> anyhow::Result<()> {
    let metadata = tokio::fs::metadata(file)
        .await
        .with_context(|| format!("文件不存在: {}", file.display()))?;
    if !metadata.is_file() {
        bail!("不是文件: {}", file.display());
    }

    let file_name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("无效的文件名: {}", file.display()))?;

    let sync = &state.config.sync;
    if !sync.is_extension_allowed(file_name) {
        bail!(
            "不允许的文件类型: {} (允许: {})",
            file_name,
            sync.allowed_extensions
                .as_deref()
                .unwrap_or_default()
                .join(", ")
        );
    }

    let key = normalize_path(&key.unwrap_or_else(|| file_name.to_string()));
    let remote = state.remote().await?;
    info!("上传 {} -> {}/{}", file.display(), remote.name(), key);

    let source = tokio::fs::File::open(file).await?;
    let data = tokio_util::io::ReaderStream::new(source)
        .map_err(SyncError::from)
        .boxed();
    let (object, size) = put_verified(remote.as_ref(), &key, data, metadata.len()).await?;

    println!("已上传 {} ({} 字节, revision {})", object.path, size, object.revision);
    Ok(())
}

/// 下载对象到本地文件（临时文件 + 原子重命名）
pub async fn download(state: &AppState, key: &str, file: &Path) -> anyhow::Result<()> {
    let key = normalize_path(key);
    let remote = state.remote().await?;
    let object = remote
        .stat(&key)
        .await?
        .ok_or_else(|| SyncError::NotFound(key.clone()))?;

    let dir = match file.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .with_context(|| format!("无效的目标路径: {}", file.display()))?;

    info!("下载 {}/{} -> {}", remote.name(), key, file.display());
    let target = LocalStorage::new(dir)?;
    let size = fetch_verified(remote.as_ref(), &object, &target, name).await?;

    println!("已下载 {} ({} 字节)", file.display(), size);
    Ok(())
}

/// 删除对象（不存在也视为成功）
pub async fn delete(state: &AppState, key: &str) -> anyhow::Result<()> {
    let key = normalize_path(key);
    let remote = state.remote().await?;
    remote.delete(&key).await?;
    println!("已删除 {}/{}", remote.name(), key);
    Ok(())
}

/// 列出前缀下的对象
pub async fn list(state: &AppState, prefix: Option<String>) -> anyhow::Result<()> {
    let remote = state.remote().await?;
    let prefix = prefix.map(|p| normalize_path(&p)).unwrap_or_default();

    let mut listing = remote.list(&prefix);
    let mut count = 0usize;
    let mut total = 0u64;
    while let Some(object) = listing.try_next().await? {
        let modified = object
            .last_modified
            .and_then(chrono::DateTime::from_timestamp_millis)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!("{:>12}  {}  {}  {}", object.size, modified, object.revision, object.path);
        count += 1;
        total += object.size;
    }

    println!("共 {} 个对象, {} 字节", count, total);
    Ok(())
}
