//! 基于 opendal 的对象存储实现

use super::{
    normalize_path, ByteStream, ObjectStream, RemoteObject, RemoteStore, IO_TIMEOUT_SECS,
    OP_TIMEOUT_SECS, READ_CHUNK_SIZE,
};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use opendal::{layers::TimeoutLayer, Entry, Metakey, Operator};
use std::time::Duration;

pub struct ObjectStorage {
    operator: Operator,
    name: String,
    /// 写入前逐级创建父目录（WebDAV 需要）
    create_parents: bool,
}

impl ObjectStorage {
    /// 包装一个已构建的 operator，统一加上超时层
    pub fn from_operator(operator: Operator, name: String) -> Self {
        let operator = operator.layer(
            TimeoutLayer::default()
                .with_timeout(Duration::from_secs(OP_TIMEOUT_SECS))
                .with_io_timeout(Duration::from_secs(IO_TIMEOUT_SECS)),
        );
        Self {
            operator,
            name,
            create_parents: false,
        }
    }

    pub fn with_parent_dirs(mut self) -> Self {
        self.create_parents = true;
        self
    }

    /// 递归创建父目录，忽略已存在等错误
    async fn create_parent_dirs(&self, path: &str) {
        let parts: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
        let mut current_path = String::new();
        for part in parts.iter().take(parts.len().saturating_sub(1)) {
            current_path.push_str(part);
            current_path.push('/');
            let _ = self.operator.create_dir(&current_path).await;
        }
    }

    /// 以本地目录（如 NAS 挂载点）作为远程存储
    pub fn fs(root: &str) -> Result<Self> {
        use opendal::services::Fs;

        std::fs::create_dir_all(root)?;
        let builder = Fs::default().root(root);
        let operator = Operator::new(builder)?.finish();
        Ok(Self::from_operator(operator, format!("fs://{}", root)))
    }

    fn to_remote_object(entry: &Entry) -> Option<RemoteObject> {
        let path = entry.path();

        // 跳过根目录和目录条目
        if path.is_empty() || path == "/" || path.ends_with('/') {
            return None;
        }

        let meta = entry.metadata();
        if meta.is_dir() {
            return None;
        }

        let size = meta.content_length();
        let last_modified = meta.last_modified().map(|t| t.timestamp_millis());
        Some(RemoteObject {
            path: normalize_path(path),
            size,
            revision: RemoteObject::revision_from(meta.etag(), size, last_modified),
            last_modified,
        })
    }
}

#[async_trait]
impl RemoteStore for ObjectStorage {
    fn list<'a>(&'a self, prefix: &'a str) -> ObjectStream<'a> {
        // 使用 lister_with 进行递归列表，后端分页由 lister 按需拉取
        let lister = async move {
            self.operator
                .lister_with(prefix)
                .recursive(true)
                .metakey(
                    Metakey::ContentLength | Metakey::LastModified | Metakey::Mode | Metakey::Etag,
                )
                .await
                .map_err(SyncError::from)
        };

        stream::once(lister)
            .map_ok(|lister| lister.map_err(SyncError::from))
            .try_flatten()
            .try_filter_map(|entry| async move { Ok::<_, SyncError>(Self::to_remote_object(&entry)) })
            .boxed()
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteObject>> {
        match self.operator.stat(path).await {
            Ok(meta) if meta.is_dir() => Ok(None),
            Ok(meta) => {
                let size = meta.content_length();
                let last_modified = meta.last_modified().map(|t| t.timestamp_millis());
                Ok(Some(RemoteObject {
                    path: normalize_path(path),
                    size,
                    revision: RemoteObject::revision_from(meta.etag(), size, last_modified),
                    last_modified,
                }))
            }
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let total = self
            .stat(path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?
            .size;

        let operator = self.operator.clone();
        let path = path.to_string();

        // 按块分段读取，避免整个对象进入内存
        let chunks = stream::try_unfold(0u64, move |offset| {
            let operator = operator.clone();
            let path = path.clone();
            async move {
                if offset >= total {
                    return Ok(None);
                }
                let end = (offset + READ_CHUNK_SIZE).min(total);
                let data = operator.read_with(&path).range(offset..end).await?;
                let chunk = Bytes::from(data.to_vec());
                if chunk.is_empty() {
                    return Err(SyncError::Backend(format!(
                        "对象在读取过程中被截断: {} (offset {})",
                        path, offset
                    )));
                }
                let next = offset + chunk.len() as u64;
                Ok(Some((chunk, next)))
            }
        });

        Ok(chunks.boxed())
    }

    async fn put(
        &self,
        path: &str,
        mut data: ByteStream,
        declared_size: u64,
    ) -> Result<RemoteObject> {
        if self.create_parents {
            self.create_parent_dirs(path).await;
        }

        let mut writer = self.operator.writer(path).await?;
        let mut written = 0u64;

        while let Some(chunk) = data.next().await {
            let chunk = match chunk {
                Ok(c) => c,
                Err(e) => {
                    let _ = writer.abort().await;
                    return Err(e);
                }
            };
            written += chunk.len() as u64;
            writer.write(chunk).await?;
        }

        if written != declared_size {
            let _ = writer.abort().await;
            return Err(SyncError::IntegrityMismatch {
                path: path.to_string(),
                expected: format!("{} bytes", declared_size),
                actual: format!("{} bytes", written),
            });
        }

        writer.close().await?;

        self.stat(path)
            .await?
            .ok_or_else(|| SyncError::NotFound(path.to_string()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        match self.operator.delete(path).await {
            Ok(_) => Ok(()),
            Err(e) if e.kind() == opendal::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn name(&self) -> &str {
        &self.name
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::TryStreamExt;

    async fn collect(stream: ByteStream) -> Vec<u8> {
        let chunks: Vec<Bytes> = stream.try_collect().await.unwrap();
        chunks.concat()
    }

    #[tokio::test]
    async fn test_fs_backend_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStorage::fs(dir.path().to_str().unwrap()).unwrap();

        let body: ByteStream = stream::iter(vec![
            Ok(Bytes::from_static(b"hello ")),
            Ok(Bytes::from_static(b"world")),
        ])
        .boxed();
        let obj = store.put("docs/a.txt", body, 11).await.unwrap();
        assert_eq!(obj.path, "docs/a.txt");
        assert_eq!(obj.size, 11);

        let data = collect(store.get("docs/a.txt").await.unwrap()).await;
        assert_eq!(data, b"hello world");

        let listed: Vec<RemoteObject> = store.list("").try_collect().await.unwrap();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].path, "docs/a.txt");

        store.delete("docs/a.txt").await.unwrap();
        store.delete("docs/a.txt").await.unwrap();
        assert!(store.stat("docs/a.txt").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_get_missing_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStorage::fs(dir.path().to_str().unwrap()).unwrap();
        match store.get("nope.bin").await {
            Err(SyncError::NotFound(_)) => {}
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_put_rejects_short_body() {
        let dir = tempfile::tempdir().unwrap();
        let store = ObjectStorage::fs(dir.path().to_str().unwrap()).unwrap();
        let body: ByteStream = stream::iter(vec![Ok(Bytes::from_static(b"abc"))]).boxed();
        let err = store.put("short.bin", body, 10).await.unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::IntegrityMismatch);
    }
}
