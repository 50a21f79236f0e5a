pub mod local;
pub mod object;
pub mod s3;
pub mod webdav;

use crate::config::{StorageConfig, StorageType};
use crate::error::{Result, SyncError};
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

pub use local::LocalStorage;
pub use object::ObjectStorage;

// ============ 公共常量 ============

/// 非 IO 操作超时（秒）- stat, delete 等
pub const OP_TIMEOUT_SECS: u64 = 60;
/// IO 操作超时（秒）- read, write 等
pub const IO_TIMEOUT_SECS: u64 = 300;
/// 分段读取大小
pub const READ_CHUNK_SIZE: u64 = 4 * 1024 * 1024;

/// 字节流（下载/上传内容）
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// 远程对象列表流（按需分页拉取）
pub type ObjectStream<'a> = BoxStream<'a, Result<RemoteObject>>;

/// 远程对象信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RemoteObject {
    pub path: String,
    pub size: u64,
    /// 版本标记：ETag，后端不提供时退化为 "大小-修改时间"
    pub revision: String,
    /// 最后修改时间（Unix 毫秒）
    pub last_modified: Option<i64>,
}

impl RemoteObject {
    /// 根据后端元数据生成版本标记
    pub fn revision_from(etag: Option<&str>, size: u64, last_modified: Option<i64>) -> String {
        match etag {
            Some(tag) if !tag.trim_matches('"').is_empty() => tag.trim_matches('"').to_string(),
            _ => format!("{}-{}", size, last_modified.unwrap_or(0)),
        }
    }
}

/// 本地文件信息
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LocalEntry {
    pub path: String,
    pub size: u64,
    /// 修改时间（Unix 毫秒）
    pub modified_time: i64,
    /// 内容 hash，只在需要时计算
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// 远程对象存储抽象
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// 递归列出前缀下的所有对象（惰性流）
    fn list<'a>(&'a self, prefix: &'a str) -> ObjectStream<'a>;

    /// 获取对象元数据，不存在返回 None
    async fn stat(&self, path: &str) -> Result<Option<RemoteObject>>;

    /// 读取对象内容
    async fn get(&self, path: &str) -> Result<ByteStream>;

    /// 写入对象，返回写入后的对象信息（含新版本标记）
    async fn put(&self, path: &str, data: ByteStream, declared_size: u64) -> Result<RemoteObject>;

    /// 删除对象，对象不存在视为成功
    async fn delete(&self, path: &str) -> Result<()>;

    /// 获取存储名称（用于日志）
    fn name(&self) -> &str;
}

/// 根据配置创建远程存储实例
pub async fn create_remote(config: &StorageConfig) -> Result<Arc<dyn RemoteStore>> {
    match config.typ {
        StorageType::Local => {
            let path = config
                .path
                .as_ref()
                .ok_or_else(|| SyncError::InvalidConfig("Local storage requires path".into()))?;
            tracing::info!("初始化文件系统存储: {}", path);
            Ok(Arc::new(ObjectStorage::fs(path)?) as Arc<dyn RemoteStore>)
        }
        StorageType::S3 => {
            let bucket = required(&config.bucket, "S3 storage requires bucket")?;
            let region = required(&config.region, "S3 storage requires region")?;
            let access_key = required(&config.accessKey, "S3 storage requires accessKey")?;
            let secret_key = required(&config.secretKey, "S3 storage requires secretKey")?;
            tracing::info!("初始化S3存储: bucket={}, region={}", bucket, region);
            Ok(Arc::new(ObjectStorage::s3(
                bucket,
                region,
                access_key,
                secret_key,
                config.endpoint.clone(),
                config.prefix.clone(),
            )?) as Arc<dyn RemoteStore>)
        }
        StorageType::WebDav => {
            let endpoint = required(&config.webdavEndpoint, "WebDAV storage requires endpoint")?;
            let username = required(&config.username, "WebDAV storage requires username")?;
            let password = required(&config.password, "WebDAV storage requires password")?;
            tracing::info!("创建WebDAV存储: endpoint={}, root={:?}", endpoint, config.root);
            Ok(Arc::new(
                ObjectStorage::webdav(endpoint, username, password, config.root.clone()).await?,
            ) as Arc<dyn RemoteStore>)
        }
    }
}

fn required<'a>(value: &'a Option<String>, message: &str) -> Result<&'a str> {
    value
        .as_deref()
        .filter(|v| !v.is_empty())
        .ok_or_else(|| SyncError::InvalidConfig(message.to_string()))
}

/// 规范化相对路径：统一使用 /，去掉开头的分隔符
pub fn normalize_path(path: &str) -> String {
    path.replace('\\', "/").trim_start_matches('/').to_string()
}

/// 键能否原样映射为同步根下的相对路径
///
/// 拒绝空键、绝对路径、盘符、`.`/`..` 和空段，以及含 NUL 或反斜杠的键。
pub fn is_safe_key(key: &str) -> bool {
    if key.is_empty() || key.starts_with('/') || key.contains('\\') || key.contains('\0') {
        return false;
    }
    let drive_letter = key
        .split('/')
        .next()
        .is_some_and(|first| first.len() == 2 && first.ends_with(':'));
    !drive_letter
        && key
            .split('/')
            .all(|seg| !seg.is_empty() && seg != "." && seg != "..")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_revision_prefers_etag() {
        assert_eq!(
            RemoteObject::revision_from(Some("\"abc\""), 10, Some(5)),
            "abc"
        );
        assert_eq!(RemoteObject::revision_from(None, 10, Some(5)), "10-5");
        assert_eq!(RemoteObject::revision_from(Some("\"\""), 10, None), "10-0");
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("\\docs\\a.pdf"), "docs/a.pdf");
        assert_eq!(normalize_path("/img/b.jpg"), "img/b.jpg");
    }

    #[test]
    fn test_safe_keys() {
        for key in ["a.txt", "docs/2024/a.pdf", "..hidden", "a..b/c", "中文/名字.txt"] {
            assert!(is_safe_key(key), "{key}");
        }
        for key in [
            "",
            "../escaped.txt",
            "docs/../../x",
            "./a.txt",
            "/etc/passwd",
            "docs//a.txt",
            "docs/",
            "C:/Windows/a.txt",
            "a\\b",
            "a\0b",
        ] {
            assert!(!is_safe_key(key), "{key}");
        }
    }
}
