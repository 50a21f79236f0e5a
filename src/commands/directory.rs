//! 目录级批量操作：上传整个目录、按前缀下载、按前缀删除
//!
//! 与同步不同，这些命令不读写元数据，只做一次性的单向传输。

use super::object::{fetch_verified, put_verified};
use crate::config::extension_allowed;
use crate::core::scanner::{FileScanner, ScanConfig};
use crate::error::{Result, SyncError};
use crate::storage::{normalize_path, LocalEntry, LocalStorage, RemoteObject};
use crate::AppState;
use anyhow::bail;
use chrono::{DateTime, Local, NaiveDate};
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::BTreeSet;
use std::path::Path;
use tracing::{info, warn};

/// 批量操作的目录选项
#[derive(Debug, Clone, Default)]
pub struct DirOptions {
    /// 按修改日期组织为 `YYYY/MM/DD/文件名`
    pub sort_by_date: bool,
    /// 扩展名白名单，为空时使用配置中的 allowedExtensions
    pub extensions: Vec<String>,
}

impl DirOptions {
    fn allowed<'a>(&'a self, state: &'a AppState) -> Option<&'a [String]> {
        if self.extensions.is_empty() {
            state.config.sync.allowed_extensions.as_deref()
        } else {
            Some(self.extensions.as_slice())
        }
    }
}

/// 批量操作的汇总
#[derive(Debug, Default)]
struct Summary {
    done: usize,
    bytes: u64,
    skipped: usize,
    failed: Vec<(String, String)>,
}

impl Summary {
    fn record(&mut self, key: String, result: Result<u64>) {
        match result {
            Ok(bytes) => {
                self.done += 1;
                self.bytes += bytes;
            }
            Err(e) => {
                warn!("{} 失败: {}", key, e);
                self.failed.push((key, e.to_string()));
            }
        }
    }

    fn finish(self, verb: &str) -> anyhow::Result<()> {
        for (key, message) in &self.failed {
            println!("  失败 {}: {}", key, message);
        }
        println!(
            "{} {} 个, {} 字节, 跳过 {} 个, 失败 {} 个",
            verb,
            self.done,
            self.bytes,
            self.skipped,
            self.failed.len()
        );
        if !self.failed.is_empty() {
            bail!("{} 个对象{}失败", self.failed.len(), verb);
        }
        Ok(())
    }
}

/// 把前缀和相对路径拼成对象键
fn join_key(prefix: &str, relative: &str) -> String {
    if prefix.is_empty() {
        relative.to_string()
    } else {
        format!("{}/{}", prefix, relative)
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

fn dated(date: NaiveDate, path: &str) -> String {
    format!("{}/{}", date.format("%Y/%m/%d"), file_name(path))
}

/// 上传时的对象键：按日期组织时为 `prefix/YYYY/MM/DD/文件名`，否则保留相对路径
pub fn upload_key(prefix: &str, relative: &str, date: Option<NaiveDate>) -> String {
    match date {
        Some(date) => join_key(prefix, &dated(date, relative)),
        None => join_key(prefix, relative),
    }
}

/// 下载时的本地相对路径，键不在前缀下时返回 None
pub fn local_path(prefix: &str, key: &str, date: Option<NaiveDate>) -> Option<String> {
    let relative = if prefix.is_empty() {
        key
    } else {
        key.strip_prefix(prefix)?.strip_prefix('/')?
    };
    if relative.is_empty() {
        return None;
    }
    Some(match date {
        Some(date) => dated(date, relative),
        None => relative.to_string(),
    })
}

/// Unix 毫秒对应的本地日期
fn local_date(millis: i64) -> Option<NaiveDate> {
    DateTime::from_timestamp_millis(millis).map(|t| t.with_timezone(&Local).date_naive())
}

fn clean_prefix(prefix: Option<&str>) -> String {
    prefix
        .map(normalize_path)
        .unwrap_or_default()
        .trim_end_matches('/')
        .to_string()
}

/// 上传目录下的所有文件
///
/// 按日期组织时从新到旧上传，同一天的同名文件只保留最新的一个。
pub async fn upload_dir(
    state: &AppState,
    dir: &Path,
    prefix: Option<&str>,
    options: &DirOptions,
) -> anyhow::Result<()> {
    if !dir.is_dir() {
        bail!("不是目录: {}", dir.display());
    }
    let prefix = clean_prefix(prefix);
    let allowed = options.allowed(state);

    let source = LocalStorage::new(dir)?;
    let scanner = FileScanner::new(ScanConfig {
        exclude_patterns: state.config.sync.exclude_patterns.clone(),
    });

    let mut summary = Summary::default();
    let mut files: Vec<LocalEntry> = Vec::new();
    for entry in scanner.scan_local(&source).await?.into_values() {
        if extension_allowed(allowed, &entry.path) {
            files.push(entry);
        } else {
            summary.skipped += 1;
        }
    }
    if options.sort_by_date {
        files.sort_by(|a, b| b.modified_time.cmp(&a.modified_time));
    }

    let mut seen = BTreeSet::new();
    let mut jobs = Vec::with_capacity(files.len());
    for entry in files {
        let date = if options.sort_by_date {
            local_date(entry.modified_time)
        } else {
            None
        };
        let key = upload_key(&prefix, &entry.path, date);
        if !seen.insert(key.clone()) {
            warn!("对象键重复，保留较新的文件: {} ({})", key, entry.path);
            summary.skipped += 1;
            continue;
        }
        jobs.push((key, entry));
    }

    let remote = state.remote().await?;
    info!("上传目录 {} -> {}/{} ({} 个文件)", dir.display(), remote.name(), prefix, jobs.len());

    let concurrency = state.config.sync.max_concurrent_transfers.max(1);
    let source = &source;
    let remote = &remote;
    let results: Vec<(String, Result<u64>)> = stream::iter(jobs)
        .map(|(key, entry)| async move {
            let result = async {
                let data = source.read_stream(&entry.path).await?;
                let (_, size) = put_verified(remote.as_ref(), &key, data, entry.size).await?;
                Ok::<_, SyncError>(size)
            }
            .await;
            (key, result)
        })
        .buffered(concurrency)
        .collect()
        .await;

    for (key, result) in results {
        if result.is_ok() {
            println!("已上传 {}", key);
        }
        summary.record(key, result);
    }
    summary.finish("上传")
}

/// 下载前缀下的所有对象到目录，去掉前缀后保留相对路径
///
/// 按日期组织时同一天的同名对象只下载最新的一个。
pub async fn download_dir(
    state: &AppState,
    prefix: &str,
    dir: &Path,
    options: &DirOptions,
) -> anyhow::Result<()> {
    let prefix = clean_prefix(Some(prefix));
    let allowed = options.allowed(state);
    let remote = state.remote().await?;
    let scanner = FileScanner::new(ScanConfig {
        exclude_patterns: state.config.sync.exclude_patterns.clone(),
    });
    let listing = if prefix.is_empty() {
        String::new()
    } else {
        format!("{}/", prefix)
    };
    let objects = scanner.scan_remote(remote.as_ref(), &listing).await?;

    let mut objects: Vec<RemoteObject> = objects.into_values().collect();
    if options.sort_by_date {
        objects.sort_by(|a, b| b.last_modified.cmp(&a.last_modified));
    }

    let mut summary = Summary::default();
    let mut seen = BTreeSet::new();
    let mut jobs: Vec<(String, RemoteObject)> = Vec::new();
    for object in objects {
        if !extension_allowed(allowed, &object.path) {
            summary.skipped += 1;
            continue;
        }
        let date = if options.sort_by_date {
            object.last_modified.and_then(local_date)
        } else {
            None
        };
        let Some(relative) = local_path(&prefix, &object.path, date) else {
            summary.skipped += 1;
            continue;
        };
        if !seen.insert(relative.clone()) {
            warn!("本地路径重复，保留较新的对象: {} ({})", relative, object.path);
            summary.skipped += 1;
            continue;
        }
        jobs.push((relative, object));
    }

    let target = LocalStorage::new(dir)?;
    info!("下载 {}/{} -> {} ({} 个对象)", remote.name(), prefix, dir.display(), jobs.len());

    let concurrency = state.config.sync.max_concurrent_transfers.max(1);
    let target = &target;
    let remote = &remote;
    let results: Vec<(String, Result<u64>)> = stream::iter(jobs)
        .map(|(relative, object)| async move {
            let result = fetch_verified(remote.as_ref(), &object, target, &relative).await;
            (object.path, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (key, result) in results {
        summary.record(key, result);
    }
    summary.finish("下载")
}

/// 删除前缀下的所有对象（拒绝空前缀）
pub async fn delete_dir(state: &AppState, prefix: &str, options: &DirOptions) -> anyhow::Result<()> {
    let prefix = clean_prefix(Some(prefix));
    if prefix.is_empty() {
        bail!("拒绝删除整个存储，请指定前缀");
    }
    let allowed = options.allowed(state);
    let remote = state.remote().await?;

    let listing = format!("{}/", prefix);
    let keys: Vec<String> = remote
        .list(&listing)
        .map_ok(|object| object.path)
        .try_collect()
        .await?;

    let mut summary = Summary::default();
    let mut targets = Vec::with_capacity(keys.len());
    for key in keys {
        if extension_allowed(allowed, &key) {
            targets.push(key);
        } else {
            summary.skipped += 1;
        }
    }

    info!("删除 {}/{} 下的 {} 个对象", remote.name(), prefix, targets.len());
    let concurrency = state.config.sync.max_concurrent_transfers.max(1);
    let remote = &remote;
    let results: Vec<(String, Result<u64>)> = stream::iter(targets)
        .map(|key| async move {
            let result = remote.delete(&key).await.map(|()| 0);
            (key, result)
        })
        .buffer_unordered(concurrency)
        .collect()
        .await;

    for (key, result) in results {
        summary.record(key, result);
    }
    summary.finish("删除")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn day(y: i32, m: u32, d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(y, m, d).unwrap()
    }

    #[test]
    fn test_upload_key_layouts() {
        assert_eq!(upload_key("", "docs/a.pdf", None), "docs/a.pdf");
        assert_eq!(upload_key("backup", "docs/a.pdf", None), "backup/docs/a.pdf");
        assert_eq!(
            upload_key("backup", "docs/a.pdf", Some(day(2024, 3, 7))),
            "backup/2024/03/07/a.pdf"
        );
        assert_eq!(upload_key("", "b.jpg", Some(day(2023, 12, 31))), "2023/12/31/b.jpg");
    }

    #[test]
    fn test_local_path_strips_prefix() {
        assert_eq!(local_path("backup", "backup/docs/a.pdf", None).as_deref(), Some("docs/a.pdf"));
        assert_eq!(local_path("", "docs/a.pdf", None).as_deref(), Some("docs/a.pdf"));
        assert_eq!(
            local_path("backup", "backup/docs/a.pdf", Some(day(2024, 1, 2))).as_deref(),
            Some("2024/01/02/a.pdf")
        );
        // 前缀只按完整的路径段匹配
        assert_eq!(local_path("backup", "backupx/a.pdf", None), None);
        assert_eq!(local_path("backup", "backup", None), None);
        assert_eq!(local_path("backup", "backup/", None), None);
    }

    #[test]
    fn test_clean_prefix() {
        assert_eq!(clean_prefix(None), "");
        assert_eq!(clean_prefix(Some("/backup/2024/")), "backup/2024");
        assert_eq!(clean_prefix(Some("\\backup")), "backup");
    }

    #[test]
    fn test_local_date() {
        let millis = 1_700_000_000_000;
        let expected = DateTime::from_timestamp_millis(millis)
            .unwrap()
            .with_timezone(&Local)
            .date_naive();
        assert_eq!(local_date(millis), Some(expected));
    }
}
