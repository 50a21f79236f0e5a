#![allow(dead_code)]

use async_trait::async_trait;
use bucketsync_lib::config::SyncSettings;
use bucketsync_lib::core::EngineOptions;
use bucketsync_lib::error::{Result, SyncError};
use bucketsync_lib::storage::{ByteStream, LocalStorage, ObjectStream, RemoteObject, RemoteStore};
use bucketsync_lib::SyncEngine;
use bytes::Bytes;
use futures::{stream, StreamExt, TryStreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};
use tempfile::TempDir;

struct StoredObject {
    data: Bytes,
    revision: String,
    last_modified: i64,
}

/// 内存中的对象存储，revision 为内容 MD5
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, StoredObject>>,
    clock: AtomicI64,
    fail_list: AtomicBool,
    corrupt_reads: Mutex<BTreeSet<String>>,
    stalled_reads: Mutex<BTreeSet<String>>,
    rejected_puts: Mutex<BTreeSet<String>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            clock: AtomicI64::new(1_700_000_000_000),
            ..Default::default()
        }
    }

    /// 直接写入对象（模拟其他客户端），修改时间取内部时钟
    pub fn insert(&self, path: &str, data: &[u8]) {
        let at = self.tick();
        self.insert_at(path, data, at);
    }

    pub fn insert_at(&self, path: &str, data: &[u8], last_modified: i64) {
        self.objects.lock().unwrap().insert(
            path.to_string(),
            StoredObject {
                data: Bytes::copy_from_slice(data),
                revision: format!("{:x}", md5::compute(data)),
                last_modified,
            },
        );
    }

    pub fn remove(&self, path: &str) {
        self.objects.lock().unwrap().remove(path);
    }

    pub fn content(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(path).map(|o| o.data.to_vec())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(path)
    }

    pub fn paths(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    /// 列表在返回第一个对象后失败
    pub fn fail_listing(&self, fail: bool) {
        self.fail_list.store(fail, Ordering::SeqCst);
    }

    /// 读取该路径时返回被篡改的内容（大小不变）
    pub fn corrupt_reads(&self, path: &str) {
        self.corrupt_reads.lock().unwrap().insert(path.to_string());
    }

    /// 读取该路径时返回一个永远不产出数据的流
    pub fn stall_reads(&self, path: &str) {
        self.stalled_reads.lock().unwrap().insert(path.to_string());
    }

    /// 写入该路径时返回配额错误，对象保持不变
    pub fn reject_puts(&self, path: &str) {
        self.rejected_puts.lock().unwrap().insert(path.to_string());
    }

    pub fn set_clock(&self, millis: i64) {
        self.clock.store(millis, Ordering::SeqCst);
    }

    fn tick(&self) -> i64 {
        self.clock.fetch_add(1_000, Ordering::SeqCst) + 1_000
    }

    fn object(path: &str, stored: &StoredObject) -> RemoteObject {
        RemoteObject {
            path: path.to_string(),
            size: stored.data.len() as u64,
            revision: stored.revision.clone(),
            last_modified: Some(stored.last_modified),
        }
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    fn list<'a>(&'a self, prefix: &'a str) -> ObjectStream<'a> {
        let items: Vec<Result<RemoteObject>> = self
            .objects
            .lock()
            .unwrap()
            .iter()
            .filter(|(path, _)| path.starts_with(prefix))
            .map(|(path, stored)| Ok(Self::object(path, stored)))
            .collect();

        if self.fail_list.load(Ordering::SeqCst) {
            let first = items.into_iter().take(1);
            let failure = Err(SyncError::ConnectivityError("listing interrupted".into()));
            return stream::iter(first.chain(std::iter::once(failure))).boxed();
        }
        stream::iter(items).boxed()
    }

    async fn stat(&self, path: &str) -> Result<Option<RemoteObject>> {
        Ok(self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|stored| Self::object(path, stored)))
    }

    async fn get(&self, path: &str) -> Result<ByteStream> {
        let mut data = self
            .objects
            .lock()
            .unwrap()
            .get(path)
            .map(|stored| stored.data.to_vec())
            .ok_or_else(|| SyncError::NotFound(path.to_string()))?;

        if self.stalled_reads.lock().unwrap().contains(path) {
            return Ok(stream::pending().boxed());
        }
        if self.corrupt_reads.lock().unwrap().contains(path) {
            if let Some(first) = data.first_mut() {
                *first ^= 0xff;
            }
        }

        let chunks: Vec<Result<Bytes>> = data
            .chunks(3)
            .map(|c| Ok(Bytes::copy_from_slice(c)))
            .collect();
        Ok(stream::iter(chunks).boxed())
    }

    async fn put(&self, path: &str, mut data: ByteStream, _declared_size: u64) -> Result<RemoteObject> {
        if self.rejected_puts.lock().unwrap().contains(path) {
            return Err(SyncError::QuotaExceeded(format!("bucket quota exceeded: {path}")));
        }
        let mut buf = Vec::new();
        while let Some(chunk) = data.try_next().await? {
            buf.extend_from_slice(&chunk);
        }
        self.insert(path, &buf);
        self.stat(path)
            .await?
            .ok_or_else(|| SyncError::Backend("object vanished".into()))
    }

    async fn delete(&self, path: &str) -> Result<()> {
        self.remove(path);
        Ok(())
    }

    fn name(&self) -> &str {
        "memory://test"
    }
}

/// 一个本地目录 + 一个内存远程
pub struct Fixture {
    pub dir: TempDir,
    pub local: Arc<LocalStorage>,
    pub remote: Arc<MemoryStore>,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let local = Arc::new(LocalStorage::new(dir.path().join("mirror")).unwrap());
        Self {
            dir,
            local,
            remote: Arc::new(MemoryStore::new()),
        }
    }

    pub async fn engine(&self, options: EngineOptions) -> SyncEngine {
        let remote: Arc<dyn RemoteStore> = self.remote.clone();
        SyncEngine::new(remote, self.local.clone(), options)
            .await
            .unwrap()
    }

    pub fn root(&self) -> &Path {
        self.local.root()
    }

    pub fn path(&self, rel: &str) -> PathBuf {
        self.local.full_path(rel).unwrap()
    }

    pub fn write(&self, rel: &str, data: &[u8]) {
        let path = self.path(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    pub fn read(&self, rel: &str) -> Option<Vec<u8>> {
        std::fs::read(self.path(rel)).ok()
    }

    /// 设置本地文件的修改时间（Unix 毫秒）
    pub fn set_mtime(&self, rel: &str, millis: i64) {
        let file = std::fs::File::options()
            .write(true)
            .open(self.path(rel))
            .unwrap();
        let time = SystemTime::UNIX_EPOCH + Duration::from_millis(millis as u64);
        file.set_modified(time).unwrap();
    }
}

pub fn default_options() -> EngineOptions {
    SyncSettings::default().engine_options()
}
