//! 内容指纹 - 用于变化检测和传输校验
//!
//! 使用 MD5：单段上传的 S3 ETag 就是内容的 MD5，可以直接与远程版本标记比较。

use crate::storage::ByteStream;
use futures::{stream, StreamExt};
use md5::Context;
use std::path::Path;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;

/// 流式计算时每次读取的块大小
pub const CHUNK_SIZE: usize = 64 * 1024;

/// 计算内容 hash
pub fn fingerprint(data: &[u8]) -> String {
    format!("{:x}", md5::compute(data))
}

/// 增量 hash 计算器，在流式传输过程中边读边算
pub struct Fingerprinter {
    context: Context,
    size: u64,
}

impl Fingerprinter {
    pub fn new() -> Self {
        Self {
            context: Context::new(),
            size: 0,
        }
    }

    pub fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
        self.size += data.len() as u64;
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    /// 结束计算，返回 (hash, 字节数)
    pub fn finish(self) -> (String, u64) {
        (format!("{:x}", self.context.finalize()), self.size)
    }
}

impl Default for Fingerprinter {
    fn default() -> Self {
        Self::new()
    }
}

/// 按固定大小分块读取并计算 hash，不会把整个文件读入内存
pub async fn fingerprint_reader<R>(mut reader: R) -> std::io::Result<(String, u64)>
where
    R: AsyncRead + Unpin,
{
    let mut hasher = Fingerprinter::new();
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = reader.read(&mut buf).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hasher.finish())
}

/// 计算本地文件的 hash
pub async fn fingerprint_file(path: &Path) -> std::io::Result<(String, u64)> {
    let file = tokio::fs::File::open(path).await?;
    fingerprint_reader(file).await
}

/// 包装字节流，流结束时通过 channel 交出 (hash, 字节数)
///
/// 消费方提前丢弃流时 receiver 会收到错误。
pub fn hashing_stream(inner: ByteStream) -> (ByteStream, oneshot::Receiver<(String, u64)>) {
    let (tx, rx) = oneshot::channel();
    let stream = stream::unfold(
        (inner, Fingerprinter::new(), Some(tx)),
        |(mut inner, mut hasher, mut tx)| async move {
            match inner.next().await {
                Some(Ok(chunk)) => {
                    hasher.update(&chunk);
                    Some((Ok(chunk), (inner, hasher, tx)))
                }
                Some(Err(e)) => Some((Err(e), (inner, hasher, None))),
                None => {
                    if let Some(tx) = tx.take() {
                        let _ = tx.send(hasher.finish());
                    }
                    None
                }
            }
        },
    );
    (stream.boxed(), rx)
}

/// 版本标记是否是内容 MD5（分段上传的 ETag 带 "-N" 后缀，不是内容 hash）
pub fn is_content_hash(revision: &str) -> bool {
    revision.len() == 32 && revision.bytes().all(|b| b.is_ascii_hexdigit())
}

/// 同步根的身份指纹，写入元数据文件，防止误用其他同步根的记录
pub fn root_fingerprint(remote_name: &str, local_root: &Path) -> String {
    let mut hasher = blake3::Hasher::new();
    hasher.update(remote_name.as_bytes());
    hasher.update(b"\0");
    hasher.update(local_root.to_string_lossy().as_bytes());
    hasher.finalize().to_hex()[..16].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_content_has_stable_hash() {
        assert_eq!(fingerprint(b""), "d41d8cd98f00b204e9800998ecf8427e");
        assert_eq!(fingerprint(b""), fingerprint(&[]));
    }

    #[tokio::test]
    async fn test_reader_matches_one_shot() {
        // 跨越多个块
        let data: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();
        let (hash, size) = fingerprint_reader(&data[..]).await.unwrap();
        assert_eq!(hash, fingerprint(&data));
        assert_eq!(size, data.len() as u64);
    }

    #[test]
    fn test_incremental_matches_one_shot() {
        let mut hasher = Fingerprinter::new();
        hasher.update(b"hello ");
        hasher.update(b"world");
        assert_eq!(hasher.size(), 11);
        let (hash, size) = hasher.finish();
        assert_eq!(hash, fingerprint(b"hello world"));
        assert_eq!(size, 11);
    }

    #[tokio::test]
    async fn test_hashing_stream_passes_bytes_through() {
        use bytes::Bytes;

        let inner = stream::iter(vec![
            Ok(Bytes::from_static(b"docs ")),
            Ok(Bytes::from_static(b"a.pdf")),
        ])
        .boxed();
        let (wrapped, rx) = hashing_stream(inner);
        let chunks: Vec<Bytes> = wrapped.map(|c| c.unwrap()).collect().await;
        assert_eq!(chunks.concat(), b"docs a.pdf");

        let (hash, size) = rx.await.unwrap();
        assert_eq!(hash, fingerprint(b"docs a.pdf"));
        assert_eq!(size, 10);
    }

    #[test]
    fn test_is_content_hash() {
        assert!(is_content_hash("d41d8cd98f00b204e9800998ecf8427e"));
        assert!(!is_content_hash("d41d8cd98f00b204e9800998ecf8427e-3"));
        assert!(!is_content_hash("100-1700000000000"));
    }

    #[test]
    fn test_root_fingerprint() {
        let a = root_fingerprint("s3://bucket/docs", Path::new("/data/docs"));
        let b = root_fingerprint("s3://bucket/docs", Path::new("/data/docs"));
        let c = root_fingerprint("s3://bucket/img", Path::new("/data/docs"));
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 16);
    }
}
