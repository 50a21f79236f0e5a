//! 日志模块 - 提供文件日志和大小管理功能

use crate::config::LogConfig;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::prelude::*;
use tracing_subscriber::EnvFilter;

/// 日志文件名
pub const LOG_FILE: &str = "bucketsync.log";

/// 带大小限制的日志写入器，超过上限时把当前文件改名为 .log.old
///
/// 由 tracing-appender 的后台线程独占，不需要加锁。
pub struct SizeRotatingWriter {
    file_path: PathBuf,
    max_size: u64,
    writer: BufWriter<File>,
    written: u64,
}

impl SizeRotatingWriter {
    pub fn new(log_dir: &Path, max_size_mb: u32) -> io::Result<Self> {
        fs::create_dir_all(log_dir)?;

        let file_path = log_dir.join(LOG_FILE);
        let max_size = (max_size_mb as u64) * 1024 * 1024;

        let (writer, written) = Self::open_file(&file_path, max_size)?;

        Ok(Self {
            file_path,
            max_size,
            writer,
            written,
        })
    }

    fn open_file(file_path: &Path, max_size: u64) -> io::Result<(BufWriter<File>, u64)> {
        // 检查现有文件大小，如果超过限制则轮转
        if let Ok(metadata) = fs::metadata(file_path) {
            if metadata.len() > max_size {
                Self::rotate_log(file_path)?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(file_path)?;
        let written = file.metadata()?.len();

        Ok((BufWriter::new(file), written))
    }

    /// 轮转日志文件
    fn rotate_log(file_path: &Path) -> io::Result<()> {
        let backup_path = file_path.with_extension("log.old");

        if backup_path.exists() {
            fs::remove_file(&backup_path)?;
        }

        fs::rename(file_path, &backup_path)
    }

    fn rotate(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        Self::rotate_log(&self.file_path)?;
        let (writer, written) = Self::open_file(&self.file_path, self.max_size)?;
        self.writer = writer;
        self.written = written;
        Ok(())
    }
}

impl Write for SizeRotatingWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.writer.write(buf)?;
        self.written += n as u64;
        if self.written > self.max_size {
            self.rotate()?;
        }
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.writer.flush()
    }
}

/// 初始化日志系统
///
/// 返回的 guard 必须保持到进程退出，否则缓冲中的日志会丢失。
pub fn init_logging(config: &LogConfig, log_dir: &Path, verbose: bool) -> Option<WorkerGuard> {
    let level = if verbose {
        tracing::Level::DEBUG
    } else {
        config.tracing_level()
    };
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "{},opendal=warn,hyper=warn,reqwest=warn",
            level.as_str().to_lowercase()
        ))
    });

    let (file_layer, guard) = if config.enabled {
        match SizeRotatingWriter::new(log_dir, config.max_size_mb) {
            Ok(writer) => {
                let (non_blocking, guard) = tracing_appender::non_blocking(writer);
                let layer = tracing_subscriber::fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(false)
                    .with_thread_ids(false)
                    .with_thread_names(false);
                (Some(layer), Some(guard))
            }
            Err(e) => {
                eprintln!("无法创建日志文件 {:?}: {}", log_dir, e);
                (None, None)
            }
        }
    } else {
        (None, None)
    };

    // debug 构建、-v 或文件日志创建失败时输出到 stderr（stdout 留给命令输出）
    let file_failed = config.enabled && file_layer.is_none();
    let console_layer = (cfg!(debug_assertions) || verbose || file_failed).then(|| {
        tracing_subscriber::fmt::layer()
            .with_writer(io::stderr)
            .with_target(false)
            .with_thread_ids(false)
            .with_thread_names(false)
    });

    let subscriber = tracing_subscriber::registry()
        .with(env_filter)
        .with(file_layer)
        .with(console_layer);
    let _ = tracing::subscriber::set_global_default(subscriber);

    guard
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rotates_when_over_limit() {
        let dir = tempfile::tempdir().unwrap();
        let mut writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();

        let line = vec![b'x'; 64 * 1024];
        for _ in 0..20 {
            writer.write_all(&line).unwrap();
        }
        writer.flush().unwrap();

        let old = dir.path().join("bucketsync.log.old");
        assert!(old.exists());
        assert!(fs::metadata(&old).unwrap().len() > 1024 * 1024);
        assert!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len() < 1024 * 1024);
    }

    #[test]
    fn test_oversized_file_rotated_on_open() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join(LOG_FILE), vec![b'y'; 2 * 1024 * 1024]).unwrap();

        let _writer = SizeRotatingWriter::new(dir.path(), 1).unwrap();
        assert!(dir.path().join("bucketsync.log.old").exists());
        assert_eq!(fs::metadata(dir.path().join(LOG_FILE)).unwrap().len(), 0);
    }
}
