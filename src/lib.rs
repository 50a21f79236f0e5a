use anyhow::Context;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub mod commands;
pub mod config;
pub mod core;
pub mod error;
pub mod logging;
pub mod storage;

pub use crate::config::{AppConfig, StorageConfig, StorageType};
pub use crate::core::{PollingMonitor, RunReport, SyncEngine};
pub use crate::error::{ErrorKind, SyncError};

use storage::{LocalStorage, RemoteStore};

/// 应用状态，在各个命令之间共享
pub struct AppState {
    pub config_dir: PathBuf,
    pub config_path: PathBuf,
    pub config: AppConfig,
}

impl AppState {
    /// 默认配置目录（按平台约定）
    pub fn default_config_dir() -> PathBuf {
        ProjectDirs::from("", "", "bucketsync")
            .map(|dirs| dirs.config_dir().to_path_buf())
            .unwrap_or_else(|| PathBuf::from(".bucketsync-config"))
    }

    /// 加载配置，config_path 为空时使用默认位置
    pub fn load(config_path: Option<PathBuf>) -> anyhow::Result<Self> {
        let config_path =
            config_path.unwrap_or_else(|| Self::default_config_dir().join(config::CONFIG_FILE));
        let config_dir = config_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let config = AppConfig::load(&config_path)
            .with_context(|| format!("加载配置失败: {}", config_path.display()))?;
        config.validate().context("配置校验失败")?;

        tracing::debug!("使用配置文件: {:?}", config_path);
        Ok(Self {
            config_dir,
            config_path,
            config,
        })
    }

    /// 日志目录
    pub fn log_dir(&self) -> PathBuf {
        self.config_dir.join("logs")
    }

    /// 创建远程存储
    pub async fn remote(&self) -> anyhow::Result<Arc<dyn RemoteStore>> {
        storage::create_remote(&self.config.remote)
            .await
            .context("远程存储连接失败")
    }

    /// 本地同步目录
    pub fn local(&self) -> anyhow::Result<Arc<LocalStorage>> {
        let root = self.config.local_root()?;
        let local = LocalStorage::new(root)
            .with_context(|| format!("无法打开本地目录: {}", root.display()))?;
        Ok(Arc::new(local))
    }

    /// 创建同步引擎
    pub async fn engine(&self) -> anyhow::Result<Arc<SyncEngine>> {
        let local = self.local()?;
        let remote = self.remote().await?;
        let engine = SyncEngine::new(remote, local, self.config.sync.engine_options())
            .await
            .context("初始化同步引擎失败")?;
        Ok(Arc::new(engine))
    }
}
