//! 应用配置模块
#![allow(non_snake_case)]

use crate::core::conflict::ConflictPolicy;
use crate::core::engine::EngineOptions;
use crate::core::executor::ExecutorOptions;
use crate::core::planner::PlanOptions;
use crate::core::scanner::{default_exclude_patterns, ScanConfig};
use crate::error::{Result, SyncError};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// 配置文件名
pub const CONFIG_FILE: &str = "config.json";

/// 存储类型
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    #[default]
    Local,
    S3,
    WebDav,
}

/// 远程存储配置
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageConfig {
    #[serde(rename = "type", default)]
    pub typ: StorageType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accessKey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretKey: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webdavEndpoint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub root: Option<String>,
}

impl StorageConfig {
    /// 用于显示的副本，隐藏密钥
    pub fn redacted(&self) -> Self {
        let hide = |v: &Option<String>| v.as_ref().map(|_| "******".to_string());
        Self {
            secretKey: hide(&self.secretKey),
            password: hide(&self.password),
            ..self.clone()
        }
    }
}

/// 同步设置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncSettings {
    #[serde(default)]
    pub conflict_policy: ConflictPolicy,
    /// 一侧删除后是否删除另一侧
    #[serde(default = "default_true")]
    pub propagate_deletions: bool,
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent_transfers: usize,
    /// 扩展名白名单，null 表示不过滤
    #[serde(default)]
    pub allowed_extensions: Option<Vec<String>>,
    #[serde(default = "default_transfer_timeout")]
    pub transfer_timeout_seconds: u64,
    /// 覆盖或删除本地文件前保留旧版本
    #[serde(default)]
    pub keep_versions: bool,
    #[serde(default)]
    pub case_insensitive_remote: bool,
    #[serde(default = "default_exclude_patterns")]
    pub exclude_patterns: Vec<String>,
    /// 任一侧超过该大小（字节）的路径不参与同步，0 表示不限制
    #[serde(default)]
    pub max_file_size: u64,
}

fn default_true() -> bool {
    true
}

fn default_poll_interval() -> u64 {
    60
}

fn default_max_concurrent() -> usize {
    4
}

fn default_transfer_timeout() -> u64 {
    300
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            conflict_policy: ConflictPolicy::default(),
            propagate_deletions: true,
            poll_interval_seconds: default_poll_interval(),
            max_concurrent_transfers: default_max_concurrent(),
            allowed_extensions: None,
            transfer_timeout_seconds: default_transfer_timeout(),
            keep_versions: false,
            case_insensitive_remote: false,
            exclude_patterns: default_exclude_patterns(),
            max_file_size: 0,
        }
    }
}

impl SyncSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn engine_options(&self) -> EngineOptions {
        EngineOptions {
            plan: PlanOptions {
                conflict_policy: self.conflict_policy,
                propagate_deletions: self.propagate_deletions,
                allowed_extensions: self.allowed_extensions.clone(),
                case_insensitive_remote: self.case_insensitive_remote,
                max_file_size: self.max_file_size,
            },
            scan: ScanConfig {
                exclude_patterns: self.exclude_patterns.clone(),
            },
            executor: ExecutorOptions {
                max_concurrent_transfers: self.max_concurrent_transfers,
                transfer_timeout: Duration::from_secs(self.transfer_timeout_seconds),
                keep_versions: self.keep_versions,
            },
        }
    }

    /// 单个文件上传前的扩展名检查
    pub fn is_extension_allowed(&self, path: &str) -> bool {
        extension_allowed(self.allowed_extensions.as_deref(), path)
    }
}

/// 扩展名是否在白名单内（None 表示不过滤，没有扩展名的文件不匹配任何白名单）
pub fn extension_allowed(allowed: Option<&[String]>, path: &str) -> bool {
    let Some(allowed) = allowed else {
        return true;
    };
    let name = path.rsplit(['/', '\\']).next().unwrap_or(path);
    match name.rfind('.') {
        Some(pos) if pos > 0 => {
            let ext = name[pos + 1..].to_lowercase();
            allowed
                .iter()
                .any(|a| a.trim().trim_start_matches('.').to_lowercase() == ext)
        }
        _ => false,
    }
}

/// 日志配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LogConfig {
    /// 是否启用日志记录
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// 最大日志文件大小（MB）
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u32,
    /// 日志级别: "error", "warn", "info", "debug", "trace"
    #[serde(default = "default_level")]
    pub level: String,
}

fn default_max_size_mb() -> u32 {
    5 // 默认 5MB
}

fn default_level() -> String {
    "info".to_string()
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_size_mb: default_max_size_mb(),
            level: default_level(),
        }
    }
}

impl LogConfig {
    /// 将配置的日志级别转换为 tracing Level
    pub fn tracing_level(&self) -> tracing::Level {
        match self.level.to_lowercase().as_str() {
            "error" => tracing::Level::ERROR,
            "warn" => tracing::Level::WARN,
            "debug" => tracing::Level::DEBUG,
            "trace" => tracing::Level::TRACE,
            _ => tracing::Level::INFO,
        }
    }
}

/// 完整配置（config.json）
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppConfig {
    #[serde(default)]
    pub remote: StorageConfig,
    /// 本地同步目录
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_root: Option<PathBuf>,
    #[serde(default)]
    pub sync: SyncSettings,
    #[serde(default)]
    pub log: LogConfig,
}

impl AppConfig {
    /// 从文件加载配置，文件不存在时使用默认值；缺少的凭证从环境变量补充
    pub fn load(path: &Path) -> Result<Self> {
        let mut config = match fs::read_to_string(path) {
            Ok(content) => serde_json::from_str::<AppConfig>(&content).map_err(|e| {
                SyncError::InvalidConfig(format!("{}: {}", path.display(), e))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Self::default(),
            Err(e) => return Err(e.into()),
        };
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 保存配置（格式化的 JSON）
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self).map_err(std::io::Error::other)?;
        fs::write(path, content)?;
        Ok(())
    }

    /// 用环境变量补充文件中没有的 S3 凭证
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        let remote = &mut self.remote;
        for (field, key) in [
            (&mut remote.accessKey, "AWS_ACCESS_KEY_ID"),
            (&mut remote.secretKey, "AWS_SECRET_ACCESS_KEY"),
            (&mut remote.region, "AWS_DEFAULT_REGION"),
        ] {
            if field.as_deref().map_or(true, str::is_empty) {
                if let Some(value) = lookup(key).filter(|v| !v.is_empty()) {
                    *field = Some(value);
                }
            }
        }
    }

    /// 校验数值配置
    pub fn validate(&self) -> Result<()> {
        let sync = &self.sync;
        if sync.poll_interval_seconds == 0 {
            return Err(SyncError::InvalidConfig("pollIntervalSeconds 必须大于 0".into()));
        }
        if sync.max_concurrent_transfers == 0 {
            return Err(SyncError::InvalidConfig(
                "maxConcurrentTransfers 必须大于 0".into(),
            ));
        }
        if sync.transfer_timeout_seconds == 0 {
            return Err(SyncError::InvalidConfig(
                "transferTimeoutSeconds 必须大于 0".into(),
            ));
        }
        if self.log.max_size_mb == 0 {
            return Err(SyncError::InvalidConfig("log.maxSizeMb 必须大于 0".into()));
        }
        if let Some(extensions) = &sync.allowed_extensions {
            if extensions.iter().any(|e| e.trim().trim_start_matches('.').is_empty()) {
                return Err(SyncError::InvalidConfig("allowedExtensions 包含空扩展名".into()));
            }
        }
        Ok(())
    }

    /// 本地同步目录（sync / plan / monitor 需要）
    pub fn local_root(&self) -> Result<&Path> {
        self.local_root
            .as_deref()
            .ok_or_else(|| SyncError::InvalidConfig("未配置 localRoot".into()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_from_empty_object() {
        let config: AppConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::MirrorRemote);
        assert!(config.sync.propagate_deletions);
        assert_eq!(config.sync.poll_interval_seconds, 60);
        assert_eq!(config.sync.max_concurrent_transfers, 4);
        assert_eq!(config.sync.transfer_timeout_seconds, 300);
        assert!(config.sync.allowed_extensions.is_none());
        assert!(!config.sync.keep_versions);
        assert!(config.sync.exclude_patterns.contains(&".bucketsync/**".to_string()));
        assert_eq!(config.log.max_size_mb, 5);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let json = r#"{
            "remote": {"type": "s3", "bucket": "backups", "region": "eu-west-1", "prefix": "laptop"},
            "localRoot": "/data/docs",
            "sync": {"conflictPolicy": "manual", "allowedExtensions": ["pdf", ".jpg"], "pollIntervalSeconds": 15},
            "log": {"level": "debug"}
        }"#;
        let config: AppConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.remote.typ, StorageType::S3);
        assert_eq!(config.remote.bucket.as_deref(), Some("backups"));
        assert_eq!(config.local_root().unwrap(), Path::new("/data/docs"));
        assert_eq!(config.sync.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(config.sync.poll_interval(), Duration::from_secs(15));
        assert_eq!(config.log.tracing_level(), tracing::Level::DEBUG);

        let options = config.sync.engine_options();
        assert_eq!(options.plan.conflict_policy, ConflictPolicy::Manual);
        assert_eq!(options.executor.max_concurrent_transfers, 4);
    }

    #[test]
    fn test_validate_rejects_zero() {
        let mut config = AppConfig::default();
        config.sync.poll_interval_seconds = 0;
        assert!(matches!(config.validate(), Err(SyncError::InvalidConfig(_))));

        let mut config = AppConfig::default();
        config.sync.max_concurrent_transfers = 0;
        assert!(config.validate().is_err());

        let mut config = AppConfig::default();
        config.sync.transfer_timeout_seconds = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_env_fills_missing_credentials_only() {
        let mut config = AppConfig::default();
        config.remote.accessKey = Some("from-file".into());
        config.apply_env(|key| match key {
            "AWS_ACCESS_KEY_ID" => Some("from-env".into()),
            "AWS_SECRET_ACCESS_KEY" => Some("secret".into()),
            _ => None,
        });
        assert_eq!(config.remote.accessKey.as_deref(), Some("from-file"));
        assert_eq!(config.remote.secretKey.as_deref(), Some("secret"));
        assert!(config.remote.region.is_none());
    }

    #[test]
    fn test_extension_check() {
        let settings = SyncSettings {
            allowed_extensions: Some(vec!["PDF".into(), ".jpg".into()]),
            ..Default::default()
        };
        assert!(settings.is_extension_allowed("docs/a.pdf"));
        assert!(settings.is_extension_allowed("C:\\img\\b.JPG"));
        assert!(!settings.is_extension_allowed("notes.txt"));
        assert!(!settings.is_extension_allowed("Makefile"));
        assert!(SyncSettings::default().is_extension_allowed("anything.bin"));
    }

    #[test]
    fn test_save_and_load_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(CONFIG_FILE);
        let mut config = AppConfig::default();
        config.local_root = Some(dir.path().join("mirror"));
        config.sync.keep_versions = true;
        config.save(&path).unwrap();

        let loaded = AppConfig::load(&path).unwrap();
        assert_eq!(loaded.local_root, config.local_root);
        assert!(loaded.sync.keep_versions);
    }

    #[test]
    fn test_redacted_hides_secrets() {
        let remote = StorageConfig {
            secretKey: Some("s3cr3t".into()),
            accessKey: Some("AKIA".into()),
            ..Default::default()
        };
        let shown = remote.redacted();
        assert_eq!(shown.secretKey.as_deref(), Some("******"));
        assert_eq!(shown.accessKey.as_deref(), Some("AKIA"));
    }
}
