use crate::error::Result;
use crate::storage::local::STATE_DIR;
use crate::storage::{LocalEntry, LocalStorage, RemoteObject, RemoteStore};
use futures::TryStreamExt;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::{debug, info};

/// 文件扫描器配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScanConfig {
    /// 排除规则（glob patterns）
    pub exclude_patterns: Vec<String>,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            exclude_patterns: default_exclude_patterns(),
        }
    }
}

/// 默认排除规则
pub fn default_exclude_patterns() -> Vec<String> {
    vec![
        format!("{}/**", STATE_DIR),
        ".git/**".to_string(),
        ".svn/**".to_string(),
        "node_modules/**".to_string(),
        ".DS_Store".to_string(),
        "Thumbs.db".to_string(),
        "*.tmp".to_string(),
        "*.temp".to_string(),
        "~*".to_string(),
    ]
}

/// 预编译的排除规则
#[derive(Debug)]
enum Pattern {
    /// `prefix/**/suffix`
    Tree { prefix: String, suffix: String },
    /// 含 `*` 或 `?`，不含 `/` 时匹配文件名，否则匹配完整路径
    Glob { regex: Regex, name_only: bool },
    Exact(String),
}

impl Pattern {
    fn compile(pattern: &str) -> Option<Self> {
        let pattern = pattern.to_lowercase();

        if let Some((prefix, suffix)) = pattern.split_once("**") {
            return Some(Pattern::Tree {
                prefix: prefix.trim_end_matches('/').to_string(),
                suffix: suffix.trim_start_matches('/').to_string(),
            });
        }

        if pattern.contains('*') || pattern.contains('?') {
            let regex_pattern = regex::escape(&pattern)
                .replace(r"\*", ".*")
                .replace(r"\?", ".");
            return Regex::new(&format!("^{}$", regex_pattern))
                .ok()
                .map(|regex| Pattern::Glob {
                    regex,
                    name_only: !pattern.contains('/'),
                });
        }

        Some(Pattern::Exact(pattern))
    }

    fn matches(&self, path: &str) -> bool {
        match self {
            Pattern::Tree { prefix, suffix } => {
                if prefix.is_empty() && suffix.is_empty() {
                    return true;
                }
                if !prefix.is_empty() && path != prefix && !path.starts_with(&format!("{}/", prefix))
                {
                    return false;
                }
                suffix.is_empty() || path.ends_with(suffix.as_str())
            }
            Pattern::Glob { regex, name_only } => {
                let target = if *name_only {
                    path.rsplit('/').next().unwrap_or(path)
                } else {
                    path
                };
                regex.is_match(target)
            }
            Pattern::Exact(exact) => path == exact || path.ends_with(&format!("/{}", exact)),
        }
    }
}

/// 列表中的条目（本地文件或远程对象）
pub trait ScanEntry {
    fn path(&self) -> &str;
}

impl ScanEntry for LocalEntry {
    fn path(&self) -> &str {
        &self.path
    }
}

impl ScanEntry for RemoteObject {
    fn path(&self) -> &str {
        &self.path
    }
}

/// 文件扫描器，按排除规则过滤两侧的列表
pub struct FileScanner {
    patterns: Vec<Pattern>,
}

impl FileScanner {
    pub fn new(config: ScanConfig) -> Self {
        let patterns = config
            .exclude_patterns
            .iter()
            .filter_map(|p| Pattern::compile(p))
            .collect();
        Self { patterns }
    }

    /// 检查路径是否应该被排除
    pub fn should_exclude(&self, path: &str) -> bool {
        let path = path.to_lowercase();
        self.patterns.iter().any(|p| p.matches(&path))
    }

    fn accept<T: ScanEntry>(&self, entry: &T) -> bool {
        if self.should_exclude(entry.path()) {
            debug!("排除文件: {}", entry.path());
            return false;
        }
        true
    }

    /// 过滤列表，返回按路径索引的结果
    pub fn filter<T: ScanEntry>(&self, entries: Vec<T>) -> BTreeMap<String, T> {
        let total = entries.len();
        let tree: BTreeMap<String, T> = entries
            .into_iter()
            .filter(|e| self.accept(e))
            .map(|e| (e.path().to_string(), e))
            .collect();

        debug!("过滤完成: {} 个保留, {} 个被排除", tree.len(), total - tree.len());
        tree
    }

    /// 扫描本地镜像
    pub async fn scan_local(&self, local: &LocalStorage) -> Result<BTreeMap<String, LocalEntry>> {
        info!("开始扫描本地: {}", local.name());
        let tree = self.filter(local.list().await?);
        info!("本地扫描完成: {} 个文件", tree.len());
        Ok(tree)
    }

    /// 扫描远程存储，边拉取边过滤
    pub async fn scan_remote(
        &self,
        remote: &dyn RemoteStore,
        prefix: &str,
    ) -> Result<BTreeMap<String, RemoteObject>> {
        info!("开始扫描远程: {}, prefix: {:?}", remote.name(), prefix);

        let mut tree = BTreeMap::new();
        let mut excluded = 0usize;
        let mut listing = remote.list(prefix);
        while let Some(object) = listing.try_next().await? {
            if self.accept(&object) {
                tree.insert(object.path.clone(), object);
            } else {
                excluded += 1;
            }
        }

        info!("远程扫描完成: {} 个文件, {} 个被排除", tree.len(), excluded);
        Ok(tree)
    }
}

impl Default for FileScanner {
    fn default() -> Self {
        Self::new(ScanConfig::default())
    }
}
