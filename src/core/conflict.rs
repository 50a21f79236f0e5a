use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// 冲突处理策略（两边都有变化时）
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    /// 最后写入者胜出，时间相同时以远程为准
    #[default]
    MirrorRemote,
    /// 最后写入者胜出，时间相同时以本地为准
    MirrorLocal,
    /// 不自动处理，只记录冲突
    Manual,
}

impl fmt::Display for ConflictPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictPolicy::MirrorRemote => write!(f, "mirror-remote"),
            ConflictPolicy::MirrorLocal => write!(f, "mirror-local"),
            ConflictPolicy::Manual => write!(f, "manual"),
        }
    }
}

impl FromStr for ConflictPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "mirror-remote" => Ok(ConflictPolicy::MirrorRemote),
            "mirror-local" => Ok(ConflictPolicy::MirrorLocal),
            "manual" => Ok(ConflictPolicy::Manual),
            _ => Err(format!("无效的冲突策略: {}", s)),
        }
    }
}

/// 冲突解决结果
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictResolution {
    KeepLocal,
    KeepRemote,
    Unresolved,
}

/// 冲突类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// 上次同步后两边都修改了
    BothModified,
    /// 两边都有文件但没有同步记录，且内容无法确认相同
    UntrackedBoth,
}

/// 冲突记录（写入运行报告，即使已自动解决）
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConflictRecord {
    pub path: String,
    pub conflict_type: ConflictType,
    pub resolution: ConflictResolution,
    /// 本地修改时间（Unix 毫秒）
    pub local_time: i64,
    /// 远程修改时间（Unix 毫秒）
    pub remote_time: Option<i64>,
}

impl ConflictPolicy {
    /// 按策略决定冲突胜出方，相同输入总是得到相同结果
    pub fn resolve(&self, local_time: i64, remote_time: Option<i64>) -> ConflictResolution {
        let prefer_on_tie = match self {
            ConflictPolicy::Manual => return ConflictResolution::Unresolved,
            ConflictPolicy::MirrorRemote => ConflictResolution::KeepRemote,
            ConflictPolicy::MirrorLocal => ConflictResolution::KeepLocal,
        };

        match remote_time {
            Some(remote) if local_time > remote => ConflictResolution::KeepLocal,
            Some(remote) if remote > local_time => ConflictResolution::KeepRemote,
            // 时间相同，或远程没有提供修改时间
            _ => prefer_on_tie,
        }
    }
}

/// 生成历史版本文件名
pub fn version_name(path: &str, timestamp: i64) -> String {
    use chrono::DateTime;

    let dt = DateTime::from_timestamp(timestamp, 0)
        .map(|d| d.format("%Y%m%d_%H%M%S").to_string())
        .unwrap_or_else(|| "unknown".to_string());

    let (dir, file) = match path.rfind('/') {
        Some(pos) => (&path[..=pos], &path[pos + 1..]),
        None => ("", path),
    };

    match file.rfind('.') {
        Some(ext_pos) if ext_pos > 0 => {
            let (name, ext) = file.split_at(ext_pos);
            format!("{}{}_{}{}", dir, name, dt, ext)
        }
        _ => format!("{}{}_{}", dir, file, dt),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_last_writer_wins() {
        let policy = ConflictPolicy::MirrorRemote;
        assert_eq!(policy.resolve(2000, Some(1000)), ConflictResolution::KeepLocal);
        assert_eq!(policy.resolve(1000, Some(2000)), ConflictResolution::KeepRemote);
    }

    #[test]
    fn test_tie_breaks() {
        assert_eq!(
            ConflictPolicy::MirrorRemote.resolve(1000, Some(1000)),
            ConflictResolution::KeepRemote
        );
        assert_eq!(
            ConflictPolicy::MirrorLocal.resolve(1000, Some(1000)),
            ConflictResolution::KeepLocal
        );
        assert_eq!(
            ConflictPolicy::MirrorRemote.resolve(1000, None),
            ConflictResolution::KeepRemote
        );
    }

    #[test]
    fn test_manual_never_resolves() {
        assert_eq!(
            ConflictPolicy::Manual.resolve(5000, Some(1)),
            ConflictResolution::Unresolved
        );
    }

    #[test]
    fn test_policy_parse() {
        assert_eq!("manual".parse::<ConflictPolicy>(), Ok(ConflictPolicy::Manual));
        assert!("newest".parse::<ConflictPolicy>().is_err());
        assert_eq!(ConflictPolicy::MirrorLocal.to_string(), "mirror-local");
    }

    #[test]
    fn test_version_name() {
        assert_eq!(version_name("docs/a.pdf", 0), "docs/a_19700101_000000.pdf");
        assert_eq!(version_name("README", 0), "README_19700101_000000");
        assert_eq!(version_name(".env", 0), ".env_19700101_000000");
    }
}
