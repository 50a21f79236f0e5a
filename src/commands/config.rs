//! 配置相关命令

use crate::config::AppConfig;
use crate::AppState;
use anyhow::{bail, Context};
use std::path::Path;

/// 打印当前生效的配置（隐藏密钥）
pub fn show(state: &AppState) -> anyhow::Result<()> {
    let mut config = state.config.clone();
    config.remote = config.remote.redacted();

    println!("# {}", state.config_path.display());
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// 写入默认配置文件，已存在时拒绝覆盖
pub fn init(config_path: &Path, local_root: Option<&Path>) -> anyhow::Result<()> {
    if config_path.exists() {
        bail!("配置文件已存在: {}", config_path.display());
    }

    let config = AppConfig {
        local_root: local_root.map(Path::to_path_buf),
        ..Default::default()
    };
    config
        .save(config_path)
        .with_context(|| format!("写入配置失败: {}", config_path.display()))?;

    println!("已创建配置文件: {}", config_path.display());
    Ok(())
}
