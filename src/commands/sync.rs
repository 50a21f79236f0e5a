//! 同步相关命令：计划、单次同步、监控、历史

use crate::core::planner::ActionKind;
use crate::core::{PollingMonitor, RunHistory, RunReport};
use crate::AppState;
use anyhow::Context;
use std::time::Duration;
use tracing::{info, warn};

/// 分析差异（不执行同步）
pub async fn plan(state: &AppState) -> anyhow::Result<()> {
    let engine = state.engine().await?;
    let plan = engine.plan().await.context("生成同步计划失败")?;

    for action in plan.actions.iter().filter(|a| a.kind != ActionKind::Skip) {
        println!("{:<14} {:<20} {}", action.kind, action.reason, action.path);
    }
    for path in &plan.settled {
        println!("{:<14} {:<20} {}", "settle", "gone-both", path);
    }
    for path in &plan.ambiguous {
        println!("{:<14} {:<20} {}", "ambiguous", "case-collision", path);
    }
    for path in &plan.invalid {
        println!("{:<14} {:<20} {}", "rejected", "invalid-path", path);
    }
    for path in &plan.oversized {
        println!("{:<14} {:<20} {}", "excluded", "too-large", path);
    }

    println!(
        "上传 {}, 下载 {}, 删除本地 {}, 删除远程 {}, 登记 {}, 跳过 {}, 冲突 {}, 被过滤 {}, 超过大小限制 {}",
        plan.count(ActionKind::Upload),
        plan.count(ActionKind::Download),
        plan.count(ActionKind::DeleteLocal),
        plan.count(ActionKind::DeleteRemote),
        plan.count(ActionKind::Track),
        plan.count(ActionKind::Skip),
        plan.conflicts.len(),
        plan.filtered,
        plan.oversized.len()
    );
    Ok(())
}

/// 执行一个同步周期
pub async fn sync_once(state: &AppState) -> anyhow::Result<()> {
    let engine = state.engine().await?;
    let report = engine.run_cycle().await;
    print_report(&report);

    if report.is_degraded() {
        anyhow::bail!("同步周期降级，未执行任何动作");
    }
    Ok(())
}

/// 持续监控，直到收到 Ctrl-C
pub async fn monitor(state: &AppState, interval: Option<u64>) -> anyhow::Result<()> {
    let interval = Duration::from_secs(interval.unwrap_or(state.config.sync.poll_interval_seconds));
    let engine = state.engine().await?;
    let monitor = PollingMonitor::new(engine);

    let mut reports = monitor.subscribe();
    monitor.start(interval).await?;
    println!("监控已启动（间隔 {} 秒），按 Ctrl-C 停止", interval.as_secs());

    loop {
        tokio::select! {
            signal = tokio::signal::ctrl_c() => {
                if let Err(e) = signal {
                    warn!("监听 Ctrl-C 失败: {}", e);
                }
                break;
            }
            received = reports.recv() => match received {
                Ok(report) => print_report(&report),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!("跳过了 {} 个报告", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }

    println!("正在停止，等待当前周期结束...");
    monitor.stop_and_wait().await;
    info!("监控已退出");
    Ok(())
}

/// 显示最近的运行历史
pub async fn history(state: &AppState, limit: usize) -> anyhow::Result<()> {
    let local = state.local()?;
    let history = RunHistory::new(&local.state_dir());
    let reports = history.read_recent(limit).await?;

    if reports.is_empty() {
        println!("暂无运行记录");
    }
    for report in &reports {
        println!("{} {}", report.started_at.format("%Y-%m-%d %H:%M:%S"), report);
    }
    Ok(())
}

fn print_report(report: &RunReport) {
    println!("{}", report);
    for failure in &report.failures {
        println!(
            "  失败 [{:?}] {}: {}",
            failure.kind,
            failure.path.as_deref().unwrap_or("-"),
            failure.message
        );
    }
    for conflict in &report.conflicts {
        println!("  冲突 {} -> {:?}", conflict.path, conflict.resolution);
    }
}
