//! 轮询监控 - 按固定间隔重复执行同步周期
//!
//! 状态机：Idle → Running → Stopping → Idle。停止请求只在周期之间生效，
//! 正在执行的周期总会完整结束。

use super::engine::SyncEngine;
use super::report::RunReport;
use serde::Serialize;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{broadcast, watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// 内存中保留的最近报告数
pub const RECENT_REPORTS: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum MonitorState {
    Idle,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("监控未处于空闲状态: {0:?}")]
    NotIdle(MonitorState),
    #[error("轮询间隔必须大于 0")]
    ZeroInterval,
}

struct LoopHandle {
    token: CancellationToken,
    task: JoinHandle<()>,
}

pub struct PollingMonitor {
    engine: Arc<SyncEngine>,
    state: Arc<watch::Sender<MonitorState>>,
    reports: broadcast::Sender<RunReport>,
    recent: Arc<Mutex<VecDeque<RunReport>>>,
    control: Mutex<Option<LoopHandle>>,
}

impl PollingMonitor {
    pub fn new(engine: Arc<SyncEngine>) -> Self {
        let (state, _) = watch::channel(MonitorState::Idle);
        let (reports, _) = broadcast::channel(RECENT_REPORTS);
        Self {
            engine,
            state: Arc::new(state),
            reports,
            recent: Arc::new(Mutex::new(VecDeque::with_capacity(RECENT_REPORTS))),
            control: Mutex::new(None),
        }
    }

    pub fn state(&self) -> MonitorState {
        *self.state.borrow()
    }

    /// 订阅状态变化
    pub fn watch_state(&self) -> watch::Receiver<MonitorState> {
        self.state.subscribe()
    }

    /// 订阅每个周期的报告
    pub fn subscribe(&self) -> broadcast::Receiver<RunReport> {
        self.reports.subscribe()
    }

    /// 最近的报告（按时间正序）
    pub async fn recent_reports(&self) -> Vec<RunReport> {
        self.recent.lock().await.iter().cloned().collect()
    }

    /// 启动轮询，间隔从上一个周期结束时开始计算
    pub async fn start(&self, interval: Duration) -> Result<(), MonitorError> {
        if interval.is_zero() {
            return Err(MonitorError::ZeroInterval);
        }

        let mut control = self.control.lock().await;

        let mut current = MonitorState::Idle;
        let started = self.state.send_if_modified(|state| {
            current = *state;
            if *state == MonitorState::Idle {
                *state = MonitorState::Running;
                true
            } else {
                false
            }
        });
        if !started {
            return Err(MonitorError::NotIdle(current));
        }

        let token = CancellationToken::new();
        let task = tokio::spawn(run_loop(
            self.engine.clone(),
            interval,
            token.clone(),
            self.state.clone(),
            self.reports.clone(),
            self.recent.clone(),
        ));

        *control = Some(LoopHandle { token, task });
        Ok(())
    }

    /// 请求停止，当前周期结束后生效；未运行时返回 false
    pub async fn stop(&self) -> bool {
        let control = self.control.lock().await;
        let requested = self.state.send_if_modified(|state| {
            if *state == MonitorState::Running {
                *state = MonitorState::Stopping;
                true
            } else {
                false
            }
        });

        if requested {
            info!("已请求停止监控");
            if let Some(handle) = control.as_ref() {
                handle.token.cancel();
            }
        }
        requested
    }

    /// 等待轮询任务退出
    pub async fn wait(&self) {
        let handle = self.control.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.task.await {
                error!("监控任务异常退出: {}", e);
            }
        }
    }

    pub async fn stop_and_wait(&self) {
        self.stop().await;
        self.wait().await;
    }
}

async fn run_loop(
    engine: Arc<SyncEngine>,
    interval: Duration,
    token: CancellationToken,
    state: Arc<watch::Sender<MonitorState>>,
    reports: broadcast::Sender<RunReport>,
    recent: Arc<Mutex<VecDeque<RunReport>>>,
) {
    let reset = state.clone();
    scopeguard::defer! {
        reset.send_replace(MonitorState::Idle);
    }

    info!("监控已启动, 间隔 {:?}", interval);

    while !token.is_cancelled() {
        // 周期本身不响应取消
        let report = engine.run_cycle().await;

        {
            let mut recent = recent.lock().await;
            if recent.len() == RECENT_REPORTS {
                recent.pop_front();
            }
            recent.push_back(report.clone());
        }
        // 没有订阅者时发送失败，忽略
        let _ = reports.send(report);

        tokio::select! {
            biased;
            _ = token.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
    }

    info!("监控已停止");
}
