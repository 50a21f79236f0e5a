mod common;

use bucketsync_lib::core::{MonitorError, MonitorState};
use bucketsync_lib::PollingMonitor;
use common::{default_options, Fixture};
use std::sync::Arc;
use std::time::Duration;

async fn monitor(fx: &Fixture) -> PollingMonitor {
    PollingMonitor::new(Arc::new(fx.engine(default_options()).await))
}

#[tokio::test]
async fn start_runs_cycles_until_stopped() {
    let fx = Fixture::new();
    fx.remote.insert("a.txt", b"hello");
    let monitor = monitor(&fx).await;
    let mut reports = monitor.subscribe();

    assert_eq!(monitor.state(), MonitorState::Idle);
    monitor.start(Duration::from_millis(20)).await.unwrap();
    assert_eq!(monitor.state(), MonitorState::Running);

    let first = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(first.completed.download, 1);
    let second = tokio::time::timeout(Duration::from_secs(5), reports.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(second.cycle, first.cycle + 1);
    assert_eq!(second.completed.changes(), 0);

    monitor.stop_and_wait().await;
    assert_eq!(monitor.state(), MonitorState::Idle);
    assert_eq!(fx.read("a.txt").unwrap(), b"hello");

    let recent = monitor.recent_reports().await;
    assert!(recent.len() >= 2);
    assert_eq!(recent[0].cycle, first.cycle);
}

#[tokio::test]
async fn start_while_running_is_rejected() {
    let fx = Fixture::new();
    let monitor = monitor(&fx).await;

    monitor.start(Duration::from_secs(60)).await.unwrap();
    let err = monitor.start(Duration::from_secs(60)).await.unwrap_err();
    assert!(matches!(err, MonitorError::NotIdle(MonitorState::Running)));

    monitor.stop_and_wait().await;
    assert_eq!(monitor.state(), MonitorState::Idle);

    // 停止后可以再次启动
    monitor.start(Duration::from_secs(60)).await.unwrap();
    monitor.stop_and_wait().await;
}

#[tokio::test]
async fn zero_interval_is_rejected() {
    let fx = Fixture::new();
    let monitor = monitor(&fx).await;

    let err = monitor.start(Duration::ZERO).await.unwrap_err();
    assert!(matches!(err, MonitorError::ZeroInterval));
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[tokio::test]
async fn stop_when_idle_does_nothing() {
    let fx = Fixture::new();
    let monitor = monitor(&fx).await;

    assert!(!monitor.stop().await);
    monitor.wait().await;
    assert_eq!(monitor.state(), MonitorState::Idle);
}

#[tokio::test]
async fn stop_waits_for_the_running_cycle() {
    let fx = Fixture::new();
    for i in 0..20 {
        fx.remote.insert(&format!("dir/file-{i}.txt"), format!("content {i}").as_bytes());
    }
    let monitor = monitor(&fx).await;
    let mut states = monitor.watch_state();

    monitor.start(Duration::from_secs(60)).await.unwrap();
    assert!(monitor.stop().await);
    let observed = *states.borrow_and_update();
    assert!(matches!(observed, MonitorState::Stopping | MonitorState::Idle));
    assert!(!monitor.stop().await);

    monitor.wait().await;
    assert_eq!(monitor.state(), MonitorState::Idle);

    // 停止请求前已开始的周期必须完整结束，否则一个都不执行
    let recent = monitor.recent_reports().await;
    assert!(recent.len() <= 1);
    if let Some(report) = recent.first() {
        assert_eq!(report.completed.download, 20);
    }
}
