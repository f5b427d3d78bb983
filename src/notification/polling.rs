//! 轮询循环 - 定期刷新未读数，作为 push 的兜底
//!
//! 第一次 tick 在 `start()` 时立即触发，之后按固定间隔执行。
//! 单次请求失败只记录日志，不影响后续 tick。

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

use super::store::NotificationStore;

/// 默认轮询间隔
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(30_000);

/// 最小轮询间隔，更小的配置值会被提升到此值
pub const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

/// 轮询循环
pub struct PollingLoop {
    store: NotificationStore,
    period: Duration,
    task: Mutex<Option<JoinHandle<()>>>,
    ticks: Arc<AtomicU64>,
}

impl PollingLoop {
    pub fn new(store: NotificationStore) -> Self {
        Self::with_interval(store, DEFAULT_POLL_INTERVAL)
    }

    pub fn with_interval(store: NotificationStore, period: Duration) -> Self {
        let period = if period < MIN_POLL_INTERVAL {
            warn!(
                requested_ms = period.as_millis() as u64,
                min_ms = MIN_POLL_INTERVAL.as_millis() as u64,
                "Poll interval below minimum, clamping"
            );
            MIN_POLL_INTERVAL
        } else {
            period
        };
        Self {
            store,
            period,
            task: Mutex::new(None),
            ticks: Arc::new(AtomicU64::new(0)),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<JoinHandle<()>>> {
        self.task.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn is_running(&self) -> bool {
        self.lock().as_ref().map(|h| !h.is_finished()).unwrap_or(false)
    }

    /// 已执行的 tick 总数
    pub fn tick_count(&self) -> u64 {
        self.ticks.load(Ordering::SeqCst)
    }

    /// 启动轮询（幂等：已在运行时不会创建第二个定时器）
    ///
    /// 返回是否真正启动了新循环
    pub fn start(&self) -> bool {
        let mut task = self.lock();
        if task.as_ref().map(|h| !h.is_finished()).unwrap_or(false) {
            debug!("Polling loop already running");
            return false;
        }

        let store = self.store.clone();
        let ticks = self.ticks.clone();
        let period = self.period;
        *task = Some(tokio::spawn(async move {
            let mut ticker = interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                // 第一次 tick 立即完成
                ticker.tick().await;
                ticks.fetch_add(1, Ordering::SeqCst);
                store.refresh_unread_count().await;
            }
        }));
        info!(interval_ms = period.as_millis() as u64, "Polling loop started");
        true
    }

    /// 停止轮询，取消挂起的 tick
    pub fn stop(&self) {
        if let Some(handle) = self.lock().take() {
            handle.abort();
            info!("Polling loop stopped");
        }
    }
}

impl Drop for PollingLoop {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::testing::MockApi;
    use tokio::time::sleep;

    fn setup() -> (PollingLoop, NotificationStore, Arc<MockApi>) {
        let api = Arc::new(MockApi::new());
        let store = NotificationStore::new(api.clone());
        let polling = PollingLoop::new(store.clone());
        (polling, store, api)
    }

    #[tokio::test(start_paused = true)]
    async fn test_first_tick_fires_immediately() {
        let (polling, store, api) = setup();
        api.set_unread(4);

        polling.start();
        sleep(Duration::from_millis(1)).await;

        assert_eq!(polling.tick_count(), 1);
        assert_eq!(store.unread_count(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_double_start_keeps_single_interval() {
        let (polling, _, api) = setup();

        assert!(polling.start());
        assert!(!polling.start());

        // t = 0, 30, 60, 90
        sleep(Duration::from_millis(95_000)).await;
        assert_eq!(polling.tick_count(), 4);
        assert_eq!(api.unread_calls(), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_then_start_fires_immediately_again() {
        let (polling, _, _) = setup();

        polling.start();
        sleep(Duration::from_millis(31_000)).await;
        assert_eq!(polling.tick_count(), 2);

        polling.stop();
        assert!(!polling.is_running());
        sleep(Duration::from_millis(120_000)).await;
        assert_eq!(polling.tick_count(), 2);

        polling.start();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(polling.tick_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_failed_tick_does_not_stop_loop() {
        let (polling, store, api) = setup();
        api.set_unread(2);
        polling.start();
        sleep(Duration::from_millis(1)).await;
        assert_eq!(store.unread_count(), 2);

        api.fail_reads(true);
        sleep(Duration::from_millis(30_000)).await;
        assert_eq!(store.unread_count(), 2);

        api.fail_reads(false);
        api.set_unread(6);
        sleep(Duration::from_millis(30_000)).await;
        assert_eq!(store.unread_count(), 6);
        assert_eq!(polling.tick_count(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_is_clamped() {
        let api = Arc::new(MockApi::new());
        let polling = PollingLoop::with_interval(NotificationStore::new(api.clone()), Duration::ZERO);
        assert_eq!(polling.period(), MIN_POLL_INTERVAL);

        polling.start();
        sleep(Duration::from_millis(1)).await;
        assert!(polling.is_running());
        assert_eq!(polling.tick_count(), 1);

        sleep(Duration::from_millis(2_000)).await;
        assert_eq!(polling.tick_count(), 3);
        assert_eq!(api.unread_calls(), 3);
    }

    #[tokio::test]
    async fn test_stop_without_start_is_noop() {
        let (polling, _, _) = setup();
        polling.stop();
        assert!(!polling.is_running());
    }
}
