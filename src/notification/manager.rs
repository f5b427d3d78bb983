//! 传输管理器 - 按用户偏好和会话状态编排 push 与轮询
//!
//! 生命周期：
//! - `activate(user_id)`：获取偏好（失败则 fail-open），push 开启时连接
//!   push 通道，总是启动轮询
//! - `deactivate(user_id)`：断开 push、停止轮询、取消 toast 定时器，
//!   最后清空 store（会话边界）
//! - `update_preferences(prefs)`：实时重配；关闭 push 时同步断开
//!
//! 同时作为界面层的门面，暴露 store 的只读视图和乐观修改方法。

use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, watch};
use tracing::{debug, info, warn};

use super::api::NotificationApi;
use super::model::{Notification, NotificationPage, Preferences};
use super::polling::{PollingLoop, DEFAULT_POLL_INTERVAL};
use super::push::{PushChannel, PushTransport, DEFAULT_CHANNEL_TEMPLATE, DEFAULT_EVENT};
use super::reconcile::{plan_push, resolve_preferences, PushAction};
use super::store::{NotificationStore, StoreSnapshot};
use super::toast::{ToastEvent, ToastScheduler, ToastTimings};

/// 管理器参数
#[derive(Debug, Clone)]
pub struct ManagerSettings {
    pub poll_interval: Duration,
    pub toast: ToastTimings,
    /// 频道名模板，`{user_id}` 会被替换
    pub channel_template: String,
    pub event: String,
}

impl Default for ManagerSettings {
    fn default() -> Self {
        Self {
            poll_interval: DEFAULT_POLL_INTERVAL,
            toast: ToastTimings::default(),
            channel_template: DEFAULT_CHANNEL_TEMPLATE.to_string(),
            event: DEFAULT_EVENT.to_string(),
        }
    }
}

#[derive(Default)]
struct Session {
    /// 每次激活/注销递增，用于识别过期的激活流程
    generation: u64,
    user_id: Option<u64>,
    preferences: Option<Preferences>,
}

/// 传输管理器
pub struct TransportManager {
    store: NotificationStore,
    push: PushChannel,
    polling: PollingLoop,
    toasts: ToastScheduler,
    session: Mutex<Session>,
}

impl TransportManager {
    pub fn new(api: Arc<dyn NotificationApi>, transport: Option<Arc<dyn PushTransport>>) -> Self {
        Self::with_settings(api, transport, ManagerSettings::default())
    }

    pub fn with_settings(
        api: Arc<dyn NotificationApi>,
        transport: Option<Arc<dyn PushTransport>>,
        settings: ManagerSettings,
    ) -> Self {
        let store = NotificationStore::new(api);
        let toasts = ToastScheduler::with_timings(settings.toast);
        let push = PushChannel::new(transport, store.clone())
            .with_toasts(toasts.clone())
            .with_channel(settings.channel_template, settings.event);
        let polling = PollingLoop::with_interval(store.clone(), settings.poll_interval);

        Self {
            store,
            push,
            polling,
            toasts,
            session: Mutex::new(Session::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Session> {
        self.session.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ---------------------------------------------------------------------
    // 会话生命周期
    // ---------------------------------------------------------------------

    /// 登录后激活
    pub async fn activate(&self, user_id: u64) {
        let previous = self.lock().user_id;
        if let Some(prev) = previous {
            if prev != user_id {
                // 上一个用户的订阅和定时器必须在新用户激活前拆除
                self.deactivate(prev).await;
            }
        }

        let generation = {
            let mut session = self.lock();
            session.generation += 1;
            session.user_id = Some(user_id);
            session.preferences = None;
            session.generation
        };

        // 轮询不依赖偏好和 push，先行启动
        self.polling.start();

        let fetched = self.store.api().fetch_preferences().await;
        let fetched = resolve_preferences(fetched);

        let prefs = {
            let mut session = self.lock();
            if session.generation != generation {
                info!(user_id, "Activation superseded before preferences arrived");
                return;
            }
            // 获取期间用户已修改偏好时，以用户的选择为准
            *session.preferences.get_or_insert(fetched)
        };

        if plan_push(None, &prefs) == PushAction::Connect {
            self.push.connect(user_id).await;

            let (current, same_user, push_enabled) = {
                let session = self.lock();
                (
                    session.generation == generation,
                    session.user_id == Some(user_id),
                    session.preferences.map(|p| p.push).unwrap_or(false),
                )
            };
            if !same_user || (current && !push_enabled) {
                // 连接期间会话已结束，或 push 已被关闭
                self.push.disconnect(user_id).await;
            }
            if !current {
                return;
            }
        }

        info!(user_id, push = prefs.push, "Notification transports activated");
    }

    /// 注销时拆除会话
    ///
    /// 另一个用户处于激活状态时不做任何事
    pub async fn deactivate(&self, user_id: u64) {
        {
            let mut session = self.lock();
            if let Some(active) = session.user_id {
                if active != user_id {
                    warn!(user_id, active, "Ignoring deactivate for a user that is not active");
                    return;
                }
            }
            session.generation += 1;
            session.user_id = None;
            session.preferences = None;
        }

        self.polling.stop();
        self.push.disconnect_current().await;
        self.toasts.shutdown();
        self.store.clear();
        info!(user_id, "Notification transports deactivated");
    }

    /// 实时应用新的偏好
    pub async fn update_preferences(&self, prefs: Preferences) {
        let (user_id, previous) = {
            let mut session = self.lock();
            let Some(user_id) = session.user_id else {
                debug!("Preferences updated without an active session");
                return;
            };
            (user_id, session.preferences.replace(prefs))
        };

        match plan_push(previous.as_ref(), &prefs) {
            PushAction::Connect => {
                info!(user_id, "Push enabled by preference");
                self.push.connect(user_id).await;
            }
            PushAction::Disconnect => {
                info!(user_id, "Push disabled by preference");
                self.push.disconnect(user_id).await;
            }
            PushAction::Keep => {}
        }
    }

    pub fn active_user(&self) -> Option<u64> {
        self.lock().user_id
    }

    pub fn preferences(&self) -> Option<Preferences> {
        self.lock().preferences
    }

    // ---------------------------------------------------------------------
    // 界面层门面
    // ---------------------------------------------------------------------

    pub fn store(&self) -> &NotificationStore {
        &self.store
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.store.notifications()
    }

    pub fn unread_count(&self) -> u64 {
        self.store.unread_count()
    }

    pub fn is_loading(&self) -> bool {
        self.store.is_loading()
    }

    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.store.subscribe()
    }

    pub fn toasts(&self) -> &ToastScheduler {
        &self.toasts
    }

    pub fn toast_events(&self) -> broadcast::Receiver<ToastEvent> {
        self.toasts.subscribe()
    }

    pub async fn mark_as_read(&self, id: u64) {
        self.store.mark_read(id).await;
    }

    pub async fn mark_all_as_read(&self) {
        self.store.mark_all_read().await;
    }

    pub async fn delete(&self, id: u64) {
        self.store.delete(id).await;
    }

    pub async fn refresh(&self) {
        self.store.refresh().await;
    }

    pub async fn load_page(&self, page: u32) -> Option<NotificationPage> {
        self.store.load_page(page).await
    }

    pub fn start_polling(&self) -> bool {
        self.polling.start()
    }

    pub fn stop_polling(&self) {
        self.polling.stop();
    }

    pub fn is_polling(&self) -> bool {
        self.polling.is_running()
    }

    pub fn poll_ticks(&self) -> u64 {
        self.polling.tick_count()
    }

    pub async fn connect(&self, user_id: u64) -> bool {
        self.push.connect(user_id).await
    }

    pub async fn disconnect(&self, user_id: u64) {
        self.push.disconnect(user_id).await;
    }

    pub fn is_push_connected(&self) -> bool {
        self.push.is_connected()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notification::model::fixtures::notification;
    use crate::notification::testing::{MockApi, MockTransport};
    use tokio::time::sleep;

    fn setup() -> (TransportManager, Arc<MockApi>, Arc<MockTransport>) {
        let api = Arc::new(MockApi::new());
        let transport = Arc::new(MockTransport::new());
        let manager = TransportManager::new(api.clone(), Some(transport.clone()));
        (manager, api, transport)
    }

    fn payload(id: u64) -> serde_json::Value {
        serde_json::to_value(notification(id, false)).unwrap()
    }

    fn prefs(push: bool) -> Preferences {
        Preferences {
            push,
            ..Preferences::FAIL_OPEN
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_with_push_enabled() {
        let (manager, api, transport) = setup();
        api.set_preferences(prefs(true));

        manager.activate(7).await;

        assert!(manager.is_push_connected());
        assert!(manager.is_polling());
        assert!(transport.is_subscribed("App.Models.User.7"));
        assert_eq!(manager.preferences(), Some(prefs(true)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_activate_with_push_disabled_only_polls() {
        let (manager, api, transport) = setup();
        api.set_preferences(prefs(false));

        manager.activate(7).await;

        assert!(!manager.is_push_connected());
        assert!(manager.is_polling());
        assert!(transport.listen_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_preference_failure_fails_open() {
        let (manager, api, _) = setup();
        api.fail_preferences(true);

        manager.activate(7).await;

        assert_eq!(manager.preferences(), Some(Preferences::FAIL_OPEN));
        assert!(manager.is_push_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_unreachable_keeps_polling() {
        let (manager, _, transport) = setup();
        transport.refuse_connections(true);

        manager.activate(7).await;

        assert!(!manager.is_push_connected());
        assert!(manager.is_polling());
        assert!(transport.leave_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_event_triggers_toast() {
        let (manager, _, transport) = setup();
        let mut toasts = manager.toast_events();
        manager.activate(7).await;

        transport.emit("App.Models.User.7", payload(101));
        transport.emit("App.Models.User.7", payload(101));

        assert_eq!(manager.unread_count(), 1);
        assert_eq!(manager.notifications()[0].id, 101);
        match toasts.try_recv() {
            Ok(ToastEvent::Shown(t)) => assert_eq!(t.notification_id, 101),
            other => panic!("unexpected toast event: {:?}", other),
        }
        // 重复投递不再弹出
        assert!(toasts.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_disable_push_mid_session() {
        let (manager, api, transport) = setup();
        manager.activate(7).await;
        sleep(Duration::from_millis(1)).await;
        let ticks_before = manager.poll_ticks();

        manager.update_preferences(prefs(false)).await;

        assert_eq!(transport.leave_calls(), vec!["App.Models.User.7".to_string()]);
        assert!(!manager.is_push_connected());

        transport.emit_stale("App.Models.User.7", payload(200));
        assert_eq!(manager.unread_count(), 0);

        api.set_unread(3);
        sleep(DEFAULT_POLL_INTERVAL).await;
        assert!(manager.poll_ticks() > ticks_before);
        assert_eq!(manager.unread_count(), 3);

        // 再次关闭不会重复断开
        manager.update_preferences(prefs(false)).await;
        assert_eq!(transport.leave_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enable_push_mid_session() {
        let (manager, api, transport) = setup();
        api.set_preferences(prefs(false));
        manager.activate(7).await;

        manager.update_preferences(prefs(true)).await;

        assert!(manager.is_push_connected());
        assert_eq!(transport.listen_calls().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_update_preferences_without_session_is_noop() {
        let (manager, _, transport) = setup();
        manager.update_preferences(prefs(true)).await;
        assert!(transport.listen_calls().is_empty());
        assert_eq!(manager.preferences(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_tears_down_session() {
        let (manager, _, transport) = setup();
        manager.activate(7).await;
        transport.emit("App.Models.User.7", payload(1));
        assert_eq!(manager.unread_count(), 1);

        manager.deactivate(7).await;

        assert!(!manager.is_polling());
        assert!(!manager.is_push_connected());
        assert_eq!(manager.store().snapshot(), StoreSnapshot::default());
        assert_eq!(manager.active_user(), None);
        assert_eq!(transport.leave_calls(), vec!["App.Models.User.7".to_string()]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_repeated_login_cycles_keep_one_interval() {
        let (manager, api, _) = setup();

        for user in [1, 2, 3] {
            manager.activate(user).await;
            manager.deactivate(user).await;
        }
        manager.activate(4).await;
        manager.activate(4).await;

        // t=0 的立即 tick 先跑完
        sleep(Duration::from_millis(1)).await;
        let calls_before = api.unread_calls();
        sleep(DEFAULT_POLL_INTERVAL * 2).await;
        // 只有一个循环在跑：t=30s、t=60s 各一次
        assert_eq!(api.unread_calls() - calls_before, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_user_tears_down_previous() {
        let (manager, _, transport) = setup();
        manager.activate(1).await;
        transport.emit("App.Models.User.1", payload(10));

        manager.activate(2).await;

        assert_eq!(manager.active_user(), Some(2));
        assert!(manager.notifications().is_empty());
        assert!(transport.is_subscribed("App.Models.User.2"));
        assert!(!transport.is_subscribed("App.Models.User.1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_activation_is_abandoned() {
        let api = Arc::new(MockApi::new());
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(TransportManager::new(api.clone(), Some(transport.clone())));
        let gate = api.hold_preferences();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate(7).await })
        };
        while manager.active_user().is_none() {
            tokio::task::yield_now().await;
        }

        manager.deactivate(7).await;
        gate.notify_one();
        pending.await.unwrap();

        assert!(!manager.is_polling());
        assert!(!manager.is_push_connected());
        assert!(transport.listen_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_hung_push_subscribe_still_polls() {
        let api = Arc::new(MockApi::new());
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(TransportManager::new(api.clone(), Some(transport.clone())));
        api.set_unread(5);
        let gate = transport.hold_listen();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate(7).await })
        };
        sleep(Duration::from_millis(1)).await;

        // push 订阅卡住时轮询照常工作
        assert!(manager.is_polling());
        assert!(api.unread_calls() >= 1);
        assert_eq!(manager.unread_count(), 5);
        assert!(!manager.is_push_connected());

        gate.notify_one();
        pending.await.unwrap();
        assert!(manager.is_push_connected());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_disabled_while_preferences_load() {
        let api = Arc::new(MockApi::new());
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(TransportManager::new(api.clone(), Some(transport.clone())));
        let gate = api.hold_preferences();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate(7).await })
        };
        while manager.active_user().is_none() {
            tokio::task::yield_now().await;
        }

        manager.update_preferences(prefs(false)).await;
        gate.notify_one();
        pending.await.unwrap();

        // 服务端返回的 push=true 不能覆盖用户刚做的选择
        assert_eq!(manager.preferences(), Some(prefs(false)));
        assert!(!manager.is_push_connected());
        assert!(transport.listen_calls().is_empty());
        assert!(manager.is_polling());
    }

    #[tokio::test(start_paused = true)]
    async fn test_push_disabled_while_subscribing() {
        let api = Arc::new(MockApi::new());
        let transport = Arc::new(MockTransport::new());
        let manager = Arc::new(TransportManager::new(api.clone(), Some(transport.clone())));
        let gate = transport.hold_listen();

        let pending = {
            let manager = manager.clone();
            tokio::spawn(async move { manager.activate(7).await })
        };
        while transport.listen_calls().is_empty() {
            tokio::task::yield_now().await;
        }

        manager.update_preferences(prefs(false)).await;
        gate.notify_one();
        pending.await.unwrap();

        assert_eq!(manager.preferences(), Some(prefs(false)));
        assert!(!manager.is_push_connected());
        assert!(!transport.is_subscribed("App.Models.User.7"));
        assert!(!transport.emit("App.Models.User.7", payload(9)));
        assert_eq!(manager.unread_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_deactivate_other_user_is_ignored() {
        let (manager, _, transport) = setup();
        manager.activate(7).await;
        transport.emit("App.Models.User.7", payload(3));

        manager.deactivate(8).await;

        assert_eq!(manager.active_user(), Some(7));
        assert!(manager.is_polling());
        assert!(manager.is_push_connected());
        assert_eq!(manager.unread_count(), 1);
        assert!(transport.leave_calls().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_mark_as_read_survives_server_error() {
        let (manager, api, transport) = setup();
        manager.activate(7).await;
        transport.emit("App.Models.User.7", payload(55));
        api.fail_mutations(true);

        manager.mark_as_read(55).await;

        let snap = manager.store().snapshot();
        assert!(snap.find(55).unwrap().is_read);
        assert_eq!(snap.unread_count, 0);
    }
}
