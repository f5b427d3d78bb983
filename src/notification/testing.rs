//! 测试辅助 - 内存版 `NotificationApi` 与 `PushTransport`
//!
//! 单元测试和 `tests/` 下的集成测试共用。

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

use super::api::NotificationApi;
use super::error::{NotifyError, Result};
use super::model::{Notification, NotificationPage, Preferences};
use super::push::{EventHandler, PushTransport};

#[derive(Default)]
struct MockApiState {
    list: Vec<Notification>,
    unread: u64,
    preferences: Option<Preferences>,
    fail_reads: bool,
    fail_mutations: bool,
    fail_preferences: bool,
    mark_read_calls: Vec<u64>,
    delete_calls: Vec<u64>,
    mark_all_read_calls: usize,
}

/// 内存版通知后端
pub struct MockApi {
    state: Mutex<MockApiState>,
    unread_calls: AtomicUsize,
    preference_gate: Mutex<Option<Arc<Notify>>>,
    list_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockApi {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MockApiState {
                preferences: Some(Preferences::FAIL_OPEN),
                ..Default::default()
            }),
            unread_calls: AtomicUsize::new(0),
            preference_gate: Mutex::new(None),
            list_gate: Mutex::new(None),
        }
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockApiState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    pub fn set_list(&self, list: Vec<Notification>) {
        self.with_state(|s| s.list = list);
    }

    pub fn set_unread(&self, count: u64) {
        self.with_state(|s| s.unread = count);
    }

    pub fn set_preferences(&self, prefs: Preferences) {
        self.with_state(|s| s.preferences = Some(prefs));
    }

    /// 让列表、未读数请求失败
    pub fn fail_reads(&self, fail: bool) {
        self.with_state(|s| s.fail_reads = fail);
    }

    /// 让已读、删除等确认请求返回 HTTP 500
    pub fn fail_mutations(&self, fail: bool) {
        self.with_state(|s| s.fail_mutations = fail);
    }

    pub fn fail_preferences(&self, fail: bool) {
        self.with_state(|s| s.fail_preferences = fail);
    }

    /// 阻塞偏好请求，直到返回的 `Notify` 被唤醒
    pub fn hold_preferences(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.preference_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    /// 阻塞下一次列表请求，直到返回的 `Notify` 被唤醒
    pub fn hold_list(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.list_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    pub fn unread_calls(&self) -> usize {
        self.unread_calls.load(Ordering::SeqCst)
    }

    pub fn mark_read_calls(&self) -> Vec<u64> {
        self.with_state(|s| s.mark_read_calls.clone())
    }

    pub fn delete_calls(&self) -> Vec<u64> {
        self.with_state(|s| s.delete_calls.clone())
    }

    pub fn mark_all_read_calls(&self) -> usize {
        self.with_state(|s| s.mark_all_read_calls)
    }

    fn server_error(endpoint: &str) -> NotifyError {
        NotifyError::HttpStatus {
            endpoint: endpoint.to_string(),
            status: 500,
        }
    }
}

impl Default for MockApi {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl NotificationApi for MockApi {
    async fn list(&self, page: u32) -> Result<NotificationPage> {
        let gate = self.list_gate.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.with_state(|s| {
            if s.fail_reads {
                return Err(Self::server_error("notifications"));
            }
            Ok(NotificationPage {
                data: s.list.clone(),
                current_page: page,
                last_page: page,
                per_page: s.list.len() as u32,
                total: s.list.len() as u64,
            })
        })
    }

    async fn unread_count(&self) -> Result<u64> {
        self.unread_calls.fetch_add(1, Ordering::SeqCst);
        self.with_state(|s| {
            if s.fail_reads {
                return Err(Self::server_error("notifications/unread-count"));
            }
            Ok(s.unread)
        })
    }

    async fn mark_read(&self, id: u64) -> Result<()> {
        self.with_state(|s| {
            s.mark_read_calls.push(id);
            if s.fail_mutations {
                return Err(Self::server_error("notifications/read"));
            }
            Ok(())
        })
    }

    async fn mark_all_read(&self) -> Result<()> {
        self.with_state(|s| {
            s.mark_all_read_calls += 1;
            if s.fail_mutations {
                return Err(Self::server_error("notifications/read-all"));
            }
            Ok(())
        })
    }

    async fn delete(&self, id: u64) -> Result<()> {
        self.with_state(|s| {
            s.delete_calls.push(id);
            if s.fail_mutations {
                return Err(Self::server_error("notifications"));
            }
            Ok(())
        })
    }

    async fn fetch_preferences(&self) -> Result<Preferences> {
        let gate = self
            .preference_gate
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.with_state(|s| {
            if s.fail_preferences {
                return Err(NotifyError::PreferenceFetchFailed("HTTP 500".to_string()));
            }
            s.preferences
                .ok_or_else(|| NotifyError::PreferenceFetchFailed("not configured".to_string()))
        })
    }

    async fn save_preferences(&self, prefs: &Preferences) -> Result<Preferences> {
        self.with_state(|s| {
            s.preferences = Some(*prefs);
            Ok(*prefs)
        })
    }
}

#[derive(Default)]
struct MockTransportState {
    handlers: HashMap<String, EventHandler>,
    /// 即使 leave 之后也保留，用于模拟迟到的事件
    stale: HashMap<String, EventHandler>,
    listen_calls: Vec<(String, String)>,
    leave_calls: Vec<String>,
    refuse: bool,
}

/// 内存版 push 传输
#[derive(Default)]
pub struct MockTransport {
    state: Mutex<MockTransportState>,
    listen_gate: Mutex<Option<Arc<Notify>>>,
}

impl MockTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_state<R>(&self, f: impl FnOnce(&mut MockTransportState) -> R) -> R {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut state)
    }

    /// 阻塞下一次 listen，直到返回的 `Notify` 被唤醒
    pub fn hold_listen(&self) -> Arc<Notify> {
        let gate = Arc::new(Notify::new());
        *self.listen_gate.lock().unwrap_or_else(|e| e.into_inner()) = Some(gate.clone());
        gate
    }

    /// 模拟服务端关闭连接：所有订阅失效
    pub fn drop_connection(&self) {
        self.with_state(|s| s.handlers.clear());
    }

    /// 模拟连接被拒绝
    pub fn refuse_connections(&self, refuse: bool) {
        self.with_state(|s| s.refuse = refuse);
    }

    /// 向已订阅的频道投递事件，返回是否有订阅者
    pub fn emit(&self, channel: &str, payload: serde_json::Value) -> bool {
        let handler = self.with_state(|s| s.handlers.get(channel).cloned());
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    /// 向曾经订阅过的 handler 投递事件（即使已经 leave）
    pub fn emit_stale(&self, channel: &str, payload: serde_json::Value) -> bool {
        let handler = self.with_state(|s| s.stale.get(channel).cloned());
        match handler {
            Some(handler) => {
                handler(payload);
                true
            }
            None => false,
        }
    }

    pub fn listen_calls(&self) -> Vec<(String, String)> {
        self.with_state(|s| s.listen_calls.clone())
    }

    pub fn leave_calls(&self) -> Vec<String> {
        self.with_state(|s| s.leave_calls.clone())
    }

    pub fn is_subscribed(&self, channel: &str) -> bool {
        self.with_state(|s| s.handlers.contains_key(channel))
    }
}

#[async_trait]
impl PushTransport for MockTransport {
    async fn listen(&self, channel: &str, event: &str, handler: EventHandler) -> Result<()> {
        self.with_state(|s| s.listen_calls.push((channel.to_string(), event.to_string())));
        let gate = self.listen_gate.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(gate) = gate {
            gate.notified().await;
        }
        self.with_state(|s| {
            if s.refuse {
                return Err(NotifyError::TransportUnavailable("connection refused".to_string()));
            }
            s.handlers.insert(channel.to_string(), handler.clone());
            s.stale.insert(channel.to_string(), handler);
            Ok(())
        })
    }

    async fn leave(&self, channel: &str) {
        self.with_state(|s| {
            s.leave_calls.push(channel.to_string());
            s.handlers.remove(channel);
        });
    }

    fn is_listening(&self, channel: &str) -> bool {
        self.is_subscribed(channel)
    }
}
