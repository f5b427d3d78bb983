//! Push 通道 - 对可插拔 push 传输的薄封装
//!
//! 按用户订阅 `App.Models.User.{user_id}` 之类的私有频道，收到事件后解码为
//! `Notification` 写入 store，并为新通知触发 toast。
//!
//! 任何连接失败（未配置传输、连接被拒、库错误）都被吞掉，只记录日志，
//! 此时由轮询负责保持界面最新。

use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};

use super::error::Result;
use super::model::Notification;
use super::store::NotificationStore;
use super::toast::{ToastRequest, ToastScheduler};

/// 事件处理回调，参数为事件载荷
pub type EventHandler = Arc<dyn Fn(Value) + Send + Sync>;

/// Push 传输能力：connect / listen / leave
#[async_trait]
pub trait PushTransport: Send + Sync {
    /// 订阅频道上的事件（必要时建立连接）
    async fn listen(&self, channel: &str, event: &str, handler: EventHandler) -> Result<()>;

    /// 退订频道；从未订阅过也不能报错
    async fn leave(&self, channel: &str);

    /// 频道订阅是否仍然有效（连接被服务端关闭后返回 false）
    fn is_listening(&self, _channel: &str) -> bool {
        true
    }
}

pub const DEFAULT_CHANNEL_TEMPLATE: &str = "App.Models.User.{user_id}";
pub const DEFAULT_EVENT: &str = "notification.created";

/// 根据模板生成用户频道名
pub fn channel_name(template: &str, user_id: u64) -> String {
    template.replace("{user_id}", &user_id.to_string())
}

/// 把 push 载荷解码为通知
///
/// 支持三种形态：通知本体、`{"notification": {...}}` 包装、JSON 字符串
pub fn decode_payload(payload: Value) -> Result<Notification> {
    let value = match payload {
        Value::String(raw) => serde_json::from_str(&raw)?,
        other => other,
    };
    let value = match value {
        Value::Object(mut map) if !map.contains_key("id") => match map.remove("notification") {
            Some(inner) => inner,
            None => Value::Object(map),
        },
        other => other,
    };
    Ok(serde_json::from_value(value)?)
}

struct Subscription {
    user_id: u64,
    channel: String,
    active: Arc<AtomicBool>,
}

/// Push 通道
pub struct PushChannel {
    transport: Option<Arc<dyn PushTransport>>,
    store: NotificationStore,
    toasts: Option<ToastScheduler>,
    channel_template: String,
    event: String,
    current: Mutex<Option<Subscription>>,
}

impl PushChannel {
    /// `transport` 为 `None` 表示环境中没有 push 能力
    pub fn new(transport: Option<Arc<dyn PushTransport>>, store: NotificationStore) -> Self {
        Self {
            transport,
            store,
            toasts: None,
            channel_template: DEFAULT_CHANNEL_TEMPLATE.to_string(),
            event: DEFAULT_EVENT.to_string(),
            current: Mutex::new(None),
        }
    }

    /// 新通知同时交给 toast 调度器
    pub fn with_toasts(mut self, toasts: ToastScheduler) -> Self {
        self.toasts = Some(toasts);
        self
    }

    pub fn with_channel(mut self, template: impl Into<String>, event: impl Into<String>) -> Self {
        self.channel_template = template.into();
        self.event = event.into();
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Option<Subscription>> {
        self.current.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn is_live(&self, sub: &Subscription) -> bool {
        sub.active.load(Ordering::SeqCst)
            && self
                .transport
                .as_ref()
                .map(|t| t.is_listening(&sub.channel))
                .unwrap_or(false)
    }

    /// 当前是否已订阅
    pub fn is_connected(&self) -> bool {
        self.lock().as_ref().map(|s| self.is_live(s)).unwrap_or(false)
    }

    /// 当前订阅的用户
    pub fn connected_user(&self) -> Option<u64> {
        self.lock().as_ref().map(|s| s.user_id)
    }

    /// 订阅用户频道（幂等）
    ///
    /// 返回是否处于已连接状态；失败不会向调用方报错
    pub async fn connect(&self, user_id: u64) -> bool {
        let Some(transport) = self.transport.clone() else {
            debug!(user_id, "Push transport not configured, relying on polling");
            return false;
        };

        let channel = channel_name(&self.channel_template, user_id);
        let active = Arc::new(AtomicBool::new(true));

        let previous = {
            let mut current = self.lock();
            if let Some(sub) = current.as_ref() {
                if sub.user_id == user_id && self.is_live(sub) {
                    debug!(user_id, channel = %sub.channel, "Push channel already connected");
                    return true;
                }
            }
            current.replace(Subscription {
                user_id,
                channel: channel.clone(),
                active: active.clone(),
            })
        };

        // 切换用户或旧连接已失效时先退订旧频道
        if let Some(old) = previous {
            old.active.store(false, Ordering::SeqCst);
            transport.leave(&old.channel).await;
        }

        let handler = self.handler(active.clone());
        match transport.listen(&channel, &self.event, handler).await {
            Ok(()) if active.load(Ordering::SeqCst) => {
                info!(user_id, channel = %channel, "Push channel connected");
                true
            }
            Ok(()) => {
                // 订阅完成前已被断开，撤销这次订阅（频道已被新的连接占用时除外）
                let reclaimed = self
                    .lock()
                    .as_ref()
                    .map(|s| s.channel == channel)
                    .unwrap_or(false);
                if !reclaimed {
                    transport.leave(&channel).await;
                }
                debug!(user_id, channel = %channel, "Push channel disconnected while subscribing");
                false
            }
            Err(e) => {
                warn!(user_id, error = %e, "Push channel unavailable, falling back to polling");
                active.store(false, Ordering::SeqCst);
                let mut current = self.lock();
                if current
                    .as_ref()
                    .map(|s| Arc::ptr_eq(&s.active, &active))
                    .unwrap_or(false)
                {
                    *current = None;
                }
                false
            }
        }
    }

    /// 退订用户频道（幂等，从未连接过也不报错）
    pub async fn disconnect(&self, user_id: u64) {
        let sub = {
            let mut current = self.lock();
            match current.as_ref() {
                Some(sub) if sub.user_id == user_id => current.take(),
                _ => None,
            }
        };
        self.release(sub).await;
    }

    /// 退订当前任意用户的频道
    pub async fn disconnect_current(&self) {
        let sub = self.lock().take();
        self.release(sub).await;
    }

    async fn release(&self, sub: Option<Subscription>) {
        let Some(sub) = sub else {
            return;
        };
        // 先同步关闭 handler，之后到达的事件一律丢弃
        sub.active.store(false, Ordering::SeqCst);
        if let Some(transport) = &self.transport {
            transport.leave(&sub.channel).await;
        }
        info!(user_id = sub.user_id, channel = %sub.channel, "Push channel disconnected");
    }

    fn handler(&self, active: Arc<AtomicBool>) -> EventHandler {
        let store = self.store.clone();
        let toasts = self.toasts.clone();
        Arc::new(move |payload: Value| {
            if !active.load(Ordering::SeqCst) {
                debug!("Push event after disconnect dropped");
                return;
            }
            let notification = match decode_payload(payload) {
                Ok(n) => n,
                Err(e) => {
                    warn!(error = %e, "Undecodable push payload dropped");
                    return;
                }
            };
            let request = ToastRequest::from(&notification);
            if store.ingest(notification) {
                if let Some(toasts) = &toasts {
                    toasts.show(request);
                }
            }
        })
    }
}
