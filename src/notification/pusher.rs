//! Pusher 协议的 WebSocket push 传输
//!
//! 兼容 Laravel Echo / Reverb / Soketi 等实现的 Pusher channel 协议：
//! - 首次 `listen` 时才建立连接，并等待 `pusher:connection_established` 拿到 socket_id
//! - `private-` 频道通过授权端点签名后再订阅
//! - 回应服务端的 `pusher:ping`
//! - 最后一个频道 `leave` 后关闭连接

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::protocol::Message};
use tracing::{debug, info, trace, warn};

use super::error::{NotifyError, Result};
use super::push::{EventHandler, PushTransport};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Pusher 传输配置
#[derive(Debug, Clone)]
pub struct PusherConfig {
    /// WebSocket 地址（如 ws://localhost:8080）
    pub url: String,
    /// Pusher app key
    pub app_key: String,
    /// 私有频道授权端点（如 http://localhost:8000/api/broadcasting/auth）
    pub auth_endpoint: Option<String>,
    /// 授权请求使用的 bearer token
    pub token: Option<String>,
    /// 是否给频道名加 `private-` 前缀
    pub private_channels: bool,
    /// 授权请求超时（秒）
    pub timeout_secs: u64,
}

impl PusherConfig {
    pub fn socket_url(&self) -> String {
        format!(
            "{}/app/{}?protocol=7&client=realtime-notify&version={}&flash=false",
            self.url.trim_end_matches('/'),
            self.app_key,
            env!("CARGO_PKG_VERSION")
        )
    }

    pub fn wire_channel(&self, channel: &str) -> String {
        if self.private_channels && !channel.starts_with("private-") {
            format!("private-{}", channel)
        } else {
            channel.to_string()
        }
    }
}

/// Pusher 帧
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub event: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel: Option<String>,
    #[serde(default)]
    pub data: Value,
}

impl Frame {
    fn new(event: &str, data: Value) -> Self {
        Self {
            event: event.to_string(),
            channel: None,
            data,
        }
    }

    fn into_message(self) -> Result<Message> {
        Ok(Message::Text(serde_json::to_string(&self)?))
    }
}

/// 服务端下发的 data 通常是再次 JSON 编码的字符串
pub fn frame_data(data: Value) -> Value {
    match data {
        Value::String(raw) => serde_json::from_str(&raw).unwrap_or(Value::String(raw)),
        other => other,
    }
}

/// 判断收到的事件名是否匹配订阅的事件名
///
/// 以 `.` 开头表示原样匹配；否则也接受带命名空间的类名（如 `App\Events\NotificationCreated`）
pub fn event_matches(listened: &str, received: &str) -> bool {
    if let Some(raw) = listened.strip_prefix('.') {
        return raw == received;
    }
    received == listened || received.ends_with(&format!("\\{}", listened))
}

#[derive(Debug, Deserialize)]
struct AuthResponse {
    auth: String,
}

struct Subscription {
    event: String,
    handler: EventHandler,
}

type Subscriptions = Arc<Mutex<HashMap<String, Subscription>>>;

struct Connection {
    socket_id: String,
    outbound: mpsc::UnboundedSender<Message>,
    task: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.task.abort();
    }
}

/// Pusher WebSocket 传输
pub struct PusherTransport {
    config: PusherConfig,
    http: reqwest::Client,
    connection: tokio::sync::Mutex<Option<Connection>>,
    subscriptions: Subscriptions,
}

impl PusherTransport {
    pub fn new(config: PusherConfig) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self {
            config,
            http,
            connection: tokio::sync::Mutex::new(None),
            subscriptions: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn open(&self) -> Result<Connection> {
        let url = self.config.socket_url();
        debug!(url = %url, "Connecting to push server");
        let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url.as_str()))
            .await
            .map_err(|_| NotifyError::TransportUnavailable("connect timed out".to_string()))?
            .map_err(|e| NotifyError::TransportUnavailable(e.to_string()))?;
        let (mut sink, mut stream) = ws.split();

        let socket_id = tokio::time::timeout(CONNECT_TIMEOUT, async {
            while let Some(msg) = stream.next().await {
                let msg = msg.map_err(|e| NotifyError::TransportUnavailable(e.to_string()))?;
                let Message::Text(text) = msg else {
                    continue;
                };
                let frame: Frame = serde_json::from_str(&text)?;
                match frame.event.as_str() {
                    "pusher:connection_established" => {
                        let data = frame_data(frame.data);
                        return data
                            .get("socket_id")
                            .and_then(Value::as_str)
                            .map(str::to_string)
                            .ok_or_else(|| NotifyError::Decode("missing socket_id".to_string()));
                    }
                    "pusher:error" => {
                        return Err(NotifyError::TransportUnavailable(frame_data(frame.data).to_string()));
                    }
                    _ => {}
                }
            }
            Err::<String, NotifyError>(NotifyError::TransportUnavailable(
                "closed during handshake".to_string(),
            ))
        })
        .await
        .map_err(|_| NotifyError::TransportUnavailable("handshake timed out".to_string()))??;

        info!(socket_id = %socket_id, "Push server connected");

        let (outbound, mut outbound_rx) = mpsc::unbounded_channel::<Message>();
        let replies = outbound.clone();
        let subscriptions = self.subscriptions.clone();
        let task = tokio::spawn(async move {
            loop {
                tokio::select! {
                    Some(msg) = outbound_rx.recv() => {
                        if let Err(e) = sink.send(msg).await {
                            warn!(error = %e, "Push socket write failed");
                            break;
                        }
                    }
                    incoming = stream.next() => match incoming {
                        Some(Ok(Message::Text(text))) => dispatch(&subscriptions, &text, &replies),
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = replies.send(Message::Pong(payload));
                        }
                        Some(Ok(Message::Close(_))) | None => {
                            warn!("Push socket closed by server");
                            break;
                        }
                        Some(Ok(_)) => {}
                        Some(Err(e)) => {
                            warn!(error = %e, "Push socket error");
                            break;
                        }
                    }
                }
            }
            release_subscriptions(&subscriptions);
        });

        Ok(Connection {
            socket_id,
            outbound,
            task,
        })
    }

    async fn authorize(&self, socket_id: &str, channel: &str) -> Result<String> {
        let endpoint = self.config.auth_endpoint.as_deref().ok_or_else(|| {
            NotifyError::TransportUnavailable("private channel requires an auth endpoint".to_string())
        })?;

        let mut request = self
            .http
            .post(endpoint)
            .header("Accept", "application/json")
            .json(&json!({ "socket_id": socket_id, "channel_name": channel }));
        if let Some(token) = &self.config.token {
            request = request.bearer_auth(token);
        }

        let response = request
            .send()
            .await
            .map_err(|e| NotifyError::request(endpoint, e))?;
        if !response.status().is_success() {
            return Err(NotifyError::HttpStatus {
                endpoint: endpoint.to_string(),
                status: response.status().as_u16(),
            });
        }
        let body: AuthResponse = response
            .json()
            .await
            .map_err(|e| NotifyError::Decode(e.to_string()))?;
        Ok(body.auth)
    }

    fn subscriptions(&self) -> std::sync::MutexGuard<'_, HashMap<String, Subscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// 连接断开后所有订阅失效，下一次 `listen` 会重新建立连接
fn release_subscriptions(subscriptions: &Subscriptions) {
    let mut subs = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
    if !subs.is_empty() {
        debug!(count = subs.len(), "Push subscriptions released");
        subs.clear();
    }
}

/// 分发一条服务端消息
fn dispatch(subscriptions: &Subscriptions, text: &str, replies: &mpsc::UnboundedSender<Message>) {
    let frame: Frame = match serde_json::from_str(text) {
        Ok(frame) => frame,
        Err(e) => {
            warn!(error = %e, "Unparseable push frame");
            return;
        }
    };

    match frame.event.as_str() {
        "pusher:ping" => {
            if let Ok(pong) = Frame::new("pusher:pong", json!({})).into_message() {
                let _ = replies.send(pong);
            }
            trace!("Answered pusher ping");
        }
        "pusher_internal:subscription_succeeded" => {
            debug!(channel = ?frame.channel, "Push subscription confirmed");
        }
        "pusher:error" | "pusher:subscription_error" => {
            warn!(channel = ?frame.channel, data = %frame.data, "Push server reported an error");
        }
        event => {
            let Some(channel) = frame.channel.as_deref() else {
                return;
            };
            let handler = {
                let subs = subscriptions.lock().unwrap_or_else(|e| e.into_inner());
                subs.get(channel)
                    .filter(|s| event_matches(&s.event, event))
                    .map(|s| s.handler.clone())
            };
            if let Some(handler) = handler {
                handler(frame_data(frame.data));
            }
        }
    }
}

#[async_trait]
impl PushTransport for PusherTransport {
    async fn listen(&self, channel: &str, event: &str, handler: EventHandler) -> Result<()> {
        let wire = self.config.wire_channel(channel);
        let (socket_id, outbound) = {
            let mut connection = self.connection.lock().await;
            let alive = connection
                .as_ref()
                .map(|c| !c.task.is_finished())
                .unwrap_or(false);
            if !alive {
                *connection = Some(self.open().await?);
            }
            let Some(conn) = connection.as_ref() else {
                return Err(NotifyError::TransportUnavailable("no connection".to_string()));
            };
            (conn.socket_id.clone(), conn.outbound.clone())
        };

        // 授权请求期间不持有连接锁
        let mut data = json!({ "channel": wire });
        if wire.starts_with("private-") {
            data["auth"] = Value::String(self.authorize(&socket_id, &wire).await?);
        }

        self.subscriptions().insert(
            wire.clone(),
            Subscription {
                event: event.to_string(),
                handler,
            },
        );
        outbound
            .send(Frame::new("pusher:subscribe", data).into_message()?)
            .map_err(|e| NotifyError::TransportUnavailable(e.to_string()))?;
        debug!(channel = %wire, event, "Push subscribe sent");
        Ok(())
    }

    async fn leave(&self, channel: &str) {
        let wire = self.config.wire_channel(channel);
        let remaining = {
            let mut subs = self.subscriptions();
            subs.remove(&wire);
            subs.len()
        };

        let mut connection = self.connection.lock().await;
        if let Some(conn) = connection.as_ref() {
            if let Ok(msg) = Frame::new("pusher:unsubscribe", json!({ "channel": wire })).into_message() {
                let _ = conn.outbound.send(msg);
            }
        }
        if remaining == 0 && connection.is_some() {
            // 没有订阅了，关闭连接
            *connection = None;
            debug!("Push socket released");
        }
    }

    fn is_listening(&self, channel: &str) -> bool {
        self.subscriptions()
            .contains_key(&self.config.wire_channel(channel))
    }
}
