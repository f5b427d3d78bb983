//! Realtime Notify - 通知实时投递客户端（push + 轮询、未读数、toast）

pub mod config;
pub mod notification;

pub use config::NotifyConfig;
pub use notification::{
    HttpNotificationApi, Notification, NotificationApi, NotificationStore, NotifyError,
    PollingLoop, Preferences, PushChannel, PushTransport, PusherTransport, ToastEvent,
    ToastScheduler, TransportManager,
};
