//! 通知实时投递子系统
//!
//! # 组成
//! 1. `NotificationStore`：通知列表、未读数、加载状态的唯一可信来源
//! 2. `PushChannel`：基于可插拔 `PushTransport` 的 push 订阅
//! 3. `PollingLoop`：定期刷新未读数，push 不可用时的兜底
//! 4. `TransportManager`：按偏好和会话编排以上两路传输
//! 5. `ToastScheduler`：单槽位、可取消的 toast 定时器
//!
//! # 使用示例
//! ```ignore
//! use realtime_notify::notification::{HttpNotificationApi, ApiConfig, TransportManager};
//!
//! let api = Arc::new(HttpNotificationApi::new(ApiConfig::default())?);
//! let manager = TransportManager::new(api, None);
//! manager.activate(user_id).await;
//! ```

pub mod api;
pub mod error;
pub mod manager;
pub mod model;
pub mod polling;
pub mod push;
pub mod pusher;
pub mod reconcile;
pub mod store;
pub mod testing;
pub mod toast;

pub use api::{ApiConfig, HttpNotificationApi, NotificationApi};
pub use error::{NotifyError, Result};
pub use manager::{ManagerSettings, TransportManager};
pub use model::{Notification, NotificationPage, NotificationType, Preferences, Priority};
pub use polling::PollingLoop;
pub use push::{EventHandler, PushChannel, PushTransport};
pub use pusher::{PusherConfig, PusherTransport};
pub use reconcile::{plan_push, resolve_preferences, PushAction};
pub use store::{NotificationStore, StoreSnapshot};
pub use toast::{ToastEvent, ToastPhase, ToastRequest, ToastScheduler, ToastTimings};
