//! 通知数据模型 - 与通知后端的 wire 格式一一对应

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// 通知类型
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotificationType {
    Info,
    Success,
    Warning,
    Error,
}

impl NotificationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NotificationType::Info => "info",
            NotificationType::Success => "success",
            NotificationType::Warning => "warning",
            NotificationType::Error => "error",
        }
    }
}

impl std::fmt::Display for NotificationType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// 通知优先级
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    Medium,
    High,
}

/// 通知记录
///
/// 字段名与后端返回完全一致，序列化后可原样回传。
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Notification {
    /// 服务端分配的唯一 ID
    pub id: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<u64>,
    pub title: String,
    pub message: String,
    #[serde(rename = "type")]
    pub kind: NotificationType,
    pub priority: Priority,
    /// 只会从 false 变为 true，客户端从不回退
    #[serde(default)]
    pub is_read: bool,
    #[serde(default)]
    pub related_module: Option<String>,
    #[serde(default)]
    pub related_id: Option<u64>,
    #[serde(default)]
    pub related_url: Option<String>,
    #[serde(default)]
    pub icon: Option<String>,
    #[serde(default, with = "timestamp::option")]
    pub read_at: Option<DateTime<Utc>>,
    #[serde(with = "timestamp")]
    pub created_at: DateTime<Utc>,
    #[serde(with = "timestamp")]
    pub updated_at: DateTime<Utc>,
    /// 服务端格式化好的相对时间（如 "5 minutes ago"）
    #[serde(default)]
    pub time_ago: String,
}

impl Notification {
    /// 标记为已读；已读的通知保持原 read_at 不变
    ///
    /// 返回 `true` 表示状态确实发生了变化
    pub fn mark_read(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_read {
            return false;
        }
        self.is_read = true;
        self.read_at = Some(now);
        true
    }
}

/// 用户通知偏好（由外部 profile 服务维护，这里只读 `push`）
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Preferences {
    pub push: bool,
    pub email: bool,
    pub system: bool,
    pub weekly: bool,
}

impl Preferences {
    /// 偏好获取失败时使用的 fail-open 默认值
    pub const FAIL_OPEN: Preferences = Preferences {
        push: true,
        email: true,
        system: true,
        weekly: false,
    };
}

impl Default for Preferences {
    fn default() -> Self {
        Self::FAIL_OPEN
    }
}

/// 通知列表分页响应
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotificationPage {
    pub data: Vec<Notification>,
    #[serde(default = "first_page")]
    pub current_page: u32,
    #[serde(default = "first_page")]
    pub last_page: u32,
    #[serde(default)]
    pub per_page: u32,
    #[serde(default)]
    pub total: u64,
}

fn first_page() -> u32 {
    1
}

impl NotificationPage {
    pub fn has_more(&self) -> bool {
        self.current_page < self.last_page
    }
}

/// 未读数响应
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct UnreadCountResponse {
    pub unread_count: u64,
}

/// 后端时间戳既可能是 RFC3339（`2024-05-01T08:00:00.000000Z`），
/// 也可能是 MySQL 风格的 `2024-05-01 08:00:00`（按 UTC 处理）
pub(crate) mod timestamp {
    use chrono::{DateTime, NaiveDateTime, Utc};
    use serde::{Deserialize, Deserializer, Serializer};

    const NAIVE_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

    pub fn parse(raw: &str) -> Option<DateTime<Utc>> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
            return Some(dt.with_timezone(&Utc));
        }
        NaiveDateTime::parse_from_str(raw, NAIVE_FORMAT)
            .ok()
            .map(|naive| naive.and_utc())
    }

    pub fn serialize<S: Serializer>(value: &DateTime<Utc>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_rfc3339())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<DateTime<Utc>, D::Error> {
        let raw = String::deserialize(deserializer)?;
        parse(&raw).ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw)))
    }

    pub mod option {
        use super::*;

        pub fn serialize<S: Serializer>(
            value: &Option<DateTime<Utc>>,
            serializer: S,
        ) -> Result<S::Ok, S::Error> {
            match value {
                Some(dt) => serializer.serialize_some(&dt.to_rfc3339()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D: Deserializer<'de>>(
            deserializer: D,
        ) -> Result<Option<DateTime<Utc>>, D::Error> {
            match Option::<String>::deserialize(deserializer)? {
                Some(raw) => parse(&raw)
                    .map(Some)
                    .ok_or_else(|| serde::de::Error::custom(format!("invalid timestamp: {}", raw))),
                None => Ok(None),
            }
        }
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use super::*;

    /// 构造测试用通知
    pub fn notification(id: u64, is_read: bool) -> Notification {
        let ts = DateTime::parse_from_rfc3339("2026-01-01T08:00:00Z")
            .unwrap()
            .with_timezone(&Utc);
        Notification {
            id,
            user_id: Some(7),
            title: format!("Notification {}", id),
            message: "Payment received".to_string(),
            kind: NotificationType::Success,
            priority: Priority::Medium,
            is_read,
            related_module: None,
            related_id: None,
            related_url: None,
            icon: None,
            read_at: None,
            created_at: ts,
            updated_at: ts,
            time_ago: "1 minute ago".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_from_backend_json() {
        let json = r#"{
            "id": 101,
            "user_id": 7,
            "title": "Pago registrado",
            "message": "Se registró un pago",
            "type": "success",
            "priority": "high",
            "is_read": false,
            "related_module": "payments",
            "related_id": 55,
            "related_url": "/payments/55",
            "icon": "check",
            "read_at": null,
            "created_at": "2026-03-01T10:00:00.000000Z",
            "updated_at": "2026-03-01 10:00:00",
            "time_ago": "hace 1 minuto"
        }"#;
        let n: Notification = serde_json::from_str(json).unwrap();
        assert_eq!(n.id, 101);
        assert_eq!(n.kind, NotificationType::Success);
        assert_eq!(n.priority, Priority::High);
        assert_eq!(n.related_id, Some(55));
        assert_eq!(n.created_at, n.updated_at);
        assert!(n.read_at.is_none());
    }

    #[test]
    fn test_wire_field_names_preserved() {
        let n = fixtures::notification(3, false);
        let value = serde_json::to_value(&n).unwrap();
        for field in [
            "id", "user_id", "title", "message", "type", "priority", "is_read",
            "related_module", "related_id", "related_url", "icon", "read_at",
            "created_at", "updated_at", "time_ago",
        ] {
            assert!(value.get(field).is_some(), "missing field {}", field);
        }
    }

    #[test]
    fn test_mark_read_only_transitions_once() {
        let mut n = fixtures::notification(1, false);
        let first = Utc::now();
        assert!(n.mark_read(first));
        assert_eq!(n.read_at, Some(first));

        // 再次标记不覆盖 read_at
        assert!(!n.mark_read(first + chrono::Duration::seconds(10)));
        assert_eq!(n.read_at, Some(first));
    }

    #[test]
    fn test_fail_open_preferences() {
        let prefs = Preferences::default();
        assert!(prefs.push);
        assert!(prefs.email);
        assert!(prefs.system);
        assert!(!prefs.weekly);
    }

    #[test]
    fn test_page_defaults() {
        let page: NotificationPage = serde_json::from_str(r#"{"data": []}"#).unwrap();
        assert_eq!(page.current_page, 1);
        assert!(!page.has_more());
    }
}
