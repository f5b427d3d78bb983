//! 通知后端 HTTP 客户端
//!
//! `NotificationApi` 是对通知后端的抽象，`HttpNotificationApi` 是基于
//! reqwest 的实现。测试中可以用内存 mock 替换。

use async_trait::async_trait;
use reqwest::{Client, Method, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use std::time::Duration;
use tracing::debug;

use super::error::{NotifyError, Result};
use super::model::{NotificationPage, Preferences, UnreadCountResponse};

/// 通知后端接口
#[async_trait]
pub trait NotificationApi: Send + Sync {
    /// 获取通知列表（分页，按服务端顺序：最新在前）
    async fn list(&self, page: u32) -> Result<NotificationPage>;

    /// 获取未读数
    async fn unread_count(&self) -> Result<u64>;

    /// 标记单条已读
    async fn mark_read(&self, id: u64) -> Result<()>;

    /// 全部标记已读
    async fn mark_all_read(&self) -> Result<()>;

    /// 删除通知
    async fn delete(&self, id: u64) -> Result<()>;

    /// 获取通知偏好
    async fn fetch_preferences(&self) -> Result<Preferences>;

    /// 保存通知偏好
    async fn save_preferences(&self, prefs: &Preferences) -> Result<Preferences>;
}

/// HTTP 客户端配置
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// API 根地址（如 http://localhost:8000/api）
    pub base_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// 单次请求超时（秒）
    pub timeout_secs: u64,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:8000/api".to_string(),
            token: None,
            timeout_secs: 30,
        }
    }
}

/// 基于 reqwest 的通知后端客户端
#[derive(Debug, Clone)]
pub struct HttpNotificationApi {
    client: Client,
    config: ApiConfig,
}

impl HttpNotificationApi {
    pub fn new(config: ApiConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| NotifyError::Config(format!("failed to create HTTP client: {}", e)))?;

        Ok(Self { client, config })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.config.base_url.trim_end_matches('/'), path)
    }

    fn request(&self, method: Method, path: &str) -> RequestBuilder {
        let builder = self
            .client
            .request(method, self.url(path))
            .header("Accept", "application/json");
        match &self.config.token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, path: &str, builder: RequestBuilder) -> Result<Response> {
        let response = builder
            .send()
            .await
            .map_err(|e| NotifyError::request(path, e))?;

        let status = response.status();
        debug!(endpoint = path, status = status.as_u16(), "Notification API response");
        if !status.is_success() {
            return Err(NotifyError::HttpStatus {
                endpoint: path.to_string(),
                status: status.as_u16(),
            });
        }
        Ok(response)
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let response = self.send(path, self.request(Method::GET, path)).await?;
        response
            .json::<T>()
            .await
            .map_err(|e| NotifyError::Decode(format!("{}: {}", path, e)))
    }
}

#[async_trait]
impl NotificationApi for HttpNotificationApi {
    async fn list(&self, page: u32) -> Result<NotificationPage> {
        self.get_json(&format!("notifications?page={}", page)).await
    }

    async fn unread_count(&self) -> Result<u64> {
        let body: UnreadCountResponse = self.get_json("notifications/unread-count").await?;
        Ok(body.unread_count)
    }

    async fn mark_read(&self, id: u64) -> Result<()> {
        let path = format!("notifications/{}/read", id);
        self.send(&path, self.request(Method::POST, &path)).await?;
        Ok(())
    }

    async fn mark_all_read(&self) -> Result<()> {
        let path = "notifications/read-all";
        self.send(path, self.request(Method::POST, path)).await?;
        Ok(())
    }

    async fn delete(&self, id: u64) -> Result<()> {
        let path = format!("notifications/{}", id);
        self.send(&path, self.request(Method::DELETE, &path)).await?;
        Ok(())
    }

    async fn fetch_preferences(&self) -> Result<Preferences> {
        self.get_json("profile/notification-preferences")
            .await
            .map_err(|e| NotifyError::PreferenceFetchFailed(e.to_string()))
    }

    async fn save_preferences(&self, prefs: &Preferences) -> Result<Preferences> {
        let path = "profile/notification-preferences";
        let response = self
            .send(path, self.request(Method::PUT, path).json(prefs))
            .await?;
        response
            .json::<Preferences>()
            .await
            .map_err(|e| NotifyError::Decode(format!("{}: {}", path, e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_config_default() {
        let config = ApiConfig::default();
        assert_eq!(config.base_url, "http://localhost:8000/api");
        assert_eq!(config.timeout_secs, 30);
        assert!(config.token.is_none());
    }

    #[test]
    fn test_url_join_trims_trailing_slash() {
        let api = HttpNotificationApi::new(ApiConfig {
            base_url: "http://example.test/api/".to_string(),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(
            api.url("notifications/unread-count"),
            "http://example.test/api/notifications/unread-count"
        );
    }
}
