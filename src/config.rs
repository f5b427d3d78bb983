//! 配置加载
//!
//! 优先级：命令行参数 > 环境变量 > `~/.config/realtime-notify/config.json` > 默认值

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::notification::api::ApiConfig;
use crate::notification::manager::ManagerSettings;
use crate::notification::push::{DEFAULT_CHANNEL_TEMPLATE, DEFAULT_EVENT};
use crate::notification::pusher::PusherConfig;
use crate::notification::toast::ToastTimings;

/// 客户端配置
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotifyConfig {
    /// API 根地址
    pub api_url: String,
    /// Bearer token
    pub token: Option<String>,
    /// 单次 HTTP 请求超时（秒）
    pub request_timeout_secs: u64,
    /// 轮询间隔（毫秒）
    pub poll_interval_ms: u64,
    /// Toast 显示时长（毫秒）
    pub toast_duration_ms: u64,
    /// Toast 退出动画时长（毫秒）
    pub toast_exit_ms: u64,
    /// Toast 进度条延迟（毫秒）
    pub toast_enter_delay_ms: u64,
    /// Push 配置；缺省表示环境中没有 push 能力
    pub push: Option<PushConfig>,
}

impl Default for NotifyConfig {
    fn default() -> Self {
        Self {
            api_url: "http://localhost:8000/api".to_string(),
            token: None,
            request_timeout_secs: 30,
            poll_interval_ms: 30_000,
            toast_duration_ms: 5_000,
            toast_exit_ms: 300,
            toast_enter_delay_ms: 10,
            push: None,
        }
    }
}

/// Push 服务配置
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// WebSocket 地址
    pub url: String,
    pub app_key: String,
    /// 私有频道授权端点，缺省为 `{api_url}/broadcasting/auth`
    #[serde(default)]
    pub auth_endpoint: Option<String>,
    #[serde(default = "default_channel_template")]
    pub channel_template: String,
    #[serde(default = "default_event")]
    pub event: String,
    #[serde(default = "default_true")]
    pub private_channels: bool,
}

fn default_channel_template() -> String {
    DEFAULT_CHANNEL_TEMPLATE.to_string()
}

fn default_event() -> String {
    DEFAULT_EVENT.to_string()
}

fn default_true() -> bool {
    true
}

impl NotifyConfig {
    /// 默认配置文件路径
    pub fn path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".config")
            .join("realtime-notify")
            .join("config.json")
    }

    /// 从默认路径加载并应用环境变量
    pub fn load() -> Result<Self> {
        let mut config = Self::load_from(&Self::path())?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    /// 从指定文件加载；文件不存在时返回默认配置
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = fs::read_to_string(path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        let config = serde_json::from_str(&content)
            .with_context(|| format!("invalid config file {}", path.display()))?;
        Ok(config)
    }

    /// 应用环境变量覆盖（`lookup` 便于测试注入）
    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(url) = lookup("RTN_API_URL") {
            self.api_url = url;
        }
        if let Some(token) = lookup("RTN_TOKEN") {
            self.token = Some(token);
        }
        let push_url = lookup("RTN_PUSH_URL");
        let push_key = lookup("RTN_PUSH_KEY");
        if let Some(push) = self.push.as_mut() {
            if let Some(url) = push_url {
                push.url = url;
            }
            if let Some(key) = push_key {
                push.app_key = key;
            }
        } else if let (Some(url), Some(app_key)) = (push_url, push_key) {
            self.push = Some(PushConfig {
                url,
                app_key,
                auth_endpoint: None,
                channel_template: default_channel_template(),
                event: default_event(),
                private_channels: true,
            });
        }
    }

    pub fn api_config(&self) -> ApiConfig {
        ApiConfig {
            base_url: self.api_url.clone(),
            token: self.token.clone(),
            timeout_secs: self.request_timeout_secs,
        }
    }

    pub fn pusher_config(&self) -> Option<PusherConfig> {
        self.push.as_ref().map(|push| PusherConfig {
            url: push.url.clone(),
            app_key: push.app_key.clone(),
            auth_endpoint: Some(push.auth_endpoint.clone().unwrap_or_else(|| {
                format!("{}/broadcasting/auth", self.api_url.trim_end_matches('/'))
            })),
            token: self.token.clone(),
            private_channels: push.private_channels,
            timeout_secs: self.request_timeout_secs,
        })
    }

    pub fn manager_settings(&self) -> ManagerSettings {
        let mut settings = ManagerSettings {
            poll_interval: Duration::from_millis(self.poll_interval_ms),
            toast: ToastTimings {
                duration: Duration::from_millis(self.toast_duration_ms),
                exit: Duration::from_millis(self.toast_exit_ms),
                enter_delay: Duration::from_millis(self.toast_enter_delay_ms),
            },
            ..ManagerSettings::default()
        };
        if let Some(push) = &self.push {
            settings.channel_template = push.channel_template.clone();
            settings.event = push.event.clone();
        }
        settings
    }
}
