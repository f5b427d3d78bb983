//! 偏好协调逻辑
//!
//! 不是独立运行的组件，只是 `TransportManager` 在激活和偏好变更时调用的
//! 决策函数：偏好获取失败时替换为 fail-open 默认值，并根据前后偏好
//! 决定 push 通道应连接、断开还是保持。

use tracing::warn;

use super::error::Result;
use super::model::Preferences;

/// Push 通道的下一步动作
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PushAction {
    Connect,
    Disconnect,
    Keep,
}

/// 解析偏好获取结果，失败时返回 fail-open 默认值
pub fn resolve_preferences(fetched: Result<Preferences>) -> Preferences {
    match fetched {
        Ok(prefs) => prefs,
        Err(e) => {
            warn!(error = %e, "Preference fetch failed, using fail-open defaults");
            Preferences::FAIL_OPEN
        }
    }
}

/// 根据前后偏好决定 push 动作
///
/// `previous` 为 `None` 表示刚激活（尚无已生效的偏好）。
/// 只看 `push` 开关；push 开启但实际连不上的情况不在这里处理，
/// 那种情况下不会断开任何东西，轮询继续作为唯一数据源。
pub fn plan_push(previous: Option<&Preferences>, next: &Preferences) -> PushAction {
    match (previous.map(|p| p.push), next.push) {
        (None, true) | (Some(false), true) => PushAction::Connect,
        (Some(true), false) => PushAction::Disconnect,
        (None, false) => PushAction::Keep,
        (Some(true), true) | (Some(false), false) => PushAction::Keep,
    }
}
