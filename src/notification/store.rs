//! 通知存储 - 通知列表、未读数、加载状态的唯一可信来源
//!
//! 状态保存在 `tokio::sync::watch` 里：每次修改都是对整个快照的原子替换，
//! 订阅者总能读到最近一次提交的完整状态，不会出现撕裂读。
//!
//! 本地修改（已读、全部已读、删除）是乐观的：先改本地，再发确认请求，
//! 确认失败只记录日志，不回滚。

use chrono::Utc;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::api::NotificationApi;
use super::model::{Notification, NotificationPage};

/// 存储快照
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StoreSnapshot {
    /// 通知列表，最新在前
    pub notifications: Vec<Notification>,
    /// 未读数（u64，天然非负，所有递减都用 saturating_sub）
    pub unread_count: u64,
    /// 是否正在加载完整列表
    pub is_loading: bool,
}

impl StoreSnapshot {
    /// 列表中实际未读的条数
    pub fn unread_in_list(&self) -> u64 {
        self.notifications.iter().filter(|n| !n.is_read).count() as u64
    }

    pub fn find(&self, id: u64) -> Option<&Notification> {
        self.notifications.iter().find(|n| n.id == id)
    }
}

/// 通知存储（可廉价 clone，所有 clone 共享同一份状态）
#[derive(Clone)]
pub struct NotificationStore {
    state: Arc<watch::Sender<StoreSnapshot>>,
    api: Arc<dyn NotificationApi>,
    /// 每次 `clear()` 递增；跨越会话边界的请求结果直接丢弃
    epoch: Arc<AtomicU64>,
}

impl NotificationStore {
    pub fn new(api: Arc<dyn NotificationApi>) -> Self {
        let (state, _) = watch::channel(StoreSnapshot::default());
        Self {
            state: Arc::new(state),
            api,
            epoch: Arc::new(AtomicU64::new(0)),
        }
    }

    fn epoch(&self) -> u64 {
        self.epoch.load(Ordering::SeqCst)
    }

    /// 订阅状态变化
    pub fn subscribe(&self) -> watch::Receiver<StoreSnapshot> {
        self.state.subscribe()
    }

    pub fn snapshot(&self) -> StoreSnapshot {
        self.state.borrow().clone()
    }

    pub fn notifications(&self) -> Vec<Notification> {
        self.state.borrow().notifications.clone()
    }

    pub fn unread_count(&self) -> u64 {
        self.state.borrow().unread_count
    }

    pub fn is_loading(&self) -> bool {
        self.state.borrow().is_loading
    }

    pub fn api(&self) -> &Arc<dyn NotificationApi> {
        &self.api
    }

    // ---------------------------------------------------------------------
    // 本地状态修改
    // ---------------------------------------------------------------------

    /// 用权威数据整体覆盖当前状态
    ///
    /// 提交后 `unread_count` 等于列表中未读条数；服务端给出的总未读数
    /// 与之不同（列表只是第一页）时，以下一次轮询结果为准。
    pub fn replace_all(&self, list: Vec<Notification>, server_unread: u64) {
        self.state.send_modify(|s| {
            s.notifications = dedup_by_id(list);
            s.unread_count = s.unread_in_list();
            if s.unread_count != server_unread {
                debug!(
                    list_unread = s.unread_count,
                    server_unread,
                    "Unread count differs from server total, next poll reconciles"
                );
            }
        });
    }

    /// Push 来源的插入：按 id 幂等
    ///
    /// 返回 `true` 表示新插入；重复投递返回 `false`，不增加未读数
    pub fn ingest(&self, notification: Notification) -> bool {
        let id = notification.id;
        let inserted = self.state.send_if_modified(|s| {
            if s.notifications.iter().any(|n| n.id == id) {
                return false;
            }
            if !notification.is_read {
                s.unread_count += 1;
            }
            s.notifications.insert(0, notification);
            true
        });
        if !inserted {
            debug!(notification_id = id, "Duplicate notification ignored");
        }
        inserted
    }

    /// 提交轮询得到的未读数
    pub fn set_unread_count(&self, count: u64) {
        self.state.send_if_modified(|s| {
            if s.unread_count == count {
                return false;
            }
            s.unread_count = count;
            true
        });
    }

    pub fn set_loading(&self, loading: bool) {
        self.state.send_if_modified(|s| {
            if s.is_loading == loading {
                return false;
            }
            s.is_loading = loading;
            true
        });
    }

    /// 本地标记已读，返回是否有条目从未读变为已读
    pub fn apply_mark_read(&self, id: u64) -> bool {
        let now = Utc::now();
        self.state.send_if_modified(|s| {
            let changed = s
                .notifications
                .iter_mut()
                .find(|n| n.id == id)
                .map(|n| n.mark_read(now))
                .unwrap_or(false);
            if changed {
                s.unread_count = s.unread_count.saturating_sub(1);
            }
            changed
        })
    }

    /// 本地全部标记已读
    pub fn apply_mark_all_read(&self) {
        let now = Utc::now();
        self.state.send_if_modified(|s| {
            let mut changed = s.unread_count != 0;
            for n in s.notifications.iter_mut() {
                changed |= n.mark_read(now);
            }
            s.unread_count = 0;
            changed
        });
    }

    /// 本地删除，返回是否删除了条目
    pub fn apply_delete(&self, id: u64) -> bool {
        self.state.send_if_modified(|s| {
            let Some(pos) = s.notifications.iter().position(|n| n.id == id) else {
                return false;
            };
            let removed = s.notifications.remove(pos);
            if !removed.is_read {
                s.unread_count = s.unread_count.saturating_sub(1);
            }
            true
        })
    }

    /// 会话结束时清空
    pub fn clear(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.state.send_if_modified(|s| {
            if *s == StoreSnapshot::default() {
                return false;
            }
            *s = StoreSnapshot::default();
            true
        });
    }

    // ---------------------------------------------------------------------
    // 乐观修改 + 确认请求
    // ---------------------------------------------------------------------

    /// 标记已读；确认请求失败不回滚
    // TODO: 确认失败后是否应回滚本地状态尚无定论，目前与后端行为保持一致
    pub async fn mark_read(&self, id: u64) {
        self.apply_mark_read(id);
        if let Err(e) = self.api.mark_read(id).await {
            warn!(notification_id = id, error = %e, "Mark read not confirmed, keeping local state");
        }
    }

    /// 全部标记已读；确认请求失败不回滚
    pub async fn mark_all_read(&self) {
        self.apply_mark_all_read();
        if let Err(e) = self.api.mark_all_read().await {
            warn!(error = %e, "Mark all read not confirmed, keeping local state");
        }
    }

    /// 删除通知；确认请求失败不回滚
    pub async fn delete(&self, id: u64) {
        self.apply_delete(id);
        if let Err(e) = self.api.delete(id).await {
            warn!(notification_id = id, error = %e, "Delete not confirmed, keeping local state");
        }
    }

    // ---------------------------------------------------------------------
    // 权威刷新
    // ---------------------------------------------------------------------

    /// 拉取第一页并整体覆盖
    pub async fn refresh(&self) {
        let epoch = self.epoch();
        self.set_loading(true);
        let page = self.api.list(1).await;
        let unread = self.api.unread_count().await;
        if epoch != self.epoch() {
            debug!("Refresh result from previous session discarded");
            return;
        }
        match page {
            Ok(page) => {
                let server_unread = match unread {
                    Ok(count) => count,
                    Err(e) => {
                        warn!(error = %e, "Unread count fetch failed during refresh");
                        page.data.iter().filter(|n| !n.is_read).count() as u64
                    }
                };
                info!(count = page.data.len(), "Notification list refreshed");
                self.replace_all(page.data, server_unread);
            }
            Err(e) => warn!(error = %e, "Notification list fetch failed"),
        }
        self.set_loading(false);
    }

    /// 只刷新未读数（轮询每个 tick 调用）
    pub async fn refresh_unread_count(&self) {
        let epoch = self.epoch();
        match self.api.unread_count().await {
            Ok(_) if epoch != self.epoch() => {}
            Ok(count) => self.set_unread_count(count),
            Err(e) => warn!(error = %e, "Unread count poll failed"),
        }
    }

    /// 加载更多：把指定页中尚未出现的条目追加到列表末尾
    ///
    /// 返回该页信息，失败时返回 `None`
    pub async fn load_page(&self, page: u32) -> Option<NotificationPage> {
        let epoch = self.epoch();
        self.set_loading(true);
        let result = self.api.list(page).await;
        if epoch != self.epoch() {
            return None;
        }
        self.set_loading(false);

        match result {
            Ok(page) => {
                let items = page.data.clone();
                self.state.send_if_modified(|s| {
                    let known: HashSet<u64> = s.notifications.iter().map(|n| n.id).collect();
                    let before = s.notifications.len();
                    s.notifications
                        .extend(items.into_iter().filter(|n| !known.contains(&n.id)));
                    s.notifications.len() != before
                });
                Some(page)
            }
            Err(e) => {
                warn!(page, error = %e, "Notification page fetch failed");
                None
            }
        }
    }
}

/// 保留首次出现的条目，去掉重复 id
fn dedup_by_id(list: Vec<Notification>) -> Vec<Notification> {
    let mut seen = HashSet::with_capacity(list.len());
    list.into_iter().filter(|n| seen.insert(n.id)).collect()
}
