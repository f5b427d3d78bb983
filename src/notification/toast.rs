//! Toast 调度器 - 单槽位、可取消的定时提示
//!
//! 状态机：
//! ```text
//! Idle --show--> Showing --倒计时结束/dismiss--> Closing --退出动画--> Idle
//!                Showing --show(新)--> Showing（旧倒计时立即取消，不排队）
//!                Closing --show(新)--> Showing（旧退出定时器取消，不发 Hidden）
//! ```
//!
//! 每个定时器都是 `TimerHandle`，随状态槽位一起持有；槽位被替换或调度器被
//! 销毁时，句柄 drop 即取消对应任务。另用 generation 防止已经醒来的旧任务
//! 作用到新 toast 上。

use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::debug;

use super::model::{Notification, NotificationType};

/// Toast 请求（由通知派生）
#[derive(Debug, Clone, PartialEq)]
pub struct ToastRequest {
    pub notification_id: u64,
    pub title: String,
    pub message: String,
    pub kind: NotificationType,
    pub related_url: Option<String>,
}

impl From<&Notification> for ToastRequest {
    fn from(n: &Notification) -> Self {
        Self {
            notification_id: n.id,
            title: n.title.clone(),
            message: n.message.clone(),
            kind: n.kind,
            related_url: n.related_url.clone(),
        }
    }
}

/// 输出给界面的 toast 事件
#[derive(Debug, Clone, PartialEq)]
pub enum ToastEvent {
    /// 进入显示（进入动画开始）
    Shown(ToastRequest),
    /// 进度条开始消耗（进入动画之后一帧）
    ProgressStarted(u64),
    /// 开始退出动画
    Closing(ToastRequest),
    /// 退出动画结束，槽位空闲
    Hidden(ToastRequest),
}

/// 对外可见的状态
#[derive(Debug, Clone, PartialEq)]
pub enum ToastPhase {
    Idle,
    Showing(ToastRequest),
    Closing(ToastRequest),
}

/// 时间参数
#[derive(Debug, Clone, Copy)]
pub struct ToastTimings {
    /// 显示总时长
    pub duration: Duration,
    /// 退出动画时长
    pub exit: Duration,
    /// 进度条动画开始前的延迟
    pub enter_delay: Duration,
}

impl Default for ToastTimings {
    fn default() -> Self {
        Self {
            duration: Duration::from_millis(5000),
            exit: Duration::from_millis(300),
            enter_delay: Duration::from_millis(10),
        }
    }
}

/// 定时器句柄，drop 时取消任务
struct TimerHandle(JoinHandle<()>);

impl Drop for TimerHandle {
    fn drop(&mut self) {
        self.0.abort();
    }
}

enum Slot {
    Idle,
    Showing {
        toast: ToastRequest,
        _countdown: TimerHandle,
    },
    Closing {
        toast: ToastRequest,
        _timer: TimerHandle,
    },
}

struct Inner {
    slot: Slot,
    generation: u64,
}

struct Shared {
    inner: Mutex<Inner>,
    events: broadcast::Sender<ToastEvent>,
    timings: ToastTimings,
}

/// Toast 调度器（clone 共享同一个槽位）
#[derive(Clone)]
pub struct ToastScheduler {
    shared: Arc<Shared>,
}

impl ToastScheduler {
    pub fn new() -> Self {
        Self::with_timings(ToastTimings::default())
    }

    pub fn with_timings(timings: ToastTimings) -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    slot: Slot::Idle,
                    generation: 0,
                }),
                events,
                timings,
            }),
        }
    }

    /// 订阅 toast 事件流
    pub fn subscribe(&self) -> broadcast::Receiver<ToastEvent> {
        self.shared.events.subscribe()
    }

    pub fn state(&self) -> ToastPhase {
        let inner = self.shared.lock();
        match &inner.slot {
            Slot::Idle => ToastPhase::Idle,
            Slot::Showing { toast, .. } => ToastPhase::Showing(toast.clone()),
            Slot::Closing { toast, .. } => ToastPhase::Closing(toast.clone()),
        }
    }

    /// 显示新 toast，取代当前槽位中的任何 toast
    pub fn show(&self, toast: ToastRequest) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        let generation = inner.generation;

        if let Slot::Showing { toast: old, .. } | Slot::Closing { toast: old, .. } = &inner.slot {
            debug!(
                superseded = old.notification_id,
                notification_id = toast.notification_id,
                "Toast superseded"
            );
        }

        let countdown = spawn_countdown(Arc::downgrade(&self.shared), generation, self.shared.timings);
        // 旧槽位在这里 drop，旧定时器随之取消
        inner.slot = Slot::Showing {
            toast: toast.clone(),
            _countdown: countdown,
        };
        self.shared.emit(ToastEvent::Shown(toast));
    }

    /// 用户手动关闭；已在关闭中或空闲时为 no-op
    pub fn dismiss(&self) {
        let generation = self.shared.lock().generation;
        self.shared.begin_close(generation);
    }

    /// 取消所有挂起的定时器并回到 Idle（卸载/会话结束时调用）
    pub fn shutdown(&self) {
        let mut inner = self.shared.lock();
        inner.generation += 1;
        inner.slot = Slot::Idle;
    }
}

impl Default for ToastScheduler {
    fn default() -> Self {
        Self::new()
    }
}

impl Shared {
    fn lock(&self) -> std::sync::MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn emit(&self, event: ToastEvent) {
        // 没有订阅者时 send 返回错误，忽略即可
        let _ = self.events.send(event);
    }

    fn progress_started(&self, generation: u64) {
        let inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Slot::Showing { toast, .. } = &inner.slot {
            self.emit(ToastEvent::ProgressStarted(toast.notification_id));
        }
    }

    fn begin_close(self: &Arc<Self>, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        let toast = match &inner.slot {
            Slot::Showing { toast, .. } => toast.clone(),
            _ => return,
        };
        debug!(notification_id = toast.notification_id, "Toast closing");
        let timer = spawn_close(Arc::downgrade(self), generation, self.timings.exit);
        inner.slot = Slot::Closing {
            toast: toast.clone(),
            _timer: timer,
        };
        self.emit(ToastEvent::Closing(toast));
    }

    fn finish_close(&self, generation: u64) {
        let mut inner = self.lock();
        if inner.generation != generation {
            return;
        }
        if let Slot::Closing { toast, .. } = &inner.slot {
            let toast = toast.clone();
            inner.slot = Slot::Idle;
            self.emit(ToastEvent::Hidden(toast));
        }
    }
}

fn spawn_countdown(shared: Weak<Shared>, generation: u64, timings: ToastTimings) -> TimerHandle {
    TimerHandle(tokio::spawn(async move {
        let enter_delay = timings.enter_delay.min(timings.duration);
        sleep(enter_delay).await;
        match shared.upgrade() {
            Some(s) => s.progress_started(generation),
            None => return,
        }
        sleep(timings.duration - enter_delay).await;
        if let Some(s) = shared.upgrade() {
            s.begin_close(generation);
        }
    }))
}

fn spawn_close(shared: Weak<Shared>, generation: u64, exit: Duration) -> TimerHandle {
    TimerHandle(tokio::spawn(async move {
        sleep(exit).await;
        if let Some(s) = shared.upgrade() {
            s.finish_close(generation);
        }
    }))
}
