//! Realtime Notify CLI
//!
//! 查看、管理通知，并以 push + 轮询的方式实时接收新通知

use anyhow::{bail, Result};
use clap::{Parser, Subcommand};
use realtime_notify::notification::{
    HttpNotificationApi, NotificationApi, PushTransport, PusherTransport, ToastEvent,
    TransportManager,
};
use realtime_notify::NotifyConfig;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "rtn")]
#[command(about = "Realtime Notify - 通知实时投递客户端")]
#[command(version)]
struct Cli {
    /// 覆盖 API 根地址
    #[arg(long, global = true)]
    api_url: Option<String>,
    /// 覆盖 Bearer token
    #[arg(long, global = true)]
    token: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// 实时接收通知，直到 Ctrl-C
    Watch {
        /// 当前登录用户 ID
        #[arg(long)]
        user_id: u64,
    },
    /// 列出通知
    List {
        /// 页码
        #[arg(long, default_value = "1")]
        page: u32,
        /// 输出 JSON 格式
        #[arg(long)]
        json: bool,
    },
    /// 显示未读数
    Unread,
    /// 标记单条已读
    Read {
        /// 通知 ID
        id: u64,
    },
    /// 全部标记已读
    ReadAll,
    /// 删除通知
    Delete {
        /// 通知 ID
        id: u64,
    },
    /// 查看或修改通知偏好
    Prefs {
        /// 开启或关闭 push（on / off）
        #[arg(long)]
        push: Option<String>,
    },
}

fn parse_switch(value: &str) -> Result<bool> {
    match value {
        "on" | "true" | "1" => Ok(true),
        "off" | "false" | "0" => Ok(false),
        other => bail!("expected on/off, got '{}'", other),
    }
}

async fn run_watch(config: &NotifyConfig, api: Arc<HttpNotificationApi>, user_id: u64) -> Result<()> {
    let transport: Option<Arc<dyn PushTransport>> = match config.pusher_config() {
        Some(pusher) => Some(Arc::new(PusherTransport::new(pusher)?)),
        None => None,
    };
    if transport.is_none() {
        info!("No push configured, relying on polling");
    }

    let manager = TransportManager::with_settings(api, transport, config.manager_settings());
    let mut toasts = manager.toast_events();
    let mut snapshots = manager.subscribe();

    manager.activate(user_id).await;
    manager.refresh().await;
    println!(
        "Watching notifications for user {} ({} unread, push {})",
        user_id,
        manager.unread_count(),
        if manager.is_push_connected() { "on" } else { "off" }
    );

    let mut last_unread = manager.unread_count();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = toasts.recv() => match event {
                Ok(ToastEvent::Shown(toast)) => {
                    println!("🔔 [{}] {}: {}", toast.kind, toast.title, toast.message);
                    if let Some(url) = &toast.related_url {
                        println!("   → {}", url);
                    }
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Toast events lagged");
                }
                Err(_) => break,
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let unread = snapshots.borrow_and_update().unread_count;
                if unread != last_unread {
                    println!("Unread: {}", unread);
                    last_unread = unread;
                }
            }
        }
    }

    manager.deactivate(user_id).await;
    info!("Stopped watching");
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    // 通过 RUST_LOG 环境变量控制日志级别，默认为 info
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("realtime_notify=info,rtn=info"));

    fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .init();

    let cli = Cli::parse();

    let mut config = NotifyConfig::load()?;
    if let Some(url) = cli.api_url {
        config.api_url = url;
    }
    if let Some(token) = cli.token {
        config.token = Some(token);
    }
    let api = Arc::new(HttpNotificationApi::new(config.api_config())?);

    match cli.command {
        Commands::Watch { user_id } => {
            run_watch(&config, api, user_id).await?;
        }
        Commands::List { page, json } => {
            let result = api.list(page).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&result)?);
            } else if result.data.is_empty() {
                println!("No notifications");
            } else {
                for n in &result.data {
                    let marker = if n.is_read { " " } else { "●" };
                    println!(
                        "{} {:>6}  [{}] {} - {} ({})",
                        marker,
                        n.id,
                        n.kind,
                        n.title,
                        n.message,
                        n.created_at.format("%Y-%m-%d %H:%M")
                    );
                }
                println!("Page {}/{} ({} total)", result.current_page, result.last_page, result.total);
            }
        }
        Commands::Unread => {
            println!("{}", api.unread_count().await?);
        }
        Commands::Read { id } => {
            api.mark_read(id).await?;
            println!("Marked {} as read", id);
        }
        Commands::ReadAll => {
            api.mark_all_read().await?;
            println!("Marked all as read");
        }
        Commands::Delete { id } => {
            api.delete(id).await?;
            println!("Deleted {}", id);
        }
        Commands::Prefs { push } => {
            let mut prefs = api.fetch_preferences().await?;
            if let Some(value) = push {
                prefs.push = parse_switch(&value)?;
                prefs = api.save_preferences(&prefs).await?;
            }
            println!("{}", serde_json::to_string_pretty(&prefs)?);
        }
    }

    Ok(())
}
