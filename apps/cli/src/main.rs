use std::{collections::HashSet, sync::Arc, time::Duration};

use anyhow::Result;
use clap::Parser;
use shared::{
    domain::{ChannelId, WorkspaceId},
    protocol::TimelineItem,
};
use sync_core::{load_settings, LeaderBus, SyncClient};

#[derive(Parser, Debug)]
struct Args {
    #[arg(long)]
    server_url: String,
    #[arg(long)]
    username: String,
    #[arg(long)]
    password: String,
    #[arg(long, default_value_t = 1)]
    workspace: i64,
    #[arg(long, default_value_t = 1)]
    channel: i64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt().init();
    let args = Args::parse();

    let mut settings = load_settings();
    settings.endpoint_base = args.server_url.clone();

    let client = SyncClient::new(
        settings,
        LeaderBus::new(),
        Arc::new(|| eprintln!("session expired; log in again")),
    )?;

    client.login(&args.username, &args.password).await?;
    println!("Logged in as {}", args.username);

    client.activate_tab(WorkspaceId(args.workspace)).await;

    let channel = ChannelId(args.channel);
    let snapshot = client.fetch_timeline(channel, 100).await?;
    let timeline = client.timeline();
    timeline.activate(channel, snapshot).await;

    println!("Tailing channel {} (ctrl-c to quit)", channel.0);
    let mut seen: HashSet<String> = HashSet::new();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = tokio::time::sleep(Duration::from_millis(500)) => {
                for item in timeline.items().await {
                    let key = match &item {
                        TimelineItem::User { user_message } => {
                            format!("u{}", user_message.message_id.0)
                        }
                        TimelineItem::System { system_message } => {
                            format!("s{}", system_message.system_message_id.0)
                        }
                    };
                    if !seen.insert(key) {
                        continue;
                    }
                    match &item {
                        TimelineItem::User { user_message } => {
                            let sender = user_message.sender_username.as_deref().unwrap_or("?");
                            println!(
                                "[{}] {sender}: {}",
                                user_message.created_at, user_message.body
                            );
                        }
                        TimelineItem::System { system_message } => {
                            println!("[{}] * {}", system_message.created_at, system_message.body);
                        }
                    }
                }
            }
        }
    }

    timeline.deactivate().await;
    client.logout().await;
    Ok(())
}
