use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use chrono::{Local, NaiveDate, Utc};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{info, warn};
use uuid::Uuid;

use parley_db::Store;
use parley_sync::directory::{UserDirectory, ensure_user};
use parley_sync::partition::partition;
use parley_sync::{ConversationSync, SyncOptions};
use parley_types::models::{ConversationScope, Message};

type Session = ConversationSync<Store>;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load .env if present
    let _ = dotenvy::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "parley=info,parley_sync=info,parley_db=info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    // Config
    let db_path = std::env::var("PARLEY_DB_PATH").unwrap_or_else(|_| "parley.db".into());
    let username = std::env::var("PARLEY_USERNAME").unwrap_or_else(|_| "guest".into());
    let channel_name = std::env::var("PARLEY_CHANNEL").unwrap_or_else(|_| "general".into());
    let options = SyncOptions::from_env()?;

    let store = Arc::new(Store::open(&PathBuf::from(&db_path))?);
    let me = ensure_user(store.as_ref(), &username).await?;
    info!("Signed in as {} ({})", me.username, me.uid);

    let sync = Arc::new(ConversationSync::new(store.clone(), me, options));
    join(&sync, &channel_name).await?;

    tokio::spawn(render(sync.clone()));

    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut previous: Option<ConversationScope> = None;
    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match run_command(&sync, line, &mut previous).await {
            Ok(true) => {}
            Ok(false) => break,
            Err(e) => warn!("{:#}", e),
        }
    }

    sync.clear_scope();
    info!("Bye");
    Ok(())
}

/// Returns false when the session should end.
async fn run_command(
    sync: &Session,
    line: &str,
    previous: &mut Option<ConversationScope>,
) -> anyhow::Result<bool> {
    let (command, rest) = line.split_once(' ').unwrap_or((line, ""));
    let rest = rest.trim();

    match command {
        "/quit" => return Ok(false),
        "/join" => {
            join(sync, rest).await?;
            *previous = None;
        }
        "/channels" => {
            let mine = sync.channels().channels_for(sync.me().uid).await?;
            for channel in sync.channels().list_channels().await? {
                let marker = if mine.iter().any(|c| c.id == channel.id) { "*" } else { " " };
                println!("{} #{}  {}", marker, channel.name, channel.description);
            }
        }
        "/members" => {
            let Some(ConversationScope::Channel(channel_id)) = sync.scope() else {
                anyhow::bail!("not in a channel");
            };
            let directory = UserDirectory::load(sync.feed().as_ref()).await?;
            for uid in sync.channels().members(channel_id).await? {
                let name = directory.get(uid).map_or("unknown", |u| u.username.as_str());
                println!("  {}", name);
            }
        }
        "/dm" => {
            let directory = UserDirectory::load(sync.feed().as_ref()).await?;
            let peer = directory
                .by_name(rest)
                .with_context(|| format!("no user named '{}'", rest))?;
            sync.set_scope(ConversationScope::DirectMessage(peer.uid));
            *previous = None;
        }
        "/thread" => {
            let root = nth_message(sync, rest)?;
            let current = sync.scope();
            sync.set_scope(ConversationScope::Thread(root.id));
            *previous = current;
        }
        "/back" => {
            let scope = previous.take().context("nothing to go back to")?;
            sync.set_scope(scope);
        }
        "/react" => {
            let (index, emoji) = rest.split_once(' ').context("usage: /react <n> <emoji>")?;
            let target = nth_message(sync, index)?;
            if sync.toggle_reaction(target.id, emoji.trim()).await?.is_none() {
                anyhow::bail!("that message is gone");
            }
        }
        "/edit" => {
            let (index, text) = rest.split_once(' ').context("usage: /edit <n> <text>")?;
            let target = nth_message(sync, index)?;
            let directory = UserDirectory::load(sync.feed().as_ref()).await?;
            if sync.edit_message(target.id, text, &directory).await?.is_none() {
                anyhow::bail!("that message is gone");
            }
        }
        "/delete" => {
            let target = nth_message(sync, rest)?;
            sync.delete_message(target.id).await?;
        }
        _ if command.starts_with('/') => anyhow::bail!("unknown command {}", command),
        _ => {
            let directory = UserDirectory::load(sync.feed().as_ref()).await?;
            if sync.send_message(line, &directory).await?.is_none() {
                anyhow::bail!("this thread's root message was deleted");
            }
        }
    }
    Ok(true)
}

/// Find or create `name`, join it, and make it the active scope.
async fn join(sync: &Session, name: &str) -> anyhow::Result<()> {
    let channels = sync.channels();
    let channel = match channels.find_channel_by_name(name).await? {
        Some(channel) => channel,
        None => channels.create_channel(name, "", sync.me()).await?,
    };
    channels.join_channel(channel.id, sync.me().uid).await?;
    sync.enter_channel(channel.id).await?;
    println!("-- #{} --", channel.name);
    Ok(())
}

/// 1-based index into the current view, as printed by the renderer.
fn nth_message(sync: &Session, index: &str) -> anyhow::Result<Message> {
    let n: usize = index
        .trim()
        .parse()
        .with_context(|| format!("'{}' is not a message number", index))?;
    let view = sync.view();
    n.checked_sub(1)
        .and_then(|i| view.messages.get(i))
        .cloned()
        .with_context(|| format!("no message #{}", n))
}

async fn render(sync: Arc<Session>) {
    let mut rx = sync.watch();
    let mut scope = None;
    // Keyed on what the renderer shows, so edits and reactions reprint a line.
    let mut printed: HashSet<(Uuid, bool, usize, usize)> = HashSet::new();
    let mut last_day: Option<NaiveDate> = None;

    while rx.changed().await.is_ok() {
        let view = rx.borrow_and_update().clone();
        if view.scope != scope {
            scope = view.scope;
            printed.clear();
            last_day = None;
        }
        if let Some(root) = &view.thread_root {
            if printed.insert((root.id, root.edited, root.reactions.len(), 0)) {
                println!("-- thread: {}: {} --", root.username, root.text);
            }
        }

        for group in partition(&view.messages, Utc::now(), &Local) {
            for message in &group.messages {
                let replies = view.reply_counts.get(&message.id).copied().unwrap_or(0);
                if !printed.insert((message.id, message.edited, message.reactions.len(), replies)) {
                    continue;
                }
                if last_day != Some(group.date) {
                    println!("---- {} ----", group.label);
                    last_day = Some(group.date);
                }
                let index = view
                    .messages
                    .iter()
                    .position(|m| m.id == message.id)
                    .map_or(0, |i| i + 1);
                println!("{}", format_line(&sync, index, message, replies));
            }
        }
    }
}

fn format_line(sync: &Session, index: usize, message: &Message, replies: usize) -> String {
    let mut out = format!(
        "[{}] {} {}: {}",
        index,
        message.timestamp.with_timezone(&Local).format("%H:%M"),
        message.username,
        message.text
    );
    if message.edited {
        out.push_str(" (edited)");
    }
    for group in sync.grouped_reactions(message) {
        out.push_str(&format!("  {} {}", group.emoji, group.count));
    }
    if replies > 0 {
        out.push_str(&format!("  [{} replies]", replies));
    }
    out
}
