use std::collections::HashSet;

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ChatClient, Conversation, EventKind, PushEvent, SendOutcome, TimelineEntry,
};
use shared::domain::{Identity, Role, TempId, UserId};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_stream::{wrappers::WatchStream, StreamExt};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// Terminal chat with one counterpart.
#[derive(Parser, Debug)]
struct Args {
    #[arg(long, env = "CARE_CHAT_SERVER_URL")]
    server_url: Option<String>,
    #[arg(long, env = "CARE_CHAT_CACHE_DATABASE_URL")]
    cache_database_url: Option<String>,
    #[arg(long)]
    user_id: String,
    #[arg(long, default_value = "")]
    name: String,
    #[arg(long, default_value = "patient", value_parser = parse_role)]
    role: Role,
    #[arg(long, env = "CARE_CHAT_TOKEN", hide_env_values = true)]
    token: Option<String>,
    /// User id of the other participant.
    #[arg(long)]
    counterpart: String,
    #[arg(long)]
    history_limit: Option<u32>,
}

fn parse_role(raw: &str) -> std::result::Result<Role, String> {
    serde_json::from_value(serde_json::Value::String(raw.to_ascii_lowercase()))
        .map_err(|_| format!("unknown role '{raw}', expected patient, doctor or admin"))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let mut settings = load_settings();
    if let Some(server_url) = args.server_url {
        settings.server_url = server_url;
    }
    if let Some(cache_database_url) = args.cache_database_url {
        settings.cache_database_url = cache_database_url;
    }
    if let Some(history_limit) = args.history_limit {
        settings.history_limit = history_limit;
    }

    let name = if args.name.is_empty() {
        args.user_id.clone()
    } else {
        args.name
    };
    let mut identity = Identity::new(args.user_id, name, args.role);
    if let Some(token) = args.token {
        identity = identity.with_token(token);
    }

    info!(server_url = %settings.server_url, user_id = %identity.user_id, "desktop: starting");
    let client = ChatClient::initialize(settings, identity).await;
    let counterpart = UserId::new(args.counterpart);
    let conversation = client
        .open_conversation(&counterpart)
        .await
        .with_context(|| format!("failed to open conversation with {counterpart}"))?;
    println!(
        "conversation {} with {} (type a message, /retry, /read or /quit)",
        conversation.session_id(),
        counterpart
    );

    let me = client.identity().user_id.clone();
    let _typing = client.connection().subscribe(EventKind::Typing, {
        let session_id = conversation.session_id().clone();
        move |event| {
            if let PushEvent::Typing(signal) = event {
                if signal.session_id == session_id && signal.user_id != me {
                    println!("  ({} is typing)", signal.user_id);
                }
            }
        }
    });

    let result = run(&conversation).await;
    conversation.close();
    client.connection().disconnect();
    result
}

/// One line of stdin. Whole lines are sent as messages; typing signals are
/// not emitted from this line-oriented client.
#[derive(Debug, PartialEq, Eq)]
enum Command {
    Empty,
    Quit,
    Read,
    Retry,
    Send(String),
}

impl Command {
    fn parse(line: &str) -> Self {
        match line.trim() {
            "" => Command::Empty,
            "/quit" => Command::Quit,
            "/read" => Command::Read,
            "/retry" => Command::Retry,
            text => Command::Send(text.to_string()),
        }
    }
}

async fn run(conversation: &Conversation) -> Result<()> {
    let mut printed = HashSet::new();
    let mut last_failed: Option<TempId> = None;
    render_new(conversation, &mut printed, &mut last_failed);

    let mut changes = WatchStream::from_changes(conversation.changes());
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line.context("failed to read stdin")? else { break };
                match Command::parse(&line) {
                    Command::Empty => {}
                    Command::Quit => break,
                    Command::Read => match conversation.mark_read() {
                        Ok(count) => println!("  marked {count} message(s) read"),
                        Err(err) => warn!(error = %err, "desktop: mark read failed"),
                    },
                    Command::Retry => match last_failed.take() {
                        Some(temp_id) => report(conversation.retry(temp_id)),
                        None => println!("  nothing to retry"),
                    },
                    Command::Send(text) => report(conversation.send(text)),
                }
            }
            Some(_) = changes.next() => render_new(conversation, &mut printed, &mut last_failed),
            _ = tokio::signal::ctrl_c() => break,
        }
    }
    Ok(())
}

fn report(send: client_core::ChatResult<client_core::PendingSend>) {
    let pending = match send {
        Ok(pending) => pending,
        Err(err) => {
            println!("  not sent: {err}");
            return;
        }
    };
    tokio::spawn(async move {
        if let Ok(SendOutcome::Failed(err)) = pending.task.await {
            println!("  send failed ({err}), /retry to try again");
        }
    });
}

fn render_new(
    conversation: &Conversation,
    printed: &mut HashSet<String>,
    last_failed: &mut Option<TempId>,
) {
    for entry in conversation.timeline() {
        let key = match &entry {
            TimelineEntry::Confirmed(message) => message.id.to_string(),
            TimelineEntry::Pending(_) => continue,
            TimelineEntry::Failed(local) => {
                *last_failed = Some(local.temp_id);
                local.temp_id.to_string()
            }
        };
        if !printed.insert(key) {
            continue;
        }
        let sender = entry.sender();
        let who = if sender.name.is_empty() {
            sender.id.as_str()
        } else {
            sender.name.as_str()
        };
        let time = entry.sort_key().format("%Y-%m-%d %H:%M");
        let marker = match &entry {
            TimelineEntry::Failed(_) => " [failed]",
            _ => "",
        };
        println!("[{time}] {who}: {}{marker}", entry.content());
        for attachment in entry.attachments() {
            println!("    attachment {} ({} bytes) {}", attachment.name, attachment.size, attachment.url);
        }
    }
}

#[cfg(test)]
#[path = "tests/main_tests.rs"]
mod tests;
