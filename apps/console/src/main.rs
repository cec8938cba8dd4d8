use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, Result};
use clap::Parser;
use client_core::{
    load_settings, ConnectionState, ConversationSync, HttpConversationApi, ImageUpload,
    StaticTokenProvider, SyncEvent, TokenProvider, WsPushConnector,
};
use shared::domain::{ConversationContext, Direction, Message};
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;
use tracing_subscriber::EnvFilter;

/// Follows one conversation and prints its messages as they change.
#[derive(Parser, Debug)]
struct Args {
    /// Base URL of the messaging REST API.
    #[arg(long)]
    api_url: String,
    /// Push channel endpoint (http(s) or ws(s)).
    #[arg(long)]
    push_url: String,
    #[arg(long)]
    token: String,
    #[arg(long)]
    account: String,
    #[arg(long)]
    peer: String,
    #[arg(long)]
    conversation: String,
    /// Optional TOML settings file.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Text to send once the conversation is selected.
    #[arg(long)]
    send: Option<String>,
    /// Image file to send once the conversation is selected.
    #[arg(long)]
    image: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let args = Args::parse();

    let settings = load_settings(args.config.as_deref())?;
    let tokens: Arc<dyn TokenProvider> = Arc::new(StaticTokenProvider::new(args.token));
    let api = Arc::new(HttpConversationApi::new(
        args.api_url,
        Arc::clone(&tokens),
        settings.request_timeout(),
    )?);
    let connector = Arc::new(WsPushConnector::new(args.push_url));
    let sync = ConversationSync::new(api, connector, tokens, settings);
    let mut events = sync.subscribe_events();

    sync.set_context(ConversationContext::new(
        args.account,
        args.peer,
        args.conversation,
    ))
    .await;

    if let Some(text) = args.send.as_deref() {
        if let Err(err) = sync.send_text(text).await {
            eprintln!("send failed: {err}");
        }
    }
    if let Some(path) = args.image.as_ref() {
        let upload = read_image(path)?;
        if let Err(err) = sync.send_image(upload).await {
            eprintln!("image send failed: {err}");
        }
    }

    let mut printed = HashSet::new();
    print_new_messages(&sync.messages().await, &mut printed);
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(SyncEvent::MessagesChanged) => {
                    print_new_messages(&sync.messages().await, &mut printed);
                }
                Ok(SyncEvent::ConnectionChanged(state)) => println!("[status] {}", describe(&state)),
                Ok(SyncEvent::Notification(note)) => {
                    println!("[notice] {}", note.title.as_deref().map_or_else(
                        || note.message.clone(),
                        |title| format!("{title}: {}", note.message),
                    ));
                }
                Ok(SyncEvent::ConversationUpdated { account_id, peer_id }) => {
                    println!("[elsewhere] new activity for {account_id}/{peer_id}");
                }
                Ok(SyncEvent::HistoryFailed(reason)) => eprintln!("[history] {reason}"),
                Ok(SyncEvent::Error(reason)) => eprintln!("[error] {reason}"),
                Err(RecvError::Lagged(skipped)) => warn!(skipped, "console: event stream lagged"),
                Err(RecvError::Closed) => break,
            },
        }
    }

    sync.clear_context().await;
    Ok(())
}

fn read_image(path: &Path) -> Result<ImageUpload> {
    let bytes = std::fs::read(path)
        .with_context(|| format!("failed to read image '{}'", path.display()))?;
    let filename = path
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "image".to_string());
    let mime_type = match path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .as_deref()
    {
        Some("jpg" | "jpeg") => Some("image/jpeg".to_string()),
        Some("png") => Some("image/png".to_string()),
        Some("gif") => Some("image/gif".to_string()),
        Some("webp") => Some("image/webp".to_string()),
        _ => None,
    };
    Ok(ImageUpload {
        filename,
        mime_type,
        bytes,
    })
}

fn print_new_messages(messages: &[Message], printed: &mut HashSet<String>) {
    for message in messages {
        if !printed.insert(message.id.clone()) {
            continue;
        }
        let arrow = match message.direction {
            Direction::In => "<-",
            Direction::Out => "->",
        };
        let marker = if message.is_provisional() {
            " (sending)"
        } else if message.is_error_notice() {
            " (!)"
        } else {
            ""
        };
        let body = match (&message.text, &message.attachment) {
            (Some(text), _) => text.clone(),
            (None, Some(attachment)) => format!("[photo] {}", attachment.url),
            (None, None) => String::new(),
        };
        println!(
            "{} {arrow} {body}{marker}",
            message.timestamp.format("%Y-%m-%d %H:%M:%S")
        );
    }
}

fn describe(state: &ConnectionState) -> String {
    let mode = if state.is_live {
        "live"
    } else if state.is_polling {
        "polling"
    } else {
        "offline"
    };
    match &state.last_error {
        Some(err) => format!("{mode} ({:?}), last error: {err}", state.channel),
        None => format!("{mode} ({:?})", state.channel),
    }
}
