use anyhow::Context;
use clap::{Parser, ValueEnum};
use oralsuite_chat::{
    AlertSink, ChatConfig, ChatEvent, ChatHandle, ChatSession, Credential, HttpChatApi,
    LocalUser, Notification, Role, SendOutcome, ViewStatus, WebSocketConnector,
};
use std::io::{self, Write};
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(author, version, about = "Terminal client for OralSuite chat", long_about = None)]
struct Args {
    /// REST API base URL, including the /api prefix
    #[arg(long, env = "ORALSUITE_API_URL")]
    api_url: Option<String>,

    /// WebSocket endpoint (derived from the API URL when omitted)
    #[arg(long, env = "ORALSUITE_SOCKET_URL")]
    socket_url: Option<String>,

    /// Bearer token of the logged-in account
    #[arg(long, env = "ORALSUITE_TOKEN")]
    token: String,

    /// Id of the logged-in user
    #[arg(long)]
    user_id: String,

    #[arg(long, value_enum, default_value = "dentist")]
    role: RoleArg,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum RoleArg {
    Dentist,
    Laboratory,
}

impl From<RoleArg> for Role {
    fn from(role: RoleArg) -> Self {
        match role {
            RoleArg::Dentist => Role::Dentist,
            RoleArg::Laboratory => Role::Laboratory,
        }
    }
}

/// Rings the terminal bell
struct BellSink;

impl AlertSink for BellSink {
    fn alert(&self, _notification: &Notification) {
        print!("\x07");
        io::stdout().flush().ok();
    }
}

fn prompt() {
    print!("> ");
    io::stdout().flush().ok();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .try_init();

    let args = Args::parse();

    let mut config = ChatConfig::from_env();
    if let Some(api_url) = args.api_url {
        config.api_url = api_url;
    }
    if args.socket_url.is_some() {
        config.socket_url = args.socket_url;
    }

    let credential = Credential::new(args.token);
    let api = Arc::new(
        HttpChatApi::new(&config, credential.clone()).context("Failed to create REST client")?,
    );
    let connector =
        Arc::new(WebSocketConnector::new(&config).context("Failed to create realtime connector")?);
    info!("Realtime endpoint: {}", connector.endpoint());

    let local_user = LocalUser::new(args.user_id, args.role.into());
    let (session, chat) = ChatSession::new(
        config,
        local_user.clone(),
        api,
        connector,
        Arc::new(BellSink),
    );
    let session_task = tokio::spawn(session.run());

    let mut events = chat.subscribe();
    chat.connect(Some(credential)).await?;
    list_conversations(&chat, &local_user, true).await;

    println!("Commands: /list, /open <id>, /new <laboratoryId> [orderId], /refresh, /notifications, /read-all, /quit");
    prompt();

    let mut stdin = BufReader::new(tokio::io::stdin());
    let mut line = String::new();

    loop {
        tokio::select! {
            event = events.recv() => {
                let Some(event) = event else { break };
                if print_event(event) {
                    prompt();
                }
            }

            read = stdin.read_line(&mut line) => {
                if read.context("Failed to read stdin")? == 0 {
                    break;
                }
                let input = line.trim().to_string();
                line.clear();

                if let Some(command) = input.strip_prefix('/') {
                    if !handle_command(command, &chat, &local_user).await {
                        break;
                    }
                } else if !input.is_empty() {
                    chat.typing().await?;
                    match chat.send(input).await {
                        Ok(SendOutcome::Delivered(message)) => {
                            println!("(sent via REST as {})", message.id);
                        }
                        Ok(_) => {}
                        Err(e) => eprintln!("Failed to send message: {}", e.reason()),
                    }
                }
                prompt();
            }
        }
    }

    chat.shutdown().await.ok();
    session_task.await.ok();
    Ok(())
}

/// Returns false when the client should exit
async fn handle_command(command: &str, chat: &ChatHandle, user: &LocalUser) -> bool {
    let parts: Vec<&str> = command.split_whitespace().collect();

    match parts.first() {
        Some(&"list") => list_conversations(chat, user, false).await,
        Some(&"refresh") => list_conversations(chat, user, true).await,
        Some(&"open") => match parts.get(1) {
            Some(id) => {
                if let Err(e) = chat.open(*id).await {
                    eprintln!("Failed to open conversation: {}", e);
                }
            }
            None => println!("Usage: /open <conversationId>"),
        },
        Some(&"new") => match parts.get(1) {
            Some(laboratory_id) => {
                let order_id = parts.get(2).map(|s| s.to_string());
                match chat.create_conversation(*laboratory_id, order_id).await {
                    Ok(conversation) => {
                        println!("Conversation {} ready", conversation.id);
                        chat.open(conversation.id).await.ok();
                    }
                    Err(e) => eprintln!("Failed to create conversation: {}", e.reason()),
                }
            }
            None => println!("Usage: /new <laboratoryId> [orderId]"),
        },
        Some(&"notifications") => match chat.notifications().await {
            Ok(notifications) if notifications.is_empty() => println!("No notifications"),
            Ok(notifications) => {
                for n in notifications {
                    let marker = if n.read { " " } else { "*" };
                    println!("{} {} {}: {}", marker, n.timestamp.format("%H:%M"), n.title, n.message);
                }
            }
            Err(e) => eprintln!("Failed to list notifications: {}", e),
        },
        Some(&"read-all") => {
            chat.mark_all_notifications_read().await.ok();
        }
        Some(&"quit") | Some(&"exit") => return false,
        _ => println!("Unknown command: /{}", command),
    }
    true
}

async fn list_conversations(chat: &ChatHandle, user: &LocalUser, refresh: bool) {
    let result = if refresh {
        chat.refresh_conversations().await
    } else {
        chat.conversations().await
    };

    match result {
        Ok(conversations) if conversations.is_empty() => println!("No conversations"),
        Ok(conversations) => {
            let unread = chat
                .snapshot()
                .await
                .map(|s| s.unread)
                .unwrap_or_default();
            for c in conversations {
                let count = unread.get(&c.id).copied().unwrap_or(0);
                let order = c.order_id.as_deref().unwrap_or("general");
                println!(
                    "  {} [{}] with {}{}",
                    c.id,
                    order,
                    c.counterpart(user),
                    if count > 0 { format!(" ({} unread)", count) } else { String::new() }
                );
            }
        }
        Err(e) => eprintln!("Failed to load conversations: {}", e.reason()),
    }
}

/// Print an engine event; returns whether anything was printed
fn print_event(event: ChatEvent) -> bool {
    match event {
        ChatEvent::ConnectionChanged { connected: true } => println!("\n✓ Connected"),
        ChatEvent::ConnectionChanged { connected: false } => println!("\n✗ Disconnected"),
        ChatEvent::ConnectionFailed {
            reason,
            unauthorized: true,
        } => eprintln!("\nRealtime login refused ({}); messages go over REST", reason),
        ChatEvent::ConnectionFailed { reason, .. } => eprintln!("\nConnection failed: {}", reason),
        ChatEvent::CredentialRejected { reason } => {
            eprintln!("\nSession expired, log in again: {}", reason)
        }
        ChatEvent::MessageAppended { message, .. } => {
            println!(
                "\n[{} {}] {}",
                message.created_at.format("%H:%M"),
                message.sender_name(),
                message.content
            );
        }
        ChatEvent::ViewChanged {
            conversation_id: Some(id),
            status: Some(ViewStatus::Ready),
        } => println!("\n-- {} --", id),
        ChatEvent::ViewChanged {
            status: Some(ViewStatus::Error(reason)),
            ..
        } => eprintln!("\nFailed to load messages: {}", reason),
        ChatEvent::TypingChanged { user_ids, .. } if !user_ids.is_empty() => {
            println!("\n{} typing...", user_ids.join(", "));
        }
        ChatEvent::Notification(n) => println!("\n* {}: {}", n.title, n.message),
        _ => return false,
    }
    true
}
