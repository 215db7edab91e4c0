use crate::config::Config;
use crate::inbox::Inbox;
use crate::messenger_types::{ConversationEntry, InboxEvent, Message, MessageKind};
use crate::services::Services;
use crate::session::Session;
use colored::*;
use tracing::debug;

const PREVIEW_CHARS: usize = 48;

/// Command line entry point for the `studyhub` binary.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("studyhub")
        .to_string();

    let (config, rest) = Config::from_args(&args)
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first().cloned() else {
        print_usage(&bin);
        return Ok(());
    };
    if command == "help" {
        print_usage(&bin);
        return Ok(());
    }

    let services = Services::from_config(&config)?;
    let session = services.session();
    let viewer = resolve_viewer(&services, &session, &config).await?;
    let inbox = services.inbox(&viewer);

    match command.as_str() {
        "inbox" => show_inbox(&inbox).await?,
        "thread" => {
            let Some(counterparty) = rest.get(1) else {
                eprintln!("{}", format!("Usage: {} thread <user_id>", bin).yellow());
                return Ok(());
            };
            show_thread(&inbox, counterparty).await?;
        }
        "send" => {
            if rest.len() < 3 {
                eprintln!("{}", format!("Usage: {} send <user_id> <message>", bin).yellow());
                return Ok(());
            }
            let sent = inbox.send_text(&rest[1], &rest[2..].join(" ")).await?;
            println!("{} Message sent! ID: {}", "✓".green().bold(), sent.id.cyan());
        }
        "read" => {
            let Some(counterparty) = rest.get(1) else {
                eprintln!("{}", format!("Usage: {} read <user_id>", bin).yellow());
                return Ok(());
            };
            let affected = inbox.mark_conversation_read(counterparty).await?;
            println!(
                "{} Marked {} message(s) from {} as read",
                "✓".green().bold(),
                affected.to_string().cyan(),
                counterparty.cyan()
            );
        }
        "unread" => {
            let total = inbox.unread_count().await?;
            println!("{} unread", total.to_string().bright_white().bold());
        }
        "watch" => watch(&services, &inbox).await?,
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

/// Demo mode views as `--as` (or the demo user). Against the backend the
/// restored session comes first, then configured credentials, then `--as`
/// read through the anon key.
async fn resolve_viewer(services: &Services, session: &Session, config: &Config) -> anyhow::Result<String> {
    if services.is_demo() {
        return Ok(config.demo_viewer());
    }
    if let Some(user) = session.init().await {
        return Ok(user.id);
    }
    if let (Some(email), Some(password)) = (&config.email, &config.password) {
        let user = session.sign_in(email, password).await?;
        eprintln!("{} Signed in as {}", "✓".green(), user.name.cyan());
        return Ok(user.id);
    }
    if let Some(viewer) = config.viewer_id.as_deref().filter(|v| !v.trim().is_empty()) {
        debug!("No session; reading as {} with the anon key", viewer);
        return Ok(viewer.to_string());
    }
    anyhow::bail!("not signed in: set STUDYHUB_EMAIL and STUDYHUB_PASSWORD, or pass --as <user_id>")
}

fn print_usage(bin: &str) {
    println!("{}", "📚 StudyHub Messages".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [options] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                       List conversations", "inbox".cyan());
    println!("  {} <user_id>            Show the thread with a user", "thread".cyan());
    println!("  {} <user_id> <message>    Send a text message", "send".cyan());
    println!("  {} <user_id>              Mark a conversation as read", "read".cyan());
    println!("  {}                      Print the unread total", "unread".cyan());
    println!("  {}                       Follow incoming messages", "watch".cyan());
    println!();
    println!("{}", "Options:".bright_white().bold());
    println!("  {} <url>        Backend project URL", "--backend-url".cyan());
    println!("  {} <key>           Backend anon key", "--anon-key".cyan());
    println!("  {} <user_id>             View as this user", "--as".cyan());
    println!("  {}                    Use the built-in demo data", "--demo".cyan());
}

fn preview(message: &Message) -> String {
    let body: String = message.body.chars().take(PREVIEW_CHARS).collect();
    let body = if message.body.chars().count() > PREVIEW_CHARS {
        format!("{}…", body)
    } else {
        body
    };
    match message.kind {
        MessageKind::LinkedAssignment => format!("[assignment] {}", body),
        MessageKind::LinkedService => format!("[service] {}", body),
        MessageKind::File => format!("[file] {}", body),
        MessageKind::Text => body,
    }
}

fn conversation_line(entry: &ConversationEntry) -> String {
    let c = &entry.conversation;
    let badge = if c.unread_count > 0 {
        format!(" ({})", c.unread_count).bright_yellow().bold().to_string()
    } else {
        String::new()
    };
    format!(
        "  {}{} {} {}\n    {}",
        entry.display_name.bright_white().bold(),
        badge,
        c.counterparty_id.dimmed(),
        c.last_message.created_at.format("%b %d %H:%M").to_string().dimmed(),
        preview(&c.last_message)
    )
}

async fn show_inbox(inbox: &Inbox) -> anyhow::Result<()> {
    let refreshed = inbox.refresh().await;
    if let Some(e) = refreshed.stale {
        return Err(e.into());
    }
    let view = refreshed.view;
    if view.conversations.is_empty() {
        println!("{}", "No conversations yet".yellow());
        return Ok(());
    }
    println!(
        "{}",
        format!("Conversations ({}, {} unread)", view.conversations.len(), view.unread_total)
            .bright_cyan()
            .bold()
    );
    println!("{}", "─".repeat(60).dimmed());
    for entry in &view.conversations {
        println!("{}", conversation_line(entry));
    }
    Ok(())
}

async fn show_thread(inbox: &Inbox, counterparty: &str) -> anyhow::Result<()> {
    let thread = inbox.thread(counterparty).await?;
    if thread.is_empty() {
        println!("{}", format!("No messages with {}", counterparty).yellow());
        return Ok(());
    }
    for m in &thread {
        let who = if m.sender_id == inbox.viewer_id() {
            "you".green()
        } else {
            m.sender_id.as_str().cyan()
        };
        let marker = if m.is_unread_for(inbox.viewer_id()) { "●".bright_yellow() } else { " ".normal() };
        println!(
            "{} {} {}: {}",
            marker,
            m.created_at.format("%b %d %H:%M").to_string().dimmed(),
            who,
            preview(m)
        );
    }
    Ok(())
}

async fn watch(services: &Services, inbox: &Inbox) -> anyhow::Result<()> {
    if services.is_demo() {
        println!("{}", "Demo mode has no live delivery; showing the current inbox".yellow());
    }
    let mut events = inbox.events();
    show_inbox(inbox).await?;
    let subscription = inbox.watch(&services.notifier).await?;
    println!("{}", "Watching for messages (Ctrl-C to stop)".dimmed());

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(InboxEvent::NewMessage { message }) => {
                    println!("{} {}: {}", "→".bright_green(), message.sender_id.cyan(), preview(&message));
                }
                Ok(InboxEvent::Refreshed { unread_total }) => {
                    println!("{}", format!("{} unread", unread_total).dimmed());
                }
                Ok(InboxEvent::Anomaly { id, reason }) => {
                    eprintln!("{} Skipped message {}: {}", "!".yellow(), id, reason);
                }
                Ok(InboxEvent::Degraded { reason }) => {
                    eprintln!("{} Live updates unavailable: {}", "✗".red().bold(), reason.red());
                }
                Ok(InboxEvent::Recovered) => {
                    println!("{}", "✓ Live updates restored".green());
                }
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("Missed {} inbox events", n);
                }
                Err(_) => break,
            }
        }
    }

    subscription.close();
    Ok(())
}
