use crate::config::Config;
use crate::session::Session;
use crate::state::{Notice, NoticeLevel};
use crate::sync::LoopKind;
use crate::types::{relative_time, Chat, ChatState, Message, Sender};
use chrono::Utc;
use colored::*;
use std::time::Duration;

/// Upper bound on waiting for the first poll result of a one-shot command
const FETCH_TIMEOUT: Duration = Duration::from_secs(15);

/// Shared CLI implementation for the `hushline` binary.
pub async fn run(args: Vec<String>) -> anyhow::Result<()> {
    let bin = args
        .first()
        .map(|s| s.as_str())
        .unwrap_or("hushline")
        .to_string();

    let (config, rest) = Config::from_args(args.get(1..).unwrap_or_default())
        .map_err(|e| anyhow::anyhow!("Configuration error: {}", e))?;

    let Some(command) = rest.first().cloned() else {
        print_usage(&bin);
        return Ok(());
    };

    let mut session = Session::connect(config)?;
    if let Err(e) = session.start().await {
        eprintln!("{} Could not resolve identity: {}", "✗".red().bold(), e);
        eprintln!("  Is the server at {} running?", session.config().server_url.cyan());
        std::process::exit(1);
    }

    match command.as_str() {
        "whoami" => whoami(&session),
        "create" => create(&mut session).await?,
        "join" => {
            let Some(code) = rest.get(1) else {
                eprintln!("{}", format!("Usage: {} join <code>", bin).yellow());
                return Ok(());
            };
            join(&mut session, code).await?;
        }
        "chats" => {
            let query = rest[1..].join(" ");
            chats(&mut session, &query).await?;
        }
        "messages" => {
            let Some(chat_id) = parse_chat_id(&rest, &bin, "messages <chat_id>") else {
                return Ok(());
            };
            messages(&mut session, chat_id).await?;
        }
        "send" => {
            let Some(chat_id) = parse_chat_id(&rest, &bin, "send <chat_id> <message>") else {
                return Ok(());
            };
            let text = rest[2..].join(" ");
            send(&mut session, chat_id, &text).await?;
        }
        "watch" => {
            let Some(chat_id) = parse_chat_id(&rest, &bin, "watch <chat_id>") else {
                return Ok(());
            };
            watch(&mut session, chat_id).await?;
        }
        _ => {
            eprintln!("{} Unknown command: {}", "✗".red().bold(), command.red());
            print_usage(&bin);
        }
    }

    Ok(())
}

fn print_usage(bin: &str) {
    println!("{}", "🤫 Hushline".bright_cyan().bold());
    println!();
    println!("{}", "Usage:".bright_white().bold());
    println!("  {} [--server <url>] [--data-dir <path>] <command> [args]", bin.cyan());
    println!();
    println!("{}", "Commands:".bright_white().bold());
    println!("  {}                        Show your anonymous identity", "whoami".cyan());
    println!("  {}                        Create a chat and print its invite code", "create".cyan());
    println!("  {} <code>                   Join a chat by invite code", "join".cyan());
    println!("  {} [search]                List your chats", "chats".cyan());
    println!("  {} <chat_id>            Show a chat's messages", "messages".cyan());
    println!("  {} <chat_id> <message>      Send a message", "send".cyan());
    println!("  {} <chat_id>               Follow a chat live (Ctrl+C to stop)", "watch".cyan());
}

fn parse_chat_id(rest: &[String], bin: &str, usage: &str) -> Option<u64> {
    match rest.get(1).map(|s| s.parse::<u64>()) {
        Some(Ok(id)) => Some(id),
        _ => {
            eprintln!("{}", format!("Usage: {} {}", bin, usage).yellow());
            None
        }
    }
}

fn whoami(session: &Session) {
    if let Some(identity) = session.state().identity() {
        println!("{}", "Identity:".bright_white().bold());
        println!("{:-<60}", "");
        println!("  Name:   {}", identity.display_name.bright_white());
        println!("  ID:     {}", identity.id.to_string().cyan());
        println!("  Avatar: {}", identity.avatar_code);
        println!("  Stored: {}", session.config().data_dir.display());
    }
}

async fn create(session: &mut Session) -> anyhow::Result<()> {
    match session.create_chat().await {
        Ok(chat) => {
            println!("{} Chat {} created", "✓".green(), chat.id.to_string().cyan());
            println!("  Share this code: {}", chat.chat_code.bright_yellow().bold());
        }
        Err(_) => print_notices(session),
    }
    Ok(())
}

async fn join(session: &mut Session, code: &str) -> anyhow::Result<()> {
    match session.join_chat(code).await {
        Ok(chat) => {
            println!(
                "{} Joined chat {} with {}",
                "✓".green(),
                chat.id.to_string().cyan(),
                chat.name.bright_white()
            );
        }
        Err(_) => print_notices(session),
    }
    Ok(())
}

async fn chats(session: &mut Session, query: &str) -> anyhow::Result<()> {
    session.set_search_query(query);
    fetch(session, LoopKind::ChatList).await?;

    let chats = session.state().filtered_chats();
    if chats.is_empty() {
        println!("No chats found");
        return Ok(());
    }
    println!(
        "Chats ({}, {} unread):",
        chats.len(),
        session.state().total_unread()
    );
    println!("{:-<60}", "");
    let now = Utc::now();
    for chat in chats {
        print_chat(chat, now);
    }
    Ok(())
}

async fn messages(session: &mut Session, chat_id: u64) -> anyhow::Result<()> {
    session.select_chat(Some(chat_id));
    fetch(session, LoopKind::Messages).await?;

    let thread = session.state().active_thread();
    if thread.is_empty() {
        println!("No messages yet");
    }
    for message in thread {
        print_message(message);
    }
    Ok(())
}

async fn send(session: &mut Session, chat_id: u64, text: &str) -> anyhow::Result<()> {
    if text.trim().is_empty() {
        eprintln!("{}", "Nothing to send".yellow());
        return Ok(());
    }
    session.select_chat(Some(chat_id));
    match session.send(text).await {
        Ok(()) => println!("{} Message sent!", "✓".green()),
        Err(_) => {
            print_notices(session);
            std::process::exit(1);
        }
    }
    Ok(())
}

async fn watch(session: &mut Session, chat_id: u64) -> anyhow::Result<()> {
    session.select_chat(Some(chat_id));
    println!(
        "{} Watching chat {} (Ctrl+C to stop)",
        "👀".bright_cyan(),
        chat_id.to_string().cyan()
    );

    let mut last_shown: Option<u64> = None;
    loop {
        tokio::select! {
            update = session.next_update() => {
                if update == Some(LoopKind::Messages) {
                    for message in session.state().active_thread() {
                        if last_shown.map_or(true, |id| message.id > id) {
                            print_message(message);
                            last_shown = Some(message.id);
                        }
                    }
                }
                print_notices(session);
            }
            _ = tokio::signal::ctrl_c() => {
                println!();
                break;
            }
        }
    }
    session.sign_out();
    Ok(())
}

/// Wait for one result from `kind`, failing if it errored or never came
async fn fetch(session: &mut Session, kind: LoopKind) -> anyhow::Result<()> {
    tokio::time::timeout(FETCH_TIMEOUT, session.wait_for(kind))
        .await
        .map_err(|_| anyhow::anyhow!("Timed out waiting for the server"))?;
    if session.state().consecutive_failures(kind) > 0 {
        anyhow::bail!("Server is not answering");
    }
    Ok(())
}

fn print_notices(session: &mut Session) {
    for Notice { level, text } in session.take_notices() {
        match level {
            NoticeLevel::Info => eprintln!("{} {}", "ℹ".bright_blue(), text),
            NoticeLevel::Error => eprintln!("{} {}", "✗".red().bold(), text.red()),
        }
    }
}

fn print_chat(chat: &Chat, now: chrono::DateTime<Utc>) {
    let presence = if chat.online {
        "●".green()
    } else {
        "○".dimmed()
    };
    let unread = if chat.unread_count > 0 {
        format!(" ({})", chat.unread_count).bright_yellow().bold()
    } else {
        "".normal()
    };
    let state = match chat.state {
        ChatState::Pending => format!(" [waiting, code {}]", chat.chat_code).yellow(),
        ChatState::Active => "".normal(),
    };
    println!(
        "  {} {} {}{}{}  {}",
        presence,
        chat.id.to_string().cyan(),
        chat.name.bright_white(),
        unread,
        state,
        relative_time(chat.last_activity_at, now).dimmed()
    );
    if let Some(last) = &chat.last_message {
        println!("      {}", last.dimmed());
    }
}

fn print_message(message: &Message) {
    let who = match message.sender {
        Sender::Me => "You".green().bold(),
        Sender::Other => message.author.name.bright_magenta().bold(),
    };
    println!(
        "  [{}] {}: {}",
        message.created_at.format("%H:%M").to_string().dimmed(),
        who,
        message.content
    );
}
