use std::io::Write;
use std::sync::Arc;

use chat_relay::cli::{Args, AskArgs, Command, ServeArgs};
use chat_relay::config::Settings;
use chat_relay::events::StreamEvent;
use chat_relay::providers::build_generator;
use chat_relay::transport::{ChatClient, ChatSession};
use chat_relay::web::{self, AppState};
use chat_relay::{ConversationStore, Relay};
use clap::{CommandFactory, Parser};
use colored::*;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("chat_relay=info"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

async fn serve(args: ServeArgs) -> Result<(), Box<dyn std::error::Error>> {
    let whitelist = std::env::var("WHITELIST_DOMAINS").ok();
    let settings = Settings::resolve(&args, whitelist.as_deref())?;

    let generator = build_generator(
        settings.provider,
        settings.generation_params(),
        settings.mock_word_delay,
    )?;
    let relay = Relay::new(
        Arc::new(ConversationStore::new()),
        generator,
        settings.relay_config(),
    );
    let state = Arc::new(AppState {
        relay,
        config: settings.server_config(),
    });

    let listener = TcpListener::bind(settings.addr()).await?;
    let local = listener.local_addr()?;

    eprintln!("{}", "=".repeat(50).bright_blue());
    eprintln!("{}", "  CHAT RELAY".bright_cyan().bold());
    eprintln!(
        "  {}: {} ({})",
        "Provider".bright_yellow(),
        settings.provider.to_string().bright_white(),
        settings.model
    );
    eprintln!("  {}: {}", "Environment".bright_yellow(), settings.env);
    eprintln!(
        "  {}: {}",
        "Allowed origins".bright_yellow(),
        settings.allowed_origins.join(", ")
    );
    eprintln!(
        "{}",
        format!("  Listening on http://{}", local).bright_green()
    );
    eprintln!("{}", "  Press Ctrl+C to stop.".bright_blue());
    eprintln!("{}", "=".repeat(50).bright_blue());

    info!(addr = %local, provider = %settings.provider, model = %settings.model, "relay listening");
    web::serve(listener, state).await?;
    Ok(())
}

async fn ask(args: AskArgs) -> Result<(), Box<dyn std::error::Error>> {
    let mut session = ChatSession::new(ChatClient::new(&args.server)?);
    session.ask(&args.question)?;

    let mut stdout = std::io::stdout();
    while let Some(event) = session.next_event().await? {
        match event {
            StreamEvent::ThinkingStarted => eprintln!("{}", "Thinking...".bright_magenta()),
            StreamEvent::Fragment(text) => {
                print!("{}", text.bright_cyan());
                stdout.flush()?;
            }
            StreamEvent::ThinkingStopped => {
                println!();
                break;
            }
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();
    let args = Args::parse();

    match args.command {
        Command::Serve(serve_args) => serve(serve_args).await,
        Command::Ask(ask_args) => ask(ask_args).await,
        Command::Completions { shell } => {
            let mut cmd = Args::command();
            clap_complete::generate(shell, &mut cmd, "chat-relay", &mut std::io::stdout());
            Ok(())
        }
    }
}
