use std::path::PathBuf;

use clap::{Parser, Subcommand};
use clap_complete::Shell;

use crate::config::AppEnv;
use crate::providers::Provider;

#[derive(Parser)]
#[command(name = "chat-relay")]
#[command(version)]
#[command(about = "Streams model answers to chat clients over Server-Sent Events")]
pub struct Args {
    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand)]
pub enum Command {
    /// Run the relay server
    Serve(ServeArgs),
    /// Ask a running relay server a question and stream the answer
    Ask(AskArgs),
    /// Print shell completions
    Completions {
        #[arg(value_enum)]
        shell: Shell,
    },
}

/// Server flags. Unset flags fall back to the config file, then defaults.
#[derive(clap::Args, Debug, Default)]
pub struct ServeArgs {
    /// TOML config file
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Interface to bind
    #[arg(long)]
    pub host: Option<String>,

    /// Port to listen on [default: 8000]
    #[arg(long, short)]
    pub port: Option<u16>,

    /// Generation backend [default: mock]
    #[arg(long, value_enum)]
    pub provider: Option<Provider>,

    /// Model name (defaults per provider)
    #[arg(long)]
    pub model: Option<String>,

    /// Output token cap per answer [default: 100]
    #[arg(long)]
    pub max_tokens: Option<u32>,

    /// Deployment environment; `prod` issues Secure, SameSite=None cookies
    #[arg(long = "env", env = "APP_ENV", value_enum)]
    pub app_env: Option<AppEnv>,

    /// Origin allowed to call the API with credentials (repeatable)
    #[arg(long = "allowed-origin")]
    pub allowed_origins: Vec<String>,

    /// Pause after START_THINKING before generating [default: 1000]
    #[arg(long)]
    pub think_delay_ms: Option<u64>,

    /// Abandon a generation after this long without a fragment [default: 30]
    #[arg(long)]
    pub idle_timeout_secs: Option<u64>,

    /// Token budget for history sent to the model
    #[arg(long)]
    pub max_context_tokens: Option<usize>,

    /// Delay between words for the mock provider [default: 100]
    #[arg(long)]
    pub mock_word_delay_ms: Option<u64>,
}

#[derive(clap::Args, Debug)]
pub struct AskArgs {
    /// Question to ask
    pub question: String,

    /// Relay server base URL
    #[arg(long, default_value = "http://localhost:8000")]
    pub server: String,
}
