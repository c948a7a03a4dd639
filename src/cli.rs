use clap::{Parser, Subcommand};

/// Streaming chat client
#[derive(Debug, Parser)]
#[command(name = "wizard")]
#[command(version)]
#[command(about = "Chat with an LLM backend and watch the reply stream in", long_about = None)]
pub struct Args {
    /// Backend URL (default: $WIZARD_ENDPOINT, config endpoint, or localhost)
    #[arg(long = "endpoint", value_name = "URL")]
    pub endpoint: Option<String>,

    /// Backend kind: "http" or "stub" (default: config backend or "http")
    #[arg(long = "backend")]
    pub backend: Option<String>,

    /// Neither restore nor save the conversation
    #[arg(long = "no-history")]
    pub no_history: bool,

    #[command(subcommand)]
    pub cmd: Option<Command>,

    /// Message to send (used when no subcommand is given)
    #[arg(value_name = "PROMPT")]
    pub prompt: Vec<String>,
}

#[derive(Debug, Subcommand)]
pub enum Command {
    /// Print the saved conversation
    History,

    /// Delete the saved conversation
    Reset,

    /// Run an interactive terminal chat UI
    #[cfg(feature = "tui")]
    Tui,
}
