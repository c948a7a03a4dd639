mod app;
mod backend;
mod cli;
mod config;
mod conversation;
mod paths;
mod session;
mod store;
mod stream;

#[cfg(feature = "tui")]
mod tui;

use anyhow::Context;
use clap::Parser;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "warn".into()),
        )
        .init();

    let args = cli::Args::parse();

    let config_path = paths::config_file()?;
    let cfg = config::Config::load_optional(&config_path)?;
    tracing::debug!(?config_path, ?cfg, "resolved config");

    let settings = app::resolve(&args, cfg.as_ref())?;

    match args.cmd {
        Some(cli::Command::History) => return app::cmd_history(&settings),
        Some(cli::Command::Reset) => return app::cmd_reset(&settings),
        #[cfg(feature = "tui")]
        Some(cli::Command::Tui) => {
            let http = http_client()?;
            let session = app::build_session(&http, &settings)?;
            return tui::run_tui(session).await;
        }
        None => {}
    }

    let prompt = args.prompt.join(" ");
    if prompt.trim().is_empty() {
        anyhow::bail!("No prompt provided. Try: wizard \"why does this segfault?\"");
    }

    let http = http_client()?;
    let session = app::build_session(&http, &settings)?;
    app::cmd_prompt(session, &prompt).await
}

fn http_client() -> anyhow::Result<reqwest::Client> {
    reqwest::Client::builder()
        .user_agent(concat!(env!("CARGO_PKG_NAME"), "/", env!("CARGO_PKG_VERSION")))
        .build()
        .context("failed to build HTTP client")
}
