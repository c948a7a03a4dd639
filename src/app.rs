use crate::backend::{self, Backend, RequestOptions};
use crate::conversation::Conversation;
use crate::session::{Session, TurnOutcome};
use crate::store::{ConversationStore, FileStore, MemoryStore};
use crate::stream::ConversationAssembler;
use crate::{cli, config, paths};
use anyhow::Context;
use std::io::Write;
use std::path::PathBuf;

/// Effective settings after merging flags, environment and config file.
#[derive(Debug, Clone)]
pub struct Settings {
    pub endpoint: String,
    pub backend: String,
    /// None when history is disabled.
    pub history: Option<PathBuf>,
    pub assembler: ConversationAssembler,
    pub options: RequestOptions,
}

pub fn resolve(args: &cli::Args, cfg: Option<&config::Config>) -> anyhow::Result<Settings> {
    let endpoint = args
        .endpoint
        .clone()
        .or_else(|| std::env::var("WIZARD_ENDPOINT").ok())
        .or_else(|| cfg.and_then(|c| c.endpoint.clone()))
        .unwrap_or_else(|| config::DEFAULT_ENDPOINT.to_string());

    let backend = args
        .backend
        .clone()
        .or_else(|| cfg.and_then(|c| c.backend.clone()))
        .unwrap_or_else(|| "http".to_string());

    let history_enabled = !args.no_history && cfg.map_or(true, |c| c.history.enabled);
    let history = if history_enabled {
        match cfg.and_then(|c| c.history.path.clone()) {
            Some(p) => Some(p),
            None => Some(paths::history_file()?),
        }
    } else {
        None
    };

    let assembler = ConversationAssembler::new(cfg.map(|c| c.orphan_delta).unwrap_or_default());
    let options = cfg.map(|c| c.request_options()).unwrap_or_default();

    Ok(Settings {
        endpoint,
        backend,
        history,
        assembler,
        options,
    })
}

pub fn build_backend(
    http: &reqwest::Client,
    settings: &Settings,
) -> anyhow::Result<Box<dyn Backend + Send + Sync>> {
    match settings.backend.as_str() {
        "http" => {
            let b = backend::http::HttpBackend::new(http.clone(), &settings.endpoint)?;
            Ok(Box::new(b))
        }
        "stub" => Ok(Box::new(backend::stub::StubBackend::new())),
        other => anyhow::bail!("unknown backend: {other}"),
    }
}

pub fn build_store(settings: &Settings) -> Box<dyn ConversationStore> {
    match &settings.history {
        Some(path) => Box::new(FileStore::new(path.clone())),
        None => Box::new(MemoryStore::new()),
    }
}

pub fn build_session(http: &reqwest::Client, settings: &Settings) -> anyhow::Result<Session> {
    let backend = build_backend(http, settings)?;
    tracing::debug!(
        backend = backend.name(),
        endpoint = %settings.endpoint,
        orphan_delta = ?settings.assembler.policy(),
        "building session"
    );
    Session::new(
        backend,
        build_store(settings),
        settings.assembler,
        settings.options,
    )
}

/// Send one message and print the reply to stdout as it streams in.
pub async fn cmd_prompt(mut session: Session, prompt: &str) -> anyhow::Result<()> {
    let mut printer = ReplyPrinter::new(session.conversation().len() + 1, std::io::stdout());
    let outcome = session
        .submit(prompt, |conv| printer.render(conv))
        .await
        .context("chat failed")?;
    tracing::debug!(?outcome, state = ?session.state(), "turn finished");

    if outcome != TurnOutcome::Reset {
        println!();
    }
    Ok(())
}

pub fn cmd_history(settings: &Settings) -> anyhow::Result<()> {
    let Some(path) = &settings.history else {
        anyhow::bail!("history is disabled");
    };
    let store = FileStore::new(path.clone());
    let conv = store.load()?;
    if conv.is_empty() {
        println!("(no saved conversation at {})", store.path().display());
        return Ok(());
    }

    let mut out = std::io::stdout();
    write_transcript(&mut out, &conv)?;
    Ok(())
}

/// Works without loading the saved conversation, so an unreadable file can still be cleared.
pub fn cmd_reset(settings: &Settings) -> anyhow::Result<()> {
    let Some(path) = &settings.history else {
        anyhow::bail!("history is disabled");
    };
    build_store(settings).clear()?;
    println!("Cleared {}", path.display());
    Ok(())
}

fn write_transcript(out: &mut dyn Write, conv: &Conversation) -> anyhow::Result<()> {
    for (i, msg) in conv.messages().iter().enumerate() {
        if i > 0 {
            writeln!(out)?;
        }
        writeln!(out, "{}:", msg.role)?;
        writeln!(out, "{}", msg.content)?;
    }
    Ok(())
}

/// Prints only what is new since the previous snapshot, for every message from `first` on.
struct ReplyPrinter<W: Write> {
    first: usize,
    printed: Vec<usize>,
    out: W,
}

impl<W: Write> ReplyPrinter<W> {
    fn new(first: usize, out: W) -> Self {
        Self {
            first,
            printed: Vec::new(),
            out,
        }
    }

    fn render(&mut self, conv: &Conversation) {
        for (k, msg) in conv.messages().iter().skip(self.first).enumerate() {
            if k == self.printed.len() {
                if k > 0 {
                    let _ = write!(self.out, "\n\n");
                }
                self.printed.push(0);
            }
            if let Some(new) = msg.content.get(self.printed[k]..) {
                let _ = write!(self.out, "{new}");
                self.printed[k] = msg.content.len();
            }
        }
        self.out.flush().ok();
    }
}
