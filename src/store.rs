use crate::conversation::Conversation;
use anyhow::{anyhow, Context};
use std::path::{Path, PathBuf};

/// Where a session keeps its conversation between runs.
pub trait ConversationStore: Send {
    fn name(&self) -> &'static str;

    /// Saved conversation, or an empty one if nothing was saved yet.
    fn load(&self) -> anyhow::Result<Conversation>;

    /// Overwrite the saved conversation.
    fn save(&mut self, conversation: &Conversation) -> anyhow::Result<()>;

    fn clear(&mut self) -> anyhow::Result<()>;
}

/// JSON file, replaced atomically on every save.
#[derive(Debug, Clone)]
pub struct FileStore {
    path: PathBuf,
}

impl FileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ConversationStore for FileStore {
    fn name(&self) -> &'static str {
        "file"
    }

    fn load(&self) -> anyhow::Result<Conversation> {
        let bytes = match std::fs::read(&self.path) {
            Ok(b) => b,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Conversation::new()),
            Err(e) => {
                return Err(anyhow!(e))
                    .with_context(|| format!("failed to read history: {}", self.path.display()))
            }
        };
        serde_json::from_slice(&bytes)
            .with_context(|| format!("failed to parse history JSON: {}", self.path.display()))
    }

    fn save(&mut self, conversation: &Conversation) -> anyhow::Result<()> {
        let dir = self.path.parent().unwrap_or_else(|| Path::new("."));
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create history directory: {}", dir.display()))?;

        let tmp = tmp_path(&self.path);
        let bytes = serde_json::to_vec_pretty(conversation).context("failed to encode history")?;
        std::fs::write(&tmp, bytes)
            .with_context(|| format!("failed to write: {}", tmp.display()))?;
        std::fs::rename(&tmp, &self.path)
            .with_context(|| format!("failed to replace: {}", self.path.display()))?;
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        match std::fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(anyhow!(e))
                .with_context(|| format!("failed to remove history: {}", self.path.display())),
        }
    }
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut p = path.to_path_buf();
    let file = path
        .file_name()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_else(|| "conversation.json".to_string());
    p.set_file_name(format!("{file}.tmp"));
    p
}

/// Keeps the conversation for the lifetime of the process only.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    saved: Option<Conversation>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn with_conversation(conversation: Conversation) -> Self {
        Self {
            saved: Some(conversation),
        }
    }
}

impl ConversationStore for MemoryStore {
    fn name(&self) -> &'static str {
        "memory"
    }

    fn load(&self) -> anyhow::Result<Conversation> {
        Ok(self.saved.clone().unwrap_or_default())
    }

    fn save(&mut self, conversation: &Conversation) -> anyhow::Result<()> {
        self.saved = Some(conversation.clone());
        Ok(())
    }

    fn clear(&mut self) -> anyhow::Result<()> {
        self.saved = None;
        Ok(())
    }
}
