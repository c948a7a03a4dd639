//! Locations of the config file and the saved conversation.
//!
//! `WIZARD_HOME` wins, then the XDG base directories, then `$HOME`. Nothing is
//! created here: a missing config file is fine and the file store creates its
//! directory on first save.

use anyhow::Context;
use std::ffi::OsString;
use std::path::PathBuf;

pub const CONFIG_FILE: &str = "config.toml";
pub const HISTORY_FILE: &str = "conversation.json";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DirKind {
    Config,
    State,
}

impl DirKind {
    fn home_subdir(self) -> &'static str {
        match self {
            DirKind::Config => "config",
            DirKind::State => "state",
        }
    }

    fn xdg_var(self) -> &'static str {
        match self {
            DirKind::Config => "XDG_CONFIG_HOME",
            DirKind::State => "XDG_STATE_HOME",
        }
    }

    fn dot_path(self) -> &'static [&'static str] {
        match self {
            DirKind::Config => &[".config"],
            DirKind::State => &[".local", "state"],
        }
    }
}

/// Empty variables count as unset.
fn dir_for<F>(kind: DirKind, var: F) -> anyhow::Result<PathBuf>
where
    F: Fn(&str) -> Option<OsString>,
{
    let lookup = |name: &str| var(name).filter(|v| !v.is_empty()).map(PathBuf::from);

    if let Some(base) = lookup("WIZARD_HOME") {
        return Ok(base.join(kind.home_subdir()));
    }
    if let Some(xdg) = lookup(kind.xdg_var()) {
        return Ok(xdg.join("wizard"));
    }

    let mut dir = lookup("HOME").context("HOME is not set")?;
    dir.extend(kind.dot_path());
    dir.push("wizard");
    Ok(dir)
}

pub fn config_file() -> anyhow::Result<PathBuf> {
    Ok(dir_for(DirKind::Config, |name| std::env::var_os(name))?.join(CONFIG_FILE))
}

pub fn history_file() -> anyhow::Result<PathBuf> {
    Ok(dir_for(DirKind::State, |name| std::env::var_os(name))?.join(HISTORY_FILE))
}
