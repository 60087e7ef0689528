//! Shell launch preparation.
//!
//! Resolves which shell to run, where to run it and with which environment,
//! so that startup does not depend on how the gateway itself was launched.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use protocol::TerminalSize;

use super::PtyError;
use crate::config::{Config, ShellConfig};

/// Directories always present in the shell's PATH, appended when missing.
pub const REQUIRED_PATH_ENTRIES: &[&str] = &[
    "/opt/homebrew/bin",
    "/usr/local/bin",
    "/usr/bin",
    "/bin",
    "/usr/sbin",
    "/sbin",
];

/// Settings that decide how shells are spawned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpawnOptions {
    /// Absolute path, `~/`-relative path, or bare name.
    pub shell: String,
    /// Preferred working directory.
    pub cwd: Option<PathBuf>,
    /// Extra variables layered over the gateway's own environment.
    pub env: Vec<(String, String)>,
    /// Degrade to a piped child when PTY allocation fails.
    pub allow_non_pty_fallback: bool,
}

impl SpawnOptions {
    pub fn new(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
            cwd: None,
            env: Vec::new(),
            allow_non_pty_fallback: false,
        }
    }
}

impl From<&ShellConfig> for SpawnOptions {
    fn from(shell: &ShellConfig) -> Self {
        Self {
            shell: shell.path.clone(),
            cwd: shell.cwd.clone(),
            env: Vec::new(),
            allow_non_pty_fallback: shell.allow_non_pty_fallback,
        }
    }
}

impl From<&Config> for SpawnOptions {
    fn from(config: &Config) -> Self {
        Self::from(&config.shell)
    }
}

/// Everything needed to start one shell.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchPlan {
    pub shell: PathBuf,
    pub cwd: PathBuf,
    pub env: BTreeMap<String, String>,
    pub size: TerminalSize,
}

impl LaunchPlan {
    /// Resolves shell, environment and working directory against the
    /// current process environment.
    pub fn prepare(options: &SpawnOptions, size: TerminalSize) -> Result<Self, PtyError> {
        let mut env = build_env(std::env::vars_os(), &options.env);

        let home = PathBuf::from(env.get("HOME").cloned().unwrap_or_default());
        let path_var = env.get("PATH").cloned().unwrap_or_default();
        let shell = resolve_shell(&options.shell, &home, &path_var)?;
        env.insert("SHELL".to_string(), shell.to_string_lossy().into_owned());

        let cwd = resolve_cwd(options.cwd.as_deref(), Some(&home));

        Ok(Self {
            shell,
            cwd,
            env,
            size,
        })
    }

    /// One-line summary used in spawn failure reports.
    pub fn describe(&self) -> String {
        format!(
            "shell={} cwd={} PATH={}",
            self.shell.display(),
            self.cwd.display(),
            self.env.get("PATH").map(String::as_str).unwrap_or("")
        )
    }
}

/// Appends every required directory missing from `path`, keeping the
/// existing order and dropping empty entries.
pub fn merge_path(path: Option<&str>) -> String {
    let mut entries: Vec<&str> = path
        .unwrap_or("")
        .split(':')
        .filter(|entry| !entry.is_empty())
        .collect();

    for required in REQUIRED_PATH_ENTRIES {
        if !entries.contains(required) {
            entries.push(required);
        }
    }

    entries.join(":")
}

/// Builds the shell environment from `base` plus `overrides`.
///
/// Entries that are not valid UTF-8 are dropped. Defaults are enforced for
/// HOME, PATH, LANG, LC_ALL and TERM; macOS session restore and the zsh
/// end-of-line prompt marker are switched off.
pub fn build_env<I>(base: I, overrides: &[(String, String)]) -> BTreeMap<String, String>
where
    I: IntoIterator<Item = (OsString, OsString)>,
{
    let mut env: BTreeMap<String, String> = base
        .into_iter()
        .filter_map(|(key, value)| Some((key.into_string().ok()?, value.into_string().ok()?)))
        .collect();

    for (key, value) in overrides {
        env.insert(key.clone(), value.clone());
    }

    set_if_blank(&mut env, "HOME", || {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("/"))
            .to_string_lossy()
            .into_owned()
    });

    let path = merge_path(env.get("PATH").map(String::as_str));
    env.insert("PATH".to_string(), path);

    set_if_blank(&mut env, "LANG", || "en_US.UTF-8".to_string());
    let lang = env.get("LANG").cloned().unwrap_or_default();
    set_if_blank(&mut env, "LC_ALL", || lang);
    set_if_blank(&mut env, "TERM", || "xterm-256color".to_string());
    set_if_blank(&mut env, "SHELL_SESSIONS_DISABLE", || "1".to_string());

    // An explicitly empty marker is kept as-is.
    env.entry("PROMPT_EOL_MARK".to_string()).or_default();

    env
}

fn set_if_blank(env: &mut BTreeMap<String, String>, key: &str, default: impl FnOnce() -> String) {
    if env.get(key).map_or(true, |value| value.is_empty()) {
        env.insert(key.to_string(), default());
    }
}

/// Whether `path` is a regular file with any execute bit set.
pub fn is_executable(path: &Path) -> bool {
    std::fs::metadata(path)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

/// Resolves the configured shell to an executable path.
///
/// A leading `~/` is expanded against `home`. Anything containing a `/` is
/// taken as a path and must be executable; a bare name is searched across
/// `path_var`.
pub fn resolve_shell(requested: &str, home: &Path, path_var: &str) -> Result<PathBuf, PtyError> {
    let requested = requested.trim();
    let requested = if requested.is_empty() {
        "/bin/sh"
    } else {
        requested
    };

    let expanded = match requested.strip_prefix("~/") {
        Some(rest) => home.join(rest),
        None => PathBuf::from(requested),
    };

    if expanded.to_string_lossy().contains('/') {
        if is_executable(&expanded) {
            return Ok(expanded);
        }
        return Err(PtyError::ShellNotExecutable(expanded));
    }

    let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
    which::which_in(&expanded, Some(path_var), cwd).map_err(|_| PtyError::ShellNotFound {
        name: requested.to_string(),
        path: path_var.to_string(),
    })
}

/// Picks the first existing directory among: `requested`, `home`, the
/// user's home directory, the gateway's working directory, and `/`.
pub fn resolve_cwd(requested: Option<&Path>, home: Option<&Path>) -> PathBuf {
    let candidates = [
        requested.map(Path::to_path_buf),
        home.map(Path::to_path_buf),
        dirs::home_dir(),
        std::env::current_dir().ok(),
    ];

    candidates
        .into_iter()
        .flatten()
        .filter(|candidate| !candidate.as_os_str().is_empty())
        .find(|candidate| candidate.is_dir())
        .unwrap_or_else(|| PathBuf::from("/"))
}
