//! What to run inside a new terminal
//!
//! Persistent sessions attach to a tmux session named after the remote user
//! (`tmux new-session -A`), so a later connect from the same user lands in
//! the same shell. Without tmux a plain interactive shell is started.

use std::path::{Path, PathBuf};

use portable_pty::CommandBuilder;
use sha2::{Digest, Sha256};

use rt_core::SessionError;
use rt_protocol::TerminalSize;

/// Name of the terminal multiplexer binary
const MULTIPLEXER: &str = "tmux";

/// Prefix for multiplexer session names
const SESSION_PREFIX: &str = "rt_";

/// Allowed shell paths (anything else must be listed in /etc/shells)
const ALLOWED_SHELLS: &[&str] = &[
    "/bin/sh",
    "/bin/bash",
    "/bin/zsh",
    "/bin/fish",
    "/bin/dash",
    "/bin/ksh",
    "/usr/bin/sh",
    "/usr/bin/bash",
    "/usr/bin/zsh",
    "/usr/bin/fish",
    "/usr/bin/dash",
    "/usr/bin/ksh",
    "/usr/local/bin/bash",
    "/usr/local/bin/zsh",
    "/usr/local/bin/fish",
    "/opt/homebrew/bin/bash",
    "/opt/homebrew/bin/zsh",
    "/opt/homebrew/bin/fish",
];

/// Environment every session gets, before configured overrides
const BASE_ENV: &[(&str, &str)] = &[("TERM", "xterm-256color"), ("LANG", "en_US.UTF-8")];

/// Everything needed to start the process behind one session
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Interactive shell used when no multiplexer is involved
    pub shell: String,
    /// Working directory of the new process
    pub work_dir: PathBuf,
    /// Extra environment variables
    pub env: Vec<(String, String)>,
    /// Reattach to the user's multiplexer session if possible
    pub persistent: bool,
    /// Remote user identity; names the multiplexer session
    pub user_key: String,
    /// Path of the multiplexer binary, if installed
    pub multiplexer: Option<PathBuf>,
    /// Initial window size
    pub size: TerminalSize,
}

impl SpawnOptions {
    /// Whether this launch will go through the multiplexer
    pub fn uses_multiplexer(&self) -> bool {
        self.persistent && self.multiplexer.is_some()
    }

    /// Program and arguments to launch
    pub fn argv(&self) -> Vec<String> {
        match (&self.multiplexer, self.persistent) {
            (Some(tmux), true) => vec![
                tmux.to_string_lossy().into_owned(),
                "new-session".to_string(),
                "-A".to_string(),
                "-s".to_string(),
                multiplexer_session_name(&self.user_key),
                "-c".to_string(),
                self.work_dir.to_string_lossy().into_owned(),
            ],
            _ => vec![self.shell.clone()],
        }
    }

    /// Human-readable command line, for logs and error messages
    pub fn describe(&self) -> String {
        self.argv().join(" ")
    }

    /// Build the portable-pty command
    pub fn command(&self) -> CommandBuilder {
        let argv = self.argv();
        let mut cmd = CommandBuilder::new(&argv[0]);
        cmd.args(&argv[1..]);
        cmd.cwd(&self.work_dir);

        // A bridge started from inside tmux must still be able to create sessions
        cmd.env_remove("TMUX");
        for (key, value) in BASE_ENV {
            cmd.env(key, value);
        }
        cmd.env("SHELL", &self.shell);
        for (key, value) in &self.env {
            cmd.env(key, value);
        }

        cmd
    }
}

/// Deterministic multiplexer session name for a remote user
///
/// Identities made of `[A-Za-z0-9_-]` are used verbatim; anything else is
/// replaced by a digest so it cannot confuse tmux target syntax.
pub fn multiplexer_session_name(user_key: &str) -> String {
    let safe = !user_key.is_empty()
        && user_key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-');

    if safe {
        format!("{}{}", SESSION_PREFIX, user_key)
    } else {
        let digest = Sha256::digest(user_key.as_bytes());
        format!("{}{}", SESSION_PREFIX, &hex::encode(digest)[..16])
    }
}

/// Find the multiplexer on `PATH`
pub fn find_multiplexer() -> Option<PathBuf> {
    let path = std::env::var_os("PATH")?;
    std::env::split_paths(&path)
        .map(|dir| dir.join(MULTIPLEXER))
        .find(|candidate| is_executable(candidate))
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;

    path.metadata()
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(path: &Path) -> bool {
    path.is_file()
}

/// Pick and validate the shell to launch
///
/// Falls back to `$SHELL`, then `/bin/sh`.
pub fn resolve_shell(configured: Option<&str>) -> Result<String, SessionError> {
    let requested = configured
        .map(str::to_string)
        .or_else(|| std::env::var("SHELL").ok())
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/sh".to_string());

    validate_shell_path(&requested)
}

/// Validate that a shell path is allowed and exists
fn validate_shell_path(shell: &str) -> Result<String, SessionError> {
    let listed = ALLOWED_SHELLS.contains(&shell) || listed_in_etc_shells(shell);

    if !listed {
        return Err(SessionError::Spawn {
            command: shell.to_string(),
            reason: "shell is neither in the allowed list nor in /etc/shells".to_string(),
        });
    }

    if !Path::new(shell).exists() {
        return Err(SessionError::Spawn {
            command: shell.to_string(),
            reason: "shell does not exist".to_string(),
        });
    }

    Ok(shell.to_string())
}

fn listed_in_etc_shells(shell: &str) -> bool {
    std::fs::read_to_string("/etc/shells")
        .map(|shells| {
            shells.lines().any(|line| {
                let line = line.trim();
                !line.starts_with('#') && line == shell
            })
        })
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn options(persistent: bool, multiplexer: Option<&str>) -> SpawnOptions {
        SpawnOptions {
            shell: "/bin/sh".to_string(),
            work_dir: PathBuf::from("/tmp"),
            env: vec![],
            persistent,
            user_key: "42".to_string(),
            multiplexer: multiplexer.map(PathBuf::from),
            size: TerminalSize::default(),
        }
    }

    #[test]
    fn test_session_name_plain_identity() {
        assert_eq!(multiplexer_session_name("42"), "rt_42");
        assert_eq!(multiplexer_session_name("alice-01"), "rt_alice-01");
    }

    #[test]
    fn test_session_name_hashes_unsafe_identity() {
        let name = multiplexer_session_name("alice:work.1");
        assert!(name.starts_with("rt_"));
        assert_eq!(name.len(), 3 + 16);
        assert!(name[3..].chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(name, multiplexer_session_name("alice:work.1"));
        assert_ne!(name, multiplexer_session_name("alice:work.2"));
    }

    #[test]
    fn test_argv_persistent_with_tmux() {
        let opts = options(true, Some("/usr/bin/tmux"));
        assert!(opts.uses_multiplexer());
        assert_eq!(
            opts.argv(),
            vec!["/usr/bin/tmux", "new-session", "-A", "-s", "rt_42", "-c", "/tmp"]
        );
    }

    #[test]
    fn test_argv_falls_back_to_shell() {
        // Persistent requested but no tmux installed
        let opts = options(true, None);
        assert!(!opts.uses_multiplexer());
        assert_eq!(opts.argv(), vec!["/bin/sh"]);

        // tmux installed but persistence disabled
        let opts = options(false, Some("/usr/bin/tmux"));
        assert_eq!(opts.argv(), vec!["/bin/sh"]);
    }

    #[test]
    fn test_resolve_shell_rejects_unknown_binary() {
        assert!(resolve_shell(Some("/usr/bin/python3-not-a-shell")).is_err());
    }

    #[test]
    fn test_resolve_shell_accepts_bin_sh() {
        assert_eq!(resolve_shell(Some("/bin/sh")).unwrap(), "/bin/sh");
    }
}
