//! Command and path completion.
//!
//! The command set is built once at startup from every executable on PATH
//! plus the shell's builtins. Path completion works relative to the
//! session's working directory and preserves whatever the user typed
//! (including `~`), so the completed text can be inserted verbatim.

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::process::Command;

pub struct CompletionProvider {
    commands: BTreeSet<String>,
}

impl CompletionProvider {
    pub fn new() -> Self {
        let mut commands = BTreeSet::new();
        scan_path_directories(&mut commands);
        load_shell_builtins(&mut commands);
        tracing::info!(count = commands.len(), "completion command cache built");
        Self { commands }
    }

    /// Build from a fixed command set, used by tests.
    #[cfg(test)]
    pub fn with_commands(commands: impl IntoIterator<Item = String>) -> Self {
        Self {
            commands: commands.into_iter().collect(),
        }
    }

    pub fn get_completions(&self, text: &str, cursor_position: usize, cwd: &str) -> Vec<String> {
        if text.is_empty() {
            return Vec::new();
        }

        let prefix = prefix_at(text, cursor_position);
        let last_word = extract_last_word(prefix);
        if last_word.is_empty() {
            return Vec::new();
        }

        if is_command_position(prefix) {
            self.command_completions(last_word)
        } else {
            file_completions(last_word, cwd)
        }
    }

    fn command_completions(&self, prefix: &str) -> Vec<String> {
        self.commands
            .range(prefix.to_string()..)
            .take_while(|command| command.starts_with(prefix))
            .cloned()
            .collect()
    }
}

impl Default for CompletionProvider {
    fn default() -> Self {
        Self::new()
    }
}

/// The text before the cursor, clamped onto a char boundary.
fn prefix_at(text: &str, cursor_position: usize) -> &str {
    let mut end = cursor_position.min(text.len());
    while end > 0 && !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

/// The last whitespace-delimited word ending at the cursor.
fn extract_last_word(prefix: &str) -> &str {
    match prefix.rfind([' ', '\t']) {
        Some(pos) => &prefix[pos + 1..],
        None => prefix,
    }
}

/// With no whitespace before the cursor the word is a command name.
fn is_command_position(prefix: &str) -> bool {
    !prefix.contains([' ', '\t'])
}

fn file_completions(word: &str, cwd: &str) -> Vec<String> {
    // Split at the rightmost separator; the typed directory part is kept
    // verbatim in the results so tilde forms are not rewritten.
    let (search_dir, file_prefix, typed_dir_prefix) = match word.rfind('/') {
        Some(pos) => {
            let dir = &word[..pos];
            let file = &word[pos + 1..];
            if dir.is_empty() {
                ("/".to_string(), file, "/".to_string())
            } else {
                (dir.to_string(), file, format!("{}/", dir))
            }
        }
        None => (cwd.to_string(), word, String::new()),
    };

    let expanded = expand_tilde(&search_dir);
    let Ok(entries) = std::fs::read_dir(&expanded) else {
        return Vec::new();
    };

    let show_hidden = file_prefix.starts_with('.');
    let mut matches = Vec::new();
    for entry in entries.flatten() {
        let name = entry.file_name().to_string_lossy().into_owned();
        if name.starts_with('.') && !show_hidden {
            continue;
        }
        if !name.starts_with(file_prefix) {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        let suffix = if is_dir { "/" } else { "" };
        matches.push(format!("{}{}{}", typed_dir_prefix, name, suffix));
    }
    matches.sort();
    matches
}

/// Expand `~` and `~user` prefixes to home directories. Unknown users and
/// non-tilde paths are returned unchanged.
fn expand_tilde(path: &str) -> PathBuf {
    if !path.starts_with('~') {
        return PathBuf::from(path);
    }

    let rest = &path[1..];
    if rest.is_empty() || rest.starts_with('/') {
        let home = std::env::var("HOME")
            .map(PathBuf::from)
            .ok()
            .or_else(dirs::home_dir);
        if let Some(home) = home {
            return home.join(rest.trim_start_matches('/'));
        }
        return PathBuf::from(path);
    }

    // ~user or ~user/...
    let (user, tail) = match rest.find('/') {
        Some(pos) => (&rest[..pos], &rest[pos + 1..]),
        None => (rest, ""),
    };
    if let Some(home) = passwd_home(user) {
        return Path::new(&home).join(tail);
    }
    PathBuf::from(path)
}

/// Home directory of a named user from `/etc/passwd` (Unix only).
#[cfg(unix)]
fn passwd_home(user: &str) -> Option<String> {
    let passwd = std::fs::read_to_string("/etc/passwd").ok()?;
    for line in passwd.lines() {
        let mut fields = line.split(':');
        if fields.next() == Some(user) {
            return fields.nth(4).map(|home| home.to_string());
        }
    }
    None
}

#[cfg(not(unix))]
fn passwd_home(_user: &str) -> Option<String> {
    None
}

fn scan_path_directories(commands: &mut BTreeSet<String>) {
    let Ok(path_env) = std::env::var("PATH") else {
        tracing::warn!("PATH is not set, command completion will be empty");
        return;
    };

    for directory in std::env::split_paths(&path_env) {
        let Ok(entries) = std::fs::read_dir(&directory) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if name.starts_with('.') {
                continue;
            }
            let Ok(file_type) = entry.file_type() else {
                continue;
            };
            if !file_type.is_file() && !file_type.is_symlink() {
                continue;
            }
            if is_executable(&entry.path()) {
                #[cfg(windows)]
                {
                    let lower = name.to_lowercase();
                    if lower.ends_with(".exe")
                        || lower.ends_with(".cmd")
                        || lower.ends_with(".bat")
                        || lower.ends_with(".com")
                    {
                        if let Some(stem) = entry.path().file_stem() {
                            commands.insert(stem.to_string_lossy().into_owned());
                        }
                    }
                }
                #[cfg(not(windows))]
                commands.insert(name);
            }
        }
    }
}

#[cfg(unix)]
fn is_executable(path: &Path) -> bool {
    use std::os::unix::fs::PermissionsExt;
    std::fs::metadata(path)
        .map(|meta| meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false)
}

#[cfg(not(unix))]
fn is_executable(_path: &Path) -> bool {
    true
}

/// Shell builtins are not on PATH; ask the shell to enumerate them.
fn load_shell_builtins(commands: &mut BTreeSet<String>) {
    let outputs = [
        Command::new("bash").arg("-c").arg("compgen -b").output(),
        Command::new("zsh")
            .arg("-c")
            .arg("print -l ${(k)builtins}")
            .output(),
    ];
    for output in outputs.into_iter().flatten() {
        if !output.status.success() {
            continue;
        }
        let mut added = 0usize;
        for line in String::from_utf8_lossy(&output.stdout).lines() {
            let line = line.trim();
            if !line.is_empty() {
                commands.insert(line.to_string());
                added += 1;
            }
        }
        if added > 0 {
            tracing::debug!(count = added, "loaded shell builtins");
            return;
        }
    }
    tracing::warn!("could not load shell builtins");
}
