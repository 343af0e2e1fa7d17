//! Minimal netrc parsing.
//!
//! Only the `machine` / `login` / `password` / `default` tokens are
//! understood, which is all the credential ladder needs to look up a host.

use std::path::Path;

/// One machine entry from a netrc file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetrcEntry {
    /// The machine (host) name, `None` for a `default` entry.
    pub machine: Option<String>,
    /// The login name, if present.
    pub login: Option<String>,
    /// The password, if present.
    pub password: Option<String>,
}

/// Parse netrc text into entries, in file order.
#[must_use]
pub fn parse(text: &str) -> Vec<NetrcEntry> {
    let mut entries: Vec<NetrcEntry> = Vec::new();
    let mut tokens = text.split_whitespace();
    while let Some(token) = tokens.next() {
        match token {
            "machine" => {
                let machine = tokens.next().map(String::from);
                entries.push(NetrcEntry {
                    machine,
                    login: None,
                    password: None,
                });
            }
            "default" => {
                entries.push(NetrcEntry {
                    machine: None,
                    login: None,
                    password: None,
                });
            }
            "login" => {
                if let Some(entry) = entries.last_mut() {
                    entry.login = tokens.next().map(String::from);
                }
            }
            "password" => {
                if let Some(entry) = entries.last_mut() {
                    entry.password = tokens.next().map(String::from);
                }
            }
            // macdef bodies and unknown tokens are skipped.
            _ => {}
        }
    }
    entries
}

/// Find the entry for a host (port stripped), falling back to `default`.
#[must_use]
pub fn lookup<'a>(entries: &'a [NetrcEntry], host: &str) -> Option<&'a NetrcEntry> {
    let bare_host = host.split(':').next().unwrap_or(host);
    entries
        .iter()
        .find(|e| e.machine.as_deref() == Some(bare_host))
        .or_else(|| entries.iter().find(|e| e.machine.is_none()))
}

/// Read and parse the user's netrc file, if one exists.
#[must_use]
pub fn load(path: &Path) -> Vec<NetrcEntry> {
    std::fs::read_to_string(path)
        .map(|text| parse(&text))
        .unwrap_or_default()
}

/// The default netrc location (`~/.netrc`).
#[must_use]
pub fn default_path() -> Option<std::path::PathBuf> {
    dirs::home_dir().map(|home| home.join(".netrc"))
}
