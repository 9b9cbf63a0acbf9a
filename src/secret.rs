//! Secret storage: a persistent map from names to secret values.
//!
//! Secrets (API tokens, passwords) are kept apart from the main
//! database on purpose — the main database holds public tracker data
//! and should stay shareable. The only file-backed implementation
//! reads netrc format; in-memory maps cover tests and programmatic
//! configuration.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// A secret database.
pub trait SecretDB: Send + Sync {
    /// Returns the named secret, if present.
    fn get(&self, name: &str) -> Option<String>;

    /// Adds or replaces the named secret.
    fn set(&self, name: &str, secret: &str);
}

/// Returns a read-only, empty secret database.
pub fn empty() -> ReadOnlyMap {
    ReadOnlyMap(HashMap::new())
}

/// A read-write, in-memory [`SecretDB`].
#[derive(Default)]
pub struct Map(Mutex<HashMap<String, String>>);

impl Map {
    pub fn new() -> Map {
        Map::default()
    }
}

impl SecretDB for Map {
    fn get(&self, name: &str) -> Option<String> {
        self.0.lock().unwrap().get(name).cloned()
    }

    fn set(&self, name: &str, secret: &str) {
        self.0
            .lock()
            .unwrap()
            .insert(name.to_string(), secret.to_string());
    }
}

/// A read-only [`SecretDB`]. Calling [`SecretDB::set`] panics.
pub struct ReadOnlyMap(HashMap<String, String>);

impl SecretDB for ReadOnlyMap {
    fn get(&self, name: &str) -> Option<String> {
        self.0.get(name).cloned()
    }

    fn set(&self, _name: &str, _secret: &str) {
        panic!("set on read-only secret database");
    }
}

/// Returns a read-only secret database initialized from the netrc file
/// at `path`, or from `$NETRC` / `$HOME/.netrc` when `path` is `None`.
///
/// A line of the form
///
/// ```text
/// machine name login user password pass
/// ```
///
/// makes `get("name")` return `"user:pass"`. Later lines take priority
/// over earlier ones. A missing or unreadable file yields an empty
/// database, matching how an unconfigured bot should behave: no
/// credentials, unauthenticated requests.
pub fn netrc(path: Option<&Path>) -> ReadOnlyMap {
    let file = match path {
        Some(p) => p.to_path_buf(),
        None => match std::env::var("NETRC") {
            Ok(env) if !env.is_empty() => PathBuf::from(env),
            _ => Path::new(&std::env::var("HOME").unwrap_or_default()).join(".netrc"),
        },
    };
    let mut m = HashMap::new();
    if let Ok(data) = std::fs::read_to_string(&file) {
        for line in data.lines() {
            let f: Vec<&str> = line.split_whitespace().collect();
            if f.len() == 6 && f[0] == "machine" && f[2] == "login" && f[4] == "password" {
                m.insert(f[1].to_string(), format!("{}:{}", f[3], f[5]));
            }
        }
    }
    ReadOnlyMap(m)
}
