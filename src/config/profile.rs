//! Connection profile store.
//!
//! Profiles live in a single INI-style file, `~/.vps-proxy` by default,
//! created by hand before first use:
//!
//! ```text
//! [current]
//! vps = vps1
//!
//! [vps1]
//! host = ...
//! user = ...
//! password = ...
//! prompt = ...
//! ```
//!
//! `[current] vps` selects which profile section the daemon uses. The
//! `prompt` field is the literal text of the remote shell prompt; it is
//! escaped here so that pattern matching treats it literally.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};

use regex::Regex;
use thiserror::Error;

/// Default profile store location (`~/.vps-proxy`).
pub fn default_store_path() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".vps-proxy")
}

/// Fatal configuration errors. Any of these ends the process at startup,
/// before anything has been spawned.
#[derive(Debug, Error)]
pub enum ProfileError {
    #[error("profile store not found: {}", path.display())]
    StoreMissing { path: PathBuf },

    #[error("failed to read profile store {}: {source}", path.display())]
    Unreadable {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("profile store has no `vps` entry in its [current] section")]
    NoSelection,

    #[error("selected profile [{name}] does not exist")]
    UnknownProfile { name: String },

    #[error("profile [{name}] is missing required field `{field}`")]
    MissingField { name: String, field: &'static str },

    #[error("profile [{name}] has an unusable prompt: {source}")]
    BadPrompt {
        name: String,
        #[source]
        source: regex::Error,
    },
}

/// One connection profile, resolved from the store at startup and immutable
/// for the life of the process.
#[derive(Clone)]
pub struct Profile {
    pub host: String,
    pub user: String,
    pub password: String,
    /// The shell prompt with regex metacharacters escaped, compiled for
    /// matching against terminal output.
    pub prompt: Regex,
}

impl fmt::Debug for Profile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Profile")
            .field("host", &self.host)
            .field("user", &self.user)
            .field("password", &"<redacted>")
            .field("prompt", &self.prompt.as_str())
            .finish()
    }
}

impl Profile {
    /// Load the currently selected profile from the store at `path`.
    pub fn load(path: &Path) -> Result<Self, ProfileError> {
        if !path.exists() {
            return Err(ProfileError::StoreMissing {
                path: path.to_path_buf(),
            });
        }
        let text = std::fs::read_to_string(path).map_err(|source| ProfileError::Unreadable {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_store(&text)
    }

    /// Parse store text and resolve the `[current] vps = ...` indirection.
    pub fn from_store(text: &str) -> Result<Self, ProfileError> {
        let sections = parse_sections(text);

        let name = sections
            .get("current")
            .and_then(|section| section.get("vps"))
            .ok_or(ProfileError::NoSelection)?
            .clone();
        let section = sections
            .get(&name)
            .ok_or_else(|| ProfileError::UnknownProfile { name: name.clone() })?;

        let field = |key: &'static str| {
            section
                .get(key)
                .cloned()
                .ok_or_else(|| ProfileError::MissingField {
                    name: name.clone(),
                    field: key,
                })
        };

        let host = field("host")?;
        let user = field("user")?;
        let password = field("password")?;
        let pattern = escape_prompt(&field("prompt")?);
        let prompt = Regex::new(&pattern).map_err(|source| ProfileError::BadPrompt {
            name: name.clone(),
            source,
        })?;

        Ok(Self {
            host,
            user,
            password,
            prompt,
        })
    }
}

/// Parse INI-style sections: `[name]` headers followed by `key = value`
/// lines. Blank lines and `#`/`;` comment lines are skipped; key-value
/// pairs before the first header are ignored.
fn parse_sections(text: &str) -> HashMap<String, HashMap<String, String>> {
    let mut sections: HashMap<String, HashMap<String, String>> = HashMap::new();
    let mut current: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(header) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
            let name = header.trim().to_string();
            sections.entry(name.clone()).or_default();
            current = Some(name);
            continue;
        }
        if let (Some(section), Some((key, value))) = (&current, line.split_once('=')) {
            sections
                .entry(section.clone())
                .or_default()
                .insert(key.trim().to_string(), value.trim().to_string());
        }
    }

    sections
}

/// Escape the prompt so `[`, `]`, `.` and `$` match literally.
fn escape_prompt(prompt: &str) -> String {
    let mut out = String::with_capacity(prompt.len());
    for c in prompt.chars() {
        if matches!(c, '[' | ']' | '.' | '$') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    const STORE: &str = "\
[current]
vps = vps1

# unrelated section kept around for later
[vps2]
host = other.example.net

[vps1]
host = vps.example.net
user = tunneler
password = s3kr1t
prompt = [tunneler@vps ~]$
";

    #[test]
    fn loads_the_selected_profile() {
        let profile = Profile::from_store(STORE).unwrap();
        assert_eq!(profile.host, "vps.example.net");
        assert_eq!(profile.user, "tunneler");
        assert_eq!(profile.password, "s3kr1t");
        assert_eq!(profile.prompt.as_str(), r"\[tunneler@vps ~\]\$");
    }

    #[test]
    fn escaped_prompt_matches_literally() {
        let profile = Profile::from_store(STORE).unwrap();
        assert!(profile.prompt.is_match("login ok\n[tunneler@vps ~]$ "));
        assert!(!profile.prompt.is_match("[tunneler@vps home]$ "));
    }

    #[test]
    fn escapes_exactly_the_four_metacharacters() {
        assert_eq!(escape_prompt("[].$"), r"\[\]\.\$");
        assert_eq!(escape_prompt("a[b]c.d$e"), r"a\[b\]c\.d\$e");
        // Everything else passes through untouched.
        assert_eq!(escape_prompt("user@host:~> (v2)"), "user@host:~> (v2)");
        assert_eq!(escape_prompt(""), "");
    }

    #[test]
    fn missing_store_file() {
        let dir = tempfile::tempdir().unwrap();
        let err = Profile::load(&dir.path().join("absent")).unwrap_err();
        assert!(matches!(err, ProfileError::StoreMissing { .. }));
    }

    #[test]
    fn store_round_trips_through_a_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("store");
        std::fs::write(&path, STORE).unwrap();
        let profile = Profile::load(&path).unwrap();
        assert_eq!(profile.host, "vps.example.net");
    }

    #[test]
    fn missing_indirection() {
        let err = Profile::from_store("[vps1]\nhost = h\n").unwrap_err();
        assert!(matches!(err, ProfileError::NoSelection));

        let err = Profile::from_store("[current]\nother = x\n").unwrap_err();
        assert!(matches!(err, ProfileError::NoSelection));
    }

    #[test]
    fn unknown_selected_profile() {
        let err = Profile::from_store("[current]\nvps = ghost\n").unwrap_err();
        match err {
            ProfileError::UnknownProfile { name } => assert_eq!(name, "ghost"),
            other => panic!("unexpected error: {:?}", other),
        }
    }

    #[test]
    fn each_required_field_is_checked() {
        for missing in ["host", "user", "password", "prompt"] {
            let mut store = String::from("[current]\nvps = v\n\n[v]\n");
            for key in ["host", "user", "password", "prompt"] {
                if key != missing {
                    store.push_str(&format!("{key} = value\n"));
                }
            }
            match Profile::from_store(&store).unwrap_err() {
                ProfileError::MissingField { field, .. } => assert_eq!(field, missing),
                other => panic!("unexpected error: {:?}", other),
            }
        }
    }

    #[test]
    fn comments_and_whitespace_are_tolerated() {
        let store = "\
; leading comment
  [current]
  vps =   padded
# another comment

[ padded ]
host= h
user =u
password=p
prompt = $
";
        let profile = Profile::from_store(store).unwrap();
        assert_eq!(profile.host, "h");
        assert_eq!(profile.user, "u");
        assert_eq!(profile.prompt.as_str(), r"\$");
    }

    #[test]
    fn debug_output_redacts_the_password() {
        let profile = Profile::from_store(STORE).unwrap();
        let rendered = format!("{:?}", profile);
        assert!(!rendered.contains("s3kr1t"));
        assert!(rendered.contains("<redacted>"));
    }
}
