// Credential persistence: one token per API host, stored under
// `~/.nimbu/` with owner-only permissions.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use tracing::debug;

use crate::config::{set_owner_only, write_owner_only, Settings, DEFAULT_HOST};
use crate::error::ToolbeltError;

/// A stored login for one API host.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Credentials {
    pub host: String,
    #[serde(default)]
    pub user: String,
    pub token: String,
}

/// Reads and writes the credential record of a single host.
#[derive(Debug, Clone)]
pub struct CredentialStore {
    host: String,
    dir: PathBuf,
    env_token: Option<String>,
}

impl CredentialStore {
    /// Store rooted at `~/.nimbu`, honouring the `NIMBU_API_KEY` override.
    pub fn new(settings: &Settings) -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));
        CredentialStore {
            host: settings.host.clone(),
            dir: home.join(".nimbu"),
            env_token: settings.api_key.clone(),
        }
    }

    /// Store rooted at an explicit directory, without environment override.
    pub fn with_dir(host: &str, dir: impl Into<PathBuf>) -> Self {
        CredentialStore {
            host: host.to_string(),
            dir: dir.into(),
            env_token: None,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// `credentials` for the default host, `credentials.<escaped host>` otherwise.
    pub fn path(&self) -> PathBuf {
        if self.host.trim_end_matches('/') == DEFAULT_HOST {
            return self.dir.join("credentials");
        }
        let bare = self
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        let escaped: String = url::form_urlencoded::byte_serialize(bare.as_bytes()).collect();
        self.dir.join(format!("credentials.{escaped}"))
    }

    /// The token to use: environment override first, then the stored record.
    pub fn get(&self) -> Result<String, ToolbeltError> {
        if let Some(token) = &self.env_token {
            return Ok(token.clone());
        }
        self.read()
            .map(|c| c.token)
            .ok_or_else(|| ToolbeltError::AuthenticationRequired {
                host: self.host.clone(),
            })
    }

    /// The stored record, or `None` when it is missing or unreadable.
    pub fn read(&self) -> Option<Credentials> {
        let path = self.path();
        let raw = match fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(e) => {
                debug!(path = %path.display(), error = %e, "no stored credentials");
                return None;
            }
        };

        if let Ok(creds) = serde_yaml::from_str::<Credentials>(&raw) {
            if !creds.token.trim().is_empty() {
                return Some(creds);
            }
        }

        // Older single-line files: "token <value>"
        parse_legacy_token(&raw).map(|token| Credentials {
            host: self.host.clone(),
            user: String::new(),
            token,
        })
    }

    pub fn save(&self, user: &str, token: &str) -> Result<PathBuf, ToolbeltError> {
        fs::create_dir_all(&self.dir)?;
        set_owner_only(&self.dir, 0o700)?;

        let record = Credentials {
            host: self.host.clone(),
            user: user.to_string(),
            token: token.to_string(),
        };
        let path = self.path();
        write_owner_only(&path, serde_yaml::to_string(&record)?.as_bytes())?;
        Ok(path)
    }

    /// Remove the stored record. A missing file is not an error.
    pub fn delete(&self) -> Result<(), ToolbeltError> {
        match fs::remove_file(self.path()) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn parse_legacy_token(raw: &str) -> Option<String> {
    let line = raw.lines().next()?.trim();
    let (scheme, value) = line.split_once(' ')?;
    let scheme = scheme.to_ascii_lowercase();
    let value = value.trim();
    let valid = matches!(scheme.as_str(), "bearer" | "oauth2" | "token")
        && !value.is_empty()
        && value.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');
    valid.then(|| value.to_string())
}
