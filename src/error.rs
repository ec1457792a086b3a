// Error types shared by the toolbelt modules.
//
// `ApiError` describes what went wrong talking to the remote platform and
// `ToolbeltError` covers everything local (configuration, credentials,
// batch failures). Commands wrap both in `anyhow` with extra context; the
// dispatcher in `main.rs` turns them into one formatted line and exit 1.

use std::path::PathBuf;
use thiserror::Error;

/// Conditions surfaced by the HTTP API client.
#[derive(Error, Debug)]
pub enum ApiError {
    /// No route to the host, DNS failure, timeout or refused connection.
    #[error("unable to connect to {host}")]
    Network {
        host: String,
        #[source]
        source: reqwest::Error,
    },

    /// 401: the token (or login/password) was rejected.
    #[error("authentication failed, please log in again")]
    Unauthorized,

    /// 403: the token is valid but has no access to this resource.
    #[error("access forbidden: {message}")]
    Forbidden { message: String },

    /// 404
    #[error("{message}")]
    NotFound { message: String },

    /// Any other non-success status.
    #[error("server error ({status}): {message}")]
    Server {
        status: u16,
        message: String,
        body: String,
    },

    /// The response arrived but could not be decoded.
    #[error("unexpected response from {url}: {source}")]
    Decode {
        url: String,
        #[source]
        source: reqwest::Error,
    },
}

/// Local failures reported by the toolbelt commands.
#[derive(Error, Debug)]
pub enum ToolbeltError {
    #[error("this directory does not contain a Nimbu theme configuration ({path})")]
    ConfigurationMissing { path: PathBuf },

    #[error("not authenticated for {host}")]
    AuthenticationRequired { host: String },

    #[error("could not log in after {attempts} attempts")]
    AuthenticationFailed { attempts: u32 },

    #[error("{failed} of {total} files failed to upload")]
    PushFailed { failed: usize, total: usize },

    #[error("{failed} of {total} files failed to download")]
    DownloadFailed { failed: usize, total: usize },

    #[error("you don't have access to any Nimbu sites")]
    NoSites,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("YAML parsing error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl ToolbeltError {
    /// A follow-up command to suggest to the user, if one applies.
    pub fn hint(&self) -> Option<&'static str> {
        match self {
            ToolbeltError::ConfigurationMissing { .. } => {
                Some("Run \"nimbu init\" to initialize this directory.")
            }
            ToolbeltError::AuthenticationRequired { .. }
            | ToolbeltError::AuthenticationFailed { .. } => {
                Some("Run \"nimbu login\" to start a session.")
            }
            _ => None,
        }
    }
}

/// Extract a human readable message from an error response body.
///
/// Tries a JSON `error` string, then a JSON `errors` array, then the raw
/// text; falls back to `default` for empty bodies.
pub fn extract_error_message(body: &str, default: &str) -> String {
    if let Ok(value) = serde_json::from_str::<serde_json::Value>(body) {
        if let Some(msg) = value.get("error").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(msg) = value.get("message").and_then(|v| v.as_str()) {
            return msg.to_string();
        }
        if let Some(errors) = value.get("errors").and_then(|v| v.as_array()) {
            let joined = errors
                .iter()
                .filter_map(|e| e.as_str())
                .collect::<Vec<_>>()
                .join(" / ");
            if !joined.is_empty() {
                return joined;
            }
        }
    }

    let trimmed = body.trim();
    if trimmed.is_empty() || trimmed.starts_with('<') {
        default.to_string()
    } else {
        trimmed.to_string()
    }
}
