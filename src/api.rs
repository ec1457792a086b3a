// API client module: a small blocking HTTP client that talks to the Nimbu
// API. Every call is a synchronous request/response; failures come back as
// `ApiError` so callers can tell network, auth, not-found and server errors
// apart.
//
// The theme sync engine and the dev server only see the `ThemeApi` and
// `Simulator` traits, which keeps them testable without a network.

use anyhow::Context;
use base64::Engine;
use reqwest::blocking::{multipart, Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tracing::debug;

use crate::bundle::RenderBundle;
use crate::collector::Kind;
use crate::error::{extract_error_message, ApiError};

/// Transport timeout for every API call. The dev server has no timeout of
/// its own and relies on this one.
const HTTP_TIMEOUT_SECS: u64 = 120;

/// Header carrying the site (subdomain) for site-scoped calls.
const SITE_HEADER: &str = "X-Nimbu-Site";

/// `nimbu-toolbelt/<version> (<os>-<arch>) rust`
pub fn user_agent() -> String {
    format!(
        "nimbu-toolbelt/{} ({}-{}) rust",
        env!("CARGO_PKG_VERSION"),
        std::env::consts::OS,
        std::env::consts::ARCH
    )
}

/// A site the current user can edit.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Site {
    pub subdomain: String,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub domain: String,
}

/// A theme of a site. `short` is the identifier used in API paths.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
pub struct Theme {
    pub name: String,
    pub short: String,
}

/// Response of the `whoami` endpoint.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct User {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub email: String,
}

/// A layout, template or snippet known to the server. We keep `id` as a
/// `serde_json::Value` because the API returns numbers for some kinds and
/// strings for others.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct ThemeItem {
    #[serde(default)]
    pub id: serde_json::Value,
    pub name: String,
}

impl ThemeItem {
    pub fn id_string(&self) -> String {
        match &self.id {
            serde_json::Value::String(s) => s.clone(),
            serde_json::Value::Null => self.name.clone(),
            other => other.to_string(),
        }
    }
}

/// A binary or static asset known to the server.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RemoteAsset {
    #[serde(default)]
    pub id: serde_json::Value,
    pub name: String,
    #[serde(default)]
    pub folder: String,
    #[serde(default, alias = "public_url")]
    pub url: Option<String>,
}

impl RemoteAsset {
    /// Project-relative path, e.g. `images/logo.png`.
    pub fn path(&self) -> String {
        if self.folder.is_empty() {
            self.name.clone()
        } else {
            format!("{}/{}", self.folder.trim_end_matches('/'), self.name)
        }
    }
}

/// Remote manifest of a theme.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
pub struct ThemeContents {
    #[serde(default)]
    pub layouts: Vec<ThemeItem>,
    #[serde(default)]
    pub templates: Vec<ThemeItem>,
    #[serde(default)]
    pub snippets: Vec<ThemeItem>,
    #[serde(default)]
    pub assets: Vec<RemoteAsset>,
}

impl ThemeContents {
    /// Items of a liquid kind; empty for asset kinds.
    pub fn items(&self, kind: Kind) -> &[ThemeItem] {
        match kind {
            Kind::Layouts => &self.layouts,
            Kind::Templates => &self.templates,
            Kind::Snippets => &self.snippets,
            _ => &[],
        }
    }
}

/// What the simulator returns for one rendered request. `headers` is either
/// an object or an empty string; `body` is base64.
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct RenderResponse {
    pub status: u16,
    #[serde(default)]
    pub headers: serde_json::Value,
    #[serde(default)]
    pub body: String,
}

impl RenderResponse {
    /// Header name/value pairs as raw bytes. Array values become repeated
    /// headers.
    pub fn header_pairs(&self) -> Vec<(String, Vec<u8>)> {
        let mut pairs = Vec::new();
        let Some(map) = self.headers.as_object() else {
            return pairs;
        };
        for (name, value) in map {
            match value {
                serde_json::Value::String(s) => {
                    // multi-valued headers (Set-Cookie) arrive newline-joined
                    for line in s.split('\n').filter(|l| !l.is_empty()) {
                        pairs.push((name.clone(), line.as_bytes().to_vec()));
                    }
                }
                serde_json::Value::Array(values) => {
                    for v in values {
                        let raw = v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string());
                        pairs.push((name.clone(), raw.into_bytes()));
                    }
                }
                serde_json::Value::Null => {}
                other => pairs.push((name.clone(), other.to_string().into_bytes())),
            }
        }
        pairs
    }

    /// Decode the base64 body. Line breaks inside the encoding are ignored.
    pub fn decoded_body(&self) -> Result<Vec<u8>, base64::DecodeError> {
        let compact: String = self.body.chars().filter(|c| !c.is_whitespace()).collect();
        base64::engine::general_purpose::STANDARD.decode(compact)
    }
}

/// Remote theme operations used by the sync engine.
pub trait ThemeApi {
    fn list_themes(&self, site: &str) -> Result<Vec<Theme>, ApiError>;
    fn theme_contents(&self, site: &str, theme: &str) -> Result<ThemeContents, ApiError>;
    fn fetch_code(&self, site: &str, theme: &str, kind: Kind, id: &str) -> Result<String, ApiError>;
    fn fetch_asset(&self, site: &str, theme: &str, asset: &RemoteAsset) -> Result<Vec<u8>, ApiError>;
    fn upload_code(
        &self,
        site: &str,
        theme: &str,
        kind: Kind,
        name: &str,
        content: &str,
    ) -> Result<(), ApiError>;
    fn upload_asset(&self, site: &str, theme: &str, name: &str, bytes: Vec<u8>) -> Result<(), ApiError>;
}

/// The remote rendering endpoint used by the dev server.
pub trait Simulator {
    fn render(&self, site: &str, bundle: &RenderBundle) -> Result<RenderResponse, ApiError>;
}

/// Blocking API client: the reqwest client, the API root and an optional
/// token for authenticated calls.
#[derive(Clone)]
pub struct ApiClient {
    client: Client,
    base_url: String,
    token: Option<String>,
}

impl ApiClient {
    /// Create a client for `host`. Proxies come from `HTTP_PROXY` /
    /// `HTTPS_PROXY` through reqwest's system proxy support.
    pub fn new(host: &str, token: Option<String>) -> anyhow::Result<Self> {
        let client = Client::builder()
            .user_agent(user_agent())
            .timeout(Duration::from_secs(HTTP_TIMEOUT_SECS))
            .build()
            .context("Failed to build HTTP client")?;
        Ok(ApiClient {
            client,
            base_url: host.trim_end_matches('/').to_string(),
            token,
        })
    }

    /// Host name used in connection error messages.
    fn host_name(&self) -> String {
        host_of(&self.base_url)
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// True when `url` points at the configured API host. Only those
    /// requests may carry the token.
    fn is_api_url(&self, url: &str) -> bool {
        match url.strip_prefix(&self.base_url) {
            Some(rest) => rest.is_empty() || rest.starts_with('/') || rest.starts_with('?'),
            None => false,
        }
    }

    fn auth_headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        if let Some(t) = &self.token {
            if let Ok(val) = HeaderValue::from_str(&format!("Token token=\"{}\"", t)) {
                headers.insert(AUTHORIZATION, val);
            }
        }
        headers
    }

    fn send(&self, req: RequestBuilder, site: Option<&str>) -> Result<Response, ApiError> {
        let mut req = req.headers(self.auth_headers());
        if let Some(site) = site {
            req = req.header(SITE_HEADER, site);
        }
        let res = req.send().map_err(|source| ApiError::Network {
            host: self.host_name(),
            source,
        })?;
        debug!(url = %res.url(), status = %res.status(), "api response");
        check_status(res)
    }

    fn get_json<T: DeserializeOwned>(&self, path: &str, site: Option<&str>) -> Result<T, ApiError> {
        let url = self.url(path);
        let res = self.send(self.client.get(&url), site)?;
        res.json().map_err(|source| ApiError::Decode { url, source })
    }

    /// Exchange login and password for an API token.
    pub fn authenticate(&self, user: &str, password: &str) -> Result<String, ApiError> {
        #[derive(Deserialize)]
        struct TokenResponse {
            token: String,
        }

        let url = self.url("/auth/login");
        let res = self
            .client
            .post(&url)
            .basic_auth(user, Some(password))
            .send()
            .map_err(|source| ApiError::Network {
                host: self.host_name(),
                source,
            })?;
        let res = check_status(res)?;
        let body: TokenResponse = res.json().map_err(|source| ApiError::Decode { url, source })?;
        Ok(body.token)
    }

    pub fn whoami(&self) -> Result<User, ApiError> {
        self.get_json("/user", None)
    }

    pub fn list_sites(&self) -> Result<Vec<Site>, ApiError> {
        self.get_json("/sites", None)
    }
}

fn host_of(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| url.to_string())
}

fn check_status(res: Response) -> Result<Response, ApiError> {
    let status = res.status();
    if status.is_success() {
        return Ok(res);
    }
    let body = res.text().unwrap_or_default();
    Err(match status {
        StatusCode::UNAUTHORIZED => ApiError::Unauthorized,
        StatusCode::FORBIDDEN => ApiError::Forbidden {
            message: extract_error_message(&body, "You don't have access to this resource"),
        },
        StatusCode::NOT_FOUND => ApiError::NotFound {
            message: extract_error_message(&body, "Resource not found"),
        },
        other => ApiError::Server {
            status: other.as_u16(),
            message: extract_error_message(&body, "Internal server error"),
            body,
        },
    })
}

impl ThemeApi for ApiClient {
    fn list_themes(&self, site: &str) -> Result<Vec<Theme>, ApiError> {
        self.get_json("/themes", Some(site))
    }

    fn theme_contents(&self, site: &str, theme: &str) -> Result<ThemeContents, ApiError> {
        self.get_json(&format!("/themes/{theme}"), Some(site))
    }

    fn fetch_code(&self, site: &str, theme: &str, kind: Kind, id: &str) -> Result<String, ApiError> {
        let value: serde_json::Value =
            self.get_json(&format!("/themes/{theme}/{}/{id}", kind.dir()), Some(site))?;
        let code = value
            .get("code")
            .or_else(|| value.get("content"))
            .and_then(|v| v.as_str())
            .unwrap_or_default();
        Ok(code.to_string())
    }

    fn fetch_asset(&self, site: &str, theme: &str, asset: &RemoteAsset) -> Result<Vec<u8>, ApiError> {
        let url = match &asset.url {
            Some(url) => url.clone(),
            None => {
                let id = match &asset.id {
                    serde_json::Value::String(s) => s.clone(),
                    other => other.to_string(),
                };
                let detail: RemoteAsset =
                    self.get_json(&format!("/themes/{theme}/assets/{id}"), Some(site))?;
                detail.url.ok_or_else(|| ApiError::NotFound {
                    message: format!("no download url for {}", asset.path()),
                })?
            }
        };
        let res = if self.is_api_url(&url) {
            self.send(self.client.get(&url), Some(site))?
        } else {
            // CDN and other external hosts never see the token
            let res = self.client.get(&url).send().map_err(|source| ApiError::Network {
                host: host_of(&url),
                source,
            })?;
            debug!(url = %res.url(), status = %res.status(), "asset response");
            check_status(res)?
        };
        let bytes = res.bytes().map_err(|source| ApiError::Decode { url, source })?;
        Ok(bytes.to_vec())
    }

    fn upload_code(
        &self,
        site: &str,
        theme: &str,
        kind: Kind,
        name: &str,
        content: &str,
    ) -> Result<(), ApiError> {
        let url = self.url(&format!("/themes/{theme}/{}", kind.dir()));
        let payload = serde_json::json!({ "name": name, "content": content });
        self.send(self.client.post(&url).json(&payload), Some(site))?;
        Ok(())
    }

    fn upload_asset(&self, site: &str, theme: &str, name: &str, bytes: Vec<u8>) -> Result<(), ApiError> {
        let url = self.url(&format!("/themes/{theme}/assets"));
        let file_name = name.rsplit('/').next().unwrap_or(name).to_string();
        let part = multipart::Part::bytes(bytes).file_name(file_name);
        let form = multipart::Form::new()
            .text("name", name.to_string())
            .part("file", part);
        self.send(self.client.post(&url).multipart(form), Some(site))?;
        Ok(())
    }
}

impl Simulator for ApiClient {
    fn render(&self, site: &str, bundle: &RenderBundle) -> Result<RenderResponse, ApiError> {
        let url = self.url("/simulator/render");
        let res = self.send(self.client.post(&url).json(bundle), Some(site))?;
        res.json().map_err(|source| ApiError::Decode { url, source })
    }
}
