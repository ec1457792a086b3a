// Local development server.
//
// Every page request is answered by the remote simulator: the local
// layouts, templates and snippets are packed into a render bundle together
// with a description of the browser request, and the simulator's response
// is relayed back. A few paths never reach the simulator (favicon, private
// downloads, webpack bundles, static files under the project root).
//
// `DevServer` works on owned `IncomingRequest`/`OutgoingResponse` values;
// `serve` adapts it to a tiny_http listener.

pub mod haml;
pub mod pages;
pub mod request;
pub mod supervisor;

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Read, Write};
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context};
use percent_encoding::percent_decode_str;
use tracing::{debug, info, warn};

use crate::api::Simulator;
use crate::bundle::{self, BundleError, RenderBundle, RenderRequest};
use crate::collector::Kind;
use crate::config::CONFIG_FILE;
use crate::error::ApiError;

use self::request::{IncomingRequest, OutgoingResponse};
use self::supervisor::{ConsoleLine, Source, Supervisor};

/// Cookie tying a browser to the current server process.
pub const SESSION_COOKIE: &str = "nimbu_simulator_id";

pub const DEFAULT_PORT: u16 = 4567;
pub const DEFAULT_WEBPACK_URL: &str = "http://localhost:8080";

const SESSION_ID_LEN: usize = 40;
const ALPHANUMERIC: &[u8] = b"abcdefghijklmnopqrstuvwxyzABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Headers that describe one connection, not the page. They are never
/// forwarded in either direction.
const HOP_BY_HOP: [&str; 5] = [
    "connection",
    "content-length",
    "keep-alive",
    "transfer-encoding",
    "upgrade",
];

/// 40 random alphanumerics, generated once per server process.
pub fn generate_session_id() -> String {
    let mut id = String::with_capacity(SESSION_ID_LEN);
    while id.len() < SESSION_ID_LEN {
        for byte in uuid::Uuid::new_v4().into_bytes() {
            if id.len() == SESSION_ID_LEN {
                break;
            }
            id.push(ALPHANUMERIC[byte as usize % ALPHANUMERIC.len()] as char);
        }
    }
    id
}

/// Everything the request pipeline needs to know about this server run.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub root: PathBuf,
    pub site: String,
    /// e.g. `nimbu.io`; the site lives at `https://<site>.<admin_host>`.
    pub admin_host: String,
    pub session_id: String,
    /// Run the cookie bootstrap (disabled by `--nocookies`).
    pub check_cookies: bool,
    /// Resource names served by a webpack dev server under `/javascripts/`.
    pub webpack_resources: Vec<String>,
    pub webpack_url: String,
    pub debug: bool,
    pub user_agent: String,
}

impl ServerOptions {
    fn admin_origin(&self) -> String {
        format!("https://{}.{}", self.site, self.admin_host)
    }
}

/// Where a request is answered from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Route {
    /// Stream the response of this absolute URL.
    Passthrough(String),
    Static(PathBuf),
    /// Reserved `/__*` paths.
    Internal,
    Render,
}

/// Result of handling one request.
#[derive(Debug)]
pub enum Handled {
    Response(OutgoingResponse),
    Proxy(String),
}

pub struct DevServer<S: Simulator> {
    options: ServerOptions,
    simulator: S,
    console: Option<Sender<ConsoleLine>>,
}

impl<S: Simulator> DevServer<S> {
    pub fn new(options: ServerOptions, simulator: S) -> Self {
        DevServer {
            options,
            simulator,
            console: None,
        }
    }

    /// Send request log lines to the supervisor console.
    pub fn with_console(mut self, console: Sender<ConsoleLine>) -> Self {
        self.console = Some(console);
        self
    }

    pub fn options(&self) -> &ServerOptions {
        &self.options
    }

    fn say(&self, text: String) {
        match &self.console {
            Some(tx) => {
                let _ = tx.send(ConsoleLine::new(Source::Server, text));
            }
            None => info!("{}", text),
        }
    }

    pub fn route(&self, req: &IncomingRequest) -> Route {
        let path = req.path();

        if path.starts_with("/favicon.ico") {
            return Route::Passthrough(format!("{}/favicon.ico", self.options.admin_origin()));
        }

        let has_key = url::form_urlencoded::parse(req.query().as_bytes()).any(|(k, _)| k == "key");
        if has_key {
            return Route::Passthrough(format!("{}{}", self.options.admin_origin(), req.url));
        }

        if let Some(resource) = path.strip_prefix("/javascripts/") {
            if self.options.webpack_resources.iter().any(|r| r == resource) {
                return Route::Passthrough(format!(
                    "{}{}",
                    self.options.webpack_url.trim_end_matches('/'),
                    path
                ));
            }
        }

        if path.starts_with("/__") {
            return Route::Internal;
        }

        if let Some(file) = self.static_path(path) {
            return Route::Static(file);
        }

        Route::Render
    }

    /// A regular file under the project root, excluding the project file.
    fn static_path(&self, path: &str) -> Option<PathBuf> {
        let decoded = percent_decode_str(path).decode_utf8().ok()?;
        let rel = Path::new(decoded.trim_start_matches('/'));
        if rel.as_os_str().is_empty() || rel == Path::new(CONFIG_FILE) {
            return None;
        }
        if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
            return None;
        }
        let file = self.options.root.join(rel);
        file.is_file().then_some(file)
    }

    pub fn handle(&self, req: &IncomingRequest) -> Handled {
        match self.route(req) {
            Route::Passthrough(url) => {
                debug!(%url, "passing request through");
                Handled::Proxy(url)
            }
            Route::Static(file) => Handled::Response(static_file(&file)),
            Route::Internal => Handled::Response(OutgoingResponse::html(
                404,
                pages::not_found(req.path()),
            )),
            Route::Render => Handled::Response(self.render(req)),
        }
    }

    /// Cookie bootstrap, then pack, render and relay.
    pub fn render(&self, req: &IncomingRequest) -> OutgoingResponse {
        let cookies = req.cookies();
        if self.options.check_cookies
            && cookies.get(SESSION_COOKIE) != Some(&self.options.session_id)
        {
            self.say("Refreshing session for simulation...".to_string());
            return self.refresh_session(req, &cookies);
        }
        let listing = bundle::list_templates(&self.options.root);
        self.render_listed(req, cookies, &listing)
    }

    fn render_listed(
        &self,
        req: &IncomingRequest,
        cookies: BTreeMap<String, String>,
        listing: &[(Kind, String)],
    ) -> OutgoingResponse {
        let params = req.params();
        let method = req.effective_method(&params);
        self.say(format!("{} {}", method.to_ascii_uppercase(), req.url));

        let code = match bundle::pack_templates(&self.options.root, listing) {
            Ok(code) => code,
            Err(BundleError::Missing { kind, file }) => {
                warn!(file = %file.display(), "{kind} file vanished before it could be read");
                return OutgoingResponse::html(
                    500,
                    pages::missing_file(&file.display().to_string(), kind.dir()),
                );
            }
            Err(e) => {
                warn!(error = %e, "could not pack local templates");
                return OutgoingResponse::html(
                    500,
                    pages::exception("Could not read local templates", &e.to_string()),
                );
            }
        };

        let request = RenderRequest {
            host: req.host.clone(),
            port: req.port,
            params,
            method,
            session: cookies,
            headers: req.env_json(&self.options.user_agent),
            body: req.multipart_body(),
        };
        let bundle = RenderBundle::new(render_path(req.path()), code, request);

        match self.simulator.render(&self.options.site, &bundle) {
            Ok(res) => {
                if self.options.debug {
                    debug!(status = res.status, headers = %res.headers, "simulator response");
                }
                relay(res)
            }
            Err(e) => self.render_failed(e),
        }
    }

    fn refresh_session(
        &self,
        req: &IncomingRequest,
        cookies: &BTreeMap<String, String>,
    ) -> OutgoingResponse {
        let mut res = OutgoingResponse {
            status: 302,
            headers: vec![("Location".into(), req.url.clone().into_bytes())],
            body: Vec::new(),
        };
        for name in cookies.keys().filter(|n| n.as_str() != SESSION_COOKIE) {
            res = res.with_header(
                "Set-Cookie",
                format!("{name}=; Path=/; Max-Age=0; Expires=Thu, 01 Jan 1970 00:00:00 GMT"),
            );
        }
        res.with_header(
            "Set-Cookie",
            format!("{}={}; Path=/", SESSION_COOKIE, self.options.session_id),
        )
    }

    fn render_failed(&self, error: ApiError) -> OutgoingResponse {
        debug!(error = %error, "render failed");
        match error {
            ApiError::Forbidden { .. } => {
                OutgoingResponse::html(403, pages::invalid_access(&self.options.site))
            }
            ApiError::Server { status, body, .. } => {
                self.say(format!("Error! ({status}) {}", body.trim()));
                OutgoingResponse::html(200, body)
            }
            ApiError::Unauthorized => OutgoingResponse::html(
                401,
                pages::exception(
                    "Not authenticated",
                    "Your session has expired. Run \"nimbu login\" and reload this page.",
                ),
            ),
            ApiError::NotFound { message } => {
                OutgoingResponse::html(404, pages::exception("Not found", &message))
            }
            other => OutgoingResponse::html(
                502,
                pages::exception("Could not reach the simulator", &other.to_string()),
            ),
        }
    }
}

/// `/blog/` renders as `/blog`; the root stays `/`.
fn render_path(path: &str) -> String {
    match path.trim_end_matches('/') {
        "" => "/".to_string(),
        trimmed => trimmed.to_string(),
    }
}

fn relay(res: crate::api::RenderResponse) -> OutgoingResponse {
    let body = match res.decoded_body() {
        Ok(body) => body,
        Err(e) => {
            return OutgoingResponse::html(
                502,
                pages::exception("Invalid simulator response", &e.to_string()),
            )
        }
    };
    let headers = res
        .header_pairs()
        .into_iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.to_ascii_lowercase().as_str()))
        .collect();
    OutgoingResponse {
        status: res.status,
        headers,
        body,
    }
}

fn static_file(file: &Path) -> OutgoingResponse {
    match fs::read(file) {
        Ok(body) => OutgoingResponse {
            status: 200,
            headers: vec![("Content-Type".into(), content_type(file).as_bytes().to_vec())],
            body,
        },
        Err(e) => OutgoingResponse::html(
            500,
            pages::exception("Could not read file", &format!("{}: {e}", file.display())),
        ),
    }
}

fn content_type(file: &Path) -> &'static str {
    let ext = file
        .extension()
        .and_then(|e| e.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();
    match ext.as_str() {
        "html" | "htm" => "text/html;charset=utf-8",
        "css" => "text/css",
        "js" | "mjs" => "application/javascript",
        "json" | "map" => "application/json",
        "txt" => "text/plain",
        "xml" => "application/xml",
        "svg" => "image/svg+xml",
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "ico" => "image/x-icon",
        "woff" => "font/woff",
        "woff2" => "font/woff2",
        "ttf" => "font/ttf",
        "otf" => "font/otf",
        "eot" => "application/vnd.ms-fontobject",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

// tiny_http adapter

fn to_incoming(req: &mut tiny_http::Request, default_port: u16) -> IncomingRequest {
    let headers: Vec<(String, String)> = req
        .headers()
        .iter()
        .map(|h| (h.field.to_string(), h.value.as_str().to_string()))
        .collect();

    let host_header = headers
        .iter()
        .find(|(n, _)| n.eq_ignore_ascii_case("Host"))
        .map(|(_, v)| v.clone())
        .unwrap_or_else(|| "localhost".to_string());
    let (host, port) = split_host(&host_header, default_port);

    let mut body = Vec::new();
    if let Err(e) = req.as_reader().read_to_end(&mut body) {
        warn!(error = %e, "could not read request body");
    }

    IncomingRequest {
        method: req.method().to_string(),
        url: req.url().to_string(),
        headers,
        body,
        host,
        port,
    }
}

/// `example.test:4567`, `[::1]:4567` or a bare host.
fn split_host(value: &str, default_port: u16) -> (String, u16) {
    if let Some(rest) = value.strip_prefix('[') {
        if let Some((host, tail)) = rest.split_once(']') {
            let port = tail.strip_prefix(':').and_then(|p| p.parse().ok());
            return (host.to_string(), port.unwrap_or(default_port));
        }
    }
    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            (host.to_string(), port.parse().unwrap_or(default_port))
        }
        _ => (value.to_string(), default_port),
    }
}

/// Status line and headers. Header values go out as raw bytes, since
/// tiny_http's own `Header` type only accepts ASCII. With no `length` the
/// body is sent chunked.
fn write_head(
    out: &mut dyn Write,
    status: u16,
    headers: &[(String, Vec<u8>)],
    length: Option<u64>,
) -> io::Result<()> {
    let reason = tiny_http::StatusCode(status).default_reason_phrase();
    write!(out, "HTTP/1.1 {status} {reason}\r\n")?;
    for (name, value) in headers {
        let bad_name = name.is_empty() || name.bytes().any(|b| b <= b' ' || b == b':' || b >= 0x7f);
        if bad_name || value.iter().any(|&b| b == b'\r' || b == b'\n') {
            warn!(header = %name, "dropping header that cannot be written");
            continue;
        }
        out.write_all(name.as_bytes())?;
        out.write_all(b": ")?;
        out.write_all(value)?;
        out.write_all(b"\r\n")?;
    }
    match length {
        Some(len) => write!(out, "Content-Length: {len}\r\n")?,
        None => out.write_all(b"Transfer-Encoding: chunked\r\n")?,
    }
    out.write_all(b"\r\n")
}

fn write_response(out: &mut dyn Write, res: &OutgoingResponse) -> io::Result<()> {
    write_head(out, res.status, &res.headers, Some(res.body.len() as u64))?;
    out.write_all(&res.body)?;
    out.flush()
}

fn write_chunked(out: &mut dyn Write, body: &mut dyn Read) -> io::Result<()> {
    let mut buf = [0u8; 16 * 1024];
    loop {
        let n = match body.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        write!(out, "{n:x}\r\n")?;
        out.write_all(&buf[..n])?;
        out.write_all(b"\r\n")?;
    }
    out.write_all(b"0\r\n\r\n")?;
    out.flush()
}

fn respond(req: tiny_http::Request, res: OutgoingResponse) {
    let mut out = req.into_writer();
    if let Err(e) = write_response(&mut *out, &res) {
        debug!(error = %e, "client went away");
    }
}

/// The browser's request, re-addressed to `url`: same method, same body and
/// every header except `Host` and the hop-by-hop ones.
fn passthrough_request(
    client: &reqwest::blocking::Client,
    req: &IncomingRequest,
    url: &str,
) -> reqwest::blocking::RequestBuilder {
    let method = reqwest::Method::from_bytes(req.method.as_bytes()).unwrap_or(reqwest::Method::GET);
    let mut builder = client.request(method, url);
    for (name, value) in &req.headers {
        let lower = name.to_ascii_lowercase();
        if lower == "host" || HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        let header = (
            reqwest::header::HeaderName::from_bytes(name.as_bytes()),
            reqwest::header::HeaderValue::from_str(value),
        );
        match header {
            (Ok(name), Ok(value)) => builder = builder.header(name, value),
            _ => debug!(header = %name, "not forwarding malformed header"),
        }
    }
    if !req.body.is_empty() {
        builder = builder.body(req.body.clone());
    }
    builder
}

/// Stream a remote resource back to the browser.
fn proxy(
    client: &reqwest::blocking::Client,
    req: tiny_http::Request,
    incoming: &IncomingRequest,
    url: &str,
) {
    let mut remote = match passthrough_request(client, incoming, url).send() {
        Ok(remote) => remote,
        Err(e) => {
            warn!(%url, error = %e, "passthrough failed");
            return respond(
                req,
                OutgoingResponse::html(
                    502,
                    pages::exception("Could not fetch remote resource", &format!("{url}: {e}")),
                ),
            );
        }
    };

    let status = remote.status().as_u16();
    let length = remote.content_length();
    let headers: Vec<(String, Vec<u8>)> = remote
        .headers()
        .iter()
        .filter(|(name, _)| !HOP_BY_HOP.contains(&name.as_str()))
        .map(|(name, value)| (name.as_str().to_string(), value.as_bytes().to_vec()))
        .collect();

    let mut out = req.into_writer();
    let head_only = incoming.method.eq_ignore_ascii_case("HEAD");
    let written = write_head(&mut *out, status, &headers, length).and_then(|()| match length {
        _ if head_only => out.flush(),
        Some(_) => io::copy(&mut remote, &mut out).and_then(|_| out.flush()),
        None => write_chunked(&mut *out, &mut remote),
    });
    if let Err(e) = written {
        debug!(%url, error = %e, "client went away");
    }
}

impl<S: Simulator> DevServer<S> {
    /// Answer requests until `running` is cleared.
    pub fn serve(&self, http: &tiny_http::Server, running: &AtomicBool, port: u16) {
        let client = match reqwest::blocking::Client::builder()
            .user_agent(self.options.user_agent.clone())
            .build()
        {
            Ok(client) => client,
            Err(e) => {
                warn!(error = %e, "could not build passthrough client");
                return;
            }
        };

        while running.load(Ordering::SeqCst) {
            let mut req = match http.recv_timeout(Duration::from_millis(250)) {
                Ok(Some(req)) => req,
                Ok(None) => continue,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    continue;
                }
            };
            let incoming = to_incoming(&mut req, port);
            match self.handle(&incoming) {
                Handled::Response(res) => respond(req, res),
                Handled::Proxy(url) => proxy(&client, req, &incoming, &url),
            }
        }
    }
}

/// How to start `nimbu server`.
#[derive(Debug, Clone)]
pub struct RunOptions {
    pub host: String,
    pub port: u16,
    pub haml: bool,
    pub compass: bool,
}

/// Bind the listener, start the helpers and block until Ctrl+C.
pub fn run<S>(server: DevServer<S>, run: RunOptions) -> anyhow::Result<()>
where
    S: Simulator + Send + 'static,
{
    let addr = if run.host.contains(':') {
        format!("[{}]:{}", run.host, run.port)
    } else {
        format!("{}:{}", run.host, run.port)
    };
    let http = tiny_http::Server::http(&addr)
        .map_err(|e| anyhow!("{e}"))
        .with_context(|| format!("Could not listen on {addr}"))?;

    let running = Arc::new(AtomicBool::new(true));
    {
        let running = Arc::clone(&running);
        ctrlc::set_handler(move || running.store(false, Ordering::SeqCst))
            .context("Could not install the Ctrl+C handler")?;
    }

    let (tx, rx) = mpsc::channel();
    let console = supervisor::spawn_console(rx);
    let root = server.options().root.clone();
    let mut supervisor = Supervisor::new(Arc::clone(&running), tx.clone());

    let _ = tx.send(ConsoleLine::new(
        Source::Server,
        format!("Listening on http://{addr}, CTRL+C to stop"),
    ));

    if run.haml {
        let root = root.clone();
        supervisor.spawn_worker(Source::Haml, move |running, tx| {
            haml::watch(&root, &running, &tx)
        });
    }
    if run.compass {
        let mut cmd = std::process::Command::new("compass");
        cmd.arg("watch").arg(".").current_dir(&root);
        supervisor
            .spawn_process(Source::Compass, cmd)
            .context("Could not start compass")?;
    }

    let port = run.port;
    let server = server.with_console(tx.clone());
    supervisor.spawn_worker(Source::Server, move |running, _tx| {
        server.serve(&http, &running, port)
    });
    drop(tx);

    supervisor.run_until_stopped();
    if console.join().is_err() {
        warn!("console thread panicked");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::api::RenderResponse;
    use base64::Engine;
    use serde_json::json;
    use std::cell::RefCell;
    use tempfile::TempDir;

    struct FakeSimulator {
        reply: RefCell<Option<Result<RenderResponse, ApiError>>>,
        seen: RefCell<Vec<RenderBundle>>,
    }

    impl FakeSimulator {
        fn replying(reply: Result<RenderResponse, ApiError>) -> Self {
            FakeSimulator {
                reply: RefCell::new(Some(reply)),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl Simulator for FakeSimulator {
        fn render(&self, _site: &str, bundle: &RenderBundle) -> Result<RenderResponse, ApiError> {
            self.seen.borrow_mut().push(bundle.clone());
            self.reply
                .borrow_mut()
                .take()
                .unwrap_or_else(|| Err(ApiError::Unauthorized))
        }
    }

    fn page(status: u16, body: &str) -> RenderResponse {
        RenderResponse {
            status,
            headers: json!({"Content-Type": "text/html", "Content-Length": "999"}),
            body: base64::engine::general_purpose::STANDARD.encode(body),
        }
    }

    fn options(root: &Path) -> ServerOptions {
        ServerOptions {
            root: root.to_path_buf(),
            site: "demo".into(),
            admin_host: "nimbu.io".into(),
            session_id: "s".repeat(40),
            check_cookies: true,
            webpack_resources: vec!["app.js".into()],
            webpack_url: DEFAULT_WEBPACK_URL.into(),
            debug: false,
            user_agent: "nimbu-toolbelt/test".into(),
        }
    }

    fn project() -> TempDir {
        let dir = TempDir::new().unwrap();
        fs::create_dir_all(dir.path().join("layouts")).unwrap();
        fs::write(dir.path().join("layouts/default.liquid"), "{{ content_for_layout }}").unwrap();
        fs::create_dir_all(dir.path().join("images")).unwrap();
        fs::write(dir.path().join("images/logo.png"), b"\x89PNG").unwrap();
        fs::write(dir.path().join("nimbu.yml"), "site: demo\n").unwrap();
        dir
    }

    fn with_session(req: IncomingRequest) -> IncomingRequest {
        req.with_header("Cookie", &format!("{SESSION_COOKIE}={}", "s".repeat(40)))
    }

    fn rendered(res: &Handled) -> &OutgoingResponse {
        match res {
            Handled::Response(res) => res,
            Handled::Proxy(url) => panic!("unexpected passthrough to {url}"),
        }
    }

    #[test]
    fn session_ids_are_forty_alphanumerics() {
        let id = generate_session_id();
        assert_eq!(id.len(), 40);
        assert!(id.chars().all(|c| c.is_ascii_alphanumeric()));
        assert_ne!(id, generate_session_id());
    }

    #[test]
    fn routes_are_decided_in_order() {
        let dir = project();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));

        assert_eq!(
            server.route(&IncomingRequest::get("/favicon.ico")),
            Route::Passthrough("https://demo.nimbu.io/favicon.ico".into())
        );
        assert_eq!(
            server.route(&IncomingRequest::get("/downloads/file.pdf?key=abc")),
            Route::Passthrough("https://demo.nimbu.io/downloads/file.pdf?key=abc".into())
        );
        assert_eq!(
            server.route(&IncomingRequest::get("/javascripts/app.js")),
            Route::Passthrough("http://localhost:8080/javascripts/app.js".into())
        );
        assert_eq!(server.route(&IncomingRequest::get("/javascripts/other.js")), Route::Render);
        assert_eq!(server.route(&IncomingRequest::get("/__debug__/x")), Route::Internal);
        assert_eq!(
            server.route(&IncomingRequest::get("/images/logo.png")),
            Route::Static(dir.path().join("images/logo.png"))
        );
        assert_eq!(server.route(&IncomingRequest::get("/nimbu.yml")), Route::Render);
        assert_eq!(server.route(&IncomingRequest::get("/../etc/passwd")), Route::Render);
        assert_eq!(server.route(&IncomingRequest::get("/images")), Route::Render);
    }

    #[test]
    fn static_files_are_served_with_a_content_type() {
        let dir = project();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));
        let handled = server.handle(&IncomingRequest::get("/images/logo.png"));
        let res = rendered(&handled);
        assert_eq!(res.status, 200);
        assert_eq!(res.header("Content-Type"), Some(&b"image/png"[..]));
        assert_eq!(res.body, b"\x89PNG");
    }

    #[test]
    fn first_visit_gets_session_cookie_and_redirect() {
        let dir = project();
        let sim = FakeSimulator::replying(Ok(page(200, "<p>hi</p>")));
        let server = DevServer::new(options(dir.path()), sim);

        let first = IncomingRequest::get("/blog?page=2").with_header("Cookie", "old=1");
        let handled = server.handle(&first);
        let res = rendered(&handled);
        assert_eq!(res.status, 302);
        assert_eq!(res.header("Location"), Some(&b"/blog?page=2"[..]));
        let cookies: Vec<String> = res
            .header_values("Set-Cookie")
            .into_iter()
            .map(|v| String::from_utf8_lossy(v).into_owned())
            .collect();
        assert!(cookies.iter().any(|c| c.starts_with("old=;") && c.contains("Max-Age=0")));
        assert!(cookies.contains(&format!("{SESSION_COOKIE}={}; Path=/", "s".repeat(40))));
        assert!(server.simulator.seen.borrow().is_empty());

        let second = with_session(IncomingRequest::get("/blog?page=2"));
        let handled = server.handle(&second);
        let res = rendered(&handled);
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"<p>hi</p>");
    }

    #[test]
    fn nocookies_skips_the_bootstrap() {
        let dir = project();
        let mut opts = options(dir.path());
        opts.check_cookies = false;
        let server = DevServer::new(opts, FakeSimulator::replying(Ok(page(200, "ok"))));
        let handled = server.handle(&IncomingRequest::get("/"));
        assert_eq!(rendered(&handled).status, 200);
    }

    #[test]
    fn remote_404_is_relayed_verbatim() {
        let dir = project();
        let server = DevServer::new(
            options(dir.path()),
            FakeSimulator::replying(Ok(page(404, "<h1>Not here</h1>"))),
        );
        let handled = server.handle(&with_session(IncomingRequest::get("/missing/")));
        let res = rendered(&handled);
        assert_eq!(res.status, 404);
        assert_eq!(res.body, b"<h1>Not here</h1>");
        assert_eq!(res.header("Content-Type"), Some(&b"text/html"[..]));
        assert!(res.header("Content-Length").is_none());
    }

    #[test]
    fn bundle_describes_the_request() {
        let dir = project();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));
        let mut req = with_session(IncomingRequest::get("/contact/?ref=home"));
        req.method = "POST".into();
        req.headers.push(("Content-Type".into(), "application/x-www-form-urlencoded".into()));
        req.body = b"name=Jane&_method=put".to_vec();
        server.handle(&req);

        let seen = server.simulator.seen.borrow();
        let sim = &seen[0].simulator;
        assert_eq!(sim.version, "v2");
        assert_eq!(sim.path, "/contact");
        assert_eq!(sim.request.method, "put");
        assert_eq!(sim.request.params["ref"], "home");
        assert_eq!(sim.request.params["name"], "Jane");
        assert_eq!(sim.request.session[SESSION_COOKIE], "s".repeat(40));
        assert!(sim.request.headers.contains("HTTP_X_NIMBU_SIMULATOR"));
        assert!(sim.request.body.is_none());

        let templates = bundle::decode_templates(&sim.code).unwrap();
        assert_eq!(
            templates["layouts"]["default.liquid"],
            "{{ content_for_layout }}"
        );
    }

    #[test]
    fn forbidden_renders_invalid_access_page() {
        let dir = project();
        let server = DevServer::new(
            options(dir.path()),
            FakeSimulator::replying(Err(ApiError::Forbidden {
                message: "no access".into(),
            })),
        );
        let handled = server.handle(&with_session(IncomingRequest::get("/")));
        let res = rendered(&handled);
        assert_eq!(res.status, 403);
        assert!(String::from_utf8_lossy(&res.body).contains("Invalid access!"));
    }

    #[test]
    fn server_errors_relay_their_payload() {
        let dir = project();
        let server = DevServer::new(
            options(dir.path()),
            FakeSimulator::replying(Err(ApiError::Server {
                status: 500,
                message: "boom".into(),
                body: "Liquid syntax error in templates/index.liquid".into(),
            })),
        );
        let handled = server.handle(&with_session(IncomingRequest::get("/")));
        let res = rendered(&handled);
        assert_eq!(res.status, 200);
        assert_eq!(res.body, b"Liquid syntax error in templates/index.liquid");
    }

    #[test]
    fn internal_paths_are_not_rendered() {
        let dir = project();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));
        let handled = server.handle(&IncomingRequest::get("/__debug__/404.png"));
        let res = rendered(&handled);
        assert_eq!(res.status, 404);
        assert!(String::from_utf8_lossy(&res.body).contains("This page does not exist!"));
        assert!(server.simulator.seen.borrow().is_empty());
    }

    #[test]
    fn listed_file_missing_on_disk_renders_its_location() {
        let dir = project();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));
        let req = with_session(IncomingRequest::get("/"));
        let mut listing = bundle::list_templates(dir.path());
        listing.push((Kind::Snippets, "gone.liquid".into()));

        let res = server.render_listed(&req, req.cookies(), &listing);

        assert_eq!(res.status, 500);
        let body = String::from_utf8_lossy(&res.body);
        assert!(body.contains("A snippets file is missing!"));
        let expected = dir.path().join("snippets").join("gone.liquid");
        assert!(body.contains(&expected.display().to_string()));
        assert!(server.simulator.seen.borrow().is_empty());
    }

    #[test]
    fn percent_encoded_static_paths_resolve() {
        let dir = project();
        fs::write(dir.path().join("images/my logo.png"), b"png").unwrap();
        let server = DevServer::new(options(dir.path()), FakeSimulator::replying(Ok(page(200, ""))));

        assert_eq!(
            server.route(&IncomingRequest::get("/images/my%20logo.png")),
            Route::Static(dir.path().join("images/my logo.png"))
        );
        assert_eq!(server.route(&IncomingRequest::get("/images/%2e%2e/nimbu.yml")), Route::Render);
        assert_eq!(server.route(&IncomingRequest::get("/nimbu%2Eyml")), Route::Render);
    }

    #[test]
    fn non_ascii_header_values_are_written_as_raw_bytes() {
        let res = relay(RenderResponse {
            status: 200,
            headers: json!({
                "Content-Type": "application/pdf",
                "Content-Disposition": "attachment; filename=\"résumé.pdf\"",
                "Content-Length": "999"
            }),
            body: base64::engine::general_purpose::STANDARD.encode("%PDF"),
        });
        let mut wire = Vec::new();
        write_response(&mut wire, &res).unwrap();

        let text = String::from_utf8(wire).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Disposition: attachment; filename=\"résumé.pdf\"\r\n"));
        assert!(text.contains("Content-Type: application/pdf\r\n"));
        assert!(text.contains("Content-Length: 4\r\n"));
        assert!(!text.contains("999"));
        assert!(text.ends_with("\r\n\r\n%PDF"));
    }

    #[test]
    fn header_values_that_would_split_the_response_are_dropped() {
        let res = OutgoingResponse::html(200, "ok".to_string())
            .with_header("X-Evil", "a\r\nSet-Cookie: stolen=1")
            .with_header("X-Fine", "yes");
        let mut wire = Vec::new();
        write_response(&mut wire, &res).unwrap();

        let text = String::from_utf8(wire).unwrap();
        assert!(!text.contains("stolen"));
        assert!(text.contains("X-Fine: yes\r\n"));
    }

    #[test]
    fn streamed_bodies_without_length_are_chunked() {
        let mut wire = Vec::new();
        write_head(&mut wire, 206, &[], None).unwrap();
        write_chunked(&mut wire, &mut &b"hello"[..]).unwrap();

        assert_eq!(
            String::from_utf8(wire).unwrap(),
            "HTTP/1.1 206 Partial Content\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n\r\n"
        );
    }

    #[test]
    fn passthrough_forwards_method_headers_and_body() {
        let client = reqwest::blocking::Client::new();
        let mut req = IncomingRequest::get("/downloads/file.pdf?key=abc")
            .with_header("Host", "localhost:4567")
            .with_header("Range", "bytes=0-99")
            .with_header("Cookie", "nimbu_simulator_id=abc")
            .with_header("Connection", "keep-alive")
            .with_header("Content-Type", "application/x-www-form-urlencoded");
        req.method = "POST".into();
        req.body = b"a=1".to_vec();

        let built = passthrough_request(&client, &req, "https://demo.nimbu.io/downloads/file.pdf?key=abc")
            .build()
            .unwrap();

        assert_eq!(built.method(), &reqwest::Method::POST);
        assert_eq!(built.url().as_str(), "https://demo.nimbu.io/downloads/file.pdf?key=abc");
        let headers = built.headers();
        assert_eq!(headers["range"], "bytes=0-99");
        assert_eq!(headers["cookie"], "nimbu_simulator_id=abc");
        assert_eq!(headers["content-type"], "application/x-www-form-urlencoded");
        assert!(headers.get("host").is_none());
        assert!(headers.get("connection").is_none());
        assert_eq!(built.body().and_then(|b| b.as_bytes()), Some(&b"a=1"[..]));
    }

    #[test]
    fn host_header_is_split_into_host_and_port() {
        assert_eq!(split_host("localhost:4567", 80), ("localhost".into(), 4567));
        assert_eq!(split_host("[::1]:8000", 80), ("::1".into(), 8000));
        assert_eq!(split_host("example.test", 4567), ("example.test".into(), 4567));
    }

    #[test]
    fn render_path_strips_trailing_slash() {
        assert_eq!(render_path("/"), "/");
        assert_eq!(render_path("/blog/"), "/blog");
        assert_eq!(render_path("/blog"), "/blog");
    }
}
