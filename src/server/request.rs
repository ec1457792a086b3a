// Owned request/response types for the dev server.
//
// The HTTP transport converts each connection into an `IncomingRequest`
// and writes back an `OutgoingResponse`; everything in between works on
// these plain values.

use base64::Engine;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// A browser request as seen by the dev server.
#[derive(Debug, Clone, Default)]
pub struct IncomingRequest {
    /// Method as sent by the client, e.g. `GET`.
    pub method: String,
    /// Path plus query string.
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Vec<u8>,
    pub host: String,
    pub port: u16,
}

impl IncomingRequest {
    #[cfg(test)]
    pub fn get(url: &str) -> Self {
        IncomingRequest {
            method: "GET".into(),
            url: url.into(),
            host: "localhost".into(),
            port: 4567,
            ..Default::default()
        }
    }

    #[cfg(test)]
    pub fn with_header(mut self, name: &str, value: &str) -> Self {
        self.headers.push((name.to_string(), value.to_string()));
        self
    }

    pub fn path(&self) -> &str {
        self.url.split_once('?').map_or(self.url.as_str(), |(p, _)| p)
    }

    pub fn query(&self) -> &str {
        self.url.split_once('?').map_or("", |(_, q)| q)
    }

    /// First header with this name, case-insensitive.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }

    pub fn content_type(&self) -> &str {
        self.header("Content-Type").unwrap_or("")
    }

    pub fn is_multipart(&self) -> bool {
        self.content_type()
            .to_ascii_lowercase()
            .starts_with("multipart/form-data")
    }

    fn is_form(&self) -> bool {
        self.content_type()
            .to_ascii_lowercase()
            .starts_with("application/x-www-form-urlencoded")
    }

    /// Cookies sent by the browser.
    pub fn cookies(&self) -> BTreeMap<String, String> {
        let mut jar = BTreeMap::new();
        for (name, value) in &self.headers {
            if !name.eq_ignore_ascii_case("Cookie") {
                continue;
            }
            for pair in value.split(';') {
                if let Some((k, v)) = pair.trim().split_once('=') {
                    jar.insert(k.trim().to_string(), v.trim().to_string());
                }
            }
        }
        jar
    }

    /// Lower-case method, honouring a `_method` override on form posts.
    pub fn effective_method(&self, params: &Map<String, Value>) -> String {
        let method = self.method.to_ascii_lowercase();
        if method == "post" {
            if let Some(Value::String(over)) = params.get("_method") {
                let over = over.to_ascii_lowercase();
                if matches!(over.as_str(), "put" | "patch" | "delete") {
                    return over;
                }
            }
        }
        method
    }

    /// Query, form and multipart parameters, nested the Rack way
    /// (`post[title]=x` becomes `{"post": {"title": "x"}}`). Uploaded files
    /// become `{type: "file", data: <base64>, filename}`.
    pub fn params(&self) -> Map<String, Value> {
        let mut params = Map::new();
        for (k, v) in url::form_urlencoded::parse(self.query().as_bytes()) {
            insert_nested(&mut params, &k, Value::String(v.into_owned()));
        }
        if self.is_form() {
            for (k, v) in url::form_urlencoded::parse(&self.body) {
                insert_nested(&mut params, &k, Value::String(v.into_owned()));
            }
        } else if self.is_multipart() {
            if let Some(boundary) = boundary(self.content_type()) {
                for part in parse_multipart(&self.body, &boundary) {
                    let value = match part.filename {
                        Some(filename) => file_value(&part.data, &filename),
                        None => Value::String(String::from_utf8_lossy(&part.data).into_owned()),
                    };
                    insert_nested(&mut params, &part.name, value);
                }
            }
        }
        params
    }

    /// Base64 of the raw body for multipart requests.
    pub fn multipart_body(&self) -> Option<String> {
        self.is_multipart()
            .then(|| base64::engine::general_purpose::STANDARD.encode(&self.body))
    }

    /// JSON object describing the request the way a Rack environment does:
    /// `REQUEST_METHOD`, `PATH_INFO`, `HTTP_*` headers and so on.
    pub fn env_json(&self, user_agent: &str) -> String {
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("REQUEST_METHOD".into(), self.method.to_ascii_uppercase());
        env.insert("PATH_INFO".into(), self.path().to_string());
        env.insert("QUERY_STRING".into(), self.query().to_string());
        env.insert("REQUEST_URI".into(), self.url.clone());
        env.insert("SERVER_NAME".into(), self.host.clone());
        env.insert("SERVER_PORT".into(), self.port.to_string());

        for (name, value) in &self.headers {
            let key = name.to_ascii_uppercase().replace('-', "_");
            let key = if key == "CONTENT_TYPE" || key == "CONTENT_LENGTH" {
                key
            } else {
                format!("HTTP_{key}")
            };
            env.entry(key)
                .and_modify(|existing| {
                    existing.push_str(", ");
                    existing.push_str(value);
                })
                .or_insert_with(|| value.clone());
        }
        env.insert("HTTP_X_NIMBU_SIMULATOR".into(), user_agent.to_string());

        serde_json::to_string(&env).unwrap_or_else(|_| "{}".to_string())
    }
}

fn file_value(data: &[u8], filename: &str) -> Value {
    serde_json::json!({
        "type": "file",
        "data": base64::engine::general_purpose::STANDARD.encode(data),
        "filename": filename,
    })
}

/// Insert `value` under a Rack-style key: `a`, `a[b]`, `a[b][c]` or `a[]`.
pub fn insert_nested(params: &mut Map<String, Value>, key: &str, value: Value) {
    let (head, rest) = match key.find('[') {
        Some(i) if i > 0 => (&key[..i], &key[i..]),
        _ => {
            params.insert(key.to_string(), value);
            return;
        }
    };

    let mut segments: Vec<&str> = Vec::new();
    let mut remaining = rest;
    while let Some(stripped) = remaining.strip_prefix('[') {
        match stripped.find(']') {
            Some(end) => {
                segments.push(&stripped[..end]);
                remaining = &stripped[end + 1..];
            }
            None => break,
        }
    }

    let slot = params.entry(head.to_string()).or_insert(Value::Null);
    insert_segments(slot, &segments, value);
}

fn insert_segments(slot: &mut Value, segments: &[&str], value: Value) {
    let Some((first, rest)) = segments.split_first() else {
        *slot = value;
        return;
    };

    if first.is_empty() {
        if !slot.is_array() {
            *slot = Value::Array(Vec::new());
        }
        if let Value::Array(items) = slot {
            let mut child = Value::Null;
            insert_segments(&mut child, rest, value);
            items.push(child);
        }
        return;
    }

    if !slot.is_object() {
        *slot = Value::Object(Map::new());
    }
    if let Value::Object(map) = slot {
        let child = map.entry(first.to_string()).or_insert(Value::Null);
        insert_segments(child, rest, value);
    }
}

/// One part of a multipart body.
#[derive(Debug, Clone, PartialEq)]
pub struct Part {
    pub name: String,
    pub filename: Option<String>,
    pub data: Vec<u8>,
}

fn boundary(content_type: &str) -> Option<String> {
    content_type.split(';').find_map(|piece| {
        let (k, v) = piece.trim().split_once('=')?;
        k.eq_ignore_ascii_case("boundary")
            .then(|| v.trim().trim_matches('"').to_string())
    })
}

/// Split a multipart/form-data body into its parts.
pub fn parse_multipart(body: &[u8], boundary: &str) -> Vec<Part> {
    let delimiter = format!("--{boundary}");
    let delimiter = delimiter.as_bytes();
    let mut parts = Vec::new();

    let Some(mut pos) = find(body, delimiter, 0) else {
        return parts;
    };
    loop {
        let start = pos + delimiter.len();
        if body[start..].starts_with(b"--") {
            break;
        }
        let Some(next) = find(body, delimiter, start) else {
            break;
        };
        if let Some(part) = parse_part(&body[start..next]) {
            parts.push(part);
        }
        pos = next;
    }
    parts
}

fn parse_part(raw: &[u8]) -> Option<Part> {
    let raw = raw.strip_prefix(b"\r\n").unwrap_or(raw);
    let split = find(raw, b"\r\n\r\n", 0)?;
    let head = String::from_utf8_lossy(&raw[..split]);
    let mut data = &raw[split + 4..];
    data = data.strip_suffix(b"\r\n").unwrap_or(data);

    let mut name = None;
    let mut filename = None;
    for line in head.lines() {
        let Some((header, value)) = line.split_once(':') else {
            continue;
        };
        if !header.trim().eq_ignore_ascii_case("Content-Disposition") {
            continue;
        }
        for attr in value.split(';') {
            if let Some((k, v)) = attr.trim().split_once('=') {
                let v = v.trim().trim_matches('"').to_string();
                match k.trim() {
                    "name" => name = Some(v),
                    "filename" => filename = Some(v),
                    _ => {}
                }
            }
        }
    }

    Some(Part {
        name: name?,
        filename: filename.filter(|f| !f.is_empty()),
        data: data.to_vec(),
    })
}

fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|i| i + from)
}

/// A response produced by the dev server. Header values are raw bytes.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct OutgoingResponse {
    pub status: u16,
    pub headers: Vec<(String, Vec<u8>)>,
    pub body: Vec<u8>,
}

impl OutgoingResponse {
    pub fn html(status: u16, body: String) -> Self {
        OutgoingResponse {
            status,
            headers: vec![(
                "Content-Type".into(),
                b"text/html;charset=utf-8".to_vec(),
            )],
            body: body.into_bytes(),
        }
    }

    pub fn with_header(mut self, name: &str, value: impl Into<Vec<u8>>) -> Self {
        self.headers.push((name.to_string(), value.into()));
        self
    }

    /// All values of a header, case-insensitive.
    pub fn header_values(&self, name: &str) -> Vec<&[u8]> {
        self.headers
            .iter()
            .filter(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_slice())
            .collect()
    }

    pub fn header(&self, name: &str) -> Option<&[u8]> {
        self.header_values(name).into_iter().next()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_path_and_query() {
        let req = IncomingRequest::get("/blog/?page=2&tag=rust");
        assert_eq!(req.path(), "/blog/");
        assert_eq!(req.query(), "page=2&tag=rust");
        assert_eq!(IncomingRequest::get("/").query(), "");
    }

    #[test]
    fn parses_cookie_header() {
        let req = IncomingRequest::get("/")
            .with_header("Cookie", "a=1; nimbu_simulator_id=xyz ; empty=");
        let jar = req.cookies();
        assert_eq!(jar["a"], "1");
        assert_eq!(jar["nimbu_simulator_id"], "xyz");
        assert_eq!(jar["empty"], "");
    }

    #[test]
    fn nests_rack_style_params() {
        let mut req = IncomingRequest::get("/search?q=shoes&filter[size]=42&tags[]=a&tags[]=b");
        req.method = "POST".into();
        req.headers.push((
            "Content-Type".into(),
            "application/x-www-form-urlencoded".into(),
        ));
        req.body = b"post%5Btitle%5D=Hello+world&_method=put".to_vec();

        let params = req.params();
        assert_eq!(params["q"], "shoes");
        assert_eq!(params["filter"]["size"], "42");
        assert_eq!(params["tags"], serde_json::json!(["a", "b"]));
        assert_eq!(params["post"]["title"], "Hello world");
        assert_eq!(req.effective_method(&params), "put");
    }

    #[test]
    fn multipart_files_become_file_values() {
        let body = b"--XyZ\r\n\
Content-Disposition: form-data; name=\"contact[name]\"\r\n\r\n\
Jane\r\n\
--XyZ\r\n\
Content-Disposition: form-data; name=\"contact[cv]\"; filename=\"cv.pdf\"\r\n\
Content-Type: application/pdf\r\n\r\n\
%PDF\x00\x01\r\n\
--XyZ--\r\n";
        let mut req = IncomingRequest::get("/contact");
        req.method = "POST".into();
        req.headers.push((
            "Content-Type".into(),
            "multipart/form-data; boundary=XyZ".into(),
        ));
        req.body = body.to_vec();

        let params = req.params();
        assert_eq!(params["contact"]["name"], "Jane");
        let cv = &params["contact"]["cv"];
        assert_eq!(cv["type"], "file");
        assert_eq!(cv["filename"], "cv.pdf");
        let data = base64::engine::general_purpose::STANDARD
            .decode(cv["data"].as_str().unwrap())
            .unwrap();
        assert_eq!(data, b"%PDF\x00\x01");

        let raw = base64::engine::general_purpose::STANDARD
            .decode(req.multipart_body().unwrap())
            .unwrap();
        assert_eq!(raw, body.to_vec());
    }

    #[test]
    fn env_json_uses_rack_names() {
        let req = IncomingRequest::get("/a?b=c")
            .with_header("User-Agent", "curl/8")
            .with_header("Content-Type", "text/plain")
            .with_header("Accept", "text/html")
            .with_header("Accept", "*/*");
        let env: BTreeMap<String, String> =
            serde_json::from_str(&req.env_json("nimbu-toolbelt/test")).unwrap();
        assert_eq!(env["REQUEST_METHOD"], "GET");
        assert_eq!(env["PATH_INFO"], "/a");
        assert_eq!(env["QUERY_STRING"], "b=c");
        assert_eq!(env["HTTP_USER_AGENT"], "curl/8");
        assert_eq!(env["CONTENT_TYPE"], "text/plain");
        assert_eq!(env["HTTP_ACCEPT"], "text/html, */*");
        assert_eq!(env["HTTP_X_NIMBU_SIMULATOR"], "nimbu-toolbelt/test");
    }
}
