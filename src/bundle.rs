// Render request bundle sent to the simulator.
//
// Local layouts, templates and snippets are gathered into a
// `{kind: {name: source}}` map, serialised as JSON, zlib-compressed at the
// default level and base64-encoded. The result travels as `code` inside the
// bundle together with a description of the incoming browser request.

use base64::Engine;
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::collector::{collect_templates, Kind};

/// `kind -> name -> source`
pub type TemplateSet = BTreeMap<String, BTreeMap<String, String>>;

#[derive(Error, Debug)]
pub enum BundleError {
    /// A file was listed but disappeared before it could be read.
    #[error("{kind} file is missing: {}", file.display())]
    Missing { kind: Kind, file: PathBuf },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid base64 payload: {0}")]
    Base64(#[from] base64::DecodeError),
}

/// Files that go into a render bundle, as `(kind, name)` pairs.
pub type TemplateListing = Vec<(Kind, String)>;

/// Every layout, template and snippet under `root`.
pub fn list_templates(root: &Path) -> TemplateListing {
    Kind::LIQUID
        .into_iter()
        .flat_map(|kind| collect_templates(kind, root).into_iter().map(move |name| (kind, name)))
        .collect()
}

/// Read the listed files. A listed file that is gone by now is reported as
/// [`BundleError::Missing`].
pub fn read_templates(root: &Path, listing: &[(Kind, String)]) -> Result<TemplateSet, BundleError> {
    let mut set = TemplateSet::new();
    for (kind, name) in listing {
        let file = root.join(kind.dir()).join(name);
        let bytes = match std::fs::read(&file) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(BundleError::Missing { kind: *kind, file });
            }
            Err(e) => return Err(e.into()),
        };
        set.entry(kind.dir().to_string())
            .or_default()
            .insert(name.clone(), String::from_utf8_lossy(&bytes).into_owned());
    }
    Ok(set)
}

pub fn load_templates(root: &Path) -> Result<TemplateSet, BundleError> {
    read_templates(root, &list_templates(root))
}

/// JSON -> zlib -> base64
pub fn encode_templates(set: &TemplateSet) -> Result<String, BundleError> {
    let json = serde_json::to_vec(set)?;
    let mut encoder = ZlibEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&json)?;
    let compressed = encoder.finish()?;
    Ok(base64::engine::general_purpose::STANDARD.encode(compressed))
}

/// Inverse of [`encode_templates`].
pub fn decode_templates(code: &str) -> Result<TemplateSet, BundleError> {
    let compact: String = code.chars().filter(|c| !c.is_whitespace()).collect();
    let compressed = base64::engine::general_purpose::STANDARD.decode(compact)?;
    let mut json = Vec::new();
    ZlibDecoder::new(compressed.as_slice()).read_to_end(&mut json)?;
    Ok(serde_json::from_slice(&json)?)
}

/// Read and encode the listed templates in one step.
pub fn pack_templates(root: &Path, listing: &[(Kind, String)]) -> Result<String, BundleError> {
    encode_templates(&read_templates(root, listing)?)
}

/// Top-level payload of a simulator render call.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RenderBundle {
    pub simulator: SimulatorPayload,
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SimulatorPayload {
    pub version: String,
    pub path: String,
    pub code: String,
    pub request: RenderRequest,
}

/// The browser request being simulated.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct RenderRequest {
    pub host: String,
    pub port: u16,
    pub params: serde_json::Map<String, serde_json::Value>,
    pub method: String,
    pub session: BTreeMap<String, String>,
    /// JSON object (as a string) of the request environment.
    pub headers: String,
    /// Base64 of the raw body, only for multipart uploads.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RenderBundle {
    pub fn new(path: String, code: String, request: RenderRequest) -> Self {
        RenderBundle {
            simulator: SimulatorPayload {
                version: "v2".to_string(),
                path,
                code,
                request,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write(root: &Path, rel: &str, body: &str) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, body).unwrap();
    }

    #[test]
    fn pack_then_unpack_reproduces_the_sources() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "layouts/default.liquid", "<html>{{ content_for_layout }}</html>");
        write(dir.path(), "templates/index.liquid", "héllo\r\nwörld\n");
        write(dir.path(), "templates/blog/post.liquid", "{% include 'meta' %}");
        write(dir.path(), "snippets/meta.liquid", "<meta charset=\"utf-8\">");
        write(dir.path(), "stylesheets/app.css", "body {}");

        let loaded = load_templates(dir.path()).unwrap();
        let code = pack_templates(dir.path(), &list_templates(dir.path())).unwrap();
        let unpacked = decode_templates(&code).unwrap();

        assert_eq!(unpacked, loaded);
        assert_eq!(unpacked.len(), 3);
        assert_eq!(unpacked["templates"]["index.liquid"], "héllo\r\nwörld\n");
        assert_eq!(
            unpacked["templates"]["blog/post.liquid"],
            "{% include 'meta' %}"
        );
        assert!(!unpacked.contains_key("stylesheets"));
    }

    #[test]
    fn empty_project_packs_to_an_empty_map() {
        let dir = TempDir::new().unwrap();
        let code = pack_templates(dir.path(), &list_templates(dir.path())).unwrap();
        assert!(decode_templates(&code).unwrap().is_empty());
    }

    #[test]
    fn listed_file_that_vanished_is_reported_missing() {
        let dir = TempDir::new().unwrap();
        write(dir.path(), "snippets/gone.liquid", "bye");
        let listing = list_templates(dir.path());
        assert_eq!(listing, vec![(Kind::Snippets, "gone.liquid".to_string())]);
        fs::remove_file(dir.path().join("snippets/gone.liquid")).unwrap();

        match read_templates(dir.path(), &listing) {
            Err(BundleError::Missing { kind, file }) => {
                assert_eq!(kind, Kind::Snippets);
                assert_eq!(file, dir.path().join("snippets/gone.liquid"));
            }
            other => panic!("expected a missing file, got {other:?}"),
        }
    }

    #[test]
    fn decode_accepts_wrapped_base64() {
        let mut set = TemplateSet::new();
        set.entry("snippets".into())
            .or_default()
            .insert("a.liquid".into(), "x".repeat(500));
        let code = encode_templates(&set).unwrap();
        let wrapped: String = code
            .as_bytes()
            .chunks(60)
            .map(|c| format!("{}\n", String::from_utf8_lossy(c)))
            .collect();
        assert_eq!(decode_templates(&wrapped).unwrap(), set);
    }

    #[test]
    fn bundle_serialises_with_simulator_envelope() {
        let bundle = RenderBundle::new(
            "/blog".into(),
            "abc".into(),
            RenderRequest {
                host: "localhost".into(),
                port: 4567,
                params: serde_json::Map::new(),
                method: "get".into(),
                session: BTreeMap::new(),
                headers: "{}".into(),
                body: None,
            },
        );
        let value = serde_json::to_value(&bundle).unwrap();
        assert_eq!(value["simulator"]["version"], "v2");
        assert_eq!(value["simulator"]["path"], "/blog");
        assert_eq!(value["simulator"]["request"]["port"], 4567);
        assert!(value["simulator"]["request"].get("body").is_none());
    }
}
