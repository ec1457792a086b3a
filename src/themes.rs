// Theme sync engine: list, diff, push and download theme content between a
// local project directory and the remote API.
//
// All operations are best effort per file: one failing upload or download
// is reported and the batch carries on.

use anyhow::{Context, Result};
use crossterm::style::Stylize;
use similar::TextDiff;
use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tracing::{debug, warn};

use crate::api::{RemoteAsset, Theme, ThemeApi, ThemeContents};
use crate::collector::{collect, Kind};
use crate::config::Project;

/// How a server-side entry compares to the local copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffStatus {
    Changed,
    Missing,
    Unchanged,
}

/// One compared entry. `diff` holds a unified diff for changed entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffRecord {
    pub kind: Kind,
    pub name: String,
    pub status: DiffStatus,
    pub diff: Option<String>,
}

/// Selection flags for `themes:push`.
#[derive(Debug, Clone, Default)]
pub struct PushOptions {
    pub liquid: bool,
    pub css: bool,
    pub js: bool,
    pub images: bool,
    pub fonts: bool,
    /// Allow-list of project paths such as `stylesheets/app.css`.
    pub only: Vec<String>,
    /// Upload assets even when nothing references them.
    pub force: bool,
}

impl PushOptions {
    /// Kind flags combine; no flag at all selects every kind.
    pub fn selects_kind(&self, kind: Kind) -> bool {
        if !(self.liquid || self.css || self.js || self.images || self.fonts) {
            return true;
        }
        match kind {
            Kind::Layouts | Kind::Templates | Kind::Snippets => self.liquid,
            Kind::Stylesheets => self.css,
            Kind::Javascripts => self.js,
            Kind::Images => self.images,
            Kind::Fonts => self.fonts,
        }
    }

    pub fn selects_path(&self, kind: Kind, rel: &str) -> bool {
        if self.only.is_empty() {
            return true;
        }
        let full = format!("{}/{}", kind.dir(), rel);
        self.only.iter().any(|p| normalize_project_path(p) == full)
    }
}

fn normalize_project_path(path: &str) -> String {
    let path = path.replace('\\', "/");
    path.trim_start_matches("./").trim_start_matches('/').to_string()
}

/// Outcome of a push.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PushReport {
    pub uploaded: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<(String, String)>,
}

impl PushReport {
    pub fn attempted(&self) -> usize {
        self.uploaded.len() + self.failed.len()
    }
}

/// Outcome of a download.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DownloadReport {
    pub written: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Sources that may reference an asset, read once per push.
#[derive(Default)]
struct ReferenceSources {
    liquid: Vec<String>,
    styles_and_scripts: Vec<String>,
}

impl ReferenceSources {
    fn load(root: &Path) -> Self {
        let read_all = |kinds: &[Kind]| -> Vec<String> {
            kinds
                .iter()
                .flat_map(|&kind| {
                    collect(kind, root)
                        .into_iter()
                        .map(move |rel| root.join(kind.dir()).join(rel))
                })
                .filter_map(|path| fs::read(&path).ok())
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .collect()
        };
        ReferenceSources {
            liquid: read_all(&Kind::LIQUID),
            styles_and_scripts: read_all(&[Kind::Stylesheets, Kind::Javascripts]),
        }
    }

    /// Plain substring match of the kind-relative path: stylesheets and
    /// scripts must appear in liquid code, images and fonts in liquid,
    /// stylesheet or script code.
    fn references(&self, kind: Kind, rel: &str) -> bool {
        let in_liquid = || self.liquid.iter().any(|src| src.contains(rel));
        match kind {
            Kind::Layouts | Kind::Templates | Kind::Snippets => true,
            Kind::Stylesheets | Kind::Javascripts => in_liquid(),
            Kind::Images | Kind::Fonts => {
                in_liquid() || self.styles_and_scripts.iter().any(|src| src.contains(rel))
            }
        }
    }
}

/// Strip surrounding whitespace and fold CRLF / CR line endings into LF.
pub fn normalize(content: &str) -> String {
    content.replace("\r\n", "\n").replace('\r', "\n").trim().to_string()
}

pub struct ThemeSync<'a, A: ThemeApi> {
    api: &'a A,
    project: &'a Project,
}

impl<'a, A: ThemeApi> ThemeSync<'a, A> {
    pub fn new(api: &'a A, project: &'a Project) -> Self {
        ThemeSync { api, project }
    }

    /// Print the themes of the configured site.
    pub fn list_themes(&self, out: &mut dyn Write) -> Result<Vec<Theme>> {
        let themes = self
            .api
            .list_themes(&self.project.site)
            .with_context(|| format!("listing themes of '{}'", self.project.site))?;

        if themes.is_empty() {
            writeln!(out, "Hm. You seem to have no themes. Is that normal?")?;
        } else {
            writeln!(out, "\nYou have following themes for this website:")?;
            for theme in &themes {
                writeln!(out, " - {} ({})", theme.name.as_str().bold(), theme.short)?;
            }
        }
        writeln!(out)?;
        writeln!(
            out,
            "Currently this directory is configured for '{}'",
            self.project.theme
        )?;
        Ok(themes)
    }

    /// Print the remote layouts, templates, snippets and assets of `theme`.
    pub fn list(&self, theme: &str, out: &mut dyn Write) -> Result<ThemeContents> {
        let contents = self.contents(theme)?;
        writeln!(
            out,
            "\nShowing layouts, templates, snippets and assets for '{theme}':"
        )?;
        for kind in Kind::LIQUID {
            let items = contents.items(kind);
            if items.is_empty() {
                continue;
            }
            writeln!(out, "\n{}", heading(kind).bold())?;
            for item in items {
                writeln!(out, " - {}/{}", kind.dir(), item.name)?;
            }
        }
        if !contents.assets.is_empty() {
            writeln!(out, "\n{}", "Assets:".bold())?;
            for asset in &contents.assets {
                writeln!(out, " - {}", asset.path())?;
            }
        }
        Ok(contents)
    }

    /// Compare every remote layout, template and snippet with its local
    /// copy. Files that only exist locally are not reported.
    pub fn diff(&self, theme: &str) -> Result<Vec<DiffRecord>> {
        let contents = self.contents(theme)?;
        let mut records = Vec::new();

        for kind in Kind::LIQUID {
            for item in contents.items(kind) {
                let local_path = self.project.root.join(kind.dir()).join(&item.name);
                if !local_path.is_file() {
                    records.push(DiffRecord {
                        kind,
                        name: item.name.clone(),
                        status: DiffStatus::Missing,
                        diff: None,
                    });
                    continue;
                }

                let local = fs::read(&local_path)
                    .with_context(|| format!("reading {}", local_path.display()))?;
                let local = normalize(&String::from_utf8_lossy(&local));
                let server = self
                    .api
                    .fetch_code(&self.project.site, theme, kind, &item.id_string())
                    .with_context(|| format!("fetching {}/{}", kind.dir(), item.name))?;
                let server = normalize(&server);

                let record = if local == server {
                    DiffRecord {
                        kind,
                        name: item.name.clone(),
                        status: DiffStatus::Unchanged,
                        diff: None,
                    }
                } else {
                    let path = format!("{}/{}", kind.dir(), item.name);
                    let diff = TextDiff::from_lines(local.as_str(), server.as_str())
                        .unified_diff()
                        .context_radius(3)
                        .header(&format!("local/{path}"), &format!("server/{path}"))
                        .to_string();
                    DiffRecord {
                        kind,
                        name: item.name.clone(),
                        status: DiffStatus::Changed,
                        diff: Some(diff),
                    }
                };
                records.push(record);
            }
        }
        Ok(records)
    }

    /// Upload local files according to `opts`, in kind order.
    pub fn push(&self, opts: &PushOptions, out: &mut dyn Write) -> Result<PushReport> {
        let root = &self.project.root;
        let sources = if opts.force {
            ReferenceSources::default()
        } else {
            ReferenceSources::load(root)
        };
        let mut report = PushReport::default();

        writeln!(
            out,
            "Pushing layouts, templates and assets for '{}' to the server:",
            self.project.theme
        )?;

        for kind in Kind::ALL {
            if !opts.selects_kind(kind) {
                continue;
            }
            let files: Vec<String> = collect(kind, root)
                .into_iter()
                .filter(|rel| opts.selects_path(kind, rel))
                .collect();
            if files.is_empty() {
                continue;
            }

            writeln!(out, "\n{}", heading(kind))?;
            for rel in files {
                let shown = format!("{}/{}", kind.dir(), rel);
                if !opts.force && !sources.references(kind, &rel) {
                    debug!(file = %shown, "skipping unreferenced asset");
                    writeln!(out, " - {shown} (skipped, not referenced)")?;
                    report.skipped.push(shown);
                    continue;
                }

                match self.upload(kind, &rel) {
                    Ok(()) => {
                        writeln!(out, " - {shown} (ok)")?;
                        report.uploaded.push(shown);
                    }
                    Err(e) => {
                        warn!(file = %shown, error = %format!("{e:#}"), "upload failed");
                        writeln!(out, " - {shown} (failed: {e:#})")?;
                        report.failed.push((shown, format!("{e:#}")));
                    }
                }
            }
        }
        Ok(report)
    }

    fn upload(&self, kind: Kind, rel: &str) -> Result<()> {
        let path = self.project.root.join(kind.dir()).join(rel);
        let bytes = fs::read(&path).with_context(|| format!("reading {}", path.display()))?;
        let (site, theme) = (&self.project.site, &self.project.theme);
        if kind.is_liquid() {
            let content = String::from_utf8_lossy(&bytes);
            self.api.upload_code(site, theme, kind, rel, &content)?;
        } else {
            let name = format!("{}/{}", kind.dir(), rel);
            self.api.upload_asset(site, theme, &name, bytes)?;
        }
        Ok(())
    }

    /// Write every remote entry of `theme` into the project, overwriting
    /// local files.
    pub fn download(&self, theme: &str, out: &mut dyn Write) -> Result<DownloadReport> {
        let contents = self.contents(theme)?;
        let mut report = DownloadReport::default();
        writeln!(out, "Downloading '{theme}' into {}:", self.project.root.display())?;

        let mut entries: Vec<(String, Entry<'_>)> = Vec::new();
        for kind in Kind::LIQUID {
            for item in contents.items(kind) {
                entries.push((
                    format!("{}/{}", kind.dir(), item.name),
                    Entry::Code(kind, item.id_string()),
                ));
            }
        }
        for asset in &contents.assets {
            entries.push((asset.path(), Entry::Asset(asset)));
        }

        let site = &self.project.site;
        for (rel, entry) in entries {
            let result = safe_join(&self.project.root, &rel).and_then(|target| {
                let bytes = match entry {
                    Entry::Code(kind, id) => self.api.fetch_code(site, theme, kind, &id)?.into_bytes(),
                    Entry::Asset(asset) => self.api.fetch_asset(site, theme, asset)?,
                };
                if let Some(parent) = target.parent() {
                    fs::create_dir_all(parent)?;
                }
                fs::write(&target, bytes)?;
                Ok(())
            });
            match result {
                Ok(()) => {
                    writeln!(out, " - {rel} (ok)")?;
                    report.written.push(rel);
                }
                Err(e) => {
                    warn!(file = %rel, error = %format!("{e:#}"), "download failed");
                    writeln!(out, " - {rel} (failed: {e:#})")?;
                    report.failed.push((rel, format!("{e:#}")));
                }
            }
        }
        Ok(report)
    }

    fn contents(&self, theme: &str) -> Result<ThemeContents> {
        self.api
            .theme_contents(&self.project.site, theme)
            .with_context(|| format!("fetching contents of theme '{theme}'"))
    }
}

enum Entry<'c> {
    Code(Kind, String),
    Asset(&'c RemoteAsset),
}

/// Print diff records grouped by kind.
pub fn print_diff(records: &[DiffRecord], out: &mut dyn Write) -> std::io::Result<()> {
    for kind in Kind::LIQUID {
        let of_kind: Vec<&DiffRecord> = records.iter().filter(|r| r.kind == kind).collect();
        if of_kind.is_empty() {
            continue;
        }
        writeln!(out, "\n{}", heading(kind).bold())?;
        let mut differences = 0;
        for record in of_kind {
            match record.status {
                DiffStatus::Unchanged => {}
                DiffStatus::Missing => {
                    differences += 1;
                    writeln!(out, " - {}/{} is {}", kind.dir(), record.name, "missing".red().bold())?;
                }
                DiffStatus::Changed => {
                    differences += 1;
                    writeln!(
                        out,
                        " - {}/{} has {}:\n",
                        kind.dir(),
                        record.name,
                        "changed".yellow().bold()
                    )?;
                    if let Some(diff) = &record.diff {
                        writeln!(out, "{}", diff.trim_end())?;
                    }
                }
            }
        }
        if differences == 0 {
            writeln!(out, "no differences found!")?;
        }
    }
    Ok(())
}

fn heading(kind: Kind) -> &'static str {
    match kind {
        Kind::Layouts => "Layouts:",
        Kind::Templates => "Templates:",
        Kind::Snippets => "Snippets:",
        Kind::Stylesheets => "Stylesheets:",
        Kind::Javascripts => "Javascripts:",
        Kind::Images => "Images:",
        Kind::Fonts => "Fonts:",
    }
}

/// Join a server-provided relative path onto the project root, refusing
/// absolute paths and `..` segments.
fn safe_join(root: &Path, rel: &str) -> Result<PathBuf> {
    let rel_path = Path::new(rel);
    let escapes = rel_path
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
    if escapes || rel.is_empty() {
        anyhow::bail!("refusing to write outside the project: {rel}");
    }
    Ok(root.join(rel_path))
}
