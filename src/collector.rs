// Local file collection for theme projects.
//
// A theme project keeps each kind of content in its own top-level
// directory. Collection returns kind-relative paths with forward slashes,
// sorted, so two runs over an unchanged tree give the same list.

use std::fmt;
use std::path::Path;
use walkdir::WalkDir;

/// The kinds of theme content, in upload order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Kind {
    Layouts,
    Templates,
    Snippets,
    Stylesheets,
    Javascripts,
    Images,
    Fonts,
}

impl Kind {
    pub const ALL: [Kind; 7] = [
        Kind::Layouts,
        Kind::Templates,
        Kind::Snippets,
        Kind::Stylesheets,
        Kind::Javascripts,
        Kind::Images,
        Kind::Fonts,
    ];

    pub const LIQUID: [Kind; 3] = [Kind::Layouts, Kind::Templates, Kind::Snippets];

    /// Directory name inside the project, also used as the API path segment.
    pub fn dir(self) -> &'static str {
        match self {
            Kind::Layouts => "layouts",
            Kind::Templates => "templates",
            Kind::Snippets => "snippets",
            Kind::Stylesheets => "stylesheets",
            Kind::Javascripts => "javascripts",
            Kind::Images => "images",
            Kind::Fonts => "fonts",
        }
    }

    pub fn is_liquid(self) -> bool {
        matches!(self, Kind::Layouts | Kind::Templates | Kind::Snippets)
    }

    /// Whether a file name belongs to this kind.
    pub fn matches(self, name: &str) -> bool {
        match self {
            Kind::Layouts | Kind::Templates | Kind::Snippets => name.ends_with(".liquid"),
            Kind::Stylesheets => name.ends_with(".css"),
            Kind::Javascripts => name.ends_with(".js"),
            Kind::Images | Kind::Fonts => true,
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir())
    }
}

/// List the files of `kind` under `root/<kind>/`.
pub fn collect(kind: Kind, root: &Path) -> Vec<String> {
    collect_matching(kind, root, |name| kind.matches(name))
}

/// Like [`collect`], but also picks up `*.liquid.haml` sources. Used when
/// packing templates for the simulator.
pub fn collect_templates(kind: Kind, root: &Path) -> Vec<String> {
    collect_matching(kind, root, |name| {
        kind.matches(name) || (kind.is_liquid() && name.ends_with(".liquid.haml"))
    })
}

fn collect_matching(kind: Kind, root: &Path, accept: impl Fn(&str) -> bool) -> Vec<String> {
    let base = root.join(kind.dir());
    if !base.is_dir() {
        return Vec::new();
    }

    let mut paths: Vec<String> = WalkDir::new(&base)
        .follow_links(true)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter_map(|e| {
            let rel = e.path().strip_prefix(&base).ok()?;
            let rel = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy().into_owned())
                .collect::<Vec<_>>()
                .join("/");
            accept(&rel).then_some(rel)
        })
        .collect();

    paths.sort();
    paths
}
