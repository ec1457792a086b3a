// HAML watcher for `nimbu server --haml`.
//
// Sources live under `<root>/haml/` and compile into the same relative path
// under the project root with the `.haml` suffix dropped:
// `haml/templates/page.liquid.haml` becomes `templates/page.liquid`. The
// compiler itself is the external `haml` program.

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{channel, Sender};
use std::time::Duration;
use tracing::{debug, warn};
use walkdir::WalkDir;

use super::pages;
use super::supervisor::{ConsoleLine, Source};

pub const SOURCE_DIR: &str = "haml";

/// `a.liquid.haml -> a.liquid`, `a.html.haml -> a.html`, other `.haml`
/// files lose the extension.
pub fn output_file(relative: &Path) -> PathBuf {
    let name = relative.to_string_lossy();
    let mapped = name
        .strip_suffix(".haml")
        .map(str::to_string)
        .unwrap_or_else(|| name.to_string());
    PathBuf::from(mapped)
}

/// Render one HAML file with the external `haml` program.
pub fn haml_program(source: &Path) -> Result<String, String> {
    let output = Command::new("haml")
        .arg("render")
        .arg(source)
        .output()
        .map_err(|e| format!("could not run haml: {e}"))?;
    if !output.status.success() {
        return Err(String::from_utf8_lossy(&output.stderr).trim().to_string());
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

fn say(tx: &Sender<ConsoleLine>, text: String) {
    let _ = tx.send(ConsoleLine::new(Source::Haml, text));
}

/// Compile `haml/<relative>` into its output file. On failure the error
/// page replaces an existing output so the browser shows what went wrong.
pub fn compile<F>(root: &Path, relative: &Path, render: &F, tx: &Sender<ConsoleLine>)
where
    F: Fn(&Path) -> Result<String, String>,
{
    let source = root.join(SOURCE_DIR).join(relative);
    let output = root.join(output_file(relative));
    let shown = output_file(relative).display().to_string();

    let result = render(&source).and_then(|html| {
        if html.trim().is_empty() {
            Err("Nothing rendered!".to_string())
        } else {
            Ok(html)
        }
    });

    match result {
        Ok(html) => {
            let action = if output.exists() { "overwrite" } else { "   create" };
            let written = output
                .parent()
                .map_or(Ok(()), fs::create_dir_all)
                .and_then(|_| fs::write(&output, html));
            match written {
                Ok(()) => say(tx, format!("{action} {shown}")),
                Err(e) => say(tx, format!("could not write {shown}: {e}")),
            }
        }
        Err(message) => {
            say(tx, format!("error in {}: {message}", relative.display()));
            if output.exists() {
                let page = pages::exception(
                    "You have an Error in your HAML code",
                    &format!("{}: {message}", relative.display()),
                );
                if let Err(e) = fs::write(&output, page) {
                    warn!(file = %output.display(), error = %e, "could not write error page");
                }
            }
        }
    }
}

/// Delete the output of a removed source.
pub fn remove(root: &Path, relative: &Path, tx: &Sender<ConsoleLine>) {
    let output = output_file(relative);
    match fs::remove_file(root.join(&output)) {
        Ok(()) => say(tx, format!("   remove {}", output.display())),
        Err(e) => debug!(file = %output.display(), error = %e, "nothing to remove"),
    }
}

/// Compile every source whose output does not exist yet.
pub fn refresh<F>(root: &Path, render: &F, tx: &Sender<ConsoleLine>)
where
    F: Fn(&Path) -> Result<String, String>,
{
    let base = root.join(SOURCE_DIR);
    for entry in WalkDir::new(&base).into_iter().filter_map(Result::ok) {
        if !entry.file_type().is_file() || !is_haml(entry.path()) {
            continue;
        }
        let Ok(relative) = entry.path().strip_prefix(&base) else {
            continue;
        };
        if !root.join(output_file(relative)).exists() {
            compile(root, relative, render, tx);
        }
    }
}

fn is_haml(path: &Path) -> bool {
    path.extension().is_some_and(|e| e == "haml")
}

/// Watch `haml/` until `running` is cleared.
pub fn watch(root: &Path, running: &AtomicBool, tx: &Sender<ConsoleLine>) {
    refresh(root, &haml_program, tx);

    let base = root.join(SOURCE_DIR);
    if let Err(e) = fs::create_dir_all(&base) {
        say(tx, format!("could not create {}: {e}", base.display()));
        return;
    }

    let (events_tx, events_rx) = channel();
    let watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Ok(event) = res {
                let _ = events_tx.send(event);
            }
        },
        Config::default(),
    );
    let mut watcher = match watcher {
        Ok(watcher) => watcher,
        Err(e) => {
            say(tx, format!("could not start watcher: {e}"));
            return;
        }
    };
    if let Err(e) = watcher.watch(&base, RecursiveMode::Recursive) {
        say(tx, format!("could not watch {}: {e}", base.display()));
        return;
    }
    say(tx, ">>> Haml is watching for changes. Press Ctrl-C to Stop.".to_string());

    while running.load(Ordering::SeqCst) {
        let Ok(first) = events_rx.recv_timeout(Duration::from_millis(250)) else {
            continue;
        };
        // collapse bursts of events into one action per file
        let mut changed = BTreeSet::new();
        let mut removed = BTreeSet::new();
        for event in std::iter::once(first).chain(events_rx.try_iter()) {
            for path in event.paths.iter().filter(|p| is_haml(p)) {
                let Ok(relative) = path.strip_prefix(&base) else {
                    continue;
                };
                match event.kind {
                    EventKind::Remove(_) => {
                        removed.insert(relative.to_path_buf());
                    }
                    EventKind::Create(_) | EventKind::Modify(_) => {
                        changed.insert(relative.to_path_buf());
                    }
                    _ => {}
                }
            }
        }

        for relative in &changed {
            if base.join(relative).is_file() {
                say(tx, format!(">>> Change detected to: {}", relative.display()));
                compile(root, relative, &haml_program, tx);
            } else {
                removed.insert(relative.clone());
            }
        }
        for relative in &removed {
            if !base.join(relative).exists() {
                say(tx, format!(">>> File deleted: {}", relative.display()));
                remove(root, relative, tx);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc::Receiver;
    use tempfile::TempDir;

    fn lines(rx: &Receiver<ConsoleLine>) -> Vec<String> {
        rx.try_iter().map(|l| l.text).collect()
    }

    fn fake_haml(source: &Path) -> Result<String, String> {
        let text = fs::read_to_string(source).map_err(|e| e.to_string())?;
        if text.contains("%broken") {
            Err("Illegal nesting on line 2".to_string())
        } else {
            Ok(format!("<p>{}</p>\n", text.trim()))
        }
    }

    #[test]
    fn outputs_drop_the_haml_extension() {
        assert_eq!(
            output_file(Path::new("templates/page.liquid.haml")),
            PathBuf::from("templates/page.liquid")
        );
        assert_eq!(output_file(Path::new("index.html.haml")), PathBuf::from("index.html"));
    }

    #[test]
    fn refresh_compiles_missing_outputs_only() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("haml/templates")).unwrap();
        fs::create_dir_all(root.join("templates")).unwrap();
        fs::write(root.join("haml/templates/new.liquid.haml"), "hello").unwrap();
        fs::write(root.join("haml/templates/old.liquid.haml"), "fresh").unwrap();
        fs::write(root.join("templates/old.liquid"), "stale").unwrap();

        let (tx, rx) = channel();
        refresh(root, &fake_haml, &tx);

        assert_eq!(
            fs::read_to_string(root.join("templates/new.liquid")).unwrap(),
            "<p>hello</p>\n"
        );
        assert_eq!(fs::read_to_string(root.join("templates/old.liquid")).unwrap(), "stale");
        assert_eq!(lines(&rx), vec!["   create templates/new.liquid"]);
    }

    #[test]
    fn failed_compile_writes_error_page_over_existing_output() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("haml/snippets")).unwrap();
        fs::create_dir_all(root.join("snippets")).unwrap();
        fs::write(root.join("haml/snippets/nav.liquid.haml"), "%broken").unwrap();
        fs::write(root.join("snippets/nav.liquid"), "<nav></nav>").unwrap();

        let (tx, rx) = channel();
        compile(root, Path::new("snippets/nav.liquid.haml"), &fake_haml, &tx);

        let page = fs::read_to_string(root.join("snippets/nav.liquid")).unwrap();
        assert!(page.contains("You have an Error in your HAML code"));
        assert!(page.contains("Illegal nesting on line 2"));
        assert!(lines(&rx)[0].starts_with("error in snippets/nav.liquid.haml"));
    }

    #[test]
    fn failed_compile_without_output_creates_nothing() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::create_dir_all(root.join("haml")).unwrap();
        fs::write(root.join("haml/index.html.haml"), "%broken").unwrap();

        let (tx, _rx) = channel();
        compile(root, Path::new("index.html.haml"), &fake_haml, &tx);
        assert!(!root.join("index.html").exists());
    }

    #[test]
    fn remove_deletes_the_output() {
        let dir = TempDir::new().unwrap();
        let root = dir.path();
        fs::write(root.join("index.html"), "<p></p>").unwrap();

        let (tx, rx) = channel();
        remove(root, Path::new("index.html.haml"), &tx);
        assert!(!root.join("index.html").exists());
        assert_eq!(lines(&rx), vec!["   remove index.html"]);
    }
}
