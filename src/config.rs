// Configuration: where the API lives, which site/theme a project directory
// works on, and the environment overrides for both.
//
// The project file is `nimbu.yml` in the project root:
//
//     site: mysite
//     theme: default-theme

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::ToolbeltError;

pub const DEFAULT_HOST: &str = "https://api.nimbu.io";
pub const DEFAULT_THEME: &str = "default-theme";
pub const CONFIG_FILE: &str = "nimbu.yml";

/// Settings resolved once per invocation and passed down explicitly.
#[derive(Debug, Clone)]
pub struct Settings {
    /// API root, e.g. `https://api.nimbu.io`.
    pub host: String,
    pub site_override: Option<String>,
    pub theme_override: Option<String>,
    pub api_key: Option<String>,
    /// Project root (defaults to the current directory).
    pub root: PathBuf,
    pub debug: bool,
}

impl Settings {
    /// Build settings from `NIMBU_HOST`, `NIMBU_SITE`, `NIMBU_THEME` and
    /// `NIMBU_API_KEY`.
    pub fn from_env(root: PathBuf, debug: bool) -> Self {
        Settings {
            host: non_empty_env("NIMBU_HOST").unwrap_or_else(|| DEFAULT_HOST.to_string()),
            site_override: non_empty_env("NIMBU_SITE"),
            theme_override: non_empty_env("NIMBU_THEME"),
            api_key: non_empty_env("NIMBU_API_KEY"),
            root,
            debug,
        }
    }

    /// Host used for the admin area and public pages: the API host without
    /// scheme and without the `api.` prefix (`https://api.nimbu.io` -> `nimbu.io`).
    pub fn admin_host(&self) -> String {
        let bare = self
            .host
            .trim_start_matches("https://")
            .trim_start_matches("http://");
        bare.strip_prefix("api.").unwrap_or(bare).trim_end_matches('/').to_string()
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    /// Resolve the site and theme this invocation works on.
    pub fn project(&self) -> Result<Project, ToolbeltError> {
        let stored = ProjectConfig::load(&self.root)?;

        let site = match (&self.site_override, &stored) {
            (Some(site), _) => site.clone(),
            (None, Some(cfg)) => cfg.site.clone(),
            (None, None) => {
                return Err(ToolbeltError::ConfigurationMissing {
                    path: self.config_path(),
                })
            }
        };

        let theme = self
            .theme_override
            .clone()
            .or_else(|| stored.as_ref().and_then(|cfg| cfg.theme.clone()))
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_THEME.to_string());

        Ok(Project {
            root: self.root.clone(),
            site,
            theme,
        })
    }
}

fn non_empty_env(key: &str) -> Option<String> {
    std::env::var(key).ok().filter(|v| !v.trim().is_empty())
}

/// The site and theme a working directory is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Project {
    pub root: PathBuf,
    pub site: String,
    pub theme: String,
}

impl Project {
    pub fn new(root: impl Into<PathBuf>, site: &str, theme: &str) -> Self {
        Project {
            root: root.into(),
            site: site.to_string(),
            theme: theme.to_string(),
        }
    }
}

/// On-disk shape of `nimbu.yml`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProjectConfig {
    pub site: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub theme: Option<String>,
}

impl ProjectConfig {
    /// Read the project file. Returns `None` when the file is absent or has
    /// no site set.
    pub fn load(root: &Path) -> Result<Option<ProjectConfig>, ToolbeltError> {
        let path = root.join(CONFIG_FILE);
        if !path.is_file() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&path)?;
        if raw.trim().is_empty() {
            return Ok(None);
        }
        let cfg: ProjectConfig = serde_yaml::from_str(&raw)?;
        if cfg.site.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(cfg))
    }

    pub fn save(&self, root: &Path) -> Result<PathBuf, ToolbeltError> {
        let path = root.join(CONFIG_FILE);
        fs::create_dir_all(root)?;
        write_owner_only(&path, serde_yaml::to_string(self)?.as_bytes())?;
        Ok(path)
    }
}

/// Create or truncate `path` as an owner-only (0600) file, then write
/// `contents`. Permissions are tightened before any byte is written.
pub(crate) fn write_owner_only(path: &Path, contents: &[u8]) -> std::io::Result<()> {
    use std::io::Write;

    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path)?;
    // `mode` only applies to new files
    set_owner_only(path, 0o600)?;
    file.write_all(contents)?;
    file.sync_all()
}

/// Restrict a file or directory to its owner. No-op on non-unix platforms.
pub(crate) fn set_owner_only(path: &Path, mode: u32) -> std::io::Result<()> {
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(mode))?;
    }
    #[cfg(not(unix))]
    {
        let _ = (path, mode);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn settings(root: &Path) -> Settings {
        Settings {
            host: DEFAULT_HOST.to_string(),
            site_override: None,
            theme_override: None,
            api_key: None,
            root: root.to_path_buf(),
            debug: false,
        }
    }

    #[test]
    fn admin_host_strips_scheme_and_api_prefix() {
        let dir = TempDir::new().unwrap();
        let mut s = settings(dir.path());
        assert_eq!(s.admin_host(), "nimbu.io");

        s.host = "http://api.nimbu.test:3000/".into();
        assert_eq!(s.admin_host(), "nimbu.test:3000");

        s.host = "https://staging.example.com".into();
        assert_eq!(s.admin_host(), "staging.example.com");
    }

    #[test]
    fn missing_config_is_reported() {
        let dir = TempDir::new().unwrap();
        let err = settings(dir.path()).project().unwrap_err();
        assert!(matches!(err, ToolbeltError::ConfigurationMissing { .. }));
    }

    #[test]
    fn config_round_trips_and_defaults_theme() {
        let dir = TempDir::new().unwrap();
        ProjectConfig {
            site: "demo".into(),
            theme: None,
        }
        .save(dir.path())
        .unwrap();

        let project = settings(dir.path()).project().unwrap();
        assert_eq!(project.site, "demo");
        assert_eq!(project.theme, DEFAULT_THEME);
    }

    #[test]
    fn overrides_win_over_file() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "site: demo\ntheme: blue\n").unwrap();

        let mut s = settings(dir.path());
        s.theme_override = Some("red".into());
        let project = s.project().unwrap();
        assert_eq!(project.site, "demo");
        assert_eq!(project.theme, "red");

        s.site_override = Some("other".into());
        assert_eq!(s.project().unwrap().site, "other");
    }

    #[test]
    fn empty_site_counts_as_unconfigured() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(CONFIG_FILE), "site: ''\n").unwrap();
        assert_eq!(ProjectConfig::load(dir.path()).unwrap(), None);
    }

    #[cfg(unix)]
    #[test]
    fn saved_config_is_owner_only() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = ProjectConfig {
            site: "demo".into(),
            theme: Some("default-theme".into()),
        }
        .save(dir.path())
        .unwrap();
        let mode = fs::metadata(path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }

    #[cfg(unix)]
    #[test]
    fn owner_only_write_tightens_an_existing_file_before_writing() {
        use std::os::unix::fs::PermissionsExt;
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("secret");
        fs::write(&path, "old contents that are longer").unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).unwrap();

        write_owner_only(&path, b"new").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        let mode = fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);

        let fresh = dir.path().join("fresh");
        write_owner_only(&fresh, b"x").unwrap();
        let mode = fs::metadata(&fresh).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
    }
}
