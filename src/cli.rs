// Command-line interface: the clap command registry and one handler per
// command. Handlers return `anyhow::Result`; `main` prints the error and
// sets the exit status.

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use crossterm::style::Stylize;
use std::fs;
use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use tracing::{debug, info};

use crate::api::{user_agent, ApiClient, ThemeApi};
use crate::collector::Kind;
use crate::config::{ProjectConfig, Settings, DEFAULT_THEME};
use crate::credentials::CredentialStore;
use crate::error::{ApiError, ToolbeltError};
use crate::server::{self, DevServer, RunOptions, ServerOptions, DEFAULT_PORT, DEFAULT_WEBPACK_URL};
use crate::themes::{print_diff, PushOptions, ThemeSync};
use crate::ui;

const LOGIN_ATTEMPTS: u32 = 3;

#[derive(Parser, Debug)]
#[command(name = "nimbu")]
#[command(version, about = "Work on Nimbu themes from your terminal")]
pub struct Cli {
    /// Print debug output (same as RUST_LOG=nimbu_toolbelt=debug)
    #[arg(long, short = 'd', global = true)]
    pub debug: bool,

    /// Project directory (defaults to the current directory)
    #[arg(long, global = true, value_name = "DIR")]
    pub dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Log in and store an API token for this host
    #[command(name = "auth:login", visible_alias = "login")]
    Login,

    /// Clear the stored credentials
    #[command(name = "auth:logout", visible_alias = "logout")]
    Logout,

    /// Print the API token in use
    #[command(name = "auth:token")]
    Token,

    /// Show who you are logged in as
    #[command(name = "auth:whoami", visible_alias = "whoami")]
    Whoami,

    /// List the sites you can edit
    #[command(name = "sites", visible_alias = "sites:list")]
    Sites,

    /// List the themes of the configured site
    #[command(name = "themes")]
    Themes,

    /// List layouts, templates, snippets and assets of a theme
    #[command(name = "themes:list")]
    ThemesList {
        /// Theme to show (defaults to the configured theme)
        theme: Option<String>,
    },

    /// Show differences between local and server templates
    #[command(name = "themes:diff")]
    ThemesDiff { theme: Option<String> },

    /// Upload local files to the configured theme
    #[command(name = "themes:push")]
    ThemesPush(PushArgs),

    /// Download a theme into this directory, overwriting local files
    #[command(name = "themes:download", visible_alias = "themes:pull")]
    ThemesDownload { theme: Option<String> },

    /// Run the local development server
    #[command(name = "server")]
    Server(ServerArgs),

    /// Bind this directory to a site and theme
    #[command(name = "init")]
    Init,

    /// Open the site in your browser
    #[command(name = "browse")]
    Browse(BrowseArgs),

    /// Open the local simulator in your browser
    #[command(name = "browse:simulator")]
    BrowseSimulator(BrowseArgs),

    /// Open the admin area of the site in your browser
    #[command(name = "browse:admin")]
    BrowseAdmin(BrowseArgs),

    /// Print the toolbelt version
    #[command(name = "version")]
    Version,
}

#[derive(Args, Debug, Default)]
pub struct PushArgs {
    /// Only push layouts, templates and snippets
    #[arg(long, visible_alias = "liquid-only")]
    pub liquid: bool,

    /// Only push stylesheets
    #[arg(long, visible_alias = "css-only")]
    pub css: bool,

    /// Only push javascripts
    #[arg(long, visible_alias = "js-only")]
    pub js: bool,

    /// Only push images
    #[arg(long = "images-only")]
    pub images: bool,

    /// Only push fonts
    #[arg(long = "fonts-only")]
    pub fonts: bool,

    /// Only push these files, e.g. `stylesheets/app.css`
    #[arg(long, num_args = 1.., value_name = "PATH")]
    pub only: Vec<String>,

    /// Push assets even when no template references them
    #[arg(long)]
    pub force: bool,
}

impl From<PushArgs> for PushOptions {
    fn from(args: PushArgs) -> Self {
        PushOptions {
            liquid: args.liquid,
            css: args.css,
            js: args.js,
            images: args.images,
            fonts: args.fonts,
            only: args.only,
            force: args.force,
        }
    }
}

#[derive(Args, Debug)]
pub struct ServerArgs {
    #[arg(long, short = 'p', default_value_t = DEFAULT_PORT)]
    pub port: u16,

    /// Address to bind (defaults to `::` when IPv6 is available)
    #[arg(long)]
    pub host: Option<String>,

    /// Start the HAML watcher
    #[arg(long)]
    pub haml: bool,

    /// Start the Compass watcher
    #[arg(long, short = 'c')]
    pub compass: bool,

    /// Comma separated webpack resources under /javascripts
    #[arg(long, value_delimiter = ',', value_name = "RES")]
    pub webpack: Vec<String>,

    /// Where the webpack dev server runs
    #[arg(long, default_value = DEFAULT_WEBPACK_URL, value_name = "URL")]
    pub webpackurl: String,

    /// Skip the session cookie check
    #[arg(long)]
    pub nocookies: bool,
}

#[derive(Args, Debug)]
pub struct BrowseArgs {
    /// Print the URL instead of opening a browser
    #[arg(short = 'u')]
    pub url_only: bool,
}

/// Run the parsed command.
pub fn run(cli: Cli) -> Result<()> {
    let root = match cli.dir {
        Some(dir) => dir,
        None => std::env::current_dir().context("Could not determine the current directory")?,
    };
    let settings = Settings::from_env(root, cli.debug);
    debug!(host = %settings.host, root = %settings.root.display(), "resolved settings");

    match cli.command {
        Commands::Login => login(&settings),
        Commands::Logout => logout(&settings),
        Commands::Token => token(&settings),
        Commands::Whoami => whoami(&settings),
        Commands::Sites => sites(&settings),
        Commands::Themes => themes_index(&settings),
        Commands::ThemesList { theme } => themes_list(&settings, theme),
        Commands::ThemesDiff { theme } => themes_diff(&settings, theme),
        Commands::ThemesPush(args) => themes_push(&settings, args.into()),
        Commands::ThemesDownload { theme } => themes_download(&settings, theme),
        Commands::Server(args) => serve(&settings, args),
        Commands::Init => init(&settings),
        Commands::Browse(args) => {
            let project = settings.project()?;
            let url = format!("https://{}.{}", project.site, settings.admin_host());
            browse(&url, args.url_only)
        }
        Commands::BrowseSimulator(args) => {
            browse(&format!("http://localhost:{DEFAULT_PORT}"), args.url_only)
        }
        Commands::BrowseAdmin(args) => {
            let project = settings.project()?;
            let url = format!("https://{}.{}/admin", project.site, settings.admin_host());
            browse(&url, args.url_only)
        }
        Commands::Version => {
            println!("{}", user_agent());
            Ok(())
        }
    }
}

/// Client carrying the stored (or `NIMBU_API_KEY`) token. Without one, an
/// interactive terminal gets the login prompt first.
fn authenticated_client(settings: &Settings) -> Result<ApiClient> {
    let store = CredentialStore::new(settings);
    let token = match store.get() {
        Ok(token) => token,
        Err(e @ ToolbeltError::AuthenticationRequired { .. }) => {
            if !io::stdin().is_terminal() {
                return Err(e.into());
            }
            login(settings)?;
            store.get()?
        }
        Err(e) => return Err(e.into()),
    };
    ApiClient::new(&settings.host, Some(token))
}

fn login(settings: &Settings) -> Result<()> {
    let store = CredentialStore::new(settings);
    let api = ApiClient::new(&settings.host, None)?;
    println!("Please authenticate with {}:", store.host());

    for attempt in 1..=LOGIN_ATTEMPTS {
        let (user, password) = ui::prompt_credentials()?;
        let spinner = ui::spinner("Logging in...");
        let result = api.authenticate(&user, &password);
        spinner.finish_and_clear();

        match result {
            Ok(token) => {
                let path = store.save(&user, &token)?;
                info!(path = %path.display(), "credentials saved");
                println!(" => Authentication successful.");
                return Ok(());
            }
            Err(ApiError::Unauthorized) => {
                debug!(attempt, "login rejected");
                println!(" => could not login... please check your username and/or password!\n");
            }
            Err(e) => return Err(e).context("Could not log in"),
        }
    }
    Err(ToolbeltError::AuthenticationFailed {
        attempts: LOGIN_ATTEMPTS,
    }
    .into())
}

fn logout(settings: &Settings) -> Result<()> {
    CredentialStore::new(settings).delete()?;
    println!("=> Local credentials cleared.");
    Ok(())
}

fn token(settings: &Settings) -> Result<()> {
    let token = CredentialStore::new(settings).get()?;
    println!("=> Your personal API token is: {token}");
    Ok(())
}

fn whoami(settings: &Settings) -> Result<()> {
    let api = authenticated_client(settings)?;
    let user = api.whoami().context("Could not fetch the current user")?;
    println!(" => Logged in as: {} ({})", user.name, user.email);
    Ok(())
}

fn sites(settings: &Settings) -> Result<()> {
    let api = authenticated_client(settings)?;
    let sites = api.list_sites().context("Could not list your sites")?;
    if sites.is_empty() {
        println!("You don't have access to any Nimbu sites.");
        return Ok(());
    }
    println!("\nYou have access to following sites:\n");
    for site in &sites {
        println!(" - {} => http://{}", site.name.as_str().bold(), site.domain);
    }
    Ok(())
}

fn themes_index(settings: &Settings) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;
    ThemeSync::new(&api, &project).list_themes(&mut io::stdout().lock())?;
    Ok(())
}

fn themes_list(settings: &Settings, theme: Option<String>) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;
    let theme = theme.unwrap_or_else(|| project.theme.clone());
    ThemeSync::new(&api, &project).list(&theme, &mut io::stdout().lock())?;
    Ok(())
}

fn themes_diff(settings: &Settings, theme: Option<String>) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;
    let theme = theme.unwrap_or_else(|| project.theme.clone());

    let spinner = ui::spinner("Comparing with the server...");
    let records = ThemeSync::new(&api, &project).diff(&theme);
    spinner.finish_and_clear();

    let mut out = io::stdout().lock();
    writeln!(
        out,
        "\nShowing differences between local and server\nlayouts, templates and snippets for '{}':",
        theme.as_str().green().bold()
    )?;
    print_diff(&records?, &mut out)?;
    Ok(())
}

fn themes_push(settings: &Settings, opts: PushOptions) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;
    let report = ThemeSync::new(&api, &project).push(&opts, &mut io::stdout().lock())?;
    if !report.failed.is_empty() {
        return Err(ToolbeltError::PushFailed {
            failed: report.failed.len(),
            total: report.attempted(),
        }
        .into());
    }
    Ok(())
}

fn themes_download(settings: &Settings, theme: Option<String>) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;
    let theme = theme.unwrap_or_else(|| project.theme.clone());
    let report = ThemeSync::new(&api, &project).download(&theme, &mut io::stdout().lock())?;
    if !report.failed.is_empty() {
        return Err(ToolbeltError::DownloadFailed {
            failed: report.failed.len(),
            total: report.written.len() + report.failed.len(),
        }
        .into());
    }
    Ok(())
}

/// `::` when the machine can bind IPv6, otherwise `127.0.0.1`.
fn default_bind_host() -> String {
    match std::net::TcpListener::bind("[::1]:0") {
        Ok(_) => "::".to_string(),
        Err(_) => "127.0.0.1".to_string(),
    }
}

fn serve(settings: &Settings, args: ServerArgs) -> Result<()> {
    let project = settings.project()?;
    let api = authenticated_client(settings)?;

    let options = ServerOptions {
        root: project.root.clone(),
        site: project.site.clone(),
        admin_host: settings.admin_host(),
        session_id: server::generate_session_id(),
        check_cookies: !args.nocookies,
        webpack_resources: args.webpack,
        webpack_url: args.webpackurl,
        debug: settings.debug,
        user_agent: user_agent(),
    };

    println!(
        "Starting up local Nimbu Toolbelt Server ({}) for '{}':",
        env!("CARGO_PKG_VERSION"),
        project.site.as_str().bold()
    );
    match (args.haml, args.compass) {
        (true, true) => println!(" - with local HAML and Compass watcher"),
        (true, false) => println!(" - with local HAML watcher"),
        (false, true) => println!(" - with local Compass watcher"),
        (false, false) => {}
    }
    if !options.check_cookies {
        println!(" - skipping cookies check");
    }
    if !options.webpack_resources.is_empty() {
        println!(" - proxying webpack resources to {}", options.webpack_url);
    }

    let run = RunOptions {
        host: args.host.unwrap_or_else(default_bind_host),
        port: args.port,
        haml: args.haml,
        compass: args.compass,
    };
    server::run(DevServer::new(options, api), run)
}

fn init(settings: &Settings) -> Result<()> {
    let store = CredentialStore::new(settings);
    let configured = ProjectConfig::load(&settings.root)?;
    if configured.is_some() && store.get().is_ok() {
        println!(
            "{}: this directory is already configured as a Nimbu theme.",
            "CONGRATULATIONS!".green().bold()
        );
        return Ok(());
    }

    let api = authenticated_client(settings)?;

    println!("Initializing the Nimbu configuration file.");
    let config = match configured {
        Some(config) => config,
        None => ask_for_configuration(&api)?,
    };
    let path = config.save(&settings.root)?;
    debug!(path = %path.display(), "configuration written");

    println!("Initializing directories:");
    for kind in Kind::ALL {
        println!(" - {}", kind.dir());
        fs::create_dir_all(settings.root.join(kind.dir()))
            .with_context(|| format!("Could not create {}", kind.dir()))?;
    }
    ui::success("Done. Happy coding!");
    Ok(())
}

fn ask_for_configuration(api: &ApiClient) -> Result<ProjectConfig> {
    let sites = api.list_sites().context("Could not list your sites")?;
    if sites.is_empty() {
        return Err(ToolbeltError::NoSites.into());
    }
    let site = &sites[ui::choose_site(&sites)?];
    println!("Site chosen => {} (http://{})", site.name.as_str().bold(), site.domain);

    let themes = api
        .list_themes(&site.subdomain)
        .with_context(|| format!("Could not list the themes of '{}'", site.subdomain))?;
    let theme = if themes.is_empty() {
        DEFAULT_THEME.to_string()
    } else {
        let theme = &themes[ui::choose_theme(&themes)?];
        println!("Theme chosen => {}", theme.name);
        theme.short.clone()
    };

    Ok(ProjectConfig {
        site: site.subdomain.clone(),
        theme: Some(theme),
    })
}

fn browse(url: &str, url_only: bool) -> Result<()> {
    if url_only {
        println!("{url}");
        return Ok(());
    }
    let mut cmd = if cfg!(target_os = "macos") {
        std::process::Command::new("open")
    } else if cfg!(windows) {
        let mut cmd = std::process::Command::new("cmd");
        cmd.args(["/C", "start", ""]);
        cmd
    } else {
        std::process::Command::new("xdg-open")
    };
    cmd.arg(url)
        .spawn()
        .with_context(|| format!("Could not open a browser for {url}"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("nimbu").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn command_definitions_are_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn aliases_reach_the_same_commands() {
        assert!(matches!(parse(&["login"]).command, Commands::Login));
        assert!(matches!(parse(&["whoami"]).command, Commands::Whoami));
        assert!(matches!(parse(&["sites:list"]).command, Commands::Sites));
        assert!(matches!(
            parse(&["themes:pull", "other"]).command,
            Commands::ThemesDownload { theme: Some(ref t) } if t == "other"
        ));
    }

    #[test]
    fn push_flags_map_to_options() {
        let Commands::ThemesPush(args) =
            parse(&["themes:push", "--css-only", "--only", "stylesheets/a.css", "./stylesheets/b.css"])
                .command
        else {
            panic!("expected themes:push");
        };
        let opts: PushOptions = args.into();
        assert!(opts.css);
        assert!(!opts.liquid && !opts.force);
        assert_eq!(opts.only, vec!["stylesheets/a.css", "./stylesheets/b.css"]);
    }

    #[test]
    fn server_defaults() {
        let cli = parse(&["server", "--webpack", "app.js,vendor.js", "--nocookies", "--debug"]);
        assert!(cli.debug);
        let Commands::Server(args) = cli.command else {
            panic!("expected server");
        };
        assert_eq!(args.port, DEFAULT_PORT);
        assert_eq!(args.webpack, vec!["app.js", "vendor.js"]);
        assert_eq!(args.webpackurl, DEFAULT_WEBPACK_URL);
        assert!(args.nocookies);
        assert!(!args.haml && !args.compass);
    }
}
