/// CLI surface and resolved server configuration.
///
/// Precedence when a value appears in several places: command-line flag,
/// then INI config file, then built-in default.
use anyhow::{bail, Context, Result};
use clap::Parser;
use config::FileFormat;
use directories::ProjectDirs;
use std::path::{Path, PathBuf};
use tracing::info;

/// Database filename inside the data dir.
pub const DB_FILENAME: &str = "you-get-web.sqlite";
/// Netscape cookie jar filename inside the data dir, handed to the engine.
pub const COOKIES_FILENAME: &str = "you-get-web-cookies.txt";
/// Key prefix for GUI settings persisted in the database.
pub const SETTINGS_PREFIX: &str = "settings_";

/// Seconds between periodic task flushes to the database.
pub const FLUSH_INTERVAL_SECS: u64 = 3;
/// Scheduling priority given to plain submissions.
pub const DEFAULT_PRIORITY: i64 = 100;

const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 8080;
const DEFAULT_MAX_TASKS: usize = 5;
const DEFAULT_MAX_RETRY: i64 = 3;

/// Command-line arguments.
#[derive(Parser, Debug, Default)]
#[command(name = "you-get-web", version, about = "Web GUI for the you-get media downloader")]
pub struct Args {
    /// Path to the INI config file
    #[arg(short = 'c', long = "config", value_name = "CONFIG", env = "YOU_GET_WEB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Download destination directory
    #[arg(
        short = 'o',
        long = "output-dir",
        value_name = "OUTPUT_DIR",
        env = "YOU_GET_WEB_OUTPUT_DIR"
    )]
    pub output_dir: Option<PathBuf>,

    /// Server state directory (task database, cookies, cached rules)
    #[arg(
        short = 'd',
        long = "data-dir",
        value_name = "DATA_DIR",
        env = "YOU_GET_WEB_DATA_DIR"
    )]
    pub data_dir: Option<PathBuf>,

    /// HTTP server flavor
    #[arg(short = 's', long = "server-type", value_enum, value_name = "SERVER_TYPE")]
    pub server_type: Option<ServerType>,

    /// Bind address
    #[arg(short = 'i', long = "host", value_name = "HOST", env = "YOU_GET_WEB_HOST")]
    pub host: Option<String>,

    /// Bind port
    #[arg(short = 'p', long = "port", value_name = "PORT", env = "YOU_GET_WEB_PORT")]
    pub port: Option<u16>,

    /// Enable debug mode
    #[arg(short = 'D', long = "debug")]
    pub debug: bool,
}

/// Which tokio runtime drives the HTTP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ServerType {
    /// Multi-thread runtime, one worker per core.
    Threaded,
    /// Current-thread runtime.
    Single,
}

impl ServerType {
    fn parse_name(s: &str) -> Option<ServerType> {
        match s.trim().to_ascii_lowercase().as_str() {
            "threaded" => Some(ServerType::Threaded),
            "single" => Some(ServerType::Single),
            _ => None,
        }
    }
}

impl std::fmt::Display for ServerType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ServerType::Threaded => write!(f, "threaded"),
            ServerType::Single => write!(f, "single"),
        }
    }
}

/// Fully resolved server configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub config_file: PathBuf,
    pub output_dir: PathBuf,
    pub data_dir: PathBuf,
    pub server_type: ServerType,
    pub host: String,
    pub port: u16,
    pub debug: bool,
    pub max_tasks: usize,
    pub max_retry: i64,
    pub engine_path: String,
    pub auto_extractor_proxy: bool,
}

impl Config {
    /// Merge CLI flags, the INI file, and defaults into a usable config.
    /// Writes a commented template on first run so the user has something
    /// to edit.
    pub fn resolve(args: &Args) -> Result<Config> {
        let config_file = args
            .config
            .clone()
            .unwrap_or_else(default_config_file);

        if !config_file.exists() {
            write_default_template(&config_file)?;
        }

        let ini = config::Config::builder()
            .add_source(
                config::File::new(&config_file.display().to_string(), FileFormat::Ini)
                    .required(false),
            )
            .build()
            .with_context(|| format!("cannot read config file {}", config_file.display()))?;

        let output_dir = args
            .output_dir
            .clone()
            .or_else(|| ini.get_string("downloader.output_dir").ok().map(PathBuf::from))
            .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

        let data_dir = args
            .data_dir
            .clone()
            .or_else(|| ini.get_string("server.data_dir").ok().map(PathBuf::from))
            .unwrap_or_else(default_data_dir);

        let server_type = args
            .server_type
            .or_else(|| {
                ini.get_string("server.server_type")
                    .ok()
                    .and_then(|s| ServerType::parse_name(&s))
            })
            .unwrap_or(ServerType::Threaded);

        let host = args
            .host
            .clone()
            .or_else(|| ini.get_string("server.host").ok())
            .unwrap_or_else(|| DEFAULT_HOST.to_string());

        let port = args
            .port
            .or_else(|| {
                ini.get_int("server.port")
                    .ok()
                    .and_then(|p| u16::try_from(p).ok())
            })
            .unwrap_or(DEFAULT_PORT);

        let max_tasks = ini
            .get_int("downloader.max_tasks")
            .ok()
            .and_then(|n| usize::try_from(n).ok())
            .unwrap_or(DEFAULT_MAX_TASKS);

        let max_retry = ini
            .get_int("downloader.max_retry")
            .ok()
            .unwrap_or(DEFAULT_MAX_RETRY);

        let engine_path = ini
            .get_string("downloader.you_get_path")
            .ok()
            .unwrap_or_else(|| you_get_web_shared::engine::ENGINE_BIN.to_string());

        let auto_extractor_proxy = ini
            .get_bool("proxy.auto_extractor_proxy")
            .ok()
            .unwrap_or(false);

        let cfg = Config {
            config_file,
            output_dir,
            data_dir,
            server_type,
            host,
            port,
            debug: args.debug,
            max_tasks,
            max_retry,
            engine_path,
            auto_extractor_proxy,
        };
        cfg.validate()?;
        Ok(cfg)
    }

    fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            bail!("host must not be empty");
        }
        if self.max_tasks == 0 {
            bail!("max_tasks must be at least 1");
        }
        if self.max_retry < 0 {
            bail!("max_retry must not be negative");
        }
        Ok(())
    }

    /// Create the output and data directories.
    pub fn ensure_dirs(&self) -> Result<()> {
        std::fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("cannot create output dir {}", self.output_dir.display()))?;
        std::fs::create_dir_all(&self.data_dir)
            .with_context(|| format!("cannot create data dir {}", self.data_dir.display()))?;
        Ok(())
    }

    /// sqlite URL for the task database.
    pub fn database_url(&self) -> String {
        let path = self.data_dir.join(DB_FILENAME);
        let path = path.canonicalize().unwrap_or(path);
        // Strip Windows UNC prefix (\\?\) which breaks SQLite URL parsing
        let path_str = path.display().to_string();
        let path_str = path_str.strip_prefix(r"\\?\").unwrap_or(&path_str).to_string();
        format!("sqlite://{}?mode=rwc", path_str)
    }

    /// Cookie jar path when the file is actually there.
    pub fn cookies_file(&self) -> Option<PathBuf> {
        let path = self.data_dir.join(COOKIES_FILENAME);
        path.exists().then_some(path)
    }

    /// host:port the server binds.
    pub fn bind_addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Browser entry point printed at startup.
    pub fn gui_url(&self) -> String {
        format!("http://{}:{}/html/", self.host, self.port)
    }
}

/// Per-user config file location: `<config dir>/you-get/you-get-web.conf`.
pub fn default_config_file() -> PathBuf {
    match ProjectDirs::from("", "", "you-get") {
        Some(dirs) => dirs.config_dir().join("you-get-web.conf"),
        None => PathBuf::from("you-get-web.conf"),
    }
}

/// Per-user data location: `<data dir>/you-get/web`.
pub fn default_data_dir() -> PathBuf {
    match ProjectDirs::from("", "", "you-get") {
        Some(dirs) => dirs.data_dir().join("web"),
        None => PathBuf::from(".you-get-web"),
    }
}

const CONFIG_TEMPLATE: &str = "\
# you-get-web settings.
# Command-line flags override anything set here.

[server]
# host = 127.0.0.1
# port = 8080
# server_type = threaded
# data_dir = /path/to/state

[downloader]
# output_dir = /path/to/downloads
# max_tasks = 5
# max_retry = 3
# you_get_path = you-get

[proxy]
# auto_extractor_proxy = false
";

fn write_default_template(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("cannot create config dir {}", parent.display()))?;
    }
    std::fs::write(path, CONFIG_TEMPLATE)
        .with_context(|| format!("cannot write config template {}", path.display()))?;
    info!("Wrote default config to {}", path.display());
    Ok(())
}
