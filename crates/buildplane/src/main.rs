use std::fs;
use std::io::{self, IsTerminal, Write};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use clap::{Args, CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use config::{Config, Environment, File, FileFormat};
use log::{LevelFilter, debug, info};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;

use buildplane::api;
use buildplane::compute::{
    ClusterBackend, ClusterConfig, ComputeBackend, ProcessBackend, ProcessConfig,
};
use buildplane::db::Database;
use buildplane::session::{
    InMemorySessionStore, Reaper, ReaperConfig, SessionService, SessionServiceConfig,
    SessionStore, SqliteSessionStore,
};

const APP_NAME: &str = "buildplane";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

#[tokio::main]
async fn async_main(ctx: RuntimeContext, cmd: ServeCommand) -> Result<()> {
    handle_serve(&ctx, cmd).await
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let ctx = RuntimeContext::new(cli.common.clone())?;
    ctx.init_logging();
    debug!("resolved paths: {:#?}", ctx.paths);

    match cli.command {
        Command::Serve(cmd) => async_main(ctx, cmd),
        Command::Init(cmd) => handle_init(&ctx, cmd),
        Command::Config => handle_config(&ctx),
        Command::Completions { shell } => handle_completions(shell),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Buildplane - control plane for ephemeral per-session build servers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Path to the config file (or a directory containing config.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v, -vv)
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Suppress all log output
    #[arg(long, global = true)]
    quiet: bool,

    /// Emit logs as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run the control-plane server
    Serve(ServeCommand),
    /// Write a default config file
    Init(InitCommand),
    /// Print the effective configuration
    Config,
    /// Generate shell completions
    Completions {
        /// Shell to generate completions for
        shell: Shell,
    },
}

#[derive(Debug, Args)]
struct ServeCommand {
    /// Address to bind
    #[arg(long, default_value = "0.0.0.0")]
    host: String,

    /// Port to listen on
    #[arg(long, default_value_t = 50051)]
    port: u16,

    /// Run build servers as local subprocesses instead of cluster workloads
    #[arg(long)]
    local_mode: bool,
}

#[derive(Debug, Args)]
struct InitCommand {
    /// Overwrite an existing config file
    #[arg(long)]
    force: bool,
}

#[derive(Debug)]
struct RuntimeContext {
    common: CommonOpts,
    paths: AppPaths,
    config: AppConfig,
}

impl RuntimeContext {
    fn new(common: CommonOpts) -> Result<Self> {
        let mut paths = AppPaths::discover(common.config.clone())?;
        let config = load_config(&paths)?;
        paths.apply_overrides(&config)?;
        Ok(Self {
            common,
            paths,
            config,
        })
    }

    fn init_logging(&self) {
        use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

        if self.common.quiet {
            log::set_max_level(LevelFilter::Off);
            return;
        }

        let level = match self.effective_log_level() {
            LevelFilter::Off => "off",
            LevelFilter::Error => "error",
            LevelFilter::Warn => "warn",
            LevelFilter::Info => "info",
            LevelFilter::Debug => "debug",
            LevelFilter::Trace => "trace",
        };

        let env_filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(format!("buildplane={level},tower_http={level}")));

        if self.common.json {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(tracing_subscriber::fmt::layer().json())
                .try_init()
                .ok();
        } else {
            tracing_subscriber::registry()
                .with(env_filter)
                .with(
                    tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()),
                )
                .try_init()
                .ok();
        }

        // Also init env_logger for compatibility with log crate users
        let mut builder =
            env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
        builder.filter_level(self.effective_log_level());
        builder.try_init().ok();
    }

    fn effective_log_level(&self) -> LevelFilter {
        if self.common.debug {
            LevelFilter::Debug
        } else {
            match self.common.verbose {
                0 => {
                    self.config
                        .logging
                        .level
                        .parse()
                        .unwrap_or(LevelFilter::Info)
                }
                1 => LevelFilter::Debug,
                _ => LevelFilter::Trace,
            }
        }
    }
}

#[derive(Debug)]
struct AppPaths {
    config_file: PathBuf,
    data_dir: PathBuf,
}

impl AppPaths {
    fn discover(override_path: Option<PathBuf>) -> Result<Self> {
        let config_file = match override_path {
            Some(path) => {
                if path.is_dir() {
                    path.join("config.toml")
                } else {
                    path
                }
            }
            None => default_config_dir()?.join("config.toml"),
        };

        if config_file.parent().is_none() {
            return Err(anyhow!("invalid config file path: {config_file:?}"));
        }

        Ok(Self {
            config_file,
            data_dir: default_data_dir()?,
        })
    }

    fn apply_overrides(&mut self, cfg: &AppConfig) -> Result<()> {
        if let Some(ref data_override) = cfg.paths.data_dir {
            self.data_dir = expand_str_path(data_override)?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct AppConfig {
    logging: LoggingConfig,
    paths: PathsConfig,
    store: StoreConfig,
    compute: ComputeConfig,
    orchestrator: OrchestratorConfig,
    reaper: ReaperSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct LoggingConfig {
    level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct PathsConfig {
    /// Override for the data directory (sessions database lives here).
    data_dir: Option<String>,
}

/// Which session store backs the control plane.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum StoreDriver {
    /// Durable SQLite store.
    #[default]
    Sqlite,
    /// In-process map; sessions are forgotten on restart.
    Memory,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct StoreConfig {
    driver: StoreDriver,
    /// Explicit database file path; defaults to <data_dir>/sessions.db
    path: Option<String>,
}

/// Which compute substrate runs the build servers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
enum Substrate {
    /// Namespaced cluster workloads via kubectl.
    #[default]
    Cluster,
    /// Local subprocesses.
    Process,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
struct ComputeConfig {
    substrate: Substrate,
    cluster: ClusterConfig,
    process: ProcessConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct OrchestratorConfig {
    /// Deadline for backend calls made while handling a request, in seconds.
    backend_call_timeout_secs: u64,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            backend_call_timeout_secs: 30,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
struct ReaperSettings {
    /// How often the staleness sweep runs, in seconds.
    sweep_interval_secs: u64,
    /// Heartbeat age after which a session is reclaimed, in seconds.
    stale_after_secs: u64,
}

impl Default for ReaperSettings {
    fn default() -> Self {
        Self {
            sweep_interval_secs: 60,
            stale_after_secs: 300,
        }
    }
}

fn load_config(paths: &AppPaths) -> Result<AppConfig> {
    let built = Config::builder()
        .set_default("logging.level", "info")?
        .add_source(
            File::from(paths.config_file.as_path())
                .format(FileFormat::Toml)
                .required(false),
        )
        .add_source(Environment::with_prefix("BUILDPLANE").separator("__"))
        .build()?;

    let config: AppConfig = built.try_deserialize()?;
    Ok(config)
}

fn write_default_config(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating config directory {parent:?}"))?;
    }

    let config = AppConfig::default();
    let toml = toml::to_string_pretty(&config).context("serializing default config to TOML")?;
    let mut body = format!("# Configuration for {}\n# File: {}\n\n", APP_NAME, path.display());
    body.push_str(&toml);
    fs::write(path, body).with_context(|| format!("writing config file to {}", path.display()))
}

fn default_config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("could not determine config directory"))
}

fn default_data_dir() -> Result<PathBuf> {
    dirs::data_dir()
        .map(|dir| dir.join(APP_NAME))
        .ok_or_else(|| anyhow!("could not determine data directory"))
}

fn expand_str_path(raw: &str) -> Result<PathBuf> {
    let expanded = shellexpand::full(raw)
        .map_err(|e| anyhow!("expanding path '{raw}': {e}"))?
        .to_string();
    Ok(PathBuf::from(expanded))
}

async fn handle_serve(ctx: &RuntimeContext, cmd: ServeCommand) -> Result<()> {
    info!("Starting buildplane control plane...");

    let store: Arc<dyn SessionStore> = match ctx.config.store.driver {
        StoreDriver::Sqlite => {
            let db_path = match ctx.config.store.path {
                Some(ref path) => expand_str_path(path)?,
                None => ctx.paths.data_dir.join("sessions.db"),
            };
            info!("Database path: {}", db_path.display());
            let database = Database::new(&db_path).await?;
            Arc::new(SqliteSessionStore::new(database.pool().clone()))
        }
        StoreDriver::Memory => {
            info!("Using in-memory session store");
            Arc::new(InMemorySessionStore::new())
        }
    };

    // CLI --local-mode overrides the configured substrate.
    let local_mode = cmd.local_mode || ctx.config.compute.substrate == Substrate::Process;
    let compute: Arc<dyn ComputeBackend> = if local_mode {
        info!(
            "Compute substrate: local process (agent: {})",
            ctx.config.compute.process.agent_binary
        );
        Arc::new(ProcessBackend::new(ctx.config.compute.process.clone()))
    } else {
        info!(
            "Compute substrate: cluster (kubectl: {}, image: {})",
            ctx.config.compute.cluster.kubectl_binary, ctx.config.compute.cluster.image
        );
        Arc::new(ClusterBackend::new(ctx.config.compute.cluster.clone()))
    };

    let service = SessionService::new(
        store.clone(),
        compute.clone(),
        SessionServiceConfig {
            backend_call_timeout: Duration::from_secs(
                ctx.config.orchestrator.backend_call_timeout_secs,
            ),
        },
    );

    let reaper = Reaper::new(
        store,
        compute,
        ReaperConfig {
            sweep_interval: Duration::from_secs(ctx.config.reaper.sweep_interval_secs),
            stale_after: Duration::from_secs(ctx.config.reaper.stale_after_secs),
        },
    );
    let reaper_handle = reaper.spawn();

    let state = api::AppState::new(service);
    let app = api::create_router(state);

    let addr: SocketAddr = format!("{}:{}", cmd.host, cmd.port)
        .parse()
        .context("invalid address")?;

    info!("Listening on http://{}", addr);
    let listener = TcpListener::bind(addr).await.context("binding to address")?;

    let shutdown_signal = async {
        let ctrl_c = async {
            tokio::signal::ctrl_c()
                .await
                .expect("failed to install Ctrl+C handler");
        };

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {},
            _ = terminate => {},
        }

        info!("Shutdown signal received");
    };

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal)
        .await
        .context("running server")?;

    reaper_handle.shutdown().await;
    info!("Shutdown complete");

    Ok(())
}

fn handle_init(ctx: &RuntimeContext, cmd: InitCommand) -> Result<()> {
    if ctx.paths.config_file.exists() && !cmd.force {
        return Err(anyhow!(
            "config already exists at {} (use --force to overwrite)",
            ctx.paths.config_file.display()
        ));
    }

    write_default_config(&ctx.paths.config_file)?;
    println!("Wrote default config to {}", ctx.paths.config_file.display());
    Ok(())
}

fn handle_config(ctx: &RuntimeContext) -> Result<()> {
    let output = if ctx.common.json {
        serde_json::to_string_pretty(&ctx.config).context("serializing config to JSON")?
    } else {
        toml::to_string_pretty(&ctx.config).context("serializing config to TOML")?
    };
    println!("{output}");
    Ok(())
}

fn handle_completions(shell: Shell) -> Result<()> {
    clap_complete::generate(shell, &mut Cli::command(), APP_NAME, &mut io::stdout());
    Ok(())
}
