//! `phaul`: live workload migration between two hosts
//!
//! # Usage
//!
//! ```bash
//! # Target host: accept migrations
//! phaul serve --listen 0.0.0.0:12345
//!
//! # Source host: move docker container 3f2a9c to target-host
//! phaul migrate docker 3f2a9c --to target-host
//!
//! # Restart mode, settings from a file, logs to a file
//! phaul --log-file /var/log/phaul.log migrate docker 3f2a9c --to target-host \
//!     --mode restart --config /etc/phaul.toml
//! ```
//!
//! Every migration uses two TCP connections to the target: the first carries
//! the JSON-lines control protocol, the second the image stream.

use std::fs::OpenOptions;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use anyhow::{Context as _, Result};
use clap::{Parser, Subcommand};
use haul::config::parse_compression_level;
use haul::error::EXIT_LOCAL_FAILURE;
use haul::{
    connect_tcp, CriuCli, DockerConfig, DriverRegistry, DriverRole, HaulError, MigrationConfig,
    MigrationMode, Orchestrator, PreDumpPolicy, TargetService, TransferStrategy,
    WorkloadDescriptor,
};
use tokio::net::{TcpListener, TcpStream};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

const DEFAULT_PORT: u16 = 12345;

/// Command-line arguments
#[derive(Parser, Debug)]
#[command(name = "phaul", author, version, about, long_about = None)]
struct Args {
    /// Append logs to this file instead of writing them to stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Migrate a workload to a target host (run on the source)
    Migrate(MigrateArgs),
    /// Accept migrations from source hosts (run on the target)
    Serve(ServeArgs),
}

#[derive(clap::Args, Debug)]
struct MigrateArgs {
    /// Workload type, e.g. `docker`
    kind: String,

    /// Workload id (container id)
    id: String,

    /// Target host name or address
    #[arg(long)]
    to: String,

    /// Target service port
    #[arg(long, default_value_t = DEFAULT_PORT)]
    port: u16,

    /// TOML file with migration settings (overridden by PHAUL_* and flags)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Migration mode: live or restart
    #[arg(long)]
    mode: Option<MigrationMode>,

    /// Pre-dump policy: auto, enabled or disabled
    #[arg(long)]
    pre_dump: Option<PreDumpPolicy>,

    /// Total checkpoint iterations, the final dump included
    #[arg(long)]
    max_iterations: Option<u32>,

    /// Minimum diff size worth sending, e.g. 4m or 512k
    #[arg(long)]
    iter_threshold: Option<String>,

    /// Discard pre-dump iterations whose diff is below --iter-threshold
    #[arg(long, default_value_t = false)]
    enforce_iter_threshold: bool,

    /// Compression level 0..9 (0 disables compression)
    #[arg(long)]
    compression: Option<String>,

    /// Image packaging: archive, archive_compress or threaded_compress
    #[arg(long)]
    transfer: Option<TransferStrategy>,

    /// Keep image directories after the migration
    #[arg(long, default_value_t = false)]
    keep_images: bool,

    /// Skip all compatibility checks
    #[arg(long, default_value_t = false)]
    force: bool,

    /// Skip the CPU compatibility check
    #[arg(long, default_value_t = false)]
    skip_cpu_check: bool,

    /// Skip the checkpoint tool version check
    #[arg(long, default_value_t = false)]
    skip_criu_check: bool,

    /// Root directory for image working directories
    #[arg(long)]
    img_path: Option<PathBuf>,

    /// Directory diff tool command line
    #[arg(long)]
    diff_tool: Option<String>,

    /// Append the stats report to this JSONL file
    #[arg(long)]
    stats_path: Option<PathBuf>,

    #[command(flatten)]
    tools: ToolArgs,
}

#[derive(clap::Args, Debug)]
struct ServeArgs {
    /// Address to accept migrations on
    #[arg(long, default_value = "0.0.0.0:12345")]
    listen: String,

    /// Exit after the first migration
    #[arg(long, default_value_t = false)]
    once: bool,

    #[command(flatten)]
    tools: ToolArgs,
}

/// Host-local tool locations, never sent to the peer
#[derive(clap::Args, Debug)]
struct ToolArgs {
    /// Checkpoint tool binary
    #[arg(long, default_value = "criu")]
    criu_bin: PathBuf,

    /// Page server port for dumps that stream memory directly
    #[arg(long, default_value_t = 27)]
    page_server_port: u16,

    /// TOML file with docker paths and commands
    #[arg(long)]
    docker_config: Option<PathBuf>,
}

impl ToolArgs {
    fn checkpoint_tool(&self) -> Arc<CriuCli> {
        Arc::new(CriuCli::new(&self.criu_bin, self.page_server_port))
    }

    fn registry(&self) -> Result<DriverRegistry> {
        let docker = match &self.docker_config {
            Some(path) => {
                let content = std::fs::read_to_string(path)
                    .with_context(|| format!("reading {}", path.display()))?;
                toml::from_str::<DockerConfig>(&content)
                    .with_context(|| format!("parsing {}", path.display()))?
            }
            None => DockerConfig::default(),
        };
        Ok(DriverRegistry::with_builtin(docker))
    }
}

/// Defaults, then the config file, then `PHAUL_*` variables, then flags
fn build_config(args: &MigrateArgs) -> Result<MigrationConfig> {
    let mut config = match &args.config {
        Some(path) => MigrationConfig::from_toml_file(path)?,
        None => MigrationConfig::default(),
    };
    config.apply_env()?;

    if let Some(mode) = args.mode {
        config.mode = mode;
    }
    if let Some(policy) = args.pre_dump {
        config.pre_dump = policy;
    }
    if let Some(max) = args.max_iterations {
        config.max_iterations = max;
    }
    if let Some(threshold) = &args.iter_threshold {
        config.iter_threshold = threshold.clone();
    }
    if let Some(level) = &args.compression {
        config.compression_level = parse_compression_level(level)?;
    }
    if let Some(strategy) = args.transfer {
        config.transfer = strategy;
    }
    if let Some(path) = &args.img_path {
        config.img_path = path.clone();
    }
    if let Some(tool) = &args.diff_tool {
        config.diff_tool = tool.clone();
    }
    if let Some(path) = &args.stats_path {
        config.stats_path = Some(path.clone());
    }
    config.enforce_iter_threshold |= args.enforce_iter_threshold;
    config.keep_images |= args.keep_images;
    config.force |= args.force;
    config.skip_cpu_check |= args.skip_cpu_check;
    config.skip_criu_check |= args.skip_criu_check;
    config.to = Some(args.to.clone());
    Ok(config)
}

fn init_tracing(log_file: Option<&Path>) -> Result<()> {
    let builder = tracing_subscriber::fmt().with_env_filter(
        EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
    );
    match log_file {
        Some(path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("opening log file {}", path.display()))?;
            builder.with_ansi(false).with_writer(Mutex::new(file)).init();
        }
        None => builder.init(),
    }
    Ok(())
}

async fn migrate(args: MigrateArgs) -> Result<()> {
    let config = build_config(&args)?;
    let registry = args.tools.registry()?;
    let descriptor = WorkloadDescriptor::new(&args.kind, &args.id);
    let driver = registry.create(&descriptor, DriverRole::Source)?;

    let addr = format!("{}:{}", args.to, args.port);
    info!(target = %addr, workload = %descriptor, mode = %config.mode, "Connecting to target");
    let peer = connect_tcp(&addr).await?;
    let images = TcpStream::connect(&addr)
        .await
        .map_err(|e| HaulError::rpc("connect", format!("image channel: {}", e)))?;
    images.set_nodelay(true)?;

    let mut orchestrator = Orchestrator::new(
        descriptor,
        config,
        Box::new(peer),
        driver,
        args.tools.checkpoint_tool(),
        Box::new(images),
    )?;
    let report = orchestrator.run().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

/// Both connections of a migration must come from one host
fn same_host(control: SocketAddr, images: SocketAddr) -> bool {
    control.ip().to_canonical() == images.ip().to_canonical()
}

/// Accept the control connection and then the image connection of the
/// next migration. A pair from two different hosts is dropped.
async fn accept_migration(listener: &TcpListener) -> Result<(TcpStream, TcpStream, SocketAddr)> {
    loop {
        let (control, source) = listener.accept().await?;
        let (images, images_source) = listener.accept().await?;
        if same_host(source, images_source) {
            return Ok((control, images, source));
        }
        warn!(
            control = %source,
            images = %images_source,
            "Control and image connections come from different hosts, dropping both"
        );
    }
}

async fn serve(args: ServeArgs) -> Result<()> {
    let registry = args.tools.registry()?;
    let tool = args.tools.checkpoint_tool();
    let listener = TcpListener::bind(&args.listen)
        .await
        .with_context(|| format!("binding {}", args.listen))?;
    info!(addr = %listener.local_addr()?, "Waiting for migrations");

    loop {
        let (control, images, source) = accept_migration(&listener).await?;
        control.set_nodelay(true)?;
        info!(source = %source, "Migration connection accepted");

        let mut service = TargetService::new(registry.clone(), tool.clone(), images);
        let (reader, writer) = control.into_split();
        if let Err(e) = service.serve(reader, writer).await {
            error!(source = %source, error = %e, "Migration session ended with an error");
        }
        if args.once {
            return Ok(());
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    init_tracing(args.log_file.as_deref())?;

    let result = match args.command {
        Command::Migrate(migrate_args) => migrate(migrate_args).await,
        Command::Serve(serve_args) => serve(serve_args).await,
    };

    if let Err(e) = result {
        let haul_error = e.downcast_ref::<HaulError>();
        error!("{:#}", e);
        if let Some(hint) = haul_error.and_then(HaulError::recovery_suggestion) {
            error!("Hint: {}", hint);
        }
        std::process::exit(haul_error.map_or(EXIT_LOCAL_FAILURE, HaulError::exit_code));
    }
    Ok(())
}
