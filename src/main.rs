use clap::{Args, Parser, Subcommand};
use mimalloc::MiMalloc;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use storefront::StorefrontError;
use storefront::config::Config;
use storefront::deploy::executor::Executor;
use storefront::deploy::{Deployer, LocalExecutor, SshExecutor};
use storefront::server::{StorefrontState, storefront_router};
use storefront::supervisor::SupervisorConfig;
use tokio::net::{TcpListener, UnixListener};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

#[global_allocator]
static GLOBAL: MiMalloc = MiMalloc;

#[derive(Parser, Debug)]
#[command(name = "storefront", version, about = "Deploy and front the Spree storefront")]
struct Cli {
    /// Configuration file (defaults to ./storefront.toml)
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Log at debug level unless RUST_LOG says otherwise
    #[arg(long, short, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Build a new release and switch `current` to it
    Deploy(StageArgs),
    /// Point `current` back at the previous release
    Rollback(StageArgs),
    /// Verify hosts are reachable and linked files exist
    Check(StageArgs),
    /// List releases on every host of a stage
    Releases {
        #[command(flatten)]
        stage: StageArgs,
        #[arg(long)]
        json: bool,
    },
    /// Print the generated puma.rb
    SupervisorConfig,
    /// Run the front door in front of the commerce engine
    Serve {
        /// TCP address to listen on instead of the supervisor socket
        #[arg(long)]
        listen: Option<SocketAddr>,
    },
}

#[derive(Args, Debug)]
struct StageArgs {
    /// Stage name from the `[stages]` table
    stage: String,

    /// Run commands through the local shell instead of ssh
    #[arg(long)]
    local: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let cfg = match Config::load(cli.config.as_deref()) {
        Ok(cfg) => cfg,
        Err(e) => {
            eprintln!("storefront: {e}");
            return ExitCode::from(2);
        }
    };

    let default_level = if cli.verbose {
        "debug".to_string()
    } else {
        cfg.log_level.clone()
    };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            tracing_subscriber::fmt::layer()
                .with_level(true)
                .with_target(false),
        )
        .init();

    match run(cli.command, &cfg).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            report(&e);
            ExitCode::FAILURE
        }
    }
}

async fn run(command: Command, cfg: &Config) -> Result<(), StorefrontError> {
    match command {
        Command::Deploy(args) => {
            let target = cfg.stage(&args.stage)?;
            let release = deployer(cfg, args.local)?.deploy(&target).await?;
            println!("deployed {release} to {}", target.name);
        }
        Command::Rollback(args) => {
            let target = cfg.stage(&args.stage)?;
            let release = deployer(cfg, args.local)?.rollback(&target).await?;
            println!("{} rolled back to {release}", target.name);
        }
        Command::Check(args) => {
            let target = cfg.stage(&args.stage)?;
            deployer(cfg, args.local)?.check(&target).await?;
            println!("{}: all hosts ready", target.name);
        }
        Command::Releases { stage, json } => {
            let target = cfg.stage(&stage.stage)?;
            let hosts = deployer(cfg, stage.local)?.releases(&target).await?;
            if json {
                println!("{}", serde_json::to_string_pretty(&hosts)?);
            } else {
                for host in hosts {
                    println!("{}", host.host);
                    for release in &host.releases {
                        let marker = if host.current.as_deref() == Some(release.as_str()) {
                            "*"
                        } else {
                            " "
                        };
                        println!("  {marker} {release}");
                    }
                }
            }
        }
        Command::SupervisorConfig => {
            print!("{}", SupervisorConfig::resolve(&cfg.supervisor)?.render());
        }
        Command::Serve { listen } => serve(cfg, listen).await?,
    }
    Ok(())
}

fn deployer(cfg: &Config, local: bool) -> Result<Deployer, StorefrontError> {
    let restart = SupervisorConfig::resolve(&cfg.supervisor)?.restart_plan();
    let executor: Arc<dyn Executor> = if local {
        Arc::new(LocalExecutor)
    } else {
        Arc::new(SshExecutor::new(cfg.deploy.ssh_connect_retries))
    };
    Ok(Deployer::new(cfg.deploy.clone(), restart, executor))
}

async fn serve(cfg: &Config, listen: Option<SocketAddr>) -> Result<(), StorefrontError> {
    let app = storefront::app::boot_once(&cfg.app)?;
    let state = StorefrontState::from_settings(app, &cfg.app)?;
    info!(engine = %state.engine.base(), "commerce engine mounted at /");
    let router = storefront_router(state);

    if let Some(addr) = listen {
        let listener = TcpListener::bind(addr).await?;
        info!("HTTP server listening on {}", addr);
        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        return Ok(());
    }

    let supervisor = SupervisorConfig::resolve(&cfg.supervisor)?;
    prepare_parent(&supervisor.socket).await?;
    if tokio::fs::try_exists(&supervisor.socket).await? {
        warn!(socket = %supervisor.socket.display(), "removing stale socket");
        tokio::fs::remove_file(&supervisor.socket).await?;
    }
    let listener = UnixListener::bind(&supervisor.socket)?;

    prepare_parent(&supervisor.pidfile).await?;
    tokio::fs::write(&supervisor.pidfile, std::process::id().to_string()).await?;
    info!(
        bind = %supervisor.bind_uri(),
        pidfile = %supervisor.pidfile.display(),
        "HTTP server listening"
    );

    let served = axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await;

    for path in [&supervisor.socket, &supervisor.pidfile] {
        if let Err(e) = tokio::fs::remove_file(path).await {
            warn!(path = %path.display(), error = %e, "cleanup failed");
        }
    }
    served.map_err(StorefrontError::from)
}

async fn prepare_parent(path: &Path) -> Result<(), StorefrontError> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "cannot listen for ctrl-c");
        return;
    }
    info!("shutting down");
}

fn report(err: &StorefrontError) {
    error!(error = %err, "command failed");
    if let Some(stage) = err.failed_stage() {
        eprintln!("storefront: stage {stage} failed");
    }
    let mut cause: Option<&StorefrontError> = Some(err);
    while let Some(e) = cause {
        match e {
            StorefrontError::StageFailed { source, .. } => cause = Some(source.as_ref()),
            StorefrontError::CommandFailed {
                host,
                command,
                status,
                stdout,
                stderr,
            } => {
                eprintln!("storefront: `{command}` on {host} exited with {status}");
                if !stdout.trim().is_empty() {
                    eprintln!("--- stdout\n{}", stdout.trim_end());
                }
                if !stderr.trim().is_empty() {
                    eprintln!("--- stderr\n{}", stderr.trim_end());
                }
                cause = None;
            }
            other => {
                eprintln!("storefront: {other}");
                cause = None;
            }
        }
    }
}
