//! API gateway entry point.
//!
//! # Architecture Overview
//!
//! ```text
//!   master (this process, no subcommand)
//!   ├── config watcher / SIGHUP / POST /admin/reload ──▶ rolling reload
//!   ├── SIGTERM / SIGINT / POST /admin/stop ───────────▶ drain and exit
//!   └── supervisor ── spawns ──▶ worker 1..N  (`api-gateway worker --id N`)
//!                                  │  SO_REUSEPORT listeners (http, https)
//!                                  ▼
//!                     dispatcher: race every workflow
//!                                  │
//!                                  ▼
//!   prerequisites → processors → validators → cachers → proxies → enrichers
//! ```

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};

use api_gateway::admin::serve_admin;
use api_gateway::config::{load_config, ConfigWatcher};
use api_gateway::error::GatewayError;
use api_gateway::lifecycle::signals::spawn_master_signals;
use api_gateway::lifecycle::Shutdown;
use api_gateway::modules::ModuleRegistry;
use api_gateway::observability::logging::init_logging;
use api_gateway::supervisor::ipc::run_worker_process;
use api_gateway::supervisor::{ProcessSpawner, Supervisor, SupervisorOptions, TaskSpawner, WorkerSpawner};

#[derive(Parser)]
#[command(name = "api-gateway", version)]
#[command(about = "Configurable HTTP API gateway with a supervised worker pool", long_about = None)]
struct Cli {
    /// JSON configuration file
    #[arg(short, long, global = true, default_value = "gateway.json")]
    config: PathBuf,

    /// Worker count, overriding the configuration
    #[arg(short, long)]
    workers: Option<usize>,

    /// Run workers as tasks inside the master instead of child processes
    #[arg(long)]
    in_process: bool,

    /// Seconds stopping workers may drain before they are killed
    #[arg(long, default_value_t = 30)]
    drain_timeout_secs: u64,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a single worker (spawned by the master)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        id: u64,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Worker { id }) => {
            let code = run_worker(id, &cli.config).await;
            // stdin is still being read by a blocking task, so the runtime cannot shut down cleanly.
            std::process::exit(code);
        }
        None => run_master(cli).await?,
    }
    Ok(())
}

async fn run_worker(id: u64, path: &Path) -> i32 {
    let config = match load_config(path) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("worker {}: {}", id, e);
            return 1;
        }
    };
    init_logging(&config.log_level);

    match run_worker_process(id, config, ModuleRegistry::with_builtins()).await {
        Ok(()) => 0,
        Err(e) => {
            tracing::error!(worker_id = id, error = %e, "Worker failed");
            1
        }
    }
}

async fn run_master(cli: Cli) -> Result<(), GatewayError> {
    let config = load_config(&cli.config)?;
    init_logging(&config.log_level);

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?cli.config,
        pid = std::process::id(),
        in_process = cli.in_process,
        "api-gateway master starting"
    );

    let spawner: Arc<dyn WorkerSpawner> = if cli.in_process {
        Arc::new(TaskSpawner::new(Arc::new(ModuleRegistry::with_builtins())))
    } else {
        Arc::new(ProcessSpawner::current_exe(&cli.config)?)
    };
    let options = SupervisorOptions {
        workers: cli.workers,
        drain_timeout: Duration::from_secs(cli.drain_timeout_secs),
        ..Default::default()
    };
    let (supervisor, handle) = Supervisor::new(config.clone(), Some(cli.config.clone()), spawner, options);

    spawn_master_signals(handle.clone());

    let (watcher, mut updates) = ConfigWatcher::new(&cli.config, Duration::from_secs(config.reload_poll_secs.max(1)));
    let _watcher = match watcher.run() {
        Ok(watcher) => Some(watcher),
        Err(e) => {
            tracing::warn!(error = %e, "Config watcher unavailable, reload with SIGHUP instead");
            None
        }
    };
    let forward = handle.clone();
    tokio::spawn(async move {
        while let Some(new_config) = updates.recv().await {
            if !forward.apply(new_config) {
                break;
            }
        }
    });

    let admin_shutdown = Shutdown::new();
    if config.admin.enabled {
        let admin = config.admin.clone();
        let handle = handle.clone();
        let shutdown = admin_shutdown.clone();
        tokio::spawn(async move {
            if let Err(e) = serve_admin(&admin, handle, shutdown).await {
                tracing::error!(error = %e, "Admin API failed");
            }
        });
    }

    let result = supervisor.run().await;
    admin_shutdown.trigger();
    tracing::info!("Shutdown complete");
    result
}
