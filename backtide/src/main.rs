use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;

use backtide_backends::appliance::{self, ApplianceBackend};
use backtide_backends::default_registry;
use backtide_core::abstractions::SystemClock;
use backtide_core::api::create_api_router;
use backtide_core::config::BacktideConfig;
use backtide_core::notifications::TracingNotifier;
use backtide_core::procedure::BackupEvent;
use backtide_core::storage::{ChangeLog, ChangeTracker, RedbObjectStore, RedbSettingsStore, SettingsStore};
use backtide_core::{BacktideError, BacktideResult, BackupModule, ModuleDependencies};
use serde_json::json;

mod collections;

#[derive(Parser)]
#[command(name = "backtide")]
#[command(about = "Incremental backup daemon", long_about = None)]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON file with collection definitions
    #[arg(long, global = true)]
    collections: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(clap::Subcommand)]
enum Commands {
    /// Run the daemon with its control API
    Serve {
        /// Bind address for the control API (overrides the config)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Run one backup in the foreground
    Backup,
    /// Show backend, status and backup times
    Status,
    /// Choose where backups go
    SetBackend {
        /// Backend location, e.g. "google-drive" or "local"
        location: String,

        /// Appliance base URL
        #[arg(long)]
        url: Option<String>,

        /// Appliance pairing key
        #[arg(long)]
        sync_key: Option<String>,

        /// Folder on the appliance backups are written to
        #[arg(long)]
        folder_path: Option<String>,
    },
    /// Turn automatic backups on or off
    Automatic {
        #[arg(value_enum)]
        mode: Toggle,
    },
    /// Drop queued changes and every record of past backups
    Forget {
        /// Skip the confirmation
        #[arg(long)]
        force: bool,
    },
    /// Print the login URL of the active backend
    LoginUrl,
}

#[derive(Clone, Copy, clap::ValueEnum)]
enum Toggle {
    On,
    Off,
}

struct Daemon {
    module: Arc<BackupModule>,
    settings: Arc<dyn SettingsStore>,
    config: BacktideConfig,
}

async fn open_daemon(config: BacktideConfig, collections_path: Option<&std::path::Path>) -> BacktideResult<Daemon> {
    let engine = &config.engine;
    std::fs::create_dir_all(&engine.data_dir)?;

    let collections = collections::load_collections(collections_path)?;
    let clock = Arc::new(SystemClock::new());

    let store = Arc::new(RedbObjectStore::open(engine.object_store_path(), collections.clone())?);
    let change_log = Arc::new(ChangeLog::open(engine.change_log_path(), clock.clone())?);
    store.register_hook(Arc::new(ChangeTracker::new(change_log.clone(), &collections)));
    let settings: Arc<dyn SettingsStore> = Arc::new(RedbSettingsStore::open(engine.settings_path())?);

    let module = BackupModule::new(ModuleDependencies {
        config: config.clone(),
        local_store: store,
        change_log,
        settings: settings.clone(),
        registry: default_registry(),
        notifier: Arc::new(TracingNotifier),
        clock,
    })
    .await?;
    module.start_recording_changes_if_needed().await?;

    Ok(Daemon {
        module,
        settings,
        config,
    })
}

#[tokio::main]
async fn main() -> BacktideResult<()> {
    // Initialize logging
    let filter = tracing_subscriber::EnvFilter::from_default_env().add_directive(
        "backtide=info"
            .parse()
            .map_err(|e| BacktideError::configuration("logging", format!("Invalid log directive: {}", e)))?,
    );

    tracing_subscriber::fmt().with_env_filter(filter).init();

    let cli = Cli::parse();
    let config = BacktideConfig::load(cli.config.as_deref())?;
    let daemon = open_daemon(config, cli.collections.as_deref()).await?;

    match cli.command {
        Commands::Serve { bind } => handle_serve(daemon, bind).await?,
        Commands::Backup => handle_backup(&daemon).await?,
        Commands::Status => handle_status(&daemon).await?,
        Commands::SetBackend {
            location,
            url,
            sync_key,
            folder_path,
        } => {
            handle_set_backend(&daemon, &location, url, sync_key, folder_path).await?;
        }
        Commands::Automatic { mode } => match mode {
            Toggle::On => {
                daemon.module.enable_automatic_backup().await?;
                println!("Automatic backups enabled");
            }
            Toggle::Off => {
                daemon.module.disable_automatic_backup().await?;
                println!("Automatic backups disabled");
            }
        },
        Commands::Forget { force } => {
            if !force {
                eprintln!("This drops every queued change and the backup history. Re-run with --force.");
                std::process::exit(1);
            }
            daemon.module.forget_all_changes().await?;
            println!("Forgot all queued changes");
        }
        Commands::LoginUrl => match daemon.module.login_url() {
            Some(url) => println!("{}", url),
            None => println!("Backend '{}' needs no login", daemon.module.backend_location()),
        },
    }

    Ok(())
}

async fn handle_serve(daemon: Daemon, bind: Option<String>) -> BacktideResult<()> {
    let bind = bind.unwrap_or_else(|| daemon.config.engine.control_bind_address.clone());
    let listener = tokio::net::TcpListener::bind(&bind).await?;
    tracing::info!("Control API listening on {}", listener.local_addr()?);

    let app = create_api_router(daemon.module.clone());
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if daemon.module.get_info().is_some() {
        tracing::info!("Pausing the running backup before shutdown");
        daemon.module.pause_backup();
    }
    tracing::info!("Control API shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
}

async fn handle_backup(daemon: &Daemon) -> BacktideResult<()> {
    let module = &daemon.module;
    let Some(mut events) = module.start_backup_with_events().await? else {
        eprintln!(
            "Backup did not start: backend '{}' is unreachable or a run is already active",
            module.backend_location()
        );
        std::process::exit(1);
    };

    loop {
        match events.recv().await {
            Ok(BackupEvent::Info(info)) => {
                if let (Some(processed), Some(total)) = (info.processed_changes, info.total_changes) {
                    println!("{:?}: {}/{} changes", info.state, processed, total);
                }
            }
            Ok(BackupEvent::Success) => {
                println!("Backup finished");
                return Ok(());
            }
            Ok(BackupEvent::Cancelled) => {
                println!("Backup cancelled");
                return Ok(());
            }
            Ok(BackupEvent::Fail(e)) => {
                eprintln!("Backup failed: {}", e);
                std::process::exit(1);
            }
            Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                tracing::debug!("Skipped {} progress events", skipped);
            }
            Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
        }
    }
}

async fn handle_status(daemon: &Daemon) -> BacktideResult<()> {
    let module = &daemon.module;
    let status = json!({
        "location": module.backend_location(),
        "availableLocations": module.available_locations(),
        "authenticated": module.is_backend_authenticated().await,
        "automatic": module.is_automatic_backup_enabled().await?,
        "status": module.backup_status().await?,
        "times": module.get_backup_times().await?,
        "queuedChanges": module.change_log().len()?,
    });
    println!("{}", serde_json::to_string_pretty(&status)?);
    Ok(())
}

async fn handle_set_backend(
    daemon: &Daemon,
    location: &str,
    url: Option<String>,
    sync_key: Option<String>,
    folder_path: Option<String>,
) -> BacktideResult<()> {
    match url {
        Some(url) if location == appliance::BACKEND_TYPE => {
            ApplianceBackend::configure(
                daemon.settings.clone(),
                &url,
                sync_key.as_deref(),
                folder_path.as_deref(),
            )
            .await?;
        }
        Some(_) => {
            return Err(BacktideError::configuration(
                "set-backend",
                format!("--url only applies to the '{}' backend", appliance::BACKEND_TYPE),
            ));
        }
        None => {}
    }

    daemon.module.set_backend_location(location).await?;
    println!("Backups now go to '{}'", location);
    if !daemon.module.is_backend_authenticated().await {
        if let Some(url) = daemon.module.login_url() {
            println!("Log in at {}", url);
        }
    }
    Ok(())
}
