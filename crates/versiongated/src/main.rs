//! versiongated - The versiongate background service
//!
//! This is the main entry point for the versiongated service.
//! It wires together all the components:
//! - Configuration loading
//! - Store initialization and table maintenance
//! - MDM/IDP/directory providers and the messenger
//! - The lifecycle control loop
//! - The control socket

use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;
use tokio::sync::mpsc;
use versiongate_api::{
    ClientInfo, ClientRole, Command, ErrorCode, ErrorInfo, Response, ResponsePayload,
};
use versiongate_config::{Settings, load_config};
use versiongate_core::{
    Collaborators, ControlHandle, ControlSignal, Controller, initialize_if_empty, rebuild_tables,
    send_daily_report,
};
use versiongate_ipc::{ControlEvent, ControlSocket};
use versiongate_provider::{InventoryProvider, WebhookMessenger};
use versiongate_store::{AuditEvent, AuditEventType, SqliteStore, Store};
use versiongate_util::{database_path, default_config_path};

/// Configuration could not be loaded or is incomplete
const EXIT_CONFIG: u8 = 2;

/// Store or table maintenance failed during boot
const EXIT_BOOT: u8 = 3;

/// versiongated - OS-version compliance enforcement for a managed fleet
#[derive(Parser, Debug)]
#[command(name = "versiongated")]
#[command(about = "OS-version compliance reconciliation and reminder service", long_about = None)]
struct Args {
    /// Configuration file path (default: ~/.config/versiongate/config.toml)
    #[arg(short, long, default_value_os_t = default_config_path())]
    config: PathBuf,

    /// Socket path override (or set VERSIONGATE_SOCKET env var)
    #[arg(short, long, env = "VERSIONGATE_SOCKET")]
    socket: Option<PathBuf>,

    /// Data directory override (or set VERSIONGATE_DATA_DIR env var)
    #[arg(short, long, env = "VERSIONGATE_DATA_DIR")]
    data_dir: Option<PathBuf>,

    /// Log level
    #[arg(short, long, default_value = "info")]
    log_level: String,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,

    /// Drop and rebuild every table before starting
    #[arg(long)]
    rebuild: bool,

    /// Send the daily admin report and exit
    #[arg(long)]
    daily_report: bool,

    /// Empty the named tables (comma separated) and exit
    #[arg(long, value_delimiter = ',')]
    clear_tables: Vec<String>,

    /// Do not start the periodic tasks until told to
    #[arg(long)]
    hold: bool,
}

/// Main service state
struct Service {
    settings: Settings,
    collab: Collaborators,
    socket: Arc<ControlSocket>,
    events: mpsc::UnboundedReceiver<ControlEvent>,
}

impl Service {
    /// Open the store and wire up collaborators
    fn collaborators(args: &Args, settings: &Settings) -> Result<Collaborators> {
        let data_dir = args
            .data_dir
            .clone()
            .unwrap_or_else(|| settings.service.data_dir.clone());

        let db_path = database_path(&data_dir);
        let store: Arc<dyn Store> = Arc::new(
            SqliteStore::open(&db_path)
                .with_context(|| format!("Failed to open database {:?}", db_path))?,
        );
        info!(db_path = %db_path.display(), "Store initialized");

        let inventory = Arc::new(InventoryProvider::new(settings.providers.inventory()?));
        let messenger = Arc::new(
            WebhookMessenger::new(settings.providers.webhook_url.clone())
                .context("Failed to build webhook client")?,
        );

        Ok(Collaborators {
            store,
            mdm: inventory.clone(),
            idp: inventory.clone(),
            directory: inventory,
            messenger,
        })
    }

    async fn new(args: &Args, settings: Settings, collab: Collaborators) -> Result<Self> {
        if args.rebuild {
            let built = rebuild_tables(&settings, &collab)
                .await
                .context("Table rebuild failed")?;
            info!(records = built, "Tables rebuilt");
        } else if let Some(built) = initialize_if_empty(&settings, &collab)
            .await
            .context("Initial table load failed")?
        {
            info!(records = built, "Tables initialized");
        }

        let socket_path = args
            .socket
            .clone()
            .unwrap_or_else(|| settings.service.socket_path.clone());
        let (socket, events) = ControlSocket::bind(&socket_path)
            .with_context(|| format!("Failed to bind control socket {:?}", socket_path))?;

        Ok(Self {
            settings,
            collab,
            socket: Arc::new(socket),
            events,
        })
    }

    async fn run(self, args: &Args) -> Result<()> {
        let Self {
            settings,
            collab,
            socket,
            mut events,
        } = self;
        let store = collab.store.clone();
        store.append_audit(AuditEvent::new(AuditEventType::ServiceStarted))?;

        let shutdown = CancellationToken::new();
        let config_path = args.config.clone();
        let autostart = settings.service.autostart && !args.hold;
        let (controller, handle) =
            Controller::new(settings, collab, shutdown.clone());
        let controller = controller.with_loader(Arc::new(move || {
            load_config(&config_path).map_err(|e| e.to_string())
        }));
        let controller_task = tokio::spawn(controller.run());

        let serving = socket.clone();
        let accept_task = tokio::spawn(async move { serving.serve().await });

        let mut sigterm = signal(SignalKind::terminate())
            .context("Failed to create SIGTERM handler")?;
        let mut sigint = signal(SignalKind::interrupt())
            .context("Failed to create SIGINT handler")?;
        let mut sighup = signal(SignalKind::hangup())
            .context("Failed to create SIGHUP handler")?;
        let mut sigusr1 = signal(SignalKind::user_defined1())
            .context("Failed to create SIGUSR1 handler")?;
        let mut sigusr2 = signal(SignalKind::user_defined2())
            .context("Failed to create SIGUSR2 handler")?;

        if autostart {
            handle.send(ControlSignal::Start).await?;
        } else {
            info!("Holding; waiting for a start command");
        }

        info!("Service running");

        loop {
            tokio::select! {
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down gracefully");
                    break;
                }
                _ = sigint.recv() => {
                    info!("Received SIGINT, shutting down gracefully");
                    break;
                }
                _ = sighup.recv() => {
                    info!("Received SIGHUP, reloading configuration");
                    Self::signal(&handle, ControlSignal::Reload).await;
                }
                _ = sigusr1.recv() => {
                    info!("Received SIGUSR1, starting");
                    Self::signal(&handle, ControlSignal::Start).await;
                }
                _ = sigusr2.recv() => {
                    info!("Received SIGUSR2, stopping");
                    Self::signal(&handle, ControlSignal::Stop).await;
                }
                Some(event) = events.recv() => {
                    Self::handle_event(&handle, &store, event).await;
                }
            }
        }

        info!("Shutting down versiongated");
        shutdown.cancel();
        if let Err(e) = controller_task.await {
            warn!(error = %e, "Control loop ended abnormally");
        }

        if let Err(e) = store.append_audit(AuditEvent::new(AuditEventType::ServiceStopped)) {
            warn!(error = %e, "Failed to log service shutdown");
        }
        accept_task.abort();
        drop(events);
        socket.shutdown();

        info!("Shutdown complete");
        Ok(())
    }

    async fn signal(handle: &ControlHandle, signal: ControlSignal) {
        if let Err(e) = handle.send(signal).await {
            warn!(error = %e, "Control signal not delivered");
        }
    }

    async fn handle_event(handle: &ControlHandle, store: &Arc<dyn Store>, event: ControlEvent) {
        match event {
            ControlEvent::Request {
                client,
                request,
                reply,
            } => {
                let response =
                    Self::handle_command(handle, &client, request.request_id, request.command).await;
                let _ = reply.send(response);
            }

            ControlEvent::Connected(client) => {
                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientConnected {
                    client_id: client.client_id.to_string(),
                    role: format!("{:?}", client.role),
                    uid: client.uid,
                }));
            }

            ControlEvent::Disconnected(client) => {
                debug!(client_id = %client.client_id, "Client disconnected");

                let _ = store.append_audit(AuditEvent::new(AuditEventType::ClientDisconnected {
                    client_id: client.client_id.to_string(),
                }));
            }
        }
    }

    async fn handle_command(
        handle: &ControlHandle,
        client: &ClientInfo,
        request_id: u64,
        command: Command,
    ) -> Response {
        let signal = match command {
            Command::Status => {
                return Response::success(request_id, ResponsePayload::Status(handle.snapshot()));
            }
            Command::Ping => return Response::success(request_id, ResponsePayload::Pong),
            Command::Start => ControlSignal::Start,
            Command::Stop => ControlSignal::Stop,
            Command::Reload => ControlSignal::Reload,
        };

        if client.role != ClientRole::Admin {
            warn!(client_id = %client.client_id, role = ?client.role, "Control command denied");
            return Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::PermissionDenied, "control requires an admin client"),
            );
        }

        match handle.send(signal).await {
            Ok(()) => Response::success(request_id, ResponsePayload::Accepted),
            Err(e) => Response::error(
                request_id,
                ErrorInfo::new(ErrorCode::ServiceUnavailable, e.to_string()),
            ),
        }
    }
}

fn init_logging(args: &Args) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&args.log_level));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true);
    if args.log_json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Load configuration and apply command-line overrides
fn load_settings(args: &Args) -> Result<Settings> {
    let settings = load_config(&args.config)
        .with_context(|| format!("Failed to load config from {:?}", args.config))?;
    settings
        .providers
        .inventory()
        .with_context(|| format!("Incomplete config {:?}", args.config))?;

    info!(
        config_path = %args.config.display(),
        required_version = %settings.compliance.required_version,
        escalation = ?settings.compliance.escalation,
        "Configuration loaded"
    );
    Ok(settings)
}

#[tokio::main]
async fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args);

    info!(version = env!("CARGO_PKG_VERSION"), "versiongated starting");

    let settings = match load_settings(&args) {
        Ok(settings) => settings,
        Err(e) => {
            error!(error = format!("{e:#}"), "Configuration error");
            return ExitCode::from(EXIT_CONFIG);
        }
    };

    let collab = match Service::collaborators(&args, &settings) {
        Ok(collab) => collab,
        Err(e) => {
            error!(error = format!("{e:#}"), "Startup failed");
            return ExitCode::from(EXIT_BOOT);
        }
    };

    if !args.clear_tables.is_empty() {
        let names: Vec<&str> = args.clear_tables.iter().map(String::as_str).collect();
        return match collab.store.clear_tables(&names) {
            Ok(()) => {
                info!(tables = ?names, "Tables cleared");
                ExitCode::SUCCESS
            }
            Err(e) => {
                error!(error = %e, "Clearing tables failed");
                ExitCode::from(EXIT_BOOT)
            }
        };
    }

    if args.daily_report {
        return match send_daily_report(&settings, &collab, versiongate_util::now()).await {
            Ok(_) => ExitCode::SUCCESS,
            Err(e) => {
                error!(error = %e, "Daily report failed");
                ExitCode::FAILURE
            }
        };
    }

    let service = match Service::new(&args, settings, collab).await {
        Ok(service) => service,
        Err(e) => {
            error!(error = format!("{e:#}"), "Startup failed");
            return ExitCode::from(EXIT_BOOT);
        }
    };

    match service.run(&args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!(error = format!("{e:#}"), "Service failed");
            ExitCode::FAILURE
        }
    }
}
