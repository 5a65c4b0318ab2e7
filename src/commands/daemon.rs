use anyhow::{Context, Result};
use kairo_kernel::kernel::{
    EventBus, FileProcessStore, InMemoryBus, KernelServer, MemoryDeviceRegistry, MemoryVault,
    ProcessManager, ServiceManager,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

pub(crate) async fn cmd_run(
    config_path: Option<PathBuf>,
    socket: Option<PathBuf>,
    start_services: bool,
) -> Result<()> {
    let mut config = super::load_config(config_path)?;
    if let Some(socket) = socket {
        config.socket_path = socket;
    }

    info!("Kairo kernel starting...");
    info!("  Socket: {}", config.socket_path.display());
    info!("  State:  {}", config.state_dir.display());
    if config.trust_unidentified {
        warn!("Unidentified connections are trusted (set trust_unidentified = false to require identify)");
    }

    std::fs::create_dir_all(&config.state_dir)
        .with_context(|| format!("Failed to create state directory {}", config.state_dir.display()))?;

    let bus: Arc<dyn EventBus> = Arc::new(InMemoryBus::new());
    let store = Arc::new(FileProcessStore::in_dir(&config.state_dir));
    let processes = ProcessManager::new(store);
    match processes.recover() {
        Ok(report) => info!(
            adopted = report.adopted.len(),
            vanished = report.vanished.len(),
            "Recovered processes from the previous session"
        ),
        Err(e) => warn!("Process recovery failed: {}", e),
    }

    let devices = Arc::new(MemoryDeviceRegistry::new().with_bus(Arc::clone(&bus)));
    for device in config.devices.iter().cloned() {
        devices.register(device);
    }

    let services = ServiceManager::new(processes.clone());
    for definition in config.services.iter().cloned() {
        services
            .register_service(definition)
            .context("Failed to register service")?;
    }
    if let Err(e) = services.start_order() {
        warn!("Configured services cannot be started: {}", e);
    }

    let vault = Arc::new(MemoryVault::new());
    let secrets = vault.seed(&config.vault);
    info!(secrets, tokens = config.vault.tokens.len(), "Vault seeded");

    let server = KernelServer::builder(processes)
        .socket_path(&config.socket_path)
        .vault(vault)
        .devices(devices)
        .bus(bus)
        .services(services)
        .start_services(start_services)
        .trust_unidentified(config.trust_unidentified)
        .stream_buffer_size(config.stream_buffer_bytes)
        .build();

    let shutdown = CancellationToken::new();
    spawn_signal_handler(shutdown.clone())?;

    server.run(shutdown).await
}

fn spawn_signal_handler(shutdown: CancellationToken) -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        tokio::select! {
            _ = sigterm.recv() => info!("Received SIGTERM"),
            _ = sigint.recv() => info!("Received SIGINT"),
        }
        shutdown.cancel();
    });
    Ok(())
}
