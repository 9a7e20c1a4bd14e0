use color_eyre::{eyre::eyre, Result};
use excavlink::config::{config_path, AppConfig, RunRole};
use excavlink::controller::{ControllerHandle, ControllerSettings};
use excavlink::mqtt;
use excavlink::publisher::PublisherHandle;
use excavlink::session::{
    CaptureSource, LatestFrame, LocalHub, MqttRelay, RoleIo, SessionHandle, SessionState,
    SignalingClient,
};
use excavlink::status::{MachineTelemetry, StatusBoard};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn, Level};
use tracing_subscriber::FmtSubscriber;

const STATUS_LOG_INTERVAL: Duration = Duration::from_secs(5);
const LOOPBACK_READY_TIMEOUT: Duration = Duration::from_secs(5);

/// Everything one run owns, torn down in reverse order of data flow
#[derive(Default)]
struct Running {
    sessions: Vec<SessionHandle>,
    publisher: Option<PublisherHandle>,
    controller: Option<ControllerHandle>,
    boards: Vec<(&'static str, StatusBoard)>,
    _telemetry: Option<watch::Sender<MachineTelemetry>>,
}

impl Running {
    async fn shutdown(mut self) -> Result<()> {
        for session in self.sessions.drain(..) {
            let role = session.role();
            session
                .shutdown()
                .await
                .map_err(|e| eyre!("Failed to shut down {} session: {}", role, e))?;
        }

        if let Some(mut publisher) = self.publisher.take() {
            let stats = publisher
                .shutdown()
                .await
                .map_err(|e| eyre!("Failed to shut down publisher: {}", e))?;
            info!(
                "Publisher stopped after {} commands ({} without frame, {} bus down, {} failed)",
                stats.published, stats.skipped_no_frame, stats.skipped_bus_down, stats.failed
            );
        }

        if let Some(mut controller) = self.controller.take() {
            controller.shutdown().await;
        }
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let path = config_path();
    info!("Loading configuration from {}", path.display());
    let config = AppConfig::load_or_default(&path)
        .await
        .map_err(|e| eyre!("Failed to load config {}: {}", path.display(), e))?;

    info!(
        "Starting excavlink as {} for machine {}",
        config.role, config.machine_id
    );
    let running = match config.role {
        RunRole::Operator => run_operator(&config).await?,
        RunRole::Machine => run_machine(&config).await?,
        RunRole::Loopback => run_loopback(&config).await?,
    };

    let cancel = CancellationToken::new();
    let logger = spawn_status_logger(running.boards.clone(), cancel.clone());

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| eyre!("Failed to listen for Ctrl-C: {}", e))?;
    info!("Ctrl-C received, shutting down");

    cancel.cancel();
    let _ = logger.await;
    running.shutdown().await?;
    info!("excavlink stopped");
    Ok(())
}

fn spawn_input(config: &AppConfig) -> ControllerHandle {
    let settings = ControllerSettings {
        normalizer: config.input.clone(),
        ..Default::default()
    };
    match ControllerHandle::spawn(Some(settings)) {
        Ok(controller) => controller,
        Err(e) => {
            warn!("Gamepad input unavailable ({}), sending neutral frames", e);
            ControllerHandle::idle(config.input.clone())
        }
    }
}

fn spawn_operator_session(
    signaling: Arc<dyn SignalingClient>,
    controller: &ControllerHandle,
    status: StatusBoard,
    config: &AppConfig,
) -> SessionHandle {
    SessionHandle::spawn(
        signaling,
        RoleIo::Operator {
            frames: controller.frames(),
        },
        status,
        config.session.clone(),
    )
}

/// Session, mailbox and publisher of the machine side
fn spawn_machine_side(
    signaling: Arc<dyn SignalingClient>,
    status: StatusBoard,
    config: &AppConfig,
    running: &mut Running,
) -> Result<SessionHandle> {
    let bus = mqtt::connect(&config.bus)
        .map_err(|e| eyre!("Failed to open control bus {}: {}", config.bus.url, e))?;
    let mailbox = LatestFrame::new();
    let (telemetry_tx, telemetry_rx) = watch::channel(config.telemetry.clone());

    let publisher = PublisherHandle::spawn(
        bus,
        mailbox.clone(),
        status.clone(),
        config.publisher.clone(),
    )
    .map_err(|e| eyre!("Failed to start publisher: {}", e))?;

    let session = SessionHandle::spawn(
        signaling,
        RoleIo::Machine {
            mailbox,
            camera: CaptureSource::from(&config.session.camera),
            telemetry: telemetry_rx,
        },
        status,
        config.session.clone(),
    );

    running.publisher = Some(publisher);
    running._telemetry = Some(telemetry_tx);
    Ok(session)
}

async fn run_operator(config: &AppConfig) -> Result<Running> {
    let status = StatusBoard::new();
    let signaling: Arc<dyn SignalingClient> = Arc::new(
        MqttRelay::new(config.signaling.clone())
            .map_err(|e| eyre!("Failed to create signaling relay: {}", e))?,
    );
    let controller = spawn_input(config);
    let session = spawn_operator_session(signaling, &controller, status.clone(), config);
    session.start(&config.machine_id).await?;

    Ok(Running {
        sessions: vec![session],
        controller: Some(controller),
        boards: vec![("operator", status)],
        ..Default::default()
    })
}

async fn run_machine(config: &AppConfig) -> Result<Running> {
    let status = StatusBoard::new();
    let signaling: Arc<dyn SignalingClient> = Arc::new(
        MqttRelay::new(config.signaling.clone())
            .map_err(|e| eyre!("Failed to create signaling relay: {}", e))?,
    );
    let mut running = Running::default();
    let session = spawn_machine_side(signaling, status.clone(), config, &mut running)?;
    session.start(&config.machine_id).await?;

    running.sessions.push(session);
    running.boards.push(("machine", status));
    Ok(running)
}

async fn run_loopback(config: &AppConfig) -> Result<Running> {
    let hub = LocalHub::new();
    let machine_status = StatusBoard::new();
    let operator_status = StatusBoard::new();
    let mut running = Running::default();

    let machine = spawn_machine_side(
        Arc::new(hub.endpoint()),
        machine_status.clone(),
        config,
        &mut running,
    )?;
    machine.start(&config.machine_id).await?;

    // The operator dials immediately, so the machine has to be listening first
    let ready = tokio::time::timeout(
        LOOPBACK_READY_TIMEOUT,
        machine.wait_for(|state| {
            matches!(
                state,
                SessionState::AwaitingPeer { .. } | SessionState::Error { .. }
            )
        }),
    )
    .await
    .map_err(|_| eyre!("Machine session did not register in time"))??;
    if let SessionState::Error { cause } = ready {
        error!("Machine session failed to start: {}", cause);
        return Err(eyre!("Machine session failed: {}", cause));
    }

    let controller = spawn_input(config);
    let operator = spawn_operator_session(
        Arc::new(hub.endpoint()),
        &controller,
        operator_status.clone(),
        config,
    );
    operator.start(&config.machine_id).await?;

    running.sessions = vec![operator, machine];
    running.controller = Some(controller);
    running.boards = vec![("operator", operator_status), ("machine", machine_status)];
    Ok(running)
}

fn spawn_status_logger(
    boards: Vec<(&'static str, StatusBoard)>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(STATUS_LOG_INTERVAL);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    for (label, board) in &boards {
                        info!("[{}] {}", label, board.snapshot());
                    }
                }
            }
        }
    })
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
