use async_trait::async_trait;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::bus::{BusClient, BusError};
use super::config::{mqtt_options, BusConfig, Endpoint};
use crate::mapping::JointCommand;
use crate::status::LinkState;

#[derive(Clone, Debug, Default)]
pub struct MqttStats {
    pub messages_sent: usize,
    pub publish_failures: usize,
    pub reconnects: usize,
    pub last_activity: Option<chrono::DateTime<chrono::Local>>,
}

/// Control bus over an MQTT broker.
///
/// The rumqttc event loop runs in its own task and is the only writer of the
/// connection state. Publishing never waits on the broker.
pub struct MqttBus {
    client: AsyncClient,
    state: watch::Receiver<LinkState>,
    stats: Arc<parking_lot::Mutex<MqttStats>>,
    cancel: CancellationToken,
    task: parking_lot::Mutex<Option<JoinHandle<()>>>,
}

impl MqttBus {
    pub fn connect(config: &BusConfig) -> Result<Self, BusError> {
        let (host, port) = match config.endpoint()? {
            Endpoint::Mqtt { host, port } => (host, port),
            Endpoint::Memory => {
                return Err(BusError::InvalidEndpoint(
                    "memory:// is not an MQTT endpoint".to_string(),
                ))
            }
        };

        info!("Connecting control bus to {}:{} as {}", host, port, config.client_id);
        let options = mqtt_options(
            &host,
            port,
            &config.client_id,
            Duration::from_secs(config.keep_alive_secs.max(1)),
        );
        let (client, event_loop) = AsyncClient::new(options, 100);

        let (state_tx, state_rx) = watch::channel(LinkState::Connecting);
        let stats = Arc::new(parking_lot::Mutex::new(MqttStats::default()));
        let cancel = CancellationToken::new();

        let task = tokio::spawn(drive_event_loop(
            event_loop,
            state_tx,
            stats.clone(),
            cancel.clone(),
            Duration::from_millis(config.reconnect_delay_ms),
        ));

        Ok(Self {
            client,
            state: state_rx,
            stats,
            cancel,
            task: parking_lot::Mutex::new(Some(task)),
        })
    }

    pub fn stats(&self) -> MqttStats {
        self.stats.lock().clone()
    }
}

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

fn log_stats(stats: &MqttStats) {
    info!(
        "Control bus stats: {} sent, {} publish failures, {} reconnects, last activity {}",
        stats.messages_sent,
        stats.publish_failures,
        stats.reconnects,
        stats
            .last_activity
            .map(|t| t.format("%H:%M:%S").to_string())
            .unwrap_or_else(|| "never".to_string())
    );
}

async fn drive_event_loop(
    mut event_loop: EventLoop,
    state: watch::Sender<LinkState>,
    stats: Arc<parking_lot::Mutex<MqttStats>>,
    cancel: CancellationToken,
    reconnect_delay: Duration,
) {
    let mut last_log_time = tokio::time::Instant::now();
    loop {
        let polled = tokio::select! {
            _ = cancel.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                info!("Control bus connected");
                state.send_replace(LinkState::Connected);
            }
            Ok(Event::Incoming(Packet::Disconnect)) => {
                warn!("Broker closed the control bus connection");
                state.send_replace(LinkState::Disconnected);
            }
            Ok(event) => {
                debug!("Control bus event: {:?}", event);
                stats.lock().last_activity = Some(chrono::Local::now());
            }
            Err(e) => {
                error!("Control bus connection error: {}", e);
                stats.lock().reconnects += 1;
                state.send_replace(LinkState::Error);
                // The next poll reconnects
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(reconnect_delay) => {}
                }
                state.send_replace(LinkState::Connecting);
            }
        }

        if last_log_time.elapsed() >= STATS_LOG_INTERVAL {
            log_stats(&stats.lock());
            last_log_time = tokio::time::Instant::now();
        }
    }
    state.send_replace(LinkState::Disconnected);
    debug!("Control bus event loop stopped");
}

#[async_trait]
impl BusClient for MqttBus {
    fn state(&self) -> LinkState {
        *self.state.borrow()
    }

    async fn publish(&self, topic: &str, command: &JointCommand) -> Result<(), BusError> {
        let state = self.state();
        if state != LinkState::Connected {
            return Err(BusError::NotConnected(state));
        }

        let payload = command.to_json()?;
        match self.client.try_publish(topic, QoS::AtMostOnce, false, payload) {
            Ok(()) => {
                let mut stats = self.stats.lock();
                stats.messages_sent += 1;
                stats.last_activity = Some(chrono::Local::now());
                Ok(())
            }
            Err(e) => {
                self.stats.lock().publish_failures += 1;
                Err(BusError::Publish(e.to_string()))
            }
        }
    }

    async fn shutdown(&self) {
        info!("Shutting down control bus");
        if let Err(e) = self.client.disconnect().await {
            debug!("Disconnect request not delivered: {}", e);
        }
        self.cancel.cancel();
        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                error!("Control bus task panicked: {}", e);
            }
        }
        log_stats(&self.stats());
    }
}

impl Drop for MqttBus {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}
