//! Fixed-rate command publisher with statum state machine
//!
//! ```text
//! Initializing ──► Configured ──► Active ──► Deactivating ──► Deactivated
//!                                   │
//!                         tick every `period_ms`:
//!                 LatestFrame ──► JointCommand ──► BusClient
//! ```
//!
//! A tick without a stored frame or with the bus down is skipped. Nothing is
//! buffered, so a skipped tick is simply lost.

use chrono::Utc;
use statum::{machine, state};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::{PublishStats, PublisherError, PublisherSettings, TickOutcome};
use crate::mapping::JointCommand;
use crate::mqtt::{BusClient, BusError};
use crate::session::LatestFrame;
use crate::status::{LinkState, StatusBoard};

const STATS_LOG_INTERVAL: Duration = Duration::from_secs(10);

#[state]
#[derive(Debug, Clone)]
pub enum PublisherState {
    Initializing,
    Configured,
    Active,
    Deactivating,
    Deactivated,
}

#[machine]
pub struct CommandPublisher<S: PublisherState> {
    bus: Arc<dyn BusClient>,
    mailbox: LatestFrame,
    status: StatusBoard,
    settings: PublisherSettings,
    stats: PublishStats,
    stats_sender: watch::Sender<PublishStats>,
}

impl<S: PublisherState> CommandPublisher<S> {
    pub fn stats(&self) -> &PublishStats {
        &self.stats
    }
}

impl CommandPublisher<Initializing> {
    pub fn create(
        bus: Arc<dyn BusClient>,
        mailbox: LatestFrame,
        status: StatusBoard,
        settings: PublisherSettings,
        stats_sender: watch::Sender<PublishStats>,
    ) -> Self {
        debug!("Creating Command Publisher with settings: {:?}", settings);
        Self::new(
            bus,
            mailbox,
            status,
            settings,
            PublishStats::default(),
            stats_sender,
        )
    }

    pub fn configure(self) -> Result<CommandPublisher<Configured>, PublisherError> {
        if self.settings.period_ms == 0 {
            return Err(PublisherError::InvalidSettings(
                "publish period must be positive".to_string(),
            ));
        }
        if self.settings.topic.trim().is_empty() {
            return Err(PublisherError::InvalidSettings(
                "command topic must not be empty".to_string(),
            ));
        }
        info!(
            "Command Publisher configured: every {}ms to {}",
            self.settings.period_ms, self.settings.topic
        );
        Ok(self.transition())
    }
}

impl CommandPublisher<Configured> {
    pub fn activate(self) -> CommandPublisher<Active> {
        info!("Activating Command Publisher");
        self.transition()
    }
}

impl CommandPublisher<Active> {
    /// One publish cycle
    pub async fn tick(&mut self) -> TickOutcome {
        let Some(frame) = self.mailbox.load() else {
            self.stats.skipped_no_frame += 1;
            return TickOutcome::NoFrame;
        };

        let bus_state = self.bus.state();
        if bus_state != LinkState::Connected {
            self.stats.skipped_bus_down += 1;
            self.status.set_bus_state(bus_state);
            return TickOutcome::BusUnavailable(bus_state);
        }

        let command = JointCommand::from_frame(&frame, Utc::now());
        match self.bus.publish(&self.settings.topic, &command).await {
            Ok(()) => {
                self.stats.published += 1;
                self.status.set_bus_state(LinkState::Connected);
                TickOutcome::Published
            }
            Err(BusError::NotConnected(state)) => {
                self.stats.skipped_bus_down += 1;
                self.status.set_bus_state(state);
                TickOutcome::BusUnavailable(state)
            }
            Err(e) => {
                warn!("Failed to publish joint command: {}", e);
                self.stats.failed += 1;
                TickOutcome::Failed
            }
        }
    }

    pub async fn run_until_shutdown(
        mut self,
        mut shutdown_rx: oneshot::Receiver<()>,
    ) -> CommandPublisher<Deactivating> {
        info!("Starting publish loop");
        let mut ticker = tokio::time::interval(Duration::from_millis(self.settings.period_ms));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let mut last_log_time = Instant::now();

        loop {
            tokio::select! {
                _ = &mut shutdown_rx => {
                    info!("Shutdown signal received for Command Publisher");
                    break;
                }
                _ = ticker.tick() => {
                    let outcome = self.tick().await;
                    debug!("Publish tick: {:?}", outcome);
                    self.stats_sender.send_replace(self.stats.clone());

                    if last_log_time.elapsed() >= STATS_LOG_INTERVAL {
                        info!(
                            "Command Publisher stats: {} published, {} skipped without frame, {} skipped with bus down, {} failed",
                            self.stats.published,
                            self.stats.skipped_no_frame,
                            self.stats.skipped_bus_down,
                            self.stats.failed
                        );
                        last_log_time = Instant::now();
                    }
                }
            }
        }

        self.transition()
    }
}

impl CommandPublisher<Deactivating> {
    /// Releases the bus connection
    pub async fn shutdown(self) -> CommandPublisher<Deactivated> {
        info!("Shutting down Command Publisher");
        self.bus.shutdown().await;
        self.status.set_bus_state(LinkState::Disconnected);
        info!(
            "Command Publisher stopped after {} commands",
            self.stats.published
        );
        self.transition()
    }
}

/// Owns the publisher task
#[derive(Debug)]
pub struct PublisherHandle {
    task_handle: Option<JoinHandle<PublishStats>>,
    shutdown_tx: Option<oneshot::Sender<()>>,
    stats: watch::Receiver<PublishStats>,
}

impl PublisherHandle {
    pub fn spawn(
        bus: Arc<dyn BusClient>,
        mailbox: LatestFrame,
        status: StatusBoard,
        settings: PublisherSettings,
    ) -> Result<Self, PublisherError> {
        let (stats_tx, stats_rx) = watch::channel(PublishStats::default());
        let publisher =
            CommandPublisher::create(bus, mailbox, status, settings, stats_tx).configure()?;
        let active = publisher.activate();

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task_handle = tokio::spawn(async move {
            let deactivating = active.run_until_shutdown(shutdown_rx).await;
            let stopped = deactivating.shutdown().await;
            stopped.stats().clone()
        });

        Ok(Self {
            task_handle: Some(task_handle),
            shutdown_tx: Some(shutdown_tx),
            stats: stats_rx,
        })
    }

    pub fn stats(&self) -> PublishStats {
        self.stats.borrow().clone()
    }

    /// Stops the loop and releases the bus; repeated calls are no-ops
    pub async fn shutdown(&mut self) -> Result<PublishStats, PublisherError> {
        if let Some(tx) = self.shutdown_tx.take() {
            if tx.send(()).is_err() {
                warn!("Command Publisher task already terminated");
            }
        }

        match self.task_handle.take() {
            Some(handle) => handle.await.map_err(|e| {
                error!("Command Publisher task panicked: {}", e);
                PublisherError::TaskFailed(e.to_string())
            }),
            None => {
                debug!("Command Publisher already shut down");
                Ok(self.stats())
            }
        }
    }
}
