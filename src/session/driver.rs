//! Session driver task
//!
//! Owns one [`SessionState`] and runs it against a [`SignalingClient`]. All
//! inputs (presentation commands, signaling events, the media retry timer,
//! outgoing frames and telemetry ticks) are multiplexed in a single task, so
//! transitions never race.

use std::collections::VecDeque;
use std::future::pending;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use super::mailbox::LatestFrame;
use super::media::CaptureSource;
use super::quality::LinkMonitor;
use super::signaling::{CallId, ChannelId, EventStream, SignalingClient, SignalingEvent};
use super::state::{transition, Effect, Role, SessionContext, SessionEvent, SessionState};
use super::wire::WireMessage;
use super::{SessionError, SessionSettings};
use crate::frame::ControlFrame;
use crate::status::{MachineTelemetry, StatusBoard};

/// What each role plugs into its session
pub enum RoleIo {
    /// Frames from the input pipeline go out over the data channel
    Operator { frames: watch::Receiver<ControlFrame> },
    /// Frames from the data channel land in the mailbox
    Machine {
        mailbox: LatestFrame,
        camera: CaptureSource,
        telemetry: watch::Receiver<MachineTelemetry>,
    },
}

impl RoleIo {
    pub fn role(&self) -> Role {
        match self {
            RoleIo::Operator { .. } => Role::Operator,
            RoleIo::Machine { .. } => Role::Machine,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SessionStats {
    pub frames_sent: u64,
    pub frames_received: u64,
    pub malformed_dropped: u64,
    pub acks_received: u64,
    pub telemetry_sent: u64,
}

enum Command {
    Start {
        machine_id: String,
    },
    Disconnect {
        done: oneshot::Sender<()>,
    },
}

struct SessionDriver {
    ctx: SessionContext,
    settings: SessionSettings,
    signaling: Arc<dyn SignalingClient>,
    io: RoleIo,
    status: StatusBoard,
    state: SessionState,
    state_tx: watch::Sender<SessionState>,
    stats_tx: watch::Sender<SessionStats>,
    events: Option<EventStream>,
    retry_at: Option<Instant>,
    monitor: LinkMonitor,
    seq: u64,
    epoch: Instant,
    stats: SessionStats,
    frames_open: bool,
}

impl SessionDriver {
    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        info!("Session driver started as {}", self.ctx.role);
        let mut telemetry_ticker = interval(Duration::from_millis(
            self.settings.telemetry_interval_ms.max(1),
        ));
        telemetry_ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        let sends_telemetry = matches!(self.io, RoleIo::Machine { .. });
        let mut last_log_time = Instant::now();

        loop {
            let sends_frames = self.frames_open
                && matches!(self.io, RoleIo::Operator { .. })
                && self.state.link().is_some();

            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Start { machine_id }) => {
                        self.feed(SessionEvent::Start { machine_id }).await;
                    }
                    Some(Command::Disconnect { done }) => {
                        self.feed(SessionEvent::Disconnect).await;
                        let _ = done.send(());
                    }
                    None => {
                        debug!("Session handle dropped, tearing down");
                        self.feed(SessionEvent::Disconnect).await;
                        break;
                    }
                },

                event = next_event(&mut self.events) => match event {
                    Some(event) => self.feed(SessionEvent::Signaling(event)).await,
                    None => {
                        self.events = None;
                        self.feed(SessionEvent::Signaling(SignalingEvent::Error {
                            reason: "signaling stream ended".to_string(),
                        }))
                        .await;
                    }
                },

                _ = sleep_until(self.retry_at.unwrap_or_else(Instant::now)), if self.retry_at.is_some() => {
                    self.retry_at = None;
                    self.feed(SessionEvent::MediaRetryDue).await;
                }

                changed = frame_changed(&mut self.io), if sends_frames => match changed {
                    Some(frame) => self.send_control(frame).await,
                    None => {
                        warn!("Input pipeline closed, no more frames to send");
                        self.frames_open = false;
                    }
                },

                _ = telemetry_ticker.tick(), if sends_telemetry => {
                    self.send_telemetry().await;
                    if last_log_time.elapsed() >= Duration::from_secs(10) {
                        self.log_stats();
                        last_log_time = Instant::now();
                    }
                }
            }
            self.publish_stats();
        }
        self.log_stats();
        info!("Session driver stopped in state {}", self.state.name());
    }

    fn log_stats(&self) {
        info!(
            "Session stats ({}): state {}, {} frames sent, {} received, {} malformed, {} acks",
            self.ctx.role,
            self.state.name(),
            self.stats.frames_sent,
            self.stats.frames_received,
            self.stats.malformed_dropped,
            self.stats.acks_received
        );
    }

    async fn feed(&mut self, event: SessionEvent) {
        let mut queue = VecDeque::from([event]);
        while let Some(event) = queue.pop_front() {
            debug!("Session event in {}: {:?}", self.state.name(), event);
            let step = transition(&self.state, event, &self.ctx);
            if step.next != self.state {
                info!("Session {} -> {}", self.state.name(), step.next.name());
                if let SessionState::Error { cause } = &step.next {
                    error!("Session failed: {}", cause);
                }
                self.state = step.next;
                self.state_tx.send_replace(self.state.clone());
            }
            for effect in step.effects {
                if let Some(follow_up) = self.execute(effect).await {
                    queue.push_back(follow_up);
                }
            }
        }
    }

    fn publish_stats(&self) {
        let stats = &self.stats;
        self.stats_tx.send_if_modified(|current| {
            if current == stats {
                false
            } else {
                *current = stats.clone();
                true
            }
        });
    }

    /// Runs one effect; close and release failures are logged and skipped
    async fn execute(&mut self, effect: Effect) -> Option<SessionEvent> {
        match effect {
            Effect::Register(identity) => match self.signaling.register(&identity).await {
                Ok(events) => {
                    self.events = Some(events);
                    None
                }
                Err(e) => Some(SessionEvent::RequestFailed(e.to_string())),
            },
            Effect::ConnectData(remote) => match self.signaling.connect(&remote).await {
                Ok(channel) => {
                    debug!("Opening data channel {} to {}", channel, remote);
                    None
                }
                Err(e) => Some(SessionEvent::RequestFailed(e.to_string())),
            },
            Effect::SendHello(channel) => {
                let hello = WireMessage::Hello {
                    operator_id: self
                        .state
                        .local_identity()
                        .map(|id| id.to_string())
                        .unwrap_or_default(),
                    timestamp: chrono::Utc::now().timestamp_millis(),
                };
                self.monitor.reset();
                self.send_wire(channel, &hello).await;
                None
            }
            Effect::Deliver(payload) => {
                self.handle_payload(&payload).await;
                None
            }
            Effect::CloseData(channel) => {
                if let Err(e) = self.signaling.close_channel(channel).await {
                    warn!("Closing data channel {} failed: {}", channel, e);
                }
                None
            }
            Effect::PlaceCall {
                call,
                remote,
                track,
            } => {
                info!("Calling {} with {}x{} video", remote, track.width, track.height);
                match self.signaling.call(call, &remote, track).await {
                    Ok(()) => None,
                    Err(e) => Some(call_error(call, e.to_string())),
                }
            }
            Effect::AnswerCall(call) => match self.signaling.answer(call).await {
                Ok(()) => None,
                Err(e) => Some(call_error(call, e.to_string())),
            },
            Effect::RejectCall(call) => {
                warn!("Rejecting call {}: media already active or unexpected", call);
                if let Err(e) = self.signaling.close_call(call).await {
                    warn!("Rejecting call {} failed: {}", call, e);
                }
                None
            }
            Effect::CloseCall(call) => {
                if let Err(e) = self.signaling.close_call(call).await {
                    warn!("Closing call {} failed: {}", call, e);
                }
                None
            }
            Effect::ProbeMediaSource => match &self.io {
                RoleIo::Machine { camera, .. } => Some(match camera.live_track() {
                    Some(track) => SessionEvent::MediaSourceReady {
                        track,
                        call: CallId::new(),
                    },
                    None => {
                        debug!("Capture source not ready");
                        SessionEvent::MediaSourceUnavailable
                    }
                }),
                RoleIo::Operator { .. } => None,
            },
            Effect::ScheduleMediaRetry => {
                self.retry_at =
                    Some(Instant::now() + Duration::from_millis(self.settings.media_retry_ms));
                None
            }
            Effect::CancelMediaRetry => {
                self.retry_at = None;
                None
            }
            Effect::Unregister => {
                if let Err(e) = self.signaling.unregister().await {
                    warn!("Releasing identity failed: {}", e);
                }
                self.events = None;
                None
            }
            Effect::SetDataStatus(state) => {
                self.status.set_data_state(state);
                None
            }
            Effect::SetMediaStatus(state) => {
                self.status.set_media_state(state);
                None
            }
        }
    }

    async fn handle_payload(&mut self, payload: &[u8]) {
        let message = match WireMessage::decode(payload) {
            Ok(message) => message,
            Err(e) => {
                self.stats.malformed_dropped += 1;
                warn!("Dropping data channel payload: {}", e);
                return;
            }
        };

        match (&self.io, message) {
            (
                RoleIo::Machine { mailbox, .. },
                WireMessage::Control {
                    seq,
                    sent_at_ms,
                    frame,
                },
            ) => {
                mailbox.store(frame);
                self.status.set_latest_frame(frame);
                self.stats.frames_received += 1;
                if let Some(channel) = self.state.link().map(|link| link.channel) {
                    self.send_wire(channel, &WireMessage::Ack { seq, sent_at_ms })
                        .await;
                }
            }
            (RoleIo::Machine { .. }, WireMessage::Hello { operator_id, .. }) => {
                info!("Operator {} connected", operator_id);
            }
            (RoleIo::Operator { .. }, WireMessage::Ack { seq, sent_at_ms }) => {
                let now = self.now_ms();
                if self.monitor.record_ack(seq, sent_at_ms, now) {
                    self.stats.acks_received += 1;
                    self.status.set_quality(self.monitor.quality(now));
                }
            }
            (RoleIo::Operator { .. }, WireMessage::Telemetry(telemetry)) => {
                self.status.set_machine(telemetry);
            }
            (_, other) => debug!("Ignoring {:?} on {} side", other, self.ctx.role),
        }
    }

    async fn send_control(&mut self, frame: ControlFrame) {
        let Some(channel) = self.state.link().map(|link| link.channel) else {
            return;
        };
        self.seq += 1;
        let sent_at_ms = self.now_ms();
        let message = WireMessage::Control {
            seq: self.seq,
            sent_at_ms,
            frame,
        };
        if self.send_wire(channel, &message).await {
            self.monitor.record_sent(self.seq, sent_at_ms);
            self.status.set_quality(self.monitor.quality(sent_at_ms));
            self.stats.frames_sent += 1;
            self.status.set_latest_frame(frame);
        }
    }

    async fn send_telemetry(&mut self) {
        let Some(channel) = self.state.link().map(|link| link.channel) else {
            return;
        };
        let telemetry = match &self.io {
            RoleIo::Machine { telemetry, .. } => telemetry.borrow().clone(),
            RoleIo::Operator { .. } => return,
        };
        if self
            .send_wire(channel, &WireMessage::Telemetry(telemetry))
            .await
        {
            self.stats.telemetry_sent += 1;
        }
    }

    async fn send_wire(&self, channel: ChannelId, message: &WireMessage) -> bool {
        let payload = match message.encode() {
            Ok(payload) => payload,
            Err(e) => {
                error!("Failed to encode {:?}: {}", message, e);
                return false;
            }
        };
        match self.signaling.send(channel, payload).await {
            Ok(()) => true,
            Err(e) => {
                debug!("Send on channel {} failed: {}", channel, e);
                false
            }
        }
    }

    fn now_ms(&self) -> u64 {
        u64::try_from(self.epoch.elapsed().as_millis()).unwrap_or(u64::MAX)
    }
}

fn call_error(call: CallId, reason: String) -> SessionEvent {
    SessionEvent::Signaling(SignalingEvent::CallError { call, reason })
}

async fn next_event(events: &mut Option<EventStream>) -> Option<SignalingEvent> {
    match events {
        Some(rx) => rx.recv().await,
        None => pending().await,
    }
}

async fn frame_changed(io: &mut RoleIo) -> Option<ControlFrame> {
    match io {
        RoleIo::Operator { frames } => match frames.changed().await {
            Ok(()) => Some(*frames.borrow_and_update()),
            Err(_) => None,
        },
        RoleIo::Machine { .. } => pending().await,
    }
}

/// Presentation-facing control of one session
pub struct SessionHandle {
    role: Role,
    commands: mpsc::Sender<Command>,
    state: watch::Receiver<SessionState>,
    stats: watch::Receiver<SessionStats>,
    task: Option<JoinHandle<()>>,
}

impl SessionHandle {
    pub fn spawn(
        signaling: Arc<dyn SignalingClient>,
        io: RoleIo,
        status: StatusBoard,
        settings: SessionSettings,
    ) -> Self {
        let role = io.role();
        let (command_tx, command_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(SessionState::Idle);
        let (stats_tx, stats_rx) = watch::channel(SessionStats::default());

        let driver = SessionDriver {
            ctx: SessionContext {
                role,
                media_retry_limit: settings.media_retry_limit,
            },
            monitor: LinkMonitor::new(settings.ack_window),
            settings,
            signaling,
            io,
            status,
            state: SessionState::Idle,
            state_tx,
            stats_tx,
            events: None,
            retry_at: None,
            seq: 0,
            epoch: Instant::now(),
            stats: SessionStats::default(),
            frames_open: true,
        };

        info!("Spawning {} session", role);
        let task = tokio::spawn(driver.run(command_rx));

        Self {
            role,
            commands: command_tx,
            state: state_rx,
            stats: stats_rx,
            task: Some(task),
        }
    }

    pub fn role(&self) -> Role {
        self.role
    }

    /// Connects for `machine_id`; ignored while a session is live
    pub async fn start(&self, machine_id: &str) -> Result<(), SessionError> {
        self.commands
            .send(Command::Start {
                machine_id: machine_id.to_string(),
            })
            .await
            .map_err(|_| SessionError::NotRunning)
    }

    /// Tears the session down and waits until every resource is released.
    /// Safe to call repeatedly.
    pub async fn disconnect(&self) -> Result<(), SessionError> {
        let (done_tx, done_rx) = oneshot::channel();
        if self
            .commands
            .send(Command::Disconnect { done: done_tx })
            .await
            .is_err()
        {
            // Driver already gone, nothing left to release
            return Ok(());
        }
        done_rx.await.map_err(|_| SessionError::NotRunning)
    }

    pub fn state(&self) -> SessionState {
        self.state.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state.clone()
    }

    pub fn stats(&self) -> SessionStats {
        self.stats.borrow().clone()
    }

    /// Waits until the session reaches a state matching `accept`
    pub async fn wait_for(
        &self,
        accept: impl Fn(&SessionState) -> bool,
    ) -> Result<SessionState, SessionError> {
        let mut rx = self.state.clone();
        let state = rx
            .wait_for(|state| accept(state))
            .await
            .map_err(|_| SessionError::NotRunning)?;
        Ok(state.clone())
    }

    /// Disconnects and stops the driver task
    pub async fn shutdown(mut self) -> Result<(), SessionError> {
        self.disconnect().await?;
        let task = self.task.take();
        drop(self);
        if let Some(task) = task {
            task.await
                .map_err(|e| SessionError::TaskFailed(e.to_string()))?;
        }
        Ok(())
    }
}
