//! Peer session state machine
//!
//! Pure function from (state, event) to (next state, effects). The driver
//! executes effects against the signaling client and feeds results back as
//! events, so every lifecycle rule lives here and is testable without I/O.
//!
//! ```text
//! Idle ──► Connecting ──► AwaitingPeer ──► DataOpen ⇄ MediaNegotiating ──► MediaOpen
//!   ▲                         ▲               │
//!   │      (machine: data     └───────────────┘
//!   │       channel closed)
//! Closed ◄── disconnect from anywhere        Error ◄── failure from any live state
//! ```

use bytes::Bytes;
use serde::Serialize;
use std::fmt;

use super::signaling::{CallId, ChannelId, PeerId, SignalingEvent, TrackInfo};
use crate::status::LinkState;

/// Which end of the link this session is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    Operator,
    Machine,
}

impl Role {
    fn prefix(self) -> &'static str {
        match self {
            Role::Operator => "control",
            Role::Machine => "excav",
        }
    }

    pub fn counterpart(self) -> Role {
        match self {
            Role::Operator => Role::Machine,
            Role::Machine => Role::Operator,
        }
    }

    /// Deterministic signaling name of this role for a machine
    pub fn identity(self, machine_id: &str) -> PeerId {
        PeerId::new(format!("{}{}", self.prefix(), machine_id))
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Operator => f.write_str("operator"),
            Role::Machine => f.write_str("machine"),
        }
    }
}

/// The open data channel and both ends of it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataLink {
    pub local: PeerId,
    pub remote: PeerId,
    pub channel: ChannelId,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureCause {
    InvalidMachineId,
    Signaling(String),
    Channel(String),
    ChannelClosed,
}

impl fmt::Display for FailureCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailureCause::InvalidMachineId => f.write_str("machine id must not be empty"),
            FailureCause::Signaling(reason) => write!(f, "signaling failed: {}", reason),
            FailureCause::Channel(reason) => write!(f, "data channel failed: {}", reason),
            FailureCause::ChannelClosed => f.write_str("data channel closed by peer"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SessionState {
    #[default]
    Idle,
    Connecting {
        local: PeerId,
        remote: PeerId,
    },
    AwaitingPeer {
        local: PeerId,
        remote: PeerId,
    },
    DataOpen {
        link: DataLink,
        /// Failed media source probes so far on this link
        media_attempts: u32,
    },
    MediaNegotiating {
        link: DataLink,
        call: CallId,
    },
    MediaOpen {
        link: DataLink,
        call: CallId,
        track: Option<TrackInfo>,
    },
    Closed,
    Error {
        cause: FailureCause,
    },
}

impl SessionState {
    pub fn name(&self) -> &'static str {
        match self {
            SessionState::Idle => "Idle",
            SessionState::Connecting { .. } => "Connecting",
            SessionState::AwaitingPeer { .. } => "AwaitingPeer",
            SessionState::DataOpen { .. } => "DataOpen",
            SessionState::MediaNegotiating { .. } => "MediaNegotiating",
            SessionState::MediaOpen { .. } => "MediaOpen",
            SessionState::Closed => "Closed",
            SessionState::Error { .. } => "Error",
        }
    }

    pub fn link(&self) -> Option<&DataLink> {
        match self {
            SessionState::DataOpen { link, .. }
            | SessionState::MediaNegotiating { link, .. }
            | SessionState::MediaOpen { link, .. } => Some(link),
            _ => None,
        }
    }

    pub fn call(&self) -> Option<CallId> {
        match self {
            SessionState::MediaNegotiating { call, .. } | SessionState::MediaOpen { call, .. } => {
                Some(*call)
            }
            _ => None,
        }
    }

    /// Identity currently held on the signaling service
    pub fn local_identity(&self) -> Option<&PeerId> {
        match self {
            SessionState::Connecting { local, .. } | SessionState::AwaitingPeer { local, .. } => {
                Some(local)
            }
            _ => self.link().map(|link| &link.local),
        }
    }

    pub fn is_live(&self) -> bool {
        self.local_identity().is_some()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    Start { machine_id: String },
    Disconnect,
    Signaling(SignalingEvent),
    MediaSourceReady { track: TrackInfo, call: CallId },
    MediaSourceUnavailable,
    MediaRetryDue,
    /// A signaling request issued by the driver failed
    RequestFailed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    Register(PeerId),
    ConnectData(PeerId),
    SendHello(ChannelId),
    Deliver(Bytes),
    CloseData(ChannelId),
    PlaceCall {
        call: CallId,
        remote: PeerId,
        track: TrackInfo,
    },
    AnswerCall(CallId),
    RejectCall(CallId),
    CloseCall(CallId),
    ProbeMediaSource,
    ScheduleMediaRetry,
    CancelMediaRetry,
    Unregister,
    SetDataStatus(LinkState),
    SetMediaStatus(LinkState),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Transition {
    pub next: SessionState,
    pub effects: Vec<Effect>,
}

impl Transition {
    fn to(next: SessionState, effects: Vec<Effect>) -> Self {
        Self { next, effects }
    }

    fn stay(state: &SessionState) -> Self {
        Self {
            next: state.clone(),
            effects: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct SessionContext {
    pub role: Role,
    /// Failed source probes before media gives up
    pub media_retry_limit: u32,
}

/// Computes the next state and the side effects to run, in order
pub fn transition(state: &SessionState, event: SessionEvent, ctx: &SessionContext) -> Transition {
    use SessionEvent as E;
    use SessionState as S;

    match (state, event) {
        (S::Idle | S::Closed | S::Error { .. }, E::Start { machine_id }) => start(&machine_id, ctx),
        (_, E::Start { .. }) => Transition::stay(state),

        (_, E::Disconnect) => Transition::to(S::Closed, teardown(state)),

        (_, E::RequestFailed(reason) | E::Signaling(SignalingEvent::Error { reason }))
            if state.is_live() =>
        {
            fail(state, FailureCause::Signaling(reason))
        }

        (S::Connecting { local, remote }, E::Signaling(SignalingEvent::Registered)) => {
            let effects = match ctx.role {
                Role::Operator => vec![Effect::ConnectData(remote.clone())],
                Role::Machine => Vec::new(),
            };
            Transition::to(
                S::AwaitingPeer {
                    local: local.clone(),
                    remote: remote.clone(),
                },
                effects,
            )
        }

        (S::AwaitingPeer { local, remote }, E::Signaling(event)) => {
            awaiting_peer(state, local, remote, event, ctx)
        }

        (
            S::DataOpen { .. } | S::MediaNegotiating { .. } | S::MediaOpen { .. },
            E::Signaling(event),
        ) => linked(state, event, ctx),

        (S::DataOpen { link, .. }, E::MediaSourceReady { track, call })
            if ctx.role == Role::Machine =>
        {
            Transition::to(
                S::MediaNegotiating {
                    link: link.clone(),
                    call,
                },
                vec![
                    Effect::PlaceCall {
                        call,
                        remote: link.remote.clone(),
                        track,
                    },
                    Effect::SetMediaStatus(LinkState::Connecting),
                ],
            )
        }

        (
            S::DataOpen {
                link,
                media_attempts,
            },
            E::MediaSourceUnavailable,
        ) if ctx.role == Role::Machine => {
            let attempts = media_attempts + 1;
            let effect = if attempts >= ctx.media_retry_limit {
                Effect::SetMediaStatus(LinkState::Error)
            } else {
                Effect::ScheduleMediaRetry
            };
            Transition::to(
                S::DataOpen {
                    link: link.clone(),
                    media_attempts: attempts,
                },
                vec![effect],
            )
        }

        (S::DataOpen { .. }, E::MediaRetryDue) if ctx.role == Role::Machine => {
            Transition::to(state.clone(), vec![Effect::ProbeMediaSource])
        }

        _ => Transition::stay(state),
    }
}

fn start(machine_id: &str, ctx: &SessionContext) -> Transition {
    let machine_id = machine_id.trim();
    if machine_id.is_empty() {
        return Transition::to(
            SessionState::Error {
                cause: FailureCause::InvalidMachineId,
            },
            vec![Effect::SetDataStatus(LinkState::Error)],
        );
    }

    let local = ctx.role.identity(machine_id);
    let remote = ctx.role.counterpart().identity(machine_id);
    Transition::to(
        SessionState::Connecting {
            local: local.clone(),
            remote,
        },
        vec![
            Effect::Register(local),
            Effect::SetDataStatus(LinkState::Connecting),
            Effect::SetMediaStatus(LinkState::Disconnected),
        ],
    )
}

// Media first, then data, then the identity
fn release(state: &SessionState) -> Vec<Effect> {
    let mut effects = Vec::new();
    if let Some(call) = state.call() {
        effects.push(Effect::CloseCall(call));
    }
    if let Some(link) = state.link() {
        effects.push(Effect::CloseData(link.channel));
    }
    if state.is_live() {
        effects.push(Effect::CancelMediaRetry);
        effects.push(Effect::Unregister);
    }
    effects
}

fn teardown(state: &SessionState) -> Vec<Effect> {
    if !state.is_live() {
        return Vec::new();
    }
    let mut effects = release(state);
    effects.push(Effect::SetMediaStatus(LinkState::Disconnected));
    effects.push(Effect::SetDataStatus(LinkState::Disconnected));
    effects
}

fn fail(state: &SessionState, cause: FailureCause) -> Transition {
    let mut effects = release(state);
    let media = if state.call().is_some() {
        LinkState::Error
    } else {
        LinkState::Disconnected
    };
    effects.push(Effect::SetMediaStatus(media));
    effects.push(Effect::SetDataStatus(LinkState::Error));
    Transition::to(SessionState::Error { cause }, effects)
}

fn awaiting_peer(
    state: &SessionState,
    local: &PeerId,
    remote: &PeerId,
    event: SignalingEvent,
    ctx: &SessionContext,
) -> Transition {
    match (ctx.role, event) {
        (Role::Operator, SignalingEvent::ChannelOpen { channel, remote: peer }) => {
            if &peer != remote {
                return Transition::to(state.clone(), vec![Effect::CloseData(channel)]);
            }
            Transition::to(
                SessionState::DataOpen {
                    link: DataLink {
                        local: local.clone(),
                        remote: peer,
                        channel,
                    },
                    media_attempts: 0,
                },
                vec![
                    Effect::SetDataStatus(LinkState::Connected),
                    Effect::SendHello(channel),
                ],
            )
        }
        (Role::Machine, SignalingEvent::ChannelOpen { channel, remote: peer }) => Transition::to(
            SessionState::DataOpen {
                link: DataLink {
                    local: local.clone(),
                    remote: peer,
                    channel,
                },
                media_attempts: 0,
            },
            vec![
                Effect::SetDataStatus(LinkState::Connected),
                Effect::ProbeMediaSource,
            ],
        ),
        (Role::Operator, SignalingEvent::ChannelError { reason, .. }) => {
            fail(state, FailureCause::Channel(reason))
        }
        (Role::Operator, SignalingEvent::ChannelClosed { .. }) => {
            fail(state, FailureCause::ChannelClosed)
        }
        // Media without a data channel has no counterpart to belong to
        (_, SignalingEvent::IncomingCall { call, .. }) => {
            Transition::to(state.clone(), vec![Effect::RejectCall(call)])
        }
        _ => Transition::stay(state),
    }
}

fn linked(state: &SessionState, event: SignalingEvent, ctx: &SessionContext) -> Transition {
    let Some(link) = state.link() else {
        return Transition::stay(state);
    };
    let active_call = state.call();

    match event {
        SignalingEvent::Data { channel, payload } if channel == link.channel => {
            Transition::to(state.clone(), vec![Effect::Deliver(payload)])
        }

        // A second concurrent data channel is never kept
        SignalingEvent::ChannelOpen { channel, .. } if channel != link.channel => {
            Transition::to(state.clone(), vec![Effect::CloseData(channel)])
        }

        SignalingEvent::ChannelClosed { channel } if channel == link.channel => {
            data_lost(state, link, FailureCause::ChannelClosed, ctx)
        }
        SignalingEvent::ChannelError { channel, reason } if channel == link.channel => {
            data_lost(state, link, FailureCause::Channel(reason), ctx)
        }

        SignalingEvent::IncomingCall { call, remote } => {
            let acceptable = ctx.role == Role::Operator
                && remote == link.remote
                && active_call.is_none();
            if !acceptable {
                return Transition::to(state.clone(), vec![Effect::RejectCall(call)]);
            }
            Transition::to(
                SessionState::MediaNegotiating {
                    link: link.clone(),
                    call,
                },
                vec![
                    Effect::AnswerCall(call),
                    Effect::SetMediaStatus(LinkState::Connecting),
                ],
            )
        }

        SignalingEvent::RemoteStream { call, track } => match state {
            SessionState::MediaNegotiating { call: current, .. } if *current == call => {
                match track {
                    Some(track) if track.is_renderable() => Transition::to(
                        SessionState::MediaOpen {
                            link: link.clone(),
                            call,
                            track: Some(track),
                        },
                        vec![Effect::SetMediaStatus(LinkState::Connected)],
                    ),
                    _ => media_failed(link, call),
                }
            }
            _ => Transition::stay(state),
        },

        SignalingEvent::CallAnswered { call } => match state {
            SessionState::MediaNegotiating { call: current, .. }
                if *current == call && ctx.role == Role::Machine =>
            {
                Transition::to(
                    SessionState::MediaOpen {
                        link: link.clone(),
                        call,
                        track: None,
                    },
                    vec![Effect::SetMediaStatus(LinkState::Connected)],
                )
            }
            _ => Transition::stay(state),
        },

        SignalingEvent::CallClosed { call } if Some(call) == active_call => Transition::to(
            SessionState::DataOpen {
                link: link.clone(),
                media_attempts: 0,
            },
            vec![Effect::SetMediaStatus(LinkState::Disconnected)],
        ),

        SignalingEvent::CallError { call, .. } if Some(call) == active_call => {
            media_failed(link, call)
        }

        _ => Transition::stay(state),
    }
}

// Media failure alone keeps the data channel
fn media_failed(link: &DataLink, call: CallId) -> Transition {
    Transition::to(
        SessionState::DataOpen {
            link: link.clone(),
            media_attempts: 0,
        },
        vec![
            Effect::CloseCall(call),
            Effect::SetMediaStatus(LinkState::Error),
        ],
    )
}

// Data channel loss takes media down with it. The machine goes back to
// waiting for an operator; the operator needs an explicit reconnect.
fn data_lost(
    state: &SessionState,
    link: &DataLink,
    cause: FailureCause,
    ctx: &SessionContext,
) -> Transition {
    match ctx.role {
        Role::Machine => {
            let mut effects = Vec::new();
            if let Some(call) = state.call() {
                effects.push(Effect::CloseCall(call));
            }
            effects.push(Effect::CancelMediaRetry);
            effects.push(Effect::SetMediaStatus(LinkState::Disconnected));
            effects.push(Effect::SetDataStatus(LinkState::Disconnected));
            Transition::to(
                SessionState::AwaitingPeer {
                    local: link.local.clone(),
                    remote: link.remote.clone(),
                },
                effects,
            )
        }
        Role::Operator => {
            // The channel is already gone on the remote side
            let mut effects: Vec<Effect> = release(state)
                .into_iter()
                .filter(|e| !matches!(e, Effect::CloseData(_)))
                .collect();
            let media = if state.call().is_some() {
                LinkState::Error
            } else {
                LinkState::Disconnected
            };
            effects.push(Effect::SetMediaStatus(media));
            effects.push(Effect::SetDataStatus(match cause {
                FailureCause::ChannelClosed => LinkState::Disconnected,
                _ => LinkState::Error,
            }));
            Transition::to(SessionState::Error { cause }, effects)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const OPERATOR: SessionContext = SessionContext {
        role: Role::Operator,
        media_retry_limit: 3,
    };
    const MACHINE: SessionContext = SessionContext {
        role: Role::Machine,
        media_retry_limit: 3,
    };

    fn sig(event: SignalingEvent) -> SessionEvent {
        SessionEvent::Signaling(event)
    }

    fn track(width: u32, height: u32) -> TrackInfo {
        TrackInfo {
            label: "cab".into(),
            width,
            height,
        }
    }

    /// Drives a session into DataOpen and returns the state and channel
    fn open(ctx: &SessionContext) -> (SessionState, ChannelId) {
        let t = transition(
            &SessionState::Idle,
            SessionEvent::Start {
                machine_id: "7".into(),
            },
            ctx,
        );
        let t = transition(&t.next, sig(SignalingEvent::Registered), ctx);
        let channel = ChannelId::new();
        let t = transition(
            &t.next,
            sig(SignalingEvent::ChannelOpen {
                channel,
                remote: ctx.role.counterpart().identity("7"),
            }),
            ctx,
        );
        assert_eq!(t.next.name(), "DataOpen");
        (t.next, channel)
    }

    #[test]
    fn identities_follow_role_and_machine() {
        assert_eq!(Role::Operator.identity("12").as_str(), "control12");
        assert_eq!(Role::Machine.identity("12").as_str(), "excav12");
    }

    #[test]
    fn start_registers_identity() {
        let t = transition(
            &SessionState::Idle,
            SessionEvent::Start {
                machine_id: "7".into(),
            },
            &OPERATOR,
        );
        assert_eq!(t.next.name(), "Connecting");
        assert_eq!(t.effects[0], Effect::Register(PeerId::new("control7")));
    }

    #[test]
    fn empty_machine_id_is_an_error_without_registration() {
        let t = transition(
            &SessionState::Idle,
            SessionEvent::Start {
                machine_id: "  ".into(),
            },
            &OPERATOR,
        );
        assert_eq!(
            t.next,
            SessionState::Error {
                cause: FailureCause::InvalidMachineId
            }
        );
        assert!(!t.effects.iter().any(|e| matches!(e, Effect::Register(_))));
    }

    #[test]
    fn operator_initiates_data_channel_machine_waits() {
        let connecting = transition(
            &SessionState::Idle,
            SessionEvent::Start {
                machine_id: "7".into(),
            },
            &OPERATOR,
        )
        .next;
        let t = transition(&connecting, sig(SignalingEvent::Registered), &OPERATOR);
        assert_eq!(t.effects, vec![Effect::ConnectData(PeerId::new("excav7"))]);

        let connecting = transition(
            &SessionState::Idle,
            SessionEvent::Start {
                machine_id: "7".into(),
            },
            &MACHINE,
        )
        .next;
        let t = transition(&connecting, sig(SignalingEvent::Registered), &MACHINE);
        assert_eq!(t.next.name(), "AwaitingPeer");
        assert!(t.effects.is_empty());
    }

    #[test]
    fn operator_says_hello_machine_probes_camera() {
        let t = transition(
            &SessionState::AwaitingPeer {
                local: PeerId::new("control7"),
                remote: PeerId::new("excav7"),
            },
            sig(SignalingEvent::ChannelOpen {
                channel: ChannelId::new(),
                remote: PeerId::new("excav7"),
            }),
            &OPERATOR,
        );
        assert!(matches!(t.effects[1], Effect::SendHello(_)));

        let t = transition(
            &SessionState::AwaitingPeer {
                local: PeerId::new("excav7"),
                remote: PeerId::new("control7"),
            },
            sig(SignalingEvent::ChannelOpen {
                channel: ChannelId::new(),
                remote: PeerId::new("control7"),
            }),
            &MACHINE,
        );
        assert_eq!(t.effects[1], Effect::ProbeMediaSource);
    }

    #[test]
    fn data_payloads_only_from_active_channel() {
        let (state, channel) = open(&MACHINE);
        let payload = Bytes::from_static(b"{}");

        let t = transition(
            &state,
            sig(SignalingEvent::Data {
                channel,
                payload: payload.clone(),
            }),
            &MACHINE,
        );
        assert_eq!(t.effects, vec![Effect::Deliver(payload.clone())]);

        let t = transition(
            &state,
            sig(SignalingEvent::Data {
                channel: ChannelId::new(),
                payload,
            }),
            &MACHINE,
        );
        assert!(t.effects.is_empty());
    }

    #[test]
    fn second_data_channel_is_closed() {
        let (state, _) = open(&MACHINE);
        let intruder = ChannelId::new();
        let t = transition(
            &state,
            sig(SignalingEvent::ChannelOpen {
                channel: intruder,
                remote: PeerId::new("control7"),
            }),
            &MACHINE,
        );
        assert_eq!(t.next, state);
        assert_eq!(t.effects, vec![Effect::CloseData(intruder)]);
    }

    #[test]
    fn media_source_retries_then_gives_up() {
        let (mut state, _) = open(&MACHINE);
        for _ in 0..2 {
            let t = transition(&state, SessionEvent::MediaSourceUnavailable, &MACHINE);
            assert_eq!(t.effects, vec![Effect::ScheduleMediaRetry]);
            let due = transition(&t.next, SessionEvent::MediaRetryDue, &MACHINE);
            assert_eq!(due.effects, vec![Effect::ProbeMediaSource]);
            state = due.next;
        }
        let t = transition(&state, SessionEvent::MediaSourceUnavailable, &MACHINE);
        assert_eq!(t.effects, vec![Effect::SetMediaStatus(LinkState::Error)]);
        assert_eq!(t.next.name(), "DataOpen");
    }

    #[test]
    fn machine_places_single_call_when_source_ready() {
        let (state, _) = open(&MACHINE);
        let call = CallId::new();
        let t = transition(
            &state,
            SessionEvent::MediaSourceReady {
                track: track(640, 480),
                call,
            },
            &MACHINE,
        );
        assert_eq!(t.next.call(), Some(call));
        assert!(matches!(
            &t.effects[0],
            Effect::PlaceCall { remote, .. } if remote.as_str() == "control7"
        ));

        // Ready again while negotiating does not start another call
        let again = transition(
            &t.next,
            SessionEvent::MediaSourceReady {
                track: track(640, 480),
                call: CallId::new(),
            },
            &MACHINE,
        );
        assert!(again.effects.is_empty());

        let answered = transition(&t.next, sig(SignalingEvent::CallAnswered { call }), &MACHINE);
        assert_eq!(answered.next.name(), "MediaOpen");
    }

    #[test]
    fn operator_validates_remote_track() {
        let (state, _) = open(&OPERATOR);
        let call = CallId::new();
        let t = transition(
            &state,
            sig(SignalingEvent::IncomingCall {
                call,
                remote: PeerId::new("excav7"),
            }),
            &OPERATOR,
        );
        assert_eq!(t.effects[0], Effect::AnswerCall(call));
        let negotiating = t.next;

        let bad = transition(
            &negotiating,
            sig(SignalingEvent::RemoteStream {
                call,
                track: Some(track(0, 480)),
            }),
            &OPERATOR,
        );
        assert_eq!(bad.next.name(), "DataOpen");
        assert_eq!(
            bad.effects,
            vec![
                Effect::CloseCall(call),
                Effect::SetMediaStatus(LinkState::Error)
            ]
        );

        let missing = transition(
            &negotiating,
            sig(SignalingEvent::RemoteStream { call, track: None }),
            &OPERATOR,
        );
        assert_eq!(missing.next.name(), "DataOpen");

        let good = transition(
            &negotiating,
            sig(SignalingEvent::RemoteStream {
                call,
                track: Some(track(1280, 720)),
            }),
            &OPERATOR,
        );
        assert_eq!(good.next.name(), "MediaOpen");
    }

    #[test]
    fn duplicate_call_is_closed_and_existing_kept() {
        let (state, _) = open(&OPERATOR);
        let first = CallId::new();
        let negotiating = transition(
            &state,
            sig(SignalingEvent::IncomingCall {
                call: first,
                remote: PeerId::new("excav7"),
            }),
            &OPERATOR,
        )
        .next;
        let media_open = transition(
            &negotiating,
            sig(SignalingEvent::RemoteStream {
                call: first,
                track: Some(track(1280, 720)),
            }),
            &OPERATOR,
        )
        .next;

        let second = CallId::new();
        let t = transition(
            &media_open,
            sig(SignalingEvent::IncomingCall {
                call: second,
                remote: PeerId::new("excav7"),
            }),
            &OPERATOR,
        );
        assert_eq!(t.next, media_open);
        assert_eq!(t.effects, vec![Effect::RejectCall(second)]);
    }

    #[test]
    fn machine_data_loss_returns_to_waiting() {
        let (state, channel) = open(&MACHINE);
        let call = CallId::new();
        let negotiating = transition(
            &state,
            SessionEvent::MediaSourceReady {
                track: track(640, 480),
                call,
            },
            &MACHINE,
        )
        .next;

        let t = transition(
            &negotiating,
            sig(SignalingEvent::ChannelClosed { channel }),
            &MACHINE,
        );
        assert_eq!(
            t.next,
            SessionState::AwaitingPeer {
                local: PeerId::new("excav7"),
                remote: PeerId::new("control7"),
            }
        );
        assert_eq!(t.effects[0], Effect::CloseCall(call));
        assert!(!t.effects.contains(&Effect::Unregister));
    }

    #[test]
    fn operator_data_loss_is_an_error() {
        let (state, channel) = open(&OPERATOR);
        let t = transition(
            &state,
            sig(SignalingEvent::ChannelError {
                channel,
                reason: "ice failed".into(),
            }),
            &OPERATOR,
        );
        assert_eq!(t.next.name(), "Error");
        assert!(t.effects.contains(&Effect::Unregister));
        assert!(t.effects.contains(&Effect::SetDataStatus(LinkState::Error)));
    }

    #[test]
    fn teardown_orders_media_data_identity() {
        let (state, channel) = open(&OPERATOR);
        let call = CallId::new();
        let negotiating = transition(
            &state,
            sig(SignalingEvent::IncomingCall {
                call,
                remote: PeerId::new("excav7"),
            }),
            &OPERATOR,
        )
        .next;

        let t = transition(&negotiating, SessionEvent::Disconnect, &OPERATOR);
        assert_eq!(t.next, SessionState::Closed);
        assert_eq!(
            &t.effects[..4],
            &[
                Effect::CloseCall(call),
                Effect::CloseData(channel),
                Effect::CancelMediaRetry,
                Effect::Unregister,
            ]
        );
    }

    #[test]
    fn teardown_is_idempotent_and_releases_once() {
        let states = [
            SessionState::Idle,
            SessionState::Connecting {
                local: PeerId::new("excav7"),
                remote: PeerId::new("control7"),
            },
            open(&MACHINE).0,
        ];
        for state in states {
            let first = transition(&state, SessionEvent::Disconnect, &MACHINE);
            let second = transition(&first.next, SessionEvent::Disconnect, &MACHINE);
            let unregisters = first
                .effects
                .iter()
                .chain(second.effects.iter())
                .filter(|e| **e == Effect::Unregister)
                .count();
            assert_eq!(unregisters, usize::from(state.is_live()), "from {}", state.name());
            assert!(second.effects.is_empty());
            assert_eq!(second.next, SessionState::Closed);
        }
    }

    #[test]
    fn signaling_error_fails_live_session_only() {
        let (state, _) = open(&MACHINE);
        let t = transition(
            &state,
            sig(SignalingEvent::Error {
                reason: "relay lost".into(),
            }),
            &MACHINE,
        );
        assert_eq!(t.next.name(), "Error");
        assert!(t.effects.contains(&Effect::Unregister));

        let closed = transition(
            &SessionState::Closed,
            sig(SignalingEvent::Error {
                reason: "late".into(),
            }),
            &MACHINE,
        );
        assert_eq!(closed.next, SessionState::Closed);
        assert!(closed.effects.is_empty());
    }

    #[test]
    fn reconnect_from_error_starts_fresh() {
        let error = SessionState::Error {
            cause: FailureCause::ChannelClosed,
        };
        let t = transition(
            &error,
            SessionEvent::Start {
                machine_id: "7".into(),
            },
            &OPERATOR,
        );
        assert_eq!(t.next.name(), "Connecting");

        // Start while live is ignored
        let again = transition(
            &t.next,
            SessionEvent::Start {
                machine_id: "8".into(),
            },
            &OPERATOR,
        );
        assert_eq!(again.next, t.next);
        assert!(again.effects.is_empty());
    }
}
