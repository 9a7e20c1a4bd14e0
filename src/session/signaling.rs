//! Signaling collaborator interface
//!
//! A [`SignalingClient`] is one endpoint on a rendezvous service. It
//! registers a single identity, then opens data channels and media calls to
//! other identities. Everything the remote side or the service does arrives
//! as a [`SignalingEvent`] on the stream returned by `register`.

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Registered name of one endpoint
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(name: impl Into<String>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

macro_rules! uuid_id {
    ($name:ident) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(Uuid);

        impl $name {
            #[allow(clippy::new_without_default)]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                // Short form is enough to tell ids apart in logs
                write!(f, "{}", &self.0.simple().to_string()[..8])
            }
        }
    };
}

uuid_id!(ChannelId);
uuid_id!(CallId);

/// Metadata of a video track; no media payload travels through here
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrackInfo {
    pub label: String,
    pub width: u32,
    pub height: u32,
}

impl TrackInfo {
    /// A track is usable only with non-zero dimensions
    pub fn is_renderable(&self) -> bool {
        self.width > 0 && self.height > 0
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum SignalingEvent {
    Registered,
    ChannelOpen { channel: ChannelId, remote: PeerId },
    Data { channel: ChannelId, payload: Bytes },
    ChannelClosed { channel: ChannelId },
    ChannelError { channel: ChannelId, reason: String },
    IncomingCall { call: CallId, remote: PeerId },
    /// The answering side received the caller's stream; `None` means the
    /// stream carried no video track
    RemoteStream { call: CallId, track: Option<TrackInfo> },
    CallAnswered { call: CallId },
    CallClosed { call: CallId },
    CallError { call: CallId, reason: String },
    /// The signaling service itself failed
    Error { reason: String },
}

pub type EventStream = mpsc::UnboundedReceiver<SignalingEvent>;

#[derive(Debug, Clone, thiserror::Error)]
pub enum SignalingError {
    #[error("Identity {0} is already registered")]
    IdentityTaken(PeerId),

    #[error("Endpoint has no registered identity")]
    NotRegistered,

    #[error("Peer {0} is not available")]
    PeerUnavailable(PeerId),

    #[error("Unknown channel {0}")]
    UnknownChannel(ChannelId),

    #[error("Unknown call {0}")]
    UnknownCall(CallId),

    #[error("Signaling transport failed: {0}")]
    Transport(String),
}

#[async_trait]
pub trait SignalingClient: Send + Sync {
    /// Claims `identity` and returns its event stream. The service confirms
    /// with [`SignalingEvent::Registered`].
    async fn register(&self, identity: &PeerId) -> Result<EventStream, SignalingError>;

    /// Starts opening a data channel; completion arrives as `ChannelOpen`
    /// or `ChannelError` carrying the returned id.
    async fn connect(&self, remote: &PeerId) -> Result<ChannelId, SignalingError>;

    async fn send(&self, channel: ChannelId, payload: Bytes) -> Result<(), SignalingError>;

    async fn close_channel(&self, channel: ChannelId) -> Result<(), SignalingError>;

    /// Offers `track` to `remote` under a caller-chosen call id
    async fn call(
        &self,
        call: CallId,
        remote: &PeerId,
        track: TrackInfo,
    ) -> Result<(), SignalingError>;

    async fn answer(&self, call: CallId) -> Result<(), SignalingError>;

    /// Hangs up; unknown calls are not an error
    async fn close_call(&self, call: CallId) -> Result<(), SignalingError>;

    /// Releases the identity and every channel and call still attached to it
    async fn unregister(&self) -> Result<(), SignalingError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ids_are_unique_and_short_in_logs() {
        let a = ChannelId::new();
        let b = ChannelId::new();
        assert_ne!(a, b);
        assert_eq!(a.to_string().len(), 8);
    }

    #[test]
    fn zero_sized_track_is_not_renderable() {
        let track = TrackInfo {
            label: "cab".into(),
            width: 1280,
            height: 0,
        };
        assert!(!track.is_renderable());
        assert!(TrackInfo { height: 720, ..track }.is_renderable());
    }
}
