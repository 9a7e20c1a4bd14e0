//! In-process signaling rendezvous
//!
//! Every endpoint registered on the same [`LocalHub`] can reach every other
//! one. Used for loopback runs, where operator and machine share a process,
//! and as the signaling collaborator in tests.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use super::signaling::{
    CallId, ChannelId, EventStream, PeerId, SignalingClient, SignalingError, SignalingEvent,
    TrackInfo,
};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub registrations: usize,
    pub unregistrations: usize,
    pub channels_opened: usize,
    pub calls_placed: usize,
    pub calls_closed: usize,
}

struct CallEntry {
    caller: PeerId,
    callee: PeerId,
    track: TrackInfo,
}

#[derive(Default)]
struct HubInner {
    peers: HashMap<PeerId, mpsc::UnboundedSender<SignalingEvent>>,
    channels: HashMap<ChannelId, (PeerId, PeerId)>,
    calls: HashMap<CallId, CallEntry>,
    stats: HubStats,
}

impl HubInner {
    fn deliver(&self, to: &PeerId, event: SignalingEvent) -> bool {
        match self.peers.get(to) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    fn other_end<'a>(pair: &'a (PeerId, PeerId), me: &PeerId) -> &'a PeerId {
        if &pair.0 == me {
            &pair.1
        } else {
            &pair.0
        }
    }
}

#[derive(Clone, Default)]
pub struct LocalHub {
    inner: Arc<Mutex<HubInner>>,
}

impl LocalHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// New unregistered endpoint on this hub
    pub fn endpoint(&self) -> LocalEndpoint {
        LocalEndpoint {
            hub: self.clone(),
            identity: Mutex::new(None),
        }
    }

    pub fn stats(&self) -> HubStats {
        self.inner.lock().stats
    }

    pub fn is_registered(&self, identity: &PeerId) -> bool {
        self.inner.lock().peers.contains_key(identity)
    }

    pub fn open_channels(&self) -> usize {
        self.inner.lock().channels.len()
    }

    pub fn active_calls(&self) -> usize {
        self.inner.lock().calls.len()
    }

    /// Pushes an arbitrary event to a registered identity
    pub fn inject(&self, identity: &PeerId, event: SignalingEvent) -> bool {
        self.inner.lock().deliver(identity, event)
    }
}

/// One identity's connection to a [`LocalHub`]
pub struct LocalEndpoint {
    hub: LocalHub,
    identity: Mutex<Option<PeerId>>,
}

impl LocalEndpoint {
    fn me(&self) -> Result<PeerId, SignalingError> {
        self.identity
            .lock()
            .clone()
            .ok_or(SignalingError::NotRegistered)
    }
}

#[async_trait]
impl SignalingClient for LocalEndpoint {
    async fn register(&self, identity: &PeerId) -> Result<EventStream, SignalingError> {
        let mut inner = self.hub.inner.lock();
        if inner.peers.contains_key(identity) {
            warn!("Identity {} already registered on local hub", identity);
            return Err(SignalingError::IdentityTaken(identity.clone()));
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(SignalingEvent::Registered);
        inner.peers.insert(identity.clone(), tx);
        inner.stats.registrations += 1;
        *self.identity.lock() = Some(identity.clone());
        info!("Registered {} on local hub", identity);
        Ok(rx)
    }

    async fn connect(&self, remote: &PeerId) -> Result<ChannelId, SignalingError> {
        let me = self.me()?;
        let channel = ChannelId::new();
        let mut inner = self.hub.inner.lock();

        if !inner.peers.contains_key(remote) {
            debug!("{} tried to reach unregistered {}", me, remote);
            inner.deliver(
                &me,
                SignalingEvent::ChannelError {
                    channel,
                    reason: format!("peer {} unavailable", remote),
                },
            );
            return Ok(channel);
        }

        inner.channels.insert(channel, (me.clone(), remote.clone()));
        inner.stats.channels_opened += 1;
        inner.deliver(
            remote,
            SignalingEvent::ChannelOpen {
                channel,
                remote: me.clone(),
            },
        );
        inner.deliver(
            &me,
            SignalingEvent::ChannelOpen {
                channel,
                remote: remote.clone(),
            },
        );
        debug!("Opened channel {} between {} and {}", channel, me, remote);
        Ok(channel)
    }

    async fn send(&self, channel: ChannelId, payload: Bytes) -> Result<(), SignalingError> {
        let me = self.me()?;
        let inner = self.hub.inner.lock();
        let pair = inner
            .channels
            .get(&channel)
            .ok_or(SignalingError::UnknownChannel(channel))?;
        let to = HubInner::other_end(pair, &me).clone();
        inner.deliver(&to, SignalingEvent::Data { channel, payload });
        Ok(())
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<(), SignalingError> {
        let me = self.me()?;
        let mut inner = self.hub.inner.lock();
        if let Some(pair) = inner.channels.remove(&channel) {
            let to = HubInner::other_end(&pair, &me).clone();
            inner.deliver(&to, SignalingEvent::ChannelClosed { channel });
            debug!("Closed channel {}", channel);
        }
        Ok(())
    }

    async fn call(
        &self,
        call: CallId,
        remote: &PeerId,
        track: TrackInfo,
    ) -> Result<(), SignalingError> {
        let me = self.me()?;
        let mut inner = self.hub.inner.lock();
        if !inner.peers.contains_key(remote) {
            return Err(SignalingError::PeerUnavailable(remote.clone()));
        }
        inner.calls.insert(
            call,
            CallEntry {
                caller: me.clone(),
                callee: remote.clone(),
                track,
            },
        );
        inner.stats.calls_placed += 1;
        inner.deliver(remote, SignalingEvent::IncomingCall { call, remote: me });
        Ok(())
    }

    async fn answer(&self, call: CallId) -> Result<(), SignalingError> {
        let me = self.me()?;
        let inner = self.hub.inner.lock();
        let entry = inner
            .calls
            .get(&call)
            .filter(|entry| entry.callee == me)
            .ok_or(SignalingError::UnknownCall(call))?;
        inner.deliver(&entry.caller, SignalingEvent::CallAnswered { call });
        inner.deliver(
            &me,
            SignalingEvent::RemoteStream {
                call,
                track: Some(entry.track.clone()),
            },
        );
        Ok(())
    }

    async fn close_call(&self, call: CallId) -> Result<(), SignalingError> {
        let me = self.me()?;
        let mut inner = self.hub.inner.lock();
        if let Some(entry) = inner.calls.remove(&call) {
            inner.stats.calls_closed += 1;
            let to = if entry.caller == me {
                entry.callee
            } else {
                entry.caller
            };
            inner.deliver(&to, SignalingEvent::CallClosed { call });
        }
        Ok(())
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        let Some(me) = self.identity.lock().take() else {
            return Ok(());
        };
        let mut inner = self.hub.inner.lock();

        let calls: Vec<CallId> = inner
            .calls
            .iter()
            .filter(|(_, e)| e.caller == me || e.callee == me)
            .map(|(id, _)| *id)
            .collect();
        for call in calls {
            if let Some(entry) = inner.calls.remove(&call) {
                inner.stats.calls_closed += 1;
                let to = if entry.caller == me {
                    entry.callee
                } else {
                    entry.caller
                };
                inner.deliver(&to, SignalingEvent::CallClosed { call });
            }
        }

        let channels: Vec<ChannelId> = inner
            .channels
            .iter()
            .filter(|(_, (a, b))| *a == me || *b == me)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            if let Some(pair) = inner.channels.remove(&channel) {
                let to = HubInner::other_end(&pair, &me).clone();
                inner.deliver(&to, SignalingEvent::ChannelClosed { channel });
            }
        }

        inner.peers.remove(&me);
        inner.stats.unregistrations += 1;
        info!("Released {} from local hub", me);
        Ok(())
    }
}
