//! Signaling and data-channel relay over an MQTT broker
//!
//! Each identity owns the inbox topic `<prefix>/<identity>`. Channel and call
//! handshakes are small JSON envelopes published into the remote's inbox;
//! data-channel payloads travel the same way at QoS 0. The remote side
//! accepts every channel request it receives.

use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, EventLoop, Packet, QoS};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::signaling::{
    CallId, ChannelId, EventStream, PeerId, SignalingClient, SignalingError, SignalingEvent,
    TrackInfo,
};
use crate::mqtt::config::{mqtt_options, Endpoint};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SignalingConfig {
    pub url: String,
    pub topic_prefix: String,
    pub channel_open_timeout_ms: u64,
    pub keep_alive_secs: u64,
}

impl Default for SignalingConfig {
    fn default() -> Self {
        Self {
            url: "mqtt://localhost:1883".to_string(),
            topic_prefix: "excavlink/signaling".to_string(),
            channel_open_timeout_ms: 5000,
            keep_alive_secs: 5,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
struct Envelope {
    from: PeerId,
    #[serde(flatten)]
    kind: RelayKind,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum RelayKind {
    Open { channel: ChannelId },
    Accept { channel: ChannelId },
    Data { channel: ChannelId, payload: String },
    Close { channel: ChannelId },
    Call { call: CallId, track: TrackInfo },
    Answer { call: CallId },
    Hangup { call: CallId },
    Bye,
}

#[derive(Default)]
struct RelayState {
    channels: HashMap<ChannelId, PeerId>,
    pending: HashSet<ChannelId>,
    calls: HashMap<CallId, (PeerId, Option<TrackInfo>)>,
}

struct Connection {
    client: AsyncClient,
    identity: PeerId,
    events: mpsc::UnboundedSender<SignalingEvent>,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// [`SignalingClient`] relaying through an MQTT broker
pub struct MqttRelay {
    config: SignalingConfig,
    host: String,
    port: u16,
    state: Arc<Mutex<RelayState>>,
    connection: Mutex<Option<Arc<Connection>>>,
}

impl MqttRelay {
    pub fn new(config: SignalingConfig) -> Result<Self, SignalingError> {
        let (host, port) = match Endpoint::parse(&config.url) {
            Ok(Endpoint::Mqtt { host, port }) => (host, port),
            Ok(Endpoint::Memory) => {
                return Err(SignalingError::Transport(
                    "signaling relay needs an mqtt:// url".to_string(),
                ))
            }
            Err(e) => return Err(SignalingError::Transport(e.to_string())),
        };
        Ok(Self {
            config,
            host,
            port,
            state: Arc::new(Mutex::new(RelayState::default())),
            connection: Mutex::new(None),
        })
    }

    fn inbox(&self, identity: &PeerId) -> String {
        format!("{}/{}", self.config.topic_prefix, identity)
    }

    fn connection(&self) -> Result<Arc<Connection>, SignalingError> {
        self.connection
            .lock()
            .clone()
            .ok_or(SignalingError::NotRegistered)
    }

    async fn post(
        &self,
        to: &PeerId,
        kind: RelayKind,
        qos: QoS,
    ) -> Result<(), SignalingError> {
        let connection = self.connection()?;
        let envelope = Envelope {
            from: connection.identity.clone(),
            kind,
        };
        let payload = serde_json::to_vec(&envelope)
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        connection
            .client
            .publish(self.inbox(to), qos, false, payload)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))
    }
}

#[async_trait]
impl SignalingClient for MqttRelay {
    async fn register(&self, identity: &PeerId) -> Result<EventStream, SignalingError> {
        if self.connection.lock().is_some() {
            return Err(SignalingError::IdentityTaken(identity.clone()));
        }

        info!(
            "Registering {} on relay {}:{}",
            identity, self.host, self.port
        );
        let options = mqtt_options(
            &self.host,
            self.port,
            identity.as_str(),
            Duration::from_secs(self.config.keep_alive_secs.max(1)),
        );
        let (client, event_loop) = AsyncClient::new(options, 100);
        let inbox = self.inbox(identity);
        client
            .subscribe(inbox.clone(), QoS::AtLeastOnce)
            .await
            .map_err(|e| SignalingError::Transport(e.to_string()))?;

        let (tx, rx) = mpsc::unbounded_channel();
        let cancel = CancellationToken::new();
        *self.state.lock() = RelayState::default();

        let task = tokio::spawn(relay_loop(
            event_loop,
            RelayLoop {
                client: client.clone(),
                prefix: self.config.topic_prefix.clone(),
                identity: identity.clone(),
                inbox,
                events: tx.clone(),
                state: self.state.clone(),
                cancel: cancel.clone(),
            },
        ));

        *self.connection.lock() = Some(Arc::new(Connection {
            client,
            identity: identity.clone(),
            events: tx,
            cancel,
            task,
        }));
        Ok(rx)
    }

    async fn connect(&self, remote: &PeerId) -> Result<ChannelId, SignalingError> {
        let connection = self.connection()?;
        let channel = ChannelId::new();
        self.state.lock().pending.insert(channel);
        self.post(remote, RelayKind::Open { channel }, QoS::AtLeastOnce)
            .await?;

        let state = self.state.clone();
        let events = connection.events.clone();
        let timeout = Duration::from_millis(self.config.channel_open_timeout_ms);
        let remote = remote.clone();
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            if state.lock().pending.remove(&channel) {
                warn!("Channel {} to {} timed out", channel, remote);
                let _ = events.send(SignalingEvent::ChannelError {
                    channel,
                    reason: format!("{} did not answer within {:?}", remote, timeout),
                });
            }
        });
        Ok(channel)
    }

    async fn send(&self, channel: ChannelId, payload: Bytes) -> Result<(), SignalingError> {
        let remote = self
            .state
            .lock()
            .channels
            .get(&channel)
            .cloned()
            .ok_or(SignalingError::UnknownChannel(channel))?;
        let payload = String::from_utf8(payload.to_vec())
            .map_err(|e| SignalingError::Transport(e.to_string()))?;
        self.post(&remote, RelayKind::Data { channel, payload }, QoS::AtMostOnce)
            .await
    }

    async fn close_channel(&self, channel: ChannelId) -> Result<(), SignalingError> {
        let remote = self.state.lock().channels.remove(&channel);
        match remote {
            Some(remote) => {
                self.post(&remote, RelayKind::Close { channel }, QoS::AtLeastOnce)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn call(
        &self,
        call: CallId,
        remote: &PeerId,
        track: TrackInfo,
    ) -> Result<(), SignalingError> {
        self.state
            .lock()
            .calls
            .insert(call, (remote.clone(), None));
        self.post(remote, RelayKind::Call { call, track }, QoS::AtLeastOnce)
            .await
    }

    async fn answer(&self, call: CallId) -> Result<(), SignalingError> {
        let connection = self.connection()?;
        let (caller, track) = self
            .state
            .lock()
            .calls
            .get(&call)
            .cloned()
            .ok_or(SignalingError::UnknownCall(call))?;
        self.post(&caller, RelayKind::Answer { call }, QoS::AtLeastOnce)
            .await?;
        let _ = connection
            .events
            .send(SignalingEvent::RemoteStream { call, track });
        Ok(())
    }

    async fn close_call(&self, call: CallId) -> Result<(), SignalingError> {
        let entry = self.state.lock().calls.remove(&call);
        match entry {
            Some((remote, _)) => {
                self.post(&remote, RelayKind::Hangup { call }, QoS::AtLeastOnce)
                    .await
            }
            None => Ok(()),
        }
    }

    async fn unregister(&self) -> Result<(), SignalingError> {
        let Some(connection) = self.connection.lock().take() else {
            return Ok(());
        };

        let remotes: HashSet<PeerId> = {
            let state = self.state.lock();
            state
                .channels
                .values()
                .chain(state.calls.values().map(|(peer, _)| peer))
                .cloned()
                .collect()
        };
        let envelope = |kind| Envelope {
            from: connection.identity.clone(),
            kind,
        };
        for remote in remotes {
            if let Ok(payload) = serde_json::to_vec(&envelope(RelayKind::Bye)) {
                if let Err(e) = connection
                    .client
                    .publish(self.inbox(&remote), QoS::AtLeastOnce, false, payload)
                    .await
                {
                    warn!("Failed to say goodbye to {}: {}", remote, e);
                }
            }
        }

        *self.state.lock() = RelayState::default();
        let _ = connection
            .client
            .unsubscribe(self.inbox(&connection.identity))
            .await;
        let _ = connection.client.disconnect().await;
        connection.cancel.cancel();
        info!("Released {} from relay", connection.identity);
        Ok(())
    }
}

impl Drop for MqttRelay {
    fn drop(&mut self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.cancel.cancel();
            connection.task.abort();
        }
    }
}

struct RelayLoop {
    client: AsyncClient,
    prefix: String,
    identity: PeerId,
    inbox: String,
    events: mpsc::UnboundedSender<SignalingEvent>,
    state: Arc<Mutex<RelayState>>,
    cancel: CancellationToken,
}

impl RelayLoop {
    fn emit(&self, event: SignalingEvent) {
        let _ = self.events.send(event);
    }

    async fn reply(&self, to: &PeerId, kind: RelayKind) {
        let envelope = Envelope {
            from: self.identity.clone(),
            kind,
        };
        let Ok(payload) = serde_json::to_vec(&envelope) else {
            return;
        };
        let topic = format!("{}/{}", self.prefix, to);
        if let Err(e) = self
            .client
            .publish(topic, QoS::AtLeastOnce, false, payload)
            .await
        {
            warn!("Relay reply to {} failed: {}", to, e);
        }
    }

    async fn handle(&self, envelope: Envelope) {
        let from = envelope.from;
        match envelope.kind {
            RelayKind::Open { channel } => {
                self.state.lock().channels.insert(channel, from.clone());
                self.reply(&from, RelayKind::Accept { channel }).await;
                self.emit(SignalingEvent::ChannelOpen {
                    channel,
                    remote: from,
                });
            }
            RelayKind::Accept { channel } => {
                let known = {
                    let mut state = self.state.lock();
                    let known = state.pending.remove(&channel);
                    if known {
                        state.channels.insert(channel, from.clone());
                    }
                    known
                };
                if known {
                    self.emit(SignalingEvent::ChannelOpen {
                        channel,
                        remote: from,
                    });
                }
            }
            RelayKind::Data { channel, payload } => {
                if self.state.lock().channels.contains_key(&channel) {
                    self.emit(SignalingEvent::Data {
                        channel,
                        payload: Bytes::from(payload),
                    });
                }
            }
            RelayKind::Close { channel } => {
                if self.state.lock().channels.remove(&channel).is_some() {
                    self.emit(SignalingEvent::ChannelClosed { channel });
                }
            }
            RelayKind::Call { call, track } => {
                self.state
                    .lock()
                    .calls
                    .insert(call, (from.clone(), Some(track)));
                self.emit(SignalingEvent::IncomingCall { call, remote: from });
            }
            RelayKind::Answer { call } => {
                if self.state.lock().calls.contains_key(&call) {
                    self.emit(SignalingEvent::CallAnswered { call });
                }
            }
            RelayKind::Hangup { call } => {
                if self.state.lock().calls.remove(&call).is_some() {
                    self.emit(SignalingEvent::CallClosed { call });
                }
            }
            RelayKind::Bye => {
                let (calls, channels) = {
                    let mut state = self.state.lock();
                    let calls: Vec<CallId> = state
                        .calls
                        .iter()
                        .filter(|(_, (peer, _))| *peer == from)
                        .map(|(id, _)| *id)
                        .collect();
                    let channels: Vec<ChannelId> = state
                        .channels
                        .iter()
                        .filter(|(_, peer)| **peer == from)
                        .map(|(id, _)| *id)
                        .collect();
                    for call in &calls {
                        state.calls.remove(call);
                    }
                    for channel in &channels {
                        state.channels.remove(channel);
                    }
                    (calls, channels)
                };
                for call in calls {
                    self.emit(SignalingEvent::CallClosed { call });
                }
                for channel in channels {
                    self.emit(SignalingEvent::ChannelClosed { channel });
                }
            }
        }
    }
}

async fn relay_loop(mut event_loop: EventLoop, relay: RelayLoop) {
    let mut registered = false;
    loop {
        let polled = tokio::select! {
            _ = relay.cancel.cancelled() => break,
            polled = event_loop.poll() => polled,
        };

        match polled {
            Ok(Event::Incoming(Packet::ConnAck(_))) => {
                debug!("Relay connection acknowledged for {}", relay.identity);
            }
            Ok(Event::Incoming(Packet::SubAck(_))) if !registered => {
                registered = true;
                info!("Registered {} on relay", relay.identity);
                relay.emit(SignalingEvent::Registered);
            }
            Ok(Event::Incoming(Packet::Publish(publish))) if publish.topic == relay.inbox => {
                match serde_json::from_slice::<Envelope>(&publish.payload) {
                    Ok(envelope) => relay.handle(envelope).await,
                    Err(e) => warn!("Dropping malformed relay message: {}", e),
                }
            }
            Ok(_) => {}
            Err(e) => {
                error!("Relay connection for {} failed: {}", relay.identity, e);
                relay.emit(SignalingEvent::Error {
                    reason: e.to_string(),
                });
                break;
            }
        }
    }
    debug!("Relay loop for {} stopped", relay.identity);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn envelope_is_flat_json() {
        let envelope = Envelope {
            from: PeerId::new("control3"),
            kind: RelayKind::Data {
                channel: ChannelId::new(),
                payload: "{}".into(),
            },
        };
        let json: serde_json::Value = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["from"], "control3");
        assert_eq!(json["kind"], "data");

        let back: Envelope = serde_json::from_value(json).unwrap();
        assert_eq!(back, envelope);
    }

    #[test]
    fn memory_url_is_rejected() {
        let config = SignalingConfig {
            url: "memory://".into(),
            ..SignalingConfig::default()
        };
        assert!(MqttRelay::new(config).is_err());
    }

    #[tokio::test]
    async fn requests_before_register_fail() {
        let relay = MqttRelay::new(SignalingConfig::default()).unwrap();
        assert!(matches!(
            relay.connect(&PeerId::new("excav1")).await,
            Err(SignalingError::NotRegistered)
        ));
        assert!(relay.unregister().await.is_ok());
    }
}
