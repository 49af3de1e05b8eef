//! Прямые соединения в памяти
//!
//! `MockNetwork` заменяет WebRTC в тестах и офлайн. Описание сессии несёт id
//! породившего его соединения, так что применения удалённого описания
//! достаточно, чтобы связать два соединения. Пара считается соединённой,
//! когда offerer применил answer; каналы и потоки, запрошенные раньше,
//! доставляются в этот момент. Порядок фреймов внутри канала сохраняется.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tracing::debug;

use crate::error::TransportError;
use crate::peer::transport::{
    Channel, ChannelEvent, ConnectionEvent, ConnectionFactory, DataChannel, DirectConnection,
    Link,
};
use crate::peer::types::{
    IceCandidate, LinkState, MediaStream, Payload, SdpType, SessionDescription, SignalingState,
};

const SDP_PREFIX: &str = "mock:";

/// Открытый по сети data channel: кто открыл и кто принял
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChannelRecord {
    pub opener: String,
    pub acceptor: String,
    pub label: String,
}

#[derive(Default)]
struct NetworkInner {
    connections: Mutex<HashMap<u64, Weak<MockConnection>>>,
    next_id: AtomicU64,
    channel_log: Mutex<Vec<ChannelRecord>>,
}

#[derive(Clone, Default)]
pub struct MockNetwork {
    inner: Arc<NetworkInner>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Фабрика соединений для одного участника
    pub fn endpoint(&self, local: &str) -> Arc<MockFactory> {
        Arc::new(MockFactory {
            network: self.inner.clone(),
            local: local.to_string(),
        })
    }

    /// Все доставленные каналы в порядке доставки
    pub fn channel_log(&self) -> Vec<ChannelRecord> {
        self.inner.channel_log.lock().clone()
    }

    /// Самое свежее живое соединение от `local` к `remote`
    pub fn connection(&self, local: &str, remote: &str) -> Option<Arc<MockConnection>> {
        self.inner
            .connections
            .lock()
            .values()
            .filter_map(Weak::upgrade)
            .filter(|c| c.local == local && c.remote == remote)
            .max_by_key(|c| c.id)
    }
}

pub struct MockFactory {
    network: Arc<NetworkInner>,
    local: String,
}

#[async_trait]
impl ConnectionFactory for MockFactory {
    async fn connect(&self, remote: &str) -> Result<Link, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let id = self.network.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        let conn = Arc::new(MockConnection {
            id,
            local: self.local.clone(),
            remote: remote.to_string(),
            network: Arc::downgrade(&self.network),
            events: tx,
            state: Mutex::new(ConnState::default()),
        });
        self.network
            .connections
            .lock()
            .insert(id, Arc::downgrade(&conn));
        Ok(Link {
            connection: conn,
            events: rx,
        })
    }
}

struct ConnState {
    signaling: SignalingState,
    local_description: Option<SessionDescription>,
    remote_description: Option<SessionDescription>,
    peer: Option<Weak<MockConnection>>,
    connected: bool,
    closed: bool,
    gathered: bool,
    rounds: u64,
    rollbacks: u64,
    pending_channels: Vec<Arc<MockChannel>>,
    /// (id потока, число треков), ждут следующего завершённого раунда
    pending_streams: Vec<(String, usize)>,
    channels: Vec<Weak<MockChannel>>,
}

impl Default for ConnState {
    fn default() -> Self {
        Self {
            signaling: SignalingState::Stable,
            local_description: None,
            remote_description: None,
            peer: None,
            connected: false,
            closed: false,
            gathered: false,
            rounds: 0,
            rollbacks: 0,
            pending_channels: Vec::new(),
            pending_streams: Vec::new(),
            channels: Vec::new(),
        }
    }
}

pub struct MockConnection {
    id: u64,
    local: String,
    remote: String,
    network: Weak<NetworkInner>,
    events: mpsc::UnboundedSender<ConnectionEvent>,
    state: Mutex<ConnState>,
}

impl MockConnection {
    pub fn local_description(&self) -> Option<SessionDescription> {
        self.state.lock().local_description.clone()
    }

    pub fn remote_description(&self) -> Option<SessionDescription> {
        self.state.lock().remote_description.clone()
    }

    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }

    /// Свои offer'ы, отброшенные из-за применённого поверх чужого offer'а
    pub fn rollbacks(&self) -> u64 {
        self.state.lock().rollbacks
    }

    fn describe(&self, kind: SdpType, round: u64) -> SessionDescription {
        SessionDescription {
            kind,
            sdp: format!("{SDP_PREFIX}{}:{round}", self.id),
        }
    }

    fn lookup(&self, sdp: &str) -> Result<Arc<MockConnection>, TransportError> {
        let id = sdp
            .strip_prefix(SDP_PREFIX)
            .and_then(|rest| rest.split(':').next())
            .and_then(|id| id.parse::<u64>().ok())
            .ok_or_else(|| TransportError::Negotiation(format!("not a mock description: {sdp}")))?;
        let network = self.network.upgrade().ok_or(TransportError::Closed)?;
        let found = network.connections.lock().get(&id).and_then(Weak::upgrade);
        found.ok_or_else(|| TransportError::ConnectionFailed(format!("connection {id} is gone")))
    }

    /// Host-кандидат и конец сбора, один раз на соединение
    fn gather(&self) {
        {
            let mut st = self.state.lock();
            if st.gathered {
                return;
            }
            st.gathered = true;
        }
        let candidate = IceCandidate {
            candidate: format!(
                "candidate:{} 1 udp 2122260223 127.0.0.1 {} typ host",
                self.id,
                40_000 + self.id
            ),
            sdp_mid: Some("0".into()),
            sdp_mline_index: Some(0),
            username_fragment: None,
        };
        let _ = self
            .events
            .send(ConnectionEvent::IceCandidate(Some(candidate)));
        let _ = self.events.send(ConnectionEvent::IceCandidate(None));
    }

    fn take_pending(&self) -> (bool, Vec<Arc<MockChannel>>, Vec<(String, usize)>) {
        let mut st = self.state.lock();
        let was_connected = st.connected;
        st.connected = true;
        (
            was_connected,
            std::mem::take(&mut st.pending_channels),
            std::mem::take(&mut st.pending_streams),
        )
    }

    fn complete_round(&self, peer: &MockConnection) {
        let (was_connected, channels, streams) = self.take_pending();
        let (_, peer_channels, peer_streams) = peer.take_pending();

        for ch in channels {
            link_channel(self, peer, ch);
        }
        for ch in peer_channels {
            link_channel(peer, self, ch);
        }
        deliver_streams(peer, streams);
        deliver_streams(self, peer_streams);

        if !was_connected {
            debug!(local = %self.local, remote = %self.remote, "mock link connected");
            let _ = self.events.send(ConnectionEvent::StateChanged(LinkState::Open));
            let _ = peer.events.send(ConnectionEvent::StateChanged(LinkState::Open));
        }
    }

    fn record(&self, ch: &Arc<MockChannel>) {
        self.state.lock().channels.push(Arc::downgrade(ch));
    }
}

fn deliver_streams(to: &MockConnection, streams: Vec<(String, usize)>) {
    for (stream_id, tracks) in streams {
        for _ in 0..tracks.max(1) {
            let _ = to.events.send(ConnectionEvent::Track {
                stream_id: stream_id.clone(),
                track: None,
            });
        }
    }
}

fn link_channel(opener: &MockConnection, acceptor: &MockConnection, local: Arc<MockChannel>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let remote = Arc::new(MockChannel::new(&local.label, tx));
    *remote.peer.lock() = Some(Arc::downgrade(&local));
    *local.peer.lock() = Some(Arc::downgrade(&remote));
    acceptor.record(&remote);

    let _ = acceptor.events.send(ConnectionEvent::DataChannel(Channel {
        handle: remote.clone(),
        events: rx,
    }));
    local.mark_open();
    remote.mark_open();

    if let Some(network) = opener.network.upgrade() {
        network.channel_log.lock().push(ChannelRecord {
            opener: opener.local.clone(),
            acceptor: acceptor.local.clone(),
            label: local.label.clone(),
        });
    }
}

#[async_trait]
impl DirectConnection for MockConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            if st.signaling == SignalingState::HaveRemoteOffer {
                return Err(TransportError::Negotiation(
                    "cannot offer while answering".into(),
                ));
            }
            st.rounds += 1;
            let offer = self.describe(SdpType::Offer, st.rounds);
            st.local_description = Some(offer.clone());
            st.signaling = SignalingState::HaveLocalOffer;
            offer
        };
        self.gather();
        Ok(offer)
    }

    async fn apply_remote(
        &self,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, TransportError> {
        let peer = self.lookup(&desc.sdp)?;
        match desc.kind {
            SdpType::Offer => {
                let answer = {
                    let mut st = self.state.lock();
                    if st.closed {
                        return Err(TransportError::Closed);
                    }
                    if st.signaling == SignalingState::HaveLocalOffer {
                        debug!(local = %self.local, "rolling back local offer");
                        st.rollbacks += 1;
                    }
                    st.remote_description = Some(desc);
                    st.rounds += 1;
                    let answer = self.describe(SdpType::Answer, st.rounds);
                    st.local_description = Some(answer.clone());
                    st.signaling = SignalingState::Stable;
                    st.peer = Some(Arc::downgrade(&peer));
                    answer
                };
                self.gather();
                Ok(Some(answer))
            }
            SdpType::Answer => {
                {
                    let mut st = self.state.lock();
                    if st.signaling != SignalingState::HaveLocalOffer {
                        return Err(TransportError::Negotiation(
                            "answer without a pending offer".into(),
                        ));
                    }
                    st.remote_description = Some(desc);
                    st.signaling = SignalingState::Stable;
                    st.peer = Some(Arc::downgrade(&peer));
                }
                self.complete_round(&peer);
                Ok(None)
            }
        }
    }

    async fn add_ice_candidate(&self, _candidate: IceCandidate) -> Result<(), TransportError> {
        if self.state.lock().remote_description.is_none() {
            return Err(TransportError::Negotiation(
                "remote description not set".into(),
            ));
        }
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.state.lock().remote_description.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        self.state.lock().signaling
    }

    async fn create_channel(&self, label: &str) -> Result<Channel, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let ch = Arc::new(MockChannel::new(label, tx));
        let (linked, negotiate) = {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.channels.push(Arc::downgrade(&ch));
            if st.connected {
                let peer = st.peer.as_ref().and_then(Weak::upgrade);
                (Some(peer.ok_or(TransportError::Closed)?), false)
            } else {
                let idle = st.pending_channels.is_empty() && st.pending_streams.is_empty();
                st.pending_channels.push(ch.clone());
                (None, idle)
            }
        };
        if let Some(peer) = linked {
            link_channel(self, &peer, ch.clone());
        }
        if negotiate {
            let _ = self.events.send(ConnectionEvent::NegotiationNeeded);
        }
        Ok(Channel { handle: ch, events: rx })
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        {
            let mut st = self.state.lock();
            if st.closed {
                return Err(TransportError::Closed);
            }
            st.pending_streams
                .push((stream.id.clone(), stream.tracks.len()));
        }
        let _ = self.events.send(ConnectionEvent::NegotiationNeeded);
        Ok(())
    }

    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        self.state
            .lock()
            .pending_streams
            .retain(|(id, _)| id != stream_id);
        Ok(())
    }

    async fn close(&self) {
        let channels = {
            let mut st = self.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.connected = false;
            st.signaling = SignalingState::Closed;
            st.pending_channels.clear();
            std::mem::take(&mut st.channels)
        };
        for ch in channels.iter().filter_map(Weak::upgrade) {
            ch.shutdown_both();
        }
        if let Some(network) = self.network.upgrade() {
            network.connections.lock().remove(&self.id);
        }
        let _ = self
            .events
            .send(ConnectionEvent::StateChanged(LinkState::Closed));
    }
}

pub struct MockChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    events: mpsc::UnboundedSender<ChannelEvent>,
    peer: Mutex<Option<Weak<MockChannel>>>,
}

impl MockChannel {
    fn new(label: &str, events: mpsc::UnboundedSender<ChannelEvent>) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            events,
            peer: Mutex::new(None),
        }
    }

    fn mark_open(&self) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        if !self.open.swap(true, Ordering::SeqCst) {
            let _ = self.events.send(ChannelEvent::Open);
        }
    }

    fn shutdown(&self) {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.open.store(false, Ordering::SeqCst);
            let _ = self.events.send(ChannelEvent::Close);
        }
    }

    fn shutdown_both(&self) {
        self.shutdown();
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        if let Some(peer) = peer {
            peer.shutdown();
        }
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotOpen);
        }
        let peer = self.peer.lock().as_ref().and_then(Weak::upgrade);
        let peer = peer.ok_or(TransportError::Closed)?;
        peer.events
            .send(ChannelEvent::Message(payload))
            .map_err(|_| TransportError::Closed)
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        self.shutdown_both();
    }
}

/// Два связанных, уже открытых конца канала
pub fn channel_pair(label: &str) -> (Channel, Channel) {
    let (tx_a, rx_a) = mpsc::unbounded_channel();
    let (tx_b, rx_b) = mpsc::unbounded_channel();
    let a = Arc::new(MockChannel::new(label, tx_a));
    let b = Arc::new(MockChannel::new(label, tx_b));
    *a.peer.lock() = Some(Arc::downgrade(&b));
    *b.peer.lock() = Some(Arc::downgrade(&a));
    a.mark_open();
    b.mark_open();
    (
        Channel {
            handle: a,
            events: rx_a,
        },
        Channel {
            handle: b,
            events: rx_b,
        },
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::transport::CONTROL_LABEL;

    async fn pair(net: &MockNetwork) -> (Link, Link) {
        let a = net.endpoint("alice").connect("bob").await.unwrap();
        let b = net.endpoint("bob").connect("alice").await.unwrap();
        (a, b)
    }

    #[tokio::test]
    async fn channel_opens_after_offer_answer() {
        let net = MockNetwork::new();
        let (mut a, mut b) = pair(&net).await;

        let mut ch = a.connection.create_channel(CONTROL_LABEL).await.unwrap();
        assert!(matches!(
            a.events.recv().await,
            Some(ConnectionEvent::NegotiationNeeded)
        ));
        assert!(!ch.handle.is_open());

        let offer = a.connection.create_offer().await.unwrap();
        let answer = b.connection.apply_remote(offer).await.unwrap().unwrap();
        assert_eq!(a.connection.apply_remote(answer).await.unwrap(), None);

        assert_eq!(ch.events.recv().await, Some(ChannelEvent::Open));
        let mut remote = loop {
            match b.events.recv().await {
                Some(ConnectionEvent::DataChannel(c)) => break c,
                Some(_) => continue,
                None => panic!("no channel delivered"),
            }
        };
        assert_eq!(remote.label(), CONTROL_LABEL);
        assert_eq!(remote.events.recv().await, Some(ChannelEvent::Open));

        ch.handle.send(Payload::Text("hi".into())).await.unwrap();
        assert_eq!(
            remote.events.recv().await,
            Some(ChannelEvent::Message(Payload::Text("hi".into())))
        );
        assert_eq!(
            net.channel_log(),
            vec![ChannelRecord {
                opener: "alice".into(),
                acceptor: "bob".into(),
                label: CONTROL_LABEL.into(),
            }]
        );
    }

    #[tokio::test]
    async fn offer_rolls_back_pending_local_offer() {
        let net = MockNetwork::new();
        let (a, b) = pair(&net).await;
        let _mine = b.connection.create_offer().await.unwrap();
        assert_eq!(b.connection.signaling_state(), SignalingState::HaveLocalOffer);

        let offer = a.connection.create_offer().await.unwrap();
        assert!(b.connection.apply_remote(offer).await.unwrap().is_some());
        assert_eq!(b.connection.signaling_state(), SignalingState::Stable);
    }

    #[tokio::test]
    async fn closing_propagates_to_remote_channel() {
        let (a, mut b) = channel_pair("x");
        a.handle.close().await;
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Open));
        assert_eq!(b.events.recv().await, Some(ChannelEvent::Close));
        assert_eq!(
            b.handle.send(Payload::Text("late".into())).await,
            Err(TransportError::NotOpen)
        );
    }

    #[tokio::test]
    async fn candidates_need_remote_description() {
        let net = MockNetwork::new();
        let (a, _b) = pair(&net).await;
        let c = IceCandidate {
            candidate: "candidate:1 1 udp 1 127.0.0.1 1 typ host".into(),
            sdp_mid: None,
            sdp_mline_index: None,
            username_fragment: None,
        };
        assert!(a.connection.add_ice_candidate(c).await.is_err());
    }
}
