use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, info, warn};
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidate;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::policy::bundle_policy::RTCBundlePolicy;
use webrtc::peer_connection::policy::rtcp_mux_policy::RTCRtcpMuxPolicy;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::signaling_state::RTCSignalingState;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::rtp_transceiver::rtp_receiver::RTCRtpReceiver;
use webrtc::rtp_transceiver::rtp_sender::RTCRtpSender;
use webrtc::rtp_transceiver::RTCRtpTransceiver;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

use crate::config::MeshConfig;
use crate::error::TransportError;
use crate::logger::{dump_candidate, dump_selected_pair};
use crate::peer::data_channel::attach_dc;
use crate::peer::transport::{Channel, ConnectionEvent, ConnectionFactory, DirectConnection, Link};
use crate::peer::types::{
    IceCandidate, LinkState, MediaStream, SdpType, ServerConfig, SessionDescription,
    SignalingState,
};
use crate::utils::add_ice_url_scheme;

/// Период ожидания перед тем, как считать разорванное соединение потерянным
pub const GRACE_PERIOD: Duration = Duration::from_secs(10);

/// Фабрика WebRTC соединений с общим MediaEngine
pub struct RtcFactory {
    api: API,
    ice_servers: Vec<ServerConfig>,
}

impl RtcFactory {
    pub fn new(config: &MeshConfig) -> Result<Self, TransportError> {
        config
            .validate()
            .map_err(|e| TransportError::ConnectionFailed(e.to_string()))?;

        let mut media = MediaEngine::default();
        media.register_default_codecs()?;
        let registry = register_default_interceptors(Registry::new(), &mut media)?;
        let api = APIBuilder::new()
            .with_media_engine(media)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self {
            api,
            ice_servers: config.ice_servers.clone(),
        })
    }
}

#[async_trait]
impl ConnectionFactory for RtcFactory {
    async fn connect(&self, remote: &str) -> Result<Link, TransportError> {
        let config = rtc_config(&self.ice_servers);
        let pc = Arc::new(self.api.new_peer_connection(config).await?);
        Ok(RtcConnection::attach(remote, pc))
    }
}

/// Создает конфигурацию для peer connection
fn rtc_config(custom_servers: &[ServerConfig]) -> RTCConfiguration {
    let ice_servers = if custom_servers.is_empty() {
        // Используем дефолтные серверы
        vec![RTCIceServer {
            urls: vec![
                "stun:stun.l.google.com:19302".into(),
                "stun:stun1.l.google.com:19302".into(),
            ],
            ..Default::default()
        }]
    } else {
        get_user_ice_servers(custom_servers)
    };

    RTCConfiguration {
        ice_servers,
        ice_candidate_pool_size: 10,
        bundle_policy: RTCBundlePolicy::MaxBundle,
        rtcp_mux_policy: RTCRtcpMuxPolicy::Require,
        ..Default::default()
    }
}

/// Пользовательские серверы в формате webrtc
pub fn get_user_ice_servers(servers: &[ServerConfig]) -> Vec<RTCIceServer> {
    servers
        .iter()
        .map(|config| RTCIceServer {
            urls: vec![add_ice_url_scheme(config)],
            username: config.username.clone().unwrap_or_default(),
            credential: config.credential.clone().unwrap_or_default(),
        })
        .collect()
}

pub struct RtcConnection {
    remote: String,
    pc: Arc<RTCPeerConnection>,
    senders: Mutex<HashMap<String, Vec<Arc<RTCRtpSender>>>>,
    disconnect_task: Arc<Mutex<Option<JoinHandle<()>>>>,
}

impl RtcConnection {
    /// Вешает обработчики на `pc` и возвращает соединение с очередью событий
    fn attach(remote: &str, pc: Arc<RTCPeerConnection>) -> Link {
        let (tx, rx) = mpsc::unbounded_channel();
        let disconnect_task = Arc::new(Mutex::new(None));

        pc.on_ice_candidate(Box::new({
            let tx = tx.clone();
            let peer = remote.to_string();
            move |cand: Option<RTCIceCandidate>| {
                match cand {
                    Some(c) => {
                        dump_candidate(&peer, "LOCAL", &c);
                        match c.to_json() {
                            Ok(init) => {
                                let _ = tx.send(ConnectionEvent::IceCandidate(Some(init.into())));
                            }
                            Err(e) => warn!(peer = %peer, "Cannot serialize candidate: {e}"),
                        }
                    }
                    None => {
                        // cand == None означает конец сбора
                        debug!(peer = %peer, "ICE candidate gathering completed");
                        let _ = tx.send(ConnectionEvent::IceCandidate(None));
                    }
                }
                Box::pin(async {})
            }
        }));

        pc.on_negotiation_needed(Box::new({
            let tx = tx.clone();
            move || {
                let _ = tx.send(ConnectionEvent::NegotiationNeeded);
                Box::pin(async {})
            }
        }));

        pc.on_data_channel(Box::new({
            let tx = tx.clone();
            move |dc: Arc<RTCDataChannel>| {
                let _ = tx.send(ConnectionEvent::DataChannel(attach_dc(dc)));
                Box::pin(async {})
            }
        }));

        pc.on_track(Box::new({
            let tx = tx.clone();
            move |track: Arc<TrackRemote>,
                  _receiver: Arc<RTCRtpReceiver>,
                  _transceiver: Arc<RTCRtpTransceiver>| {
                let _ = tx.send(ConnectionEvent::Track {
                    stream_id: track.stream_id(),
                    track: Some(track),
                });
                Box::pin(async {})
            }
        }));

        // Weak: обработчик живёт внутри pc и не должен его удерживать
        let weak_pc = Arc::downgrade(&pc);
        let peer = remote.to_string();
        let task = disconnect_task.clone();
        pc.on_peer_connection_state_change(Box::new(move |st: RTCPeerConnectionState| {
            on_state_change(&peer, st, &weak_pc, &task, &tx);
            Box::pin(async {})
        }));

        Link {
            connection: Arc::new(RtcConnection {
                remote: remote.to_string(),
                pc,
                senders: Mutex::new(HashMap::new()),
                disconnect_task,
            }),
            events: rx,
        }
    }
}

fn on_state_change(
    peer: &str,
    st: RTCPeerConnectionState,
    weak_pc: &Weak<RTCPeerConnection>,
    task: &Arc<Mutex<Option<JoinHandle<()>>>>,
    tx: &mpsc::UnboundedSender<ConnectionEvent>,
) {
    info!(peer, "Peer connection state changed to: {st:?}");
    match st {
        RTCPeerConnectionState::Connected => {
            // отменяем отложенный disconnect, если он был
            if let Some(handle) = task.lock().take() {
                debug!(peer, "Connection recovered, aborting pending disconnect task");
                handle.abort();
            }
            let _ = tx.send(ConnectionEvent::StateChanged(LinkState::Open));
            spawn_stats(peer, weak_pc, "CONNECTED");
        }

        RTCPeerConnectionState::Disconnected => {
            let mut pending = task.lock();
            // уже ожидаем? – ничего не делаем
            if pending.is_some() {
                return;
            }
            spawn_stats(peer, weak_pc, "BEFORE-FAIL");

            let peer = peer.to_string();
            let weak_pc = weak_pc.clone();
            let tx = tx.clone();
            *pending = Some(tokio::spawn(async move {
                debug!(peer = %peer, "Grace period started, waiting {} s", GRACE_PERIOD.as_secs());
                sleep(GRACE_PERIOD).await;
                let now = weak_pc.upgrade().map(|pc| pc.connection_state());
                if now != Some(RTCPeerConnectionState::Connected) {
                    info!(peer = %peer, "Grace over, state={now:?}");
                    let _ = tx.send(ConnectionEvent::StateChanged(LinkState::Failed));
                }
            }));
        }

        RTCPeerConnectionState::Failed => {
            if let Some(handle) = task.lock().take() {
                handle.abort();
            }
            spawn_stats(peer, weak_pc, "FAILED");
            let _ = tx.send(ConnectionEvent::StateChanged(LinkState::Failed));
        }

        RTCPeerConnectionState::Closed => {
            if let Some(handle) = task.lock().take() {
                handle.abort();
            }
            let _ = tx.send(ConnectionEvent::StateChanged(LinkState::Closed));
        }

        _ => {}
    }
}

fn spawn_stats(peer: &str, weak_pc: &Weak<RTCPeerConnection>, moment: &'static str) {
    if let Some(pc) = weak_pc.upgrade() {
        let peer = peer.to_string();
        tokio::spawn(async move { dump_selected_pair(&peer, &pc, moment).await });
    }
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription, TransportError> {
    let parsed = match desc.kind {
        SdpType::Offer => RTCSessionDescription::offer(desc.sdp),
        SdpType::Answer => RTCSessionDescription::answer(desc.sdp),
    };
    parsed.map_err(|e| TransportError::Negotiation(e.to_string()))
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription, TransportError> {
    match desc.sdp_type {
        RTCSdpType::Offer => Ok(SessionDescription::offer(desc.sdp)),
        RTCSdpType::Answer => Ok(SessionDescription::answer(desc.sdp)),
        other => Err(TransportError::Negotiation(format!(
            "unexpected description type {other:?}"
        ))),
    }
}

impl RtcConnection {
    async fn current_local(&self) -> Result<SessionDescription, TransportError> {
        let local = self
            .pc
            .local_description()
            .await
            .ok_or_else(|| TransportError::Negotiation("local description missing".into()))?;
        from_rtc(local)
    }

    async fn rollback(&self) -> Result<(), TransportError> {
        debug!(peer = %self.remote, "Rolling back local offer");
        let mut rollback = self.pc.pending_local_description().await.unwrap_or_default();
        rollback.sdp_type = RTCSdpType::Rollback;
        self.pc
            .set_local_description(rollback)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }
}

#[async_trait]
impl DirectConnection for RtcConnection {
    async fn create_offer(&self) -> Result<SessionDescription, TransportError> {
        let offer = self.pc.create_offer(None).await?;
        self.pc.set_local_description(offer).await?;
        self.current_local().await
    }

    async fn apply_remote(
        &self,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, TransportError> {
        let is_offer = desc.kind == SdpType::Offer;
        if is_offer && self.pc.signaling_state() == RTCSignalingState::HaveLocalOffer {
            self.rollback().await?;
        }
        self.pc
            .set_remote_description(to_rtc(desc)?)
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))?;
        if !is_offer {
            return Ok(None);
        }

        let answer = self.pc.create_answer(None).await?;
        self.pc.set_local_description(answer).await?;
        Ok(Some(self.current_local().await?))
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError> {
        self.pc
            .add_ice_candidate(candidate.into())
            .await
            .map_err(|e| TransportError::Negotiation(e.to_string()))
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    fn signaling_state(&self) -> SignalingState {
        match self.pc.signaling_state() {
            RTCSignalingState::HaveLocalOffer | RTCSignalingState::HaveRemotePranswer => {
                SignalingState::HaveLocalOffer
            }
            RTCSignalingState::HaveRemoteOffer | RTCSignalingState::HaveLocalPranswer => {
                SignalingState::HaveRemoteOffer
            }
            RTCSignalingState::Closed => SignalingState::Closed,
            _ => SignalingState::Stable,
        }
    }

    async fn create_channel(&self, label: &str) -> Result<Channel, TransportError> {
        let init = RTCDataChannelInit {
            ordered: Some(true),
            ..Default::default()
        };
        let dc = self.pc.create_data_channel(label, Some(init)).await?;
        Ok(attach_dc(dc))
    }

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError> {
        let mut added = Vec::with_capacity(stream.tracks.len());
        for track in &stream.tracks {
            let local: Arc<dyn TrackLocal + Send + Sync> = track.clone();
            let sender = self.pc.add_track(local).await?;

            // RTCP нужно вычитывать, иначе interceptor'ы стоят
            let reader = sender.clone();
            tokio::spawn(async move {
                let mut buf = vec![0u8; 1500];
                while reader.read(&mut buf).await.is_ok() {}
            });
            added.push(sender);
        }
        debug!(peer = %self.remote, stream = %stream.id, tracks = added.len(), "Stream attached");
        self.senders
            .lock()
            .entry(stream.id.clone())
            .or_default()
            .extend(added);
        Ok(())
    }

    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError> {
        let senders = self.senders.lock().remove(stream_id).unwrap_or_default();
        for sender in senders {
            self.pc.remove_track(&sender).await?;
        }
        Ok(())
    }

    async fn close(&self) {
        if let Some(handle) = self.disconnect_task.lock().take() {
            handle.abort();
        }
        if let Err(e) = self.pc.close().await {
            warn!(peer = %self.remote, "Peer connection close failed: {e}");
        }
    }
}
