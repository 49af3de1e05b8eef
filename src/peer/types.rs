use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_remote::TrackRemote;

/// ICE кандидат, передаваемый через rendezvous-сессию
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub candidate: String,
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex")]
    pub sdp_mline_index: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username_fragment: Option<String>,
}

impl From<RTCIceCandidateInit> for IceCandidate {
    fn from(init: RTCIceCandidateInit) -> Self {
        Self {
            candidate: init.candidate,
            sdp_mid: init.sdp_mid,
            sdp_mline_index: init.sdp_mline_index,
            username_fragment: init.username_fragment,
        }
    }
}

impl From<IceCandidate> for RTCIceCandidateInit {
    fn from(c: IceCandidate) -> Self {
        RTCIceCandidateInit {
            candidate: c.candidate,
            sdp_mid: c.sdp_mid,
            sdp_mline_index: c.sdp_mline_index,
            username_fragment: c.username_fragment,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SdpType {
    Offer,
    Answer,
}

/// Описание сессии (offer/answer) в формате `{type, sdp}`
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpType,
    pub sdp: String,
}

impl SessionDescription {
    pub fn offer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Offer,
            sdp: sdp.into(),
        }
    }

    pub fn answer(sdp: impl Into<String>) -> Self {
        Self {
            kind: SdpType::Answer,
            sdp: sdp.into(),
        }
    }
}

/// Состояние signaling у прямого соединения
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

/// Роль в паре. Инициатор всегда impolite, принимающий всегда polite.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Polite,
    Impolite,
}

impl Role {
    pub fn for_initiator(initiator: bool) -> Self {
        if initiator {
            Role::Impolite
        } else {
            Role::Polite
        }
    }
}

/// Жизненный цикл PeerConnection
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LinkState {
    Connecting,
    Open,
    Closed,
    Failed,
}

/// Содержимое сообщения data-канала
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    Text(String),
    Binary(Bytes),
}

impl Payload {
    pub fn len(&self) -> usize {
        match self {
            Payload::Text(t) => t.len(),
            Payload::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Локальный медиапоток: id и треки, которые прикрепляются к соединениям
#[derive(Clone)]
pub struct MediaStream {
    pub id: String,
    pub tracks: Vec<Arc<TrackLocalStaticSample>>,
}

impl MediaStream {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            tracks: Vec::new(),
        }
    }

    pub fn with_track(mut self, track: Arc<TrackLocalStaticSample>) -> Self {
        self.tracks.push(track);
        self
    }

    pub fn track_ids(&self) -> Vec<String> {
        self.tracks.iter().map(|t| t.id().to_string()).collect()
    }
}

impl std::fmt::Debug for MediaStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MediaStream")
            .field("id", &self.id)
            .field("tracks", &self.track_ids())
            .finish()
    }
}

/// Поток, о начале которого сообщается приложению
#[derive(Clone)]
pub enum IncomingStream {
    /// Свой поток, отправленный самому себе
    Local(MediaStream),
    /// Первый трек удалённого потока; `None` у транспортов без медиа
    Remote {
        id: String,
        track: Option<Arc<TrackRemote>>,
    },
}

impl IncomingStream {
    pub fn id(&self) -> &str {
        match self {
            IncomingStream::Local(s) => &s.id,
            IncomingStream::Remote { id, .. } => id,
        }
    }
}

impl std::fmt::Debug for IncomingStream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IncomingStream::Local(s) => f.debug_tuple("Local").field(s).finish(),
            IncomingStream::Remote { id, track } => f
                .debug_struct("Remote")
                .field("id", id)
                .field("has_track", &track.is_some())
                .finish(),
        }
    }
}

/// Конфигурация ICE сервера
#[derive(Serialize, Deserialize, Debug, Clone)]
pub struct ServerConfig {
    pub id: String,
    pub r#type: String, // 'stun' or 'turn'
    pub url: String,
    pub username: Option<String>,
    pub credential: Option<String>,
}
