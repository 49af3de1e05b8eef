//! Абстракция прямого соединения
//!
//! Mesh управляет каждым удалённым пиром через эти трейты, поэтому одна и та
//! же логика работает и поверх WebRTC (`peer::connection`), и поверх `peer::mock`.
//! Колбэки транспорта превращаются в события в неограниченной очереди; mesh
//! никогда не вешает замыкания на сам транспорт.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::mpsc;
use webrtc::track::track_remote::TrackRemote;

use crate::error::TransportError;
use crate::peer::types::{
    IceCandidate, LinkState, MediaStream, Payload, SessionDescription, SignalingState,
};

/// Метка control-канала пира
pub const CONTROL_LABEL: &str = "mesh-control";

/// Префикс меток временных файловых каналов (`mesh-file:<id>`)
pub const FILE_LABEL_PREFIX: &str = "mesh-file:";

/// События одного data channel в порядке прихода
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Open,
    Message(Payload),
    Error(String),
    Close,
}

/// Отправляющая половина data channel
#[async_trait]
pub trait DataChannel: Send + Sync {
    fn label(&self) -> &str;

    async fn send(&self, payload: Payload) -> Result<(), TransportError>;

    fn is_open(&self) -> bool;

    async fn close(&self);
}

/// Data channel вместе с очередью его событий
pub struct Channel {
    pub handle: Arc<dyn DataChannel>,
    pub events: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl Channel {
    pub fn label(&self) -> &str {
        self.handle.label()
    }
}

impl std::fmt::Debug for Channel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("label", &self.handle.label())
            .finish()
    }
}

/// События прямого соединения
pub enum ConnectionEvent {
    /// Локальный ICE кандидат; `None` завершает сбор
    IceCandidate(Option<IceCandidate>),
    /// Соединению нужен новый раунд offer/answer
    NegotiationNeeded,
    /// Удалённая сторона открыла канал
    DataChannel(Channel),
    /// Входящее медиа удалённого потока
    Track {
        stream_id: String,
        track: Option<Arc<TrackRemote>>,
    },
    StateChanged(LinkState),
}

impl std::fmt::Debug for ConnectionEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            ConnectionEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            ConnectionEvent::DataChannel(ch) => f.debug_tuple("DataChannel").field(ch).finish(),
            ConnectionEvent::Track { stream_id, .. } => {
                f.debug_struct("Track").field("stream_id", stream_id).finish()
            }
            ConnectionEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
        }
    }
}

/// Одно прямое соединение с удалённым пиром
#[async_trait]
pub trait DirectConnection: Send + Sync {
    /// Создаёт offer и ставит его локальным описанием.
    async fn create_offer(&self) -> Result<SessionDescription, TransportError>;

    /// Ставит удалённое описание. Для offer'а свой незавершённый offer
    /// сначала откатывается, возвращается полученный answer.
    async fn apply_remote(
        &self,
        desc: SessionDescription,
    ) -> Result<Option<SessionDescription>, TransportError>;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<(), TransportError>;

    async fn has_remote_description(&self) -> bool;

    fn signaling_state(&self) -> SignalingState;

    async fn create_channel(&self, label: &str) -> Result<Channel, TransportError>;

    async fn add_stream(&self, stream: &MediaStream) -> Result<(), TransportError>;

    /// Отключает треки потока; неизвестные id игнорируются.
    async fn remove_stream(&self, stream_id: &str) -> Result<(), TransportError>;

    async fn close(&self);
}

/// Новое соединение с очередью событий
pub struct Link {
    pub connection: Arc<dyn DirectConnection>,
    pub events: mpsc::UnboundedReceiver<ConnectionEvent>,
}

/// Создаёт прямые соединения к пирам по имени
#[async_trait]
pub trait ConnectionFactory: Send + Sync {
    async fn connect(&self, remote: &str) -> Result<Link, TransportError>;
}
