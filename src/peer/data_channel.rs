use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;

use crate::error::{MeshError, TransportError};
use crate::peer::transport::{Channel, ChannelEvent, DataChannel};
use crate::peer::types::Payload;

/// Кадры control-канала между двумя участниками
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ControlFrame {
    Message { message: Value },
    EndStream { id: String },
    Request { id: u64, message: Value },
    Response { id: u64, message: Value },
    Error { id: u64, error: String },
}

impl ControlFrame {
    pub fn encode(&self) -> Result<Payload, MeshError> {
        Ok(Payload::Text(serde_json::to_string(self)?))
    }

    /// `None` для бинарных и нераспознанных кадров
    pub fn decode(payload: &Payload) -> Option<Self> {
        match payload {
            Payload::Text(text) => serde_json::from_str(text).ok(),
            Payload::Binary(_) => None,
        }
    }
}

/// WebRTC data-channel за интерфейсом `DataChannel`
pub struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
    label: String,
}

/// общий обработчик data-channel: колбэки → очередь событий
pub fn attach_dc(dc: Arc<RTCDataChannel>) -> Channel {
    let (tx, rx) = mpsc::unbounded_channel();
    let label = dc.label().to_string();
    debug!(label = %label, "attach_dc called");

    dc.on_open(Box::new({
        let tx = tx.clone();
        let label = label.clone();
        move || {
            debug!(label = %label, "Data channel opened");
            let _ = tx.send(ChannelEvent::Open);
            Box::pin(async {})
        }
    }));

    dc.on_message(Box::new({
        let tx = tx.clone();
        move |msg: DataChannelMessage| {
            let payload = if msg.is_string {
                Payload::Text(String::from_utf8_lossy(&msg.data).into_owned())
            } else {
                Payload::Binary(msg.data)
            };
            let _ = tx.send(ChannelEvent::Message(payload));
            Box::pin(async {})
        }
    }));

    dc.on_error(Box::new({
        let tx = tx.clone();
        let label = label.clone();
        move |err: webrtc::Error| {
            warn!(label = %label, "Data channel error: {err}");
            let _ = tx.send(ChannelEvent::Error(err.to_string()));
            Box::pin(async {})
        }
    }));

    dc.on_close(Box::new({
        let tx = tx.clone();
        let label = label.clone();
        move || {
            debug!(label = %label, "Data channel closed");
            let _ = tx.send(ChannelEvent::Close);
            Box::pin(async {})
        }
    }));

    // канал мог открыться до регистрации on_open; повторный Open потребители игнорируют
    if dc.ready_state() == RTCDataChannelState::Open {
        let _ = tx.send(ChannelEvent::Open);
    }

    Channel {
        handle: Arc::new(RtcDataChannel { dc, label }),
        events: rx,
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> &str {
        &self.label
    }

    async fn send(&self, payload: Payload) -> Result<(), TransportError> {
        if self.dc.ready_state() != RTCDataChannelState::Open {
            return Err(TransportError::NotOpen);
        }
        let sent = match payload {
            Payload::Text(text) => self.dc.send_text(text).await,
            Payload::Binary(bytes) => self.dc.send(&bytes).await,
        };
        sent.map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        if let Err(e) = self.dc.close().await {
            debug!(label = %self.label, "Data channel close failed: {e}");
        }
    }
}
