//! Передача файла по временному data channel
//!
//! ```text
//! отправитель                          получатель
//!   ── {"name","size","type","data"} ──▶
//!   ◀──────────────── "ok" ────────────
//!   ── chunk × ceil(size / chunk) ────▶
//!   ◀──────────────── "ok" ────────────
//!   закрытие
//! ```

use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::timeout;
use tracing::debug;

use crate::error::MeshError;
use crate::peer::transport::{Channel, ChannelEvent};
use crate::peer::types::Payload;

/// Фрейм подтверждения
pub const ACK: &str = "ok";

/// Первый фрейм передачи
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct FileMetadata {
    pub name: String,
    pub size: u64,
    #[serde(rename = "type")]
    pub mime: String,
    /// Значение корреляции, выбранное отправителем
    #[serde(default)]
    pub data: Value,
}

#[derive(Debug, Clone)]
pub struct OutgoingFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
}

impl OutgoingFile {
    pub fn new(name: impl Into<String>, mime: impl Into<String>, data: impl Into<Bytes>) -> Self {
        Self {
            name: name.into(),
            mime: mime.into(),
            data: data.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ReceivedFile {
    pub name: String,
    pub mime: String,
    pub data: Bytes,
    pub received_at: DateTime<Utc>,
}

impl ReceivedFile {
    /// Файл, доставленный самому отправителю без канала
    pub fn local(file: &OutgoingFile) -> Self {
        Self {
            name: file.name.clone(),
            mime: file.mime.clone(),
            data: file.data.clone(),
            received_at: Utc::now(),
        }
    }
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    Outgoing,
    Incoming,
}

#[derive(Serialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum TransferState {
    Opening,
    AwaitingAck,
    Streaming,
    Confirming,
    Complete,
    Failed,
}

/// Живое состояние одной передачи, общее с mesh для снимков
#[derive(Debug)]
pub struct TransferProgress {
    direction: Direction,
    state: Mutex<TransferState>,
    metadata: Mutex<Option<FileMetadata>>,
    transferred: AtomicU64,
}

#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct TransferSnapshot {
    pub id: String,
    pub direction: Direction,
    pub name: String,
    pub mime: String,
    pub size: u64,
    pub transferred: u64,
    pub state: TransferState,
}

impl TransferProgress {
    pub fn new(direction: Direction) -> Self {
        Self {
            direction,
            state: Mutex::new(TransferState::Opening),
            metadata: Mutex::new(None),
            transferred: AtomicU64::new(0),
        }
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock()
    }

    pub fn transferred(&self) -> u64 {
        self.transferred.load(Ordering::SeqCst)
    }

    fn set_state(&self, state: TransferState) {
        *self.state.lock() = state;
    }

    fn set_metadata(&self, metadata: &FileMetadata) {
        *self.metadata.lock() = Some(metadata.clone());
    }

    /// `None`, пока фрейм метаданных не ушёл или не пришёл
    pub fn snapshot(&self, id: &str) -> Option<TransferSnapshot> {
        let metadata = self.metadata.lock().clone()?;
        Some(TransferSnapshot {
            id: id.to_string(),
            direction: self.direction,
            name: metadata.name,
            mime: metadata.mime,
            size: metadata.size,
            transferred: self.transferred(),
            state: self.state(),
        })
    }
}

/// Последовательные куски не длиннее `chunk_size`; пустой вход не даёт ничего
pub fn split_chunks(data: &Bytes, chunk_size: usize) -> impl Iterator<Item = Bytes> + '_ {
    let chunk_size = chunk_size.max(1);
    (0..data.len())
        .step_by(chunk_size)
        .map(move |start| data.slice(start..(start + chunk_size).min(data.len())))
}

/// Отправляет один файл и закрывает канал. Возвращает число отправленных кусков.
pub async fn send_file(
    mut channel: Channel,
    file: &OutgoingFile,
    correlation: Value,
    chunk_size: usize,
    ack_timeout: Duration,
    progress: &TransferProgress,
) -> Result<usize, MeshError> {
    let result = stream_file(&mut channel, file, correlation, chunk_size, ack_timeout, progress).await;
    if result.is_err() {
        progress.set_state(TransferState::Failed);
    }
    channel.handle.close().await;
    result
}

async fn stream_file(
    channel: &mut Channel,
    file: &OutgoingFile,
    correlation: Value,
    chunk_size: usize,
    ack_timeout: Duration,
    progress: &TransferProgress,
) -> Result<usize, MeshError> {
    progress.set_state(TransferState::Opening);
    wait_open(&mut channel.events, ack_timeout).await?;

    let metadata = FileMetadata {
        name: file.name.clone(),
        size: file.data.len() as u64,
        mime: file.mime.clone(),
        data: correlation,
    };
    progress.set_metadata(&metadata);
    channel
        .handle
        .send(Payload::Text(serde_json::to_string(&metadata)?))
        .await?;
    progress.set_state(TransferState::AwaitingAck);
    wait_ack(&mut channel.events, ack_timeout).await?;

    progress.set_state(TransferState::Streaming);
    let mut chunks = 0;
    for chunk in split_chunks(&file.data, chunk_size) {
        let len = chunk.len() as u64;
        channel.handle.send(Payload::Binary(chunk)).await?;
        progress.transferred.fetch_add(len, Ordering::SeqCst);
        chunks += 1;
    }

    progress.set_state(TransferState::Confirming);
    wait_ack(&mut channel.events, ack_timeout).await?;
    progress.set_state(TransferState::Complete);
    debug!(file = %file.name, chunks, "file delivered");
    Ok(chunks)
}

async fn wait_open(
    events: &mut UnboundedReceiver<ChannelEvent>,
    limit: Duration,
) -> Result<(), MeshError> {
    let opened = async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Open) => return Ok(()),
                Some(ChannelEvent::Message(_)) => continue,
                Some(ChannelEvent::Error(e)) => return Err(MeshError::Transfer(e)),
                Some(ChannelEvent::Close) | None => {
                    return Err(MeshError::Transfer("channel closed before opening".into()))
                }
            }
        }
    };
    timeout(limit, opened)
        .await
        .map_err(|_| MeshError::Timeout("file channel did not open".into()))?
}

async fn wait_ack(
    events: &mut UnboundedReceiver<ChannelEvent>,
    limit: Duration,
) -> Result<(), MeshError> {
    let acked = async {
        loop {
            match events.recv().await {
                Some(ChannelEvent::Message(Payload::Text(text))) if text == ACK => return Ok(()),
                Some(ChannelEvent::Message(_)) | Some(ChannelEvent::Open) => continue,
                Some(ChannelEvent::Error(e)) => return Err(MeshError::Transfer(e)),
                Some(ChannelEvent::Close) | None => {
                    return Err(MeshError::Transfer(
                        "channel closed while waiting for acknowledgement".into(),
                    ))
                }
            }
        }
    };
    timeout(limit, acked)
        .await
        .map_err(|_| MeshError::Timeout("file acknowledgement".into()))?
}

/// Что сделал с получателем один входящий фрейм
#[derive(Debug, PartialEq)]
pub enum ReceiveStep {
    Metadata(FileMetadata),
    /// Сколько байт получено
    Chunk(u64),
    Complete(ReceivedFile, Value),
}

/// Принимающая сторона протокола, без привязки к каналу
#[derive(Debug, Default)]
pub struct FileReceiver {
    metadata: Option<FileMetadata>,
    chunks: Vec<Bytes>,
    received: u64,
}

impl FileReceiver {
    pub fn on_frame(&mut self, payload: Payload) -> Result<ReceiveStep, MeshError> {
        let Some(size) = self.metadata.as_ref().map(|m| m.size) else {
            return self.accept_metadata(payload);
        };
        let chunk = match payload {
            Payload::Binary(chunk) => chunk,
            Payload::Text(_) => {
                return Err(MeshError::Transfer("unexpected text frame".into()));
            }
        };
        self.received += chunk.len() as u64;
        if self.received > size {
            return Err(MeshError::Transfer(format!(
                "received {} bytes, {} declared",
                self.received, size
            )));
        }
        self.chunks.push(chunk);
        match self.finish() {
            Some((file, correlation)) => Ok(ReceiveStep::Complete(file, correlation)),
            None => Ok(ReceiveStep::Chunk(self.received)),
        }
    }

    fn accept_metadata(&mut self, payload: Payload) -> Result<ReceiveStep, MeshError> {
        let Payload::Text(text) = payload else {
            return Err(MeshError::Transfer("chunk before metadata".into()));
        };
        let metadata: FileMetadata = serde_json::from_str(&text)
            .map_err(|e| MeshError::Transfer(format!("bad metadata: {e}")))?;
        self.metadata = Some(metadata.clone());
        Ok(ReceiveStep::Metadata(metadata))
    }

    pub fn is_complete(&self) -> bool {
        self.metadata
            .as_ref()
            .is_some_and(|m| m.size == self.received)
    }

    /// Собирает файл, когда пришли все заявленные байты
    pub fn finish(&mut self) -> Option<(ReceivedFile, Value)> {
        if !self.is_complete() {
            return None;
        }
        let metadata = self.metadata.take()?;
        let mut data = BytesMut::with_capacity(metadata.size as usize);
        for chunk in self.chunks.drain(..) {
            data.extend_from_slice(&chunk);
        }
        let file = ReceivedFile {
            name: metadata.name,
            mime: metadata.mime,
            data: data.freeze(),
            received_at: Utc::now(),
        };
        Some((file, metadata.data))
    }
}

/// Ведёт приём, пока файл не собран или канал не умер.
pub async fn receive_file(
    mut channel: Channel,
    progress: &TransferProgress,
) -> Result<(ReceivedFile, Value), MeshError> {
    let mut receiver = FileReceiver::default();
    while let Some(event) = channel.events.recv().await {
        let payload = match event {
            ChannelEvent::Open => continue,
            ChannelEvent::Message(payload) => payload,
            ChannelEvent::Error(e) => {
                debug!(label = channel.label(), "file channel error: {e}");
                continue;
            }
            ChannelEvent::Close => break,
        };
        match receiver.on_frame(payload) {
            Ok(ReceiveStep::Metadata(metadata)) => {
                progress.set_metadata(&metadata);
                progress.set_state(TransferState::Streaming);
                acknowledge(&channel).await?;
                // пустой файл завершается сразу после метаданных
                if let Some(done) = receiver.finish() {
                    progress.set_state(TransferState::Complete);
                    acknowledge(&channel).await?;
                    return Ok(done);
                }
            }
            Ok(ReceiveStep::Chunk(total)) => progress.transferred.store(total, Ordering::SeqCst),
            Ok(ReceiveStep::Complete(file, correlation)) => {
                progress
                    .transferred
                    .store(file.data.len() as u64, Ordering::SeqCst);
                progress.set_state(TransferState::Complete);
                acknowledge(&channel).await?;
                return Ok((file, correlation));
            }
            Err(e) => {
                progress.set_state(TransferState::Failed);
                channel.handle.close().await;
                return Err(e);
            }
        }
    }
    progress.set_state(TransferState::Failed);
    Err(MeshError::Transfer(
        "file channel closed before completion".into(),
    ))
}

async fn acknowledge(channel: &Channel) -> Result<(), MeshError> {
    channel.handle.send(Payload::Text(ACK.into())).await?;
    Ok(())
}
