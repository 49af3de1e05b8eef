//! Колбэки для приложения
//!
//! У каждой сессии и каждого mesh ровно один обработчик. Замена через
//! `set_handler` действует со следующего события. У всех методов есть
//! реализация по умолчанию, которая только пишет в лог.

use async_trait::async_trait;
use serde_json::Value;
use std::any::Any;
use tracing::{error, info, warn};

use crate::error::{MeshError, SessionError};
use crate::peer::file_transfer::ReceivedFile;
use crate::peer::types::IncomingStream;

/// Значение из `on_stream_begin`, возвращается обратно в `on_stream_end`
pub type StreamToken = Box<dyn Any + Send + Sync>;

/// Колбэки rendezvous-сессии
#[async_trait]
pub trait SessionHandler: Send + Sync {
    async fn on_reception(&self, from: &str, message: Value) {
        info!("MESSAGE FROM {from}: {message}");
    }

    /// Формирует ответ на чужой `ask`. `Err` уходит как ответ с ошибкой.
    async fn on_request(&self, from: &str, message: Value) -> Result<Value, String> {
        Ok(Value::String(format!(
            "REQUEST NOT HANDLED: {message} (from {from})"
        )))
    }

    async fn on_join(&self, user: &str) {
        info!("{user} has joined the session");
    }

    async fn on_leave(&self, user: &str) {
        info!("{user} has left the session");
    }

    async fn on_error(&self, error: &str) {
        warn!("session error: {error}");
    }

    /// Соединение с rendezvous-сервером потеряно.
    async fn on_fatal_error(&self, error: &SessionError) {
        error!("session lost: {error}");
    }
}

/// Колбэки mesh-сети
#[async_trait]
pub trait MeshHandler: Send + Sync {
    async fn on_reception(&self, from: &str, message: Value) {
        info!("MESSAGE FROM {from}: {message}");
    }

    async fn on_request(&self, from: &str, message: Value) -> Result<Value, String> {
        Ok(Value::String(format!(
            "REQUEST NOT HANDLED: {message} (from {from})"
        )))
    }

    /// У пира открылся control-канал.
    async fn on_join(&self, user: &str) {
        info!("{user} has joined the mesh");
    }

    async fn on_leave(&self, user: &str) {
        info!("{user} has left the mesh");
    }

    async fn on_error(&self, error: &MeshError) {
        warn!("mesh error: {error}");
    }

    async fn on_fatal_error(&self, error: &SessionError) {
        error!("rendezvous session lost: {error}");
    }

    async fn on_stream_begin(&self, from: &str, stream: IncomingStream) -> StreamToken {
        info!("stream {} from {from} started", stream.id());
        Box::new(())
    }

    async fn on_stream_end(&self, from: &str, _token: StreamToken) {
        info!("stream from {from} ended");
    }

    async fn on_file_reception(&self, from: &str, file: ReceivedFile, correlation: Value) {
        info!(
            "file {} ({} bytes, {}) from {from}, data={correlation}",
            file.name,
            file.data.len(),
            file.mime
        );
    }
}

/// Обработчик, который оставляет логирование по умолчанию
#[derive(Debug, Default, Clone, Copy)]
pub struct LoggingHandler;

impl SessionHandler for LoggingHandler {}

impl MeshHandler for LoggingHandler {}
