// Конфигурация сессий, mesh-сети и сервера.
// Уровень логирования по умолчанию зависит от профиля сборки.

use crate::error::MeshError;
use crate::peer::types::ServerConfig;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::time::Duration;

#[cfg(debug_assertions)]
pub const DEFAULT_LOG_FILTER: &str = "ssc_mesh=debug,info"; // в debug логируем протокол подробно

#[cfg(not(debug_assertions))]
pub const DEFAULT_LOG_FILTER: &str = "warn"; // в релизе только предупреждения

/// Размер чанка при передаче файла (меньше типичного лимита сообщения SCTP)
pub const FILE_CHUNK_SIZE: usize = 16_000;

/// Настройки клиента rendezvous-сессии
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct SessionConfig {
    /// Сколько ждать ответа на `ask`
    pub request_timeout_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            request_timeout_ms: 30_000,
        }
    }
}

impl SessionConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

/// Настройки mesh-сети
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct MeshConfig {
    /// Пользовательские ICE серверы; пусто = публичные STUN по умолчанию
    pub ice_servers: Vec<ServerConfig>,
    /// Ожидание открытия control-канала при bootstrap
    pub bootstrap_timeout_ms: u64,
    /// Ожидание подтверждений при передаче файла
    pub ack_timeout_ms: u64,
    /// Ожидание ответа на `ask` по прямому каналу
    pub request_timeout_ms: u64,
    pub chunk_size: usize,
}

impl Default for MeshConfig {
    fn default() -> Self {
        Self {
            ice_servers: Vec::new(),
            bootstrap_timeout_ms: 20_000,
            ack_timeout_ms: 30_000,
            request_timeout_ms: 30_000,
            chunk_size: FILE_CHUNK_SIZE,
        }
    }
}

impl MeshConfig {
    pub fn bootstrap_timeout(&self) -> Duration {
        Duration::from_millis(self.bootstrap_timeout_ms)
    }

    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }

    /// Проверка ICE серверов: URL не пустой, TURN требует логин и пароль
    pub fn validate(&self) -> Result<(), MeshError> {
        if self.chunk_size == 0 {
            return Err(MeshError::Config("chunk size must be positive".into()));
        }
        for server in &self.ice_servers {
            if server.url.is_empty() {
                return Err(MeshError::Config(format!(
                    "ICE server {} has an empty URL",
                    server.id
                )));
            }
            if server.r#type == "turn" && (server.username.is_none() || server.credential.is_none())
            {
                return Err(MeshError::Config(format!(
                    "TURN server {} requires username and credential",
                    server.id
                )));
            }
        }
        Ok(())
    }
}

/// Настройки rendezvous-сервера
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct ServerOptions {
    pub bind: SocketAddr,
    /// Имя пользователя короче этого значения (и не пустое)
    pub max_username_len: usize,
    /// Попыток выделить свободный id сессии
    pub id_alloc_attempts: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 1234)),
            max_username_len: 30,
            id_alloc_attempts: 20,
        }
    }
}
