use crate::peer::types::ServerConfig;
use rand::Rng;

pub fn random_id() -> String {
    hex::encode(rand::rng().random::<[u8; 8]>())
}

// Функция для добавления схемы протокола к URL ICE сервера, если она отсутствует
pub fn add_ice_url_scheme(config: &ServerConfig) -> String {
    if config.url.starts_with("turn:") || config.url.starts_with("stun:") {
        config.url.clone()
    } else {
        let scheme = if config.r#type == "turn" {
            "turn:"
        } else {
            "stun:"
        };
        format!("{}{}", scheme, config.url)
    }
}

/// Отображаемый id сессии: 24 бита, little-endian, 6 hex-символов в верхнем регистре
pub fn display_session_id(raw: u32) -> String {
    hex::encode_upper(&raw.to_le_bytes()[..3])
}

/// Обратное преобразование; `None` при неверном формате
pub fn parse_session_id(display: &str) -> Option<u32> {
    let bytes = hex::decode(display).ok()?;
    if bytes.len() != 3 {
        return None;
    }
    Some(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], 0]))
}
