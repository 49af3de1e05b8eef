//! Протокол rendezvous
//!
//! JSON-фреймы, которыми клиент обменивается с rendezvous-сервером, и
//! метаданные согласования, которые mesh кладёт в тело `message`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::peer::types::{IceCandidate, SessionDescription};

/// Адресат отправки без ответа
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Recipient {
    User(String),
    /// Все участники, включая отправителя
    Broadcast,
}

impl Recipient {
    pub fn user(name: impl Into<String>) -> Self {
        Recipient::User(name.into())
    }

    fn into_wire(self) -> Option<String> {
        match self {
            Recipient::User(name) => Some(name),
            Recipient::Broadcast => None,
        }
    }
}

impl From<&str> for Recipient {
    fn from(name: &str) -> Self {
        Recipient::User(name.to_string())
    }
}

impl From<Option<String>> for Recipient {
    fn from(name: Option<String>) -> Self {
        match name {
            Some(name) => Recipient::User(name),
            None => Recipient::Broadcast,
        }
    }
}

/// client → server
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "action", rename_all = "lowercase")]
pub enum ClientFrame {
    Create {
        appname: String,
        password: String,
        username: String,
    },
    Join {
        id: String,
        appname: String,
        password: String,
        username: String,
    },
    Send {
        user: Option<String>,
        message: Value,
    },
    Request {
        user: Option<String>,
        message: Value,
        id: u64,
    },
    Response {
        user: String,
        message: Value,
        id: u64,
    },
    Error {
        user: String,
        message: Value,
        id: u64,
    },
    Leave,
}

impl ClientFrame {
    pub fn send(to: Recipient, message: Value) -> Self {
        ClientFrame::Send {
            user: to.into_wire(),
            message,
        }
    }
}

/// server → client
///
/// Категория фрейма определяется ключом, под которым лежит его содержимое,
/// поэтому enum сопоставляется по структуре (`untagged`). Порядок вариантов
/// важен: побеждает первый, у которого есть все обязательные ключи.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(untagged)]
pub enum ServerFrame {
    Request {
        request: Value,
        from: String,
        id: u64,
    },
    Response {
        response: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        id: u64,
    },
    Error {
        error: Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        from: Option<String>,
        #[serde(default)]
        id: Option<u64>,
    },
    Message {
        message: Value,
        from: String,
    },
    Joined {
        joined: String,
        users: Vec<String>,
    },
    Left {
        left: String,
        users: Vec<String>,
    },
    /// Успешный handshake
    Welcome {
        id: String,
        users: Vec<String>,
    },
}

impl ServerFrame {
    pub fn error(reason: impl Into<String>, id: Option<u64>) -> Self {
        ServerFrame::Error {
            error: Value::String(reason.into()),
            from: None,
            id,
        }
    }
}

/// Текст ошибки для людей; строки берутся как есть.
pub fn describe_error(error: &Value) -> String {
    match error {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// Метаданные согласования внутри `message` rendezvous-фреймов
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub enum SignalPayload {
    /// Trickle-кандидат, `null` в конце сбора; уходит через `send`
    #[serde(rename = "_ice")]
    Ice(Option<IceCandidate>),
    /// Offer или answer; идёт через `ask`, ответ `null` значит проигнорирован
    #[serde(rename = "_description")]
    Description(SessionDescription),
}

impl SignalPayload {
    /// `None` для прикладных данных, которые не относятся к согласованию.
    pub fn parse(message: &Value) -> Option<Self> {
        serde_json::from_value(message.clone()).ok()
    }

    pub fn to_value(&self) -> Value {
        serde_json::to_value(self).unwrap_or(Value::Null)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn parse(v: Value) -> ServerFrame {
        serde_json::from_value(v).unwrap()
    }

    #[test]
    fn client_frames_use_action_tag() {
        let f = ClientFrame::send(Recipient::Broadcast, json!({"chat": "hi"}));
        assert_eq!(
            serde_json::to_value(&f).unwrap(),
            json!({"action": "send", "user": null, "message": {"chat": "hi"}})
        );
        assert_eq!(
            serde_json::to_value(&ClientFrame::Leave).unwrap(),
            json!({"action": "leave"})
        );
    }

    #[test]
    fn server_frames_are_told_apart_by_keys() {
        assert!(matches!(
            parse(json!({"request": 1, "from": "a", "id": 3})),
            ServerFrame::Request { id: 3, .. }
        ));
        assert!(matches!(
            parse(json!({"response": null, "from": "a", "id": 4})),
            ServerFrame::Response { response: Value::Null, id: 4, .. }
        ));
        assert!(matches!(
            parse(json!({"error": "IdNotFound: x", "id": null})),
            ServerFrame::Error { id: None, .. }
        ));
        assert!(matches!(
            parse(json!({"message": "hey", "from": "b"})),
            ServerFrame::Message { .. }
        ));
        assert!(matches!(
            parse(json!({"joined": "c", "users": ["a", "c"]})),
            ServerFrame::Joined { .. }
        ));
        assert!(matches!(
            parse(json!({"left": "c", "users": ["a"]})),
            ServerFrame::Left { .. }
        ));
        assert!(matches!(
            parse(json!({"id": "ABCDEF", "users": ["a"]})),
            ServerFrame::Welcome { .. }
        ));
    }

    #[test]
    fn unknown_shapes_do_not_parse() {
        assert!(serde_json::from_value::<ServerFrame>(json!({"hello": 1})).is_err());
    }

    #[test]
    fn negotiation_payloads_are_keyed() {
        let ice = SignalPayload::Ice(None);
        assert_eq!(ice.to_value(), json!({"_ice": null}));
        let desc = SignalPayload::Description(SessionDescription::answer("v=0"));
        assert_eq!(
            desc.to_value(),
            json!({"_description": {"type": "answer", "sdp": "v=0"}})
        );
        assert_eq!(SignalPayload::parse(&json!({"chat": "hi"})), None);
        assert_eq!(SignalPayload::parse(&json!({"_ice": null})), Some(ice));
    }
}
