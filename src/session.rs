//! Клиент rendezvous-сессии
//!
//! Один websocket до rendezvous-сервера несёт unicast и broadcast сообщения
//! и связанные пары запрос/ответ. Входящие фреймы разбираются строго по
//! порядку одной задачей; `on_request` идёт в своей задаче, чтобы мог
//! ждать, а его результат отправляется ровно один раз.

use futures_util::{SinkExt, StreamExt};
use parking_lot::{Mutex, RwLock};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::SessionConfig;
use crate::error::SessionError;
use crate::events::{LoggingHandler, SessionHandler};
use crate::signaling::{describe_error, ClientFrame, Recipient, ServerFrame};

/// Создать новую сессию или войти в существующую
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionMode {
    Create,
    Join(String),
}

#[derive(Debug, Clone)]
pub struct SessionOptions {
    /// `ws://host:port`
    pub endpoint: String,
    pub appname: String,
    pub password: String,
    pub username: String,
    pub mode: SessionMode,
    pub config: SessionConfig,
}

impl SessionOptions {
    pub fn create(endpoint: &str, appname: &str, password: &str, username: &str) -> Self {
        Self {
            endpoint: endpoint.to_string(),
            appname: appname.to_string(),
            password: password.to_string(),
            username: username.to_string(),
            mode: SessionMode::Create,
            config: SessionConfig::default(),
        }
    }

    pub fn join(
        endpoint: &str,
        appname: &str,
        session_id: &str,
        password: &str,
        username: &str,
    ) -> Self {
        Self {
            mode: SessionMode::Join(session_id.to_string()),
            ..Self::create(endpoint, appname, password, username)
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    fn hello(&self) -> ClientFrame {
        match &self.mode {
            SessionMode::Create => ClientFrame::Create {
                appname: self.appname.clone(),
                password: self.password.clone(),
                username: self.username.clone(),
            },
            SessionMode::Join(id) => ClientFrame::Join {
                id: id.clone(),
                appname: self.appname.clone(),
                password: self.password.clone(),
                username: self.username.clone(),
            },
        }
    }
}

type Pending = HashMap<u64, oneshot::Sender<Result<Value, SessionError>>>;

struct SessionInner {
    id: String,
    username: String,
    config: SessionConfig,
    users: Mutex<Vec<String>>,
    welcome_users: Vec<String>,
    outbound: mpsc::UnboundedSender<ClientFrame>,
    pending: Mutex<Pending>,
    next_request_id: AtomicU64,
    handler: RwLock<Arc<dyn SessionHandler>>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// Handle живой rendezvous-сессии; клоны делят одно соединение
#[derive(Clone)]
pub struct Session {
    inner: Arc<SessionInner>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.inner.id)
            .field("username", &self.inner.username)
            .finish()
    }
}

impl Session {
    pub async fn create(
        endpoint: &str,
        appname: &str,
        password: &str,
        username: &str,
    ) -> Result<Self, SessionError> {
        let opts = SessionOptions::create(endpoint, appname, password, username);
        Self::connect(opts, Arc::new(LoggingHandler)).await
    }

    pub async fn join(
        endpoint: &str,
        appname: &str,
        session_id: &str,
        password: &str,
        username: &str,
    ) -> Result<Self, SessionError> {
        let opts = SessionOptions::join(endpoint, appname, session_id, password, username);
        Self::connect(opts, Arc::new(LoggingHandler)).await
    }

    /// Handshake; `handler` стоит до разбора первого фрейма.
    pub async fn connect(
        opts: SessionOptions,
        handler: Arc<dyn SessionHandler>,
    ) -> Result<Self, SessionError> {
        let (ws, _) = connect_async(opts.endpoint.as_str())
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;
        let (mut write, mut read) = ws.split();

        let hello = serde_json::to_string(&opts.hello())?;
        write
            .send(Message::Text(hello.into()))
            .await
            .map_err(|e| SessionError::Connection(e.to_string()))?;

        let (id, users) = loop {
            let text = match read.next().await {
                Some(Ok(Message::Text(text))) => text,
                Some(Ok(Message::Close(_))) | None => {
                    return Err(SessionError::Connection(
                        "closed during handshake".into(),
                    ))
                }
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(SessionError::Connection(e.to_string())),
            };
            let frame = serde_json::from_str::<ServerFrame>(&text)
                .map_err(|e| SessionError::Connection(format!("bad handshake reply: {e}")))?;
            match frame {
                ServerFrame::Welcome { id, users } => break (id, users),
                ServerFrame::Error { error, .. } => {
                    return Err(SessionError::from_handshake(&describe_error(&error)))
                }
                other => {
                    return Err(SessionError::Connection(format!(
                        "unexpected handshake frame: {other:?}"
                    )))
                }
            }
        };
        info!(session = %id, user = %opts.username, "joined rendezvous session");

        let (tx, mut rx) = mpsc::unbounded_channel::<ClientFrame>();
        tokio::spawn(async move {
            while let Some(frame) = rx.recv().await {
                let leaving = matches!(frame, ClientFrame::Leave);
                let text = match serde_json::to_string(&frame) {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("cannot encode frame: {e}");
                        continue;
                    }
                };
                if let Err(e) = write.send(Message::Text(text.into())).await {
                    debug!("rendezvous write failed: {e}");
                    break;
                }
                if leaving {
                    let _ = write.close().await;
                    break;
                }
            }
        });

        let inner = Arc::new(SessionInner {
            id,
            username: opts.username,
            config: opts.config,
            users: Mutex::new(users.clone()),
            welcome_users: users,
            outbound: tx,
            pending: Mutex::new(HashMap::new()),
            next_request_id: AtomicU64::new(1),
            handler: RwLock::new(handler),
            closed: AtomicBool::new(false),
            reader: Mutex::new(None),
        });

        let dispatcher = inner.clone();
        let reader = tokio::spawn(async move {
            let reason = loop {
                match read.next().await {
                    Some(Ok(Message::Text(text))) => match serde_json::from_str::<ServerFrame>(&text) {
                        Ok(frame) => dispatcher.dispatch(frame).await,
                        Err(e) => debug!("ignoring malformed frame: {e}"),
                    },
                    Some(Ok(Message::Close(_))) | None => {
                        break SessionError::Connection("rendezvous connection closed".into())
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => break SessionError::Connection(e.to_string()),
                }
            };
            dispatcher.fail(reason).await;
        });
        *inner.reader.lock() = Some(reader);

        Ok(Self { inner })
    }

    /// Id сессии в виде для пользователя (6 hex-символов)
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Участники в порядке прихода, включая себя
    pub fn users(&self) -> Vec<String> {
        self.inner.users.lock().clone()
    }

    /// Участники, как их сообщил сервер в конце handshake
    pub fn initial_users(&self) -> &[String] {
        &self.inner.welcome_users
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Меняет обработчик; действует со следующего фрейма.
    pub fn set_handler(&self, handler: Arc<dyn SessionHandler>) {
        *self.inner.handler.write() = handler;
    }

    /// Без ответа. Неизвестных адресатов сервер отбрасывает.
    pub fn send(&self, to: Recipient, message: Value) -> Result<(), SessionError> {
        self.inner.push(ClientFrame::send(to, message))
    }

    /// Запрос/ответ с одним участником. Ограничен таймаутом запроса;
    /// если future бросить, запрос забывается.
    pub async fn ask(&self, user: &str, message: Value) -> Result<Value, SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        let id = self.inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.inner.pending.lock().insert(id, tx);
        let _guard = PendingGuard {
            inner: &self.inner,
            id,
        };

        self.inner.push(ClientFrame::Request {
            user: Some(user.to_string()),
            message,
            id,
        })?;

        match timeout(self.inner.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(SessionError::Closed),
            Err(_) => Err(SessionError::Timeout(id)),
        }
    }

    /// Шлёт `leave` и освобождает соединение. Колбэков после этого нет.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(reader) = self.inner.reader.lock().take() {
            reader.abort();
        }
        let _ = self.inner.outbound.send(ClientFrame::Leave);
        self.inner.reject_all(SessionError::Closed);
        info!(session = %self.inner.id, user = %self.inner.username, "left rendezvous session");
    }
}

struct PendingGuard<'a> {
    inner: &'a SessionInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

impl SessionInner {
    fn push(&self, frame: ClientFrame) -> Result<(), SessionError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(SessionError::Closed);
        }
        self.outbound.send(frame).map_err(|_| SessionError::Closed)
    }

    fn handler(&self) -> Arc<dyn SessionHandler> {
        self.handler.read().clone()
    }

    fn resolve(&self, id: u64, result: Result<Value, SessionError>) {
        match self.pending.lock().remove(&id) {
            Some(waiter) => {
                let _ = waiter.send(result);
            }
            None => debug!(id, "reply for unknown request"),
        }
    }

    fn reject_all(&self, error: SessionError) {
        let waiters: Vec<_> = self.pending.lock().drain().collect();
        for (_, waiter) in waiters {
            let _ = waiter.send(Err(error.clone()));
        }
    }

    async fn dispatch(&self, frame: ServerFrame) {
        if self.closed.load(Ordering::SeqCst) {
            return;
        }
        match frame {
            ServerFrame::Request { request, from, id } => {
                let handler = self.handler();
                let outbound = self.outbound.clone();
                tokio::spawn(async move {
                    let reply = match handler.on_request(&from, request).await {
                        Ok(message) => ClientFrame::Response {
                            user: from,
                            message,
                            id,
                        },
                        Err(reason) => ClientFrame::Error {
                            user: from,
                            message: Value::String(reason),
                            id,
                        },
                    };
                    let _ = outbound.send(reply);
                });
            }
            ServerFrame::Response { response, id, .. } => self.resolve(id, Ok(response)),
            ServerFrame::Error {
                error, id: Some(id), ..
            } => self.resolve(id, Err(SessionError::RemoteRequest(describe_error(&error)))),
            ServerFrame::Error { error, id: None, .. } => {
                self.handler().on_error(&describe_error(&error)).await
            }
            ServerFrame::Message { message, from } => {
                self.handler().on_reception(&from, message).await
            }
            ServerFrame::Joined { joined, users } => {
                *self.users.lock() = users;
                self.handler().on_join(&joined).await;
            }
            ServerFrame::Left { left, users } => {
                *self.users.lock() = users;
                self.handler().on_leave(&left).await;
            }
            ServerFrame::Welcome { .. } => debug!("ignoring repeated welcome"),
        }
    }

    /// Транспорт потерян после handshake
    async fn fail(&self, reason: SessionError) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(session = %self.id, "rendezvous connection lost: {reason}");
        self.reject_all(SessionError::Closed);
        self.handler().on_fatal_error(&reason).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_options_carry_session_id() {
        let opts = SessionOptions::join("ws://x", "app", "ABCDEF", "pw", "bob");
        assert_eq!(
            opts.hello(),
            ClientFrame::Join {
                id: "ABCDEF".into(),
                appname: "app".into(),
                password: "pw".into(),
                username: "bob".into(),
            }
        );
        assert_eq!(
            SessionOptions::create("ws://x", "app", "pw", "amy").mode,
            SessionMode::Create
        );
    }

    #[tokio::test]
    async fn unreachable_endpoint_is_a_connection_error() {
        let err = Session::create("ws://127.0.0.1:9", "app", "pw", "amy")
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Connection(_)));
    }
}
