//! Rendezvous-сервер
//!
//! Сессии живут в пределах имени приложения, адресуются 24-битным id.
//! Сервер только маршрутизирует фреймы между участниками и не заглядывает
//! внутрь `message`.

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{accept_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::config::ServerOptions;
use crate::signaling::{ClientFrame, ServerFrame};
use crate::utils::{display_session_id, parse_session_id};

/// Ошибки, которые клиент получает как `{"error": "<Kind>: <detail>", "id"}`
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RoomError {
    #[error("IdNotFound: {0}")]
    IdNotFound(String),
    #[error("InvalidPassword: {0}")]
    InvalidPassword(String),
    #[error("InvalidUsername: {0}")]
    InvalidUsername(String),
    #[error("AlreadyConnected: {0}")]
    AlreadyConnected(String),
    #[error("NotConnected: {0}")]
    NotConnected(String),
    #[error("BadRequest: {0}")]
    BadRequest(String),
}

type Outbox = mpsc::UnboundedSender<String>;

struct Member {
    username: String,
    outbox: Outbox,
}

struct Room {
    password: String,
    members: Vec<Member>,
}

impl Room {
    fn usernames(&self) -> Vec<String> {
        self.members.iter().map(|m| m.username.clone()).collect()
    }

    fn member(&self, username: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.username == username)
    }

    fn broadcast(&self, frame: &ServerFrame, except: Option<&str>) {
        let Some(text) = encode(frame) else { return };
        for member in &self.members {
            if Some(member.username.as_str()) != except {
                let _ = member.outbox.send(text.clone());
            }
        }
    }
}

fn encode(frame: &ServerFrame) -> Option<String> {
    match serde_json::to_string(frame) {
        Ok(text) => Some(text),
        Err(e) => {
            warn!("cannot encode frame: {e}");
            None
        }
    }
}

/// Где находится соединение после create или join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Membership {
    pub appname: String,
    pub room: u32,
    pub username: String,
}

/// Все сессии: по имени приложения, затем по сырому id сессии
#[derive(Clone, Default)]
pub struct Registry {
    apps: Arc<Mutex<HashMap<String, HashMap<u32, Room>>>>,
    options: Arc<ServerOptions>,
}

impl Registry {
    pub fn new(options: ServerOptions) -> Self {
        Self {
            apps: Arc::default(),
            options: Arc::new(options),
        }
    }

    /// Число живых сессий для `appname`
    pub fn session_count(&self, appname: &str) -> usize {
        self.apps.lock().get(appname).map_or(0, HashMap::len)
    }

    fn check_username(&self, username: &str) -> Result<(), RoomError> {
        let len = username.chars().count();
        if len == 0 || len >= self.options.max_username_len {
            return Err(RoomError::InvalidUsername(
                "The username cannot be empty nor too big.".into(),
            ));
        }
        Ok(())
    }

    /// Применяет один фрейм клиента для соединения, владеющего `outbox`.
    pub fn handle(
        &self,
        frame: ClientFrame,
        membership: &mut Option<Membership>,
        outbox: &Outbox,
    ) -> Result<(), RoomError> {
        match frame {
            ClientFrame::Create {
                appname,
                password,
                username,
            } => {
                already_connected(membership)?;
                self.check_username(&username)?;
                let joined = self.create(&appname, password, &username, outbox)?;
                *membership = Some(joined);
                Ok(())
            }
            ClientFrame::Join {
                id,
                appname,
                password,
                username,
            } => {
                already_connected(membership)?;
                let joined = self.join(&id, &appname, &password, &username, outbox)?;
                *membership = Some(joined);
                Ok(())
            }
            ClientFrame::Send { user, message } => {
                let me = connected(membership)?;
                self.with_room(me, |room| {
                    let frame = ServerFrame::Message {
                        message,
                        from: me.username.clone(),
                    };
                    match user {
                        None => room.broadcast(&frame, None),
                        Some(user) => match (room.member(&user), encode(&frame)) {
                            (Some(target), Some(text)) => {
                                let _ = target.outbox.send(text);
                            }
                            // неизвестный адресат: сообщение молча отбрасывается
                            _ => debug!(to = %user, "dropping message for unknown user"),
                        },
                    }
                    Ok(())
                })
            }
            ClientFrame::Request { user, message, id } => {
                let me = connected(membership)?;
                let user =
                    user.ok_or_else(|| RoomError::InvalidUsername("Cannot broadcast a request.".into()))?;
                self.forward(
                    me,
                    &user,
                    ServerFrame::Request {
                        request: message,
                        from: me.username.clone(),
                        id,
                    },
                )
            }
            ClientFrame::Response { user, message, id } => {
                let me = connected(membership)?;
                self.forward(
                    me,
                    &user,
                    ServerFrame::Response {
                        response: message,
                        from: Some(me.username.clone()),
                        id,
                    },
                )
            }
            ClientFrame::Error { user, message, id } => {
                let me = connected(membership)?;
                self.forward(
                    me,
                    &user,
                    ServerFrame::Error {
                        error: message,
                        from: Some(me.username.clone()),
                        id: Some(id),
                    },
                )
            }
            ClientFrame::Leave => {
                let me = membership
                    .take()
                    .ok_or_else(|| RoomError::NotConnected("Not connected to any session.".into()))?;
                self.leave(&me);
                Ok(())
            }
        }
    }

    fn create(
        &self,
        appname: &str,
        password: String,
        username: &str,
        outbox: &Outbox,
    ) -> Result<Membership, RoomError> {
        let mut apps = self.apps.lock();
        let rooms = apps.entry(appname.to_string()).or_default();

        let mut rng = rand::rng();
        let room_id = (0..self.options.id_alloc_attempts)
            .map(|_| rng.random::<u32>() & 0x00FF_FFFF)
            .find(|id| !rooms.contains_key(id))
            .ok_or_else(|| {
                RoomError::IdNotFound("Could not find a non-allocated ID for a new session.".into())
            })?;

        let room = Room {
            password,
            members: vec![Member {
                username: username.to_string(),
                outbox: outbox.clone(),
            }],
        };
        let welcome = ServerFrame::Welcome {
            id: display_session_id(room_id),
            users: room.usernames(),
        };
        rooms.insert(room_id, room);
        info!(app = appname, session = %display_session_id(room_id), user = username, "session created");

        if let Some(text) = encode(&welcome) {
            let _ = outbox.send(text);
        }
        Ok(Membership {
            appname: appname.to_string(),
            room: room_id,
            username: username.to_string(),
        })
    }

    fn join(
        &self,
        display_id: &str,
        appname: &str,
        password: &str,
        username: &str,
        outbox: &Outbox,
    ) -> Result<Membership, RoomError> {
        let room_id = parse_session_id(display_id)
            .ok_or_else(|| RoomError::IdNotFound(format!("Bad format of session ID: {display_id}.")))?;

        let mut apps = self.apps.lock();
        let rooms = apps.get_mut(appname).ok_or_else(|| {
            RoomError::IdNotFound(format!("Could not find session for app {appname}."))
        })?;
        let room = rooms
            .get_mut(&room_id)
            .ok_or_else(|| RoomError::IdNotFound(format!("Could not find session #{display_id}.")))?;
        if room.password != password {
            return Err(RoomError::InvalidPassword("Invalid password.".into()));
        }
        self.check_username(username)?;
        if room.member(username).is_some() {
            return Err(RoomError::InvalidUsername(format!(
                "{username} is already connected to session #{}.",
                display_session_id(room_id)
            )));
        }

        room.members.push(Member {
            username: username.to_string(),
            outbox: outbox.clone(),
        });
        let users = room.usernames();
        info!(app = appname, session = %display_session_id(room_id), user = username, "joined");

        room.broadcast(
            &ServerFrame::Joined {
                joined: username.to_string(),
                users: users.clone(),
            },
            Some(username),
        );
        if let Some(text) = encode(&ServerFrame::Welcome {
            id: display_session_id(room_id),
            users,
        }) {
            let _ = outbox.send(text);
        }
        Ok(Membership {
            appname: appname.to_string(),
            room: room_id,
            username: username.to_string(),
        })
    }

    fn with_room<T>(
        &self,
        me: &Membership,
        f: impl FnOnce(&Room) -> Result<T, RoomError>,
    ) -> Result<T, RoomError> {
        let apps = self.apps.lock();
        let room = apps
            .get(&me.appname)
            .and_then(|rooms| rooms.get(&me.room))
            .ok_or_else(|| RoomError::NotConnected("Session no longer exists.".into()))?;
        f(room)
    }

    fn forward(&self, me: &Membership, user: &str, frame: ServerFrame) -> Result<(), RoomError> {
        self.with_room(me, |room| {
            let target = room
                .member(user)
                .ok_or_else(|| RoomError::InvalidUsername(format!("Unknown user '{user}'.")))?;
            if let Some(text) = encode(&frame) {
                let _ = target.outbox.send(text);
            }
            Ok(())
        })
    }

    /// Удаляет участника; последний вышедший удаляет сессию.
    pub fn leave(&self, me: &Membership) {
        let mut apps = self.apps.lock();
        let Some(rooms) = apps.get_mut(&me.appname) else {
            return;
        };
        let Some(room) = rooms.get_mut(&me.room) else {
            return;
        };
        room.members.retain(|m| m.username != me.username);
        info!(session = %display_session_id(me.room), user = %me.username, "left");

        if room.members.is_empty() {
            rooms.remove(&me.room);
            info!(session = %display_session_id(me.room), "session is empty, removed");
            if rooms.is_empty() {
                apps.remove(&me.appname);
            }
        } else {
            room.broadcast(
                &ServerFrame::Left {
                    left: me.username.clone(),
                    users: room.usernames(),
                },
                None,
            );
        }
    }
}

fn already_connected(membership: &Option<Membership>) -> Result<(), RoomError> {
    match membership {
        Some(m) => Err(RoomError::AlreadyConnected(format!(
            "Already connected to session #{} as {}.",
            display_session_id(m.room),
            m.username
        ))),
        None => Ok(()),
    }
}

fn connected(membership: &Option<Membership>) -> Result<&Membership, RoomError> {
    membership
        .as_ref()
        .ok_or_else(|| RoomError::NotConnected("Not connected to any session.".into()))
}

/// Ответ с ошибкой на сырой фрейм. Id сохраняет только `request`: id у
/// `response` и `error` принадлежит спросившему пиру, а не отправителю.
fn error_reply(text: &str, err: &RoomError) -> Option<String> {
    let id = serde_json::from_str::<Value>(text)
        .ok()
        .filter(|v| v.get("action").and_then(Value::as_str) == Some("request"))
        .and_then(|v| v.get("id").and_then(Value::as_u64));
    encode(&ServerFrame::error(err.to_string(), id))
}

pub struct RendezvousServer {
    listener: TcpListener,
    registry: Registry,
}

impl RendezvousServer {
    pub async fn bind(options: ServerOptions) -> io::Result<Self> {
        let listener = TcpListener::bind(options.bind).await?;
        Ok(Self {
            listener,
            registry: Registry::new(options),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub fn registry(&self) -> Registry {
        self.registry.clone()
    }

    pub async fn run(self) {
        if let Ok(addr) = self.local_addr() {
            info!("rendezvous server listening on ws://{addr}");
        }
        loop {
            match self.listener.accept().await {
                Ok((stream, addr)) => {
                    let registry = self.registry.clone();
                    tokio::spawn(handle_connection(stream, addr, registry));
                }
                Err(e) => warn!("accept failed: {e}"),
            }
        }
    }

    pub fn spawn(self) -> JoinHandle<()> {
        tokio::spawn(self.run())
    }
}

async fn handle_connection(stream: TcpStream, addr: SocketAddr, registry: Registry) {
    let ws = match accept_async(stream).await {
        Ok(ws) => ws,
        Err(e) => {
            debug!(%addr, "websocket handshake failed: {e}");
            return;
        }
    };
    let (mut write, mut read) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if write.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = write.close().await;
    });

    let mut membership: Option<Membership> = None;
    while let Some(msg) = read.next().await {
        let text = match msg {
            Ok(Message::Text(text)) => text,
            Ok(Message::Close(_)) => break,
            Ok(_) => continue,
            Err(e) => {
                debug!(%addr, "connection error: {e}");
                break;
            }
        };
        let result = serde_json::from_str::<ClientFrame>(&text)
            .map_err(|e| RoomError::BadRequest(e.to_string()))
            .and_then(|frame| registry.handle(frame, &mut membership, &tx));
        if let Err(err) = result {
            debug!(%addr, "{err}");
            if let Some(reply) = error_reply(&text, &err) {
                let _ = tx.send(reply);
            }
        }
    }

    if let Some(me) = membership.take() {
        registry.leave(&me);
    }
    drop(tx);
    let _ = writer.await;
}
