//! Mesh-сеть поверх rendezvous-сессии
//!
//! Сессия несёт только метаданные согласования: ICE кандидаты (`send`)
//! и offer/answer (`ask`). Каждый участник держит одно прямое соединение
//! с каждым другим: control-канал для сообщений, запросов и учёта потоков
//! плюс отдельный временный канал на каждую передачу файла.
//!
//! Соединение инициирует новичок (impolite), участник, уже бывший в сессии,
//! принимает его (polite). События транспорта, каналов и rendezvous идут в
//! одну очередь с единственным диспетчером, поэтому колбэки приложения не
//! пересекаются. Только `on_request` выполняется в отдельной задаче.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::{AbortHandle, JoinHandle};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::config::MeshConfig;
use crate::error::{MeshError, SessionError, TransportError};
use crate::events::{LoggingHandler, MeshHandler, SessionHandler, StreamToken};
use crate::peer::data_channel::ControlFrame;
use crate::peer::file_transfer::{
    receive_file, send_file, Direction, OutgoingFile, ReceivedFile, TransferProgress,
    TransferSnapshot,
};
use crate::peer::ice::{CandidateStats, PendingCandidates};
use crate::peer::negotiation::{interpret_reply, Negotiator, OfferDecision, OfferGuard};
use crate::peer::transport::{
    Channel, ChannelEvent, ConnectionEvent, ConnectionFactory, DataChannel, DirectConnection,
    CONTROL_LABEL, FILE_LABEL_PREFIX,
};
use crate::peer::types::{IncomingStream, LinkState, MediaStream, Role, SdpType, SessionDescription};
use crate::session::{Session, SessionOptions};
use crate::signaling::{Recipient, SignalPayload};
use crate::utils::random_id;

/// Итог подключения к одному участнику при bootstrap
#[derive(Debug, Clone, PartialEq)]
pub struct BootstrapOutcome {
    pub user: String,
    pub result: Result<(), MeshError>,
}

/// Снимок состояния одного удалённого пира
#[derive(Serialize, Debug, Clone)]
pub struct PeerSnapshot {
    pub username: String,
    pub role: Role,
    pub state: LinkState,
    pub initiator: bool,
    /// Входящие потоки
    pub streams: Vec<String>,
    /// Локальные потоки, подключённые к этому соединению
    pub sending: Vec<String>,
    pub transfers: Vec<TransferSnapshot>,
    pub candidates: CandidateStats,
    /// Чужие offer'ы, отброшенные при коллизии (impolite-сторона)
    pub ignored_offers: u64,
    /// Свои offer'ы, откаченные при коллизии (polite-сторона)
    pub yielded_offers: u64,
    pub connected_at: Option<DateTime<Utc>>,
}

enum MeshEvent {
    Connection {
        user: String,
        gen: u64,
        event: ConnectionEvent,
    },
    Control {
        user: String,
        gen: u64,
        event: ChannelEvent,
    },
    SignalJoin(String),
    SignalLeave(String),
    SignalReception {
        from: String,
        message: Value,
    },
    SignalError(String),
    SignalFatal(SessionError),
    LocalReception(Value),
    LocalStreamBegin(MediaStream),
    LocalStreamEnd(String),
    FileReceived {
        from: String,
        id: String,
        file: ReceivedFile,
        correlation: Value,
    },
    TransferDone {
        user: String,
        id: String,
    },
    TransferFailed {
        user: String,
        id: String,
        error: MeshError,
    },
    NegotiationFailed {
        user: String,
        gen: u64,
        error: MeshError,
    },
}

struct Transfer {
    progress: Arc<TransferProgress>,
    task: AbortHandle,
}

struct PeerEntry {
    connection: Arc<dyn DirectConnection>,
    role: Role,
    initiator: bool,
    /// Отличает переподключившегося пира от его прошлого соединения
    gen: u64,
    negotiator: Arc<Mutex<Negotiator>>,
    offer_lock: Arc<tokio::sync::Mutex<()>>,
    pending_candidates: Arc<PendingCandidates>,
    control: Option<Arc<dyn DataChannel>>,
    state: LinkState,
    streams: HashMap<String, StreamToken>,
    sending: HashSet<String>,
    transfers: HashMap<String, Transfer>,
    tasks: Vec<AbortHandle>,
    candidates: CandidateStats,
    connected_at: Option<DateTime<Utc>>,
}

impl PeerEntry {
    fn handle(&self) -> PeerHandle {
        PeerHandle {
            gen: self.gen,
            connection: self.connection.clone(),
            negotiator: self.negotiator.clone(),
            offer_lock: self.offer_lock.clone(),
            pending_candidates: self.pending_candidates.clone(),
        }
    }

    fn track(&mut self, task: AbortHandle) {
        self.tasks.retain(|t| !t.is_finished());
        self.tasks.push(task);
    }

    fn snapshot(&self, username: &str) -> PeerSnapshot {
        let mut streams: Vec<String> = self.streams.keys().cloned().collect();
        streams.sort();
        let mut sending: Vec<String> = self.sending.iter().cloned().collect();
        sending.sort();
        let (ignored_offers, yielded_offers) = {
            let n = self.negotiator.lock();
            (n.ignored_offers(), n.yielded_offers())
        };
        PeerSnapshot {
            username: username.to_string(),
            role: self.role,
            state: self.state,
            initiator: self.initiator,
            streams,
            sending,
            transfers: self
                .transfers
                .iter()
                .filter_map(|(id, t)| t.progress.snapshot(id))
                .collect(),
            candidates: self.candidates,
            ignored_offers,
            yielded_offers,
            connected_at: self.connected_at,
        }
    }
}

/// Всё, что нужно задаче для работы с соединением без блокировки состояния
#[derive(Clone)]
struct PeerHandle {
    gen: u64,
    connection: Arc<dyn DirectConnection>,
    negotiator: Arc<Mutex<Negotiator>>,
    offer_lock: Arc<tokio::sync::Mutex<()>>,
    pending_candidates: Arc<PendingCandidates>,
}

type BootstrapWaiter = oneshot::Sender<Result<(), MeshError>>;

#[derive(Default)]
struct MeshState {
    roster: Vec<String>,
    peers: HashMap<String, PeerEntry>,
    local_streams: HashMap<String, StreamToken>,
    waiters: HashMap<String, BootstrapWaiter>,
    closed: bool,
}

impl MeshState {
    fn entry_mut(&mut self, user: &str, gen: u64) -> Option<&mut PeerEntry> {
        self.peers.get_mut(user).filter(|e| e.gen == gen)
    }
}

struct PendingAsk {
    user: String,
    waiter: oneshot::Sender<Result<Value, MeshError>>,
}

struct MeshInner {
    username: String,
    session: Session,
    factory: Arc<dyn ConnectionFactory>,
    config: MeshConfig,
    state: Mutex<MeshState>,
    handler: RwLock<Arc<dyn MeshHandler>>,
    events: mpsc::UnboundedSender<MeshEvent>,
    next_gen: AtomicU64,
    next_request_id: AtomicU64,
    pending: Mutex<HashMap<u64, PendingAsk>>,
    dispatcher: Mutex<Option<JoinHandle<()>>>,
}

/// Обработчик сессии, который ставит mesh: превращает колбэки rendezvous
/// в события mesh и отвечает на offer'ы.
struct SignalRelay {
    events: mpsc::UnboundedSender<MeshEvent>,
    ready: watch::Sender<Option<Weak<MeshInner>>>,
}

impl SignalRelay {
    fn new(events: mpsc::UnboundedSender<MeshEvent>) -> Arc<Self> {
        let (ready, _) = watch::channel(None);
        Arc::new(Self { events, ready })
    }

    fn push(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    // offer может прийти раньше, чем mesh собран: ждём готовности
    async fn mesh(&self) -> Option<Arc<MeshInner>> {
        let mut ready = self.ready.subscribe();
        let weak = match ready.wait_for(Option::is_some).await {
            Ok(current) => (*current).clone(),
            Err(_) => return None,
        };
        weak?.upgrade()
    }
}

#[async_trait]
impl SessionHandler for SignalRelay {
    async fn on_reception(&self, from: &str, message: Value) {
        self.push(MeshEvent::SignalReception {
            from: from.to_string(),
            message,
        });
    }

    async fn on_request(&self, from: &str, message: Value) -> Result<Value, String> {
        let Some(SignalPayload::Description(desc)) = SignalPayload::parse(&message) else {
            return Err(format!("UNHANDLED request from {from}"));
        };
        let mesh = self.mesh().await.ok_or_else(|| "mesh is closed".to_string())?;
        mesh.answer(from, desc).await.map_err(|e| e.to_string())
    }

    async fn on_join(&self, user: &str) {
        self.push(MeshEvent::SignalJoin(user.to_string()));
    }

    async fn on_leave(&self, user: &str) {
        self.push(MeshEvent::SignalLeave(user.to_string()));
    }

    async fn on_error(&self, error: &str) {
        self.push(MeshEvent::SignalError(error.to_string()));
    }

    async fn on_fatal_error(&self, error: &SessionError) {
        self.push(MeshEvent::SignalFatal(error.clone()));
    }
}

/// Перекладывает очередь одного соединения в общую очередь mesh
fn spawn_pump<T, F>(
    mut rx: mpsc::UnboundedReceiver<T>,
    events: mpsc::UnboundedSender<MeshEvent>,
    wrap: F,
) -> AbortHandle
where
    T: Send + 'static,
    F: Fn(T) -> MeshEvent + Send + 'static,
{
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            if events.send(wrap(item)).is_err() {
                break;
            }
        }
    })
    .abort_handle()
}

/// Rendezvous-сессия, достроенная до полной сети прямых соединений
#[derive(Clone)]
pub struct PeerMesh {
    inner: Arc<MeshInner>,
    outcomes: Vec<BootstrapOutcome>,
}

impl std::fmt::Debug for PeerMesh {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PeerMesh")
            .field("id", &self.inner.session.id())
            .field("username", &self.inner.username)
            .field("users", &self.users())
            .finish()
    }
}

impl PeerMesh {
    /// Создаёт rendezvous-сессию и поднимает на ней mesh.
    pub async fn create(
        opts: SessionOptions,
        factory: Arc<dyn ConnectionFactory>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        Self::connect(opts, factory, config).await
    }

    /// Входит в rendezvous-сессию и подключается ко всем, кто уже в ней.
    pub async fn join(
        opts: SessionOptions,
        factory: Arc<dyn ConnectionFactory>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        Self::connect(opts, factory, config).await
    }

    async fn connect(
        opts: SessionOptions,
        factory: Arc<dyn ConnectionFactory>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = SignalRelay::new(tx.clone());
        let session = Session::connect(opts, relay.clone()).await?;
        let roster = session.initial_users().to_vec();
        Ok(Self::start(session, factory, config, relay, tx, rx, roster).await)
    }

    /// Забирает готовую сессию; её обработчик заменяется на mesh.
    pub async fn wrap(
        session: Session,
        factory: Arc<dyn ConnectionFactory>,
        config: MeshConfig,
    ) -> Result<Self, MeshError> {
        config.validate()?;
        let (tx, rx) = mpsc::unbounded_channel();
        let relay = SignalRelay::new(tx.clone());
        session.set_handler(relay.clone());
        let roster = session.users();
        Ok(Self::start(session, factory, config, relay, tx, rx, roster).await)
    }

    async fn start(
        session: Session,
        factory: Arc<dyn ConnectionFactory>,
        config: MeshConfig,
        relay: Arc<SignalRelay>,
        events: mpsc::UnboundedSender<MeshEvent>,
        rx: mpsc::UnboundedReceiver<MeshEvent>,
        roster: Vec<String>,
    ) -> Self {
        let username = session.username().to_string();
        let others: Vec<String> = roster.into_iter().filter(|u| *u != username).collect();

        let mut roster = others.clone();
        roster.push(username.clone());
        let state = MeshState {
            roster,
            ..MeshState::default()
        };

        let inner = Arc::new(MeshInner {
            username,
            session,
            factory,
            config,
            state: Mutex::new(state),
            handler: RwLock::new(Arc::new(LoggingHandler)),
            events,
            next_gen: AtomicU64::new(0),
            next_request_id: AtomicU64::new(1),
            pending: Mutex::new(HashMap::new()),
            dispatcher: Mutex::new(None),
        });
        relay.ready.send_replace(Some(Arc::downgrade(&inner)));

        let dispatcher = tokio::spawn(inner.clone().run(rx));
        *inner.dispatcher.lock() = Some(dispatcher);

        let outcomes = inner.bootstrap(others).await;
        for outcome in &outcomes {
            if let Err(e) = &outcome.result {
                warn!(peer = %outcome.user, "bootstrap failed: {e}");
            }
        }
        info!(
            session = %inner.session.id(),
            user = %inner.username,
            connected = outcomes.iter().filter(|o| o.result.is_ok()).count(),
            total = outcomes.len(),
            "mesh bootstrapped"
        );
        Self { inner, outcomes }
    }

    pub fn set_handler(&self, handler: Arc<dyn MeshHandler>) {
        *self.inner.handler.write() = handler;
    }

    pub fn username(&self) -> &str {
        &self.inner.username
    }

    /// Id rendezvous-сессии
    pub fn id(&self) -> &str {
        self.inner.session.id()
    }

    /// Участники в порядке прихода, включая себя
    pub fn users(&self) -> Vec<String> {
        self.inner.state.lock().roster.clone()
    }

    pub fn bootstrap_outcomes(&self) -> &[BootstrapOutcome] {
        &self.outcomes
    }

    /// Удалённые пиры в порядке списка участников
    pub fn peers(&self) -> Vec<PeerSnapshot> {
        let st = self.inner.state.lock();
        st.roster
            .iter()
            .filter_map(|user| st.peers.get(user).map(|e| e.snapshot(user)))
            .collect()
    }

    /// Отправка через control-каналы. Broadcast доходит до себя один раз, локально.
    /// Пользователь без записи пира игнорируется.
    pub async fn send(&self, to: Recipient, message: Value) -> Result<(), MeshError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let frame = ControlFrame::Message {
            message: message.clone(),
        }
        .encode()?;
        match to {
            Recipient::User(user) if user == inner.username => {
                inner.push(MeshEvent::LocalReception(message));
                Ok(())
            }
            Recipient::User(user) => {
                let Some(control) = inner.control_of(&user) else {
                    debug!(peer = %user, "no peer, message dropped");
                    return Ok(());
                };
                control.send(frame).await?;
                Ok(())
            }
            Recipient::Broadcast => {
                for (user, control) in inner.open_controls() {
                    if let Err(e) = control.send(frame.clone()).await {
                        warn!(peer = %user, "broadcast send failed: {e}");
                    }
                }
                inner.push(MeshEvent::LocalReception(message));
                Ok(())
            }
        }
    }

    /// Запрос/ответ через control-канал
    pub async fn ask(&self, user: &str, message: Value) -> Result<Value, MeshError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        if user == inner.username {
            return inner
                .handler()
                .on_request(user, message)
                .await
                .map_err(MeshError::RemoteRequest);
        }
        let control = inner
            .control_of(user)
            .ok_or_else(|| MeshError::UnknownPeer(user.to_string()))?;

        let id = inner.next_request_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        inner.pending.lock().insert(
            id,
            PendingAsk {
                user: user.to_string(),
                waiter: tx,
            },
        );
        let _guard = PendingGuard {
            inner: inner.as_ref(),
            id,
        };

        control
            .send(ControlFrame::Request { id, message }.encode()?)
            .await?;

        match timeout(inner.config.request_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::Closed),
            Err(_) => Err(MeshError::Timeout(format!("request {id} to {user}"))),
        }
    }

    /// Подключает локальный поток. Отправка себе вызывает `on_stream_begin` локально.
    pub async fn begin_stream(&self, to: Recipient, stream: MediaStream) -> Result<(), MeshError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        match to {
            Recipient::User(user) if user == inner.username => {
                inner.push(MeshEvent::LocalStreamBegin(stream));
                Ok(())
            }
            Recipient::User(user) => inner.attach_stream(&user, &stream).await,
            Recipient::Broadcast => {
                for user in inner.remote_users() {
                    if let Err(e) = inner.attach_stream(&user, &stream).await {
                        warn!(peer = %user, stream = %stream.id, "cannot attach stream: {e}");
                    }
                }
                inner.push(MeshEvent::LocalStreamBegin(stream));
                Ok(())
            }
        }
    }

    /// Отключает локальный поток и сообщает получателям. Неизвестные id игнорируются.
    pub async fn end_stream(&self, to: Recipient, stream_id: &str) -> Result<(), MeshError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        match to {
            Recipient::User(user) if user == inner.username => {
                inner.push(MeshEvent::LocalStreamEnd(stream_id.to_string()));
                Ok(())
            }
            Recipient::User(user) => inner.detach_stream(&user, stream_id).await,
            Recipient::Broadcast => {
                for user in inner.remote_users() {
                    if let Err(e) = inner.detach_stream(&user, stream_id).await {
                        warn!(peer = %user, stream = %stream_id, "cannot end stream: {e}");
                    }
                }
                inner.push(MeshEvent::LocalStreamEnd(stream_id.to_string()));
                Ok(())
            }
        }
    }

    /// Запускает передачи файла и возвращает их id; о завершении узнают
    /// получатели через `on_file_reception`.
    pub async fn send_file(
        &self,
        to: Recipient,
        file: OutgoingFile,
        correlation: Value,
    ) -> Result<Vec<String>, MeshError> {
        let inner = &self.inner;
        inner.ensure_open()?;
        let file = Arc::new(file);
        match to {
            Recipient::User(user) if user == inner.username => {
                Ok(vec![inner.deliver_file_locally(&file, correlation)])
            }
            Recipient::User(user) => Ok(vec![inner.start_transfer(&user, &file, correlation).await?]),
            Recipient::Broadcast => {
                let mut ids = Vec::new();
                for user in inner.remote_users() {
                    match inner.start_transfer(&user, &file, correlation.clone()).await {
                        Ok(id) => ids.push(id),
                        Err(e) => warn!(peer = %user, file = %file.name, "cannot start transfer: {e}"),
                    }
                }
                ids.push(inner.deliver_file_locally(&file, correlation));
                Ok(ids)
            }
        }
    }

    /// Закрывает все прямые соединения и rendezvous-сессию.
    /// Колбэки после этого не вызываются.
    pub async fn close(&self) {
        let inner = &self.inner;
        let users: Vec<String> = {
            let mut st = inner.state.lock();
            if st.closed {
                return;
            }
            st.closed = true;
            st.waiters.clear();
            st.peers.keys().cloned().collect()
        };
        for user in users {
            inner.remove_peer(&user, false).await;
        }
        inner.reject_pending(|_| true, MeshError::Closed);
        inner.session.close().await;
        info!(user = %inner.username, "mesh closed");
        if let Some(dispatcher) = inner.dispatcher.lock().take() {
            dispatcher.abort();
        }
    }
}

struct PendingGuard<'a> {
    inner: &'a MeshInner,
    id: u64,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        self.inner.pending.lock().remove(&self.id);
    }
}

impl MeshInner {
    fn handler(&self) -> Arc<dyn MeshHandler> {
        self.handler.read().clone()
    }

    fn push(&self, event: MeshEvent) {
        let _ = self.events.send(event);
    }

    fn ensure_open(&self) -> Result<(), MeshError> {
        if self.state.lock().closed {
            Err(MeshError::Closed)
        } else {
            Ok(())
        }
    }

    fn remote_users(&self) -> Vec<String> {
        let st = self.state.lock();
        st.roster
            .iter()
            .filter(|u| st.peers.contains_key(*u))
            .cloned()
            .collect()
    }

    fn control_of(&self, user: &str) -> Option<Arc<dyn DataChannel>> {
        self.state
            .lock()
            .peers
            .get(user)
            .and_then(|e| e.control.clone())
    }

    fn open_controls(&self) -> Vec<(String, Arc<dyn DataChannel>)> {
        let st = self.state.lock();
        st.roster
            .iter()
            .filter_map(|user| {
                let entry = st.peers.get(user)?;
                match (&entry.control, entry.state) {
                    (Some(control), LinkState::Open) => Some((user.clone(), control.clone())),
                    _ => None,
                }
            })
            .collect()
    }

    fn peer(&self, user: &str) -> Option<PeerHandle> {
        self.state.lock().peers.get(user).map(PeerEntry::handle)
    }

    fn current_peer(&self, user: &str, gen: u64) -> Option<PeerHandle> {
        self.state
            .lock()
            .peers
            .get(user)
            .filter(|e| e.gen == gen)
            .map(PeerEntry::handle)
    }

    fn signal(&self, user: &str, payload: SignalPayload) {
        if let Err(e) = self.session.send(Recipient::user(user), payload.to_value()) {
            debug!(peer = user, "cannot signal: {e}");
        }
    }

    fn reject_pending(&self, matches: impl Fn(&str) -> bool, error: MeshError) {
        let rejected: Vec<PendingAsk> = {
            let mut pending = self.pending.lock();
            let ids: Vec<u64> = pending
                .iter()
                .filter(|(_, ask)| matches(&ask.user))
                .map(|(id, _)| *id)
                .collect();
            ids.iter().filter_map(|id| pending.remove(id)).collect()
        };
        for ask in rejected {
            let _ = ask.waiter.send(Err(error.clone()));
        }
    }

    fn resolve(&self, user: &str, id: u64, result: Result<Value, MeshError>) {
        let ask = {
            let mut pending = self.pending.lock();
            match pending.get(&id) {
                Some(ask) if ask.user == user => pending.remove(&id),
                _ => None,
            }
        };
        match ask {
            Some(ask) => {
                let _ = ask.waiter.send(result);
            }
            None => debug!(peer = user, id, "reply for unknown request"),
        }
    }

    /// Запись пира для `user`; соединение создаётся, если его ещё нет
    async fn ensure_peer(&self, user: &str, initiator: bool) -> Result<PeerHandle, MeshError> {
        if user == self.username {
            return Err(MeshError::UnknownPeer(user.to_string()));
        }
        self.ensure_open()?;
        if let Some(peer) = self.peer(user) {
            return Ok(peer);
        }

        let link = self.factory.connect(user).await?;
        let gen = self.next_gen.fetch_add(1, Ordering::SeqCst) + 1;
        let role = Role::for_initiator(initiator);

        let outcome = {
            let mut st = self.state.lock();
            if st.closed {
                Err(MeshError::Closed)
            } else if let Some(existing) = st.peers.get(user) {
                Ok((existing.handle(), false))
            } else {
                let name = user.to_string();
                let pump = spawn_pump(link.events, self.events.clone(), move |event| {
                    MeshEvent::Connection {
                        user: name.clone(),
                        gen,
                        event,
                    }
                });
                let entry = PeerEntry {
                    connection: link.connection.clone(),
                    role,
                    initiator,
                    gen,
                    negotiator: Negotiator::shared(role),
                    offer_lock: Arc::new(tokio::sync::Mutex::new(())),
                    pending_candidates: Arc::new(PendingCandidates::default()),
                    control: None,
                    state: LinkState::Connecting,
                    streams: HashMap::new(),
                    sending: HashSet::new(),
                    transfers: HashMap::new(),
                    tasks: vec![pump],
                    candidates: CandidateStats::default(),
                    connected_at: None,
                };
                let handle = entry.handle();
                st.peers.insert(user.to_string(), entry);
                if !st.roster.iter().any(|u| u == user) {
                    st.roster.push(user.to_string());
                }
                Ok((handle, true))
            }
        };

        match outcome {
            Ok((handle, true)) => {
                debug!(peer = user, ?role, "peer connection created");
                Ok(handle)
            }
            Ok((handle, false)) => {
                link.connection.close().await;
                Ok(handle)
            }
            Err(e) => {
                link.connection.close().await;
                Err(e)
            }
        }
    }

    async fn bootstrap(self: &Arc<Self>, others: Vec<String>) -> Vec<BootstrapOutcome> {
        let attempts = others.into_iter().map(|user| {
            let inner = self.clone();
            async move {
                let result = inner.connect_to(&user).await.map_err(|e| match e {
                    err @ MeshError::Bootstrap { .. } => err,
                    other => MeshError::Bootstrap {
                        user: user.clone(),
                        reason: other.to_string(),
                    },
                });
                if result.is_err() {
                    inner.state.lock().waiters.remove(&user);
                }
                BootstrapOutcome { user, result }
            }
        });
        join_all(attempts).await
    }

    /// Сторона-инициатор: открыть control-канал и дождаться его открытия.
    async fn connect_to(&self, user: &str) -> Result<(), MeshError> {
        let (tx, rx) = oneshot::channel();
        self.state.lock().waiters.insert(user.to_string(), tx);

        let peer = self.ensure_peer(user, true).await?;
        let channel = peer.connection.create_channel(CONTROL_LABEL).await?;
        self.attach_control(user, peer.gen, channel);

        match timeout(self.config.bootstrap_timeout(), rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(MeshError::Closed),
            Err(_) => Err(MeshError::Timeout(format!("control channel with {user}"))),
        }
    }

    fn attach_control(&self, user: &str, gen: u64, channel: Channel) {
        let mut st = self.state.lock();
        let Some(entry) = st.entry_mut(user, gen) else {
            return;
        };
        if entry.control.is_some() {
            debug!(peer = user, "control channel already attached");
            return;
        }
        entry.control = Some(channel.handle.clone());
        let name = user.to_string();
        let pump = spawn_pump(channel.events, self.events.clone(), move |event| {
            MeshEvent::Control {
                user: name.clone(),
                gen,
                event,
            }
        });
        entry.track(pump);
    }

    /// Отвечает на чужой `_description`; `null`, если offer проигнорирован.
    async fn answer(&self, from: &str, desc: SessionDescription) -> Result<Value, MeshError> {
        let peer = self.ensure_peer(from, false).await?;
        let conn = peer.connection.as_ref();
        match desc.kind {
            SdpType::Offer => {
                let decision = peer
                    .negotiator
                    .lock()
                    .on_remote_offer(conn.signaling_state());
                if decision == OfferDecision::Ignore {
                    return Ok(Value::Null);
                }
                let answer = conn.apply_remote(desc).await?;
                peer.pending_candidates.flush(from, conn).await;
                let answer = answer.ok_or_else(|| {
                    TransportError::Negotiation("offer produced no answer".into())
                })?;
                Ok(serde_json::to_value(answer)?)
            }
            SdpType::Answer => {
                conn.apply_remote(desc).await?;
                peer.pending_candidates.flush(from, conn).await;
                Ok(Value::Null)
            }
        }
    }

    async fn negotiate(self: Arc<Self>, user: String, peer: PeerHandle) {
        let _serial = peer.offer_lock.lock().await;
        if let Err(error) = self.offer_round(&user, &peer).await {
            self.push(MeshEvent::NegotiationFailed {
                user,
                gen: peer.gen,
                error,
            });
        }
    }

    async fn offer_round(&self, user: &str, peer: &PeerHandle) -> Result<(), MeshError> {
        let _making_offer = OfferGuard::begin(&peer.negotiator);
        let conn = peer.connection.as_ref();
        let offer = conn.create_offer().await?;
        debug!(peer = user, "sending offer");
        let reply = self
            .session
            .ask(user, SignalPayload::Description(offer).to_value())
            .await?;
        match interpret_reply(reply)? {
            Some(answer) => {
                conn.apply_remote(answer).await?;
                peer.pending_candidates.flush(user, conn).await;
                debug!(peer = user, "negotiation complete");
            }
            None => debug!(peer = user, "offer ignored, waiting for the remote offer"),
        }
        Ok(())
    }

    async fn attach_stream(&self, user: &str, stream: &MediaStream) -> Result<(), MeshError> {
        let peer = self
            .peer(user)
            .ok_or_else(|| MeshError::UnknownPeer(user.to_string()))?;
        peer.connection.add_stream(stream).await?;
        if let Some(entry) = self.state.lock().entry_mut(user, peer.gen) {
            entry.sending.insert(stream.id.clone());
        }
        debug!(peer = user, stream = %stream.id, "stream attached");
        Ok(())
    }

    async fn detach_stream(&self, user: &str, stream_id: &str) -> Result<(), MeshError> {
        let found = {
            let mut st = self.state.lock();
            st.peers.get_mut(user).and_then(|entry| {
                entry
                    .sending
                    .remove(stream_id)
                    .then(|| (entry.connection.clone(), entry.control.clone()))
            })
        };
        let Some((connection, control)) = found else {
            return Ok(());
        };
        connection.remove_stream(stream_id).await?;
        if let Some(control) = control {
            let frame = ControlFrame::EndStream {
                id: stream_id.to_string(),
            };
            control.send(frame.encode()?).await?;
        }
        debug!(peer = user, stream = stream_id, "stream ended");
        Ok(())
    }

    fn deliver_file_locally(&self, file: &OutgoingFile, correlation: Value) -> String {
        let id = random_id();
        self.push(MeshEvent::FileReceived {
            from: self.username.clone(),
            id: id.clone(),
            file: ReceivedFile::local(file),
            correlation,
        });
        id
    }

    async fn start_transfer(
        &self,
        user: &str,
        file: &Arc<OutgoingFile>,
        correlation: Value,
    ) -> Result<String, MeshError> {
        let peer = self
            .peer(user)
            .ok_or_else(|| MeshError::UnknownPeer(user.to_string()))?;
        let id = random_id();
        let channel = peer
            .connection
            .create_channel(&format!("{FILE_LABEL_PREFIX}{id}"))
            .await?;

        let progress = Arc::new(TransferProgress::new(Direction::Outgoing));
        let chunk_size = self.config.chunk_size;
        let ack_timeout = self.config.ack_timeout();

        let mut st = self.state.lock();
        let entry = st
            .entry_mut(user, peer.gen)
            .ok_or_else(|| MeshError::UnknownPeer(user.to_string()))?;
        let task = {
            let events = self.events.clone();
            let file = file.clone();
            let progress = progress.clone();
            let user = user.to_string();
            let id = id.clone();
            tokio::spawn(async move {
                let event =
                    match send_file(channel, &file, correlation, chunk_size, ack_timeout, &progress)
                        .await
                    {
                        Ok(chunks) => {
                            debug!(peer = %user, transfer = %id, chunks, "file sent");
                            MeshEvent::TransferDone { user, id }
                        }
                        Err(error) => MeshEvent::TransferFailed { user, id, error },
                    };
                let _ = events.send(event);
            })
        };
        entry.transfers.insert(
            id.clone(),
            Transfer {
                progress,
                task: task.abort_handle(),
            },
        );
        info!(peer = user, transfer = %id, file = %file.name, size = file.data.len(), "file transfer started");
        Ok(id)
    }

    fn accept_file(&self, user: &str, gen: u64, id: String, channel: Channel) {
        let mut st = self.state.lock();
        let Some(entry) = st.entry_mut(user, gen) else {
            return;
        };
        let progress = Arc::new(TransferProgress::new(Direction::Incoming));
        let task = {
            let events = self.events.clone();
            let progress = progress.clone();
            let from = user.to_string();
            let id = id.clone();
            tokio::spawn(async move {
                let event = match receive_file(channel, &progress).await {
                    Ok((file, correlation)) => MeshEvent::FileReceived {
                        from,
                        id,
                        file,
                        correlation,
                    },
                    Err(error) => MeshEvent::TransferFailed {
                        user: from,
                        id,
                        error,
                    },
                };
                let _ = events.send(event);
            })
        };
        entry.transfers.insert(
            id,
            Transfer {
                progress,
                task: task.abort_handle(),
            },
        );
    }

    /// Разбирает пира. Идемпотентно; `on_leave` вызывается только для пира,
    /// у которого control-канал успел открыться.
    async fn remove_peer(&self, user: &str, notify: bool) {
        let (entry, waiter) = {
            let mut st = self.state.lock();
            st.roster.retain(|u| u != user);
            (st.peers.remove(user), st.waiters.remove(user))
        };
        if let Some(waiter) = waiter {
            let _ = waiter.send(Err(TransportError::Closed.into()));
        }
        self.reject_pending(|u| u == user, TransportError::Closed.into());

        let Some(mut entry) = entry else {
            return;
        };
        for task in entry.tasks.drain(..) {
            task.abort();
        }
        for (_, transfer) in entry.transfers.drain() {
            transfer.task.abort();
        }
        entry.connection.close().await;
        info!(peer = user, "peer removed");

        if !notify {
            return;
        }
        let handler = self.handler();
        for (_, token) in entry.streams.drain() {
            handler.on_stream_end(user, token).await;
        }
        if entry.state == LinkState::Open {
            handler.on_leave(user).await;
        }
    }

    async fn run(self: Arc<Self>, mut rx: mpsc::UnboundedReceiver<MeshEvent>) {
        while let Some(event) = rx.recv().await {
            if self.state.lock().closed {
                break;
            }
            self.dispatch(event).await;
        }
    }

    async fn dispatch(self: &Arc<Self>, event: MeshEvent) {
        match event {
            MeshEvent::Connection { user, gen, event } => {
                self.on_connection_event(&user, gen, event).await
            }
            MeshEvent::Control { user, gen, event } => {
                self.on_control_event(&user, gen, event).await
            }
            MeshEvent::SignalJoin(user) => {
                if user == self.username {
                    return;
                }
                if let Err(e) = self.ensure_peer(&user, false).await {
                    warn!(peer = %user, "cannot accept peer: {e}");
                    self.handler().on_error(&e).await;
                }
            }
            MeshEvent::SignalLeave(user) => self.remove_peer(&user, true).await,
            MeshEvent::SignalReception { from, message } => {
                self.on_signal(&from, message).await
            }
            MeshEvent::SignalError(error) => {
                self.handler()
                    .on_error(&MeshError::RemoteRequest(error))
                    .await
            }
            MeshEvent::SignalFatal(error) => self.handler().on_fatal_error(&error).await,
            MeshEvent::LocalReception(message) => {
                self.handler().on_reception(&self.username, message).await
            }
            MeshEvent::LocalStreamBegin(stream) => {
                if self.state.lock().local_streams.contains_key(&stream.id) {
                    return;
                }
                let id = stream.id.clone();
                let token = self
                    .handler()
                    .on_stream_begin(&self.username, IncomingStream::Local(stream))
                    .await;
                self.state.lock().local_streams.insert(id, token);
            }
            MeshEvent::LocalStreamEnd(id) => {
                let token = self.state.lock().local_streams.remove(&id);
                if let Some(token) = token {
                    self.handler().on_stream_end(&self.username, token).await;
                }
            }
            MeshEvent::FileReceived {
                from,
                id,
                file,
                correlation,
            } => {
                if let Some(entry) = self.state.lock().peers.get_mut(&from) {
                    entry.transfers.remove(&id);
                }
                info!(peer = %from, transfer = %id, size = file.data.len(), "file received");
                self.handler()
                    .on_file_reception(&from, file, correlation)
                    .await;
            }
            MeshEvent::TransferDone { user, id } => {
                if let Some(entry) = self.state.lock().peers.get_mut(&user) {
                    entry.transfers.remove(&id);
                }
            }
            MeshEvent::TransferFailed { user, id, error } => {
                if let Some(entry) = self.state.lock().peers.get_mut(&user) {
                    entry.transfers.remove(&id);
                }
                warn!(peer = %user, transfer = %id, "file transfer failed: {error}");
                self.handler().on_error(&error).await;
            }
            MeshEvent::NegotiationFailed { user, gen, error } => {
                let waiter = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    match st.peers.get_mut(&user).filter(|e| e.gen == gen) {
                        Some(entry) => {
                            if entry.state == LinkState::Connecting {
                                entry.state = LinkState::Failed;
                            }
                            st.waiters.remove(&user)
                        }
                        None => return,
                    }
                };
                warn!(peer = %user, "negotiation failed: {error}");
                if let Some(waiter) = waiter {
                    let _ = waiter.send(Err(error.clone()));
                }
                self.handler().on_error(&error).await;
            }
        }
    }

    async fn on_connection_event(self: &Arc<Self>, user: &str, gen: u64, event: ConnectionEvent) {
        match event {
            ConnectionEvent::IceCandidate(Some(candidate)) => {
                match self.state.lock().entry_mut(user, gen) {
                    Some(entry) => entry.candidates.record(&candidate),
                    None => return,
                }
                self.signal(user, SignalPayload::Ice(Some(candidate)));
            }
            ConnectionEvent::IceCandidate(None) => {
                let stats = match self.state.lock().entry_mut(user, gen) {
                    Some(entry) => entry.candidates,
                    None => return,
                };
                stats.report(user);
                self.signal(user, SignalPayload::Ice(None));
            }
            ConnectionEvent::NegotiationNeeded => {
                let Some(peer) = self.current_peer(user, gen) else {
                    return;
                };
                let task = tokio::spawn(self.clone().negotiate(user.to_string(), peer));
                if let Some(entry) = self.state.lock().entry_mut(user, gen) {
                    entry.track(task.abort_handle());
                }
            }
            ConnectionEvent::DataChannel(channel) => {
                let label = channel.label().to_string();
                if label == CONTROL_LABEL {
                    self.attach_control(user, gen, channel);
                } else if let Some(id) = label.strip_prefix(FILE_LABEL_PREFIX) {
                    debug!(peer = user, transfer = id, "incoming file channel");
                    self.accept_file(user, gen, id.to_string(), channel);
                } else {
                    debug!(peer = user, label = %label, "ignoring unknown data channel");
                }
            }
            ConnectionEvent::Track { stream_id, track } => {
                let known = self
                    .state
                    .lock()
                    .entry_mut(user, gen)
                    .map(|e| e.streams.contains_key(&stream_id));
                if known != Some(false) {
                    return;
                }
                let handler = self.handler();
                let token = handler
                    .on_stream_begin(
                        user,
                        IncomingStream::Remote {
                            id: stream_id.clone(),
                            track,
                        },
                    )
                    .await;
                let orphan = match self.state.lock().entry_mut(user, gen) {
                    Some(entry) => {
                        entry.streams.insert(stream_id, token);
                        None
                    }
                    None => Some(token),
                };
                if let Some(token) = orphan {
                    handler.on_stream_end(user, token).await;
                }
            }
            ConnectionEvent::StateChanged(LinkState::Open) => {
                info!(peer = user, "direct link established");
            }
            ConnectionEvent::StateChanged(LinkState::Connecting) => {}
            ConnectionEvent::StateChanged(state) => {
                if self.current_peer(user, gen).is_some() {
                    info!(peer = user, ?state, "direct link lost");
                    self.remove_peer(user, true).await;
                }
            }
        }
    }

    async fn on_control_event(self: &Arc<Self>, user: &str, gen: u64, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                let opened = {
                    let mut guard = self.state.lock();
                    let st = &mut *guard;
                    match st.peers.get_mut(user).filter(|e| e.gen == gen) {
                        // повторный Open игнорируем
                        Some(entry) if entry.state != LinkState::Open => {
                            entry.state = LinkState::Open;
                            entry.connected_at = Some(Utc::now());
                            let waiter = if entry.initiator {
                                st.waiters.remove(user)
                            } else {
                                None
                            };
                            Some((entry.initiator, waiter))
                        }
                        _ => None,
                    }
                };
                match opened {
                    Some((true, waiter)) => {
                        info!(peer = user, "control channel open");
                        if let Some(waiter) = waiter {
                            let _ = waiter.send(Ok(()));
                        }
                    }
                    Some((false, _)) => {
                        info!(peer = user, "control channel accepted");
                        self.handler().on_join(user).await;
                    }
                    None => {}
                }
            }
            ChannelEvent::Message(payload) => {
                if self.current_peer(user, gen).is_none() {
                    return;
                }
                match ControlFrame::decode(&payload) {
                    Some(frame) => self.on_control_frame(user, gen, frame).await,
                    None => debug!(peer = user, len = payload.len(), "ignoring malformed control frame"),
                }
            }
            ChannelEvent::Error(e) => {
                warn!(peer = user, "control channel error: {e}");
                self.handler()
                    .on_error(&TransportError::ConnectionFailed(e).into())
                    .await;
            }
            ChannelEvent::Close => {
                if self.current_peer(user, gen).is_some() {
                    debug!(peer = user, "control channel closed");
                    self.remove_peer(user, true).await;
                }
            }
        }
    }

    async fn on_control_frame(self: &Arc<Self>, user: &str, gen: u64, frame: ControlFrame) {
        match frame {
            ControlFrame::Message { message } => self.handler().on_reception(user, message).await,
            ControlFrame::EndStream { id } => {
                let token = self
                    .state
                    .lock()
                    .entry_mut(user, gen)
                    .and_then(|e| e.streams.remove(&id));
                match token {
                    Some(token) => self.handler().on_stream_end(user, token).await,
                    None => debug!(peer = user, stream = %id, "end of unknown stream"),
                }
            }
            ControlFrame::Request { id, message } => {
                let Some(control) = self.control_of(user) else {
                    return;
                };
                let handler = self.handler();
                let from = user.to_string();
                let task = tokio::spawn(async move {
                    let reply = match handler.on_request(&from, message).await {
                        Ok(message) => ControlFrame::Response { id, message },
                        Err(error) => ControlFrame::Error { id, error },
                    };
                    match reply.encode() {
                        Ok(payload) => {
                            if let Err(e) = control.send(payload).await {
                                debug!(peer = %from, id, "cannot reply: {e}");
                            }
                        }
                        Err(e) => warn!(peer = %from, id, "cannot encode reply: {e}"),
                    }
                });
                if let Some(entry) = self.state.lock().entry_mut(user, gen) {
                    entry.track(task.abort_handle());
                }
            }
            ControlFrame::Response { id, message } => self.resolve(user, id, Ok(message)),
            ControlFrame::Error { id, error } => {
                self.resolve(user, id, Err(MeshError::RemoteRequest(error)))
            }
        }
    }

    async fn on_signal(&self, from: &str, message: Value) {
        match SignalPayload::parse(&message) {
            Some(SignalPayload::Ice(Some(candidate))) => {
                let Some(peer) = self.peer(from) else {
                    debug!(peer = from, "candidate from unknown peer dropped");
                    return;
                };
                peer.pending_candidates
                    .apply_or_park(from, peer.connection.as_ref(), candidate)
                    .await;
            }
            Some(SignalPayload::Ice(None)) => debug!(peer = from, "remote gathering complete"),
            Some(SignalPayload::Description(_)) => {
                debug!(peer = from, "description outside of a request ignored")
            }
            None => debug!(peer = from, "ignoring rendezvous message: {message}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::peer::mock::channel_pair;
    use crate::peer::types::Payload;

    #[tokio::test]
    async fn pump_tags_events_with_peer_and_generation() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let (a, b) = channel_pair(CONTROL_LABEL);
        spawn_pump(b.events, tx, |event| MeshEvent::Control {
            user: "amy".into(),
            gen: 7,
            event,
        });
        a.handle.send(Payload::Text("hi".into())).await.unwrap();

        let mut seen = Vec::new();
        while seen.len() < 2 {
            match rx.recv().await.unwrap() {
                MeshEvent::Control { user, gen, event } => {
                    assert_eq!((user.as_str(), gen), ("amy", 7));
                    seen.push(event);
                }
                _ => panic!("unexpected event"),
            }
        }
        assert_eq!(
            seen,
            vec![ChannelEvent::Open, ChannelEvent::Message(Payload::Text("hi".into()))]
        );
    }

    #[test]
    fn snapshot_serializes_state_and_role() {
        let snapshot = PeerSnapshot {
            username: "bob".into(),
            role: Role::Polite,
            state: LinkState::Open,
            initiator: false,
            streams: vec!["cam".into()],
            sending: vec![],
            transfers: vec![],
            candidates: CandidateStats::default(),
            ignored_offers: 0,
            yielded_offers: 1,
            connected_at: None,
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["role"], "polite");
        assert_eq!(json["state"], "open");
        assert_eq!(json["streams"][0], "cam");
        assert_eq!(json["yielded_offers"], 1);
    }
}
