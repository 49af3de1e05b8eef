#![allow(dead_code)]

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use ssc_mesh::config::{MeshConfig, ServerOptions};
use ssc_mesh::peer::MockNetwork;
use ssc_mesh::{
    IncomingStream, MeshError, MeshHandler, PeerMesh, ReceivedFile, RendezvousServer,
    SessionError, SessionHandler, SessionOptions, StreamToken,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::{accept_async, tungstenite::Message};

pub const APP: &str = "ssc-mesh-tests";
pub const PASSWORD: &str = "hunter2";

/// Поднимает rendezvous-сервер на свободном порту и возвращает его ws:// URL
pub async fn start_server() -> String {
    let server = RendezvousServer::bind(ServerOptions {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..ServerOptions::default()
    })
    .await
    .unwrap();
    let addr = server.local_addr().unwrap();
    server.spawn();
    format!("ws://{addr}")
}

/// Одноразовый поддельный rendezvous-сервер: ждёт hello клиента, отвечает
/// строками `replies` как есть и отключается.
pub async fn scripted_server(replies: Vec<String>) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _hello = ws.next().await;
        for reply in replies {
            ws.send(Message::Text(reply.into())).await.unwrap();
        }
        let _ = ws.close(None).await;
    });
    format!("ws://{addr}")
}

#[derive(Debug, Clone, PartialEq)]
pub enum Seen {
    Reception { from: String, message: Value },
    Join(String),
    Leave(String),
    Error(String),
    Fatal(String),
    StreamBegin { from: String, id: String },
    StreamEnd { from: String, id: String },
    File {
        from: String,
        name: String,
        mime: String,
        data: Vec<u8>,
        correlation: Value,
    },
}

/// Обработчик, записывающий каждый колбэк. На запрос отвечает эхом, после
/// `delay_ms`, если он есть; запрос `"fail"` отклоняется.
pub struct Recorder {
    tx: mpsc::UnboundedSender<Seen>,
}

pub struct Inbox {
    rx: mpsc::UnboundedReceiver<Seen>,
}

pub fn recorder() -> (Arc<Recorder>, Inbox) {
    let (tx, rx) = mpsc::unbounded_channel();
    (Arc::new(Recorder { tx }), Inbox { rx })
}

impl Recorder {
    fn seen(&self, event: Seen) {
        let _ = self.tx.send(event);
    }

    async fn reply(&self, from: &str, message: Value) -> Result<Value, String> {
        if message == json!("fail") {
            return Err("refused".into());
        }
        if let Some(ms) = message.get("delay_ms").and_then(Value::as_u64) {
            tokio::time::sleep(Duration::from_millis(ms)).await;
        }
        Ok(json!({ "from": from, "echo": message }))
    }
}

#[async_trait]
impl SessionHandler for Recorder {
    async fn on_reception(&self, from: &str, message: Value) {
        self.seen(Seen::Reception {
            from: from.into(),
            message,
        });
    }

    async fn on_request(&self, from: &str, message: Value) -> Result<Value, String> {
        self.reply(from, message).await
    }

    async fn on_join(&self, user: &str) {
        self.seen(Seen::Join(user.into()));
    }

    async fn on_leave(&self, user: &str) {
        self.seen(Seen::Leave(user.into()));
    }

    async fn on_error(&self, error: &str) {
        self.seen(Seen::Error(error.into()));
    }

    async fn on_fatal_error(&self, error: &SessionError) {
        self.seen(Seen::Fatal(error.to_string()));
    }
}

#[async_trait]
impl MeshHandler for Recorder {
    async fn on_reception(&self, from: &str, message: Value) {
        self.seen(Seen::Reception {
            from: from.into(),
            message,
        });
    }

    async fn on_request(&self, from: &str, message: Value) -> Result<Value, String> {
        self.reply(from, message).await
    }

    async fn on_join(&self, user: &str) {
        self.seen(Seen::Join(user.into()));
    }

    async fn on_leave(&self, user: &str) {
        self.seen(Seen::Leave(user.into()));
    }

    async fn on_error(&self, error: &MeshError) {
        self.seen(Seen::Error(error.to_string()));
    }

    async fn on_fatal_error(&self, error: &SessionError) {
        self.seen(Seen::Fatal(error.to_string()));
    }

    async fn on_stream_begin(&self, from: &str, stream: IncomingStream) -> StreamToken {
        let id = stream.id().to_string();
        self.seen(Seen::StreamBegin {
            from: from.into(),
            id: id.clone(),
        });
        Box::new(id)
    }

    async fn on_stream_end(&self, from: &str, token: StreamToken) {
        let id = token
            .downcast::<String>()
            .map(|id| *id)
            .unwrap_or_default();
        self.seen(Seen::StreamEnd {
            from: from.into(),
            id,
        });
    }

    async fn on_file_reception(&self, from: &str, file: ReceivedFile, correlation: Value) {
        self.seen(Seen::File {
            from: from.into(),
            name: file.name,
            mime: file.mime,
            data: file.data.to_vec(),
            correlation,
        });
    }
}

impl Inbox {
    pub async fn next(&mut self) -> Seen {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for a callback")
            .expect("handler dropped")
    }

    /// Пропускает колбэки до первого подходящего
    pub async fn expect(&mut self, wanted: impl Fn(&Seen) -> bool) -> Seen {
        loop {
            let seen = self.next().await;
            if wanted(&seen) {
                return seen;
            }
        }
    }

    /// Всё, что пришло за `wait`
    pub async fn settle(&mut self, wait: Duration) -> Vec<Seen> {
        tokio::time::sleep(wait).await;
        let mut out = Vec::new();
        while let Ok(seen) = self.rx.try_recv() {
            out.push(seen);
        }
        out
    }
}

pub struct Member {
    pub name: String,
    pub mesh: PeerMesh,
    pub inbox: Inbox,
}

/// Mesh из `names`, вход по порядку; каждый ранний участник успевает
/// увидеть вход всех следующих.
pub async fn mesh_of(names: &[&str]) -> (MockNetwork, Vec<Member>) {
    let endpoint = start_server().await;
    let net = MockNetwork::new();
    let mut members: Vec<Member> = Vec::new();
    let mut session_id = String::new();

    for (i, name) in names.iter().enumerate() {
        let opts = if i == 0 {
            SessionOptions::create(&endpoint, APP, PASSWORD, name)
        } else {
            SessionOptions::join(&endpoint, APP, &session_id, PASSWORD, name)
        };
        let factory = net.endpoint(name);
        let mesh = if i == 0 {
            PeerMesh::create(opts, factory, MeshConfig::default()).await
        } else {
            PeerMesh::join(opts, factory, MeshConfig::default()).await
        }
        .unwrap();
        for outcome in mesh.bootstrap_outcomes() {
            assert_eq!(outcome.result, Ok(()), "bootstrap with {}", outcome.user);
        }
        if i == 0 {
            session_id = mesh.id().to_string();
        }
        let (handler, inbox) = recorder();
        mesh.set_handler(handler);

        for earlier in members.iter_mut() {
            let joined = name.to_string();
            earlier
                .inbox
                .expect(|s| *s == Seen::Join(joined.clone()))
                .await;
        }
        members.push(Member {
            name: name.to_string(),
            mesh,
            inbox,
        });
    }
    (net, members)
}
