//! Rendezvous-сессии и mesh-сеть на WebRTC
//!
//! `session` работает с rendezvous-сервером (`server`, бинарник
//! `ssc-mesh-server`); `mesh` превращает сессию в прямые соединения между
//! каждой парой участников поверх WebRTC (`peer::RtcFactory`) или
//! `peer::MockNetwork` в памяти.

pub mod config;
pub mod error;
pub mod events;
pub mod logger;
pub mod mesh;
pub mod peer;
pub mod server;
pub mod session;
pub mod signaling;
pub mod utils;

pub use config::{MeshConfig, ServerOptions, SessionConfig};
pub use error::{MeshError, SessionError, TransportError};
pub use events::{LoggingHandler, MeshHandler, SessionHandler, StreamToken};
pub use mesh::{BootstrapOutcome, PeerMesh, PeerSnapshot};
pub use peer::file_transfer::{OutgoingFile, ReceivedFile};
pub use peer::types::{IncomingStream, MediaStream};
pub use server::RendezvousServer;
pub use session::{Session, SessionMode, SessionOptions};
pub use signaling::Recipient;
