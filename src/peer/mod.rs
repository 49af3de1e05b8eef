pub mod connection;
pub mod data_channel;
pub mod file_transfer;
pub mod ice;
pub mod mock;
pub mod negotiation;
pub mod transport;
pub mod types;

pub use connection::RtcFactory;
pub use mock::MockNetwork;
pub use transport::{ConnectionFactory, DirectConnection, CONTROL_LABEL, FILE_LABEL_PREFIX};
pub use types::{IceCandidate, MediaStream, Payload, Role, ServerConfig, SessionDescription};
