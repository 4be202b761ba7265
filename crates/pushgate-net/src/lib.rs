//! TCP transport for the push gateway: framing, connection registry, worker
//! pool, and the server lifecycle that ties them together.

pub mod compression;
pub mod connection;
pub mod framing;
pub mod lifecycle;
pub mod platform;
pub mod registry;
pub mod server;
pub mod worker;

pub use compression::{CompressionConfig, CompressionError};
pub use connection::{ConnectionHandler, DisconnectReason, TransportError};
pub use framing::{
    Frame, FrameConfig, FrameDecoder, FrameError, FrameKind, MessageId, decode_frame,
    encode_frame, write_frame,
};
pub use lifecycle::{Lifecycle, LifecycleError, ServerState};
pub use platform::{SocketConfig, TransportBackend};
pub use registry::{
    Connection, ConnectionId, ConnectionRegistry, DEFAULT_QUEUE_CAPACITY, Mailbox, RegistryError,
};
pub use server::{PushServer, ServerConfig, ServerError};
