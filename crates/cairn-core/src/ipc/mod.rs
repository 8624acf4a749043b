//! Cross-process access to the routing manager over a Unix socket
//!
//! Each connection carries a sequence of length-prefixed frames. A frame
//! holds one bincode-encoded [`Request`] or [`Response`]; responses are sent
//! in request order, so clients may pipeline.

mod client;
mod codec;
mod protocol;
mod server;

pub use client::{RoutingClient, DEFAULT_CLIENT_TIMEOUT};
pub use codec::{FrameCodec, HEADER_LEN, MAGIC, MAX_PAYLOAD_LEN};
pub use protocol::{
    Request, Response, WireContent, WireMessage, KIND_REQUEST, KIND_RESPONSE, PROTOCOL_VERSION,
};
pub use server::RoutingServer;
