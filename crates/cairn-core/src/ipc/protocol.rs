//! Messages exchanged over the local socket

use std::collections::BTreeMap;

use bincode::{Decode, Encode};

use crate::error::Error;
use crate::routing::{BackendId, ContentDescriptor, RoutingPriority, RoutingStrategy};

/// Protocol version carried in every frame header
pub const PROTOCOL_VERSION: u8 = 1;

/// Frame-kind byte of client requests
pub const KIND_REQUEST: u8 = 0x01;
/// Frame-kind byte of server responses
pub const KIND_RESPONSE: u8 = 0x02;

/// A message type that can travel in a frame
pub trait WireMessage: Encode + Decode<()> + Sized {
    const KIND: u8;
}

/// Content attributes as sent on the wire
#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub struct WireContent {
    pub content_type: String,
    pub size_bytes: u64,
    pub content_hash: Option<String>,
    pub metadata: BTreeMap<String, String>,
}

impl From<&ContentDescriptor> for WireContent {
    fn from(content: &ContentDescriptor) -> Self {
        Self {
            content_type: content.content_type.clone(),
            size_bytes: content.size_bytes,
            content_hash: content.content_hash.clone(),
            metadata: content.metadata.clone(),
        }
    }
}

impl From<WireContent> for ContentDescriptor {
    fn from(wire: WireContent) -> Self {
        ContentDescriptor {
            content_type: wire.content_type,
            size_bytes: wire.size_bytes,
            content_hash: wire.content_hash,
            metadata: wire.metadata,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Request {
    SelectBackend {
        content: WireContent,
        strategy: Option<RoutingStrategy>,
        priority: Option<RoutingPriority>,
        /// Restrict the roster; `Some(vec![])` selects nothing
        available: Option<Vec<BackendId>>,
    },
    RecordOutcome {
        backend_id: BackendId,
        content: WireContent,
        success: bool,
        duration_ms: Option<u64>,
    },
    Ping,
}

impl WireMessage for Request {
    const KIND: u8 = KIND_REQUEST;
}

impl Request {
    pub fn select(content: &ContentDescriptor) -> Self {
        Request::SelectBackend {
            content: content.into(),
            strategy: None,
            priority: None,
            available: None,
        }
    }

    pub fn outcome(
        backend_id: impl Into<BackendId>,
        content: &ContentDescriptor,
        success: bool,
        duration_ms: Option<u64>,
    ) -> Self {
        Request::RecordOutcome {
            backend_id: backend_id.into(),
            content: content.into(),
            success,
            duration_ms,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Request::SelectBackend { .. } => "select_backend",
            Request::RecordOutcome { .. } => "record_outcome",
            Request::Ping => "ping",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Encode, Decode)]
pub enum Response {
    Selected {
        backend_id: BackendId,
        score: f64,
        decision_id: String,
    },
    Ack,
    Pong {
        version: u8,
    },
    Error {
        code: String,
        message: String,
    },
}

impl WireMessage for Response {
    const KIND: u8 = KIND_RESPONSE;
}

impl From<&Error> for Response {
    fn from(err: &Error) -> Self {
        Response::Error {
            code: err.code().to_string(),
            message: err.to_string(),
        }
    }
}

impl Response {
    /// Turn an error response into [`Error::Remote`]
    pub fn into_result(self) -> crate::Result<Response> {
        match self {
            Response::Error { code, message } => Err(Error::Remote { code, message }),
            other => Ok(other),
        }
    }
}
