//! Length-prefixed frame codec
//!
//! ```text
//! +---------+---------+------+----------------+-------------------+
//! | "CR"    | version | kind | length (u32 BE)| bincode payload   |
//! | 2 bytes | 1 byte  | 1 b  | 4 bytes        | `length` bytes    |
//! +---------+---------+------+----------------+-------------------+
//! ```

use std::marker::PhantomData;

use bincode::config;
use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::protocol::{WireMessage, PROTOCOL_VERSION};
use crate::error::{Error, Result};

/// Frame magic
pub const MAGIC: [u8; 2] = *b"CR";
/// Size of the fixed frame header
pub const HEADER_LEN: usize = 8;
/// Largest accepted payload
pub const MAX_PAYLOAD_LEN: usize = 1024 * 1024;

/// Bincode configuration of frame payloads
///
/// The limit caps what a payload may claim for its strings and lists, so an
/// embedded length can never allocate more than a frame can carry.
fn wire_config() -> impl config::Config {
    config::standard().with_limit::<MAX_PAYLOAD_LEN>()
}

/// Codec decoding `In` frames and encoding `Out` frames
///
/// The server uses `FrameCodec<Request, Response>`, the client the reverse.
#[derive(Debug)]
pub struct FrameCodec<In, Out> {
    _marker: PhantomData<fn(Out) -> In>,
}

impl<In, Out> FrameCodec<In, Out> {
    pub fn new() -> Self {
        Self {
            _marker: PhantomData,
        }
    }
}

impl<In, Out> Default for FrameCodec<In, Out> {
    fn default() -> Self {
        Self::new()
    }
}

impl<In: WireMessage, Out> Decoder for FrameCodec<In, Out> {
    type Item = In;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<In>> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }

        if src[0..2] != MAGIC {
            return Err(Error::ProtocolError(format!(
                "bad frame magic {:02x}{:02x}",
                src[0], src[1]
            )));
        }
        if src[2] != PROTOCOL_VERSION {
            return Err(Error::ProtocolError(format!(
                "unsupported protocol version {}, expected {}",
                src[2], PROTOCOL_VERSION
            )));
        }
        if src[3] != In::KIND {
            return Err(Error::ProtocolError(format!(
                "unexpected frame kind {:#04x}, expected {:#04x}",
                src[3],
                In::KIND
            )));
        }

        let len = u32::from_be_bytes([src[4], src[5], src[6], src[7]]) as usize;
        if len > MAX_PAYLOAD_LEN {
            return Err(Error::ProtocolError(format!(
                "frame payload of {} bytes exceeds limit of {}",
                len, MAX_PAYLOAD_LEN
            )));
        }

        if src.len() < HEADER_LEN + len {
            src.reserve(HEADER_LEN + len - src.len());
            return Ok(None);
        }

        src.advance(HEADER_LEN);
        let payload = src.split_to(len);
        let (message, read) = bincode::decode_from_slice::<In, _>(&payload, wire_config())
            .map_err(|e| Error::ProtocolError(format!("malformed payload: {}", e)))?;
        if read != len {
            return Err(Error::ProtocolError(format!(
                "{} trailing bytes after payload",
                len - read
            )));
        }

        Ok(Some(message))
    }
}

impl<In, Out: WireMessage> Encoder<Out> for FrameCodec<In, Out> {
    type Error = Error;

    fn encode(&mut self, item: Out, dst: &mut BytesMut) -> Result<()> {
        let payload = bincode::encode_to_vec(&item, wire_config())
            .map_err(|e| Error::ProtocolError(format!("failed to encode payload: {}", e)))?;
        if payload.len() > MAX_PAYLOAD_LEN {
            return Err(Error::ProtocolError(format!(
                "frame payload of {} bytes exceeds limit of {}",
                payload.len(),
                MAX_PAYLOAD_LEN
            )));
        }

        dst.reserve(HEADER_LEN + payload.len());
        dst.put_slice(&MAGIC);
        dst.put_u8(PROTOCOL_VERSION);
        dst.put_u8(Out::KIND);
        dst.put_u32(payload.len() as u32);
        dst.put_slice(&payload);
        Ok(())
    }
}
