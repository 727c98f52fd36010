//! Framed codec for RPC connections.
//!
//! Each frame is a 4-byte big-endian length prefix followed by a JSON body.
//! Works over any AsyncRead/AsyncWrite, in practice a loopback `TcpStream`.

use std::io;
use std::marker::PhantomData;

use serde::{Serialize, de::DeserializeOwned};
use tokio_util::bytes::{Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder, LengthDelimitedCodec};

/// Upper bound on a single frame. Larger frames are a protocol error.
pub const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

const LARGE_FRAME_LEN: usize = 1024 * 1024;

/// Length-prefixed JSON codec for one message type.
pub struct JsonCodec<T> {
    inner: LengthDelimitedCodec,
    _phantom: PhantomData<T>,
}

impl<T> Default for JsonCodec<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> JsonCodec<T> {
    pub fn new() -> Self {
        Self {
            inner: LengthDelimitedCodec::builder()
                .length_field_length(4)
                .max_frame_length(MAX_FRAME_LEN)
                .new_codec(),
            _phantom: PhantomData,
        }
    }
}

impl<T: DeserializeOwned> Decoder for JsonCodec<T> {
    type Item = T;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let Some(frame) = self.inner.decode(src)? else {
            return Ok(None);
        };
        serde_json::from_slice(&frame)
            .map(Some)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))
    }
}

impl<T: Serialize> Encoder<T> for JsonCodec<T> {
    type Error = io::Error;

    fn encode(&mut self, item: T, dst: &mut BytesMut) -> Result<(), Self::Error> {
        let json =
            serde_json::to_vec(&item).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        if json.len() > LARGE_FRAME_LEN {
            tracing::debug!(
                frame_size_bytes = json.len(),
                frame_size_kb = json.len() / 1024,
                "Encoding large frame"
            );
        }
        self.inner.encode(Bytes::from(json), dst)
    }
}
