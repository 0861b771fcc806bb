//! MessagePack codec using `rmp-serde`.
//!
//! Structs are encoded as maps (`write_named`), not positional arrays, so
//! payloads stay readable by self-describing MessagePack consumers in other
//! languages.
//!
//! The encoder keeps a scratch buffer and the decoder a cursor; both are
//! cheap to reset, so the codec is registered as reusable and the runtime
//! holds one of each per session.

use std::io::Cursor;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, Decoder, Encoder};
use crate::error::Result;
use crate::framing::Framer;

/// MessagePack codec (struct-as-map).
pub struct MsgpackCodec;

impl Codec for MsgpackCodec {
    const REUSABLE: bool = true;

    type Encoder = MsgpackEncoder;
    type Decoder = MsgpackDecoder;

    fn encoder() -> Self::Encoder {
        MsgpackEncoder { buf: Vec::new() }
    }

    fn decoder() -> Self::Decoder {
        MsgpackDecoder {
            input: Cursor::new(Bytes::new()),
        }
    }
}

/// Streams values into a scratch buffer with reserved frame-header space.
pub struct MsgpackEncoder {
    buf: Vec<u8>,
}

impl Encoder for MsgpackEncoder {
    fn begin(&mut self) {
        self.buf.clear();
        Framer::reserve_header(&mut self.buf);
    }

    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        rmp_serde::encode::write_named(&mut self.buf, value)?;
        Ok(())
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Streams values out of a message payload.
pub struct MsgpackDecoder {
    input: Cursor<Bytes>,
}

impl Decoder for MsgpackDecoder {
    fn begin(&mut self, payload: Bytes) {
        self.input = Cursor::new(payload);
    }

    fn get<T: DeserializeOwned>(&mut self) -> Result<T> {
        let mut de = rmp_serde::Deserializer::new(&mut self.input);
        Ok(T::deserialize(&mut de)?)
    }
}
