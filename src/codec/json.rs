//! JSON codec using `serde_json`.
//!
//! A message body is a sequence of newline-separated top-level JSON
//! values; the decoder walks them with a `StreamDeserializer` and tracks
//! its byte offset.
//!
//! Registered as non-reusable: instances are built per message, which
//! exercises the runtime's short-lived codec path. (The instances are
//! trivially cheap either way.)

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::{Codec, Decoder, Encoder};
use crate::error::{Error, Result};
use crate::framing::Framer;

/// JSON codec (concatenated top-level values).
pub struct JsonCodec;

impl Codec for JsonCodec {
    const REUSABLE: bool = false;

    type Encoder = JsonEncoder;
    type Decoder = JsonDecoder;

    fn encoder() -> Self::Encoder {
        JsonEncoder { buf: Vec::new() }
    }

    fn decoder() -> Self::Decoder {
        JsonDecoder {
            payload: Bytes::new(),
            pos: 0,
        }
    }
}

/// Streams JSON values into a scratch buffer.
pub struct JsonEncoder {
    buf: Vec<u8>,
}

impl Encoder for JsonEncoder {
    fn begin(&mut self) {
        self.buf.clear();
        Framer::reserve_header(&mut self.buf);
    }

    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()> {
        serde_json::to_writer(&mut self.buf, value)?;
        // Separator: adjacent numbers would otherwise merge into one token.
        self.buf.push(b'\n');
        Ok(())
    }

    fn finish(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }
}

/// Walks the concatenated JSON values of one payload.
pub struct JsonDecoder {
    payload: Bytes,
    pos: usize,
}

impl Decoder for JsonDecoder {
    fn begin(&mut self, payload: Bytes) {
        self.payload = payload;
        self.pos = 0;
    }

    fn get<T: DeserializeOwned>(&mut self) -> Result<T> {
        let rest = &self.payload[self.pos..];
        let mut stream = serde_json::Deserializer::from_slice(rest).into_iter::<T>();
        match stream.next() {
            Some(Ok(value)) => {
                self.pos += stream.byte_offset();
                Ok(value)
            }
            Some(Err(e)) => Err(Error::Json(e)),
            None => Err(Error::Protocol("message payload exhausted".into())),
        }
    }
}
