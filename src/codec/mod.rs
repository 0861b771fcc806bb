//! Codec adapter - serialization for calls, results, and events.
//!
//! The runtime is serialization-agnostic: anything implementing [`Codec`]
//! can carry it. A message body is the concatenation of independently
//! encoded serde values, in a fixed order:
//!
//! - calls: `func` (fully qualified name), then each argument positionally;
//! - results: `func`, then `error.code`, `error.message`, then the value
//!   when (and only when) the code is `0`;
//! - events: the broadcast sentinel as `func`, then the event value.
//!
//! Polymorphic events are closed serde enums; the codec's self-describing
//! enum tagging plays the role of a type registry, so no out-of-band
//! registration step exists.
//!
//! # Reusable instances
//!
//! Some codecs can profitably keep one encoder and one decoder alive per
//! session and reset them between messages; others are constructed per
//! message. [`Codec::REUSABLE`] declares the capability and the runtime
//! honors it; semantics are identical either way.
//!
//! Shipped codecs: [`MsgpackCodec`] (reusable) and [`JsonCodec`]
//! (per-message).

mod json;
mod msgpack;

pub use json::JsonCodec;
pub use msgpack::MsgpackCodec;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::error::{CallError, CallResult, Result};

/// A serialization scheme the runtime can carry messages with.
pub trait Codec: 'static {
    /// Whether encoder/decoder instances may be kept per session and
    /// reset between messages.
    const REUSABLE: bool;

    /// The encoder type.
    type Encoder: Encoder;
    /// The decoder type.
    type Decoder: Decoder;

    /// Construct an encoder.
    fn encoder() -> Self::Encoder;
    /// Construct a decoder.
    fn decoder() -> Self::Decoder;
}

/// Streams serde values into a message buffer with frame-header space
/// reserved up front.
pub trait Encoder: 'static {
    /// Start a fresh message: reset the scratch buffer and reserve the
    /// frame header.
    fn begin(&mut self);

    /// Append one value.
    fn put<T: Serialize + ?Sized>(&mut self, value: &T) -> Result<()>;

    /// Take the finished message (header space still unfilled - the framer
    /// writes the length prefix in place).
    fn finish(&mut self) -> Vec<u8>;
}

/// Streams serde values out of a message payload.
pub trait Decoder: 'static {
    /// Start decoding a message payload.
    fn begin(&mut self, payload: Bytes);

    /// Read the next value.
    fn get<T: DeserializeOwned>(&mut self) -> Result<T>;
}

/// Positional call arguments, client side. Implemented for tuples of up to
/// eight serializable values.
pub trait EncodeArgs {
    /// Append every argument, in declaration order.
    fn encode_args<E: Encoder>(&self, enc: &mut E) -> Result<()>;
}

/// Positional call arguments, service side. Implemented for tuples of up
/// to eight deserializable values.
pub trait DecodeArgs: Sized {
    /// Read every argument, in declaration order.
    fn decode_args<D: Decoder>(dec: &mut D) -> Result<Self>;
}

macro_rules! impl_args_tuple {
    ($($ty:ident : $idx:tt),*) => {
        impl<$($ty: Serialize),*> EncodeArgs for ($($ty,)*) {
            fn encode_args<En: Encoder>(&self, _enc: &mut En) -> Result<()> {
                $(_enc.put(&self.$idx)?;)*
                Ok(())
            }
        }

        impl<$($ty: DeserializeOwned),*> DecodeArgs for ($($ty,)*) {
            fn decode_args<De: Decoder>(_dec: &mut De) -> Result<Self> {
                Ok(($(_dec.get::<$ty>()?,)*))
            }
        }
    };
}

impl EncodeArgs for () {
    fn encode_args<E: Encoder>(&self, _enc: &mut E) -> Result<()> {
        Ok(())
    }
}

impl DecodeArgs for () {
    fn decode_args<D: Decoder>(_dec: &mut D) -> Result<Self> {
        Ok(())
    }
}

impl_args_tuple!(A0: 0);
impl_args_tuple!(A0: 0, A1: 1);
impl_args_tuple!(A0: 0, A1: 1, A2: 2);
impl_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3);
impl_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4);
impl_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5);
impl_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6);
impl_args_tuple!(A0: 0, A1: 1, A2: 2, A3: 3, A4: 4, A5: 5, A6: 6, A7: 7);

/// Encode a call message: `func`, then each argument.
pub fn encode_call<E: Encoder, A: EncodeArgs>(
    enc: &mut E,
    func: &str,
    args: &A,
) -> Result<Vec<u8>> {
    enc.begin();
    enc.put(func)?;
    args.encode_args(enc)?;
    Ok(enc.finish())
}

/// Encode a result message: `func`, then the error pair, then the value
/// when the call succeeded.
pub fn encode_result<E: Encoder, R: Serialize>(
    enc: &mut E,
    func: &str,
    result: &CallResult<R>,
) -> Result<Vec<u8>> {
    enc.begin();
    enc.put(func)?;
    match result {
        CallResult::Ok(value) => {
            enc.put(&0i32)?;
            enc.put("")?;
            enc.put(value)?;
        }
        CallResult::Err(e) => {
            enc.put(&e.code())?;
            enc.put(e.message())?;
        }
    }
    Ok(enc.finish())
}

/// Encode an event message: the broadcast sentinel, then the event value.
pub fn encode_event<E: Encoder, Ev: Serialize>(
    enc: &mut E,
    sentinel: &str,
    event: &Ev,
) -> Result<Vec<u8>> {
    enc.begin();
    enc.put(sentinel)?;
    enc.put(event)?;
    Ok(enc.finish())
}

/// Open a message payload and read the leading `func` field, leaving the
/// decoder positioned at the arguments (or result).
pub fn read_envelope<D: Decoder>(dec: &mut D, payload: Bytes) -> Result<String> {
    dec.begin(payload);
    dec.get::<String>()
}

/// Decode the result that follows an envelope.
pub fn decode_result<D: Decoder, R: DeserializeOwned>(dec: &mut D) -> Result<CallResult<R>> {
    let code: i32 = dec.get()?;
    let message: String = dec.get()?;
    if code != 0 {
        Ok(CallResult::Err(CallError::new(code, message)))
    } else {
        Ok(CallResult::Ok(dec.get()?))
    }
}

/// Decode the event value that follows a broadcast envelope.
pub fn decode_event<D: Decoder, Ev: DeserializeOwned>(dec: &mut D) -> Result<Ev> {
    dec.get()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::CallError;
    use crate::framing::Framer;
    use serde::{Deserialize, Serialize};
    use std::collections::BTreeMap;

    fn payload_of(msg: Vec<u8>) -> Bytes {
        Framer::strip_header(msg)
    }

    fn call_roundtrip<C: Codec>() {
        let mut enc = C::encoder();
        let mut dec = C::decoder();

        let msg = encode_call(&mut enc, "Calculator::add", &(12i8, 23i16, 34i32)).unwrap();
        let func = read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(func, "Calculator::add");
        let args = <(i8, i16, i32)>::decode_args(&mut dec).unwrap();
        assert_eq!(args, (12, 23, 34));
    }

    fn result_roundtrip<C: Codec>() {
        let mut enc = C::encoder();
        let mut dec = C::decoder();

        let ok: CallResult<i32> = CallResult::Ok(69);
        let msg = encode_result(&mut enc, "Calculator::add", &ok).unwrap();
        let func = read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(func, "Calculator::add");
        assert_eq!(decode_result::<_, i32>(&mut dec).unwrap(), ok);

        let err: CallResult<i32> = CallResult::Err(CallError::new(115, "busy"));
        let msg = encode_result(&mut enc, "Calculator::add", &err).unwrap();
        read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(decode_result::<_, i32>(&mut dec).unwrap(), err);
    }

    fn void_result_roundtrip<C: Codec>() {
        let mut enc = C::encoder();
        let mut dec = C::decoder();

        let ok: CallResult<()> = CallResult::Ok(());
        let msg = encode_result(&mut enc, "Calculator::ping", &ok).unwrap();
        read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(decode_result::<_, ()>(&mut dec).unwrap(), ok);
    }

    fn event_roundtrip<C: Codec>() {
        #[derive(Serialize, Deserialize, Debug, PartialEq, Clone)]
        enum Event {
            Text { text: String },
            Count { n: i32 },
            Table { map: BTreeMap<String, i32> },
        }

        let mut enc = C::encoder();
        let mut dec = C::decoder();

        let mut map = BTreeMap::new();
        map.insert("one".to_string(), 1);
        map.insert("two".to_string(), 2);

        for event in [
            Event::Text {
                text: "hello".into(),
            },
            Event::Count { n: 123654 },
            Event::Table { map },
        ] {
            let msg = encode_event(&mut enc, "Source::broadcast_event", &event).unwrap();
            let func = read_envelope(&mut dec, payload_of(msg)).unwrap();
            assert_eq!(func, "Source::broadcast_event");
            let back: Event = decode_event(&mut dec).unwrap();
            assert_eq!(back, event);
        }
    }

    fn vector_roundtrip<C: Codec>() {
        let mut enc = C::encoder();
        let mut dec = C::decoder();

        let values: Vec<i64> = (0..1024).map(|i| i64::MAX - i).collect();
        let result: CallResult<Vec<i64>> = CallResult::Ok(values.clone());
        let msg = encode_result(&mut enc, "Calculator::add_vector", &result).unwrap();
        read_envelope(&mut dec, payload_of(msg)).unwrap();
        let back = decode_result::<_, Vec<i64>>(&mut dec).unwrap();
        assert_eq!(back.ok().unwrap(), values);
    }

    #[test]
    fn test_msgpack_call_roundtrip() {
        call_roundtrip::<MsgpackCodec>();
    }

    #[test]
    fn test_json_call_roundtrip() {
        call_roundtrip::<JsonCodec>();
    }

    #[test]
    fn test_msgpack_result_roundtrip() {
        result_roundtrip::<MsgpackCodec>();
    }

    #[test]
    fn test_json_result_roundtrip() {
        result_roundtrip::<JsonCodec>();
    }

    #[test]
    fn test_msgpack_void_result() {
        void_result_roundtrip::<MsgpackCodec>();
    }

    #[test]
    fn test_json_void_result() {
        void_result_roundtrip::<JsonCodec>();
    }

    #[test]
    fn test_msgpack_event_roundtrip() {
        event_roundtrip::<MsgpackCodec>();
    }

    #[test]
    fn test_json_event_roundtrip() {
        event_roundtrip::<JsonCodec>();
    }

    #[test]
    fn test_msgpack_large_vector() {
        vector_roundtrip::<MsgpackCodec>();
    }

    #[test]
    fn test_json_large_vector() {
        vector_roundtrip::<JsonCodec>();
    }

    #[test]
    fn test_error_result_carries_no_value() {
        let mut enc = MsgpackCodec::encoder();
        let mut dec = MsgpackCodec::decoder();

        let err: CallResult<i32> = CallResult::Err(CallError::new(7, "x"));
        let msg = encode_result(&mut enc, "F::f", &err).unwrap();
        read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(decode_result::<_, i32>(&mut dec).unwrap(), err);
        // Nothing follows the error on the wire.
        assert!(dec.get::<i32>().is_err());
    }

    #[test]
    fn test_empty_args_tuple() {
        let mut enc = MsgpackCodec::encoder();
        let mut dec = MsgpackCodec::decoder();
        let msg = encode_call(&mut enc, "Service::nop", &()).unwrap();
        let func = read_envelope(&mut dec, payload_of(msg)).unwrap();
        assert_eq!(func, "Service::nop");
        <()>::decode_args(&mut dec).unwrap();
    }
}
