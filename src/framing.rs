//! Length-prefixed framing.
//!
//! Every wire message is `u32` little-endian payload length followed by
//! exactly that many payload bytes. A zero length is a protocol violation
//! and fails the session.
//!
//! [`Framer`] is the read-side state machine. It alternates between two
//! states and is driven purely by bytes becoming available:
//!
//! - `Header`: waiting for the 4 length bytes,
//! - `Message`: waiting for the announced payload.
//!
//! The framer never buffers a message itself; the transport owns the byte
//! buffer and the framer consumes from it through
//! [`Transport::get_read_data`], arming the next threshold with
//! [`Transport::read`].
//!
//! On the write side, messages are encoded with [`reserve_header`] space up
//! front and [`finalize`] writes the length prefix in place, so no second
//! buffer is needed.
//!
//! [`reserve_header`]: Framer::reserve_header
//! [`finalize`]: Framer::finalize

use std::rc::Rc;

use bytes::Bytes;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// Length prefix size in bytes.
pub const HEADER_SIZE: usize = 4;

/// Largest encodable payload: the prefix must hold `payload + header`.
pub const MAX_PAYLOAD: usize = u32::MAX as usize - HEADER_SIZE;

/// Read-side state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ReadState {
    /// Waiting for the 4 header bytes.
    Header,
    /// Header parsed; waiting for the payload.
    Message,
}

/// Converts a byte stream into discrete messages.
///
/// One framer per session; reassembly state never crosses sessions.
pub struct Framer {
    state: ReadState,
    pending_len: u32,
}

impl Framer {
    /// Create a framer in the header-awaiting state.
    pub fn new() -> Self {
        Self {
            state: ReadState::Header,
            pending_len: 0,
        }
    }

    /// Start (or restart) reading: reset to the header state and arm the
    /// first header read.
    pub fn begin(&mut self, transport: &dyn Transport) {
        self.state = ReadState::Header;
        self.pending_len = 0;
        transport.read(HEADER_SIZE);
    }

    /// Consume buffered bytes, delivering every complete message to
    /// `on_message`. `available` is the transport's buffered length.
    /// Returns the number of bytes consumed.
    ///
    /// Errors (zero or oversized length prefix, or an error from
    /// `on_message`) fail the session.
    pub fn on_data<F>(
        &mut self,
        transport: &Rc<dyn Transport>,
        available: usize,
        mut on_message: F,
    ) -> Result<usize>
    where
        F: FnMut(&Rc<dyn Transport>, Bytes) -> Result<()>,
    {
        let mut remaining = available;
        let mut consumed = 0usize;

        loop {
            match self.state {
                ReadState::Header if remaining >= HEADER_SIZE => {
                    let header = transport.get_read_data();
                    debug_assert!(header.len() >= HEADER_SIZE);
                    let len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]);
                    if len == 0 {
                        return Err(Error::Protocol("zero-length message received".into()));
                    }
                    if len as usize > MAX_PAYLOAD {
                        return Err(Error::Protocol(format!(
                            "message length {len} exceeds maximum {MAX_PAYLOAD}"
                        )));
                    }
                    consumed += HEADER_SIZE;
                    remaining -= HEADER_SIZE;
                    self.state = ReadState::Message;
                    self.pending_len = len;
                    transport.read(len as usize);
                }
                ReadState::Message if remaining >= self.pending_len as usize => {
                    let len = self.pending_len as usize;
                    let payload = transport.get_read_data();
                    debug_assert!(payload.len() >= len);
                    consumed += len;
                    remaining -= len;
                    self.state = ReadState::Header;
                    self.pending_len = 0;
                    transport.read(HEADER_SIZE);
                    on_message(transport, payload.slice(..len))?;
                }
                _ => break,
            }
        }
        Ok(consumed)
    }

    /// Reserve header space at the front of a message under construction.
    pub fn reserve_header(buf: &mut Vec<u8>) {
        buf.extend_from_slice(&[0u8; HEADER_SIZE]);
    }

    /// Fill in the length prefix of a message built with reserved header
    /// space. Fails with [`Error::MessageTooLong`] before anything reaches
    /// the wire.
    pub fn finalize(mut msg: Vec<u8>) -> Result<Bytes> {
        debug_assert!(msg.len() >= HEADER_SIZE, "message missing header space");
        let payload_len = msg.len() - HEADER_SIZE;
        if payload_len > MAX_PAYLOAD {
            return Err(Error::MessageTooLong);
        }
        let prefix = (payload_len as u32).to_le_bytes();
        msg[..HEADER_SIZE].copy_from_slice(&prefix);
        Ok(Bytes::from(msg))
    }

    /// Finalize a message and hand it to the transport as one write.
    pub fn write_frame(transport: &dyn Transport, msg: Vec<u8>) -> Result<()> {
        transport.write(Self::finalize(msg)?)
    }

    /// Drop the reserved header space, leaving the bare payload. Used when
    /// a locally built message is fed back through the decode path instead
    /// of the wire.
    pub fn strip_header(msg: Vec<u8>) -> Bytes {
        Bytes::from(msg).slice(HEADER_SIZE..)
    }
}

impl Default for Framer {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::{OpenClosure, TransportListener};
    use bytes::BytesMut;
    use std::cell::{Cell, RefCell};

    /// Minimal in-memory transport: bytes are pushed in by the test and
    /// consumed by the framer through the read/get_read_data protocol.
    struct StubTransport {
        buf: RefCell<BytesMut>,
        requested: Cell<usize>,
        written: RefCell<Vec<Bytes>>,
    }

    impl StubTransport {
        fn new() -> Rc<Self> {
            Rc::new(Self {
                buf: RefCell::new(BytesMut::new()),
                requested: Cell::new(0),
                written: RefCell::new(Vec::new()),
            })
        }

        fn push(&self, data: &[u8]) {
            self.buf.borrow_mut().extend_from_slice(data);
        }

        fn available(&self) -> usize {
            self.buf.borrow().len()
        }
    }

    impl Transport for StubTransport {
        fn set_listener(&self, _listener: Rc<dyn TransportListener>) {}
        fn clear_listener(&self) {}
        fn is_open(&self) -> bool {
            true
        }
        fn open(&self) -> Result<()> {
            Ok(())
        }
        fn open_with(&self, done: OpenClosure) {
            done(Ok(()));
        }
        fn close(&self) {}
        fn read(&self, len: usize) {
            self.requested.set(len);
        }
        fn get_read_data(&self) -> Bytes {
            let len = self.requested.replace(0);
            self.buf.borrow_mut().split_to(len).freeze()
        }
        fn write(&self, frame: Bytes) -> Result<()> {
            self.written.borrow_mut().push(frame);
            Ok(())
        }
    }

    fn frame_bytes(payload: &[u8]) -> Vec<u8> {
        let mut msg = Vec::new();
        Framer::reserve_header(&mut msg);
        msg.extend_from_slice(payload);
        Framer::finalize(msg).unwrap().to_vec()
    }

    fn drive(framer: &mut Framer, tr: &Rc<StubTransport>) -> Result<Vec<Bytes>> {
        let dyn_tr: Rc<dyn Transport> = tr.clone();
        let messages = Rc::new(RefCell::new(Vec::new()));
        let sink = messages.clone();
        framer.on_data(&dyn_tr, tr.available(), move |_t, payload| {
            sink.borrow_mut().push(payload);
            Ok(())
        })?;
        Ok(Rc::try_unwrap(messages).unwrap().into_inner())
    }

    #[test]
    fn test_single_complete_frame() {
        let tr = StubTransport::new();
        let mut framer = Framer::new();
        framer.begin(&*tr);

        tr.push(&frame_bytes(b"hello"));
        let messages = drive(&mut framer, &tr).unwrap();

        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"hello");
        assert_eq!(tr.available(), 0);
    }

    #[test]
    fn test_multiple_frames_in_one_delivery() {
        let tr = StubTransport::new();
        let mut framer = Framer::new();
        framer.begin(&*tr);

        let mut data = frame_bytes(b"first");
        data.extend(frame_bytes(b"second"));
        data.extend(frame_bytes(b"third"));
        tr.push(&data);

        let messages = drive(&mut framer, &tr).unwrap();
        assert_eq!(messages.len(), 3);
        assert_eq!(&messages[0][..], b"first");
        assert_eq!(&messages[1][..], b"second");
        assert_eq!(&messages[2][..], b"third");
    }

    #[test]
    fn test_fragmented_header_and_payload() {
        let tr = StubTransport::new();
        let mut framer = Framer::new();
        framer.begin(&*tr);

        let bytes = frame_bytes(b"fragmented payload");

        tr.push(&bytes[..2]);
        assert!(drive(&mut framer, &tr).unwrap().is_empty());

        tr.push(&bytes[2..HEADER_SIZE + 5]);
        assert!(drive(&mut framer, &tr).unwrap().is_empty());

        tr.push(&bytes[HEADER_SIZE + 5..]);
        let messages = drive(&mut framer, &tr).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(&messages[0][..], b"fragmented payload");
    }

    #[test]
    fn test_byte_at_a_time() {
        let tr = StubTransport::new();
        let mut framer = Framer::new();
        framer.begin(&*tr);

        let bytes = frame_bytes(b"hi");
        let mut all = Vec::new();
        for b in &bytes {
            tr.push(&[*b]);
            all.extend(drive(&mut framer, &tr).unwrap());
        }
        assert_eq!(all.len(), 1);
        assert_eq!(&all[0][..], b"hi");
    }

    #[test]
    fn test_zero_length_rejected() {
        let tr = StubTransport::new();
        let mut framer = Framer::new();
        framer.begin(&*tr);

        tr.push(&[0, 0, 0, 0]);
        let err = drive(&mut framer, &tr).unwrap_err();
        assert!(matches!(err, Error::Protocol(_)));
    }

    #[test]
    fn test_finalize_writes_little_endian_prefix() {
        let mut msg = Vec::new();
        Framer::reserve_header(&mut msg);
        msg.extend_from_slice(b"abc");
        let framed = Framer::finalize(msg).unwrap();

        assert_eq!(&framed[..HEADER_SIZE], &3u32.to_le_bytes());
        assert_eq!(&framed[HEADER_SIZE..], b"abc");
        assert_eq!(framed.len() - HEADER_SIZE, 3);
    }

    #[test]
    fn test_strip_header() {
        let mut msg = Vec::new();
        Framer::reserve_header(&mut msg);
        msg.extend_from_slice(b"payload");
        assert_eq!(&Framer::strip_header(msg)[..], b"payload");
    }

    #[test]
    fn test_write_frame_reaches_transport() {
        let tr = StubTransport::new();
        let mut msg = Vec::new();
        Framer::reserve_header(&mut msg);
        msg.extend_from_slice(b"out");
        Framer::write_frame(&*tr, msg).unwrap();

        let written = tr.written.borrow();
        assert_eq!(written.len(), 1);
        assert_eq!(&written[0][HEADER_SIZE..], b"out");
    }
}
