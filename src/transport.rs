//! Transport contract consumed by the runtime.
//!
//! A [`Transport`] is one reliable, ordered byte stream - one session. The
//! runtime drives it through a small callback protocol:
//!
//! 1. the owner (client or service) installs itself as the
//!    [`TransportListener`],
//! 2. the framer arms a read threshold with [`Transport::read`],
//! 3. when at least that many bytes are buffered, the transport calls
//!    [`TransportListener::on_incoming_data`] with the buffered length,
//! 4. the listener consumes bytes through [`Transport::get_read_data`] and
//!    arms the next threshold.
//!
//! Writes may complete asynchronously, but a transport must never invoke
//! listener callbacks synchronously from [`Transport::write`]; deliveries
//! always go through the driver. The runtime relies on this to finish its
//! own bookkeeping (installing a result closure, for instance) after a
//! write returns.
//!
//! Implementations in this crate: [`crate::loopback`] (in-memory, for tests
//! and embedding) and [`crate::net::tcp`] (tokio).

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Created, not yet opened.
    New,
    /// Connected; reads and writes are live.
    Open,
    /// Closed by either side, by an error, or explicitly.
    Closed,
}

/// Continuation for an asynchronous [`Transport::open_with`] /
/// `Client::open_with`.
pub type OpenClosure = Box<dyn FnOnce(Result<()>)>;

/// One reliable, ordered byte stream between a client and a service.
pub trait Transport {
    /// Install the listener. Must happen before `open`.
    fn set_listener(&self, listener: Rc<dyn TransportListener>);

    /// Drop the listener. Owners call this when tearing down to break the
    /// listener/transport reference cycle.
    fn clear_listener(&self);

    /// Whether the session is in the OPEN state.
    fn is_open(&self) -> bool;

    /// Open the session, blocking until the connection is established.
    fn open(&self) -> Result<()>;

    /// Open the session asynchronously; `done` fires with the outcome.
    /// If the session is already open, `done` fires immediately with
    /// [`Error::AlreadyConnected`].
    fn open_with(&self, done: OpenClosure);

    /// Close the session. The peer observes end-of-stream. Listener
    /// callbacks are not invoked for a local close.
    fn close(&self);

    /// Arm the next delivery: once at least `len` bytes are buffered,
    /// [`TransportListener::on_incoming_data`] fires.
    fn read(&self, len: usize);

    /// Hand over exactly the bytes requested by the previous [`read`] call
    /// and advance the read head past them.
    ///
    /// [`read`]: Transport::read
    fn get_read_data(&self) -> Bytes;

    /// Write one frame. May be queued; completion is not reported here -
    /// write failures surface through
    /// [`TransportListener::on_connection_error`].
    fn write(&self, frame: Bytes) -> Result<()>;
}

/// Callbacks a [`Transport`] delivers to its owner.
pub trait TransportListener {
    /// The session reached the OPEN state.
    fn on_connected(&self, _transport: &Rc<dyn Transport>) {}

    /// The session left the OPEN state (peer close or failure). Fires after
    /// `on_connection_error` when an error caused it.
    fn on_disconnected(&self, transport: &Rc<dyn Transport>);

    /// The session failed. The transport has already closed itself.
    fn on_connection_error(&self, transport: &Rc<dyn Transport>, error: Error);

    /// At least the requested number of bytes is buffered; `available` is
    /// the total buffered length. Returns the number of bytes consumed.
    /// An `Err` fails the session.
    fn on_incoming_data(&self, transport: &Rc<dyn Transport>, available: usize) -> Result<usize>;
}

/// Opaque identity of a session, derived from its transport handle.
///
/// Stable for the lifetime of the `Rc` allocation; used as the key of the
/// service's session map and of pending-call entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionKey(usize);

impl SessionKey {
    /// Key for the session behind `transport`.
    pub fn of(transport: &Rc<dyn Transport>) -> Self {
        Self(Rc::as_ptr(transport) as *const () as usize)
    }
}

/// Shared read-side plumbing for transport implementations: the byte
/// buffer, the armed threshold, and the delivery loop with a re-entrancy
/// guard (listeners arm the next threshold from inside the callback).
pub(crate) struct Inbox {
    buf: RefCell<BytesMut>,
    requested: Cell<usize>,
    pumping: Cell<bool>,
}

impl Inbox {
    pub(crate) fn new() -> Self {
        Self {
            buf: RefCell::new(BytesMut::with_capacity(8 * 1024)),
            requested: Cell::new(0),
            pumping: Cell::new(false),
        }
    }

    /// Append freshly received bytes.
    pub(crate) fn push(&self, data: &[u8]) {
        self.buf.borrow_mut().extend_from_slice(data);
    }

    /// Arm the delivery threshold.
    pub(crate) fn request(&self, len: usize) {
        self.requested.set(len);
    }

    /// Detach the previously requested bytes and advance the read head.
    pub(crate) fn take_requested(&self) -> Bytes {
        let len = self.requested.replace(0);
        self.buf.borrow_mut().split_to(len).freeze()
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.buf.borrow().len()
    }

    /// Drop all buffered bytes and the armed threshold.
    pub(crate) fn clear(&self) {
        self.buf.borrow_mut().clear();
        self.requested.set(0);
    }

    /// Deliver buffered bytes to the listener for as long as the armed
    /// threshold is met. Re-entrant invocations (from `read` inside the
    /// callback) are no-ops; the outer loop picks up the new threshold.
    pub(crate) fn pump(
        &self,
        transport: &Rc<dyn Transport>,
        listener: &Rc<dyn TransportListener>,
    ) -> Result<()> {
        if self.pumping.get() {
            return Ok(());
        }
        self.pumping.set(true);
        let outcome = loop {
            let need = self.requested.get();
            let avail = self.buf.borrow().len();
            if need == 0 || avail < need {
                break Ok(());
            }
            match listener.on_incoming_data(transport, avail) {
                Ok(_) => {
                    // A listener that consumed nothing and kept the same
                    // threshold would spin; bail out instead.
                    if self.requested.get() == need && self.buf.borrow().len() == avail {
                        tracing::warn!(need, avail, "listener made no progress, stopping pump");
                        break Ok(());
                    }
                }
                Err(e) => break Err(e),
            }
        };
        self.pumping.set(false);
        outcome
    }
}
