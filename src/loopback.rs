//! In-memory transport for tests and single-process embedding.
//!
//! A [`LoopbackTransport`] pair connects a client and a service inside one
//! process. Deliveries never happen synchronously from `write`: every
//! notification is queued on the shared [`LoopbackHub`] and runs when the
//! test (or embedder) drains it with [`LoopbackHub::run_until_idle`]. That
//! keeps the runtime's write-then-bookkeep sequences sound and makes test
//! interleavings fully deterministic.
//!
//! ```ignore
//! let hub = LoopbackHub::new();
//! let acceptor = LoopbackAcceptor::new(&hub);
//! let service = Service::<MsgpackCodec>::builder("Echo")
//!     .handle("echo", |_ctx, (s,): (String,), reply: Responder<_, String>| {
//!         reply.ok(s);
//!         Ok(())
//!     })
//!     .build(acceptor.clone())?;
//! service.start(-1)?;
//!
//! let client = Client::<MsgpackCodec>::new(acceptor.connect()?, "Echo");
//! client.open()?;
//! client.call("echo", ("hi".to_string(),), |res| println!("{res:?}"))?;
//! hub.run_until_idle();
//! ```

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::io;
use std::rc::{Rc, Weak};

use bytes::Bytes;

use crate::acceptor::{Acceptor, AcceptorListener};
use crate::error::{Error, Result};
use crate::transport::{
    Inbox, OpenClosure, SessionState, Transport, TransportListener,
};

/// Single-threaded deferred-delivery queue shared by every loopback
/// endpoint of one test. The driver of spec parlance: transports post
/// notifications here and [`run_until_idle`] executes them in order.
///
/// [`run_until_idle`]: LoopbackHub::run_until_idle
#[derive(Clone, Default)]
pub struct LoopbackHub {
    tasks: Rc<RefCell<VecDeque<Box<dyn FnOnce()>>>>,
}

impl LoopbackHub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a notification for the next drain.
    pub fn post(&self, task: impl FnOnce() + 'static) {
        self.tasks.borrow_mut().push_back(Box::new(task));
    }

    /// Run queued notifications (including ones they queue in turn) until
    /// none remain. Returns how many ran.
    pub fn run_until_idle(&self) -> usize {
        let mut ran = 0;
        loop {
            let task = self.tasks.borrow_mut().pop_front();
            match task {
                Some(task) => {
                    task();
                    ran += 1;
                }
                None => return ran,
            }
        }
    }
}

/// One end of an in-memory session.
pub struct LoopbackTransport {
    hub: LoopbackHub,
    weak_self: Weak<LoopbackTransport>,
    peer: RefCell<Weak<LoopbackTransport>>,
    listener: RefCell<Option<Rc<dyn TransportListener>>>,
    state: Cell<SessionState>,
    inbox: Inbox,
}

impl LoopbackTransport {
    /// Create a connected pair of endpoints in the NEW state.
    pub fn pair(hub: &LoopbackHub) -> (Rc<Self>, Rc<Self>) {
        let a = Rc::new_cyclic(|weak| Self::with_weak(hub.clone(), weak.clone()));
        let b = Rc::new_cyclic(|weak| Self::with_weak(hub.clone(), weak.clone()));
        *a.peer.borrow_mut() = Rc::downgrade(&b);
        *b.peer.borrow_mut() = Rc::downgrade(&a);
        (a, b)
    }

    fn with_weak(hub: LoopbackHub, weak_self: Weak<LoopbackTransport>) -> Self {
        Self {
            hub,
            weak_self,
            peer: RefCell::new(Weak::new()),
            listener: RefCell::new(None),
            state: Cell::new(SessionState::New),
            inbox: Inbox::new(),
        }
    }

    fn as_dyn(&self) -> Rc<dyn Transport> {
        self.weak_self
            .upgrade()
            .expect("loopback endpoint alive during callback")
    }

    /// Deliver buffered bytes to the listener; a listener error fails the
    /// session.
    fn pump(&self) {
        if self.state.get() != SessionState::Open {
            return;
        }
        let Some(listener) = self.listener.borrow().clone() else {
            return;
        };
        let transport = self.as_dyn();
        if let Err(e) = self.inbox.pump(&transport, &listener) {
            self.fail(e);
        }
    }

    /// Close and report the failure: error first, then disconnect.
    fn fail(&self, error: Error) {
        if self.state.replace(SessionState::Closed) != SessionState::Open {
            return;
        }
        self.inbox.clear();
        self.notify_peer_of_close();
        // Clone the listener out first: the callbacks may clear it.
        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            let transport = self.as_dyn();
            listener.on_connection_error(&transport, error);
            listener.on_disconnected(&transport);
        }
    }

    /// The peer closed: observed as end-of-stream.
    fn on_peer_closed(&self) {
        self.fail(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }

    fn notify_peer_of_close(&self) {
        if let Some(peer) = self.peer.borrow().upgrade() {
            let weak = Rc::downgrade(&peer);
            self.hub.post(move || {
                if let Some(peer) = weak.upgrade() {
                    peer.on_peer_closed();
                }
            });
        }
    }

    /// Queue a delivery pass. `read` must not deliver inline: it is called
    /// from inside listener callbacks (arming the next threshold) and at
    /// session start while the caller still holds its framer.
    fn schedule_pump(&self) {
        let weak = self.weak_self.clone();
        self.hub.post(move || {
            if let Some(transport) = weak.upgrade() {
                transport.pump();
            }
        });
    }
}

impl Transport for LoopbackTransport {
    fn set_listener(&self, listener: Rc<dyn TransportListener>) {
        *self.listener.borrow_mut() = Some(listener);
    }

    fn clear_listener(&self) {
        *self.listener.borrow_mut() = None;
    }

    fn is_open(&self) -> bool {
        self.state.get() == SessionState::Open
    }

    fn open(&self) -> Result<()> {
        match self.state.get() {
            SessionState::Open => Err(Error::AlreadyConnected),
            SessionState::Closed => Err(Error::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "loopback session cannot be reopened",
            ))),
            SessionState::New => {
                if self.peer.borrow().upgrade().is_none() {
                    return Err(Error::Io(io::Error::new(
                        io::ErrorKind::ConnectionRefused,
                        "peer endpoint is gone",
                    )));
                }
                self.state.set(SessionState::Open);
                let listener = self.listener.borrow().clone();
                if let Some(listener) = listener {
                    listener.on_connected(&self.as_dyn());
                }
                Ok(())
            }
        }
    }

    fn open_with(&self, done: OpenClosure) {
        // Loopback connects synchronously; only the completion is direct.
        done(self.open());
    }

    fn close(&self) {
        if self.state.replace(SessionState::Closed) != SessionState::Open {
            return;
        }
        self.inbox.clear();
        self.notify_peer_of_close();
    }

    fn read(&self, len: usize) {
        self.inbox.request(len);
        self.schedule_pump();
    }

    fn get_read_data(&self) -> Bytes {
        self.inbox.take_requested()
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        if self.state.get() != SessionState::Open {
            return Err(Error::NotConnected);
        }
        let Some(peer) = self.peer.borrow().upgrade() else {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer endpoint is gone",
            )));
        };
        if peer.state.get() == SessionState::Closed {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "peer session is closed",
            )));
        }
        peer.inbox.push(&frame);
        let weak = Rc::downgrade(&peer);
        self.hub.post(move || {
            if let Some(peer) = weak.upgrade() {
                peer.pump();
            }
        });
        Ok(())
    }
}

/// In-memory acceptor. Tests connect clients with
/// [`LoopbackAcceptor::connect`]; the service side receives the paired
/// endpoint through its listener on the next hub drain.
pub struct LoopbackAcceptor {
    hub: LoopbackHub,
    listener: RefCell<Option<Rc<dyn AcceptorListener>>>,
    open: Cell<bool>,
}

impl LoopbackAcceptor {
    pub fn new(hub: &LoopbackHub) -> Rc<Self> {
        Rc::new(Self {
            hub: hub.clone(),
            listener: RefCell::new(None),
            open: Cell::new(false),
        })
    }

    /// Establish a new session. Returns the client endpoint; the service
    /// endpoint is announced via `on_client_accepted`.
    pub fn connect(&self) -> Result<Rc<LoopbackTransport>> {
        if !self.open.get() {
            return Err(Error::Io(io::Error::new(
                io::ErrorKind::ConnectionRefused,
                "acceptor is not open",
            )));
        }
        let Some(listener) = self.listener.borrow().clone() else {
            return Err(Error::Logic("acceptor has no listener".into()));
        };
        let (client_end, service_end) = LoopbackTransport::pair(&self.hub);
        self.hub.post(move || {
            listener.on_client_accepted(service_end);
        });
        Ok(client_end)
    }
}

impl Acceptor for LoopbackAcceptor {
    fn set_listener(&self, listener: Rc<dyn AcceptorListener>) {
        *self.listener.borrow_mut() = Some(listener);
    }

    fn clear_listener(&self) {
        *self.listener.borrow_mut() = None;
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn open(&self, _max_pending: i32) -> Result<()> {
        self.open.set(true);
        Ok(())
    }

    fn close(&self) {
        self.open.set(false);
    }
}
