//! TCP transport and acceptor on tokio.
//!
//! The runtime is single-threaded and callback-driven, so these
//! implementations run on a current-thread tokio runtime inside a
//! `LocalSet`: each session spawns a local reader task (socket to inbox to
//! listener) and a local writer task (queue to socket). Listener callbacks
//! fire from those tasks - never synchronously from `write` - which is
//! exactly the deferred-delivery contract the runtime requires.
//!
//! `open()` is the blocking variant: it connects through `std::net` and
//! hands the socket to tokio. `open_with` connects asynchronously.
//!
//! # Example
//!
//! ```ignore
//! let local = tokio::task::LocalSet::new();
//! local.run_until(async {
//!     let acceptor = TcpAcceptor::bind("127.0.0.1:0");
//!     let service = Service::<MsgpackCodec>::builder("Clock")
//!         .handle("get_time", get_time)
//!         .build(acceptor.clone())?;
//!     service.start(16)?;
//!
//!     let addr = acceptor.local_addr().unwrap();
//!     let client = Client::<MsgpackCodec>::new(TcpTransport::connect_to(addr.to_string()), "Clock");
//!     client.open()?;
//!     // ...
//! }).await;
//! ```

use std::cell::{Cell, RefCell};
use std::io;
use std::net::SocketAddr;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpListener, TcpSocket, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::acceptor::{Acceptor, AcceptorListener};
use crate::error::{Error, Result};
use crate::transport::{Inbox, OpenClosure, SessionState, Transport, TransportListener};

/// Accept backlog used when the caller does not bound it.
const DEFAULT_BACKLOG: u32 = 128;

/// Read chunk size for the session reader task.
const READ_CHUNK: usize = 64 * 1024;

/// One TCP session.
pub struct TcpTransport {
    weak_self: Weak<TcpTransport>,
    listener: RefCell<Option<Rc<dyn TransportListener>>>,
    state: Cell<SessionState>,
    inbox: Inbox,
    /// Peer address, client side only.
    connect_addr: Option<String>,
    /// Accepted socket awaiting `open`, service side only.
    accepted: RefCell<Option<TcpStream>>,
    write_tx: RefCell<Option<mpsc::UnboundedSender<Bytes>>>,
    tasks: RefCell<Vec<JoinHandle<()>>>,
}

impl TcpTransport {
    /// Client-side constructor: a NEW session that will connect to `addr`
    /// when opened.
    pub fn connect_to(addr: impl Into<String>) -> Rc<Self> {
        let addr = addr.into();
        Rc::new_cyclic(|weak| Self::with_parts(weak.clone(), Some(addr), None))
    }

    /// Service-side constructor for an accepted socket; `open` starts the
    /// session tasks.
    fn from_accepted(stream: TcpStream) -> Rc<Self> {
        Rc::new_cyclic(|weak| Self::with_parts(weak.clone(), None, Some(stream)))
    }

    fn with_parts(
        weak_self: Weak<TcpTransport>,
        connect_addr: Option<String>,
        accepted: Option<TcpStream>,
    ) -> Self {
        Self {
            weak_self,
            listener: RefCell::new(None),
            state: Cell::new(SessionState::New),
            inbox: Inbox::new(),
            connect_addr,
            accepted: RefCell::new(accepted),
            write_tx: RefCell::new(None),
            tasks: RefCell::new(Vec::new()),
        }
    }

    fn as_dyn(&self) -> Rc<dyn Transport> {
        self.weak_self
            .upgrade()
            .expect("tcp session alive during callback")
    }

    /// Bring a connected socket live: spawn the reader and writer tasks.
    fn start(&self, stream: TcpStream) {
        if let Err(e) = stream.set_nodelay(true) {
            tracing::debug!(error = %e, "set_nodelay failed");
        }
        let (read_half, write_half) = stream.into_split();
        let (tx, rx) = mpsc::unbounded_channel();
        *self.write_tx.borrow_mut() = Some(tx);
        self.state.set(SessionState::Open);

        let reader = tokio::task::spawn_local(read_loop(self.weak_self.clone(), read_half));
        let writer = tokio::task::spawn_local(write_loop(self.weak_self.clone(), write_half, rx));
        self.tasks.borrow_mut().extend([reader, writer]);

        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            listener.on_connected(&self.as_dyn());
        }
    }

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
        self.shutdown_io();
        // Clone the listener out first: the callbacks may clear it.
        let listener = self.listener.borrow().clone();
        if let Some(listener) = listener {
            let transport = self.as_dyn();
            listener.on_connection_error(&transport, error);
            listener.on_disconnected(&transport);
        }
    }

    fn peer_closed(&self) {
        self.fail(Error::Io(io::Error::new(
            io::ErrorKind::UnexpectedEof,
            "connection closed by peer",
        )));
    }

    fn shutdown_io(&self) {
        // Dropping the sender ends the writer task, whose write half shuts
        // the stream down on drop; the reader is cancelled outright.
        self.write_tx.borrow_mut().take();
        for task in self.tasks.borrow_mut().drain(..) {
            task.abort();
        }
        self.inbox.clear();
    }
}

impl Transport for TcpTransport {
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
        if self.state.get() == SessionState::Open {
            return Err(Error::AlreadyConnected);
        }
        if let Some(stream) = self.accepted.borrow_mut().take() {
            self.start(stream);
            return Ok(());
        }
        let addr = self
            .connect_addr
            .clone()
            .ok_or_else(|| Error::Logic("tcp session has no peer address".into()))?;
        let std_stream = std::net::TcpStream::connect(addr.as_str())?;
        std_stream.set_nonblocking(true)?;
        let stream = TcpStream::from_std(std_stream)?;
        self.start(stream);
        Ok(())
    }

    fn open_with(&self, done: OpenClosure) {
        if self.state.get() == SessionState::Open {
            done(Err(Error::AlreadyConnected));
            return;
        }
        if self.accepted.borrow().is_some() {
            done(self.open());
            return;
        }
        let Some(addr) = self.connect_addr.clone() else {
            done(Err(Error::Logic("tcp session has no peer address".into())));
            return;
        };
        let weak = self.weak_self.clone();
        tokio::task::spawn_local(async move {
            let connected = TcpStream::connect(addr.as_str()).await;
            let Some(transport) = weak.upgrade() else {
                return;
            };
            match connected {
                Ok(stream) => {
                    transport.start(stream);
                    done(Ok(()));
                }
                Err(e) => done(Err(Error::Io(e))),
            }
        });
    }

    fn close(&self) {
        if self.state.replace(SessionState::Closed) != SessionState::Open {
            return;
        }
        self.shutdown_io();
    }

    fn read(&self, len: usize) {
        // No inline delivery: the reader task pumps when bytes arrive, and
        // calls from inside a delivery are picked up by the running pump
        // loop. Session start arms the threshold on an empty inbox.
        self.inbox.request(len);
    }

    fn get_read_data(&self) -> Bytes {
        self.inbox.take_requested()
    }

    fn write(&self, frame: Bytes) -> Result<()> {
        if self.state.get() != SessionState::Open {
            return Err(Error::NotConnected);
        }
        let tx = self.write_tx.borrow();
        let Some(tx) = tx.as_ref() else {
            return Err(Error::NotConnected);
        };
        tx.send(frame).map_err(|_| {
            Error::Io(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "session writer is gone",
            ))
        })
    }
}

async fn read_loop(weak: Weak<TcpTransport>, mut read_half: OwnedReadHalf) {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
        match read_half.read(&mut chunk).await {
            Ok(0) => {
                if let Some(transport) = weak.upgrade() {
                    transport.peer_closed();
                }
                return;
            }
            Ok(n) => {
                let Some(transport) = weak.upgrade() else {
                    return;
                };
                transport.inbox.push(&chunk[..n]);
                transport.pump();
            }
            Err(e) => {
                if let Some(transport) = weak.upgrade() {
                    transport.fail(Error::Io(e));
                }
                return;
            }
        }
    }
}

async fn write_loop(
    weak: Weak<TcpTransport>,
    mut write_half: OwnedWriteHalf,
    mut rx: mpsc::UnboundedReceiver<Bytes>,
) {
    while let Some(frame) = rx.recv().await {
        if let Err(e) = write_half.write_all(&frame).await {
            if let Some(transport) = weak.upgrade() {
                transport.fail(Error::Io(e));
            }
            return;
        }
    }
    // Sender dropped: local close. Flush politely; drop shuts the half.
    let _ = write_half.shutdown().await;
}

/// TCP server endpoint.
pub struct TcpAcceptor {
    bind_addr: String,
    listener: RefCell<Option<Rc<dyn AcceptorListener>>>,
    open: Cell<bool>,
    local_addr: Cell<Option<SocketAddr>>,
    accept_task: RefCell<Option<JoinHandle<()>>>,
}

impl TcpAcceptor {
    /// Create an acceptor for `addr` (e.g. `"127.0.0.1:4096"`; port 0
    /// picks a free port, see [`local_addr`]). Binding happens on `open`.
    ///
    /// [`local_addr`]: TcpAcceptor::local_addr
    pub fn bind(addr: impl Into<String>) -> Rc<Self> {
        Rc::new(Self {
            bind_addr: addr.into(),
            listener: RefCell::new(None),
            open: Cell::new(false),
            local_addr: Cell::new(None),
            accept_task: RefCell::new(None),
        })
    }

    /// The bound address, once open.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr.get()
    }
}

impl Acceptor for TcpAcceptor {
    fn set_listener(&self, listener: Rc<dyn AcceptorListener>) {
        *self.listener.borrow_mut() = Some(listener);
    }

    fn clear_listener(&self) {
        *self.listener.borrow_mut() = None;
    }

    fn is_open(&self) -> bool {
        self.open.get()
    }

    fn open(&self, max_pending: i32) -> Result<()> {
        if self.open.get() {
            return Err(Error::AlreadyConnected);
        }
        let callback = self
            .listener
            .borrow()
            .clone()
            .ok_or_else(|| Error::Logic("acceptor has no listener".into()))?;

        let addr: SocketAddr = self
            .bind_addr
            .parse()
            .map_err(|e| Error::Logic(format!("invalid bind address {}: {e}", self.bind_addr)))?;
        let socket = if addr.is_ipv4() {
            TcpSocket::new_v4()?
        } else {
            TcpSocket::new_v6()?
        };
        socket.set_reuseaddr(true)?;
        socket.bind(addr)?;
        let backlog = if max_pending > 0 {
            max_pending as u32
        } else {
            DEFAULT_BACKLOG
        };
        let tcp_listener = socket.listen(backlog)?;
        self.local_addr.set(tcp_listener.local_addr().ok());
        self.open.set(true);

        let task = tokio::task::spawn_local(accept_loop(tcp_listener, callback));
        *self.accept_task.borrow_mut() = Some(task);
        Ok(())
    }

    fn close(&self) {
        self.open.set(false);
        self.local_addr.set(None);
        if let Some(task) = self.accept_task.borrow_mut().take() {
            task.abort();
        }
    }
}

async fn accept_loop(listener: TcpListener, callback: Rc<dyn AcceptorListener>) {
    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tracing::debug!(%peer, "accepted tcp client");
                callback.on_client_accepted(TcpTransport::from_accepted(stream));
            }
            Err(e) => {
                callback.on_accept_error(Error::Io(e));
                return;
            }
        }
    }
}
