//! Acceptor contract consumed by the service runtime.
//!
//! An [`Acceptor`] is the server endpoint: it opens a listening socket (or
//! its in-memory equivalent) and hands every accepted connection to its
//! [`AcceptorListener`] as a fresh [`Transport`].

use std::rc::Rc;

use crate::error::{Error, Result};
use crate::transport::Transport;

/// A server endpoint producing accepted client transports.
pub trait Acceptor {
    /// Install the listener. Must happen before `open`.
    fn set_listener(&self, listener: Rc<dyn AcceptorListener>);

    /// Drop the listener.
    fn clear_listener(&self);

    /// Whether the endpoint is accepting connections.
    fn is_open(&self) -> bool;

    /// Open the endpoint. `max_pending` bounds the accept backlog when
    /// positive; zero or negative selects the platform default.
    fn open(&self, max_pending: i32) -> Result<()>;

    /// Close the endpoint; no further clients can connect. Established
    /// sessions are unaffected.
    fn close(&self);
}

/// Callbacks an [`Acceptor`] delivers to its owner.
pub trait AcceptorListener {
    /// A client connected; `transport` is its session, still unopened.
    fn on_client_accepted(&self, transport: Rc<dyn Transport>);

    /// Accepting failed.
    fn on_accept_error(&self, error: Error);
}
