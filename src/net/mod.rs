//! Socket-backed implementations of the transport and acceptor contracts.

pub mod tcp;

pub use tcp::{TcpAcceptor, TcpTransport};
