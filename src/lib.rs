//! # wirecall
//!
//! A bidirectional RPC runtime for microservices over message-oriented
//! transports.
//!
//! Clients invoke named operations on a remote service and receive the
//! result through a per-call continuation; services dispatch through a
//! function table and may broadcast typed events to every connected
//! client. The runtime is transport-agnostic (anything implementing the
//! [`Transport`]/[`Acceptor`] contracts) and serialization-agnostic
//! (anything implementing [`Codec`]; MessagePack and JSON ship in-tree).
//!
//! ## Architecture
//!
//! - **Framing**: 4-byte little-endian length prefix, reassembled by a
//!   per-session state machine ([`framing`]).
//! - **Envelope**: every message starts with a fully qualified function
//!   name; calls carry positional arguments, results and events carry a
//!   single result value ([`codec`]).
//! - **Client**: at most one outstanding call per function name, a bounded
//!   queue behind it, error fan-out to every continuation when the session
//!   dies ([`client`]).
//! - **Service**: per-session dispatch with in-progress rejection of
//!   duplicate concurrent calls, single-shot responders, best-effort
//!   broadcast fan-out ([`service`]).
//!
//! Everything runs on one thread per runtime instance; clients and
//! services are `!Send`, so cross-thread misuse is a compile error.
//!
//! ## Example
//!
//! ```ignore
//! use wirecall::codec::MsgpackCodec;
//! use wirecall::net::{TcpAcceptor, TcpTransport};
//! use wirecall::{Client, Responder, Service};
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0");
//! let service = Service::<MsgpackCodec>::builder("Calculator")
//!     .handle("add", |_ctx, (a, b): (i32, i32), reply: Responder<_, i32>| {
//!         reply.ok(a + b);
//!         Ok(())
//!     })
//!     .build(acceptor.clone())?;
//! service.start(16)?;
//!
//! let addr = acceptor.local_addr().unwrap().to_string();
//! let client = Client::<MsgpackCodec>::new(TcpTransport::connect_to(addr), "Calculator");
//! client.open()?;
//! client.call("add", (2, 3), |result| assert_eq!(result.ok(), Some(5)))?;
//! ```

pub mod acceptor;
pub mod codec;
pub mod error;
pub mod framing;
pub mod loopback;
pub mod net;
pub mod transport;

mod client;
mod dict;
mod queue;
mod service;

pub use acceptor::{Acceptor, AcceptorListener};
pub use client::{Client, ClientConfig, EventListener};
pub use codec::{Codec, Decoder, Encoder};
pub use error::{codes, CallError, CallResult, Error, Result};
pub use service::{CallContext, Responder, Service, ServiceBuilder};
pub use transport::{SessionKey, SessionState, Transport, TransportListener};
