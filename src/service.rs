//! Service runtime: acceptor wiring, per-session dispatch, broadcast.
//!
//! A [`Service`] listens on an [`Acceptor`] and runs one session per
//! accepted client: its own framer and codec instances, plus membership in
//! the pending-call set. Dispatch goes through the function table built by
//! [`ServiceBuilder`]; a second concurrent call with the same name on the
//! same session is rejected with an in-progress error without invoking the
//! handler. Results flow back through a single-shot [`Responder`], which a
//! handler may fire immediately or keep for a delayed reply.
//!
//! [`Service::broadcast_event`] fans an event out to every connected
//! session, best-effort: one dead session does not stop delivery to the
//! rest.
//!
//! Like the client, the service is single-threaded by construction.

use std::cell::RefCell;
use std::collections::{HashMap, HashSet};
use std::marker::PhantomData;
use std::rc::{Rc, Weak};

use bytes::Bytes;
use serde::Serialize;

use crate::acceptor::{Acceptor, AcceptorListener};
use crate::codec::{self, Codec};
use crate::dict::FunctionDict;
use crate::error::{CallError, CallResult, Error, Result};
use crate::framing::Framer;
use crate::transport::{SessionKey, Transport, TransportListener};

/// What a handler knows about the call it is serving: the invoking session
/// and the live session set.
pub struct CallContext {
    session: Rc<dyn Transport>,
    directory: Rc<dyn SessionDirectory>,
}

impl CallContext {
    pub(crate) fn new(session: Rc<dyn Transport>, directory: Rc<dyn SessionDirectory>) -> Self {
        Self { session, directory }
    }

    /// The session this call arrived on. Services can use it to tell their
    /// clients apart and keep per-client state.
    pub fn session(&self) -> &Rc<dyn Transport> {
        &self.session
    }

    /// Snapshot of every connected session.
    pub fn connected_sessions(&self) -> Vec<Rc<dyn Transport>> {
        self.directory.connected_sessions()
    }
}

/// Live-session lookup, implemented by the service core.
pub(crate) trait SessionDirectory {
    fn connected_sessions(&self) -> Vec<Rc<dyn Transport>>;
}

/// Result delivery, implemented by the service core. `encode` produces the
/// result message with the session's encoder.
pub(crate) trait ResultSink<C: Codec> {
    fn deliver(
        &self,
        transport: &Rc<dyn Transport>,
        func: &str,
        encode: &mut dyn FnMut(&mut C::Encoder) -> Result<Vec<u8>>,
    );
}

/// Ingredients of a [`Responder`], assembled at dispatch time.
pub(crate) struct ResponderSeed<C: Codec> {
    pub(crate) sink: Rc<dyn ResultSink<C>>,
    pub(crate) transport: Rc<dyn Transport>,
    pub(crate) func: String,
}

/// Single-shot completion for a two-way call.
///
/// Firing it encodes the result with the invoking session's encoder,
/// writes it, and clears the call's pending entry. A responder may outlive
/// the handler invocation (delayed replies); it holds the service core and
/// the session transport alive until it fires or is dropped.
pub struct Responder<C: Codec, R> {
    seed: Option<ResponderSeed<C>>,
    _result: PhantomData<fn(R)>,
}

impl<C: Codec, R: Serialize> Responder<C, R> {
    pub(crate) fn new(seed: ResponderSeed<C>) -> Self {
        Self {
            seed: Some(seed),
            _result: PhantomData,
        }
    }

    /// The session that issued the call.
    pub fn session(&self) -> &Rc<dyn Transport> {
        &self
            .seed
            .as_ref()
            .expect("responder not yet fired")
            .transport
    }

    /// Complete the call successfully.
    pub fn ok(self, value: R) {
        self.send(CallResult::Ok(value));
    }

    /// Complete the call with an error.
    pub fn err(self, error: CallError) {
        self.send(CallResult::Err(error));
    }

    /// Complete the call with an explicit result.
    pub fn send(mut self, result: CallResult<R>) {
        let seed = self.seed.take().expect("responder fires once");
        seed.sink.deliver(&seed.transport, &seed.func, &mut |enc| {
            codec::encode_result(enc, &seed.func, &result)
        });
    }
}

impl<C: Codec, R> Drop for Responder<C, R> {
    fn drop(&mut self) {
        if let Some(seed) = &self.seed {
            tracing::debug!(func = %seed.func, "responder dropped without a result");
        }
    }
}

/// Builder for a [`Service`]: registers the exposed operations, then wires
/// the acceptor.
pub struct ServiceBuilder<C: Codec, E = ()> {
    interface: String,
    dict: FunctionDict<C>,
    defect: Option<Error>,
    _events: PhantomData<E>,
}

impl<C: Codec, E: 'static> ServiceBuilder<C, E> {
    fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            dict: FunctionDict::new(),
            defect: None,
            _events: PhantomData,
        }
    }

    /// Register a two-way operation under `<interface>::<name>`.
    pub fn handle<A, R, F>(mut self, name: &str, handler: F) -> Self
    where
        A: crate::codec::DecodeArgs + 'static,
        R: Serialize + 'static,
        F: Fn(CallContext, A, Responder<C, R>) -> Result<()> + 'static,
    {
        let full = format!("{}::{}", self.interface, name);
        if let Err(e) = self.dict.add::<A, R, F>(full, handler) {
            self.defect.get_or_insert(e);
        }
        self
    }

    /// Register a one-way operation under `<interface>::<name>`.
    pub fn handle_one_way<A, F>(mut self, name: &str, handler: F) -> Self
    where
        A: crate::codec::DecodeArgs + 'static,
        F: Fn(CallContext, A) -> Result<()> + 'static,
    {
        let full = format!("{}::{}", self.interface, name);
        if let Err(e) = self.dict.add_one_way::<A, F>(full, handler) {
            self.defect.get_or_insert(e);
        }
        self
    }

    /// Wire the acceptor and produce the service. Fails on registration
    /// defects (duplicate operation names).
    pub fn build(self, acceptor: Rc<dyn Acceptor>) -> Result<Service<C, E>> {
        if let Some(e) = self.defect {
            return Err(e);
        }
        let broadcast_name = format!("{}::broadcast_event", self.interface);
        let dict = self.dict;
        let inner = Rc::new_cyclic(|weak: &Weak<ServiceInner<C, E>>| ServiceInner {
            weak_self: weak.clone(),
            acceptor: acceptor.clone(),
            broadcast_name,
            dict,
            sessions: RefCell::new(HashMap::new()),
            pending: RefCell::new(HashSet::new()),
            _events: PhantomData,
        });
        acceptor.set_listener(inner.clone());
        Ok(Service { inner })
    }
}

/// A running service instance: one acceptor, many client sessions.
pub struct Service<C: Codec, E = ()> {
    inner: Rc<ServiceInner<C, E>>,
}

impl<C: Codec, E: 'static> Service<C, E> {
    /// Start building a service for `interface`.
    pub fn builder(interface: &str) -> ServiceBuilder<C, E> {
        ServiceBuilder::new(interface)
    }

    /// Open the acceptor and start taking clients. `max_pending_accepts`
    /// bounds the accept backlog when positive; zero or negative selects
    /// the platform default.
    pub fn start(&self, max_pending_accepts: i32) -> Result<()> {
        if self.inner.acceptor.is_open() {
            return Ok(());
        }
        self.inner.acceptor.open(max_pending_accepts)
    }

    /// Close the acceptor and every client session. Still-pending calls
    /// are dropped with a warning.
    pub fn stop(&self) {
        self.inner.acceptor.close();
        let sessions: Vec<ClientState<C>> = self
            .inner
            .sessions
            .borrow_mut()
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in &sessions {
            state.transport.close();
            state.transport.clear_listener();
        }
        for (func, _) in self.inner.pending.borrow_mut().drain() {
            tracing::warn!(func = %func, "service stopped while call pending");
        }
    }

    /// Broadcast an event to every connected client. Each session gets a
    /// freshly encoded message; delivery is best-effort per session.
    pub fn broadcast_event(&self, event: &E)
    where
        E: Serialize,
    {
        let inner = &self.inner;
        let sessions = inner.sessions.borrow();
        for state in sessions.values() {
            let sent = state
                .with_enc(|enc| codec::encode_event(enc, &inner.broadcast_name, event))
                .and_then(|msg| Framer::write_frame(&*state.transport, msg));
            if let Err(e) = sent {
                tracing::warn!(error = %e, "broadcast write failed for one session");
            }
        }
    }

    /// Snapshot of the connected session transports.
    pub fn get_clients(&self) -> Vec<Rc<dyn Transport>> {
        self.inner.connected_sessions()
    }
}

impl<C: Codec, E> Drop for Service<C, E> {
    fn drop(&mut self) {
        self.inner.acceptor.close();
        self.inner.acceptor.clear_listener();
        let sessions: Vec<ClientState<C>> = self
            .inner
            .sessions
            .borrow_mut()
            .drain()
            .map(|(_, state)| state)
            .collect();
        for state in &sessions {
            state.transport.close();
            state.transport.clear_listener();
        }
    }
}

/// Per-session state: the transport, its framer, and its codec instances.
struct ClientState<C: Codec> {
    transport: Rc<dyn Transport>,
    framer: RefCell<Framer>,
    enc: RefCell<Option<C::Encoder>>,
    dec: RefCell<Option<C::Decoder>>,
}

impl<C: Codec> ClientState<C> {
    fn new(transport: Rc<dyn Transport>) -> Self {
        let (enc, dec) = if C::REUSABLE {
            (Some(C::encoder()), Some(C::decoder()))
        } else {
            (None, None)
        };
        Self {
            transport,
            framer: RefCell::new(Framer::new()),
            enc: RefCell::new(enc),
            dec: RefCell::new(dec),
        }
    }

    fn with_enc<T>(&self, f: impl FnOnce(&mut C::Encoder) -> Result<T>) -> Result<T> {
        if C::REUSABLE {
            let mut slot = self.enc.borrow_mut();
            f(slot.get_or_insert_with(C::encoder))
        } else {
            f(&mut C::encoder())
        }
    }

    fn with_dec<T>(&self, f: impl FnOnce(&mut C::Decoder) -> Result<T>) -> Result<T> {
        if C::REUSABLE {
            let mut slot = self.dec.borrow_mut();
            f(slot.get_or_insert_with(C::decoder))
        } else {
            f(&mut C::decoder())
        }
    }
}

struct ServiceInner<C: Codec, E> {
    weak_self: Weak<ServiceInner<C, E>>,
    acceptor: Rc<dyn Acceptor>,
    broadcast_name: String,
    dict: FunctionDict<C>,
    sessions: RefCell<HashMap<SessionKey, ClientState<C>>>,
    pending: RefCell<HashSet<(String, SessionKey)>>,
    _events: PhantomData<E>,
}

impl<C: Codec, E: 'static> ServiceInner<C, E> {
    fn strong(&self) -> Rc<ServiceInner<C, E>> {
        self.weak_self
            .upgrade()
            .expect("service core alive while sessions exist")
    }

    fn handle_message(&self, transport: &Rc<dyn Transport>, payload: Bytes) -> Result<()> {
        let key = SessionKey::of(transport);
        let sessions = self.sessions.borrow();
        let Some(state) = sessions.get(&key) else {
            return Err(Error::Protocol("message from unknown session".into()));
        };

        state.with_dec(|dec| {
            let func = codec::read_envelope(dec, payload)?;
            let Some(entry) = self.dict.get(&func) else {
                return Err(Error::Protocol(format!("unknown function {func}")));
            };

            if !entry.one_way {
                let pending_key = (func.clone(), key);
                if self.pending.borrow().contains(&pending_key) {
                    self.reject_in_progress(state, &func);
                    return Ok(());
                }
                self.pending.borrow_mut().insert(pending_key);
            }

            let ctx = CallContext::new(
                transport.clone(),
                self.strong() as Rc<dyn SessionDirectory>,
            );
            let seed = (!entry.one_way).then(|| ResponderSeed {
                sink: self.strong() as Rc<dyn ResultSink<C>>,
                transport: transport.clone(),
                func: func.clone(),
            });

            match (entry.caller)(ctx, seed, dec) {
                Err(e) if entry.one_way => {
                    // One-way calls have no reply channel; log and drop.
                    tracing::error!(func = %func, error = %e, "one-way handler failed");
                    Ok(())
                }
                other => other,
            }
        })
    }

    /// Tell the caller its previous call with this name has not finished.
    /// The handler is not invoked.
    fn reject_in_progress(&self, state: &ClientState<C>, func: &str) {
        let result: CallResult<()> = CallResult::Err(CallError::operation_in_progress());
        let sent = state
            .with_enc(|enc| codec::encode_result(enc, func, &result))
            .and_then(|msg| Framer::write_frame(&*state.transport, msg));
        if let Err(e) = sent {
            tracing::warn!(func, error = %e, "failed to send in-progress rejection");
        }
    }
}

impl<C: Codec, E: 'static> SessionDirectory for ServiceInner<C, E> {
    fn connected_sessions(&self) -> Vec<Rc<dyn Transport>> {
        self.sessions
            .borrow()
            .values()
            .map(|state| state.transport.clone())
            .collect()
    }
}

impl<C: Codec, E: 'static> ResultSink<C> for ServiceInner<C, E> {
    fn deliver(
        &self,
        transport: &Rc<dyn Transport>,
        func: &str,
        encode: &mut dyn FnMut(&mut C::Encoder) -> Result<Vec<u8>>,
    ) {
        let key = SessionKey::of(transport);
        let pending_key = (func.to_string(), key);
        if !self.pending.borrow().contains(&pending_key) {
            tracing::warn!(func, "call results already delivered");
            return;
        }

        let outcome = {
            let sessions = self.sessions.borrow();
            sessions.get(&key).map(|state| {
                state
                    .with_enc(|enc| encode(enc))
                    .and_then(|msg| Framer::write_frame(&**transport, msg))
            })
        };
        match outcome {
            None => tracing::warn!(func, "cannot send result to disconnected client"),
            Some(Err(e)) => tracing::warn!(func, error = %e, "failed to write call result"),
            Some(Ok(())) => {}
        }

        self.pending.borrow_mut().remove(&pending_key);
    }
}

impl<C: Codec, E: 'static> TransportListener for ServiceInner<C, E> {
    fn on_disconnected(&self, transport: &Rc<dyn Transport>) {
        let key = SessionKey::of(transport);
        if self.sessions.borrow_mut().remove(&key).is_none() {
            return;
        }
        transport.clear_listener();
        self.pending.borrow_mut().retain(|(func, session)| {
            if *session == key {
                tracing::warn!(func = %func, "client disconnected while call pending");
                false
            } else {
                true
            }
        });
    }

    fn on_connection_error(&self, _transport: &Rc<dyn Transport>, error: Error) {
        tracing::warn!(error = %error, "session error");
    }

    fn on_incoming_data(&self, transport: &Rc<dyn Transport>, available: usize) -> Result<usize> {
        let key = SessionKey::of(transport);
        let sessions = self.sessions.borrow();
        let Some(state) = sessions.get(&key) else {
            return Err(Error::Protocol("data from unknown session".into()));
        };
        let mut framer = state.framer.borrow_mut();
        framer.on_data(transport, available, |tr, payload| {
            self.handle_message(tr, payload)
        })
    }
}

impl<C: Codec, E: 'static> AcceptorListener for ServiceInner<C, E> {
    fn on_client_accepted(&self, transport: Rc<dyn Transport>) {
        transport.set_listener(self.strong() as Rc<dyn TransportListener>);
        let key = SessionKey::of(&transport);
        self.sessions
            .borrow_mut()
            .insert(key, ClientState::new(transport.clone()));

        if let Err(e) = transport.open() {
            tracing::error!(error = %e, "failed to open accepted session");
            self.sessions.borrow_mut().remove(&key);
            transport.clear_listener();
            return;
        }

        let sessions = self.sessions.borrow();
        if let Some(state) = sessions.get(&key) {
            state.framer.borrow_mut().begin(&*transport);
        }
        tracing::debug!("accepted client session");
    }

    fn on_accept_error(&self, error: Error) {
        tracing::error!(error = %error, "accept failed");
    }
}
