//! Client runtime: session lifecycle, call tracking, event dispatch.
//!
//! A [`Client`] owns one transport (one session) and tracks every call in
//! flight. Per fully qualified function name there is at most one
//! *outstanding* call - sent and awaiting its result. Further calls with
//! the same name wait in a bounded queue and are flushed head-first as
//! results arrive, so per-function results always come back in call order.
//! Calls to distinct functions proceed independently and may complete in
//! any order.
//!
//! Service broadcasts arrive on the same session under the reserved
//! `<Interface>::broadcast_event` name and fan out to every registered
//! [`EventListener`] in registration order.
//!
//! The client is single-threaded by construction (`Rc`/`RefCell` state
//! makes it `!Send`); all continuations and listener callbacks run on the
//! thread driving the transport.

use std::cell::RefCell;
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::rc::Rc;

use bytes::Bytes;
use serde::de::DeserializeOwned;

use crate::codec::{self, Codec, EncodeArgs};
use crate::error::{CallError, CallResult, Error, Result};
use crate::framing::Framer;
use crate::queue::CallQueue;
use crate::transport::{OpenClosure, Transport, TransportListener};

/// Client tuning knobs.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Calls in progress allowed per function name: one outstanding plus
    /// `max_calls_in_progress - 1` queued. The default of 1 forbids
    /// queueing.
    pub max_calls_in_progress: NonZeroUsize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            max_calls_in_progress: NonZeroUsize::new(1).expect("1 is non-zero"),
        }
    }
}

/// Receives service events on a client session.
pub trait EventListener<E> {
    /// A broadcast event arrived from the service.
    fn on_service_event(&self, event: E);
}

/// Type-erased result continuation: decodes the call's result type from
/// the message and invokes the caller's closure with it.
type ResultClosure<C> = Box<dyn FnOnce(&mut <C as Codec>::Decoder) -> Result<()>>;

fn result_closure<C, R, F>(continuation: F) -> ResultClosure<C>
where
    C: Codec,
    R: DeserializeOwned + 'static,
    F: FnOnce(CallResult<R>) + 'static,
{
    Box::new(move |dec| match codec::decode_result::<_, R>(dec) {
        Ok(result) => {
            continuation(result);
            Ok(())
        }
        Err(e) => {
            // The continuation still fires - no call resolves silently.
            continuation(CallResult::Err(CallError::from(&e)));
            Err(e)
        }
    })
}

/// A connection to one service.
///
/// `C` is the codec; `E` the service's event type (`()` for services that
/// broadcast nothing). Interfaces are exposed by wrapping the client in a
/// typed facade whose methods forward to [`Client::call`]:
///
/// ```ignore
/// struct CalculatorClient {
///     core: Client<MsgpackCodec>,
/// }
///
/// impl CalculatorClient {
///     fn add(&self, a: i8, b: i16, c: i32, done: impl FnOnce(CallResult<i32>) + 'static) {
///         self.core.call("add", (a, b, c), done).unwrap();
///     }
/// }
/// ```
pub struct Client<C: Codec, E = ()> {
    inner: Rc<ClientInner<C, E>>,
}

struct ClientInner<C: Codec, E> {
    transport: Rc<dyn Transport>,
    prefix: String,
    broadcast_name: String,
    queue_limit: usize,
    framer: RefCell<Framer>,
    closures: RefCell<HashMap<String, ResultClosure<C>>>,
    queue: RefCell<CallQueue<ResultClosure<C>>>,
    listeners: RefCell<Vec<Rc<dyn EventListener<E>>>>,
    enc: RefCell<Option<C::Encoder>>,
    dec: RefCell<Option<C::Decoder>>,
}

impl<C, E> Client<C, E>
where
    C: Codec,
    E: DeserializeOwned + Clone + 'static,
{
    /// Create a client for `interface` over `transport`, with the default
    /// configuration. The client installs itself as the transport
    /// listener.
    pub fn new(transport: Rc<dyn Transport>, interface: &str) -> Self {
        Self::with_config(transport, interface, ClientConfig::default())
    }

    /// Create a client with explicit configuration.
    pub fn with_config(
        transport: Rc<dyn Transport>,
        interface: &str,
        config: ClientConfig,
    ) -> Self {
        let inner = Rc::new(ClientInner {
            transport: transport.clone(),
            prefix: format!("{interface}::"),
            broadcast_name: format!("{interface}::broadcast_event"),
            queue_limit: config.max_calls_in_progress.get() - 1,
            framer: RefCell::new(Framer::new()),
            closures: RefCell::new(HashMap::new()),
            queue: RefCell::new(CallQueue::new()),
            listeners: RefCell::new(Vec::new()),
            enc: RefCell::new(None),
            dec: RefCell::new(None),
        });
        transport.set_listener(inner.clone());
        Self { inner }
    }

    /// Open the session, blocking until connected. Opening an already-open
    /// session fails with [`Error::AlreadyConnected`].
    pub fn open(&self) -> Result<()> {
        if self.inner.transport.is_open() {
            return Err(Error::AlreadyConnected);
        }
        self.inner.transport.open()
    }

    /// Open the session asynchronously; `done` fires with the outcome.
    pub fn open_with(&self, done: impl FnOnce(Result<()>) + 'static) {
        if self.inner.transport.is_open() {
            done(Err(Error::AlreadyConnected));
            return;
        }
        self.inner.transport.open_with(Box::new(done) as OpenClosure);
    }

    /// Close the session. Outstanding and queued continuations fire with a
    /// canceled-operation error.
    pub fn close(&self) {
        self.inner.transport.close();
        self.inner.fail_calls(CallError::canceled());
    }

    /// Whether the session is open.
    pub fn is_open(&self) -> bool {
        self.inner.transport.is_open()
    }

    /// Whether a call of `func` (short name, without the interface prefix)
    /// is outstanding on this session.
    pub fn is_call_in_progress(&self, func: &str) -> bool {
        let full = format!("{}{}", self.inner.prefix, func);
        self.inner.closures.borrow().contains_key(&full)
    }

    /// Register an event listener. Listeners are notified in registration
    /// order.
    pub fn add_listener(&self, listener: Rc<dyn EventListener<E>>) {
        self.inner.listeners.borrow_mut().push(listener);
    }

    /// Remove a previously registered listener (compared by identity).
    /// A listener removed while an event is being dispatched still
    /// receives that event.
    pub fn remove_listener(&self, listener: &Rc<dyn EventListener<E>>) {
        self.inner
            .listeners
            .borrow_mut()
            .retain(|l| !Rc::ptr_eq(l, listener));
    }

    /// Invoke `func` with `args`; `continuation` fires with the result.
    ///
    /// Local failures (`NotConnected`, `MessageTooLong`, `QueueOverflow`)
    /// are returned and the continuation never fires. A write failure is
    /// routed to the continuation instead.
    pub fn call<A, R, F>(&self, func: &str, args: A, continuation: F) -> Result<()>
    where
        A: EncodeArgs,
        R: DeserializeOwned + 'static,
        F: FnOnce(CallResult<R>) + 'static,
    {
        let inner = &self.inner;
        if !inner.transport.is_open() {
            return Err(Error::NotConnected);
        }
        let full = format!("{}{}", inner.prefix, func);
        let msg = inner.with_enc(|enc| codec::encode_call(enc, &full, &args))?;

        if !inner.closures.borrow().contains_key(&full) {
            let framed = Framer::finalize(msg)?;
            if let Err(e) = inner.transport.write(framed) {
                tracing::error!(func = %full, error = %e, "call write failed");
                continuation(CallResult::Err(CallError::from(&e)));
                return Ok(());
            }
            inner
                .closures
                .borrow_mut()
                .insert(full, result_closure::<C, R, F>(continuation));
        } else if inner.queue.borrow().can_enqueue(&full, inner.queue_limit) {
            inner
                .queue
                .borrow_mut()
                .enqueue(full, msg, result_closure::<C, R, F>(continuation));
        } else {
            return Err(Error::QueueOverflow(full));
        }
        Ok(())
    }

    /// Invoke a one-way operation: no response, no continuation.
    pub fn call_one_way<A: EncodeArgs>(&self, func: &str, args: A) -> Result<()> {
        let inner = &self.inner;
        if !inner.transport.is_open() {
            return Err(Error::NotConnected);
        }
        let full = format!("{}{}", inner.prefix, func);
        let msg = inner.with_enc(|enc| codec::encode_call(enc, &full, &args))?;
        Framer::write_frame(&*inner.transport, msg)
    }
}

impl<C: Codec, E> Drop for Client<C, E> {
    fn drop(&mut self) {
        self.inner.transport.close();
        self.inner.transport.clear_listener();
        self.inner.fail_calls(CallError::canceled());
    }
}

impl<C: Codec, E> ClientInner<C, E> {
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

    /// Resolve every outstanding and queued call with `error`.
    ///
    /// The error is encoded once as a placeholder result message and then
    /// decoded through each closure, so every continuation observes the
    /// error through its own result type.
    fn fail_calls(&self, error: CallError) {
        let outstanding: Vec<(String, ResultClosure<C>)> =
            self.closures.borrow_mut().drain().collect();
        let queued = self.queue.borrow_mut().drain_all();
        if outstanding.is_empty() && queued.is_empty() {
            return;
        }

        let msg = match self.with_enc(|enc| {
            codec::encode_result::<_, ()>(enc, "placeholder", &CallResult::Err(error))
        }) {
            Ok(msg) => msg,
            Err(e) => {
                tracing::error!(error = %e, "failed to encode fan-out error message");
                return;
            }
        };
        let payload = Framer::strip_header(msg);

        let all = outstanding
            .into_iter()
            .chain(queued.into_iter().map(|(func, _msg, cont)| (func, cont)));
        for (func, closure) in all {
            // A fresh decoder per closure: fan-out can run from inside a
            // continuation (close during dispatch), when the session
            // decoder is still in use.
            let mut dec = C::decoder();
            let delivered = codec::read_envelope(&mut dec, payload.clone())
                .and_then(|_| closure(&mut dec));
            if let Err(e) = delivered {
                tracing::error!(func = %func, error = %e, "fan-out continuation failed");
            }
        }
    }

    fn handle_message(&self, payload: Bytes) -> Result<()>
    where
        E: DeserializeOwned + Clone + 'static,
    {
        self.with_dec(|dec| {
            let func = codec::read_envelope(dec, payload)?;
            if func == self.broadcast_name {
                let event: E = codec::decode_event(dec)?;
                let listeners: Vec<Rc<dyn EventListener<E>>> = self.listeners.borrow().clone();
                for listener in listeners {
                    listener.on_service_event(event.clone());
                }
                Ok(())
            } else {
                self.dispatch_result(&func, dec)
            }
        })
    }

    fn dispatch_result(&self, func: &str, dec: &mut C::Decoder) -> Result<()> {
        let closure = self.closures.borrow_mut().remove(func).ok_or_else(|| {
            Error::Protocol(format!("result for {func} matches no outstanding call"))
        })?;

        // Flush the queue head for this name before invoking the closure,
        // so a continuation that immediately re-calls observes the slot
        // already taken and queues behind it.
        if let Some((msg, next)) = self.queue.borrow_mut().pop(func) {
            if let Err(e) = Framer::write_frame(&*self.transport, msg) {
                tracing::warn!(func, error = %e, "failed to send queued call");
            }
            self.closures.borrow_mut().insert(func.to_string(), next);
        }

        closure(dec)
    }
}

impl<C, E> TransportListener for ClientInner<C, E>
where
    C: Codec,
    E: DeserializeOwned + Clone + 'static,
{
    fn on_connected(&self, transport: &Rc<dyn Transport>) {
        if C::REUSABLE {
            *self.enc.borrow_mut() = Some(C::encoder());
            *self.dec.borrow_mut() = Some(C::decoder());
        }
        self.framer.borrow_mut().begin(&**transport);
    }

    fn on_disconnected(&self, _transport: &Rc<dyn Transport>) {
        tracing::debug!("client session disconnected");
    }

    fn on_connection_error(&self, _transport: &Rc<dyn Transport>, error: Error) {
        tracing::error!(error = %error, "connection error, failing outstanding calls");
        self.fail_calls(CallError::from(&error));
    }

    fn on_incoming_data(&self, transport: &Rc<dyn Transport>, available: usize) -> Result<usize> {
        let mut framer = self.framer.borrow_mut();
        framer.on_data(transport, available, |_tr, payload| {
            self.handle_message(payload)
        })
    }
}
