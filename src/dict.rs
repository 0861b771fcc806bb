//! Function table: operation name to type-erased caller.
//!
//! Each registered operation gets a caller that deserializes the arguments
//! in declaration order, builds the typed [`Responder`] for two-way
//! operations, and invokes the handler. Registration is keyed by the fully
//! qualified `<Interface>::<operation>` name; duplicate names are a logic
//! error surfaced when the service is built.

use std::collections::HashMap;

use serde::Serialize;

use crate::codec::{Codec, DecodeArgs};
use crate::error::{Error, Result};
use crate::service::{CallContext, Responder, ResponderSeed};

/// Type-erased dispatch adapter for one operation. Receives the call
/// context, the responder ingredients (for two-way operations), and the
/// decoder positioned at the first argument.
pub(crate) type Caller<C> = Box<
    dyn Fn(
        CallContext,
        Option<ResponderSeed<C>>,
        &mut <C as Codec>::Decoder,
    ) -> Result<()>,
>;

/// One registered operation.
pub(crate) struct FunctionEntry<C: Codec> {
    pub(crate) one_way: bool,
    pub(crate) caller: Caller<C>,
}

/// Registry of every operation a service exposes.
pub(crate) struct FunctionDict<C: Codec> {
    entries: HashMap<String, FunctionEntry<C>>,
}

impl<C: Codec> FunctionDict<C> {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Register a two-way operation. The handler receives the decoded
    /// arguments and a single-shot [`Responder`] for the result.
    pub(crate) fn add<A, R, F>(&mut self, name: String, handler: F) -> Result<()>
    where
        A: DecodeArgs + 'static,
        R: Serialize + 'static,
        F: Fn(CallContext, A, Responder<C, R>) -> Result<()> + 'static,
    {
        let caller: Caller<C> = Box::new(move |ctx, seed, dec| {
            let args = A::decode_args(dec)?;
            let seed = seed.expect("two-way dispatch always builds a responder seed");
            handler(ctx, args, Responder::new(seed))
        });
        self.insert(
            name,
            FunctionEntry {
                one_way: false,
                caller,
            },
        )
    }

    /// Register a one-way operation: no responder, no result message.
    pub(crate) fn add_one_way<A, F>(&mut self, name: String, handler: F) -> Result<()>
    where
        A: DecodeArgs + 'static,
        F: Fn(CallContext, A) -> Result<()> + 'static,
    {
        let caller: Caller<C> = Box::new(move |ctx, _seed, dec| {
            let args = A::decode_args(dec)?;
            handler(ctx, args)
        });
        self.insert(
            name,
            FunctionEntry {
                one_way: true,
                caller,
            },
        )
    }

    pub(crate) fn get(&self, name: &str) -> Option<&FunctionEntry<C>> {
        self.entries.get(name)
    }

    fn insert(&mut self, name: String, entry: FunctionEntry<C>) -> Result<()> {
        if self.entries.contains_key(&name) {
            return Err(Error::Logic(format!("operation {name} registered twice")));
        }
        self.entries.insert(name, entry);
        Ok(())
    }
}
