//! Handler registration and dispatch.
//!
//! Handlers run user code, and user code is allowed to register and
//! deregister handlers on the very actor being dispatched. Mutation is
//! therefore deferred: additions go to a side list, removals mark the entry,
//! and the next dispatch folds both in before touching any handler. The
//! single-slot default and fallback collections use the same
//! update-on-next-dispatch policy in a two-slot form.

use std::any::Any;
use std::cell::{Cell, RefCell};
use std::marker::PhantomData;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::actor::Context;
use crate::address::Address;
use crate::message::{Envelope, Message, TypeKey};

/// Stable identity of a registered handler function, used for
/// deregistration. Function pointers serve as the key.
pub(crate) type HandlerKey = usize;

pub(crate) trait MessageHandler: Send + Sync {
    fn key(&self) -> HandlerKey;

    fn type_key(&self) -> TypeKey;

    fn is_marked(&self) -> bool;

    fn mark(&self);

    /// Number of sends this handler performed the last time it ran; used to
    /// guess whether a send is the handler's last.
    fn predicted_send_count(&self) -> u32;

    fn report_send_count(&self, count: u32);

    /// Runs the handler if the envelope's payload is of its type. Returns
    /// whether it ran.
    fn invoke(&self, state: &mut dyn Any, ctx: &mut Context<'_>, envelope: &Envelope) -> bool;
}

/// A handler bound to an actor state type and a payload type.
pub(crate) struct TypedHandler<A, V> {
    function: fn(&mut A, &mut Context<'_>, &V, Address),
    marked: AtomicBool,
    predicted_send_count: AtomicU32,
}

impl<A, V> TypedHandler<A, V> {
    pub(crate) fn new(function: fn(&mut A, &mut Context<'_>, &V, Address)) -> Self {
        TypedHandler {
            function,
            marked: AtomicBool::new(false),
            predicted_send_count: AtomicU32::new(0),
        }
    }
}

impl<A: Send + 'static, V: Message> MessageHandler for TypedHandler<A, V> {
    fn key(&self) -> HandlerKey {
        self.function as HandlerKey
    }

    fn type_key(&self) -> TypeKey {
        TypeKey::of::<V>()
    }

    fn is_marked(&self) -> bool {
        self.marked.load(Ordering::Relaxed)
    }

    fn mark(&self) {
        self.marked.store(true, Ordering::Relaxed);
    }

    fn predicted_send_count(&self) -> u32 {
        self.predicted_send_count.load(Ordering::Relaxed)
    }

    fn report_send_count(&self, count: u32) {
        self.predicted_send_count.store(count, Ordering::Relaxed);
    }

    fn invoke(&self, state: &mut dyn Any, ctx: &mut Context<'_>, envelope: &Envelope) -> bool {
        if self.type_key() != envelope.type_key() {
            return false;
        }

        let Some(state) = state.downcast_mut::<A>() else {
            return false;
        };
        let Some(value) = envelope.value::<V>() else {
            return false;
        };

        (self.function)(state, ctx, value, envelope.from());
        true
    }
}

/// The message handlers registered by one actor.
///
/// Only the worker currently processing the actor's mailbox touches the
/// collection (the per-mailbox serialization invariant), so interior
/// mutability is single-threaded `RefCell`/`Cell` rather than locks.
pub(crate) struct HandlerCollection {
    handlers: RefCell<Vec<Arc<dyn MessageHandler>>>,
    new_handlers: RefCell<Vec<Arc<dyn MessageHandler>>>,
    dirty: Cell<bool>,
}

impl HandlerCollection {
    pub(crate) fn new() -> Self {
        HandlerCollection {
            handlers: RefCell::new(Vec::new()),
            new_handlers: RefCell::new(Vec::new()),
            dirty: Cell::new(false),
        }
    }

    /// Registers a handler. Duplicates are allowed; each registration is
    /// removed separately.
    pub(crate) fn add(&self, handler: Arc<dyn MessageHandler>) {
        self.new_handlers.borrow_mut().push(handler);
        self.dirty.set(true);
    }

    /// Marks one unmarked registration of the given handler for removal.
    /// The entry stays in place until the next dispatch folds the marks in.
    pub(crate) fn remove(&self, key: HandlerKey, type_key: TypeKey) -> bool {
        for list in [&self.handlers, &self.new_handlers] {
            for handler in list.borrow().iter() {
                if handler.key() == key && handler.type_key() == type_key && !handler.is_marked() {
                    handler.mark();
                    self.dirty.set(true);
                    return true;
                }
            }
        }

        false
    }

    pub(crate) fn contains(&self, key: HandlerKey, type_key: TypeKey) -> bool {
        for list in [&self.handlers, &self.new_handlers] {
            if list
                .borrow()
                .iter()
                .any(|h| h.key() == key && h.type_key() == type_key && !h.is_marked())
            {
                return true;
            }
        }

        false
    }

    /// Folds in deferred edits: promotes the new handlers into the live
    /// list, then sweeps out everything marked for removal.
    fn update(&self) {
        self.dirty.set(false);

        let mut handlers = self.handlers.borrow_mut();
        handlers.append(&mut self.new_handlers.borrow_mut());
        handlers.retain(|h| !h.is_marked());
    }

    /// Offers the message to every live handler in registration order.
    /// Returns whether any of them accepted it.
    pub(crate) fn dispatch(
        &self,
        state: &mut dyn Any,
        ctx: &mut Context<'_>,
        envelope: &Envelope,
    ) -> bool {
        if self.dirty.get() {
            self.update();
        }

        let mut handled = false;
        let mut index = 0;

        loop {
            // Clone the entry out so the list borrow is not held across the
            // user handler, which may add or remove handlers through ctx.
            let handler = {
                let handlers = self.handlers.borrow();
                match handlers.get(index) {
                    Some(handler) => handler.clone(),
                    None => break,
                }
            };

            ctx.begin_handler(&*handler);
            handled |= handler.invoke(state, ctx, envelope);
            ctx.end_handler(&*handler);

            index += 1;
        }

        handled
    }
}

pub(crate) trait DefaultHandler: Send + Sync {
    fn invoke(&self, state: &mut dyn Any, ctx: &mut Context<'_>, envelope: &Envelope);
}

/// Default handler that only sees the sender.
pub(crate) struct PlainDefaultHandler<A> {
    function: fn(&mut A, &mut Context<'_>, Address),
    _actor: PhantomData<fn(A)>,
}

impl<A> PlainDefaultHandler<A> {
    pub(crate) fn new(function: fn(&mut A, &mut Context<'_>, Address)) -> Self {
        PlainDefaultHandler {
            function,
            _actor: PhantomData,
        }
    }
}

impl<A: Send + 'static> DefaultHandler for PlainDefaultHandler<A> {
    fn invoke(&self, state: &mut dyn Any, ctx: &mut Context<'_>, envelope: &Envelope) {
        if let Some(state) = state.downcast_mut::<A>() {
            (self.function)(state, ctx, envelope.from());
        }
    }
}

/// Default handler that sees the payload as raw bytes.
pub(crate) struct BlindDefaultHandler<A> {
    function: fn(&mut A, &mut Context<'_>, &[u8], Address),
    _actor: PhantomData<fn(A)>,
}

impl<A> BlindDefaultHandler<A> {
    pub(crate) fn new(function: fn(&mut A, &mut Context<'_>, &[u8], Address)) -> Self {
        BlindDefaultHandler {
            function,
            _actor: PhantomData,
        }
    }
}

impl<A: Send + 'static> DefaultHandler for BlindDefaultHandler<A> {
    fn invoke(&self, state: &mut dyn Any, ctx: &mut Context<'_>, envelope: &Envelope) {
        if let Some(state) = state.downcast_mut::<A>() {
            (self.function)(state, ctx, envelope.payload_bytes(), envelope.from());
        }
    }
}

/// The zero-or-one default handler of an actor, with the two-slot deferred
/// replacement protocol: a newly set handler takes effect at the next
/// dispatch.
pub(crate) struct DefaultHandlerCollection {
    current: RefCell<Option<Arc<dyn DefaultHandler>>>,
    pending: RefCell<Option<Option<Arc<dyn DefaultHandler>>>>,
    dirty: Cell<bool>,
}

impl DefaultHandlerCollection {
    pub(crate) fn new() -> Self {
        DefaultHandlerCollection {
            current: RefCell::new(None),
            pending: RefCell::new(None),
            dirty: Cell::new(false),
        }
    }

    /// Sets or clears (`None`) the default handler.
    pub(crate) fn set(&self, handler: Option<Arc<dyn DefaultHandler>>) {
        *self.pending.borrow_mut() = Some(handler);
        self.dirty.set(true);
    }

    pub(crate) fn handle(
        &self,
        state: &mut dyn Any,
        ctx: &mut Context<'_>,
        envelope: &Envelope,
    ) -> bool {
        if self.dirty.get() {
            self.dirty.set(false);
            if let Some(replacement) = self.pending.borrow_mut().take() {
                *self.current.borrow_mut() = replacement;
            }
        }

        let handler = self.current.borrow().clone();
        match handler {
            Some(handler) => {
                handler.invoke(state, ctx, envelope);
                true
            }
            None => false,
        }
    }
}

/// A framework-level handler for messages that could not be delivered to any
/// actor handler.
pub(crate) enum FallbackHandler {
    Plain(Box<dyn Fn(Address) + Send + Sync>),
    Blind(Box<dyn Fn(&[u8], Address) + Send + Sync>),
}

struct FallbackSlots {
    current: Option<Arc<FallbackHandler>>,
    pending: Option<Option<Arc<FallbackHandler>>>,
    dirty: bool,
}

/// The zero-or-one fallback handler of a framework. Unlike the per-actor
/// collections this one is reached from every worker thread, so the slots
/// sit behind a mutex; the handler itself runs outside it.
pub(crate) struct FallbackHandlerCollection {
    slots: Mutex<FallbackSlots>,
}

impl FallbackHandlerCollection {
    pub(crate) fn new() -> Self {
        FallbackHandlerCollection {
            slots: Mutex::new(FallbackSlots {
                current: None,
                pending: None,
                dirty: false,
            }),
        }
    }

    pub(crate) fn set(&self, handler: Option<FallbackHandler>) {
        let mut slots = self.slots.lock();
        slots.pending = Some(handler.map(Arc::new));
        slots.dirty = true;
    }

    pub(crate) fn handle(&self, envelope: &Envelope) -> bool {
        let handler = {
            let mut slots = self.slots.lock();
            if slots.dirty {
                slots.dirty = false;
                if let Some(replacement) = slots.pending.take() {
                    slots.current = replacement;
                }
            }
            slots.current.clone()
        };

        match handler.as_deref() {
            Some(FallbackHandler::Plain(f)) => {
                f(envelope.from());
                true
            }
            Some(FallbackHandler::Blind(f)) => {
                f(envelope.payload_bytes(), envelope.from());
                true
            }
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe;

    fn on_int(_: &mut Probe, _: &mut Context<'_>, _: &i32, _: Address) {}
    fn on_other_int(_: &mut Probe, _: &mut Context<'_>, _: &i32, _: Address) {}

    fn handler_of(f: fn(&mut Probe, &mut Context<'_>, &i32, Address)) -> Arc<dyn MessageHandler> {
        Arc::new(TypedHandler::new(f))
    }

    fn key_of(f: fn(&mut Probe, &mut Context<'_>, &i32, Address)) -> HandlerKey {
        f as HandlerKey
    }

    #[test]
    fn register_then_deregister_round_trips() {
        let collection = HandlerCollection::new();
        let key = key_of(on_int);
        let type_key = TypeKey::of::<i32>();

        assert!(!collection.contains(key, type_key));

        collection.add(handler_of(on_int));
        assert!(collection.contains(key, type_key));

        assert!(collection.remove(key, type_key));
        assert!(!collection.contains(key, type_key));
        assert!(!collection.remove(key, type_key));
    }

    #[test]
    fn double_registration_needs_double_removal() {
        let collection = HandlerCollection::new();
        let key = key_of(on_int);
        let type_key = TypeKey::of::<i32>();

        collection.add(handler_of(on_int));
        collection.add(handler_of(on_int));

        assert!(collection.remove(key, type_key));
        assert!(collection.contains(key, type_key));

        assert!(collection.remove(key, type_key));
        assert!(!collection.contains(key, type_key));
    }

    #[test]
    fn removal_only_matches_the_given_function() {
        let collection = HandlerCollection::new();
        let type_key = TypeKey::of::<i32>();

        collection.add(handler_of(on_int));
        assert!(!collection.remove(key_of(on_other_int), type_key));
        assert!(collection.contains(key_of(on_int), type_key));
    }
}
