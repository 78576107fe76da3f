//! The actor-facing API: spawn-time registration, the in-handler context,
//! and the owning agent handle.
//!
//! An actor is an ordinary value installed into a mailbox together with its
//! handler collections. The runtime owns it from spawn until the agent
//! handle is dropped; user code reaches it only through the `&mut` state
//! passed into its handlers.

use std::any::Any;
use std::marker::PhantomData;
use std::sync::Arc;

use crate::address::Address;
use crate::handler::{
    BlindDefaultHandler, DefaultHandlerCollection, HandlerCollection, HandlerKey, MessageHandler,
    PlainDefaultHandler, TypedHandler,
};
use crate::kernel::context::MailboxContext;
use crate::kernel::scheduler::SendSource;
use crate::message::{Envelope, Message, TypeKey};
use crate::system::framework::FrameworkCore;

/// The runtime-owned half of an actor: its state and handler collections.
///
/// A cell lives inside its mailbox. The processing worker checks it out
/// under the mailbox lock, runs the handler chain without the lock, and puts
/// it back; the mailbox pin count keeps deregistration at bay in between.
pub(crate) struct ActorCell {
    state: Box<dyn Any + Send>,
    handlers: HandlerCollection,
    defaults: DefaultHandlerCollection,
    address: Address,
}

impl ActorCell {
    pub(crate) fn new(state: Box<dyn Any + Send>, address: Address) -> ActorCell {
        ActorCell {
            state,
            handlers: HandlerCollection::new(),
            defaults: DefaultHandlerCollection::new(),
            address,
        }
    }

    /// Runs the handler chain for one message: registered handlers first,
    /// then the default handler, then the framework fallback.
    pub(crate) fn process(
        &mut self,
        framework: &FrameworkCore,
        mc: &mut MailboxContext,
        envelope: &Envelope,
    ) {
        let ActorCell {
            state,
            handlers,
            defaults,
            address,
        } = self;
        let handlers = &*handlers;
        let defaults = &*defaults;

        let mut ctx = Context {
            mc,
            framework,
            handlers,
            defaults,
            address: address.clone(),
        };

        if handlers.dispatch(&mut **state, &mut ctx, envelope) {
            return;
        }

        if defaults.handle(&mut **state, &mut ctx, envelope) {
            return;
        }

        framework.fallback_handlers.handle(envelope);
    }
}

/// Registration window open while an actor is being spawned, before its
/// mailbox goes live. The same operations are available later, inside
/// handlers, through [`Context`].
pub struct Registrar<'a, A> {
    cell: &'a ActorCell,
    _actor: PhantomData<fn(A)>,
}

impl<'a, A: Send + 'static> Registrar<'a, A> {
    pub(crate) fn new(cell: &'a ActorCell) -> Self {
        Registrar {
            cell,
            _actor: PhantomData,
        }
    }

    /// Registers a handler for payloads of type `V`.
    pub fn handler<V: Message>(&mut self, handler: fn(&mut A, &mut Context<'_>, &V, Address)) {
        self.cell.handlers.add(Arc::new(TypedHandler::new(handler)));
    }

    /// Sets the handler for messages no registered handler accepts.
    pub fn default_handler(&mut self, handler: fn(&mut A, &mut Context<'_>, Address)) {
        self.cell
            .defaults
            .set(Some(Arc::new(PlainDefaultHandler::new(handler))));
    }

    /// Like `default_handler`, but the handler sees the payload bytes.
    pub fn blind_default_handler(
        &mut self,
        handler: fn(&mut A, &mut Context<'_>, &[u8], Address),
    ) {
        self.cell
            .defaults
            .set(Some(Arc::new(BlindDefaultHandler::new(handler))));
    }

    /// The address the actor is being spawned at.
    pub fn address(&self) -> Address {
        self.cell.address.clone()
    }
}

/// Capabilities available to an actor while one of its handlers runs:
/// sending, handler registration, and queries about itself.
pub struct Context<'a> {
    mc: &'a mut MailboxContext,
    framework: &'a FrameworkCore,
    handlers: &'a HandlerCollection,
    defaults: &'a DefaultHandlerCollection,
    address: Address,
}

impl Context<'_> {
    /// Sends `value` to `to`. Returns false if the message could not be
    /// delivered (and the fallback handler has already seen it) or could not
    /// be allocated.
    ///
    /// The envelope comes from the worker's own cache: the cache is touched
    /// by this one thread only, so the hot path takes no lock at all.
    pub fn send<V: Message>(&mut self, value: V, to: Address) -> bool {
        let envelope = match Envelope::create(&self.mc.message_cache, value, self.address.clone())
        {
            Some(envelope) => envelope,
            None => return false,
        };

        self.framework
            .send_internal(&mut SendSource::Worker(&mut *self.mc), envelope, to)
    }

    /// Registers a message handler on this actor. Takes effect at the next
    /// dispatch, so the handler will not see the message currently being
    /// processed.
    pub fn register_handler<A: Send + 'static, V: Message>(
        &mut self,
        handler: fn(&mut A, &mut Context<'_>, &V, Address),
    ) -> bool {
        self.handlers.add(Arc::new(TypedHandler::new(handler)));
        true
    }

    /// Deregisters one registration of the given handler. Returns whether a
    /// registration was found.
    pub fn deregister_handler<A: Send + 'static, V: Message>(
        &mut self,
        handler: fn(&mut A, &mut Context<'_>, &V, Address),
    ) -> bool {
        self.handlers
            .remove(handler as HandlerKey, TypeKey::of::<V>())
    }

    pub fn is_handler_registered<A: Send + 'static, V: Message>(
        &self,
        handler: fn(&mut A, &mut Context<'_>, &V, Address),
    ) -> bool {
        self.handlers
            .contains(handler as HandlerKey, TypeKey::of::<V>())
    }

    /// Sets the default handler, replacing any current one at the next
    /// dispatch.
    pub fn set_default_handler<A: Send + 'static>(
        &mut self,
        handler: fn(&mut A, &mut Context<'_>, Address),
    ) {
        self.defaults
            .set(Some(Arc::new(PlainDefaultHandler::new(handler))));
    }

    /// Like `set_default_handler`, but the handler sees the payload bytes.
    pub fn set_blind_default_handler<A: Send + 'static>(
        &mut self,
        handler: fn(&mut A, &mut Context<'_>, &[u8], Address),
    ) {
        self.defaults
            .set(Some(Arc::new(BlindDefaultHandler::new(handler))));
    }

    /// Removes the default handler at the next dispatch.
    pub fn clear_default_handler(&mut self) {
        self.defaults.set(None);
    }

    /// The address of this actor.
    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// The index of the framework this actor runs in.
    pub fn framework_index(&self) -> u32 {
        self.framework.index
    }

    /// Messages waiting in this actor's mailbox, counting the one being
    /// processed.
    pub fn num_queued_messages(&self) -> u32 {
        self.mc
            .current_mailbox
            .as_ref()
            .map_or(0, |mailbox| mailbox.count())
    }

    pub(crate) fn begin_handler(&mut self, handler: &dyn MessageHandler) {
        self.mc.predicted_send_count = handler.predicted_send_count();
        self.mc.send_count = 0;
    }

    pub(crate) fn end_handler(&mut self, handler: &dyn MessageHandler) {
        handler.report_send_count(self.mc.send_count);
    }
}

/// The owning handle of a spawned actor.
///
/// Dropping the agent deregisters the actor: the drop waits for any handler
/// currently running on the actor to finish, then frees the state. Messages
/// still queued at that point are handed to the framework's fallback handler
/// when their turn comes.
pub struct Agent<A> {
    framework: Arc<FrameworkCore>,
    address: Address,
    _actor: PhantomData<fn(A)>,
}

impl<A: Send + 'static> Agent<A> {
    pub(crate) fn new(framework: Arc<FrameworkCore>, address: Address) -> Agent<A> {
        Agent {
            framework,
            address,
            _actor: PhantomData,
        }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// The index of the framework this actor runs in.
    pub fn framework_index(&self) -> u32 {
        self.framework.index
    }

    /// Sends `value` to `to` on the actor's behalf from outside any handler,
    /// using the framework's shared envelope cache.
    pub fn send<V: Message>(&self, value: V, to: Address) -> bool {
        let envelope = match Envelope::create(
            &*self.framework.message_cache,
            value,
            self.address.clone(),
        ) {
            Some(envelope) => envelope,
            None => return false,
        };

        self.framework
            .send_internal(&mut SendSource::Shared, envelope, to)
    }

    /// Messages waiting in the actor's mailbox.
    pub fn num_queued_messages(&self) -> u32 {
        self.framework.queued_messages(&self.address)
    }
}

impl<A> Drop for Agent<A> {
    fn drop(&mut self) {
        self.framework.deregister_actor(&self.address);
    }
}
