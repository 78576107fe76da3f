//! Receivers: blocking endpoints for non-worker code.
//!
//! A receiver is a pseudo-actor with framework index zero. Worker threads
//! deliver into it; the owning thread blocks in `wait` until something has
//! arrived. Registered handlers run on the delivering worker's thread, so
//! they are expected to be small: typically a [`Catcher`] push.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::address::{Address, Index, MAX_MAILBOX_INDEX};
use crate::message::{Envelope, Message, TypeKey};
use crate::system::runtime::{Runtime, RuntimeCore};

trait ReceiverHandler: Send + Sync {
    fn key(&self) -> usize;

    fn type_key(&self) -> TypeKey;

    fn invoke(&self, envelope: &Envelope);
}

/// A handler bound to an owner object and a payload type.
struct TypedReceiverHandler<T, V> {
    owner: Arc<T>,
    function: fn(&T, &V, Address),
}

impl<T, V> TypedReceiverHandler<T, V>
where
    T: Send + Sync + 'static,
    V: Message,
{
    fn new(owner: Arc<T>, function: fn(&T, &V, Address)) -> Self {
        TypedReceiverHandler { owner, function }
    }
}

impl<T, V> ReceiverHandler for TypedReceiverHandler<T, V>
where
    T: Send + Sync + 'static,
    V: Message,
{
    fn key(&self) -> usize {
        self.function as usize
    }

    fn type_key(&self) -> TypeKey {
        TypeKey::of::<V>()
    }

    fn invoke(&self, envelope: &Envelope) {
        if self.type_key() != envelope.type_key() {
            return;
        }
        if let Some(value) = envelope.value::<V>() {
            (self.function)(&self.owner, value, envelope.from());
        }
    }
}

pub(crate) struct ReceiverCore {
    handlers: Mutex<Vec<Arc<dyn ReceiverHandler>>>,
    arrived: Condvar,
    /// Messages received and not yet consumed through `wait`/`consume`.
    received: AtomicU32,
}

impl ReceiverCore {
    /// Delivers a message: every registered handler sees it, the count goes
    /// up, waiters wake, and the envelope is destroyed through the
    /// runtime-wide cache.
    pub(crate) fn push(&self, envelope: Envelope, runtime: &RuntimeCore) {
        {
            let handlers = self.handlers.lock();
            for handler in handlers.iter() {
                handler.invoke(&envelope);
            }
            self.received.fetch_add(1, Ordering::Release);
        }

        self.arrived.notify_all();
        envelope.destroy(&*runtime.cache);
    }
}

/// A blocking message endpoint owned by client code.
pub struct Receiver {
    core: Arc<ReceiverCore>,
    runtime: Arc<RuntimeCore>,
    address: Address,
}

impl Receiver {
    pub fn new(runtime: &Runtime) -> Receiver {
        let rt = runtime.core().clone();

        let index = rt.receivers.allocate();
        debug_assert!(index <= MAX_MAILBOX_INDEX);

        let name = rt.strings.intern(&format!("{:x}", index));
        let address = Address::new(name, Index::new(0, index));

        let core = Arc::new(ReceiverCore {
            handlers: Mutex::new(Vec::new()),
            arrived: Condvar::new(),
            received: AtomicU32::new(0),
        });

        rt.receivers
            .entry(index)
            .expect("freshly allocated receiver entry")
            .set_entity(core.clone());

        Receiver {
            core,
            runtime: rt,
            address,
        }
    }

    pub fn address(&self) -> Address {
        self.address.clone()
    }

    /// Registers a handler to run, on the delivering thread, for every
    /// arriving message of type `V`.
    pub fn register_handler<T, V>(&self, owner: &Arc<T>, handler: fn(&T, &V, Address)) -> bool
    where
        T: Send + Sync + 'static,
        V: Message,
    {
        self.core
            .handlers
            .lock()
            .push(Arc::new(TypedReceiverHandler::new(owner.clone(), handler)));
        true
    }

    /// Removes one registration of the given handler. Returns whether one
    /// was found.
    pub fn deregister_handler<T, V>(&self, handler: fn(&T, &V, Address)) -> bool
    where
        T: Send + Sync + 'static,
        V: Message,
    {
        let key = handler as usize;
        let type_key = TypeKey::of::<V>();

        let mut handlers = self.core.handlers.lock();
        match handlers
            .iter()
            .position(|h| h.key() == key && h.type_key() == type_key)
        {
            Some(position) => {
                handlers.remove(position);
                true
            }
            None => false,
        }
    }

    /// Messages received and not yet consumed.
    pub fn count(&self) -> u32 {
        self.core.received.load(Ordering::Acquire)
    }

    /// Forgets any unconsumed messages.
    pub fn reset(&self) {
        let _handlers = self.core.handlers.lock();
        self.core.received.store(0, Ordering::Release);
    }

    /// Blocks until at least one message has arrived, then consumes up to
    /// `max`. Returns the number consumed.
    ///
    /// Unbounded: liveness is the caller's business, by way of an explicit
    /// stop message if needed.
    pub fn wait(&self, max: u32) -> u32 {
        debug_assert!(max > 0);

        let mut handlers = self.core.handlers.lock();
        while self.core.received.load(Ordering::Acquire) == 0 {
            self.core.arrived.wait(&mut handlers);
        }

        self.consume_locked(max)
    }

    /// Consumes up to `max` already-arrived messages without blocking.
    pub fn consume(&self, max: u32) -> u32 {
        let _handlers = self.core.handlers.lock();
        self.consume_locked(max)
    }

    fn consume_locked(&self, max: u32) -> u32 {
        // The delivery count only moves under the handlers lock, which the
        // caller holds.
        let current = self.core.received.load(Ordering::Acquire);
        let consumed = current.min(max);
        self.core
            .received
            .store(current - consumed, Ordering::Release);
        consumed
    }
}

impl Drop for Receiver {
    fn drop(&mut self) {
        // Spins while delivering workers hold pins on the entry.
        if let Some(entry) = self.runtime.receivers.entry(self.address.mailbox_index()) {
            entry.deregister();
        }
    }
}

/// A handler owner that queues caught messages for later inspection:
/// register `Catcher::push` on a receiver and pop from the owning thread.
pub struct Catcher<V> {
    queue: Mutex<VecDeque<(V, Address)>>,
}

impl<V: Clone + Send> Catcher<V> {
    pub fn new() -> Catcher<V> {
        Catcher {
            queue: Mutex::new(VecDeque::new()),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }

    /// Queues a copy of the message. Shaped to register directly as a
    /// receiver handler.
    pub fn push(&self, message: &V, from: Address) {
        self.queue.lock().push_back((message.clone(), from));
    }

    /// Copies the oldest caught message without removing it.
    pub fn front(&self) -> Option<(V, Address)> {
        self.queue.lock().front().cloned()
    }

    /// Removes and returns the oldest caught message.
    pub fn pop(&self) -> Option<(V, Address)> {
        self.queue.lock().pop_front()
    }
}

impl<V: Clone + Send> Default for Catcher<V> {
    fn default() -> Self {
        Catcher::new()
    }
}
