//! Per-actor mailboxes.
//!
//! A mailbox owns the queued envelopes and the actor cell of one actor. The
//! spin lock guards both; the message count and enqueue timestamp are
//! atomics so scheduling hints and latency measurements can read them
//! without taking another mailbox's lock.
//!
//! The count includes the message currently being processed: the processor
//! removes the front envelope when it starts and decrements the count only
//! when it finishes. A handler sending to its own mailbox therefore observes
//! a non-empty mailbox and does not schedule it a second time, which is what
//! keeps each mailbox on at most one worker at a time.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crate::actor::ActorCell;
use crate::message::Envelope;
use crate::strings::Name;
use crate::sync::{SpinGuard, SpinLock};

pub(crate) struct MailboxState {
    queue: VecDeque<Envelope>,
    cell: Option<Box<ActorCell>>,
    pin_count: u32,
    name: Name,
}

impl Default for MailboxState {
    fn default() -> Self {
        MailboxState {
            queue: VecDeque::new(),
            cell: None,
            pin_count: 0,
            name: Name::null(),
        }
    }
}

impl MailboxState {
    pub(crate) fn set_name(&mut self, name: Name) {
        self.name = name;
    }

    /// Installs the actor cell. The mailbox must be unpinned and vacant.
    pub(crate) fn register_cell(&mut self, cell: Box<ActorCell>) {
        debug_assert_eq!(self.pin_count, 0);
        debug_assert!(self.cell.is_none());
        self.cell = Some(cell);
    }

    /// Removes the actor cell, unless the mailbox is pinned.
    pub(crate) fn try_deregister_cell(&mut self) -> Result<Option<Box<ActorCell>>, Pinned> {
        if self.pin_count > 0 {
            return Err(Pinned);
        }
        Ok(self.cell.take())
    }

    /// Checks the cell out for processing. The caller must hold a pin.
    pub(crate) fn take_cell(&mut self) -> Option<Box<ActorCell>> {
        debug_assert!(self.pin_count > 0);
        self.cell.take()
    }

    pub(crate) fn put_cell_back(&mut self, cell: Box<ActorCell>) {
        debug_assert!(self.pin_count > 0);
        debug_assert!(self.cell.is_none());
        self.cell = Some(cell);
    }

    pub(crate) fn pin(&mut self) {
        self.pin_count += 1;
    }

    pub(crate) fn unpin(&mut self) {
        debug_assert!(self.pin_count > 0);
        self.pin_count -= 1;
    }
}

/// The mailbox was pinned by a processing worker.
pub(crate) struct Pinned;

pub(crate) struct Mailbox {
    state: SpinLock<MailboxState>,
    /// Queued messages, including the one being processed.
    count: AtomicU32,
    /// Microsecond timestamp of the last scheduling, for latency counters.
    timestamp: AtomicU64,
}

impl Default for Mailbox {
    fn default() -> Self {
        Mailbox {
            state: SpinLock::default(),
            count: AtomicU32::new(0),
            timestamp: AtomicU64::new(0),
        }
    }
}

impl Mailbox {
    pub(crate) fn lock(&self) -> SpinGuard<'_, MailboxState> {
        self.state.lock()
    }

    /// Number of unprocessed messages, counting the in-flight one. Reads
    /// without the lock; all writers hold it.
    pub(crate) fn count(&self) -> u32 {
        self.count.load(Ordering::Relaxed)
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.count() == 0
    }

    /// Enqueues an envelope. The caller holds the lock and schedules the
    /// mailbox if this was the empty-to-non-empty transition.
    pub(crate) fn push(&self, state: &mut MailboxState, envelope: Envelope) {
        state.queue.push_back(envelope);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Removes the front envelope for processing. The count is unchanged
    /// until `finish_message`.
    pub(crate) fn take_front(&self, state: &mut MailboxState) -> Option<Envelope> {
        state.queue.pop_front()
    }

    /// Marks the in-flight message finished and returns how many messages
    /// remain queued.
    pub(crate) fn finish_message(&self, _state: &mut MailboxState) -> u32 {
        self.count.fetch_sub(1, Ordering::Relaxed) - 1
    }

    pub(crate) fn set_timestamp(&self, micros: u64) {
        self.timestamp.store(micros, Ordering::Relaxed);
    }

    pub(crate) fn timestamp(&self) -> u64 {
        self.timestamp.load(Ordering::Relaxed)
    }

    /// The mailbox's name, as set at actor registration.
    pub(crate) fn name(&self) -> Name {
        self.lock().name.clone()
    }

    /// Drains and destroys any envelopes left behind at teardown.
    pub(crate) fn drain(&self, mut destroy: impl FnMut(Envelope)) {
        let mut state = self.lock();
        while let Some(envelope) = state.queue.pop_front() {
            self.count.fetch_sub(1, Ordering::Relaxed);
            destroy(envelope);
        }
    }
}
