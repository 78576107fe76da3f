//! The scheduler queue: a per-worker local slot plus a shared FIFO.
//!
//! The local slot carries the tail-send optimization: a handler's final send
//! keeps the destination mailbox on the invoking worker, cache-hot, while
//! earlier sends migrate to other workers through the shared FIFO. The
//! placement decision is driven by hints derived from the sending handler's
//! send-count prediction.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::{Condvar, Mutex};

use super::counters::{Counter, CounterBlock};
use super::mailbox::Mailbox;

/// Facts about a push that the placement policy weighs.
pub(crate) struct SchedulerHints {
    /// The mailbox is being scheduled because it was sent a message, as
    /// opposed to being rescheduled after processing.
    pub(crate) send: bool,
    /// Sends the current handler is predicted to make, from its last run.
    pub(crate) predicted_send_count: u32,
    /// Index of this send within the current handler.
    pub(crate) send_index: u32,
    /// Queued messages in the sending mailbox, including the one being
    /// processed.
    pub(crate) message_count: u32,
}

/// The shareable half of a queue context: flags and counters that other
/// threads (the manager, counter queries) may read while the worker runs.
pub(crate) struct QueueShared {
    running: AtomicBool,
    local_occupied: AtomicBool,
    pub(crate) counters: CounterBlock,
}

impl QueueShared {
    pub(crate) fn new() -> Arc<QueueShared> {
        Arc::new(QueueShared {
            running: AtomicBool::new(false),
            local_occupied: AtomicBool::new(false),
            counters: CounterBlock::new(),
        })
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    pub(crate) fn local_occupied(&self) -> bool {
        self.local_occupied.load(Ordering::Acquire)
    }
}

/// The worker-private half: the single-slot local queue. Only the owning
/// worker touches the slot; the occupied flag mirrors it for observers.
pub(crate) struct WorkerQueueContext {
    pub(crate) shared: Arc<QueueShared>,
    local_slot: Option<Arc<Mailbox>>,
}

impl WorkerQueueContext {
    pub(crate) fn new(shared: Arc<QueueShared>) -> Self {
        WorkerQueueContext {
            shared,
            local_slot: None,
        }
    }

    fn store_local(&mut self, mailbox: Arc<Mailbox>) -> Option<Arc<Mailbox>> {
        let previous = self.local_slot.replace(mailbox);
        self.shared.local_occupied.store(true, Ordering::Release);
        previous
    }

    pub(crate) fn take_local(&mut self) -> Option<Arc<Mailbox>> {
        let mailbox = self.local_slot.take()?;
        self.shared.local_occupied.store(false, Ordering::Release);
        Some(mailbox)
    }
}

/// The per-framework scheduler queue: the shared FIFO behind a blocking
/// monitor, plus the push/pop policy over worker contexts.
pub(crate) struct MailboxQueue {
    fifo: Mutex<VecDeque<Arc<Mailbox>>>,
    available: Condvar,
    epoch: Instant,
}

impl MailboxQueue {
    pub(crate) fn new() -> Self {
        MailboxQueue {
            fifo: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            epoch: Instant::now(),
        }
    }

    fn now_micros(&self) -> u64 {
        self.epoch.elapsed().as_micros() as u64
    }

    /// Marks a worker context live and clears its latency floor.
    pub(crate) fn init_worker(&self, shared: &QueueShared) {
        shared.running.store(true, Ordering::Release);
        shared.counters.reset(Counter::QueueLatencyLocalMin);
        shared.counters.reset(Counter::QueueLatencySharedMin);
    }

    /// Marks a worker context stopped. Taken under the monitor lock so a
    /// worker blocked in `pop` re-checks the flag on wake.
    pub(crate) fn release_worker(&self, shared: &QueueShared) {
        let _fifo = self.fifo.lock();
        shared.running.store(false, Ordering::Release);
    }

    pub(crate) fn running(&self, shared: &QueueShared) -> bool {
        shared.is_running()
    }

    pub(crate) fn wake_all(&self) {
        self.available.notify_all();
    }

    pub(crate) fn empty_shared(&self) -> bool {
        self.fifo.lock().is_empty()
    }

    fn prefer_local_queue(hints: &SchedulerHints) -> bool {
        if hints.send {
            // Not predicted to be the handler's last send: let another
            // worker take it.
            if hints.send_index + 1 < hints.predicted_send_count {
                return false;
            }

            // The sender still has queued work, so the sender's own mailbox
            // will claim the local slot when it is rescheduled.
            if hints.message_count > 1 {
                return false;
            }
        }

        true
    }

    /// Schedules a mailbox from a worker thread.
    pub(crate) fn push_worker(
        &self,
        ctx: &mut WorkerQueueContext,
        mailbox: Arc<Mailbox>,
        hints: &SchedulerHints,
    ) {
        mailbox.set_timestamp(self.now_micros());
        ctx.shared
            .counters
            .raise(Counter::MailboxQueueMax, mailbox.count());

        let mailbox = if Self::prefer_local_queue(hints) {
            // Swap-and-demote: the new mailbox takes the local slot and any
            // previous occupant is promoted to the shared queue. The slot
            // holds at most one mailbox, and keeping the latest one local
            // favors the last mailbox a handler messaged.
            let previous = ctx.store_local(mailbox);
            ctx.shared.counters.increment(Counter::LocalPushes);

            match previous {
                Some(previous) => previous,
                None => return,
            }
        } else {
            mailbox
        };

        self.push_fifo(&ctx.shared.counters, mailbox);
    }

    /// Schedules a mailbox from outside any worker thread. Always shared.
    pub(crate) fn push_shared(&self, shared: &QueueShared, mailbox: Arc<Mailbox>) {
        mailbox.set_timestamp(self.now_micros());
        shared
            .counters
            .raise(Counter::MailboxQueueMax, mailbox.count());

        self.push_fifo(&shared.counters, mailbox);
    }

    fn push_fifo(&self, counters: &CounterBlock, mailbox: Arc<Mailbox>) {
        {
            let mut fifo = self.fifo.lock();
            fifo.push_back(mailbox);
        }

        // Waking after release is fine; the waiter re-checks under the lock.
        self.available.notify_one();
        counters.increment(Counter::SharedPushes);
    }

    /// Takes the next mailbox to process: the local slot if occupied, else a
    /// blocking pop from the shared FIFO. Returns `None` only when the
    /// context has been released.
    pub(crate) fn pop(&self, ctx: &mut WorkerQueueContext) -> Option<Arc<Mailbox>> {
        let (mailbox, latency_min, latency_max) = match ctx.take_local() {
            Some(mailbox) => (
                mailbox,
                Counter::QueueLatencyLocalMin,
                Counter::QueueLatencyLocalMax,
            ),
            None => {
                let mut fifo = self.fifo.lock();
                while fifo.is_empty() && ctx.shared.is_running() {
                    ctx.shared.counters.increment(Counter::Yields);
                    self.available.wait(&mut fifo);
                }

                let mailbox = fifo.pop_front()?;
                (
                    mailbox,
                    Counter::QueueLatencySharedMin,
                    Counter::QueueLatencySharedMax,
                )
            }
        };

        ctx.shared.counters.increment(Counter::MessagesProcessed);

        let latency = self.now_micros().saturating_sub(mailbox.timestamp()) as u32;
        ctx.shared.counters.raise(latency_max, latency);
        ctx.shared.counters.lower(latency_min, latency);

        Some(mailbox)
    }

    /// Hands any stranded local mailbox back to the shared FIFO. Called by a
    /// worker on its way out so no scheduled mailbox dies with the thread.
    pub(crate) fn flush_local(&self, ctx: &mut WorkerQueueContext) {
        if let Some(mailbox) = ctx.take_local() {
            self.push_fifo(&ctx.shared.counters, mailbox);
        }
    }
}
