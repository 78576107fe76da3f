//! Per-framework event counters.
//!
//! Counters are recorded per queue context (one per worker thread plus the
//! shared context) and combined on query. Min counters start at the maximum
//! value so the first sample always registers.

use std::sync::atomic::{AtomicU32, Ordering};

/// Event counters exposed by a framework, in their stable query order.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Counter {
    /// Messages processed by the framework's workers.
    MessagesProcessed,
    /// Times a worker went to sleep waiting for work.
    Yields,
    /// Mailboxes pushed to a worker's local slot.
    LocalPushes,
    /// Mailboxes pushed to the shared queue.
    SharedPushes,
    /// Largest mailbox backlog observed at scheduling time.
    MailboxQueueMax,
    /// Smallest observed local-queue latency, in microseconds.
    QueueLatencyLocalMin,
    /// Largest observed local-queue latency, in microseconds.
    QueueLatencyLocalMax,
    /// Smallest observed shared-queue latency, in microseconds.
    QueueLatencySharedMin,
    /// Largest observed shared-queue latency, in microseconds.
    QueueLatencySharedMax,
}

pub(crate) const NUM_COUNTERS: usize = 9;

impl Counter {
    pub const ALL: [Counter; NUM_COUNTERS] = [
        Counter::MessagesProcessed,
        Counter::Yields,
        Counter::LocalPushes,
        Counter::SharedPushes,
        Counter::MailboxQueueMax,
        Counter::QueueLatencyLocalMin,
        Counter::QueueLatencyLocalMax,
        Counter::QueueLatencySharedMin,
        Counter::QueueLatencySharedMax,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Counter::MessagesProcessed => "messages processed",
            Counter::Yields => "thread yields",
            Counter::LocalPushes => "mailboxes pushed to thread-local queue",
            Counter::SharedPushes => "mailboxes pushed to shared queue",
            Counter::MailboxQueueMax => "maximum size of mailbox queue",
            Counter::QueueLatencyLocalMin => "minimum observed latency of thread-local queue",
            Counter::QueueLatencyLocalMax => "maximum observed latency of thread-local queue",
            Counter::QueueLatencySharedMin => "minimum observed latency of shared queue",
            Counter::QueueLatencySharedMax => "maximum observed latency of shared queue",
        }
    }

    pub(crate) fn index(self) -> usize {
        self as usize
    }

    fn is_min(self) -> bool {
        matches!(
            self,
            Counter::QueueLatencyLocalMin | Counter::QueueLatencySharedMin
        )
    }

    fn is_max(self) -> bool {
        matches!(
            self,
            Counter::MailboxQueueMax
                | Counter::QueueLatencyLocalMax
                | Counter::QueueLatencySharedMax
        )
    }

    fn reset_value(self) -> u32 {
        if self.is_min() {
            u32::MAX
        } else {
            0
        }
    }
}

/// One counter cell, padded to a cache line so the per-context counter
/// blocks do not share lines between threads.
#[repr(align(64))]
struct CounterCell(AtomicU32);

/// The counter block of one queue context.
pub(crate) struct CounterBlock {
    cells: [CounterCell; NUM_COUNTERS],
}

impl CounterBlock {
    pub(crate) fn new() -> Self {
        let block = CounterBlock {
            cells: std::array::from_fn(|_| CounterCell(AtomicU32::new(0))),
        };
        block.reset_all();
        block
    }

    pub(crate) fn get(&self, counter: Counter) -> u32 {
        self.cells[counter.index()].0.load(Ordering::Relaxed)
    }

    pub(crate) fn reset(&self, counter: Counter) {
        self.cells[counter.index()]
            .0
            .store(counter.reset_value(), Ordering::Relaxed);
    }

    pub(crate) fn reset_all(&self) {
        for counter in Counter::ALL {
            self.reset(counter);
        }
    }

    pub(crate) fn increment(&self, counter: Counter) {
        self.cells[counter.index()].0.fetch_add(1, Ordering::Relaxed);
    }

    /// Raises a maximum counter to `value` if it is larger.
    pub(crate) fn raise(&self, counter: Counter, value: u32) {
        let cell = &self.cells[counter.index()].0;
        let mut current = cell.load(Ordering::Relaxed);
        while value > current {
            match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Lowers a minimum counter to `value` if it is smaller.
    pub(crate) fn lower(&self, counter: Counter, value: u32) {
        let cell = &self.cells[counter.index()].0;
        let mut current = cell.load(Ordering::Relaxed);
        while value < current {
            match cell.compare_exchange_weak(current, value, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => break,
                Err(observed) => current = observed,
            }
        }
    }

    /// Folds this block's value for `counter` into an accumulator, using the
    /// combination rule the counter calls for.
    pub(crate) fn accumulate(&self, counter: Counter, accumulator: &mut u32) {
        let value = self.get(counter);

        if counter.is_max() {
            *accumulator = (*accumulator).max(value);
        } else if counter.is_min() {
            *accumulator = (*accumulator).min(value);
        } else {
            *accumulator += value;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn min_counters_reset_high() {
        let block = CounterBlock::new();
        assert_eq!(block.get(Counter::QueueLatencyLocalMin), u32::MAX);
        assert_eq!(block.get(Counter::QueueLatencySharedMin), u32::MAX);
        assert_eq!(block.get(Counter::MessagesProcessed), 0);
    }

    #[test]
    fn raise_and_lower_are_monotonic() {
        let block = CounterBlock::new();

        block.raise(Counter::MailboxQueueMax, 5);
        block.raise(Counter::MailboxQueueMax, 3);
        assert_eq!(block.get(Counter::MailboxQueueMax), 5);

        block.lower(Counter::QueueLatencyLocalMin, 80);
        block.lower(Counter::QueueLatencyLocalMin, 120);
        assert_eq!(block.get(Counter::QueueLatencyLocalMin), 80);
    }

    #[test]
    fn accumulate_uses_the_right_rule() {
        let a = CounterBlock::new();
        let b = CounterBlock::new();

        a.increment(Counter::MessagesProcessed);
        b.increment(Counter::MessagesProcessed);
        let mut sum = 0;
        a.accumulate(Counter::MessagesProcessed, &mut sum);
        b.accumulate(Counter::MessagesProcessed, &mut sum);
        assert_eq!(sum, 2);

        a.raise(Counter::MailboxQueueMax, 4);
        b.raise(Counter::MailboxQueueMax, 9);
        let mut max = 0;
        a.accumulate(Counter::MailboxQueueMax, &mut max);
        b.accumulate(Counter::MailboxQueueMax, &mut max);
        assert_eq!(max, 9);
    }
}
