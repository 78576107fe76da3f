//! The scheduler: worker thread pool, manager thread, and scheduling entry
//! points.
//!
//! Worker threads are created and retired by a manager thread that wakes
//! every `manager_interval` and drives the live thread count toward a target
//! bounded by the configured minimum and maximum. Teardown quiesces every
//! queue before stopping anything, so no scheduled mailbox or allocated
//! envelope survives the framework.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use parking_lot::Mutex;
use slog::{debug, error, Logger};

use crate::alloc::{Allocator, LocalCache};
use crate::sync::backoff;
use crate::system::framework::FrameworkCore;

use super::context::MailboxContext;
use super::counters::Counter;
use super::mailbox::Mailbox;
use super::processor;
use super::queue::{MailboxQueue, QueueShared, SchedulerHints, WorkerQueueContext};

/// Where a send is coming from: a worker thread mid-handler, with its
/// context, or anywhere else.
pub(crate) enum SendSource<'a> {
    Worker(&'a mut MailboxContext),
    Shared,
}

pub(crate) struct ThreadContext {
    shared: Arc<QueueShared>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

pub(crate) struct Scheduler {
    pub(crate) queue: MailboxQueue,
    /// Queue context for pushes from outside any worker thread.
    shared_context: Arc<QueueShared>,
    framework: Weak<FrameworkCore>,
    log: Logger,
    /// Emit per-worker lifecycle diagnostics.
    debug: bool,
    manager_interval: Duration,

    running: AtomicBool,
    target_threads: AtomicU32,
    min_threads: AtomicU32,
    max_threads: AtomicU32,
    thread_count: AtomicU32,
    peak_threads: AtomicU32,
    worker_seq: AtomicU32,

    contexts: Mutex<Vec<Arc<ThreadContext>>>,
    manager: Mutex<Option<JoinHandle<()>>>,
}

impl Scheduler {
    pub(crate) fn new(
        framework: Weak<FrameworkCore>,
        log: Logger,
        manager_interval: Duration,
        debug: bool,
    ) -> Scheduler {
        Scheduler {
            queue: MailboxQueue::new(),
            shared_context: QueueShared::new(),
            framework,
            log,
            debug,
            manager_interval,
            running: AtomicBool::new(false),
            target_threads: AtomicU32::new(0),
            min_threads: AtomicU32::new(0),
            max_threads: AtomicU32::new(0),
            thread_count: AtomicU32::new(0),
            peak_threads: AtomicU32::new(0),
            worker_seq: AtomicU32::new(0),
            contexts: Mutex::new(Vec::new()),
            manager: Mutex::new(None),
        }
    }

    /// Starts the manager thread and waits for it to bring up the initial
    /// worker complement.
    pub(crate) fn initialize(&self, thread_count: u32) {
        self.min_threads.store(thread_count, Ordering::Relaxed);
        self.max_threads.store(thread_count, Ordering::Relaxed);
        self.target_threads.store(thread_count, Ordering::Relaxed);
        self.running.store(true, Ordering::Release);

        let framework = self.framework.clone();
        let interval = self.manager_interval;
        let manager = thread::Builder::new()
            .name("apiary-manager".into())
            .spawn(move || manager_proc(framework, interval))
            .expect("failed to spawn manager thread");
        *self.manager.lock() = Some(manager);

        let mut spins = 0;
        while self.thread_count.load(Ordering::Acquire) < self.target_threads.load(Ordering::Acquire)
        {
            backoff(&mut spins);
        }
    }

    /// Quiesces and tears down: waits for every queue to drain, retires all
    /// workers, then stops the manager.
    pub(crate) fn release(&self) {
        let mut spins = 0;
        while !self.queues_empty() {
            backoff(&mut spins);
        }

        self.target_threads.store(0, Ordering::Relaxed);
        self.min_threads.store(0, Ordering::Relaxed);
        self.max_threads.store(0, Ordering::Relaxed);

        let mut spins = 0;
        while self.thread_count.load(Ordering::Acquire) > 0 {
            self.queue.wake_all();
            backoff(&mut spins);
        }

        self.running.store(false, Ordering::Release);
        if let Some(manager) = self.manager.lock().take() {
            let _ = manager.join();
        }

        self.contexts.lock().clear();
    }

    /// True when the shared FIFO and every worker's local slot are empty.
    /// The context list is held locked so the observation is consistent.
    fn queues_empty(&self) -> bool {
        let contexts = self.contexts.lock();

        if !self.queue.empty_shared() {
            return false;
        }

        contexts.iter().all(|ctx| !ctx.shared.local_occupied())
    }

    /// Schedules a mailbox that has become runnable, deriving placement
    /// hints from the sending context.
    pub(crate) fn schedule(&self, source: &mut SendSource<'_>, mailbox: &Arc<Mailbox>) {
        match source {
            SendSource::Worker(ctx) => {
                let same_mailbox = ctx
                    .current_mailbox
                    .as_ref()
                    .is_some_and(|current| Arc::ptr_eq(current, mailbox));

                let hints = SchedulerHints {
                    send: !same_mailbox,
                    predicted_send_count: ctx.predicted_send_count,
                    send_index: ctx.send_count,
                    message_count: ctx
                        .current_mailbox
                        .as_ref()
                        .map_or(0, |current| current.count()),
                };

                self.queue.push_worker(&mut ctx.queue_ctx, mailbox.clone(), &hints);

                // Remembered per handler so the next run can predict which
                // send is the last.
                ctx.send_count += 1;
            }
            SendSource::Shared => {
                self.queue.push_shared(&self.shared_context, mailbox.clone());
            }
        }
    }

    pub(crate) fn set_max_threads(&self, count: u32) {
        self.max_threads.store(count, Ordering::Relaxed);
        if self.min_threads.load(Ordering::Relaxed) > count {
            self.min_threads.store(count, Ordering::Relaxed);
        }
        if self.target_threads.load(Ordering::Relaxed) > count {
            self.target_threads.store(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn set_min_threads(&self, count: u32) {
        self.min_threads.store(count, Ordering::Relaxed);
        if self.max_threads.load(Ordering::Relaxed) < count {
            self.max_threads.store(count, Ordering::Relaxed);
        }
        if self.target_threads.load(Ordering::Relaxed) < count {
            self.target_threads.store(count, Ordering::Relaxed);
        }
    }

    pub(crate) fn max_threads(&self) -> u32 {
        self.max_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn min_threads(&self) -> u32 {
        self.min_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn num_threads(&self) -> u32 {
        self.thread_count.load(Ordering::Relaxed)
    }

    pub(crate) fn peak_threads(&self) -> u32 {
        self.peak_threads.load(Ordering::Relaxed)
    }

    pub(crate) fn counter_value(&self, counter: Counter) -> u32 {
        let mut accumulator = self.shared_context.counters.get(counter);
        for ctx in self.contexts.lock().iter() {
            ctx.shared.counters.accumulate(counter, &mut accumulator);
        }
        accumulator
    }

    pub(crate) fn per_thread_counter_values(&self, counter: Counter, out: &mut [u32]) -> usize {
        if out.is_empty() {
            return 0;
        }

        out[0] = self.shared_context.counters.get(counter);
        let mut filled = 1;

        for ctx in self.contexts.lock().iter() {
            if filled >= out.len() {
                break;
            }
            if ctx.shared.is_running() {
                out[filled] = ctx.shared.counters.get(counter);
                filled += 1;
            }
        }

        filled
    }

    pub(crate) fn reset_counters(&self) {
        self.shared_context.counters.reset_all();
        for ctx in self.contexts.lock().iter() {
            ctx.shared.counters.reset_all();
        }
    }

    /// One manager pass: restart stopped contexts, grow to the target,
    /// shrink above it.
    fn manage_threads(&self, core: &Arc<FrameworkCore>) {
        let mut contexts = self.contexts.lock();
        let target = self.target_threads.load(Ordering::Relaxed);

        // Re-start stopped worker contexts while the count is too low.
        for ctx in contexts.iter() {
            if self.thread_count.load(Ordering::Relaxed) >= target {
                break;
            }
            if !ctx.shared.is_running() {
                if let Some(handle) = ctx.handle.lock().take() {
                    let _ = handle.join();
                }
                if self.start_worker(core, ctx) {
                    self.thread_count.fetch_add(1, Ordering::Release);
                } else {
                    break;
                }
            }
        }

        // Create fresh contexts while still under target.
        while self.thread_count.load(Ordering::Relaxed) < target {
            let ctx = Arc::new(ThreadContext {
                shared: QueueShared::new(),
                handle: Mutex::new(None),
            });

            if !self.start_worker(core, &ctx) {
                break;
            }
            contexts.push(ctx);

            let count = self.thread_count.fetch_add(1, Ordering::Release) + 1;
            let mut peak = self.peak_threads.load(Ordering::Relaxed);
            while count > peak {
                match self.peak_threads.compare_exchange_weak(
                    peak,
                    count,
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => break,
                    Err(observed) => peak = observed,
                }
            }
        }

        // Retire workers while the count is too high.
        for ctx in contexts.iter() {
            if self.thread_count.load(Ordering::Relaxed) <= target {
                break;
            }
            if ctx.shared.is_running() {
                self.queue.release_worker(&ctx.shared);
                self.queue.wake_all();
                if let Some(handle) = ctx.handle.lock().take() {
                    let _ = handle.join();
                }
                self.thread_count.fetch_sub(1, Ordering::Release);
                if self.debug {
                    debug!(self.log, "worker thread retired");
                }
            }
        }
    }

    fn start_worker(&self, core: &Arc<FrameworkCore>, ctx: &Arc<ThreadContext>) -> bool {
        self.queue.init_worker(&ctx.shared);

        let seq = self.worker_seq.fetch_add(1, Ordering::Relaxed);
        let worker_core = core.clone();
        let shared = ctx.shared.clone();

        let spawned = thread::Builder::new()
            .name(format!("apiary-worker-{}", seq))
            .spawn(move || worker_proc(worker_core, shared));

        match spawned {
            Ok(handle) => {
                *ctx.handle.lock() = Some(handle);
                if self.debug {
                    debug!(self.log, "worker thread started"; "worker" => seq);
                }
                true
            }
            Err(err) => {
                self.queue.release_worker(&ctx.shared);
                error!(self.log, "failed to spawn worker thread"; "error" => %err);
                false
            }
        }
    }
}

fn manager_proc(framework: Weak<FrameworkCore>, interval: Duration) {
    loop {
        let Some(core) = framework.upgrade() else {
            break;
        };

        if !core.scheduler.running.load(Ordering::Acquire) {
            break;
        }

        core.scheduler.manage_threads(&core);
        drop(core);

        // The manager spends most of its life asleep.
        thread::sleep(interval);
    }
}

fn worker_proc(core: Arc<FrameworkCore>, shared: Arc<QueueShared>) {
    let scheduler = &core.scheduler;
    let upstream: Arc<dyn Allocator + Send + Sync> = core.message_cache.clone();
    let mut ctx = MailboxContext::new(
        WorkerQueueContext::new(shared.clone()),
        LocalCache::new(upstream),
    );

    while scheduler.queue.running(&shared) {
        if let Some(mailbox) = scheduler.queue.pop(&mut ctx.queue_ctx) {
            processor::process(&core, &mut ctx, mailbox);
        }
    }

    // A retiring worker may still hold a mailbox in its local slot; hand it
    // to the shared queue so it is not stranded.
    scheduler.queue.flush_local(&mut ctx.queue_ctx);
}
