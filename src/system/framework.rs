//! Frameworks: the unit of scheduling.
//!
//! A framework owns a directory of mailboxes, a scheduler with its worker
//! threads, a fallback-handler slot, and a spin-locked envelope cache for
//! sends made outside worker context. Construction spawns the threads;
//! dropping the framework deregisters it, waits for every queue to drain,
//! and joins them.

use std::sync::Arc;
use std::time::Duration;

use slog::{debug, info, o, warn, Discard, Logger};

use crate::actor::{ActorCell, Agent, Registrar};
use crate::address::{Address, Index, MAX_FRAMEWORK_INDEX, MAX_MAILBOX_INDEX};
use crate::alloc::SharedCache;
use crate::config::Config;
use crate::directory::Directory;
use crate::handler::{FallbackHandler, FallbackHandlerCollection};
use crate::kernel::counters::Counter;
use crate::kernel::mailbox::Mailbox;
use crate::kernel::scheduler::{Scheduler, SendSource};
use crate::message::{Envelope, Message};
use crate::strings::Name;
use crate::system::logger;
use crate::system::runtime::{Runtime, RuntimeCore};

/// Backoff steps after which a deregistration stuck behind a pinned mailbox
/// is reported. Forward progress is still guaranteed; this is a diagnostic.
const DEREGISTRATION_SPIN_WARNING: u32 = 1_000;

/// Construction parameters of a framework.
#[derive(Clone)]
pub struct Parameters {
    /// Initial number of worker threads.
    pub thread_count: u32,
    /// Framework name; synthesized from the framework index if absent.
    pub name: Option<String>,
    /// Destination for runtime diagnostics.
    pub log: Logger,
    /// Emit verbose lifecycle diagnostics (worker and actor churn).
    pub debug: bool,
    /// How often the manager thread revisits the worker count.
    pub manager_interval: Duration,
    /// Size-class pools kept by each envelope cache.
    pub cache_pools: usize,
    /// Free blocks kept per pool.
    pub cache_blocks: u32,
}

impl Default for Parameters {
    fn default() -> Self {
        Parameters {
            thread_count: 16,
            name: None,
            log: Logger::root(Discard, o!()),
            debug: true,
            manager_interval: Duration::from_millis(100),
            cache_pools: crate::alloc::cache::DEFAULT_MAX_POOLS,
            cache_blocks: crate::alloc::cache::DEFAULT_MAX_BLOCKS,
        }
    }
}

impl Parameters {
    pub fn with_threads(thread_count: u32) -> Parameters {
        Parameters {
            thread_count,
            ..Parameters::default()
        }
    }

    pub fn named(mut self, name: &str) -> Parameters {
        self.name = Some(name.to_string());
        self
    }

    pub fn with_log(mut self, log: Logger) -> Parameters {
        self.log = log;
        self
    }

    /// Parameters from a loaded [`Config`]. A configured thread count of
    /// zero sizes the pool to the machine; the logger is built from the
    /// config's `[log]` section.
    pub fn from_config(config: &Config) -> Parameters {
        let thread_count = if config.scheduler.thread_count == 0 {
            num_cpus::get() as u32
        } else {
            config.scheduler.thread_count
        };

        Parameters {
            thread_count,
            log: logger::from_config(&config.log),
            debug: config.debug,
            manager_interval: Duration::from_millis(config.scheduler.manager_interval_ms),
            cache_pools: config.cache.max_pools as usize,
            cache_blocks: config.cache.max_blocks,
            ..Parameters::default()
        }
    }
}

pub(crate) struct FrameworkCore {
    pub(crate) runtime: Arc<RuntimeCore>,
    pub(crate) index: u32,
    pub(crate) name: Name,
    pub(crate) log: Logger,
    pub(crate) debug: bool,
    pub(crate) mailboxes: Directory<Arc<Mailbox>>,
    pub(crate) fallback_handlers: FallbackHandlerCollection,
    pub(crate) message_cache: Arc<SharedCache>,
    pub(crate) scheduler: Scheduler,
}

impl FrameworkCore {
    /// Delivers a message: the local fast path pushes straight into the
    /// destination mailbox; anything else goes through the runtime
    /// directories. Undeliverable messages visit the fallback handler and
    /// are destroyed.
    pub(crate) fn send_internal(
        &self,
        source: &mut SendSource<'_>,
        envelope: Envelope,
        to: Address,
    ) -> bool {
        debug_assert!(!to.is_null());

        if to.framework_index() == self.index {
            let Some(mailbox) = self.mailboxes.entry(to.mailbox_index()) else {
                return self.undeliverable(envelope);
            };

            // Push under the mailbox lock, scheduling on the
            // empty-to-non-empty transition while still locked. A mailbox
            // is thereby enqueued at most once however many senders race.
            let mut state = mailbox.lock();
            let schedule = mailbox.is_empty();
            mailbox.push(&mut state, envelope);
            if schedule {
                self.scheduler.schedule(source, mailbox);
            }
            drop(state);

            return true;
        }

        match self.deliver_within_local_process(envelope, &to) {
            Ok(delivered) => delivered,
            Err(envelope) => self.undeliverable(envelope),
        }
    }

    /// Delivery to a receiver or to an actor in another framework of the
    /// same runtime. The directory entry is pinned across the delivery so
    /// the target cannot be torn down under us; its destructor waits.
    fn deliver_within_local_process(
        &self,
        envelope: Envelope,
        to: &Address,
    ) -> Result<bool, Envelope> {
        let index = to.index();

        if index.framework() == 0 {
            let Some(entry) = self.runtime.receivers.entry(index.mailbox()) else {
                return Err(envelope);
            };

            let pinned = entry.pin();
            match pinned.entity().cloned() {
                Some(receiver) => {
                    receiver.push(envelope, &self.runtime);
                    Ok(true)
                }
                None => Err(envelope),
            }
        } else {
            let Some(entry) = self.runtime.frameworks.entry(index.framework()) else {
                return Err(envelope);
            };

            let pinned = entry.pin();
            match pinned.entity().cloned() {
                Some(framework) => Ok(framework.receive_from_peer(envelope, to)),
                None => Err(envelope),
            }
        }
    }

    /// Entry point for messages crossing in from another framework. The
    /// shared context stands in for the sender: there is no worker thread of
    /// ours on this call stack.
    fn receive_from_peer(&self, envelope: Envelope, to: &Address) -> bool {
        self.send_internal(&mut SendSource::Shared, envelope, to.clone())
    }

    fn undeliverable(&self, envelope: Envelope) -> bool {
        self.fallback_handlers.handle(&envelope);
        envelope.destroy(&*self.message_cache);
        false
    }

    /// Claims a mailbox and names it, producing the actor's address.
    fn register_actor_address(&self, name: Option<&str>) -> Address {
        let mailbox_index = self.mailboxes.allocate();
        debug_assert!(mailbox_index <= MAX_MAILBOX_INDEX);

        let name = match name {
            Some(name) => self.runtime.strings.intern(name),
            None => {
                // Synthesized "<mailbox-hex>.<framework-name>".
                let scoped = format!("{:x}.{}", mailbox_index, self.name);
                self.runtime.strings.intern(&scoped)
            }
        };

        let mailbox = self
            .mailboxes
            .entry(mailbox_index)
            .expect("freshly allocated mailbox");
        mailbox.lock().set_name(name.clone());

        Address::new(name, Index::new(self.index, mailbox_index))
    }

    fn install_cell(&self, address: &Address, cell: Box<ActorCell>) {
        let mailbox = self
            .mailboxes
            .entry(address.mailbox_index())
            .expect("mailbox of a just-registered actor");
        mailbox.lock().register_cell(cell);
    }

    /// Removes and frees an actor's cell, spinning while the mailbox is
    /// pinned by a processing worker. Queued messages stay behind and reach
    /// the fallback handler when processed.
    pub(crate) fn deregister_actor(&self, address: &Address) {
        let Some(mailbox) = self.mailboxes.entry(address.mailbox_index()) else {
            return;
        };

        let mut spins = 0;
        let cell = loop {
            if let Ok(cell) = mailbox.lock().try_deregister_cell() {
                break cell;
            }

            crate::sync::backoff(&mut spins);
            if spins == DEREGISTRATION_SPIN_WARNING {
                warn!(self.log, "actor deregistration waiting on a pinned mailbox";
                      "actor" => %address);
            }
        };

        drop(cell);
    }

    pub(crate) fn queued_messages(&self, address: &Address) -> u32 {
        self.mailboxes
            .entry(address.mailbox_index())
            .map_or(0, |mailbox| mailbox.count())
    }
}

impl Drop for FrameworkCore {
    fn drop(&mut self) {
        // The scheduler has quiesced by now, but mailboxes may still hold
        // messages if actors were dropped after their framework stopped
        // processing. Destroy them so their blocks go back to the caches.
        let cache = self.message_cache.clone();
        let log = self.log.clone();
        let debug = self.debug;
        self.mailboxes.for_each(|mailbox| {
            let mut discarded = 0u32;
            mailbox.drain(|envelope| {
                envelope.destroy(&*cache);
                discarded += 1;
            });
            if discarded > 0 && debug {
                debug!(log, "discarded undelivered messages";
                       "mailbox" => %mailbox.name(), "count" => discarded);
            }
        });
    }
}

/// A population of actors sharing a scheduler and a pool of worker threads.
pub struct Framework {
    core: Arc<FrameworkCore>,
}

impl Framework {
    pub fn new(runtime: &Runtime, params: Parameters) -> Framework {
        let rt = runtime.core().clone();
        let log = params.log.clone();

        let index = rt.frameworks.allocate();
        debug_assert!(index <= MAX_FRAMEWORK_INDEX);

        let name = match &params.name {
            Some(name) => rt.strings.intern(name),
            None => rt.strings.intern(&format!("{:x}", index)),
        };

        let message_cache = Arc::new(SharedCache::with_geometry(
            rt.cache.clone(),
            params.cache_pools,
            params.cache_blocks,
        ));

        let core = Arc::new_cyclic(|weak| FrameworkCore {
            runtime: rt.clone(),
            index,
            name: name.clone(),
            log: log.clone(),
            debug: params.debug,
            mailboxes: Directory::new(),
            fallback_handlers: FallbackHandlerCollection::new(),
            message_cache,
            scheduler: Scheduler::new(
                weak.clone(),
                log.clone(),
                params.manager_interval,
                params.debug,
            ),
        });

        // Stock fallback handler: report messages nobody handled.
        let fallback_log = log.new(o!("framework" => name.to_string()));
        core.fallback_handlers
            .set(Some(FallbackHandler::Blind(Box::new(
                move |data: &[u8], from: Address| {
                    warn!(fallback_log, "unhandled message";
                          "from" => %from, "size" => data.len());
                },
            ))));

        core.scheduler.initialize(params.thread_count);

        // Only now does the framework become reachable for cross-framework
        // sends.
        rt.frameworks
            .entry(index)
            .expect("freshly allocated framework entry")
            .set_entity(core.clone());

        info!(log, "framework started";
              "name" => %name, "threads" => params.thread_count);

        Framework { core }
    }

    /// The framework's process-local index, as carried by its actors'
    /// addresses.
    pub fn index(&self) -> u32 {
        self.core.index
    }

    pub fn name(&self) -> &str {
        self.core.name.as_str().unwrap_or_default()
    }

    /// Creates an actor from `state`, registering its handlers through the
    /// closure before the first message can arrive. The returned agent owns
    /// the actor; dropping it deregisters.
    pub fn spawn<A, F>(&self, state: A, init: F) -> Agent<A>
    where
        A: Send + 'static,
        F: FnOnce(&mut Registrar<'_, A>),
    {
        self.spawn_inner(None, state, init)
    }

    /// Like [`spawn`](Framework::spawn), with an explicit actor name.
    pub fn spawn_named<A, F>(&self, name: &str, state: A, init: F) -> Agent<A>
    where
        A: Send + 'static,
        F: FnOnce(&mut Registrar<'_, A>),
    {
        self.spawn_inner(Some(name), state, init)
    }

    fn spawn_inner<A, F>(&self, name: Option<&str>, state: A, init: F) -> Agent<A>
    where
        A: Send + 'static,
        F: FnOnce(&mut Registrar<'_, A>),
    {
        let address = self.core.register_actor_address(name);

        let cell = Box::new(ActorCell::new(Box::new(state), address.clone()));
        {
            let mut registrar = Registrar::new(&cell);
            init(&mut registrar);
        }

        self.core.install_cell(&address, cell);
        if self.core.debug {
            debug!(self.core.log, "actor registered"; "actor" => %address);
        }

        Agent::new(self.core.clone(), address)
    }

    /// Sends `value` to `to`, with `from` as the reply address. Returns
    /// false if the message could not be delivered or allocated; an
    /// undeliverable message visits the fallback handler first.
    pub fn send<V: Message>(&self, value: V, from: Address, to: Address) -> bool {
        // Sends from non-worker code draw on the framework's thread-safe
        // envelope cache.
        let envelope = match Envelope::create(&*self.core.message_cache, value, from) {
            Some(envelope) => envelope,
            None => return false,
        };

        self.core
            .send_internal(&mut SendSource::Shared, envelope, to)
    }

    /// Caps the worker pool. Lowers the current target if it exceeds the
    /// new maximum; the manager thread retires threads to match.
    pub fn set_max_threads(&self, count: u32) {
        self.core.scheduler.set_max_threads(count);
    }

    /// Raises the worker-pool floor, starting threads if needed.
    pub fn set_min_threads(&self, count: u32) {
        self.core.scheduler.set_min_threads(count);
    }

    pub fn max_threads(&self) -> u32 {
        self.core.scheduler.max_threads()
    }

    pub fn min_threads(&self) -> u32 {
        self.core.scheduler.min_threads()
    }

    /// Worker threads currently alive.
    pub fn num_threads(&self) -> u32 {
        self.core.scheduler.num_threads()
    }

    /// Most worker threads ever alive at once.
    pub fn peak_threads(&self) -> u32 {
        self.core.scheduler.peak_threads()
    }

    /// Installs the fallback handler for undeliverable and unhandled
    /// messages. Takes effect at the next such message.
    pub fn set_fallback_handler<F>(&self, handler: F)
    where
        F: Fn(Address) + Send + Sync + 'static,
    {
        self.core
            .fallback_handlers
            .set(Some(FallbackHandler::Plain(Box::new(handler))));
    }

    /// Like [`set_fallback_handler`](Framework::set_fallback_handler), but
    /// the handler sees the payload bytes.
    pub fn set_blind_fallback_handler<F>(&self, handler: F)
    where
        F: Fn(&[u8], Address) + Send + Sync + 'static,
    {
        self.core
            .fallback_handlers
            .set(Some(FallbackHandler::Blind(Box::new(handler))));
    }

    /// Removes the fallback handler; unhandled messages are then dropped
    /// silently.
    pub fn clear_fallback_handler(&self) {
        self.core.fallback_handlers.set(None);
    }

    pub fn num_counters(&self) -> usize {
        Counter::ALL.len()
    }

    pub fn counter_name(&self, counter: Counter) -> &'static str {
        counter.name()
    }

    /// The counter's value accumulated over all worker threads.
    pub fn counter_value(&self, counter: Counter) -> u32 {
        self.core.scheduler.counter_value(counter)
    }

    /// Fills `out` with the counter's per-thread values (the shared context
    /// first, then each running worker) and returns how many were written.
    pub fn per_thread_counter_values(&self, counter: Counter, out: &mut [u32]) -> usize {
        self.core.scheduler.per_thread_counter_values(counter, out)
    }

    pub fn reset_counters(&self) {
        self.core.scheduler.reset_counters();
    }
}

impl Drop for Framework {
    fn drop(&mut self) {
        let core = &self.core;
        if core.debug {
            debug!(core.log, "framework stopping"; "name" => %core.name);
        }

        // Become unreachable for new cross-framework sends, waiting out any
        // sender that has the entry pinned, then drain and stop.
        if let Some(entry) = core.runtime.frameworks.entry(core.index) {
            entry.deregister();
        }
        core.scheduler.release();

        info!(core.log, "framework stopped"; "name" => %core.name);
    }
}
