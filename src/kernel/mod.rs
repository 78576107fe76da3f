//! The scheduling substrate: mailboxes, the dual-queue scheduler, the worker
//! pool, and the per-message processor.

pub(crate) mod context;
pub(crate) mod counters;
pub(crate) mod mailbox;
pub(crate) mod processor;
pub(crate) mod queue;
pub(crate) mod scheduler;

pub use counters::Counter;
