//! Per-worker processing context.

use std::sync::Arc;

use crate::alloc::LocalCache;

use super::mailbox::Mailbox;
use super::queue::WorkerQueueContext;

/// Everything a worker thread carries while processing mailboxes: its queue
/// context, its envelope cache, the mailbox currently being processed, and
/// the send-prediction state of the handler currently running.
///
/// A context belongs to exactly one worker thread, so none of this needs
/// synchronization.
pub(crate) struct MailboxContext {
    pub(crate) queue_ctx: WorkerQueueContext,
    pub(crate) message_cache: LocalCache,
    pub(crate) current_mailbox: Option<Arc<Mailbox>>,
    /// Sends the running handler is predicted to make.
    pub(crate) predicted_send_count: u32,
    /// Sends the running handler has made so far.
    pub(crate) send_count: u32,
}

impl MailboxContext {
    pub(crate) fn new(queue_ctx: WorkerQueueContext, message_cache: LocalCache) -> Self {
        MailboxContext {
            queue_ctx,
            message_cache,
            current_mailbox: None,
            predicted_send_count: 0,
            send_count: 0,
        }
    }
}
