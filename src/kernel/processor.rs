//! Executes one message from one mailbox.
//!
//! The locking here and in the send path together enforce the serialization
//! invariant: a mailbox is scheduled only on its empty-to-non-empty
//! transition, and rescheduled here, under its own lock, if messages remain
//! after one has been processed. A given mailbox is therefore never on two
//! workers at once, and its messages are processed in strict FIFO order.

use std::sync::Arc;

use crate::system::framework::FrameworkCore;

use super::context::MailboxContext;
use super::mailbox::Mailbox;
use super::scheduler::SendSource;

pub(crate) fn process(core: &Arc<FrameworkCore>, ctx: &mut MailboxContext, mailbox: Arc<Mailbox>) {
    // Remember which mailbox is being processed; sends made by the handler
    // consult it for their scheduling hints.
    ctx.current_mailbox = Some(mailbox.clone());

    // Pin the mailbox and check out the actor cell and the front message.
    // The pin keeps the actor from being deregistered while its handler
    // runs. No other worker can reach this mailbox: it was dequeued from
    // exactly one scheduler slot.
    let (mut cell, envelope) = {
        let mut state = mailbox.lock();
        state.pin();
        let cell = state.take_cell();
        let envelope = mailbox.take_front(&mut state);
        (cell, envelope)
    };

    let Some(envelope) = envelope else {
        debug_assert!(false, "scheduled mailbox had no queued message");
        let mut state = mailbox.lock();
        if let Some(cell) = cell.take() {
            state.put_cell_back(cell);
        }
        state.unpin();
        return;
    };

    match cell.as_mut() {
        Some(cell) => cell.process(core, ctx, &envelope),
        // The actor has been deregistered but its mailbox still had queued
        // messages; they go to the framework's fallback handler.
        None => {
            core.fallback_handlers.handle(&envelope);
        }
    }

    // Put the cell back, release the pin, retire the message, and if the
    // mailbox is still non-empty reschedule it while the lock is held so no
    // sender can sneak in a second scheduling.
    {
        let mut state = mailbox.lock();
        if let Some(cell) = cell.take() {
            state.put_cell_back(cell);
        }
        state.unpin();

        let remaining = mailbox.finish_message(&mut state);
        if remaining > 0 {
            core.scheduler
                .schedule(&mut SendSource::Worker(&mut *ctx), &mailbox);
        }
    }

    envelope.destroy(&ctx.message_cache);
    ctx.current_mailbox = None;
}
