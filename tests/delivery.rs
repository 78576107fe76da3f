use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use apiary::prelude::*;

fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {}", what);
        thread::sleep(Duration::from_millis(1));
    }
}

struct Echo;

fn echo_string(_: &mut Echo, ctx: &mut Context<'_>, message: &String, from: Address) {
    ctx.send(message.clone(), from);
}

#[test]
fn echo_round_trip() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<String>::new());
    receiver.register_handler(&caught, Catcher::push);

    let actor = framework.spawn(Echo, |reg| {
        reg.handler(echo_string);
    });

    assert_eq!(receiver.count(), 0);
    assert!(framework.send("Hello".to_string(), receiver.address(), actor.address()));
    assert_eq!(receiver.wait(1), 1);
    assert_eq!(receiver.count(), 0);

    let (message, from) = caught.pop().unwrap();
    assert_eq!(message, "Hello");
    assert_eq!(from, actor.address());
}

#[derive(Clone)]
struct Unhandled {
    size: usize,
    seen_from: Address,
}

impl Message for Unhandled {}

struct Recorder;

fn record_unhandled(_: &mut Recorder, ctx: &mut Context<'_>, data: &[u8], from: Address) {
    ctx.send(
        Unhandled {
            size: data.len(),
            seen_from: from.clone(),
        },
        from,
    );
}

#[test]
fn unhandled_message_reaches_the_default_handler() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<Unhandled>::new());
    receiver.register_handler(&caught, Catcher::push);

    // No handler for i32 at all, only the blind default.
    let actor = framework.spawn(Recorder, |reg| {
        reg.blind_default_handler(record_unhandled);
    });

    assert!(framework.send(103i32, receiver.address(), actor.address()));
    assert_eq!(receiver.wait(1), 1);

    let (report, _) = caught.pop().unwrap();
    assert_eq!(report.size, std::mem::size_of::<i32>());
    assert_eq!(report.seen_from, receiver.address());
}

struct Gateway {
    peer: Address,
    caller: Address,
}

fn gateway_request(state: &mut Gateway, ctx: &mut Context<'_>, value: &u32, _from: Address) {
    ctx.send(*value, state.peer.clone());
}

fn gateway_reply(state: &mut Gateway, ctx: &mut Context<'_>, value: &u64, _from: Address) {
    ctx.send(*value, state.caller.clone());
}

struct Responder;

fn respond(_: &mut Responder, ctx: &mut Context<'_>, value: &u32, from: Address) {
    ctx.send(u64::from(*value) * 2, from);
}

#[test]
fn messages_cross_framework_boundaries_and_back() {
    let runtime = Runtime::new();
    let near = Framework::new(&runtime, Parameters::with_threads(2).named("near"));
    let far = Framework::new(&runtime, Parameters::with_threads(2).named("far"));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u64>::new());
    receiver.register_handler(&caught, Catcher::push);

    let responder = far.spawn(Responder, |reg| {
        reg.handler(respond);
    });

    let gateway = near.spawn(
        Gateway {
            peer: responder.address(),
            caller: receiver.address(),
        },
        |reg| {
            reg.handler(gateway_request);
            reg.handler(gateway_reply);
        },
    );

    assert_ne!(near.index(), far.index());
    assert!(near.send(21u32, receiver.address(), gateway.address()));
    assert_eq!(receiver.wait(1), 1);

    assert_eq!(caught.pop().unwrap().0, 42);
}

#[test]
fn send_after_actor_destruction_routes_to_the_fallback() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let fallback_hits = Arc::new(AtomicU32::new(0));
    {
        let fallback_hits = fallback_hits.clone();
        framework.set_blind_fallback_handler(move |_data, _from| {
            fallback_hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    let address = {
        let actor = framework.spawn(Echo, |reg| {
            reg.handler(echo_string);
        });
        actor.address()
    };

    // The mailbox outlives its actor, so the send still succeeds; the
    // message lands in the fallback handler instead of a handler chain.
    assert!(framework.send("late".to_string(), receiver.address(), address));

    wait_until("fallback handler to run", || {
        fallback_hits.load(Ordering::SeqCst) == 1
    });
    assert_eq!(receiver.count(), 0);
}

#[test]
fn cleared_fallback_drops_unhandled_messages_silently() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    framework.clear_fallback_handler();

    // No handlers at all: the message has nowhere to go.
    let actor = framework.spawn(Recorder, |_reg| {});

    framework.reset_counters();
    assert!(framework.send(7u32, receiver.address(), actor.address()));

    wait_until("message to be processed", || {
        framework.counter_value(Counter::MessagesProcessed) == 1
    });
    assert_eq!(receiver.count(), 0);
}

#[test]
fn sends_to_a_vacated_receiver_address_fail() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(1));
    let receiver = Receiver::new(&runtime);

    let fallback_hits = Arc::new(AtomicU32::new(0));
    {
        let fallback_hits = fallback_hits.clone();
        framework.set_blind_fallback_handler(move |_data, _from| {
            fallback_hits.fetch_add(1, Ordering::SeqCst);
        });
    }

    // A mailbox index nothing was ever registered at.
    let stranger = Receiver::new(&runtime);
    let unknown = stranger.address();
    drop(stranger);

    assert!(!framework.send(1u32, receiver.address(), unknown));
    assert_eq!(fallback_hits.load(Ordering::SeqCst), 1);
}
