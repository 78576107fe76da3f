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

struct Player {
    caller: Address,
}

fn volley(state: &mut Player, ctx: &mut Context<'_>, count: &u32, from: Address) {
    if *count > 0 {
        ctx.send(*count - 1, from);
    } else {
        ctx.send(0u32, state.caller.clone());
    }
}

#[test]
fn ping_pong_processes_every_volley() {
    const HOPS: u32 = 20_000;

    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(4));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&caught, Catcher::push);

    let ping = framework.spawn(
        Player {
            caller: receiver.address(),
        },
        |reg| {
            reg.handler(volley);
        },
    );
    let pong = framework.spawn(
        Player {
            caller: receiver.address(),
        },
        |reg| {
            reg.handler(volley);
        },
    );

    framework.reset_counters();

    // Forge the reply address so the first volley goes back to `pong`.
    assert!(framework.send(HOPS, pong.address(), ping.address()));
    assert_eq!(receiver.wait(1), 1);
    assert_eq!(caught.pop().unwrap().0, 0);

    // One processed message per count value, HOPS down to zero.
    assert_eq!(
        framework.counter_value(Counter::MessagesProcessed),
        HOPS + 1
    );
}

struct SelfCounter {
    caller: Address,
}

fn count_down_in_place(state: &mut SelfCounter, ctx: &mut Context<'_>, count: &u32, _: Address) {
    if *count > 0 {
        let own = ctx.address();
        ctx.send(*count - 1, own);
    } else {
        ctx.send(0u32, state.caller.clone());
    }
}

#[test]
fn self_sends_serialize_without_extra_scheduling() {
    const STEPS: u32 = 100;

    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&caught, Catcher::push);

    let actor = framework.spawn(
        SelfCounter {
            caller: receiver.address(),
        },
        |reg| {
            reg.handler(count_down_in_place);
        },
    );

    framework.reset_counters();
    assert!(framework.send(STEPS, receiver.address(), actor.address()));
    assert_eq!(receiver.wait(1), 1);

    // Each self-send bought exactly one further processing cycle.
    assert_eq!(
        framework.counter_value(Counter::MessagesProcessed),
        STEPS + 1
    );
}

struct Hop {
    next: Address,
}

fn hop(state: &mut Hop, ctx: &mut Context<'_>, value: &u32, _: Address) {
    ctx.send(*value, state.next.clone());
}

#[test]
fn tail_sends_prefer_the_local_slot() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&caught, Catcher::push);

    let last = framework.spawn(
        Hop {
            next: receiver.address(),
        },
        |reg| {
            reg.handler(hop);
        },
    );
    let first = framework.spawn(
        Hop {
            next: last.address(),
        },
        |reg| {
            reg.handler(hop);
        },
    );

    framework.reset_counters();
    assert!(framework.send(7u32, receiver.address(), first.address()));
    assert_eq!(receiver.wait(1), 1);
    assert_eq!(caught.pop().unwrap().0, 7);

    // The handler's single tail send keeps the next mailbox on the
    // invoking worker.
    assert!(framework.counter_value(Counter::LocalPushes) > 0);
}

#[test]
fn thread_limits_are_stored_and_reported_separately() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(3));

    wait_until("initial workers", || framework.num_threads() == 3);
    assert_eq!(framework.min_threads(), 3);
    assert_eq!(framework.max_threads(), 3);

    // Raising the ceiling neither starts threads nor moves the floor.
    framework.set_max_threads(5);
    assert_eq!(framework.max_threads(), 5);
    assert_eq!(framework.min_threads(), 3);
    assert_eq!(framework.num_threads(), 3);

    // Raising the floor starts threads.
    framework.set_min_threads(4);
    wait_until("grow to four workers", || framework.num_threads() == 4);
    assert_eq!(framework.max_threads(), 5);
    assert!(framework.peak_threads() >= 4);

    // Lowering the ceiling below the floor drags the floor down too.
    framework.set_max_threads(1);
    wait_until("shrink to one worker", || framework.num_threads() == 1);
    assert_eq!(framework.min_threads(), 1);
}

#[test]
fn zero_thread_limit_pauses_processing_until_raised() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&caught, Catcher::push);

    let actor = framework.spawn(
        Hop {
            next: receiver.address(),
        },
        |reg| {
            reg.handler(hop);
        },
    );

    framework.set_max_threads(0);
    wait_until("workers to retire", || framework.num_threads() == 0);

    // Sends enqueue but nothing makes progress.
    for value in 0..3u32 {
        assert!(framework.send(value, receiver.address(), actor.address()));
    }
    thread::sleep(Duration::from_millis(200));
    assert_eq!(receiver.count(), 0);
    assert_eq!(actor.num_queued_messages(), 3);

    // Raising the floor restarts workers and drains the backlog.
    framework.set_min_threads(2);
    let mut consumed = 0;
    while consumed < 3 {
        consumed += receiver.wait(3);
    }
    wait_until("backlog to drain", || actor.num_queued_messages() == 0);
}

#[test]
fn dropping_the_framework_drains_outstanding_work() {
    const MESSAGES: u32 = 1_000;

    let runtime = Runtime::new();
    let receiver = Receiver::new(&runtime);

    let caught = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&caught, Catcher::push);

    {
        let framework = Framework::new(&runtime, Parameters::with_threads(4));
        let actor = framework.spawn(
            Hop {
                next: receiver.address(),
            },
            |reg| {
                reg.handler(hop);
            },
        );

        for value in 0..MESSAGES {
            assert!(framework.send(value, receiver.address(), actor.address()));
        }

        // Dropping the framework quiesces all queues before joining; the
        // actor is deregistered afterwards, once its mailbox is empty.
        drop(framework);
    }

    assert_eq!(receiver.consume(MESSAGES * 2), MESSAGES);
}

#[test]
fn per_thread_counter_values_cover_running_workers() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));

    wait_until("workers", || framework.num_threads() == 2);

    assert_eq!(framework.num_counters(), Counter::ALL.len());
    assert_eq!(
        framework.counter_name(Counter::MessagesProcessed),
        "messages processed"
    );

    let mut values = [0u32; 8];
    // Shared context plus both workers.
    let filled = framework.per_thread_counter_values(Counter::MessagesProcessed, &mut values);
    assert_eq!(filled, 3);
}
