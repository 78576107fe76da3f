//! Two actors bouncing a counter back and forth, reporting the scheduler's
//! event counters at the end.

use std::env;
use std::sync::Arc;
use std::time::Instant;

use apiary::prelude::*;

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

fn main() {
    let hops: u32 = env::args()
        .nth(1)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(5_000_000);
    let threads: u32 = env::args()
        .nth(2)
        .and_then(|arg| arg.parse().ok())
        .unwrap_or(4);

    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(threads));

    let receiver = Receiver::new(&runtime);
    let done = Arc::new(Catcher::<u32>::new());
    receiver.register_handler(&done, Catcher::push);

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

    let started = Instant::now();
    framework.send(hops, pong.address(), ping.address());
    receiver.wait(1);
    let elapsed = started.elapsed();

    println!(
        "{} hops over {} threads in {:.3}s ({:.0} msgs/s)",
        hops,
        threads,
        elapsed.as_secs_f64(),
        f64::from(hops) / elapsed.as_secs_f64(),
    );

    for counter in Counter::ALL {
        println!(
            "{:>12}  {}",
            framework.counter_value(counter),
            counter.name(),
        );
    }
}
