//! Smallest possible actor program: one actor, one receiver, one message.

use std::sync::Arc;

use apiary::prelude::*;

struct Greeter;

fn greet(_: &mut Greeter, ctx: &mut Context<'_>, name: &String, from: Address) {
    ctx.send(format!("hello, {}", name), from);
}

fn main() {
    let runtime = Runtime::new();
    let framework = Framework::new(&runtime, Parameters::with_threads(2));

    let greeter = framework.spawn(Greeter, |reg| {
        reg.handler(greet);
    });

    let receiver = Receiver::new(&runtime);
    let replies = Arc::new(Catcher::<String>::new());
    receiver.register_handler(&replies, Catcher::push);

    framework.send("world".to_string(), receiver.address(), greeter.address());
    receiver.wait(1);

    println!("{}", replies.pop().unwrap().0);
}
