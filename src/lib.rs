//! An embedded actor runtime.
//!
//! Programs built on this crate are populations of isolated actors that
//! communicate only by asynchronous message passing. A [`Runtime`] holds the
//! process-wide directories; each [`Framework`] owns a pool of worker
//! threads that execute actor handlers in parallel, one message at a time
//! per actor; a [`Receiver`] lets ordinary threads block on replies.
//!
//! ```no_run
//! use apiary::prelude::*;
//!
//! struct Greeter;
//!
//! fn on_name(_: &mut Greeter, ctx: &mut Context<'_>, name: &String, from: Address) {
//!     ctx.send(format!("hello, {}", name), from);
//! }
//!
//! let runtime = Runtime::new();
//! let framework = Framework::new(&runtime, Parameters::with_threads(2));
//!
//! let greeter = framework.spawn(Greeter, |reg| {
//!     reg.handler(on_name);
//! });
//!
//! let receiver = Receiver::new(&runtime);
//! let replies = std::sync::Arc::new(Catcher::<String>::new());
//! receiver.register_handler(&replies, Catcher::push);
//!
//! framework.send("world".to_string(), receiver.address(), greeter.address());
//! receiver.wait(1);
//! assert_eq!(replies.pop().unwrap().0, "hello, world");
//! ```

#![deny(clippy::all)]

pub mod alloc;
pub mod config;

mod actor;
mod address;
mod directory;
mod handler;
mod kernel;
mod message;
mod strings;
mod sync;
mod system;

pub use actor::{Agent, Context, Registrar};
pub use address::Address;
pub use alloc::{Allocator, DefaultAllocator};
pub use config::Config;
pub use kernel::Counter;
pub use message::Message;
pub use strings::Name;
pub use system::{Catcher, Framework, Parameters, Receiver, Runtime};

pub mod prelude {
    //! Everything a typical actor program imports.

    pub use crate::{
        Address, Agent, Catcher, Context, Counter, Framework, Message, Parameters, Receiver,
        Registrar, Runtime,
    };
}
