//! The outward-facing runtime objects: runtimes, frameworks, receivers.

pub(crate) mod framework;
pub(crate) mod logger;
pub(crate) mod receiver;
pub(crate) mod runtime;

pub use framework::{Framework, Parameters};
pub use receiver::{Catcher, Receiver};
pub use runtime::Runtime;
