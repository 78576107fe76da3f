//! The runtime: process-wide state shared by frameworks and receivers.
//!
//! One runtime owns the framework and receiver directories, the string pool,
//! and the runtime-wide message cache over the user allocator. Everything
//! created against a runtime resolves cross-framework addresses through its
//! directories; separate runtimes are fully independent.

use std::sync::Arc;

use crate::alloc::{Allocator, DefaultAllocator, SharedCache};
use crate::directory::{Directory, DirectoryEntry};
use crate::strings::StringPool;
use crate::system::framework::FrameworkCore;
use crate::system::receiver::ReceiverCore;

pub(crate) struct RuntimeCore {
    pub(crate) cache: Arc<SharedCache>,
    pub(crate) strings: StringPool,
    pub(crate) frameworks: Directory<DirectoryEntry<FrameworkCore>>,
    pub(crate) receivers: Directory<DirectoryEntry<ReceiverCore>>,
}

/// Handle to a runtime instance. Cheap to clone; the runtime lives until the
/// last handle (and the last framework or receiver created against it) is
/// gone.
#[derive(Clone)]
pub struct Runtime {
    core: Arc<RuntimeCore>,
}

impl Runtime {
    /// Creates a runtime over the stock counting allocator.
    pub fn new() -> Runtime {
        Runtime::with_allocator(Arc::new(DefaultAllocator::new()))
    }

    /// Creates a runtime over a caller-supplied allocator. The allocator
    /// serves every envelope and cached block of this runtime; it cannot be
    /// replaced later.
    pub fn with_allocator(allocator: Arc<dyn Allocator + Send + Sync>) -> Runtime {
        Runtime {
            core: Arc::new(RuntimeCore {
                cache: Arc::new(SharedCache::new(allocator)),
                strings: StringPool::new(),
                frameworks: Directory::new(),
                receivers: Directory::new(),
            }),
        }
    }

    pub(crate) fn core(&self) -> &Arc<RuntimeCore> {
        &self.core
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new()
    }
}
