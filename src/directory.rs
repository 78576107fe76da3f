//! Indexable registries of addressable entities.
//!
//! A directory maps small integer indices to slots. Pages of slots are
//! allocated lazily and never freed while the directory lives, which is what
//! makes the unlocked `entry` lookup sound. Index zero is reserved for the
//! null address.

use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;

use crate::sync::{backoff, SpinLock};

pub(crate) const ENTRIES_PER_PAGE: u32 = 1024;
pub(crate) const MAX_PAGES: u32 = 1024;
const CAPACITY: u32 = ENTRIES_PER_PAGE * MAX_PAGES;

pub(crate) struct Directory<T> {
    next_index: Mutex<u32>,
    pages: Box<[OnceLock<Box<[T]>>]>,
}

impl<T: Default> Directory<T> {
    pub(crate) fn new() -> Self {
        Directory {
            next_index: Mutex::new(0),
            pages: (0..MAX_PAGES).map(|_| OnceLock::new()).collect(),
        }
    }

    /// Claims the next free index, skipping index zero and wrapping at
    /// capacity, and makes sure its page exists.
    pub(crate) fn allocate(&self) -> u32 {
        let mut next = self.next_index.lock();

        *next += 1;
        if *next == CAPACITY {
            *next = 1;
        }
        let index = *next;

        let page = (index / ENTRIES_PER_PAGE) as usize;
        self.pages[page].get_or_init(|| {
            (0..ENTRIES_PER_PAGE).map(|_| T::default()).collect()
        });

        index
    }

    /// Unlocked slot lookup. `None` for index zero, out-of-range indices and
    /// indices whose page was never allocated.
    pub(crate) fn entry(&self, index: u32) -> Option<&T> {
        if index == 0 || index >= CAPACITY {
            return None;
        }

        let page = self.pages[(index / ENTRIES_PER_PAGE) as usize].get()?;
        page.get((index % ENTRIES_PER_PAGE) as usize)
    }

    /// Visits every slot of every allocated page.
    pub(crate) fn for_each(&self, mut visit: impl FnMut(&T)) {
        for page in self.pages.iter().filter_map(|page| page.get()) {
            for slot in page.iter() {
                visit(slot);
            }
        }
    }
}

struct EntryState<E> {
    entity: Option<Arc<E>>,
    pin_count: u32,
}

impl<E> Default for EntryState<E> {
    fn default() -> Self {
        EntryState {
            entity: None,
            pin_count: 0,
        }
    }
}

/// One slot of an entity directory: the registered entity, a spin lock, and
/// a pin count.
///
/// Pinning lets a reader dereference the entity while a concurrent
/// deregistration is in flight: `free` refuses to run while any pin is held,
/// so the deregistering thread spins until the readers are done. Readers are
/// short-lived, so the spin is bounded in practice.
pub(crate) struct DirectoryEntry<E> {
    state: SpinLock<EntryState<E>>,
}

impl<E> Default for DirectoryEntry<E> {
    fn default() -> Self {
        DirectoryEntry {
            state: SpinLock::default(),
        }
    }
}

impl<E> DirectoryEntry<E> {
    /// Registers an entity. The slot must be unpinned and empty.
    pub(crate) fn set_entity(&self, entity: Arc<E>) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.pin_count, 0);
        debug_assert!(state.entity.is_none());
        state.entity = Some(entity);
    }

    /// Pins the entry and snapshots the registered entity. The pin is
    /// released when the returned guard drops.
    pub(crate) fn pin(&self) -> PinnedEntry<'_, E> {
        let mut state = self.state.lock();
        state.pin_count += 1;
        let entity = state.entity.clone();
        drop(state);

        PinnedEntry { entry: self, entity }
    }

    /// Clears the slot unless it is pinned.
    fn try_free(&self) -> bool {
        let mut state = self.state.lock();
        if state.pin_count > 0 {
            return false;
        }
        state.entity = None;
        true
    }

    /// Clears the slot, spinning while readers hold pins. Returns the number
    /// of backoff steps taken, which callers may use for diagnostics.
    pub(crate) fn deregister(&self) -> u32 {
        let mut spins = 0;
        loop {
            if self.try_free() {
                return spins;
            }
            backoff(&mut spins);
        }
    }
}

pub(crate) struct PinnedEntry<'a, E> {
    entry: &'a DirectoryEntry<E>,
    entity: Option<Arc<E>>,
}

impl<E> PinnedEntry<'_, E> {
    pub(crate) fn entity(&self) -> Option<&Arc<E>> {
        self.entity.as_ref()
    }
}

impl<E> Drop for PinnedEntry<'_, E> {
    fn drop(&mut self) {
        let mut state = self.entry.state.lock();
        debug_assert!(state.pin_count > 0);
        state.pin_count -= 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn indices_start_at_one() {
        let directory: Directory<DirectoryEntry<u32>> = Directory::new();
        assert_eq!(directory.allocate(), 1);
        assert_eq!(directory.allocate(), 2);
        assert!(directory.entry(0).is_none());
        assert!(directory.entry(1).is_some());
        assert!(directory.entry(3000).is_none());
    }

    #[test]
    fn pin_defers_deregistration() {
        let directory: Directory<DirectoryEntry<u32>> = Directory::new();
        let index = directory.allocate();

        let entry = directory.entry(index).unwrap();
        entry.set_entity(Arc::new(7));

        let pinned = entry.pin();
        assert_eq!(pinned.entity().map(|e| **e), Some(7));

        // A deregistration racing with the pin must wait for its release.
        thread::scope(|scope| {
            let handle = scope.spawn(|| {
                directory.entry(index).unwrap().deregister();
            });

            thread::sleep(Duration::from_millis(20));
            assert!(!handle.is_finished());

            drop(pinned);
            handle.join().unwrap();
        });

        assert!(directory.entry(index).unwrap().pin().entity().is_none());
    }

    #[test]
    fn free_slot_pins_to_nothing() {
        let entry: DirectoryEntry<u32> = DirectoryEntry::default();
        assert!(entry.pin().entity().is_none());
    }
}
