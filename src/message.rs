//! Message payloads and envelopes.
//!
//! An envelope is a single allocation holding a small header followed by the
//! payload value. The header carries everything a worker needs to dispatch
//! and destroy the message without knowing its concrete type: the sender
//! address, the type key, the payload's position and size (for blind
//! handlers), the block layout, and a drop thunk.

use std::alloc::Layout;
use std::any::TypeId;
use std::mem;
use std::ptr::{self, NonNull};
use std::slice;

use crate::address::Address;
use crate::alloc::Allocator;

/// A value that can be sent between actors.
///
/// Payloads may optionally declare a stable type name; dispatch then matches
/// handlers by name identity instead of [`TypeId`]. Use
/// [`register_message!`](crate::register_message) to declare a named payload
/// type, or implement the trait directly for the unnamed kind. Whichever way
/// a type is declared, the choice is fixed by its one `Message` impl, so
/// named and unnamed keys can never disagree for the same type.
pub trait Message: Send + 'static {
    /// The stable name of this payload type, if one was registered.
    fn type_name() -> Option<&'static str> {
        None
    }
}

/// Declares a payload type with a stable type name.
///
/// ```
/// struct Shutdown;
/// apiary::register_message!(Shutdown, "Shutdown");
/// ```
#[macro_export]
macro_rules! register_message {
    ($type:ty, $name:expr) => {
        impl $crate::Message for $type {
            fn type_name() -> Option<&'static str> {
                Some($name)
            }
        }
    };
}

macro_rules! unnamed_messages {
    ($($type:ty),* $(,)?) => {
        $(impl Message for $type {})*
    };
}

unnamed_messages!(
    (),
    bool,
    char,
    u8,
    i8,
    u16,
    i16,
    u32,
    i32,
    u64,
    i64,
    usize,
    isize,
    f32,
    f64,
    String,
    &'static str,
    Vec<u8>,
);

impl Message for Address {}

/// The dispatch identity of a payload type: its registered name, or its
/// runtime type id when no name was registered.
#[derive(Clone, Copy, Debug)]
pub(crate) enum TypeKey {
    Named(&'static str),
    Runtime(TypeId),
}

impl TypeKey {
    pub(crate) fn of<V: Message>() -> TypeKey {
        match V::type_name() {
            Some(name) => TypeKey::Named(name),
            None => TypeKey::Runtime(TypeId::of::<V>()),
        }
    }
}

impl PartialEq for TypeKey {
    fn eq(&self, other: &TypeKey) -> bool {
        match (self, other) {
            // Name identity; the pointer comparison is the fast path and the
            // content comparison covers literals that were not merged.
            (TypeKey::Named(a), TypeKey::Named(b)) => ptr::eq(*a, *b) || a == b,
            (TypeKey::Runtime(a), TypeKey::Runtime(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for TypeKey {}

struct EnvelopeHeader {
    from: Address,
    type_id: TypeId,
    type_name: Option<&'static str>,
    layout: Layout,
    payload_offset: u32,
    payload_size: u32,
    drop_in_place: unsafe fn(*mut EnvelopeHeader),
}

#[repr(C)]
struct TypedEnvelope<V> {
    header: EnvelopeHeader,
    value: V,
}

unsafe fn drop_envelope_in_place<V>(header: *mut EnvelopeHeader) {
    ptr::drop_in_place(header.cast::<TypedEnvelope<V>>());
}

/// An owned, type-erased message allocation.
///
/// Envelopes have exactly one owner at any time: the sender until delivery,
/// the mailbox while queued, the processing worker afterwards. They are not
/// dropped; the final owner destroys them explicitly through an allocator,
/// returning the block to a cache.
pub(crate) struct Envelope {
    ptr: NonNull<EnvelopeHeader>,
}

// The payload is `Send` by the `Message` bound and the envelope is uniquely
// owned, so moving it between threads is sound.
unsafe impl Send for Envelope {}

impl Envelope {
    /// Allocates and fills an envelope. Returns `None` when the allocator is
    /// exhausted; the caller reports a failed send.
    pub(crate) fn create<V: Message>(
        allocator: &dyn Allocator,
        value: V,
        from: Address,
    ) -> Option<Envelope> {
        let layout = Layout::new::<TypedEnvelope<V>>();
        let block = allocator.allocate(layout)?;
        let ptr = block.cast::<TypedEnvelope<V>>();

        let header = EnvelopeHeader {
            from,
            type_id: TypeId::of::<V>(),
            type_name: V::type_name(),
            layout,
            payload_offset: mem::offset_of!(TypedEnvelope<V>, value) as u32,
            payload_size: mem::size_of::<V>() as u32,
            drop_in_place: drop_envelope_in_place::<V>,
        };

        unsafe { ptr.as_ptr().write(TypedEnvelope { header, value }) };

        Some(Envelope { ptr: ptr.cast() })
    }

    fn header(&self) -> &EnvelopeHeader {
        unsafe { self.ptr.as_ref() }
    }

    pub(crate) fn from(&self) -> Address {
        self.header().from.clone()
    }

    pub(crate) fn type_key(&self) -> TypeKey {
        let header = self.header();
        match header.type_name {
            Some(name) => TypeKey::Named(name),
            None => TypeKey::Runtime(header.type_id),
        }
    }

    /// The payload as raw bytes, for blind handlers.
    pub(crate) fn payload_bytes(&self) -> &[u8] {
        let header = self.header();
        unsafe {
            let base = self.ptr.as_ptr().cast::<u8>();
            slice::from_raw_parts(
                base.add(header.payload_offset as usize),
                header.payload_size as usize,
            )
        }
    }

    /// The payload as a `V`, if that is what it is.
    pub(crate) fn value<V: Message>(&self) -> Option<&V> {
        if self.header().type_id != TypeId::of::<V>() {
            return None;
        }

        let typed = self.ptr.as_ptr().cast::<TypedEnvelope<V>>();
        Some(unsafe { &(*typed).value })
    }

    /// Drops the payload and returns the block to the given allocator.
    pub(crate) fn destroy(self, allocator: &dyn Allocator) {
        let header = self.ptr.as_ptr();
        unsafe {
            let layout = (*header).layout;
            let drop_in_place = (*header).drop_in_place;
            drop_in_place(header);
            allocator.deallocate(self.ptr.cast(), layout);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::alloc::DefaultAllocator;
    use std::sync::Arc;

    struct Tagged(u64);
    register_message!(Tagged, "Tagged");

    #[test]
    fn round_trips_the_payload() {
        let allocator = DefaultAllocator::new();
        let envelope =
            Envelope::create(&allocator, "hello".to_string(), Address::null()).unwrap();

        assert_eq!(envelope.value::<String>().unwrap(), "hello");
        assert!(envelope.value::<u32>().is_none());
        assert!(envelope.from().is_null());

        envelope.destroy(&allocator);
        assert_eq!(allocator.bytes_allocated(), 0);
    }

    #[test]
    fn blind_view_matches_the_value_size() {
        let allocator = DefaultAllocator::new();
        let envelope = Envelope::create(&allocator, 103i32, Address::null()).unwrap();

        assert_eq!(envelope.payload_bytes().len(), 4);
        assert_eq!(envelope.payload_bytes(), &103i32.to_ne_bytes()[..]);

        envelope.destroy(&allocator);
    }

    #[test]
    fn named_and_unnamed_keys_do_not_mix() {
        assert_eq!(TypeKey::of::<Tagged>(), TypeKey::Named("Tagged"));
        assert_ne!(TypeKey::of::<Tagged>(), TypeKey::of::<u64>());
        assert_eq!(TypeKey::of::<u64>(), TypeKey::Runtime(TypeId::of::<u64>()));
    }

    struct DropProbe(Arc<()>);
    impl Message for DropProbe {}

    #[test]
    fn destroy_runs_the_payload_drop() {
        let allocator = DefaultAllocator::new();
        let probe = Arc::new(());
        let envelope =
            Envelope::create(&allocator, DropProbe(probe.clone()), Address::null()).unwrap();

        assert_eq!(Arc::strong_count(&probe), 2);
        envelope.destroy(&allocator);
        assert_eq!(Arc::strong_count(&probe), 1);
    }
}
