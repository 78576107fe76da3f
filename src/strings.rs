//! Interned names.
//!
//! Addresses carry names, and addresses are compared on every dispatch, so
//! names are interned once and compared by pointer afterwards. The pool is
//! owned by the runtime; dropping the runtime drops the pool.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;

const BUCKET_COUNT: usize = 128;

/// Hashes the first 64 bytes of the string by XOR, folded to 7 bits.
/// Names are short and few; spreading them over 128 buckets is plenty.
fn bucket_of(value: &str) -> usize {
    let mut hash = 0u8;
    for byte in value.bytes().take(64) {
        hash ^= byte;
    }
    (hash & 127) as usize
}

pub(crate) struct StringPool {
    buckets: Box<[Mutex<Vec<Arc<str>>>]>,
}

impl StringPool {
    pub(crate) fn new() -> Self {
        StringPool {
            buckets: (0..BUCKET_COUNT).map(|_| Mutex::new(Vec::new())).collect(),
        }
    }

    /// Returns the pooled handle for `value`, creating it on first sight.
    pub(crate) fn intern(&self, value: &str) -> Name {
        let mut bucket = self.buckets[bucket_of(value)].lock();

        for entry in bucket.iter() {
            if &**entry == value {
                return Name(Some(entry.clone()));
            }
        }

        let entry: Arc<str> = Arc::from(value);
        bucket.push(entry.clone());
        Name(Some(entry))
    }
}

/// A lightweight handle to a pooled string.
///
/// Equality and ordering compare the underlying pointer, which is valid
/// because the pool guarantees one allocation per distinct string. The null
/// name is the name of the null address.
#[derive(Clone)]
pub struct Name(Option<Arc<str>>);

impl Name {
    pub fn null() -> Name {
        Name(None)
    }

    pub fn is_null(&self) -> bool {
        self.0.is_none()
    }

    pub fn as_str(&self) -> Option<&str> {
        self.0.as_deref()
    }

    fn ptr_value(&self) -> usize {
        self.0
            .as_ref()
            .map(|s| Arc::as_ptr(s) as *const u8 as usize)
            .unwrap_or(0)
    }
}

impl PartialEq for Name {
    fn eq(&self, other: &Name) -> bool {
        self.ptr_value() == other.ptr_value()
    }
}

impl Eq for Name {}

impl PartialOrd for Name {
    fn partial_cmp(&self, other: &Name) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Name {
    fn cmp(&self, other: &Name) -> std::cmp::Ordering {
        // Arbitrary but total: pointer values.
        self.ptr_value().cmp(&other.ptr_value())
    }
}

impl fmt::Debug for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Some(s) => write!(f, "Name({:?})", s),
            None => f.write_str("Name(null)"),
        }
    }
}

impl fmt::Display for Name {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.as_str() {
            Some(s) => f.write_str(s),
            None => f.write_str("(null)"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn interning_is_idempotent() {
        let pool = StringPool::new();
        let a = pool.intern("ping");
        let b = pool.intern("ping");
        let c = pool.intern("pong");

        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.as_str(), Some("ping"));
    }

    #[test]
    fn distinct_pools_intern_distinct_handles() {
        let one = StringPool::new();
        let two = StringPool::new();
        assert_ne!(one.intern("same"), two.intern("same"));
    }

    #[test]
    fn null_name_compares_equal_to_itself() {
        assert_eq!(Name::null(), Name::null());
        assert_ne!(Name::null(), StringPool::new().intern("x"));
    }
}
