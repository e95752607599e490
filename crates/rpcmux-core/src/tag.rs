//! Completion tags.

/// Opaque identity correlating a submitted batch with its completion.
///
/// The queue only compares tags; it never interprets the value. Callers
/// typically derive a tag from the address of the object that owns the
/// batch (`Tag::from_ptr`) or from a counter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Tag(pub u64);

impl Tag {
    #[inline]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    /// Tag carrying the address of `ptr`. The pointer is never dereferenced.
    #[inline]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr as usize as u64)
    }

    #[inline]
    pub const fn value(self) -> u64 {
        self.0
    }
}

impl From<u64> for Tag {
    fn from(v: u64) -> Self {
        Self(v)
    }
}

impl std::fmt::Display for Tag {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "tag:{:#x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ptr_identity() {
        let a = 1u32;
        let b = 2u32;
        assert_eq!(Tag::from_ptr(&a), Tag::from_ptr(&a));
        assert_ne!(Tag::from_ptr(&a), Tag::from_ptr(&b));
    }

    #[test]
    fn test_display() {
        assert_eq!(Tag::new(255).to_string(), "tag:0xff");
    }
}
