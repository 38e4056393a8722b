//! Order-preserving composite byte keys.

/// Builds byte keys whose lexicographic order matches the order of their
/// components.
///
/// Strings are terminated by `0x00`, so a key made of a prefix of another
/// key's components sorts before it. Integers are written big-endian with
/// the sign bit flipped.
///
/// ```rust
/// use docsync_storage::KeyBuilder;
///
/// let a = KeyBuilder::new().string("items").i32(2).build();
/// let b = KeyBuilder::new().string("items").i32(10).build();
/// assert!(a < b);
/// ```
#[derive(Debug, Clone, Default)]
pub struct KeyBuilder {
    bytes: Vec<u8>,
}

impl KeyBuilder {
    /// Starts an empty key.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Appends a string component.
    #[must_use]
    pub fn string(mut self, value: &str) -> Self {
        self.bytes.extend_from_slice(value.as_bytes());
        self.bytes.push(0);
        self
    }

    /// Appends every segment as a string component.
    #[must_use]
    pub fn segments<'a, I>(mut self, segments: I) -> Self
    where
        I: IntoIterator<Item = &'a String>,
    {
        for segment in segments {
            self = self.string(segment);
        }
        self
    }

    /// Appends a signed 32-bit component.
    #[must_use]
    pub fn i32(mut self, value: i32) -> Self {
        self.bytes
            .extend_from_slice(&((value as u32) ^ 0x8000_0000).to_be_bytes());
        self
    }

    /// Appends a signed 64-bit component.
    #[must_use]
    pub fn i64(mut self, value: i64) -> Self {
        self.bytes
            .extend_from_slice(&((value as u64) ^ 0x8000_0000_0000_0000).to_be_bytes());
        self
    }

    /// Appends raw bytes without a terminator.
    #[must_use]
    pub fn raw(mut self, value: &[u8]) -> Self {
        self.bytes.extend_from_slice(value);
        self
    }

    /// Finishes the key.
    #[must_use]
    pub fn build(self) -> Vec<u8> {
        self.bytes
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn prefix_sorts_first() {
        let parent = KeyBuilder::new().string("items").string("a").build();
        let child = KeyBuilder::new()
            .string("items")
            .string("a")
            .string("sub")
            .build();
        let sibling = KeyBuilder::new().string("items").string("b").build();
        assert!(parent < child);
        assert!(child < sibling);
        assert!(child.starts_with(&parent));
    }

    proptest! {
        #[test]
        fn i32_order_preserved(a in any::<i32>(), b in any::<i32>()) {
            let ka = KeyBuilder::new().i32(a).build();
            let kb = KeyBuilder::new().i32(b).build();
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }

        #[test]
        fn i64_order_preserved(a in any::<i64>(), b in any::<i64>()) {
            let ka = KeyBuilder::new().i64(a).build();
            let kb = KeyBuilder::new().i64(b).build();
            prop_assert_eq!(a.cmp(&b), ka.cmp(&kb));
        }
    }
}
