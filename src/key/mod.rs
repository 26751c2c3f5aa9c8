use std::fmt;

use strum::{Display, EnumIter, FromRepr};

const LOCALITY_SHIFT: u32 = 4;
const TYPE_MASK: u64 = 0xf;

/// Record kind, stored in the low bits of the first key element.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumIter, FromRepr)]
#[repr(u8)]
pub enum KeyType {
    FileName = 0,
    StatData = 1,
    AttrName = 2,
    AttrBody = 3,
    Body = 4,
}

/// Three 64-bit elements compared lexicographically:
/// `locality:60 | type:4`, object id, offset.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Key {
    el: [u64; 3],
}

impl Key {
    pub const MIN: Key = Key { el: [0; 3] };
    pub const MAX: Key = Key { el: [u64::MAX; 3] };

    pub fn new(locality: u64, key_type: KeyType, objectid: u64, offset: u64) -> Self {
        assert!(
            locality < (1 << (64 - LOCALITY_SHIFT)),
            "locality {:#x} does not fit in {} bits",
            locality,
            64 - LOCALITY_SHIFT
        );
        Self {
            el: [
                (locality << LOCALITY_SHIFT) | key_type as u64,
                objectid,
                offset,
            ],
        }
    }

    pub fn from_elements(el: [u64; 3]) -> Self {
        Self { el }
    }

    pub fn elements(&self) -> [u64; 3] {
        self.el
    }

    pub fn locality(&self) -> u64 {
        self.el[0] >> LOCALITY_SHIFT
    }

    /// `None` for keys whose type bits name no known kind, such as `MAX`.
    pub fn key_type(&self) -> Option<KeyType> {
        KeyType::from_repr((self.el[0] & TYPE_MASK) as u8)
    }

    pub fn objectid(&self) -> u64 {
        self.el[1]
    }

    pub fn offset(&self) -> u64 {
        self.el[2]
    }

    pub fn with_offset(mut self, offset: u64) -> Self {
        self.el[2] = offset;
        self
    }
}

impl fmt::Debug for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.key_type() {
            Some(ty) => write!(
                f,
                "({:x}:{}:{:x}:{:x})",
                self.locality(),
                ty,
                self.objectid(),
                self.offset()
            ),
            None => write!(f, "({:x}:{:x}:{:x})", self.el[0], self.el[1], self.el[2]),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::IntoEnumIterator;

    #[test]
    fn ordering_follows_locality_type_objectid_offset() {
        let a = Key::new(1, KeyType::StatData, 10, 0);
        let b = Key::new(1, KeyType::Body, 5, 0);
        let c = Key::new(2, KeyType::FileName, 0, 0);
        assert!(a < b);
        assert!(b < c);
        assert!(b < b.with_offset(1));
        assert!(Key::MIN < a && c < Key::MAX);
    }

    #[test]
    fn fields_survive_packing() {
        for ty in KeyType::iter() {
            let key = Key::new(0xabc, ty, 42, 4096);
            assert_eq!(key.locality(), 0xabc);
            assert_eq!(key.key_type(), Some(ty));
            assert_eq!(key.objectid(), 42);
            assert_eq!(key.offset(), 4096);
        }
        assert_eq!(Key::MAX.key_type(), None);
    }

    #[test]
    #[should_panic(expected = "does not fit")]
    fn oversized_locality_is_refused() {
        Key::new(1 << 60, KeyType::Body, 1, 0);
    }
}
