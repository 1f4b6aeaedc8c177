//! Category keys for interchangeable items

use std::fmt;

/// Opaque key grouping interchangeable pooled items.
///
/// Categories carry no ordering semantics; each key is accounted for
/// independently of every other key.
///
/// # Examples
///
/// ```
/// use esox_prefetchpool::Category;
///
/// let header = Category::new(1);
/// assert_eq!(header, Category::from(1));
/// assert_eq!(header.value(), 1);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Category(i32);

impl Category {
    pub const fn new(value: i32) -> Self {
        Self(value)
    }

    pub const fn value(self) -> i32 {
        self.0
    }
}

impl From<i32> for Category {
    fn from(value: i32) -> Self {
        Self(value)
    }
}

impl fmt::Display for Category {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Items that know which category they belong to.
///
/// The pool derives the storage key from the item itself, so both
/// prefetched items and items recycled by the host land in the right slot.
pub trait Categorized {
    fn category(&self) -> Category;
}
