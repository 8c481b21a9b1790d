//! One column's value inside one row: an immutable, non-owning view. Cells
//! never outlive the buffer they point into.

use std::cmp::Ordering;

/// A nullable byte-string value.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Cell<'a> {
    is_null: bool,
    data: &'a [u8],
}

impl<'a> Cell<'a> {
    pub fn new(data: &'a [u8]) -> Cell<'a> {
        Cell {
            is_null: false,
            data,
        }
    }

    pub fn null() -> Cell<'static> {
        Cell {
            is_null: true,
            data: &[],
        }
    }

    pub fn is_null(&self) -> bool {
        self.is_null
    }

    pub fn data(&self) -> &'a [u8] {
        self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Total order over cells: nulls sort before every value and compare
    /// equal to each other; values compare bytewise.
    pub fn compare(&self, other: &Cell<'_>) -> Ordering {
        match (self.is_null, other.is_null) {
            (true, true) => Ordering::Equal,
            (true, false) => Ordering::Less,
            (false, true) => Ordering::Greater,
            (false, false) => self.data.cmp(other.data),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nulls_sort_first_and_equal() {
        assert_eq!(Cell::null().compare(&Cell::null()), Ordering::Equal);
        assert_eq!(Cell::null().compare(&Cell::new(b"")), Ordering::Less);
        assert_eq!(Cell::new(b"").compare(&Cell::null()), Ordering::Greater);
    }

    #[test]
    fn values_compare_bytewise() {
        assert_eq!(Cell::new(b"abc").compare(&Cell::new(b"abc")), Ordering::Equal);
        assert_eq!(Cell::new(b"abc").compare(&Cell::new(b"abd")), Ordering::Less);
        // A shorter byte string sorts before its extensions.
        assert_eq!(Cell::new(b"ab").compare(&Cell::new(b"abc")), Ordering::Less);
    }
}
