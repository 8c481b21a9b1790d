//! # Storage
//!
//! A paged sequence of opaque fixed-size elements, the backing container
//! for a table's rows. Pages are allocator chunks laid out as a meta-byte
//! array (one byte per element slot, padded to chunk alignment) followed by
//! the element array:
//!
//! ```text
//! page
//! ├── meta:     [m0][m1][m2]...[pad]      flags per slot
//! └── elements: [e0      ][e1      ]...   element_bytes each
//! ```
//!
//! Append and tail-pop are O(1) amortized. `erase` on an interior element
//! only tombstones it: interior holes are never compacted, and their page
//! space is reclaimed only once the tombstone run reaches the tail. This
//! is a deliberate space/time tradeoff; iteration skips tombstones in both
//! directions so callers never observe them.
//!
//! A [`StorageSlot`] is a stable element address. Live elements never move,
//! which is what lets index entries reference rows by slot.

use std::ptr::NonNull;

use eyre::Result;

use crate::allocator::Allocator;
use crate::config::{CHUNK_ALIGN, STORAGE_PAGE_BYTES_TARGET};

const META_DELETED: u8 = 0b0000_0001;
const META_FIRST: u8 = 0b0000_0010;
const META_LAST: u8 = 0b0000_0100;

/// Stable address of one element: page index plus slot-on-page.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct StorageSlot {
    pub page: usize,
    pub slot: usize,
}

struct Page {
    buf: NonNull<u8>,
    bytes: usize,
    /// Slots appended on this page so far, tombstones included.
    used: usize,
}

/// Paged container of fixed-size elements.
pub struct Storage {
    alloc: Allocator,
    element_bytes: usize,
    elements_per_page: usize,
    meta_area_bytes: usize,
    page_bytes: usize,
    pages: Vec<Page>,
    /// Live (non-tombstoned) element count.
    live: usize,
}

impl Storage {
    pub fn new(alloc: Allocator, element_bytes: usize) -> Storage {
        debug_assert!(element_bytes > 0);

        let elements_per_page =
            (STORAGE_PAGE_BYTES_TARGET / (element_bytes + 1)).max(1);
        let meta_area_bytes = elements_per_page.next_multiple_of(CHUNK_ALIGN);
        let page_bytes = meta_area_bytes + elements_per_page * element_bytes;

        Storage {
            alloc,
            element_bytes,
            elements_per_page,
            meta_area_bytes,
            page_bytes,
            pages: Vec::new(),
            live: 0,
        }
    }

    pub fn element_bytes(&self) -> usize {
        self.element_bytes
    }

    /// Live element count.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.live == 0
    }

    /// Appends one uninitialized element slot, creating a page if the tail
    /// page is full. Page allocation failure propagates untouched.
    pub fn allocate_back(&mut self) -> Result<StorageSlot> {
        let need_page = self
            .pages
            .last()
            .map_or(true, |p| p.used == self.elements_per_page);
        if need_page {
            let buf = self.alloc.allocate_bytes(self.page_bytes)?;
            self.pages.push(Page {
                buf,
                bytes: self.page_bytes,
                used: 0,
            });
        }

        let page_index = self.pages.len() - 1;
        let page = self.pages.last_mut().expect("page was just ensured");
        let slot = page.used;
        page.used += 1;

        let mut meta = META_LAST;
        if slot == 0 {
            meta |= META_FIRST;
        }
        // SAFETY: `slot < elements_per_page <= meta_area_bytes`, inside the
        // page buffer.
        unsafe {
            page.buf.as_ptr().add(slot).write(meta);
            if slot > 0 {
                let prev = page.buf.as_ptr().add(slot - 1);
                prev.write(prev.read() & !META_LAST);
            }
        }

        self.live += 1;
        Ok(StorageSlot {
            page: page_index,
            slot,
        })
    }

    /// Pops the live tail element, then reclaims any trailing tombstone
    /// run, freeing pages vacated along the way.
    pub fn deallocate_back(&mut self) {
        let tail = self.tail().expect("deallocate_back on empty storage");
        debug_assert!(!self.is_deleted(tail), "live tail expected");
        self.pop_tail_slot();
        self.live -= 1;
        self.reclaim_tail();
    }

    /// Tombstones `slot`; physically reclaims it (and the trailing
    /// tombstone run) only when it is the tail.
    pub fn erase(&mut self, slot: StorageSlot) {
        debug_assert!(!self.is_deleted(slot), "double erase");
        self.set_meta(slot, self.meta(slot) | META_DELETED);
        self.live -= 1;
        self.reclaim_tail();
    }

    pub fn element(&self, slot: StorageSlot) -> &[u8] {
        let page = &self.pages[slot.page];
        debug_assert!(slot.slot < page.used);
        // SAFETY: the element region of a used slot lies inside the page
        // buffer by the layout computed in `new`.
        unsafe {
            std::slice::from_raw_parts(
                page.buf
                    .as_ptr()
                    .add(self.meta_area_bytes + slot.slot * self.element_bytes),
                self.element_bytes,
            )
        }
    }

    pub fn element_mut(&mut self, slot: StorageSlot) -> &mut [u8] {
        let page = &self.pages[slot.page];
        debug_assert!(slot.slot < page.used);
        // SAFETY: as in `element`; &mut self guarantees exclusivity.
        unsafe {
            std::slice::from_raw_parts_mut(
                page.buf
                    .as_ptr()
                    .add(self.meta_area_bytes + slot.slot * self.element_bytes),
                self.element_bytes,
            )
        }
    }

    pub fn is_deleted(&self, slot: StorageSlot) -> bool {
        self.meta(slot) & META_DELETED != 0
    }

    /// Frees every page. Elements are opaque bytes here; owners of
    /// non-trivial element types destroy them before calling this.
    pub fn truncate(&mut self) {
        for page in self.pages.drain(..) {
            self.alloc.deallocate_bytes(page.buf, page.bytes);
        }
        self.live = 0;
    }

    /// First live element in sequence order.
    pub fn first(&self) -> Option<StorageSlot> {
        self.seek_forward(StorageSlot { page: 0, slot: 0 })
    }

    /// Last live element; what backward iteration from the end starts on.
    pub fn last(&self) -> Option<StorageSlot> {
        let tail = self.tail()?;
        if self.is_deleted(tail) {
            self.prev(tail)
        } else {
            Some(tail)
        }
    }

    /// Next live element after `slot`.
    pub fn next(&self, slot: StorageSlot) -> Option<StorageSlot> {
        self.seek_forward(self.advance(slot)?)
    }

    /// Previous live element before `slot`.
    pub fn prev(&self, slot: StorageSlot) -> Option<StorageSlot> {
        let mut cursor = slot;
        loop {
            cursor = self.recede(cursor)?;
            if !self.is_deleted(cursor) {
                return Some(cursor);
            }
        }
    }

    /// Forward iteration over live elements.
    pub fn iter(&self) -> Iter<'_> {
        Iter {
            storage: self,
            cursor: self.first(),
        }
    }

    /// Last occupied slot, tombstoned or not.
    fn tail(&self) -> Option<StorageSlot> {
        let page = self.pages.len().checked_sub(1)?;
        let used = self.pages[page].used;
        debug_assert!(used > 0, "empty pages are freed eagerly");
        Some(StorageSlot {
            page,
            slot: used - 1,
        })
    }

    fn meta(&self, slot: StorageSlot) -> u8 {
        let page = &self.pages[slot.page];
        debug_assert!(slot.slot < page.used);
        // SAFETY: `slot.slot` is a used slot within the meta area.
        unsafe { page.buf.as_ptr().add(slot.slot).read() }
    }

    fn set_meta(&mut self, slot: StorageSlot, meta: u8) {
        let page = &self.pages[slot.page];
        debug_assert!(slot.slot < page.used);
        // SAFETY: as in `meta`; &mut self guarantees exclusivity.
        unsafe { page.buf.as_ptr().add(slot.slot).write(meta) }
    }

    /// Removes the tail slot, freeing its page if it was the only one left
    /// on it.
    fn pop_tail_slot(&mut self) {
        let page = self.pages.last_mut().expect("tail slot exists");
        page.used -= 1;
        if page.used == 0 {
            let page = self.pages.pop().expect("page exists");
            self.alloc.deallocate_bytes(page.buf, page.bytes);
        } else {
            let used = page.used;
            // SAFETY: `used - 1` is a valid slot of the tail page.
            unsafe {
                let prev = page.buf.as_ptr().add(used - 1);
                prev.write(prev.read() | META_LAST);
            }
        }
    }

    /// Pops the trailing tombstone run so the tail is live (or the storage
    /// empty).
    fn reclaim_tail(&mut self) {
        while let Some(tail) = self.tail() {
            if !self.is_deleted(tail) {
                return;
            }
            self.pop_tail_slot();
        }
    }

    fn seek_forward(&self, mut cursor: StorageSlot) -> Option<StorageSlot> {
        loop {
            if cursor.page >= self.pages.len() || cursor.slot >= self.pages[cursor.page].used {
                return None;
            }
            if !self.is_deleted(cursor) {
                return Some(cursor);
            }
            cursor = self.advance(cursor)?;
        }
    }

    /// Slot arithmetic one step forward, ignoring tombstones.
    fn advance(&self, slot: StorageSlot) -> Option<StorageSlot> {
        if slot.slot + 1 < self.pages[slot.page].used {
            return Some(StorageSlot {
                page: slot.page,
                slot: slot.slot + 1,
            });
        }
        if slot.page + 1 < self.pages.len() {
            return Some(StorageSlot {
                page: slot.page + 1,
                slot: 0,
            });
        }
        None
    }

    /// Slot arithmetic one step backward, ignoring tombstones.
    fn recede(&self, slot: StorageSlot) -> Option<StorageSlot> {
        if slot.slot > 0 {
            return Some(StorageSlot {
                page: slot.page,
                slot: slot.slot - 1,
            });
        }
        let page = slot.page.checked_sub(1)?;
        Some(StorageSlot {
            page,
            slot: self.pages[page].used - 1,
        })
    }
}

impl Drop for Storage {
    fn drop(&mut self) {
        self.truncate();
    }
}

impl std::fmt::Debug for Storage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Storage")
            .field("element_bytes", &self.element_bytes)
            .field("elements_per_page", &self.elements_per_page)
            .field("pages", &self.pages.len())
            .field("live", &self.live)
            .finish()
    }
}

/// Forward iterator over live slots.
pub struct Iter<'a> {
    storage: &'a Storage,
    cursor: Option<StorageSlot>,
}

impl Iterator for Iter<'_> {
    type Item = StorageSlot;

    fn next(&mut self) -> Option<StorageSlot> {
        let slot = self.cursor?;
        self.cursor = self.storage.next(slot);
        Some(slot)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::memory::{MemoryMonitor, TableResourceMonitor};

    fn storage(element_bytes: usize) -> (Storage, Arc<MemoryMonitor>) {
        let mem = Arc::new(MemoryMonitor::with_thresholds(usize::MAX, 0, false));
        let table = Arc::new(TableResourceMonitor::new(usize::MAX));
        let alloc = Allocator::new(Arc::clone(&mem), table, None);
        (Storage::new(alloc, element_bytes), mem)
    }

    fn fill(storage: &mut Storage, values: &[u8]) -> Vec<StorageSlot> {
        values
            .iter()
            .map(|v| {
                let slot = storage.allocate_back().unwrap();
                storage.element_mut(slot).fill(*v);
                slot
            })
            .collect()
    }

    fn collect_forward(storage: &Storage) -> Vec<u8> {
        storage.iter().map(|s| storage.element(s)[0]).collect()
    }

    fn collect_backward(storage: &Storage) -> Vec<u8> {
        let mut out = Vec::new();
        let mut cursor = storage.last();
        while let Some(slot) = cursor {
            out.push(storage.element(slot)[0]);
            cursor = storage.prev(slot);
        }
        out
    }

    #[test]
    fn append_and_read_back() {
        let (mut storage, _mem) = storage(16);
        let slots = fill(&mut storage, &[1, 2, 3]);

        assert_eq!(storage.len(), 3);
        assert_eq!(storage.element(slots[1])[0], 2);
        assert_eq!(collect_forward(&storage), vec![1, 2, 3]);
    }

    #[test]
    fn interior_erase_tombstones_without_moving_live_elements() {
        let (mut storage, _mem) = storage(16);
        let slots = fill(&mut storage, &[1, 2, 3, 4]);

        storage.erase(slots[1]);
        assert_eq!(storage.len(), 3);
        assert_eq!(collect_forward(&storage), vec![1, 3, 4]);

        // The survivors kept their addresses.
        assert_eq!(storage.element(slots[2])[0], 3);
        assert_eq!(storage.element(slots[3])[0], 4);
    }

    #[test]
    fn forward_and_backward_visits_are_reverses() {
        let (mut storage, _mem) = storage(8);
        let slots = fill(&mut storage, &[1, 2, 3, 4, 5, 6]);
        storage.erase(slots[0]);
        storage.erase(slots[3]);
        storage.erase(slots[5]);

        let forward = collect_forward(&storage);
        let mut backward = collect_backward(&storage);
        backward.reverse();
        assert_eq!(forward, vec![2, 3, 5]);
        assert_eq!(forward, backward);
    }

    #[test]
    fn erasing_the_tail_reclaims_the_trailing_tombstone_run() {
        let (mut storage, _mem) = storage(16);
        let slots = fill(&mut storage, &[1, 2, 3, 4]);

        // Interior tombstones first, then the tail: the whole run goes.
        storage.erase(slots[2]);
        storage.erase(slots[1]);
        storage.erase(slots[3]);

        assert_eq!(storage.len(), 1);
        assert_eq!(collect_forward(&storage), vec![1]);

        // The reclaimed slots are reusable.
        let slot = storage.allocate_back().unwrap();
        assert_eq!(slot, slots[1]);
    }

    #[test]
    fn pages_are_freed_when_vacated() {
        // Elements sized so a page holds few of them.
        let (mut storage, mem) = storage(STORAGE_PAGE_BYTES_TARGET / 4);
        let values: Vec<u8> = (1..=9).collect();
        let slots = fill(&mut storage, &values);
        let high_water = mem.ram_consumption();
        assert!(high_water > 0);

        for slot in slots.into_iter().rev() {
            storage.erase(slot);
        }
        assert!(storage.is_empty());
        assert_eq!(storage.first(), None);
        assert_eq!(storage.last(), None);

        drop(storage);
        assert_eq!(mem.ram_consumption(), 0);
    }

    #[test]
    fn deallocate_back_pops_the_live_tail() {
        let (mut storage, _mem) = storage(16);
        fill(&mut storage, &[1, 2, 3]);

        storage.deallocate_back();
        assert_eq!(collect_forward(&storage), vec![1, 2]);
        storage.deallocate_back();
        storage.deallocate_back();
        assert!(storage.is_empty());
    }

    #[test]
    fn truncate_resets_to_empty() {
        let (mut storage, mem) = storage(32);
        fill(&mut storage, &[1, 2, 3]);

        storage.truncate();
        assert!(storage.is_empty());
        assert_eq!(collect_forward(&storage), Vec::<u8>::new());

        // Usable again after truncation.
        fill(&mut storage, &[9]);
        assert_eq!(collect_forward(&storage), vec![9]);
        drop(storage);
        assert_eq!(mem.ram_consumption(), 0);
    }
}
