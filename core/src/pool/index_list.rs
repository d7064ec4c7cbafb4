use super::Handle;

/// Fixed-capacity, unordered list of slot handles.
///
/// Entries `[0, count)` are live; the tail past `count` holds `None` once
/// [`IndexList::clear_tail`] has run. Removal swaps the last live entry into
/// the hole, so it is O(1) but does not preserve order.
#[derive(Debug, Clone)]
pub struct IndexList {
    entries: Vec<Option<Handle>>,
    count: usize,
}

impl IndexList {
    pub fn new(capacity: usize) -> Self {
        IndexList {
            entries: vec![None; capacity],
            count: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.len()
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.entries.len()
    }

    /// Appends `handle`. Returns `false` when the list is full.
    pub fn push(&mut self, handle: Handle) -> bool {
        if self.is_full() {
            return false;
        }
        self.entries[self.count] = Some(handle);
        self.count += 1;
        true
    }

    /// Takes the most recently pushed handle.
    pub fn pop(&mut self) -> Option<Handle> {
        if self.count == 0 {
            return None;
        }
        self.count -= 1;
        self.entries[self.count].take()
    }

    /// Linear scan for `handle`, returning its position.
    pub fn find(&self, handle: Handle) -> Option<usize> {
        self.entries[..self.count]
            .iter()
            .position(|entry| *entry == Some(handle))
    }

    pub fn get(&self, index: usize) -> Option<Handle> {
        if index >= self.count {
            return None;
        }
        self.entries[index]
    }

    /// Removes the entry at `index` by moving the last live entry into its place.
    pub fn swap_remove(&mut self, index: usize) -> Option<Handle> {
        if index >= self.count {
            return None;
        }
        let last = self.count - 1;
        let removed = self.entries[index];
        self.entries[index] = self.entries[last];
        self.entries[last] = None;
        self.count = last;
        removed
    }

    /// Resets every entry past `count` to `None`.
    pub fn clear_tail(&mut self) {
        for entry in self.entries[self.count..].iter_mut() {
            *entry = None;
        }
    }

    /// Number of entries past `count` that still hold a handle.
    pub fn stale_tail_len(&self) -> usize {
        self.entries[self.count..]
            .iter()
            .filter(|entry| entry.is_some())
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = Handle> + '_ {
        self.entries[..self.count].iter().flatten().copied()
    }
}
