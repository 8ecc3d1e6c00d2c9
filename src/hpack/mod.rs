//! HPACK dynamic header table (RFC 7541).
//!
//! Per-flow indexed cache of decoded header fields for the HTTP/2
//! inspector. Entries live in a fixed circular buffer: the newest entry
//! sits at virtual dynamic index 1 and eviction always removes the
//! oldest. The RFC's size accounting (entry size = name + value + 32)
//! bounds the table independently of the buffer capacity, and memory
//! consumption is reported to the owning flow in fixed increments.

use std::cell::Cell;
use std::rc::Rc;

/// Hard slot limit of the backing circular buffer.
pub const ARRAY_CAPACITY: usize = 512;

/// RFC 7541 §4.1: each entry costs its name and value lengths plus 32.
pub const RFC_ENTRY_OVERHEAD: usize = 32;

/// Highest index of the static table; dynamic indices start above it.
pub const STATIC_MAX_INDEX: usize = 61;

/// Granularity of flow memory accounting.
pub const TABLE_MEMORY_TRACKING_INCREMENT: usize = 8192;

/// RFC 7541 §6.5.2 default dynamic table size.
pub const DEFAULT_MAX_SIZE: usize = 4096;

/// Owned header field bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Field(Vec<u8>);

impl Field {
    pub fn new(bytes: &[u8]) -> Self {
        Self(bytes.to_vec())
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }
}

/// One dynamic table entry. Owns copies of its name and value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HpackTableEntry {
    pub name: Field,
    pub value: Field,
}

impl HpackTableEntry {
    fn new(name: &[u8], value: &[u8]) -> Self {
        Self {
            name: Field::new(name),
            value: Field::new(value),
        }
    }

    /// RFC table size contribution of this entry.
    pub fn size(&self) -> usize {
        self.name.len() + self.value.len() + RFC_ENTRY_OVERHEAD
    }
}

/// Flow-level memory accounting sink. Single-threaded per flow.
pub trait AllocationTracker {
    fn update_allocations(&self, bytes: usize);
    fn update_deallocations(&self, bytes: usize);
}

/// Reference tracker keeping running totals.
#[derive(Debug, Default)]
pub struct FlowAllocations {
    allocated: Cell<usize>,
    deallocated: Cell<usize>,
}

impl FlowAllocations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn allocated(&self) -> usize {
        self.allocated.get()
    }

    pub fn deallocated(&self) -> usize {
        self.deallocated.get()
    }

    pub fn in_use(&self) -> usize {
        self.allocated.get().saturating_sub(self.deallocated.get())
    }
}

impl AllocationTracker for FlowAllocations {
    fn update_allocations(&self, bytes: usize) {
        self.allocated.set(self.allocated.get() + bytes);
    }

    fn update_deallocations(&self, bytes: usize) {
        self.deallocated.set(self.deallocated.get() + bytes);
    }
}

/// The dynamic table proper. Lifetime bound to its owning HTTP/2 flow.
pub struct HpackDynamicTable {
    session: Rc<dyn AllocationTracker>,
    circular_buf: Vec<Option<HpackTableEntry>>,
    start: usize,
    num_entries: usize,
    rfc_table_size: usize,
    max_size: usize,
    table_memory_allocated: usize,
    peak_entries: usize,
}

impl HpackDynamicTable {
    fn baseline() -> usize {
        ARRAY_CAPACITY * std::mem::size_of::<Option<HpackTableEntry>>()
            + TABLE_MEMORY_TRACKING_INCREMENT
    }

    pub fn new(session: Rc<dyn AllocationTracker>) -> Self {
        session.update_allocations(Self::baseline());
        Self {
            session,
            circular_buf: (0..ARRAY_CAPACITY).map(|_| None).collect(),
            start: 0,
            num_entries: 0,
            rfc_table_size: 0,
            max_size: DEFAULT_MAX_SIZE,
            table_memory_allocated: TABLE_MEMORY_TRACKING_INCREMENT,
            peak_entries: 0,
        }
    }

    /// Insert a header field at the front of the table.
    ///
    /// Returns false only when the backing buffer is out of slots. An
    /// entry larger than the whole table is not an error: per RFC 7541
    /// §4.4 it clears the table and the add "succeeds".
    pub fn add_entry(&mut self, name: &[u8], value: &[u8]) -> bool {
        if self.num_entries >= ARRAY_CAPACITY {
            return false;
        }

        let new_entry_size = name.len() + value.len() + RFC_ENTRY_OVERHEAD;

        if new_entry_size > self.max_size {
            self.prune_to_size(0);
            return true;
        }

        // Copy before pruning: the name may alias an entry about to be
        // evicted.
        let new_entry = HpackTableEntry::new(name, value);

        self.prune_to_size(self.max_size - new_entry_size);

        self.start = (self.start + ARRAY_CAPACITY - 1) % ARRAY_CAPACITY;
        self.circular_buf[self.start] = Some(new_entry);
        self.num_entries += 1;
        self.peak_entries = self.peak_entries.max(self.num_entries);

        self.rfc_table_size += new_entry_size;
        while self.rfc_table_size > self.table_memory_allocated {
            self.session
                .update_allocations(TABLE_MEMORY_TRACKING_INCREMENT);
            self.table_memory_allocated += TABLE_MEMORY_TRACKING_INCREMENT;
        }

        true
    }

    /// Look up by the combined static + dynamic index space: the newest
    /// dynamic entry is `STATIC_MAX_INDEX + 1`.
    pub fn get_entry(&self, virtual_index: usize) -> Option<&HpackTableEntry> {
        let dyn_index = virtual_index.checked_sub(STATIC_MAX_INDEX + 1)?;
        if dyn_index >= self.num_entries {
            return None;
        }
        self.circular_buf[(self.start + dyn_index) % ARRAY_CAPACITY].as_ref()
    }

    /// Apply a dynamic table size update instruction.
    pub fn update_size(&mut self, new_size: usize) {
        if new_size < self.rfc_table_size {
            self.prune_to_size(new_size);
        }
        self.max_size = new_size;
    }

    /// Evict least-recently-added entries until the table fits.
    fn prune_to_size(&mut self, new_max_size: usize) {
        while self.rfc_table_size > new_max_size && self.num_entries > 0 {
            let last_index = (self.start + self.num_entries - 1) % ARRAY_CAPACITY;
            self.num_entries -= 1;
            if let Some(entry) = self.circular_buf[last_index].take() {
                self.rfc_table_size -= entry.size();
            }
        }
    }

    pub fn num_entries(&self) -> usize {
        self.num_entries
    }

    pub fn rfc_table_size(&self) -> usize {
        self.rfc_table_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    /// High-water mark of live entries over the table's lifetime.
    pub fn peak_entries(&self) -> usize {
        self.peak_entries
    }
}

impl Drop for HpackDynamicTable {
    fn drop(&mut self) {
        self.session.update_deallocations(Self::baseline());
        while self.table_memory_allocated > TABLE_MEMORY_TRACKING_INCREMENT {
            self.session
                .update_deallocations(TABLE_MEMORY_TRACKING_INCREMENT);
            self.table_memory_allocated -= TABLE_MEMORY_TRACKING_INCREMENT;
        }
    }
}

impl std::fmt::Debug for HpackDynamicTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HpackDynamicTable")
            .field("num_entries", &self.num_entries)
            .field("rfc_table_size", &self.rfc_table_size)
            .field("max_size", &self.max_size)
            .field("start", &self.start)
            .finish()
    }
}
