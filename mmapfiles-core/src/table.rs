use std::ptr::NonNull;
use thiserror::Error;

/// Live-mapping capacity of one worker.
pub const MAX_MAPPINGS: usize = 512 * 1024;

#[derive(Error, Debug)]
pub enum TableError {
    #[error("Failed to allocate mapping table for {0} entries")]
    AllocationFailed(usize),
    #[error("Mapping table full ({0} entries)")]
    Full(usize),
}

/// One live file mapping. A cleared slot has no address and zero length.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Mapping {
    pub addr: Option<NonNull<u8>>,
    pub len: usize,
}

impl Mapping {
    pub fn is_cleared(&self) -> bool {
        self.addr.is_none() && self.len == 0
    }
}

/// Fixed-capacity arena of live mappings for one traversal pass.
///
/// # Purpose
/// Slots are allocated once up front and reused every cycle; the high-water
/// count is reset instead of the storage being reallocated, so the table's
/// own footprint never moves while the system is under memory pressure.
///
/// # Invariants
/// * `count <= slots.len()`.
/// * Slots at and beyond `count` are cleared.
pub struct MappingTable {
    slots: Vec<Mapping>,
    count: usize,
}

impl MappingTable {
    /// Allocates `capacity` cleared slots.
    ///
    /// # Errors
    /// Returns `TableError::AllocationFailed` instead of aborting when the
    /// allocator refuses the request.
    pub fn with_capacity(capacity: usize) -> Result<Self, TableError> {
        let mut slots = Vec::new();
        slots
            .try_reserve_exact(capacity)
            .map_err(|_| TableError::AllocationFailed(capacity))?;
        slots.resize(capacity, Mapping::default());
        Ok(Self { slots, count: 0 })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_full(&self) -> bool {
        self.count >= self.slots.len()
    }

    /// Appends a mapping.
    ///
    /// # Errors
    /// Returns `TableError::Full` once every slot is taken; the caller still
    /// owns the mapping.
    pub fn try_push(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), TableError> {
        if self.is_full() {
            return Err(TableError::Full(self.slots.len()));
        }
        self.slots[self.count] = Mapping { addr: Some(addr), len };
        self.count += 1;
        Ok(())
    }

    /// The populated prefix, in insertion order.
    pub fn live(&self) -> &[Mapping] {
        &self.slots[..self.count]
    }

    /// Every slot, populated or not.
    pub fn slots(&self) -> &[Mapping] {
        &self.slots
    }

    /// Hands every live entry to `release` in table order, clearing each slot
    /// right after, then resets the count.
    pub fn drain_with<F>(&mut self, mut release: F)
    where
        F: FnMut(NonNull<u8>, usize),
    {
        for slot in &mut self.slots[..self.count] {
            if let Some(addr) = slot.addr {
                release(addr, slot.len);
            }
            *slot = Mapping::default();
        }
        self.count = 0;
    }
}
