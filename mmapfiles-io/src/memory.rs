use std::marker::PhantomData;
use std::mem;
use std::ptr::NonNull;
use libc::c_void;
use thiserror::Error;
use log::debug;

#[derive(Error, Debug)]
pub enum MemoryError {
    #[error("Failed to map shared anonymous region of {0} bytes: {1}")]
    SharedMapFailed(usize, nix::errno::Errno),
    #[error("Shared region size overflow: {0} slots of {1} bytes")]
    SizeOverflow(usize, usize),
    #[error("Failed to allocate {0} bytes")]
    AllocationFailed(usize),
}

/// Marker for types whose all-zero bit pattern is a valid value.
///
/// # Safety
/// Implementors must be `#[repr(C)]` plain data (floats, integers, atomics)
/// with no pointers, references or niches, so that the zeroed pages handed
/// out by the kernel are a valid instance.
pub unsafe trait ZeroInit: Sized {}

/// A fixed array of `T` living in a `MAP_SHARED | MAP_ANONYMOUS` mapping.
///
/// # Logic
/// The region is created before `fork()`, so every child sees the same
/// physical pages as its parent. Each child owns one slot and writes to it;
/// the parent only reads a slot after the owning child has been reaped, which
/// orders the accesses through process exit instead of a lock.
pub struct SharedSlots<T: ZeroInit> {
    ptr: NonNull<T>,
    count: usize,
    _marker: PhantomData<T>,
}

impl<T: ZeroInit> SharedSlots<T> {
    /// Maps `count` zeroed slots shared with future child processes.
    ///
    /// # Errors
    /// Returns `MemoryError::SharedMapFailed` when the kernel refuses the
    /// mapping (typically `ENOMEM` under pressure).
    pub fn new(count: usize) -> Result<Self, MemoryError> {
        let slot = mem::size_of::<T>();
        let size = count
            .max(1)
            .checked_mul(slot)
            .ok_or(MemoryError::SizeOverflow(count, slot))?;

        // SAFETY: Anonymous mapping, no fd involved. The kernel zero-fills the
        // pages, which is a valid `T` per the `ZeroInit` contract.
        let raw = unsafe {
            libc::mmap(
                std::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED | libc::MAP_ANONYMOUS,
                -1,
                0,
            )
        };
        if raw == libc::MAP_FAILED {
            return Err(MemoryError::SharedMapFailed(size, nix::errno::Errno::last()));
        }
        let ptr = NonNull::new(raw as *mut T).ok_or(MemoryError::AllocationFailed(size))?;

        debug!("Shared region mapped: {} slots of {} bytes at {:p}", count, slot, raw);
        Ok(Self { ptr, count, _marker: PhantomData })
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            return None;
        }
        // SAFETY: In bounds, the region lives as long as `self`.
        Some(unsafe { &*self.ptr.as_ptr().add(index) })
    }

    pub fn get_mut(&mut self, index: usize) -> Option<&mut T> {
        if index >= self.count {
            return None;
        }
        // SAFETY: In bounds, uniquely borrowed through `&mut self`.
        Some(unsafe { &mut *self.ptr.as_ptr().add(index) })
    }

    fn byte_len(&self) -> usize {
        self.count.max(1) * mem::size_of::<T>()
    }
}

impl<T: ZeroInit> Drop for SharedSlots<T> {
    fn drop(&mut self) {
        // SAFETY: ptr and size are exactly what mmap returned in new().
        unsafe {
            libc::munmap(self.ptr.as_ptr() as *mut c_void, self.byte_len());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[repr(C)]
    struct Counter {
        hits: AtomicU64,
        total: f64,
    }

    unsafe impl ZeroInit for Counter {}

    #[test]
    fn test_slots_start_zeroed() {
        let slots = SharedSlots::<Counter>::new(4).expect("shared map");
        assert_eq!(slots.len(), 4);
        for i in 0..4 {
            let c = slots.get(i).unwrap();
            assert_eq!(c.hits.load(Ordering::Relaxed), 0);
            assert_eq!(c.total, 0.0);
        }
        assert!(slots.get(4).is_none());
    }

    #[test]
    fn test_slot_writes_survive_fork() {
        let mut slots = SharedSlots::<Counter>::new(1).expect("shared map");
        // SAFETY: child only touches the shared slot and exits.
        match unsafe { libc::fork() } {
            0 => {
                let c = slots.get_mut(0).unwrap();
                c.hits.fetch_add(7, Ordering::Relaxed);
                c.total += 1.5;
                unsafe { libc::_exit(0) };
            }
            pid if pid > 0 => {
                let mut status = 0;
                unsafe { libc::waitpid(pid, &mut status, 0) };
                let c = slots.get(0).unwrap();
                assert_eq!(c.hits.load(Ordering::Relaxed), 7);
                assert_eq!(c.total, 1.5);
            }
            _ => panic!("fork failed"),
        }
    }
}
