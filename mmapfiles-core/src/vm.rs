//! Virtual-memory operations and the timing wrapper around them.

use std::fs::File;
use std::ptr::NonNull;
use nix::errno::Errno;
use thiserror::Error;
use mmapfiles_io::MapRequest;

use crate::context::Clock;

/// Why a file mapping failed, reduced to what the engine acts on.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum MapError {
    #[error("out of memory")]
    OutOfMemory,
    #[error("mmap failed: {0}")]
    Other(Errno),
}

impl From<Errno> for MapError {
    fn from(errno: Errno) -> Self {
        match errno {
            Errno::ENOMEM => MapError::OutOfMemory,
            e => MapError::Other(e),
        }
    }
}

/// Map/unmap primitives used by the engine.
///
/// Implementations own the validity of the addresses they return until the
/// matching unmap. The engine never dereferences past `len`.
pub trait VirtualMemory {
    /// Maps `req.len` bytes of `file` read-only.
    fn map_file(&mut self, file: &File, req: MapRequest) -> Result<NonNull<u8>, MapError>;

    /// Removes a mapping. A non-zero return from `munmap` is an `Err`.
    fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), Errno>;

    /// Best-effort fallback after a failed [`VirtualMemory::unmap`].
    fn unmap_retry(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), Errno>;
}

/// The host kernel.
#[derive(Debug, Default)]
pub struct SystemVm;

impl VirtualMemory for SystemVm {
    fn map_file(&mut self, file: &File, req: MapRequest) -> Result<NonNull<u8>, MapError> {
        mmapfiles_io::map_file_readonly(file, req).map_err(MapError::from)
    }

    fn unmap(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        // SAFETY: addresses only come from map_file and are unmapped once,
        // by the table drain that clears their slot.
        unsafe { mmapfiles_io::unmap(addr, len) }
    }

    fn unmap_retry(&mut self, addr: NonNull<u8>, len: usize) -> Result<(), Errno> {
        // SAFETY: as above; called only after the direct unmap failed.
        unsafe { mmapfiles_io::unmap_retry_enomem(addr, len) }
    }
}

/// Runs `op` between two clock samples and returns its result with the
/// elapsed seconds.
#[inline]
pub fn timed<T>(clock: &dyn Clock, op: impl FnOnce() -> T) -> (T, f64) {
    let start = clock.now();
    let out = op();
    let delta = clock.now() - start;
    (out, delta)
}

/// Reads one byte per page of `[ptr, ptr + len)` to fault the pages in.
///
/// # Safety
/// `ptr` must point to a readable mapping of at least `len` bytes.
pub unsafe fn touch_pages(ptr: NonNull<u8>, len: usize, page_size: usize) -> u8 {
    let mut acc = 0u8;
    let mut offset = 0;
    while offset < len {
        acc ^= std::ptr::read_volatile(ptr.as_ptr().add(offset));
        offset += page_size;
    }
    std::hint::black_box(acc)
}
