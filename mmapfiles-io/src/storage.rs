use std::fs::File;
use std::os::unix::io::AsRawFd;
use std::ptr::NonNull;
use std::thread;
use std::time::Duration;
use libc::c_void;
use nix::errno::Errno;
use nix::sys::mman::{MapFlags, ProtFlags};

/// Upper bound on `munmap` attempts while the kernel keeps answering ENOMEM.
const UNMAP_RETRIES: u32 = 128;

/// Parameters of a single read-only file mapping.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MapRequest {
    pub len: usize,
    /// `MAP_SHARED` instead of `MAP_PRIVATE`.
    pub shared: bool,
    /// Adds the `MAP_POPULATE` hint where the platform has it.
    pub populate: bool,
}

impl MapRequest {
    pub fn flags(&self) -> MapFlags {
        let mut flags = if self.shared { MapFlags::MAP_SHARED } else { MapFlags::MAP_PRIVATE };
        #[cfg(any(target_os = "linux", target_os = "android"))]
        if self.populate {
            flags |= MapFlags::MAP_POPULATE;
        }
        flags
    }
}

/// Maps `req.len` bytes of `file` read-only at offset 0.
///
/// # Logic
/// A direct `mmap(2)` call with no length adjustment: a zero-length request
/// is handed to the kernel as-is and fails with `EINVAL`. The mapping stays
/// valid after `file` is closed.
///
/// # Errors
/// Returns the raw `Errno` so callers can tell `ENOMEM` apart from the rest.
pub fn map_file_readonly(file: &File, req: MapRequest) -> Result<NonNull<u8>, Errno> {
    // SAFETY: The kernel chooses the address; fd is a valid open descriptor
    // borrowed for the duration of the call.
    let ptr = unsafe {
        libc::mmap(
            std::ptr::null_mut(),
            req.len,
            ProtFlags::PROT_READ.bits(),
            req.flags().bits(),
            file.as_raw_fd(),
            0,
        )
    };
    if ptr == libc::MAP_FAILED {
        return Err(Errno::last());
    }
    NonNull::new(ptr as *mut u8).ok_or(Errno::EFAULT)
}

/// Removes a mapping created by [`map_file_readonly`].
///
/// # Safety
/// `addr`/`len` must describe a live mapping that nothing references anymore.
pub unsafe fn unmap(addr: NonNull<u8>, len: usize) -> Result<(), Errno> {
    if libc::munmap(addr.as_ptr() as *mut c_void, len) == 0 {
        Ok(())
    } else {
        Err(Errno::last())
    }
}

/// Best-effort `munmap` that keeps retrying while the kernel reports ENOMEM.
///
/// # Logic
/// Splitting a VMA can need memory, so under pressure `munmap` may fail with
/// ENOMEM and succeed a moment later. Each retry backs off a little longer.
/// Any other error ends the attempt immediately.
///
/// # Safety
/// Same contract as [`unmap`].
pub unsafe fn unmap_retry_enomem(addr: NonNull<u8>, len: usize) -> Result<(), Errno> {
    let mut last = Errno::ENOMEM;
    for attempt in 1..=UNMAP_RETRIES {
        match unmap(addr, len) {
            Ok(()) => return Ok(()),
            Err(Errno::ENOMEM) => {
                last = Errno::ENOMEM;
                thread::sleep(Duration::from_micros(10 * u64::from(attempt)));
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
