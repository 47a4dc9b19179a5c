use std::mem;
use log::{debug, warn};

/// Pins the calling worker process to a single CPU core.
///
/// # Logic
/// Uses `libc::sched_setaffinity` with a one-bit mask. Pinning each worker
/// instance to its own core keeps the page-table and TLB traffic of one
/// instance from bouncing across CPUs.
///
/// # Errors
/// Logs a warning if pinning fails (e.g. core index out of the allowed set)
/// and returns `false`. It never aborts the worker; an unpinned worker still
/// produces valid measurements.
pub fn pin_to_core(core_id: usize) -> bool {
    // SAFETY: cpu_set_t is plain data; all-zero is the empty set.
    let mut cpu_set: libc::cpu_set_t = unsafe { mem::zeroed() };

    unsafe {
        libc::CPU_ZERO(&mut cpu_set);
        libc::CPU_SET(core_id, &mut cpu_set);
    }

    // SAFETY:
    // - pid 0 targets the calling thread, which is the whole worker process.
    // - `cpu_set` is stack-allocated and valid for the call.
    let ret = unsafe {
        libc::sched_setaffinity(0, mem::size_of::<libc::cpu_set_t>(), &cpu_set)
    };

    if ret != 0 {
        let err = std::io::Error::last_os_error();
        warn!("Failed to pin worker to core {}: {} (running floating)", core_id, err);
        return false;
    }

    debug!("Worker pinned to core {}", core_id);
    true
}
