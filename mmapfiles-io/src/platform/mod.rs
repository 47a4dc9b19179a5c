pub mod affinity;
pub mod topology;

use std::sync::OnceLock;
use std::time::Instant;

/// Fallback used when `sysconf` cannot report the page size.
const DEFAULT_PAGE_SIZE: usize = 4096;

/// Returns the system page size in bytes.
pub fn page_size() -> usize {
    // SAFETY: sysconf has no memory-safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if size <= 0 { DEFAULT_PAGE_SIZE } else { size as usize }
}

/// Seconds elapsed on a monotonic clock since the first call in this process.
///
/// Only differences between two readings are meaningful.
pub fn monotonic_now() -> f64 {
    static ANCHOR: OnceLock<Instant> = OnceLock::new();
    ANCHOR.get_or_init(Instant::now).elapsed().as_secs_f64()
}

/// Returns `(available, total)` physical memory in bytes.
pub fn memory_snapshot() -> (u64, u64) {
    // SAFETY: sysconf has no memory-safety preconditions.
    let (page, total, avail) = unsafe {
        (
            libc::sysconf(libc::_SC_PAGESIZE),
            libc::sysconf(libc::_SC_PHYS_PAGES),
            libc::sysconf(libc::_SC_AVPHYS_PAGES),
        )
    };
    let page = page.max(0) as u64;
    (avail.max(0) as u64 * page, total.max(0) as u64 * page)
}

/// Low-memory heuristic for a pending allocation of `requested` bytes.
///
/// # Logic
/// Memory is "low" when granting the request would leave less than 2.5% of
/// physical RAM available. A probe that reports no RAM at all is treated as
/// unknown and never blocks.
pub fn is_low_memory(requested: usize) -> bool {
    let (available, total) = memory_snapshot();
    low_memory_threshold(available, total, requested as u64)
}

fn low_memory_threshold(available: u64, total: u64, requested: u64) -> bool {
    if total == 0 {
        return false;
    }
    let reserve = total / 40;
    available < requested.saturating_add(reserve)
}
