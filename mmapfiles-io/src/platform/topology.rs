use log::{warn, info};

/// Host resources relevant to sizing a mapping stress run.
pub struct SystemTopology {
    online_cores: Vec<usize>,
    total_ram: u64,
    available_ram: u64,
    page_size: usize,
}

impl SystemTopology {
    /// Detects online cores and memory configuration.
    pub fn new() -> Self {
        // SAFETY: sysconf has no memory-safety preconditions.
        let count = unsafe { libc::sysconf(libc::_SC_NPROCESSORS_ONLN) };
        let (available_ram, total_ram) = super::memory_snapshot();
        let page_size = super::page_size();

        let num_cores = if count <= 0 {
            warn!("Failed to detect core count via libc. Fallback to 1.");
            1
        } else {
            count as usize
        };

        // Cores 0..N-1 are assumed online; sparse CPU sets only make pinning
        // fall back to floating, which pin_to_core tolerates.
        let online_cores: Vec<usize> = (0..num_cores).collect();

        Self { online_cores, total_ram, available_ram, page_size }
    }

    pub fn print_summary(&self) {
        info!(
            "Topology: {} cores, {:.2} GB RAM total ({:.2} GB available), {} byte pages.",
            self.online_cores.len(),
            self.total_ram as f64 / 1e9,
            self.available_ram as f64 / 1e9,
            self.page_size
        );
        if self.total_ram > 0 && self.available_ram < self.total_ram / 10 {
            warn!("Less than 10% of RAM available. Expect OOM kills and ENOMEM aborts.");
        }
    }

    pub fn online_cores(&self) -> &[usize] {
        &self.online_cores
    }

    /// Resolves a requested instance count; `0` means one per online core.
    pub fn instances_for(&self, requested: usize) -> usize {
        if requested == 0 { self.online_cores.len().max(1) } else { requested }
    }

    /// Core an instance should be pinned to, round-robin over online cores.
    pub fn core_for_instance(&self, instance: usize) -> usize {
        self.online_cores[instance % self.online_cores.len()]
    }
}

impl Default for SystemTopology {
    fn default() -> Self {
        Self::new()
    }
}
