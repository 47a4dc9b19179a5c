//! Cycle Driver: fill the table from a rotating set of roots, then unmap
//! everything, until the worker is told to stop.

use std::path::{Path, PathBuf};
use log::{error, info};

use crate::context::WorkerEnv;
use crate::metrics::MmapMetrics;
use crate::settings::{MapOptions, Settings};
use crate::table::{MappingTable, MAX_MAPPINGS};
use crate::traversal::{Traversal, MAX_DEPTH};
use crate::vm::{timed, VirtualMemory};

/// Roots visited in rotation when none are configured.
pub const DEFAULT_ROOTS: [&str; 11] = [
    "/lib", "/lib32", "/lib64", "/boot", "/bin", "/etc", "/sbin", "/usr", "/var", "/sys", "/proc",
];

/// Exit status of one worker invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerExit {
    Success,
    /// The table or the shared metrics block could not be allocated.
    NoResource,
}

impl WorkerExit {
    pub const NO_RESOURCE_CODE: i32 = 3;

    pub fn code(self) -> i32 {
        match self {
            WorkerExit::Success => 0,
            WorkerExit::NoResource => Self::NO_RESOURCE_CODE,
        }
    }

    pub fn from_code(code: i32) -> Option<Self> {
        match code {
            0 => Some(WorkerExit::Success),
            Self::NO_RESOURCE_CODE => Some(WorkerExit::NoResource),
            _ => None,
        }
    }
}

/// Fixed list of roots with a cursor that survives across cycles.
#[derive(Debug, Clone)]
pub struct RootRotation {
    roots: Vec<PathBuf>,
    cursor: usize,
}

impl RootRotation {
    /// An empty list falls back to [`DEFAULT_ROOTS`].
    pub fn new(roots: Vec<PathBuf>) -> Self {
        if roots.is_empty() {
            return Self::default();
        }
        Self { roots, cursor: 0 }
    }

    pub fn len(&self) -> usize {
        self.roots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn current(&self) -> &Path {
        &self.roots[self.cursor]
    }

    pub fn advance(&mut self) {
        self.cursor += 1;
        if self.cursor >= self.roots.len() {
            self.cursor = 0;
        }
    }
}

impl Default for RootRotation {
    fn default() -> Self {
        Self { roots: DEFAULT_ROOTS.iter().map(PathBuf::from).collect(), cursor: 0 }
    }
}

/// What one cycle did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct CycleStats {
    pub roots_visited: usize,
    pub mapped: usize,
    pub unmapped: usize,
    pub unmap_failures: usize,
    pub enomem: bool,
}

pub struct CycleDriver<'a> {
    env: WorkerEnv<'a>,
    vm: &'a mut dyn VirtualMemory,
    options: MapOptions,
    rotation: RootRotation,
    table: MappingTable,
    max_depth: usize,
}

impl<'a> CycleDriver<'a> {
    pub fn new(
        env: WorkerEnv<'a>,
        vm: &'a mut dyn VirtualMemory,
        options: MapOptions,
        rotation: RootRotation,
        table: MappingTable,
    ) -> Self {
        Self { env, vm, options, rotation, table, max_depth: MAX_DEPTH }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    pub fn rotation(&self) -> &RootRotation {
        &self.rotation
    }

    pub fn table(&self) -> &MappingTable {
        &self.table
    }

    /// Visits each root once, starting at the cursor, until the rotation is
    /// done, the table is full, or a root ran out of memory.
    ///
    /// The cursor moves past every root that was visited, so an early stop
    /// makes the next pass resume mid-rotation.
    pub fn traverse_pass(&mut self, metrics: &mut MmapMetrics, stats: &mut CycleStats) {
        for _ in 0..self.rotation.len() {
            if self.table.is_full() || !self.env.ctx.keep_running() {
                break;
            }
            let root = self.rotation.current().to_path_buf();
            let mut enomem = false;

            Traversal::new(self.env, &mut *self.vm, &mut *metrics, self.options)
                .with_max_depth(self.max_depth)
                .walk(&root, &mut self.table, &mut enomem);

            self.rotation.advance();
            stats.roots_visited += 1;
            if enomem {
                stats.enomem = true;
                break;
            }
        }
        stats.mapped = self.table.len();
    }

    /// Unmaps every live entry in table order and clears its slot.
    ///
    /// # Logic
    /// A successful `munmap` is timed and counted. A failed one is handed to
    /// the retry helper, whose outcome never reaches the metrics. The slot is
    /// cleared either way.
    pub fn unmap_pass(&mut self, metrics: &mut MmapMetrics, stats: &mut CycleStats) {
        let clock = self.env.clock;
        let page_size = self.env.page_size;
        let vm = &mut *self.vm;

        self.table.drain_with(|addr, len| {
            let (result, delta) = timed(clock, || vm.unmap(addr, len));
            match result {
                Ok(()) => {
                    metrics.record_unmap(len, delta, page_size);
                    stats.unmapped += 1;
                }
                Err(_) => {
                    let _ = vm.unmap_retry(addr, len);
                    stats.unmap_failures += 1;
                }
            }
        });
    }

    pub fn run_cycle(&mut self, metrics: &mut MmapMetrics) -> CycleStats {
        let mut stats = CycleStats::default();
        self.traverse_pass(metrics, &mut stats);
        self.unmap_pass(metrics, &mut stats);
        stats
    }

    /// Runs cycles until the context says stop. Every cycle ends with its
    /// unmap pass, so nothing is left mapped when this returns.
    pub fn run(&mut self, metrics: &mut MmapMetrics) -> u64 {
        let mut cycles = 0;
        loop {
            self.run_cycle(metrics);
            cycles += 1;
            if !self.env.ctx.keep_running() {
                break;
            }
        }
        cycles
    }
}

/// Static shape of a worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    pub roots: Vec<PathBuf>,
    pub max_mappings: usize,
    pub max_depth: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self { roots: Vec::new(), max_mappings: MAX_MAPPINGS, max_depth: MAX_DEPTH }
    }
}

/// The worker body: allocate the table, read the settings, cycle until told
/// to stop.
pub fn run_worker(
    env: WorkerEnv<'_>,
    vm: &mut dyn VirtualMemory,
    settings: &Settings,
    config: &WorkerConfig,
    metrics: &mut MmapMetrics,
) -> WorkerExit {
    let name = env.ctx.name();
    let options = MapOptions::from_settings(settings);

    let table = match MappingTable::with_capacity(config.max_mappings) {
        Ok(table) => table,
        Err(e) => {
            error!("{}: {}, out of memory", name, e);
            return WorkerExit::NoResource;
        }
    };

    let rotation = RootRotation::new(config.roots.clone());
    info!(
        "{}: run (populate={}, shared={}, {} roots, {} slots)",
        name,
        options.populate,
        options.shared,
        rotation.len(),
        table.capacity()
    );

    let mut driver = CycleDriver::new(env, vm, options, rotation, table)
        .with_max_depth(config.max_depth);
    let cycles = driver.run(metrics);

    info!("{}: deinit after {} cycles", name, cycles);
    WorkerExit::Success
}
