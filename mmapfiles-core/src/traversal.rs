//! Recursive Traversal Engine.
//!
//! Walks a directory tree depth-first and maps every regular file it can
//! open, until the table is full, the worker is told to stop, or the kernel
//! runs out of memory for new mappings.

use std::ffi::OsStr;
use std::fs::{self, File};
use std::path::Path;
use log::debug;
use mmapfiles_io::MapRequest;

use crate::context::WorkerEnv;
use crate::metrics::MmapMetrics;
use crate::settings::MapOptions;
use crate::table::MappingTable;
use crate::vm::{timed, touch_pages, MapError, VirtualMemory};

/// Directory levels below a root that are still descended into.
pub const MAX_DEPTH: usize = 64;

/// Outcome of one regular-file entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FileStep {
    Next,
    /// Abandon the rest of the current directory listing.
    StopDirectory,
    OutOfMemory,
}

pub fn is_dot_filename(name: &OsStr) -> bool {
    name == "." || name == ".."
}

pub struct Traversal<'a> {
    env: WorkerEnv<'a>,
    vm: &'a mut dyn VirtualMemory,
    metrics: &'a mut MmapMetrics,
    options: MapOptions,
    max_depth: usize,
    skipped_dirs: u64,
}

impl<'a> Traversal<'a> {
    pub fn new(
        env: WorkerEnv<'a>,
        vm: &'a mut dyn VirtualMemory,
        metrics: &'a mut MmapMetrics,
        options: MapOptions,
    ) -> Self {
        Self { env, vm, metrics, options, max_depth: MAX_DEPTH, skipped_dirs: 0 }
    }

    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// Maps every reachable regular file under `path` into `table`.
    ///
    /// # Logic
    /// Sets `*enomem` the moment a mapping fails with ENOMEM; every frame of
    /// the recursion sees the flag and stops. Returns the table's populated
    /// count afterwards. Nothing here is fatal: unreadable directories and
    /// files are skipped silently.
    pub fn walk(&mut self, path: &Path, table: &mut MappingTable, enomem: &mut bool) -> usize {
        self.skipped_dirs = 0;
        self.walk_dir(path, table, enomem, 0);
        if self.skipped_dirs > 0 {
            debug!(
                "{}: {} unreadable directories skipped under {}",
                self.env.ctx.name(),
                self.skipped_dirs,
                path.display()
            );
        }
        table.len()
    }

    fn walk_dir(&mut self, path: &Path, table: &mut MappingTable, enomem: &mut bool, depth: usize) {
        if depth > self.max_depth {
            return;
        }
        let mut dir = match fs::read_dir(path) {
            Ok(dir) => dir,
            Err(_) => {
                self.skipped_dirs += 1;
                return;
            }
        };

        while !*enomem {
            let Some(entry) = dir.next() else { break };
            if table.is_full() || !self.env.ctx.keep_running() {
                break;
            }
            let Ok(entry) = entry else { continue };
            if is_dot_filename(&entry.file_name()) {
                continue;
            }
            // d_type based: symlinks are neither followed nor mapped.
            let Ok(file_type) = entry.file_type() else { continue };

            if file_type.is_dir() {
                self.walk_dir(&entry.path(), table, enomem, depth + 1);
            } else if file_type.is_file() {
                match self.map_file(&entry.path(), table) {
                    FileStep::Next => {}
                    FileStep::StopDirectory => break,
                    FileStep::OutOfMemory => {
                        *enomem = true;
                        break;
                    }
                }
            }
        }
    }

    fn map_file(&mut self, path: &Path, table: &mut MappingTable) -> FileStep {
        let Ok(file) = File::open(path) else { return FileStep::Next };
        let len = match file.metadata().map(|m| usize::try_from(m.len())) {
            Ok(Ok(len)) => len,
            _ => return FileStep::Next,
        };
        if table.is_full() || self.env.pressure.is_low(len) {
            return FileStep::StopDirectory;
        }

        let req = MapRequest { len, shared: self.options.shared, populate: self.options.populate };
        let vm = &mut *self.vm;
        let (result, delta) = timed(self.env.clock, || vm.map_file(&file, req));

        // `file` is closed when it drops at the end of this function; the
        // mapping does not depend on the descriptor.
        match result {
            Ok(ptr) => {
                let page_size = self.env.page_size;
                if self.options.populate {
                    // SAFETY: `ptr` maps exactly `len` readable bytes.
                    unsafe { touch_pages(ptr, len, page_size) };
                }
                if let Err(e) = table.try_push(ptr, len) {
                    debug!("{}: {}, releasing {}", self.env.ctx.name(), e, path.display());
                    if let Err(errno) = self.vm.unmap(ptr, len) {
                        debug!("{}: munmap failed: {}", self.env.ctx.name(), errno);
                    }
                    return FileStep::StopDirectory;
                }
                self.metrics.record_map(len, delta, page_size);
                self.env.ctx.bump_ops();
                FileStep::Next
            }
            Err(MapError::OutOfMemory) => FileStep::OutOfMemory,
            Err(MapError::Other(_)) => FileStep::Next,
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::context::testing::{never_low, CountingContext, StepClock};
    use crate::vm::testing::FaultyVm;
    use crate::vm::SystemVm;
    use std::cell::Cell;
    use tempfile::TempDir;

    /// Builds a tree from `(relative path, size)` pairs.
    pub fn tree(files: &[(&str, usize)]) -> TempDir {
        let dir = tempfile::tempdir().unwrap();
        for (rel, size) in files {
            let path = dir.path().join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(&path, vec![0xa5u8; *size]).unwrap();
        }
        dir
    }

    pub fn release(table: &mut MappingTable, vm: &mut dyn VirtualMemory) {
        table.drain_with(|addr, len| vm.unmap(addr, len).expect("unmap"));
    }

    #[test]
    fn test_maps_every_regular_file() {
        let ps = mmapfiles_io::page_size();
        let root = tree(&[("a", 1), ("b", ps), ("sub/c", ps + 1), ("sub/deeper/d", 3 * ps)]);
        std::os::unix::fs::symlink(root.path().join("a"), root.path().join("link")).unwrap();

        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = SystemVm;
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(16).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 4);
        assert!(!enomem);
        assert_eq!(ctx.ops.get(), 4);
        assert_eq!(metrics.mmap_count, 4.0);
        assert_eq!(metrics.mmap_page_count, 1.0 + 1.0 + 2.0 + 3.0);
        assert!((metrics.mmap_duration - 0.004).abs() < 1e-9);
        let mut lens: Vec<usize> = table.live().iter().map(|m| m.len).collect();
        lens.sort();
        assert_eq!(lens, vec![1, ps, ps + 1, 3 * ps]);

        release(&mut table, &mut vm);
    }

    #[test]
    fn test_zero_length_files_fail_quietly() {
        let root = tree(&[("empty", 0), ("one", 1)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(4).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(vm.map_calls, 2);
        assert_eq!(n, 1);
        assert!(!enomem);
        assert_eq!(metrics.mmap_count, 1.0);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_enomem_on_first_map_stops_pass() {
        let root = tree(&[("a", 10), ("b", 10), ("sub/c", 10), ("sub/d", 10)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::enomem_at(1);
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 0);
        assert!(enomem);
        assert_eq!(vm.map_calls, 1);
        assert_eq!(metrics, MmapMetrics::default());
        assert_eq!(ctx.ops.get(), 0);
    }

    #[test]
    fn test_enomem_in_subdirectory_unwinds_parents() {
        // Every file lives two levels down, so the failure always happens
        // inside a nested frame.
        let root = tree(&[("x/y/a", 10), ("x/y/b", 10), ("x/z/c", 10), ("w/v/d", 10)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::enomem_at(2);
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert!(enomem);
        assert_eq!(vm.map_calls, 2);
        assert_eq!(n, 1);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_capacity_boundary_maps_exactly_one() {
        let root = tree(&[("a", 100), ("b", 100)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(1).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 1);
        assert!(table.is_full());
        assert!(!enomem);
        assert_eq!(vm.map_calls, 1);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_capacity_boundary_after_earlier_pass() {
        let first = tree(&[("a", 100), ("b", 100)]);
        let second = tree(&[("c", 100), ("d", 100)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(3).unwrap();
        let mut enomem = false;

        let mut walker = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default());
        assert_eq!(walker.walk(first.path(), &mut table, &mut enomem), 2);
        // One free slot left, two candidates.
        assert_eq!(walker.walk(second.path(), &mut table, &mut enomem), 3);
        assert!(!enomem);
        assert_eq!(metrics.mmap_count, 3.0);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_low_memory_stops_current_directory_only() {
        let root = tree(&[("low/big", 777), ("ok/a", 10), ("ok/b", 10)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let asked = Cell::new(0);
        let pressure = |len: usize| {
            asked.set(asked.get() + 1);
            len == 777
        };
        let env = WorkerEnv::new(&ctx, &clock, &pressure);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 2);
        assert!(!enomem);
        assert_eq!(asked.get(), 3);
        assert!(table.live().iter().all(|m| m.len == 10));
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_cancelled_worker_maps_nothing() {
        let root = tree(&[("a", 10), ("b", 10)]);
        let ctx = CountingContext::with_budget(0);
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 0);
        assert_eq!(vm.map_calls, 0);
    }

    #[test]
    fn test_missing_root_is_skipped() {
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .walk(Path::new("/nonexistent/mmapfiles/root"), &mut table, &mut enomem);

        assert_eq!(n, 0);
        assert!(!enomem);
    }

    #[test]
    fn test_depth_bound() {
        let root = tree(&[("top", 10), ("l1/mid", 10), ("l1/l2/l3/deep", 10)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;

        let n = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default())
            .with_max_depth(1)
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 2);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_populate_and_shared_mappings() {
        let ps = mmapfiles_io::page_size();
        let root = tree(&[("a", 5 * ps + 3), ("b", 1)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(8).unwrap();
        let mut enomem = false;
        let options = MapOptions { populate: true, shared: true };

        let n = Traversal::new(env, &mut vm, &mut metrics, options)
            .walk(root.path(), &mut table, &mut enomem);

        assert_eq!(n, 2);
        assert_eq!(metrics.mmap_page_count, 7.0);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_full_table_skips_the_mmap() {
        let root = tree(&[("a", 10), ("b", 10)]);
        let ctx = CountingContext::unbounded();
        let clock = StepClock::new(0.001);
        let env = WorkerEnv::new(&ctx, &clock, &never_low);
        let mut vm = FaultyVm::default();
        let mut metrics = MmapMetrics::default();
        let mut table = MappingTable::with_capacity(1).unwrap();
        let mut walker = Traversal::new(env, &mut vm, &mut metrics, MapOptions::default());

        assert_eq!(walker.map_file(&root.path().join("a"), &mut table), FileStep::Next);
        assert!(table.is_full());
        assert_eq!(walker.map_file(&root.path().join("b"), &mut table), FileStep::StopDirectory);
        drop(walker);

        assert_eq!(vm.map_calls, 1);
        assert_eq!(vm.live.len(), 1);
        assert_eq!(metrics.mmap_count, 1.0);
        release(&mut table, &mut vm);
    }

    #[test]
    fn test_dot_names() {
        assert!(is_dot_filename(OsStr::new(".")));
        assert!(is_dot_filename(OsStr::new("..")));
        assert!(!is_dot_filename(OsStr::new(".hidden")));
    }
}
