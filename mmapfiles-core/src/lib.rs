//! mmapfiles core: the file-backed mapping stress engine.
//!
//! One worker repeatedly walks a rotation of directory roots, maps every
//! regular file it finds read-only into a fixed-capacity table, then unmaps
//! the whole table, timing each `mmap` and `munmap` call. Everything runs on
//! a single thread; parallelism comes from running several worker processes.

pub mod context;
pub mod settings;
pub mod table;
pub mod metrics;
pub mod vm;
pub mod traversal;
pub mod driver;

pub use context::{Clock, MemoryPressure, MonotonicClock, SystemPressure, WorkerContext, WorkerEnv};
pub use driver::{run_worker, CycleDriver, CycleStats, RootRotation, WorkerConfig, WorkerExit, DEFAULT_ROOTS};
pub use metrics::{MetricsReport, MmapMetrics};
pub use settings::{MapOptions, Settings, SETTING_POPULATE, SETTING_SHARED};
pub use table::{Mapping, MappingTable, MAX_MAPPINGS};
pub use traversal::Traversal;
pub use vm::{MapError, SystemVm, VirtualMemory};
