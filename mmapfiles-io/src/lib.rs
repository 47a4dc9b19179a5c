//! mmapfiles I/O: the OS layer.
//!
//! Thin, explicit wrappers over the virtual-memory and process primitives the
//! mapping stressor needs. Nothing in here keeps policy; the core decides what
//! to do with every outcome.

pub mod platform;
pub mod memory;
pub mod storage;

// Re-exports for easier access by mmapfiles-core
pub use memory::{SharedSlots, ZeroInit};
pub use storage::{map_file_readonly, unmap, unmap_retry_enomem, MapRequest};
pub use platform::{page_size, monotonic_now};
pub use platform::affinity;
