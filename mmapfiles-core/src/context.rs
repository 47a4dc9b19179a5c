//! Collaborators the worker body talks to.
//!
//! The engine never reaches for process state, wall clocks or memory probes
//! directly; it goes through these seams so the supervisor decides the policy
//! and tests can script every answer.

/// The per-worker run context handed in by the supervisor.
pub trait WorkerContext {
    /// Cooperative stop signal. Polled before every directory entry and
    /// after every cycle; `false` makes all loops unwind without error.
    fn keep_running(&self) -> bool;

    /// Counts one completed bogo operation (one successful file mapping).
    fn bump_ops(&self);

    /// Name used in log lines.
    fn name(&self) -> &str {
        "mmapfiles"
    }
}

/// Monotonic time source in seconds. Only used for measurements.
pub trait Clock {
    fn now(&self) -> f64;
}

impl<F: Fn() -> f64> Clock for F {
    fn now(&self) -> f64 {
        self()
    }
}

/// Low-memory predicate consulted before each mapping of `requested` bytes.
pub trait MemoryPressure {
    fn is_low(&self, requested: usize) -> bool;
}

impl<F: Fn(usize) -> bool> MemoryPressure for F {
    fn is_low(&self, requested: usize) -> bool {
        self(requested)
    }
}

/// Process-wide monotonic clock.
#[derive(Clone, Copy, Debug, Default)]
pub struct MonotonicClock;

impl Clock for MonotonicClock {
    fn now(&self) -> f64 {
        mmapfiles_io::monotonic_now()
    }
}

/// Low-memory heuristic backed by the host's physical memory counters.
///
/// Disabled instances never report pressure, so mappings are attempted
/// until the kernel itself answers ENOMEM.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPressure {
    enabled: bool,
}

impl SystemPressure {
    pub fn new(enabled: bool) -> Self {
        Self { enabled }
    }
}

impl MemoryPressure for SystemPressure {
    fn is_low(&self, requested: usize) -> bool {
        self.enabled && mmapfiles_io::platform::is_low_memory(requested)
    }
}

/// Bundle of read-only collaborators shared by the traversal and the driver.
#[derive(Clone, Copy)]
pub struct WorkerEnv<'a> {
    pub ctx: &'a dyn WorkerContext,
    pub clock: &'a dyn Clock,
    pub pressure: &'a dyn MemoryPressure,
    pub page_size: usize,
}

impl<'a> WorkerEnv<'a> {
    pub fn new(
        ctx: &'a dyn WorkerContext,
        clock: &'a dyn Clock,
        pressure: &'a dyn MemoryPressure,
    ) -> Self {
        Self { ctx, clock, pressure, page_size: mmapfiles_io::page_size() }
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use std::cell::Cell;

    /// Context that stops after a fixed number of `keep_running` polls.
    pub struct CountingContext {
        pub polls: Cell<u64>,
        pub ops: Cell<u64>,
        pub budget: Option<u64>,
    }

    impl CountingContext {
        pub fn unbounded() -> Self {
            Self { polls: Cell::new(0), ops: Cell::new(0), budget: None }
        }

        pub fn with_budget(polls: u64) -> Self {
            Self { polls: Cell::new(0), ops: Cell::new(0), budget: Some(polls) }
        }
    }

    impl WorkerContext for CountingContext {
        fn keep_running(&self) -> bool {
            let n = self.polls.get() + 1;
            self.polls.set(n);
            self.budget.map_or(true, |b| n <= b)
        }

        fn bump_ops(&self) {
            self.ops.set(self.ops.get() + 1);
        }
    }

    /// Clock that advances by a fixed step on every reading.
    pub struct StepClock {
        t: Cell<f64>,
        step: f64,
    }

    impl StepClock {
        pub fn new(step: f64) -> Self {
            Self { t: Cell::new(0.0), step }
        }
    }

    impl Clock for StepClock {
        fn now(&self) -> f64 {
            let t = self.t.get() + self.step;
            self.t.set(t);
            t
        }
    }

    pub fn never_low(_: usize) -> bool {
        false
    }
}
