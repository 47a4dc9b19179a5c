//! Child-process side of an instance.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Instant;
use log::{debug, warn};
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use mmapfiles_core::{
    run_worker, MmapMetrics, MonotonicClock, SystemPressure, SystemVm, WorkerContext, WorkerEnv,
    WorkerExit,
};
use mmapfiles_io::{affinity, ZeroInit};

use crate::config::RunPlan;

/// Value written to `/proc/self/oom_score_adj`: first in line for the OOM killer.
const OOM_SCORE_ADJ: &str = "1000";

/// Per-instance block in the supervisor's shared region.
#[repr(C)]
pub struct InstanceSlot {
    pub metrics: MmapMetrics,
    pub bogo_ops: AtomicU64,
}

// SAFETY: repr(C) of f64s and an AtomicU64; zero is a valid value for each.
unsafe impl ZeroInit for InstanceSlot {}

static STOP: AtomicBool = AtomicBool::new(false);

extern "C" fn handle_stop(_signal: libc::c_int) {
    STOP.store(true, Ordering::Relaxed);
}

/// Signals that ask a worker to wind down.
pub fn stop_signals() -> SigSet {
    let mut set = SigSet::empty();
    set.add(Signal::SIGINT);
    set.add(Signal::SIGTERM);
    set
}

/// Routes SIGINT and SIGTERM to the cooperative stop flag.
fn install_stop_handlers() -> nix::Result<()> {
    let action = SigAction::new(SigHandler::Handler(handle_stop), SaFlags::empty(), SigSet::empty());
    // SAFETY: the handler only stores to an atomic, which is async-signal-safe.
    unsafe {
        sigaction(Signal::SIGINT, &action)?;
        sigaction(Signal::SIGTERM, &action)?;
    }
    Ok(())
}

/// Volunteers this process to the OOM killer so the rest of the host survives.
fn set_oom_adjustment() {
    if let Err(e) = std::fs::write("/proc/self/oom_score_adj", OOM_SCORE_ADJ) {
        debug!("Could not adjust oom_score_adj: {}", e);
    }
}

/// Run context of one worker process.
pub struct ChildContext<'a> {
    name: String,
    ops: &'a AtomicU64,
    max_ops: Option<u64>,
    deadline: Option<Instant>,
    stop: &'a AtomicBool,
}

impl<'a> ChildContext<'a> {
    pub fn new(
        name: String,
        ops: &'a AtomicU64,
        max_ops: Option<u64>,
        deadline: Option<Instant>,
        stop: &'a AtomicBool,
    ) -> Self {
        Self { name, ops, max_ops, deadline, stop }
    }
}

impl WorkerContext for ChildContext<'_> {
    fn keep_running(&self) -> bool {
        if self.stop.load(Ordering::Relaxed) {
            return false;
        }
        if self.deadline.is_some_and(|d| Instant::now() >= d) {
            return false;
        }
        self.max_ops.map_or(true, |max| self.ops.load(Ordering::Relaxed) < max)
    }

    fn bump_ops(&self) {
        self.ops.fetch_add(1, Ordering::Relaxed);
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Body of a forked instance. Never returns to the supervisor's code path;
/// the caller turns the result into the process exit code.
pub fn run_instance(instance: usize, slot: &mut InstanceSlot, plan: &RunPlan) -> WorkerExit {
    if let Err(e) = install_stop_handlers() {
        warn!("mmapfiles.{}: cannot install stop handlers: {}", instance, e);
    }
    // Forked with the stop signals blocked; a pending one lands here.
    if let Err(e) = stop_signals().thread_unblock() {
        warn!("mmapfiles.{}: cannot unblock stop signals: {}", instance, e);
    }
    set_oom_adjustment();
    if let Some(core) = plan.pin_core(instance) {
        affinity::pin_to_core(core);
    }

    let InstanceSlot { metrics, bogo_ops } = slot;
    let ctx = ChildContext::new(
        format!("mmapfiles.{}", instance),
        bogo_ops,
        plan.ops_for(instance),
        plan.deadline,
        &STOP,
    );
    let clock = MonotonicClock;
    let pressure = SystemPressure::new(plan.oom_avoid);
    let env = WorkerEnv::new(&ctx, &clock, &pressure);
    let mut vm = SystemVm;

    run_worker(env, &mut vm, &plan.settings, &plan.worker, metrics)
}
