use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use anyhow::{Context, Result};
use log::{error, info, warn};
use nix::errno::Errno;
use nix::sys::signal::{kill, SigmaskHow, Signal};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult, Pid};
use mmapfiles_core::WorkerExit;
use mmapfiles_io::memory::MemoryError;
use mmapfiles_io::SharedSlots;

use crate::config::RunPlan;
use crate::worker::{self, InstanceSlot};

/// Exit code of a worker that could not even find its slot.
const EXIT_FAILURE: i32 = 1;

/// How an instance ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InstanceStatus {
    Success,
    NoResource,
    Failed(String),
}

#[derive(Debug, Clone)]
pub struct InstanceOutcome {
    pub instance: usize,
    pub status: InstanceStatus,
    pub restarts: u32,
}

/// What the supervisor does with a reaped child.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reaped {
    Finished(InstanceStatus),
    Restart,
}

/// Classifies a terminal wait status.
///
/// # Logic
/// A `SIGKILL` is almost always the OOM killer choosing the worker that
/// volunteered for it; such a worker is restarted as long as the run is still
/// live. Every other signal is a genuine failure.
pub fn classify(status: &WaitStatus, may_restart: bool) -> Option<Reaped> {
    match *status {
        WaitStatus::Exited(_, code) => Some(Reaped::Finished(match WorkerExit::from_code(code) {
            Some(WorkerExit::Success) => InstanceStatus::Success,
            Some(WorkerExit::NoResource) => InstanceStatus::NoResource,
            None => InstanceStatus::Failed(format!("exited with status {}", code)),
        })),
        WaitStatus::Signaled(_, Signal::SIGKILL, _) if may_restart => Some(Reaped::Restart),
        WaitStatus::Signaled(_, signal, _) => {
            Some(Reaped::Finished(InstanceStatus::Failed(format!("terminated by {}", signal))))
        }
        _ => None,
    }
}

/// Cloneable handle used from the Ctrl-C handler.
#[derive(Clone)]
pub struct StopHandle {
    stopping: Arc<AtomicBool>,
    children: Arc<Mutex<HashMap<Pid, usize>>>,
}

impl StopHandle {
    /// Stops restarts and asks every live worker to wind down.
    pub fn request_stop(&self) {
        if self.stopping.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("Stop requested, signalling workers...");
        let children = self.children.lock().unwrap_or_else(|e| e.into_inner());
        for pid in children.keys() {
            let _ = kill(*pid, Signal::SIGTERM);
        }
    }
}

/// Forks and babysits the worker processes.
pub struct Supervisor {
    plan: RunPlan,
    slots: SharedSlots<InstanceSlot>,
    stop: StopHandle,
    restarts: Vec<u32>,
}

impl Supervisor {
    /// Maps the shared instance slots.
    ///
    /// # Errors
    /// Fails when the shared region cannot be mapped; the caller reports the
    /// run as out of resources.
    pub fn new(plan: RunPlan) -> Result<Self, MemoryError> {
        let slots = SharedSlots::new(plan.instances)?;
        let restarts = vec![0; plan.instances];
        let stop = StopHandle {
            stopping: Arc::new(AtomicBool::new(false)),
            children: Arc::new(Mutex::new(HashMap::new())),
        };
        Ok(Self { plan, slots, stop, restarts })
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn slot(&self, instance: usize) -> Option<&InstanceSlot> {
        self.slots.get(instance)
    }

    fn may_restart(&self) -> bool {
        !self.stopping() && !self.plan.past_deadline()
    }

    fn stopping(&self) -> bool {
        self.stop.stopping.load(Ordering::SeqCst)
    }

    fn spawn(&mut self, instance: usize) -> Result<Pid> {
        // The child keeps SIGINT/SIGTERM blocked until its own handlers are in.
        let previous = worker::stop_signals()
            .thread_swap_mask(SigmaskHow::SIG_BLOCK)
            .context("Failed to block stop signals")?;
        // SAFETY: the child only runs the single-threaded worker body and
        // leaves through process::exit without returning here.
        let forked = unsafe { fork() };
        if !matches!(forked, Ok(ForkResult::Child)) {
            if let Err(e) = previous.thread_set_mask() {
                warn!("Failed to restore signal mask: {}", e);
            }
        }
        match forked.context("Failed to fork worker")? {
            ForkResult::Child => {
                let code = match self.slots.get_mut(instance) {
                    Some(slot) => worker::run_instance(instance, slot, &self.plan).code(),
                    None => EXIT_FAILURE,
                };
                std::process::exit(code);
            }
            ForkResult::Parent { child } => {
                self.stop
                    .children
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .insert(child, instance);
                // request_stop sets the flag before it walks the children, so
                // a child it missed is signalled here.
                if self.stopping() {
                    let _ = kill(child, Signal::SIGTERM);
                }
                Ok(child)
            }
        }
    }

    /// Starts every instance and waits until all of them are done.
    pub fn run(&mut self) -> Result<Vec<InstanceOutcome>> {
        let mut statuses: Vec<Option<InstanceStatus>> = vec![None; self.plan.instances];

        for instance in 0..self.plan.instances {
            if let Err(e) = self.spawn(instance) {
                error!("mmapfiles.{}: {:#}", instance, e);
                statuses[instance] = Some(InstanceStatus::Failed(e.to_string()));
            }
        }

        loop {
            if self.stop.children.lock().unwrap_or_else(|e| e.into_inner()).is_empty() {
                break;
            }
            let status = match waitpid(None, None) {
                Ok(status) => status,
                Err(Errno::EINTR) => continue,
                Err(Errno::ECHILD) => break,
                Err(e) => return Err(e).context("waitpid failed"),
            };
            let Some(pid) = status.pid() else { continue };
            let Some(reaped) = classify(&status, self.may_restart()) else { continue };

            let instance = {
                let mut children = self.stop.children.lock().unwrap_or_else(|e| e.into_inner());
                match children.remove(&pid) {
                    Some(instance) => instance,
                    None => continue,
                }
            };

            match reaped {
                Reaped::Restart if !self.may_restart() => {
                    // A stop arrived after the status was classified.
                    statuses[instance] =
                        Some(InstanceStatus::Failed("terminated by SIGKILL".into()));
                }
                Reaped::Restart => {
                    self.restarts[instance] += 1;
                    warn!("mmapfiles.{}: killed by the OOM killer, restarting", instance);
                    if let Err(e) = self.spawn(instance) {
                        error!("mmapfiles.{}: {:#}", instance, e);
                        statuses[instance] = Some(InstanceStatus::Failed(e.to_string()));
                    }
                }
                Reaped::Finished(status) => {
                    match &status {
                        InstanceStatus::Failed(why) => error!("mmapfiles.{}: {}", instance, why),
                        InstanceStatus::NoResource => {
                            warn!("mmapfiles.{}: out of resources, skipped", instance)
                        }
                        InstanceStatus::Success => {}
                    }
                    statuses[instance] = Some(status);
                }
            }
        }

        Ok(statuses
            .into_iter()
            .enumerate()
            .map(|(instance, status)| InstanceOutcome {
                instance,
                status: status.unwrap_or_else(|| InstanceStatus::Failed("lost track of worker".into())),
                restarts: self.restarts[instance],
            })
            .collect())
    }
}
