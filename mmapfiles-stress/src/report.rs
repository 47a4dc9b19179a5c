use std::process::ExitCode;
use std::sync::atomic::Ordering;
use std::time::Duration;
use serde::Serialize;
use mmapfiles_core::{MetricsReport, MmapMetrics, WorkerExit};

use crate::lifecycle::{InstanceOutcome, InstanceStatus};
use crate::worker::InstanceSlot;

/// Exit code when at least one instance failed outright.
const EXIT_FAILED: u8 = 2;

#[derive(Debug, Clone, Serialize)]
pub struct InstanceReport {
    pub instance: usize,
    pub status: String,
    pub restarts: u32,
    pub bogo_ops: u64,
    pub metrics: MmapMetrics,
    pub rates: MetricsReport,
}

impl InstanceReport {
    pub fn new(outcome: &InstanceOutcome, slot: &InstanceSlot) -> Self {
        let status = match &outcome.status {
            InstanceStatus::Success => "passed".to_string(),
            InstanceStatus::NoResource => "skipped".to_string(),
            InstanceStatus::Failed(why) => format!("failed: {}", why),
        };
        Self {
            instance: outcome.instance,
            status,
            restarts: outcome.restarts,
            bogo_ops: slot.bogo_ops.load(Ordering::Relaxed),
            metrics: slot.metrics,
            rates: slot.metrics.report(),
        }
    }
}

/// End-of-run summary over every instance.
#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub stressor: &'static str,
    pub wall_clock_secs: f64,
    pub bogo_ops: u64,
    pub bogo_ops_per_sec: f64,
    pub combined: MetricsReport,
    pub instances: Vec<InstanceReport>,
    #[serde(skip)]
    statuses: Vec<InstanceStatus>,
}

impl RunReport {
    pub fn new(outcomes: &[InstanceOutcome], slots: &[&InstanceSlot], wall_clock: Duration) -> Self {
        let instances: Vec<InstanceReport> = outcomes
            .iter()
            .zip(slots)
            .map(|(outcome, slot)| InstanceReport::new(outcome, slot))
            .collect();
        let bogo_ops = instances.iter().map(|i| i.bogo_ops).sum();
        let secs = wall_clock.as_secs_f64();
        let bogo_ops_per_sec = if secs > 0.0 { bogo_ops as f64 / secs } else { 0.0 };
        let rates: Vec<MetricsReport> = instances.iter().map(|i| i.rates).collect();

        Self {
            stressor: "mmapfiles",
            wall_clock_secs: secs,
            bogo_ops,
            bogo_ops_per_sec,
            combined: MetricsReport::harmonic_mean(&rates),
            instances,
            statuses: outcomes.iter().map(|o| o.status.clone()).collect(),
        }
    }

    /// Failure beats resource exhaustion; all-skipped runs report exhaustion.
    pub fn exit_code(&self) -> ExitCode {
        ExitCode::from(self.exit_status())
    }

    fn exit_status(&self) -> u8 {
        if self.statuses.iter().any(|s| matches!(s, InstanceStatus::Failed(_))) {
            return EXIT_FAILED;
        }
        if !self.statuses.is_empty() && self.statuses.iter().all(|s| *s == InstanceStatus::NoResource) {
            return WorkerExit::NoResource.code() as u8;
        }
        WorkerExit::Success.code() as u8
    }

    pub fn to_json(&self) -> serde_json::Result<String> {
        serde_json::to_string_pretty(self)
    }

    pub fn print_receipt(&self) {
        let passed = self.statuses.iter().filter(|s| **s == InstanceStatus::Success).count();
        let restarts: u32 = self.instances.iter().map(|i| i.restarts).sum();

        println!("\n==================================================");
        println!("          MMAPFILES STRESS RECEIPT               ");
        println!("==================================================");
        println!(" [ BLOCK 1: EXECUTION INTEGRITY ]");
        println!(" Instances:    {}/{} passed", passed, self.statuses.len());
        println!(" Restarts:     {}", restarts);
        for i in &self.instances {
            println!(" {:<13} {}", format!("#{}:", i.instance), i.status);
        }
        println!("--------------------------------------------------");
        println!(" [ BLOCK 2: THROUGHPUT ]");
        println!(" Wall Clock:   {:.2}s", self.wall_clock_secs);
        println!(" Bogo ops:     {}", self.bogo_ops);
        println!(" Bogo ops/s:   {:.2}", self.bogo_ops_per_sec);
        println!("--------------------------------------------------");
        println!(" [ BLOCK 3: VM METRICS (harmonic mean) ]");
        for (label, value) in self.combined.labelled() {
            println!(" {:<28} {:>14.2}", label, value);
        }
        println!("==================================================\n");
    }
}
