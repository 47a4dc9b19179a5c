use std::path::PathBuf;
use std::time::{Duration, Instant};
use clap::builder::RangedU64ValueParser;
use clap::Parser;
use mmapfiles_core::{Settings, WorkerConfig, MAX_MAPPINGS, SETTING_POPULATE, SETTING_SHARED};
use mmapfiles_io::platform::topology::SystemTopology;

#[derive(Parser, Debug)]
#[command(author, version, about = "Stress the VM subsystem with many file-backed mmaps and munmaps")]
pub struct Args {
    /// Worker processes to run; 0 starts one per online CPU.
    #[arg(short = 'n', long, default_value_t = 1)]
    pub instances: usize,

    /// Seconds to run; 0 runs until interrupted.
    #[arg(short, long, default_value_t = 60)]
    pub timeout: u64,

    /// Stop after N bogo operations, split across instances.
    #[arg(long, visible_alias = "mmapfiles-ops")]
    pub ops: Option<u64>,

    /// Touch every page of each mapping (and pass MAP_POPULATE).
    #[arg(long, visible_alias = "mmapfiles-populate")]
    pub populate: bool,

    /// Use shared instead of private mappings.
    #[arg(long, visible_alias = "mmapfiles-shared")]
    pub shared: bool,

    /// Stop mapping a directory when available memory runs low.
    #[arg(long)]
    pub oom_avoid: bool,

    /// Capacity of each worker's mapping table.
    #[arg(
        long,
        default_value_t = MAX_MAPPINGS,
        value_parser = RangedU64ValueParser::<usize>::new().range(1..)
    )]
    pub max_mappings: usize,

    /// Directory to map files from; repeat to build the rotation.
    #[arg(long = "root", value_name = "PATH")]
    pub roots: Vec<PathBuf>,

    /// Pin each instance to its own CPU core.
    #[arg(long)]
    pub pin: bool,

    /// Print the final report as JSON.
    #[arg(long)]
    pub json: bool,
}

impl Args {
    /// Named settings read by the worker body.
    pub fn settings(&self) -> Settings {
        let mut settings = Settings::new();
        settings.set_bool(SETTING_POPULATE, self.populate);
        settings.set_bool(SETTING_SHARED, self.shared);
        settings
    }

    pub fn run_plan(&self, topology: &SystemTopology, start: Instant) -> RunPlan {
        let instances = topology.instances_for(self.instances);
        let deadline = match self.timeout {
            0 => None,
            secs => Some(start + Duration::from_secs(secs)),
        };
        let pin_cores = self
            .pin
            .then(|| (0..instances).map(|i| topology.core_for_instance(i)).collect());

        RunPlan {
            instances,
            settings: self.settings(),
            worker: WorkerConfig {
                roots: self.roots.clone(),
                max_mappings: self.max_mappings,
                ..Default::default()
            },
            deadline,
            total_ops: self.ops,
            oom_avoid: self.oom_avoid,
            pin_cores,
        }
    }
}

/// Everything a worker process needs, fixed before the first fork.
#[derive(Debug, Clone)]
pub struct RunPlan {
    pub instances: usize,
    pub settings: Settings,
    pub worker: WorkerConfig,
    pub deadline: Option<Instant>,
    pub total_ops: Option<u64>,
    pub oom_avoid: bool,
    pub pin_cores: Option<Vec<usize>>,
}

impl RunPlan {
    /// Bogo-op budget of one instance; the remainder goes to the first ones.
    pub fn ops_for(&self, instance: usize) -> Option<u64> {
        let total = self.total_ops?;
        let n = self.instances.max(1) as u64;
        let extra = u64::from((instance as u64) < total % n);
        Some(total / n + extra)
    }

    pub fn pin_core(&self, instance: usize) -> Option<usize> {
        self.pin_cores.as_ref().and_then(|cores| cores.get(instance).copied())
    }

    pub fn past_deadline(&self) -> bool {
        self.deadline.is_some_and(|d| Instant::now() >= d)
    }
}
