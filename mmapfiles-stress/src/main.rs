mod config;
mod lifecycle;
mod report;
mod worker;

use std::process::ExitCode;
use std::time::Instant;
use clap::Parser;
use env_logger::Env;
use log::{error, info, warn};
use mmapfiles_core::WorkerExit;
use mmapfiles_io::platform::topology::SystemTopology;

use config::Args;
use lifecycle::Supervisor;
use report::RunReport;

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    let topology = SystemTopology::new();
    topology.print_summary();

    let start = Instant::now();
    let plan = args.run_plan(&topology, start);
    info!(
        "Dispatching {} mmapfiles instance(s), timeout {}",
        plan.instances,
        match args.timeout {
            0 => "none".to_string(),
            secs => format!("{}s", secs),
        }
    );

    let mut supervisor = match Supervisor::new(plan) {
        Ok(s) => s,
        Err(e) => {
            error!("mmapfiles: cannot mmap mmap file information: {}, skipping stressor", e);
            return ExitCode::from(WorkerExit::NoResource.code() as u8);
        }
    };

    let stop = supervisor.stop_handle();
    if let Err(e) = ctrlc::set_handler(move || stop.request_stop()) {
        warn!("Could not install Ctrl-C handler: {}", e);
    }

    let outcomes = match supervisor.run() {
        Ok(outcomes) => outcomes,
        Err(e) => {
            error!("mmapfiles: supervisor failed: {:#}", e);
            return ExitCode::FAILURE;
        }
    };
    let wall_clock = start.elapsed();

    let slots: Vec<_> = outcomes.iter().filter_map(|o| supervisor.slot(o.instance)).collect();
    let report = RunReport::new(&outcomes, &slots, wall_clock);

    if args.json {
        match report.to_json() {
            Ok(json) => println!("{}", json),
            Err(e) => error!("Failed to serialize report: {}", e),
        }
    } else {
        report.print_receipt();
    }

    report.exit_code()
}
