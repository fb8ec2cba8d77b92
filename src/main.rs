//! `mpipin` binary entrypoint: resolve this process's CPU affinity and the
//! node topology, rendezvous with sibling ranks, then exec the target
//! program pinned to the computed mask.

use std::os::unix::process::CommandExt;
use std::process::Command;

use clap::Parser;
use nix::sched::{sched_getaffinity, sched_setaffinity, CpuSet};
use nix::unistd::{getpid, getppid};

use mpipin::barrier;
use mpipin::cli::Cli;
use mpipin::config::LaunchConfig;
use mpipin::error::{Error, Result};
use mpipin::observability::init_tracing;
use mpipin::rendezvous::RendezvousRegion;
use mpipin::topology::collect_topology;
use mpipin::types::CpuBitmap;

fn main() {
    init_tracing();

    let config = match Cli::parse().into_config() {
        Ok(config) => config,
        Err(e) => fail(&e),
    };

    if let Err(e) = run(config) {
        fail(&e);
    }
}

fn run(config: LaunchConfig) -> Result<()> {
    let own_affinity = sched_getaffinity(getpid()).map_err(Error::AffinityQuery)?;
    let mut available = CpuBitmap::from_cpu_set(&own_affinity);
    for cpu in config.excluded_cpus.iter_ones() {
        available.clear(cpu);
    }

    let topology = collect_topology()?;

    let parent = getppid();
    let (region, created) = RendezvousRegion::open_or_create(parent, config.ppn, available)?;
    tracing::debug!(pid = %getpid(), parent = %parent, created, "attached to rendezvous region");

    let affinity = barrier::pin_process(&region, config.ppn, config.placement, &topology)?;

    let cpu_set: CpuSet = affinity.to_cpu_set()?;
    sched_setaffinity(getpid(), &cpu_set).map_err(Error::AffinityQuery)?;

    region.unlink();

    tracing::info!(pid = %getpid(), cpus = ?affinity, program = %config.program.display(), "pinned, exec'ing");

    let err = Command::new(&config.program).args(&config.program_args).exec();
    Err(Error::Exec { program: config.program.display().to_string(), source: err })
}

fn fail(error: &Error) -> ! {
    tracing::error!(%error, "mpipin failed");
    eprintln!("mpipin: {error}");
    std::process::exit(1);
}
