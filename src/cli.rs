//! Command-line surface: `mpipin [options] <program> [args...]`.

use std::path::PathBuf;

use clap::Parser;

use crate::config::{LaunchConfig, Placement};
use crate::error::{Error, Result};
use crate::rendezvous::COHORT_CAPACITY;
use crate::types::CpuBitmap;

/// Topology-aware CPU-pinning launcher for co-located MPI-style process
/// cohorts.
#[derive(Parser, Debug)]
#[command(name = "mpipin", about, version)]
pub struct Cli {
    /// Pack each rank's CPUs from the innermost shared cache outward
    /// (default).
    #[arg(long, conflicts_with = "scatter")]
    pub compact: bool,

    /// Spread rank seeds across the available set at a fixed stride instead
    /// of clustering them.
    #[arg(long)]
    pub scatter: bool,

    /// Processes per node.
    #[arg(
        short = 'p',
        short_alias = 'n',
        long,
        visible_aliases = ["processes-per-node", "ranks-per-node"]
    )]
    pub ppn: usize,

    /// Advisory threads per rank. Parsed and recorded, not consulted by the
    /// partitioner.
    #[arg(
        short = 't',
        long,
        visible_aliases = ["threads-per-process", "cores-per-process"]
    )]
    pub tpp: Option<usize>,

    /// CPUs removed from the available set before partitioning, e.g. `0-3,7`.
    #[arg(short = 'e', long = "exclude-cpus")]
    pub exclude_cpus: Option<String>,

    /// The program to launch.
    pub program: PathBuf,

    /// Arguments passed through to `program`.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
    pub program_args: Vec<String>,
}

impl Cli {
    /// Resolves the parsed CLI into a [`LaunchConfig`], validating option
    /// values the way the original's `getopt_long` loop did.
    pub fn into_config(self) -> Result<LaunchConfig> {
        if self.ppn == 0 {
            return Err(Error::Argument("you must specify a positive number of processes per node".into()));
        }
        if self.ppn > COHORT_CAPACITY {
            return Err(Error::Argument(format!(
                "-p/--ppn: {} exceeds the cohort's slot capacity ({COHORT_CAPACITY})",
                self.ppn
            )));
        }
        if let Some(tpp) = self.tpp {
            if tpp == 0 {
                return Err(Error::Argument("-t/--tpp: invalid number of threads".into()));
            }
        }

        let placement = if self.scatter { Placement::Scatter } else { Placement::Compact };

        let excluded_cpus = match self.exclude_cpus {
            Some(ref s) => CpuBitmap::parse_range_list(s)?,
            None => CpuBitmap::new(),
        };

        Ok(LaunchConfig::new(self.ppn, self.tpp, placement, excluded_cpus, self.program, self.program_args))
    }
}
