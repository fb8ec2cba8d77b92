//! Resolved launch configuration.
//!
//! Built once from parsed CLI arguments. Unlike a long-running server's
//! config, there's no meaningful `Default`: `program` and `ppn` have no
//! sensible default value, so construction goes through [`LaunchConfig::new`]
//! rather than `Config::default()`.

use std::path::PathBuf;

use crate::types::CpuBitmap;

/// CPU packing strategy. `--compact` is the default; `--scatter` spreads
/// rank seeds across the available set instead of clustering them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    Compact,
    Scatter,
}

impl Default for Placement {
    fn default() -> Self {
        Placement::Compact
    }
}

/// The fully resolved configuration for one launcher invocation.
#[derive(Debug, Clone)]
pub struct LaunchConfig {
    /// Processes per node (`--ppn`/`--processes-per-node`/`--ranks-per-node`).
    pub ppn: usize,

    /// `--tpp`/`--threads-per-process`, recorded for observability but not
    /// consulted by the partitioner (see the `cli` module's resolution of
    /// this field).
    pub cpus_per_process_hint: Option<usize>,

    pub placement: Placement,

    /// CPUs removed from the available set before partitioning
    /// (`--exclude-cpus`).
    pub excluded_cpus: CpuBitmap,

    pub program: PathBuf,
    pub program_args: Vec<String>,
}

impl LaunchConfig {
    pub fn new(
        ppn: usize,
        cpus_per_process_hint: Option<usize>,
        placement: Placement,
        excluded_cpus: CpuBitmap,
        program: PathBuf,
        program_args: Vec<String>,
    ) -> Self {
        Self { ppn, cpus_per_process_hint, placement, excluded_cpus, program, program_args }
    }
}
