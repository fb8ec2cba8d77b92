//! Error types for mpipin.
//!
//! One variant per subsystem: topology oracle, rendezvous region, barrier
//! protocol, partitioner, launcher shell.

use std::time::Duration;

use thiserror::Error;

/// Result type alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for mpipin.
#[derive(Error, Debug)]
pub enum Error {
    /// Bad CLI invocation: missing program, zero/invalid ppn, etc.
    #[error("argument error: {0}")]
    Argument(String),

    /// The process's own CPU affinity mask could not be read or set.
    #[error("CPU affinity query failed: {0}")]
    AffinityQuery(#[source] nix::Error),

    /// Two siblings attached to the same region with different inherited
    /// affinity masks.
    #[error("affinity mismatch: this process's available-CPU set differs from the cohort's frozen set")]
    AffinityMismatch,

    /// Online-CPU enumeration or NUMA probing failed outright.
    #[error("topology unavailable: {0}")]
    TopologyUnavailable(String),

    /// A required sysfs file could not be read or did not parse as expected.
    #[error("failed to parse {path}: {reason}")]
    SysfsParse { path: String, reason: String },

    /// A CPU id present in the available set has no corresponding topology
    /// record. Escalated by the caller as a timeout broadcast.
    #[error("topology inconsistent: no record for cpu {0}")]
    TopologyInconsistent(usize),

    /// shm_open / ftruncate / mmap / flock failure during region setup.
    #[error("shared memory error: {0}")]
    SharedMemory(#[source] nix::Error),

    /// A later arrival declared a different `ppn` than the cohort already in
    /// progress.
    #[error("cohort size mismatch: cohort expects {expected} processes, this arrival declared {declared}")]
    CohortSizeMismatch { expected: usize, declared: usize },

    /// No free participant slot in the region (capacity exhausted).
    #[error("cohort full: no free participant slot (capacity {capacity})")]
    CohortFull { capacity: usize },

    /// This waiter's deadline elapsed, or it was woken by a timeout
    /// broadcast triggered by a sibling.
    #[error("barrier timed out after {waited:?} waiting for cohort of size {expected_size}")]
    BarrierTimedOut { expected_size: usize, waited: Duration },

    /// A waiter was woken with `ready` unset. Should be unreachable; kept as
    /// a defensive error rather than a panic so a bug here degrades to a
    /// clean exit instead of an abort inside someone else's job.
    #[error("spurious wake on participant condvar")]
    SpuriousWake,

    /// `Command::exec` of the target program failed (binary missing, not
    /// executable, etc).
    #[error("failed to exec {program}: {source}")]
    Exec {
        program: String,
        #[source]
        source: std::io::Error,
    },
}
