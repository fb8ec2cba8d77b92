//! mpipin: a topology-aware CPU-pinning launcher for co-located MPI-style
//! process cohorts.
//!
//! A process calling [`barrier::pin_process`] rendezvouses with its
//! siblings through a [`rendezvous::RendezvousRegion`] keyed by their common
//! parent pid. The last arrival elects itself (or the queue head) to run
//! [`partitioner::partition`] against the node's [`topology::Topology`] once,
//! then every participant is handed its [`types::CpuBitmap`] affinity and
//! released to `sched_setaffinity` and exec its real program.

#![warn(missing_docs)]
#![warn(rust_2018_idioms)]
#![warn(clippy::all)]

pub mod barrier;
pub mod cli;
pub mod config;
pub mod error;
pub mod observability;
pub mod partitioner;
pub mod rendezvous;
pub mod topology;
pub mod types;

pub use config::{LaunchConfig, Placement};
pub use error::{Error, Result};
pub use types::{CpuBitmap, Topology};
