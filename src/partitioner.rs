//! Partitioner: the single-elected-participant algorithm that walks the
//! participant list and greedily allocates a contiguous, cache/NUMA-local
//! block of CPUs per rank from the available set.

use crate::config::Placement;
use crate::error::{Error, Result};
use crate::types::{CpuBitmap, CpuRecord, Topology};

/// Greedily partitions `available` into `n_ranks` masks of `cpus_per_process`
/// CPUs each, mutating `available` down to the residual set.
///
/// Tie-breaking is strictly by ascending CPU id at every scan, so the result
/// is deterministic given the same topology and initial available set,
/// independent of arrival order (testable property 3).
pub fn partition(
    topology: &Topology,
    available: &mut CpuBitmap,
    cpus_per_process: usize,
    n_ranks: usize,
    placement: Placement,
) -> Result<Vec<CpuBitmap>> {
    if cpus_per_process == 0 {
        return Err(Error::Argument("cpus_per_process must be greater than zero".into()));
    }

    // Scatter seeds are reserved up front against the *original* available
    // set so the stride is stable regardless of what later extension passes
    // consume; compact mode seeds greedily, rank by rank, from whatever
    // remains.
    let scatter_seeds = match placement {
        Placement::Scatter => Some(reserve_scatter_seeds(available, n_ranks)?),
        Placement::Compact => None,
    };

    let mut ranks = Vec::with_capacity(n_ranks);
    for rank in 0..n_ranks {
        let seed = match &scatter_seeds {
            Some(seeds) => seeds[rank],
            None => available
                .lowest()
                .ok_or_else(|| Error::Argument("not enough available cpus for requested ranks".into()))?,
        };
        available.clear(seed);

        let mut mask = CpuBitmap::new();
        mask.set(seed);
        let mut prev_cpu = seed;

        for _ in 1..cpus_per_process {
            let prev_record = topology.cpu(prev_cpu)?;

            let next_cpu = if placement == Placement::Compact {
                find_cache_local(prev_record, available)
            } else {
                None
            };
            let next_cpu = match next_cpu {
                Some(cpu) => cpu,
                None => match find_numa_local(topology, available, prev_record.numa_node_id)? {
                    Some(cpu) => cpu,
                    None => available
                        .lowest()
                        .ok_or_else(|| Error::Argument("not enough available cpus for requested ranks".into()))?,
                },
            };

            available.clear(next_cpu);
            mask.set(next_cpu);
            prev_cpu = next_cpu;
        }

        ranks.push(mask);
    }

    Ok(ranks)
}

/// Cache-locality pass: the cache list is stored innermost (L1) outward, so
/// the first hit in iteration order is the closest cache-sharing CPU.
fn find_cache_local(prev_record: &CpuRecord, available: &CpuBitmap) -> Option<usize> {
    for cache in &prev_record.caches {
        if let Some(cpu) = cache.shared_cpus.iter_ones().find(|&cpu| available.is_set(cpu)) {
            return Some(cpu);
        }
    }
    None
}

/// NUMA-locality pass: ascending scan for any available CPU sharing the
/// seed's NUMA home.
fn find_numa_local(topology: &Topology, available: &CpuBitmap, home_node: usize) -> Result<Option<usize>> {
    for cpu in available.iter_ones() {
        if topology.cpu(cpu)?.numa_node_id == home_node {
            return Ok(Some(cpu));
        }
    }
    Ok(None)
}

/// Reserves `n_ranks` seeds spread at stride `floor(|available| / n_ranks)`
/// apart over the CPUs available *now*, clearing each from `available`
/// immediately so later extension passes cannot steal a reserved seed.
fn reserve_scatter_seeds(available: &mut CpuBitmap, n_ranks: usize) -> Result<Vec<usize>> {
    let sorted: Vec<usize> = available.iter_ones().collect();
    if sorted.is_empty() || n_ranks == 0 {
        return Err(Error::Argument("no available cpus to seed ranks".into()));
    }
    let stride = (sorted.len() / n_ranks).max(1);
    let seeds: Vec<usize> = (0..n_ranks).map(|i| sorted[(i * stride).min(sorted.len() - 1)]).collect();
    for &seed in &seeds {
        available.clear(seed);
    }
    Ok(seeds)
}
