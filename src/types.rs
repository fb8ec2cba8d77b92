//! Core data types: CPU bitmaps and the topology graph.
//!
//! `nix::sched::CpuSet` only covers the live affinity-syscall boundary
//! (`CPU_SETSIZE` = 1024 bits, but no iteration/parsing helpers beyond
//! `set`/`is_set`). Everything we store (available sets, per-cache shared-cpu
//! masks, computed affinities) lives longer than one syscall and needs to be
//! parsed from sysfs hex strings and range lists, so we keep our own bitmap
//! type and convert to `CpuSet` only at the syscall boundary.

use std::collections::BTreeMap;
use std::fmt;

use crate::error::{Error, Result};

/// Number of bits in a [`CpuBitmap`], matching `nix`'s `CpuSet::count()`
/// (Linux `CPU_SETSIZE`).
pub const CPU_BITMAP_BITS: usize = 1024;
const WORDS: usize = CPU_BITMAP_BITS / 64;

/// A fixed-capacity bitmap over CPU ids, used for available sets, per-cache
/// shared-CPU maps, per-node CPU maps, and computed per-rank affinities.
#[derive(Clone, Copy, PartialEq, Eq, Default)]
pub struct CpuBitmap {
    words: [u64; WORDS],
}

impl CpuBitmap {
    /// An empty bitmap.
    pub const fn new() -> Self {
        Self { words: [0; WORDS] }
    }

    pub fn set(&mut self, cpu: usize) {
        if cpu < CPU_BITMAP_BITS {
            self.words[cpu / 64] |= 1u64 << (cpu % 64);
        }
    }

    pub fn clear(&mut self, cpu: usize) {
        if cpu < CPU_BITMAP_BITS {
            self.words[cpu / 64] &= !(1u64 << (cpu % 64));
        }
    }

    pub fn is_set(&self, cpu: usize) -> bool {
        cpu < CPU_BITMAP_BITS && self.words[cpu / 64] & (1u64 << (cpu % 64)) != 0
    }

    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// Lowest-numbered set bit, if any.
    pub fn lowest(&self) -> Option<usize> {
        self.iter_ones().next()
    }

    /// Ascending iterator over set CPU ids.
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        (0..CPU_BITMAP_BITS).filter(move |&cpu| self.is_set(cpu))
    }

    pub fn union(&self, other: &CpuBitmap) -> CpuBitmap {
        let mut out = *self;
        for (w, o) in out.words.iter_mut().zip(other.words.iter()) {
            *w |= o;
        }
        out
    }

    pub fn intersects(&self, other: &CpuBitmap) -> bool {
        self.words.iter().zip(other.words.iter()).any(|(a, b)| a & b != 0)
    }

    /// Parse the comma-separated 32-bit hex group format used by
    /// `shared_cpu_map` and per-node `cpumap` files, e.g.
    /// `"00000000,0000000f"` (most-significant group first).
    pub fn parse_hex_groups(s: &str) -> Result<CpuBitmap> {
        let mut map = CpuBitmap::new();
        let groups: Vec<&str> = s.trim().split(',').collect();
        let mut cpu_base = (groups.len() - 1) * 32;
        for group in groups {
            let value = u32::from_str_radix(group, 16)
                .map_err(|e| Error::SysfsParse { path: s.to_string(), reason: e.to_string() })?;
            for bit in 0..32 {
                if value & (1 << bit) != 0 {
                    map.set(cpu_base + bit);
                }
            }
            cpu_base = cpu_base.saturating_sub(32);
        }
        Ok(map)
    }

    /// Parse a range list such as `"0-3,7,9-10"`, used for the online CPU
    /// list and for `--exclude-cpus`.
    pub fn parse_range_list(s: &str) -> Result<CpuBitmap> {
        let mut map = CpuBitmap::new();
        let s = s.trim();
        if s.is_empty() {
            return Ok(map);
        }
        for part in s.split(',') {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }
            if let Some((lo, hi)) = part.split_once('-') {
                let lo: usize = lo.parse().map_err(|_| Error::SysfsParse {
                    path: s.to_string(),
                    reason: format!("invalid range start {lo:?}"),
                })?;
                let hi: usize = hi.parse().map_err(|_| Error::SysfsParse {
                    path: s.to_string(),
                    reason: format!("invalid range end {hi:?}"),
                })?;
                for cpu in lo..=hi {
                    map.set(cpu);
                }
            } else {
                let cpu: usize = part.parse().map_err(|_| Error::SysfsParse {
                    path: s.to_string(),
                    reason: format!("invalid cpu id {part:?}"),
                })?;
                map.set(cpu);
            }
        }
        Ok(map)
    }

    /// Convert to the `nix` affinity-syscall type.
    pub fn to_cpu_set(&self) -> Result<nix::sched::CpuSet> {
        let mut set = nix::sched::CpuSet::new();
        for cpu in self.iter_ones() {
            set.set(cpu).map_err(Error::AffinityQuery)?;
        }
        Ok(set)
    }

    /// Convert from the `nix` affinity-syscall type.
    pub fn from_cpu_set(set: &nix::sched::CpuSet) -> CpuBitmap {
        let mut map = CpuBitmap::new();
        for cpu in 0..nix::sched::CpuSet::count() {
            if set.is_set(cpu).unwrap_or(false) {
                map.set(cpu);
            }
        }
        map
    }
}

impl fmt::Debug for CpuBitmap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.iter_ones()).finish()
    }
}

/// Kind of a CPU cache level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    Data,
    Instruction,
    Unified,
}

impl CacheKind {
    pub fn parse(s: &str) -> CacheKind {
        match s.trim() {
            "Data" => CacheKind::Data,
            "Instruction" => CacheKind::Instruction,
            _ => CacheKind::Unified,
        }
    }
}

/// One cache level associated with a CPU, as read from `cache/indexK/*`.
#[derive(Debug, Clone)]
pub struct Cache {
    pub level: u32,
    pub kind: CacheKind,
    pub size_bytes: u64,
    pub line_size_bytes: u64,
    pub num_sets: u64,
    pub ways: u64,
    pub line_partition: u64,
    pub shared_cpus: CpuBitmap,
}

/// Per-CPU topology record.
#[derive(Debug, Clone)]
pub struct CpuRecord {
    pub cpu_id: usize,
    pub numa_node_id: usize,
    pub core_id: u32,
    pub package_id: u32,
    pub core_siblings: CpuBitmap,
    pub thread_siblings: CpuBitmap,
    /// Innermost (L1) first.
    pub caches: Vec<Cache>,
}

/// Per-NUMA-node record.
#[derive(Debug, Clone)]
pub struct NodeRecord {
    pub node_id: usize,
    pub cpus: CpuBitmap,
}

/// The full topology graph for the node the launcher is running on.
#[derive(Debug, Clone)]
pub struct Topology {
    pub cpus: BTreeMap<usize, CpuRecord>,
    pub nodes: BTreeMap<usize, NodeRecord>,
}

impl Topology {
    pub fn cpu(&self, cpu_id: usize) -> Result<&CpuRecord> {
        self.cpus.get(&cpu_id).ok_or(Error::TopologyInconsistent(cpu_id))
    }

    /// Union of every online CPU across all known nodes.
    pub fn online_cpus(&self) -> CpuBitmap {
        let mut map = CpuBitmap::new();
        for node in self.nodes.values() {
            map = map.union(&node.cpus);
        }
        map
    }
}
