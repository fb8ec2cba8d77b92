//! Topology Oracle: reads the node pseudo-filesystem and materializes an
//! in-memory [`Topology`] graph.
//!
//! File access is expressed as a small set of typed accessors keyed on an
//! enum of path templates rather than `printf`-style format strings, so a
//! reader can see every sysfs file this crate touches in one place.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{Error, Result};
use crate::types::{Cache, CacheKind, CpuBitmap, CpuRecord, NodeRecord, Topology};

/// Cache index directories are probed 0..MAX_CACHE_INDEX; stops at the first
/// missing index, matching the original's "enumerate cache indices 0..9"
/// convention.
const MAX_CACHE_INDEX: usize = 10;

/// A sysfs path template. Centralizing these keeps every file this crate
/// reads visible at a glance and avoids scattering `format!` calls through
/// the collection logic.
enum SysPath {
    OnlineCpus,
    NodeDir(usize),
    NodeCpuMap(usize),
    CpuNodeDir { cpu: usize, node: usize },
    CoreId(usize),
    PhysicalPackageId(usize),
    CoreSiblings(usize),
    ThreadSiblings(usize),
    CacheDir { cpu: usize, index: usize },
    CacheAttr { cpu: usize, index: usize, attr: &'static str },
}

impl SysPath {
    fn to_path(&self, root: &Path) -> PathBuf {
        match *self {
            SysPath::OnlineCpus => root.join("devices/system/cpu/online"),
            SysPath::NodeDir(node) => root.join(format!("devices/system/node/node{node}")),
            SysPath::NodeCpuMap(node) => {
                root.join(format!("devices/system/node/node{node}/cpumap"))
            }
            SysPath::CpuNodeDir { cpu, node } => {
                root.join(format!("devices/system/cpu/cpu{cpu}/node{node}"))
            }
            SysPath::CoreId(cpu) => {
                root.join(format!("devices/system/cpu/cpu{cpu}/topology/core_id"))
            }
            SysPath::PhysicalPackageId(cpu) => root.join(format!(
                "devices/system/cpu/cpu{cpu}/topology/physical_package_id"
            )),
            SysPath::CoreSiblings(cpu) => root.join(format!(
                "devices/system/cpu/cpu{cpu}/topology/core_siblings"
            )),
            SysPath::ThreadSiblings(cpu) => root.join(format!(
                "devices/system/cpu/cpu{cpu}/topology/thread_siblings"
            )),
            SysPath::CacheDir { cpu, index } => {
                root.join(format!("devices/system/cpu/cpu{cpu}/cache/index{index}"))
            }
            SysPath::CacheAttr { cpu, index, attr } => root.join(format!(
                "devices/system/cpu/cpu{cpu}/cache/index{index}/{attr}"
            )),
        }
    }
}

/// Reads the node topology, rooted at a configurable path so tests can point
/// it at a fixture tree instead of the real `/sys`.
pub struct TopologyOracle {
    root: PathBuf,
}

impl Default for TopologyOracle {
    fn default() -> Self {
        Self::new()
    }
}

impl TopologyOracle {
    /// Oracle rooted at the real `/sys`.
    pub fn new() -> Self {
        Self { root: PathBuf::from("/sys") }
    }

    /// Oracle rooted at an arbitrary path, for fixture-backed tests.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn read_string(&self, path: &SysPath) -> Result<String> {
        let full = path.to_path(&self.root);
        fs::read_to_string(&full)
            .map(|s| s.trim().to_string())
            .map_err(|e| Error::SysfsParse { path: full.display().to_string(), reason: e.to_string() })
    }

    fn read_long(&self, path: &SysPath) -> Result<u64> {
        let raw = self.read_string(path)?;
        raw.parse().map_err(|e: std::num::ParseIntError| Error::SysfsParse {
            path: path.to_path(&self.root).display().to_string(),
            reason: e.to_string(),
        })
    }

    fn read_bitmap(&self, path: &SysPath) -> Result<CpuBitmap> {
        let raw = self.read_string(path)?;
        CpuBitmap::parse_hex_groups(&raw)
    }

    fn path_exists(&self, path: &SysPath) -> bool {
        path.to_path(&self.root).exists()
    }

    /// Parses a sysfs cache `size` value such as `"32K"` or a bare byte
    /// count, distinguishing the two rather than assuming kilobytes
    /// unconditionally.
    fn parse_cache_size(raw: &str) -> Result<u64> {
        let raw = raw.trim();
        if let Some(digits) = raw.strip_suffix('K') {
            digits
                .parse::<u64>()
                .map(|k| k * 1024)
                .map_err(|e| Error::SysfsParse { path: raw.to_string(), reason: e.to_string() })
        } else if let Some(digits) = raw.strip_suffix('M') {
            digits
                .parse::<u64>()
                .map(|m| m * 1024 * 1024)
                .map_err(|e| Error::SysfsParse { path: raw.to_string(), reason: e.to_string() })
        } else {
            raw.parse()
                .map_err(|e: std::num::ParseIntError| Error::SysfsParse { path: raw.to_string(), reason: e.to_string() })
        }
    }

    fn discover_node_ids(&self) -> Result<Vec<usize>> {
        let node_root = self.root.join("devices/system/node");
        let entries = fs::read_dir(&node_root).map_err(|_| {
            Error::TopologyUnavailable(format!("no NUMA node directory under {}", node_root.display()))
        })?;
        let mut ids = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if let Some(digits) = name.strip_prefix("node") {
                if let Ok(id) = digits.parse::<usize>() {
                    ids.push(id);
                }
            }
        }
        ids.sort_unstable();
        Ok(ids)
    }

    fn numa_node_of(&self, cpu: usize, node_ids: &[usize]) -> Result<usize> {
        for &node in node_ids {
            if self.path_exists(&SysPath::CpuNodeDir { cpu, node }) {
                return Ok(node);
            }
        }
        Err(Error::TopologyInconsistent(cpu))
    }

    fn collect_caches(&self, cpu: usize) -> Result<Vec<Cache>> {
        let mut caches = Vec::new();
        for index in 0..MAX_CACHE_INDEX {
            if !self.path_exists(&SysPath::CacheDir { cpu, index }) {
                break;
            }
            let level = self.read_long(&SysPath::CacheAttr { cpu, index, attr: "level" })? as u32;
            let kind_raw = self.read_string(&SysPath::CacheAttr { cpu, index, attr: "type" })?;
            let size_raw = self.read_string(&SysPath::CacheAttr { cpu, index, attr: "size" })?;
            let line_size = self.read_long(&SysPath::CacheAttr { cpu, index, attr: "coherency_line_size" })?;
            let num_sets = self.read_long(&SysPath::CacheAttr { cpu, index, attr: "number_of_sets" })?;
            let ways = self.read_long(&SysPath::CacheAttr { cpu, index, attr: "ways_of_associativity" })?;
            let line_partition =
                self.read_long(&SysPath::CacheAttr { cpu, index, attr: "physical_line_partition" })?;
            let shared_cpus_raw = self.read_string(&SysPath::CacheAttr { cpu, index, attr: "shared_cpu_map" })?;

            caches.push(Cache {
                level,
                kind: CacheKind::parse(&kind_raw),
                size_bytes: Self::parse_cache_size(&size_raw)?,
                line_size_bytes: line_size,
                num_sets,
                ways,
                line_partition,
                shared_cpus: CpuBitmap::parse_hex_groups(&shared_cpus_raw)?,
            });
        }
        Ok(caches)
    }

    /// Collects the full topology graph.
    pub fn collect(&self) -> Result<Topology> {
        let online_raw = self.read_string(&SysPath::OnlineCpus)?;
        let online = CpuBitmap::parse_range_list(&online_raw)?;

        let node_ids = self.discover_node_ids()?;
        let mut nodes = BTreeMap::new();
        for &node_id in &node_ids {
            let cpus = self.read_bitmap(&SysPath::NodeCpuMap(node_id))?;
            nodes.insert(node_id, NodeRecord { node_id, cpus });
        }

        let mut cpus = BTreeMap::new();
        for cpu_id in online.iter_ones() {
            let numa_node_id = self.numa_node_of(cpu_id, &node_ids)?;
            let record = CpuRecord {
                cpu_id,
                numa_node_id,
                core_id: self.read_long(&SysPath::CoreId(cpu_id))? as u32,
                package_id: self.read_long(&SysPath::PhysicalPackageId(cpu_id))? as u32,
                core_siblings: self.read_bitmap(&SysPath::CoreSiblings(cpu_id))?,
                thread_siblings: self.read_bitmap(&SysPath::ThreadSiblings(cpu_id))?,
                caches: self.collect_caches(cpu_id)?,
            };
            cpus.insert(cpu_id, record);
        }

        Ok(Topology { cpus, nodes })
    }
}

/// Reads the real node's topology from `/sys`.
pub fn collect_topology() -> Result<Topology> {
    TopologyOracle::new().collect()
}
