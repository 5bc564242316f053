//! CPU and NUMA topology
//!
//! Reads the CPU to NUMA node map and device NUMA nodes from sysfs, and pins
//! worker threads to their CPU.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use nix::sched::{CpuSet, sched_getaffinity, sched_setaffinity};
use nix::unistd::Pid;
use thiserror::Error;
use tracing::{debug, warn};

/// Default sysfs mount point
pub const SYSFS_ROOT: &str = "/sys";

#[derive(Debug, Error)]
pub enum TopologyError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid CPU list {0:?}")]
    InvalidCpuList(String),

    #[error("CPU affinity call failed: {0}")]
    Affinity(#[from] nix::Error),

    #[error("CPU {0} is outside the supported CPU set")]
    CpuOutOfRange(usize),
}

/// Parse a kernel CPU list such as `0-3,8,10-11`.
pub fn parse_cpu_list(s: &str) -> Result<Vec<usize>, TopologyError> {
    let invalid = || TopologyError::InvalidCpuList(s.to_string());
    let mut cpus = Vec::new();
    for part in s.trim().split(',').map(str::trim).filter(|p| !p.is_empty()) {
        match part.split_once('-') {
            Some((lo, hi)) => {
                let lo: usize = lo.trim().parse().map_err(|_| invalid())?;
                let hi: usize = hi.trim().parse().map_err(|_| invalid())?;
                if lo > hi {
                    return Err(invalid());
                }
                cpus.extend(lo..=hi);
            }
            None => cpus.push(part.parse().map_err(|_| invalid())?),
        }
    }
    cpus.sort_unstable();
    cpus.dedup();
    Ok(cpus)
}

/// CPU to NUMA node map of the host
#[derive(Debug, Clone, Default)]
pub struct Topology {
    root: PathBuf,
    cpu_to_node: BTreeMap<usize, u32>,
    nodes: Vec<u32>,
}

impl Topology {
    /// Discover the topology of the running host.
    pub fn discover() -> Self {
        Self::from_sysfs(Path::new(SYSFS_ROOT))
    }

    /// Read `devices/system/node/node*/cpulist` below `root`. A host without
    /// NUMA information is treated as a single node 0.
    pub fn from_sysfs(root: &Path) -> Self {
        let mut cpu_to_node = BTreeMap::new();
        let mut nodes = Vec::new();

        let node_dir = root.join("devices/system/node");
        if let Ok(entries) = fs::read_dir(&node_dir) {
            for entry in entries.flatten() {
                let name = entry.file_name();
                let Some(node) = name
                    .to_str()
                    .and_then(|n| n.strip_prefix("node"))
                    .and_then(|n| n.parse::<u32>().ok())
                else {
                    continue;
                };
                let cpulist = entry.path().join("cpulist");
                match fs::read_to_string(&cpulist).map(|s| parse_cpu_list(&s)) {
                    Ok(Ok(cpus)) => {
                        for cpu in cpus {
                            cpu_to_node.insert(cpu, node);
                        }
                        nodes.push(node);
                    }
                    Ok(Err(e)) => warn!(path = %cpulist.display(), error = %e, "Skipping NUMA node"),
                    Err(e) => warn!(path = %cpulist.display(), error = %e, "Skipping NUMA node"),
                }
            }
        }
        nodes.sort_unstable();

        if nodes.is_empty() {
            debug!("No NUMA information, assuming a single node");
            nodes.push(0);
        }

        Self {
            root: root.to_path_buf(),
            cpu_to_node,
            nodes,
        }
    }

    /// NUMA node of `cpu`; CPUs missing from the map belong to node 0.
    pub fn node_of(&self, cpu: usize) -> u32 {
        self.cpu_to_node.get(&cpu).copied().unwrap_or(0)
    }

    pub fn nodes(&self) -> &[u32] {
        &self.nodes
    }

    /// NUMA node of network device `name`.
    ///
    /// An explicit `configured` value wins. Otherwise the node is read from
    /// `class/net/<name>/device/numa_node`. Virtual devices have no such
    /// file; on a single-node host they belong to that node, on a multi-node
    /// host they are reported as unknown (`-1`).
    pub fn device_node(&self, name: &str, configured: Option<i32>) -> i32 {
        if let Some(node) = configured {
            return node;
        }
        let path = self.root.join("class/net").join(name).join("device/numa_node");
        let from_sysfs = fs::read_to_string(&path)
            .ok()
            .and_then(|s| s.trim().parse::<i32>().ok())
            .filter(|&node| node >= 0);
        match from_sysfs {
            Some(node) => node,
            None if self.nodes.len() == 1 => self.nodes[0] as i32,
            None => -1,
        }
    }
}

/// CPUs the current process may run on, ascending.
pub fn affinity_cpus() -> Result<Vec<usize>, TopologyError> {
    let set = sched_getaffinity(Pid::from_raw(0))?;
    let mut cpus = Vec::new();
    for cpu in 0..CpuSet::count() {
        if set.is_set(cpu)? {
            cpus.push(cpu);
        }
    }
    Ok(cpus)
}

/// Default worker CPUs: every CPU in the affinity mask except the first,
/// which is left to the main thread.
pub fn default_worker_cpus() -> Result<Vec<usize>, TopologyError> {
    let mut cpus = affinity_cpus()?;
    if !cpus.is_empty() {
        cpus.remove(0);
    }
    Ok(cpus)
}

/// Pin the calling thread to `cpu`.
pub fn pin_current_thread(cpu: usize) -> Result<(), TopologyError> {
    if cpu >= CpuSet::count() {
        return Err(TopologyError::CpuOutOfRange(cpu));
    }
    let mut set = CpuSet::new();
    set.set(cpu)?;
    sched_setaffinity(Pid::from_raw(0), &set)?;
    Ok(())
}
