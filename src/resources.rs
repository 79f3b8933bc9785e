// src/resources.rs
//
// =============================================================================
// MINI-SLURM: RESOURCE MODEL (v 0.1)
// =============================================================================
//
// Tracks how many CPUs and how much memory are free, per topology node, as a
// bitmask over core indices (the same style the rest of this family of tools
// uses for GPU/core ledgers). A single workstation with no topology file
// configured is modeled as one node owning the whole machine; a topology
// file splits the host's cores evenly across its declared nodes so that
// distance-aware placement still has something to bite on.

use std::collections::HashMap;

use crate::error::SchedulerError;
use crate::topology::Topology;

#[derive(Debug, Clone)]
struct NodeResources {
    /// Global core indices owned by this node.
    core_ids: Vec<usize>,
    mem_total_mb: u64,
    mem_used_mb: u64,
}

impl NodeResources {
    fn free_cores(&self, busy: &[bool]) -> usize {
        self.core_ids.iter().filter(|&&c| !busy[c]).count()
    }

    fn free_mem_mb(&self) -> u64 {
        self.mem_total_mb.saturating_sub(self.mem_used_mb)
    }
}

#[derive(Debug, Clone)]
pub struct Allocation {
    pub nodes: Vec<String>,
    pub core_ids: Vec<usize>,
    pub mem_mb: u64,
}

pub struct ResourceModel {
    pub hostname: String,
    pub total_cpus: u32,
    pub total_mem_mb: u64,
    core_busy: Vec<bool>,
    nodes: HashMap<String, NodeResources>,
    topology: Topology,
}

impl ResourceModel {
    /// Probes the host via sysinfo/num_cpus and lays either the supplied
    /// topology or a single synthetic node over the detected capacity.
    /// `total_cpus_override`/`total_mem_mb_override` take precedence over the
    /// detected values and must be applied before node/core division, not
    /// patched onto the result afterward, since `core_busy` and each node's
    /// core share are both sized off `total_cpus` at construction time.
    pub fn detect(
        topology: Topology,
        total_cpus_override: Option<u32>,
        total_mem_mb_override: Option<u64>,
    ) -> anyhow::Result<Self> {
        let total_cpus = total_cpus_override.unwrap_or_else(|| num_cpus::get() as u32);
        let total_mem_mb = match total_mem_mb_override {
            Some(v) => v,
            None => {
                let mut sys = sysinfo::System::new();
                sys.refresh_memory();
                sys.total_memory() / (1024 * 1024)
            }
        };
        let hostname = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| "localhost".to_string());

        Ok(Self::new(hostname, total_cpus, total_mem_mb, topology))
    }

    pub fn new(hostname: String, total_cpus: u32, total_mem_mb: u64, topology: Topology) -> Self {
        let node_names = topology.nodes().to_vec();
        let n = node_names.len().max(1) as u32;
        let base = total_cpus / n;
        let remainder = total_cpus % n;
        let mem_per_node = total_mem_mb / n as u64;

        let mut nodes = HashMap::new();
        let mut next_core = 0usize;
        for (i, name) in node_names.iter().enumerate() {
            let share = base + if (i as u32) < remainder { 1 } else { 0 };
            let core_ids: Vec<usize> = (next_core..next_core + share as usize).collect();
            next_core += share as usize;
            nodes.insert(
                name.clone(),
                NodeResources {
                    core_ids,
                    mem_total_mb: mem_per_node,
                    mem_used_mb: 0,
                },
            );
        }

        Self {
            hostname,
            total_cpus,
            total_mem_mb,
            core_busy: vec![false; total_cpus as usize],
            nodes,
            topology,
        }
    }

    pub fn topology(&self) -> &Topology {
        &self.topology
    }

    pub fn free_cpus(&self) -> u32 {
        self.core_busy.iter().filter(|&&b| !b).count() as u32
    }

    pub fn free_mem_mb(&self) -> u64 {
        self.nodes.values().map(|n| n.free_mem_mb()).sum()
    }

    fn candidate_nodes(&self, min_free_cores: u32) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(_, r)| r.free_cores(&self.core_busy) as u32 >= 1 || min_free_cores == 0)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// Attempts to reserve `cpus` cores and `mem_mb` memory, possibly spread
    /// across multiple nodes chosen by the topology engine for locality.
    /// Returns `Err(InsufficientResources)` if the aggregate free capacity
    /// can't cover the request, or `Err(NoFeasiblePlacement)` if capacity
    /// exists in aggregate but the topology-selected node set can't
    /// assemble it (spec.md §4.4 step 3: "if the result cannot be
    /// assembled, skip"). Callers that just need "did it work" can ignore
    /// the distinction and treat either as "stays PENDING."
    pub fn try_allocate(&mut self, cpus: u32, mem_mb: u64) -> Result<Allocation, SchedulerError> {
        if self.free_cpus() < cpus || self.free_mem_mb() < mem_mb {
            return Err(SchedulerError::InsufficientResources {
                requested_cpus: cpus,
                requested_mem_mb: mem_mb,
                free_cpus: self.free_cpus(),
                free_mem_mb: self.free_mem_mb(),
            });
        }

        let available_nodes = self.candidate_nodes(1);
        let mut nodes_by_locality = self.topology.select_nodes(available_nodes.len(), &available_nodes);
        if nodes_by_locality.is_empty() {
            nodes_by_locality = available_nodes;
        }

        let mut picked_cores = Vec::new();
        let mut picked_nodes = Vec::new();
        let mut mem_remaining = mem_mb;

        for node_name in nodes_by_locality {
            if picked_cores.len() as u32 >= cpus && mem_remaining == 0 {
                break;
            }
            let Some(node) = self.nodes.get(&node_name) else {
                continue;
            };
            let free_here: Vec<usize> = node
                .core_ids
                .iter()
                .copied()
                .filter(|&c| !self.core_busy[c])
                .collect();
            if free_here.is_empty() && node.free_mem_mb() == 0 {
                continue;
            }

            let need = (cpus as usize).saturating_sub(picked_cores.len());
            let take = free_here.into_iter().take(need);
            let mut took_any = false;
            for c in take {
                picked_cores.push(c);
                took_any = true;
            }
            let mem_take = mem_remaining.min(node.free_mem_mb());
            if mem_take > 0 {
                took_any = true;
            }
            mem_remaining = mem_remaining.saturating_sub(mem_take);
            if took_any {
                picked_nodes.push(node_name.clone());
            }
        }

        if picked_cores.len() < cpus as usize || mem_remaining > 0 {
            return Err(SchedulerError::NoFeasiblePlacement);
        }

        for &c in &picked_cores {
            self.core_busy[c] = true;
        }
        let per_node_mem = mem_mb / picked_nodes.len().max(1) as u64;
        let mut leftover = mem_mb - per_node_mem * picked_nodes.len() as u64;
        for node_name in &picked_nodes {
            if let Some(node) = self.nodes.get_mut(node_name) {
                let mut take = per_node_mem;
                if leftover > 0 {
                    take += 1;
                    leftover -= 1;
                }
                node.mem_used_mb += take;
            }
        }

        Ok(Allocation {
            nodes: picked_nodes,
            core_ids: picked_cores,
            mem_mb,
        })
    }

    /// Adds or removes CPU cores from a live allocation for elastic scaling.
    /// Returns the updated core id set, or `None` if growth could not be
    /// satisfied (shrink always succeeds).
    pub fn try_resize(&mut self, alloc: &mut Allocation, new_cpus: u32) -> bool {
        let current = alloc.core_ids.len() as u32;
        if new_cpus == current {
            return true;
        }
        if new_cpus < current {
            let drop_count = (current - new_cpus) as usize;
            for _ in 0..drop_count {
                if let Some(c) = alloc.core_ids.pop() {
                    self.core_busy[c] = false;
                }
            }
            return true;
        }

        let grow = (new_cpus - current) as usize;
        let mut added = Vec::new();
        'outer: for node_name in &alloc.nodes {
            if let Some(node) = self.nodes.get(node_name) {
                for &c in &node.core_ids {
                    if !self.core_busy[c] && !alloc.core_ids.contains(&c) {
                        added.push(c);
                        if added.len() == grow {
                            break 'outer;
                        }
                    }
                }
            }
        }
        if added.len() < grow {
            return false;
        }
        for c in &added {
            self.core_busy[*c] = true;
        }
        alloc.core_ids.extend(added);
        true
    }

    pub fn free(&mut self, alloc: &Allocation) {
        for &c in &alloc.core_ids {
            self.core_busy[c] = false;
        }
        let per_node_mem = alloc.mem_mb / alloc.nodes.len().max(1) as u64;
        for node_name in &alloc.nodes {
            if let Some(node) = self.nodes.get_mut(node_name) {
                node.mem_used_mb = node.mem_used_mb.saturating_sub(per_node_mem);
            }
        }
    }
}
