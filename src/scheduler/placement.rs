use std::collections::HashSet;

use serde::Serialize;

/// Point-in-time view of one node, as the placement filter sees it.
#[derive(Debug, Clone, Serialize)]
pub struct NodeSnapshot {
    pub hostname: String,
    pub online: bool,
    pub total_cores: u32,
    pub allocated_cores: u32,
    pub memory_total_bytes: u64,
    pub allocated_memory_bytes: u64,
    /// GPU indices not allocated to any task.
    pub free_gpu_indices: HashSet<u32>,
    /// Every GPU index the node reported, allocated or not.
    pub all_gpu_indices: HashSet<u32>,
    pub numa_node_ids: HashSet<u32>,
    pub vm_capable: bool,
    pub vfio_pci_addrs: HashSet<String>,
}

impl NodeSnapshot {
    pub fn available_cores(&self) -> u32 {
        self.total_cores.saturating_sub(self.allocated_cores)
    }

    pub fn available_memory_bytes(&self) -> u64 {
        self.memory_total_bytes
            .saturating_sub(self.allocated_memory_bytes)
    }
}

/// What a task asks for.
#[derive(Debug, Clone, Default)]
pub struct ResourceDemand {
    pub cores: u32,
    pub memory_bytes: Option<u64>,
    /// Container tasks: device indices that must all be free.
    pub gpu_indices: Vec<u32>,
    /// VM tasks: PCI addresses that must all be VFIO-capable on the node.
    pub vfio_pci_addrs: Vec<String>,
    pub numa_node_id: Option<u32>,
    pub needs_vm: bool,
    /// Pin to a specific node (explicit target or reservation-derived).
    pub target_hostname: Option<String>,
}

fn fits(node: &NodeSnapshot, demand: &ResourceDemand) -> bool {
    if !node.online {
        return false;
    }
    if let Some(target) = &demand.target_hostname {
        if &node.hostname != target {
            return false;
        }
    }
    if node.available_cores() < demand.cores {
        return false;
    }
    if !demand
        .gpu_indices
        .iter()
        .all(|g| node.free_gpu_indices.contains(g))
    {
        return false;
    }
    if let Some(mem) = demand.memory_bytes {
        if node.available_memory_bytes() < mem {
            return false;
        }
    }
    if let Some(numa) = demand.numa_node_id {
        if !node.numa_node_ids.contains(&numa) {
            return false;
        }
    }
    if demand.needs_vm {
        if !node.vm_capable {
            return false;
        }
        if !demand
            .vfio_pci_addrs
            .iter()
            .all(|addr| node.vfio_pci_addrs.contains(addr))
        {
            return false;
        }
    }
    true
}

/// First-fit over survivors sorted by available cores descending: the
/// emptiest node wins, keeping load spread without a utilization model.
pub fn find_suitable_node<'a>(
    nodes: &'a [NodeSnapshot],
    demand: &ResourceDemand,
) -> Option<&'a NodeSnapshot> {
    let mut survivors: Vec<&NodeSnapshot> = nodes.iter().filter(|n| fits(n, demand)).collect();
    survivors.sort_by(|a, b| b.available_cores().cmp(&a.available_cores()));
    survivors.first().copied()
}
