use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tokio::sync::{Mutex, RwLock};
use tokio::time::{Duration, Instant};
use tracing::{info, warn};

use super::placement::NodeSnapshot;
use crate::protocol::{HeartbeatPayload, RegisterRequest};

/// Resources a single task holds on a node.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TaskAllocation {
    pub cores: u32,
    pub memory_bytes: u64,
    pub gpu_indices: Vec<u32>,
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("unknown node {0}")]
    UnknownNode(String),
    #[error("node {node}: {what} demand exceeds capacity")]
    Insufficient { node: String, what: &'static str },
    #[error("node {node}: GPU {gpu} is already allocated")]
    GpuConflict { node: String, gpu: u32 },
}

#[derive(Debug)]
struct NodeEntry {
    hostname: String,
    url: String,
    physical_ip: String,
    total_cores: u32,
    memory_total_bytes: u64,
    numa_node_ids: HashSet<u32>,
    all_gpu_indices: HashSet<u32>,
    vm_capable: bool,
    vfio_pci_addrs: HashSet<String>,
    online: bool,
    last_heartbeat: Instant,
    health: Option<HeartbeatPayload>,
    allocations: HashMap<i64, TaskAllocation>,
}

impl NodeEntry {
    fn allocated_cores(&self) -> u32 {
        self.allocations.values().map(|a| a.cores).sum()
    }

    fn allocated_memory(&self) -> u64 {
        self.allocations.values().map(|a| a.memory_bytes).sum()
    }

    fn allocated_gpus(&self) -> HashSet<u32> {
        self.allocations
            .values()
            .flat_map(|a| a.gpu_indices.iter().copied())
            .collect()
    }

    fn snapshot(&self) -> NodeSnapshot {
        let allocated = self.allocated_gpus();
        NodeSnapshot {
            hostname: self.hostname.clone(),
            online: self.online,
            total_cores: self.total_cores,
            allocated_cores: self.allocated_cores(),
            memory_total_bytes: self.memory_total_bytes,
            allocated_memory_bytes: self.allocated_memory(),
            free_gpu_indices: self
                .all_gpu_indices
                .difference(&allocated)
                .copied()
                .collect(),
            all_gpu_indices: self.all_gpu_indices.clone(),
            numa_node_ids: self.numa_node_ids.clone(),
            vm_capable: self.vm_capable,
            vfio_pci_addrs: self.vfio_pci_addrs.clone(),
        }
    }
}

/// Live node table. The outer RwLock guards map shape only; per-node state
/// sits behind its own mutex so heartbeats from different nodes interleave
/// freely while heartbeats from one node stay ordered.
#[derive(Default)]
pub struct NodeRegistry {
    nodes: RwLock<HashMap<String, Arc<Mutex<NodeEntry>>>>,
}

impl NodeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert or refresh a node. Existing task allocations survive
    /// re-registration (the runner may have live VPS containers).
    pub async fn register(&self, req: &RegisterRequest) {
        let mut nodes = self.nodes.write().await;
        match nodes.get(&req.hostname) {
            Some(entry) => {
                let mut e = entry.lock().await;
                e.url = req.url.clone();
                e.physical_ip = req.physical_ip.clone();
                e.total_cores = req.total_cores;
                e.memory_total_bytes = req.memory_total_bytes;
                e.numa_node_ids = req.numa_topology.iter().map(|n| n.id).collect();
                e.all_gpu_indices = req.gpu_info.iter().map(|g| g.gpu_id).collect();
                e.vm_capable = req.vm_capable;
                e.vfio_pci_addrs = req.vfio_gpus.iter().map(|g| g.pci_addr.clone()).collect();
                e.online = true;
                e.last_heartbeat = Instant::now();
                info!(node = %req.hostname, "Node re-registered");
            }
            None => {
                nodes.insert(
                    req.hostname.clone(),
                    Arc::new(Mutex::new(NodeEntry {
                        hostname: req.hostname.clone(),
                        url: req.url.clone(),
                        physical_ip: req.physical_ip.clone(),
                        total_cores: req.total_cores,
                        memory_total_bytes: req.memory_total_bytes,
                        numa_node_ids: req.numa_topology.iter().map(|n| n.id).collect(),
                        all_gpu_indices: req.gpu_info.iter().map(|g| g.gpu_id).collect(),
                        vm_capable: req.vm_capable,
                        vfio_pci_addrs: req
                            .vfio_gpus
                            .iter()
                            .map(|g| g.pci_addr.clone())
                            .collect(),
                        online: true,
                        last_heartbeat: Instant::now(),
                        health: None,
                        allocations: HashMap::new(),
                    })),
                );
                info!(node = %req.hostname, cores = req.total_cores, "Node registered");
            }
        }
    }

    async fn entry(&self, hostname: &str) -> Result<Arc<Mutex<NodeEntry>>, RegistryError> {
        self.nodes
            .read()
            .await
            .get(hostname)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownNode(hostname.to_string()))
    }

    /// Record a heartbeat: liveness stamp plus latest health sample.
    pub async fn heartbeat(
        &self,
        hostname: &str,
        payload: HeartbeatPayload,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(hostname).await?;
        let mut e = entry.lock().await;
        e.online = true;
        e.last_heartbeat = Instant::now();
        e.health = Some(payload);
        Ok(())
    }

    /// Reserve resources for a task. Enforces the node invariants:
    /// `allocated <= total` for cores and memory, GPU indices disjoint
    /// across tasks. Re-allocating the same task id is idempotent.
    pub async fn allocate(
        &self,
        hostname: &str,
        task_id: i64,
        alloc: TaskAllocation,
    ) -> Result<(), RegistryError> {
        let entry = self.entry(hostname).await?;
        let mut e = entry.lock().await;

        if let Some(existing) = e.allocations.get(&task_id) {
            if *existing == alloc {
                return Ok(());
            }
        }

        if e.allocated_cores() + alloc.cores > e.total_cores {
            return Err(RegistryError::Insufficient {
                node: hostname.to_string(),
                what: "core",
            });
        }
        if e.allocated_memory() + alloc.memory_bytes > e.memory_total_bytes {
            return Err(RegistryError::Insufficient {
                node: hostname.to_string(),
                what: "memory",
            });
        }
        let taken = e.allocated_gpus();
        for gpu in &alloc.gpu_indices {
            if !e.all_gpu_indices.contains(gpu) {
                return Err(RegistryError::Insufficient {
                    node: hostname.to_string(),
                    what: "gpu",
                });
            }
            if taken.contains(gpu) {
                return Err(RegistryError::GpuConflict {
                    node: hostname.to_string(),
                    gpu: *gpu,
                });
            }
        }

        e.allocations.insert(task_id, alloc);
        Ok(())
    }

    /// Release a task's resources. Idempotent; unknown node is a no-op
    /// (the node may have been dropped already).
    pub async fn free(&self, hostname: &str, task_id: i64) {
        if let Ok(entry) = self.entry(hostname).await {
            let mut e = entry.lock().await;
            if e.allocations.remove(&task_id).is_some() {
                info!(node = %hostname, task = task_id, "Freed task resources");
            }
        }
    }

    /// Nodes whose last heartbeat is older than `timeout`; marks them
    /// offline and returns their names for lost-task processing.
    pub async fn check_timeouts(&self, timeout: Duration) -> Vec<String> {
        let nodes = self.nodes.read().await;
        let mut timed_out = Vec::new();
        for entry in nodes.values() {
            let mut e = entry.lock().await;
            if e.online && e.last_heartbeat.elapsed() > timeout {
                e.online = false;
                warn!(node = %e.hostname, "Node missed heartbeats, marking offline");
                timed_out.push(e.hostname.clone());
            }
        }
        timed_out
    }

    pub async fn snapshots(&self) -> Vec<NodeSnapshot> {
        let nodes = self.nodes.read().await;
        let mut out = Vec::with_capacity(nodes.len());
        for entry in nodes.values() {
            out.push(entry.lock().await.snapshot());
        }
        out.sort_by(|a, b| a.hostname.cmp(&b.hostname));
        out
    }

    pub async fn snapshot_of(&self, hostname: &str) -> Option<NodeSnapshot> {
        let entry = self.entry(hostname).await.ok()?;
        let e = entry.lock().await;
        Some(e.snapshot())
    }

    pub async fn url_of(&self, hostname: &str) -> Option<String> {
        let entry = self.entry(hostname).await.ok()?;
        let value = entry.lock().await.url.clone();
        Some(value)
    }

    pub async fn physical_ip_of(&self, hostname: &str) -> Option<String> {
        let entry = self.entry(hostname).await.ok()?;
        let value = entry.lock().await.physical_ip.clone();
        Some(value)
    }

    pub async fn health_of(&self, hostname: &str) -> Option<HeartbeatPayload> {
        let entry = self.entry(hostname).await.ok()?;
        let value = entry.lock().await.health.clone();
        value
    }

    pub async fn online_names(&self) -> HashSet<String> {
        let nodes = self.nodes.read().await;
        let mut out = HashSet::new();
        for entry in nodes.values() {
            let e = entry.lock().await;
            if e.online {
                out.insert(e.hostname.clone());
            }
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{GpuInfo, NumaNodeInfo, VfioGpu};

    fn register_req(hostname: &str, cores: u32, gpus: u32) -> RegisterRequest {
        RegisterRequest {
            hostname: hostname.into(),
            url: format!("http://{hostname}:8001"),
            physical_ip: "192.168.1.10".into(),
            total_cores: cores,
            memory_total_bytes: 16 << 30,
            numa_topology: vec![NumaNodeInfo {
                id: 0,
                cpus: (0..cores).collect(),
                memory_mb: 16384,
            }],
            gpu_info: (0..gpus)
                .map(|i| GpuInfo {
                    gpu_id: i,
                    name: "test".into(),
                    memory_total_mib: 8192,
                    memory_used_mib: 0,
                    utilization_percent: 0.0,
                    temperature_c: 0.0,
                    vm_task_id: None,
                    vfio_bound: false,
                })
                .collect(),
            vm_capable: false,
            vfio_gpus: Vec::<VfioGpu>::new(),
            runner_version: "0.1.0".into(),
        }
    }

    fn alloc(cores: u32, mem: u64, gpus: &[u32]) -> TaskAllocation {
        TaskAllocation {
            cores,
            memory_bytes: mem,
            gpu_indices: gpus.to_vec(),
        }
    }

    #[tokio::test]
    async fn allocate_and_free_round_trip() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 2)).await;

        reg.allocate("node1", 1, alloc(4, 1 << 30, &[0])).await.unwrap();
        let snap = reg.snapshot_of("node1").await.unwrap();
        assert_eq!(snap.available_cores(), 4);
        assert_eq!(snap.free_gpu_indices, [1].into());

        reg.free("node1", 1).await;
        let snap = reg.snapshot_of("node1").await.unwrap();
        assert_eq!(snap.available_cores(), 8);
        assert_eq!(snap.free_gpu_indices, [0, 1].into());
    }

    #[tokio::test]
    async fn over_allocation_rejected() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        reg.allocate("node1", 1, alloc(6, 0, &[])).await.unwrap();

        let err = reg.allocate("node1", 2, alloc(4, 0, &[])).await.unwrap_err();
        assert!(matches!(err, RegistryError::Insufficient { what: "core", .. }));

        // Invariant holds after the rejected call.
        let snap = reg.snapshot_of("node1").await.unwrap();
        assert!(snap.allocated_cores <= snap.total_cores);
        assert_eq!(snap.allocated_cores, 6);
    }

    #[tokio::test]
    async fn memory_over_allocation_rejected() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        let err = reg
            .allocate("node1", 1, alloc(1, 32 << 30, &[]))
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::Insufficient { what: "memory", .. }));
    }

    #[tokio::test]
    async fn gpu_collision_rejected() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 2)).await;
        reg.allocate("node1", 1, alloc(1, 0, &[0])).await.unwrap();

        let err = reg.allocate("node1", 2, alloc(1, 0, &[0, 1])).await.unwrap_err();
        assert!(matches!(err, RegistryError::GpuConflict { gpu: 0, .. }));

        // GPU 1 alone is still fine.
        reg.allocate("node1", 2, alloc(1, 0, &[1])).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_gpu_index_rejected() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 1)).await;
        let err = reg.allocate("node1", 1, alloc(1, 0, &[5])).await.unwrap_err();
        assert!(matches!(err, RegistryError::Insufficient { what: "gpu", .. }));
    }

    #[tokio::test]
    async fn reallocate_same_task_is_idempotent() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        let a = alloc(5, 0, &[]);
        reg.allocate("node1", 1, a.clone()).await.unwrap();
        reg.allocate("node1", 1, a).await.unwrap();
        assert_eq!(reg.snapshot_of("node1").await.unwrap().allocated_cores, 5);
    }

    #[tokio::test]
    async fn free_is_idempotent_and_tolerates_unknown_node() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        reg.free("node1", 99).await;
        reg.free("nowhere", 99).await;
    }

    #[tokio::test(start_paused = true)]
    async fn heartbeat_timeout_marks_offline() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        reg.register(&register_req("node2", 8, 0)).await;

        tokio::time::advance(Duration::from_secs(10)).await;
        reg.heartbeat("node2", HeartbeatPayload::default()).await.unwrap();

        tokio::time::advance(Duration::from_secs(25)).await;
        let dead = reg.check_timeouts(Duration::from_secs(30)).await;
        assert_eq!(dead, vec!["node1".to_string()]);

        assert!(!reg.snapshot_of("node1").await.unwrap().online);
        assert!(reg.snapshot_of("node2").await.unwrap().online);

        // Second scan reports nothing new.
        assert!(reg.check_timeouts(Duration::from_secs(30)).await.is_empty());
    }

    #[tokio::test]
    async fn heartbeat_from_unknown_node_is_an_error() {
        let reg = NodeRegistry::new();
        let err = reg
            .heartbeat("ghost", HeartbeatPayload::default())
            .await
            .unwrap_err();
        assert!(matches!(err, RegistryError::UnknownNode(_)));
    }

    #[tokio::test]
    async fn reregistration_keeps_allocations() {
        let reg = NodeRegistry::new();
        reg.register(&register_req("node1", 8, 0)).await;
        reg.allocate("node1", 1, alloc(4, 0, &[])).await.unwrap();

        reg.register(&register_req("node1", 8, 0)).await;
        assert_eq!(reg.snapshot_of("node1").await.unwrap().allocated_cores, 4);
    }
}
