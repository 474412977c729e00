use serde::Serialize;
use sqlx::FromRow;

use crate::protocol::{GpuInfo, NumaNodeInfo, VfioGpu};
use crate::scheduler::state::{TaskStatus, TaskType, VpsBackend};

/// Durable task record. List-valued fields are JSON text columns; the typed
/// accessors below decode them.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct TaskRecord {
    pub task_id: i64,
    pub task_type: String,
    pub vps_backend: Option<String>,
    pub status: String,
    pub owner: String,
    pub owner_role: String,

    pub required_cores: i64,
    pub required_memory_bytes: Option<i64>,
    pub required_gpus: String,
    pub target_numa_node_id: Option<i64>,

    pub target_hostname: Option<String>,
    pub reserved_ip: Option<String>,
    pub ip_reservation_token: Option<String>,

    pub command: Option<String>,
    pub arguments: String,
    pub env_vars: String,
    pub working_dir: Option<String>,
    pub privileged: bool,
    pub mounts: String,

    pub container_name: Option<String>,
    pub registry_image: Option<String>,

    pub vm_image: Option<String>,
    pub vm_disk_size_gb: Option<i64>,
    pub memory_mb: Option<i64>,

    pub ssh_key_mode: Option<String>,
    pub ssh_public_key: Option<String>,
    pub ssh_port: Option<i64>,
    pub host_ssh_port: Option<i64>,

    pub assigned_node: Option<String>,
    pub exit_code: Option<i64>,
    pub error_message: Option<String>,
    pub stdout_path: Option<String>,
    pub stderr_path: Option<String>,
    pub assignment_suspicion_count: i64,

    pub created_at: String,
    pub assigned_at: Option<String>,
    pub started_at: Option<String>,
    pub completed_at: Option<String>,
}

impl TaskRecord {
    pub fn status(&self) -> TaskStatus {
        TaskStatus::parse(&self.status).unwrap_or(TaskStatus::Failed)
    }

    pub fn task_type(&self) -> TaskType {
        TaskType::parse(&self.task_type).unwrap_or(TaskType::Command)
    }

    pub fn vps_backend(&self) -> Option<VpsBackend> {
        self.vps_backend.as_deref().and_then(VpsBackend::parse)
    }

    /// GPU demand as stored: indices for container tasks, PCI addresses for
    /// QEMU VPS tasks.
    pub fn gpus(&self) -> Vec<String> {
        serde_json::from_str(&self.required_gpus).unwrap_or_default()
    }

    /// GPU demand as device indices. Non-numeric entries (PCI addresses)
    /// are skipped.
    pub fn gpu_indices(&self) -> Vec<u32> {
        self.gpus().iter().filter_map(|g| g.parse().ok()).collect()
    }

    pub fn arguments(&self) -> Vec<String> {
        serde_json::from_str(&self.arguments).unwrap_or_default()
    }

    pub fn env_vars(&self) -> std::collections::HashMap<String, String> {
        serde_json::from_str(&self.env_vars).unwrap_or_default()
    }

    pub fn mounts(&self) -> Vec<crate::protocol::MountSpec> {
        serde_json::from_str(&self.mounts).unwrap_or_default()
    }
}

/// Durable node registration record.
#[derive(Debug, Clone, Serialize, FromRow)]
pub struct NodeRecord {
    pub hostname: String,
    pub url: String,
    pub physical_ip: String,
    pub total_cores: i64,
    pub memory_total_bytes: i64,
    pub numa_topology: String,
    pub gpu_info: String,
    pub vm_capable: bool,
    pub vfio_gpus: String,
    pub runner_version: String,
    pub status: String,
    pub last_heartbeat: Option<String>,
    pub registered_at: String,
}

impl NodeRecord {
    pub fn numa_topology(&self) -> Vec<NumaNodeInfo> {
        serde_json::from_str(&self.numa_topology).unwrap_or_default()
    }

    pub fn gpu_info(&self) -> Vec<GpuInfo> {
        serde_json::from_str(&self.gpu_info).unwrap_or_default()
    }

    pub fn vfio_gpus(&self) -> Vec<VfioGpu> {
        serde_json::from_str(&self.vfio_gpus).unwrap_or_default()
    }

    pub fn is_online(&self) -> bool {
        self.status == "online"
    }
}
