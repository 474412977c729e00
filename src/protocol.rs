//! Wire types shared by the Host API, the Runner API, and the CLI-facing
//! submission surface. Everything here is plain serde data — no behavior.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

use crate::scheduler::state::{TaskStatus, TaskType, VpsBackend};

// ---- node inventory ----

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct NumaNodeInfo {
    pub id: u32,
    pub cpus: Vec<u32>,
    pub memory_mb: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GpuInfo {
    pub gpu_id: u32,
    pub name: String,
    pub memory_total_mib: u64,
    #[serde(default)]
    pub memory_used_mib: u64,
    #[serde(default)]
    pub utilization_percent: f64,
    #[serde(default)]
    pub temperature_c: f64,
    /// Set while the GPU is passed through to a VM task.
    #[serde(default)]
    pub vm_task_id: Option<i64>,
    #[serde(default)]
    pub vfio_bound: bool,
}

/// A GPU that can be handed to a VM via VFIO, with the audio functions that
/// share its IOMMU group and must move with it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct VfioGpu {
    pub pci_addr: String,
    pub iommu_group: String,
    pub model: String,
    #[serde(default)]
    pub audio_companions: Vec<String>,
}

// ---- registration ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub hostname: String,
    pub url: String,
    pub physical_ip: String,
    pub total_cores: u32,
    pub memory_total_bytes: u64,
    #[serde(default)]
    pub numa_topology: Vec<NumaNodeInfo>,
    #[serde(default)]
    pub gpu_info: Vec<GpuInfo>,
    #[serde(default)]
    pub vm_capable: bool,
    #[serde(default)]
    pub vfio_gpus: Vec<VfioGpu>,
    pub runner_version: String,
}

/// Overlay parameters assigned to a runner at registration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OverlayAssignment {
    pub runner_id: u32,
    /// Runner-side CIDR, e.g. "10.128.64.0/18".
    pub runner_subnet: String,
    /// Gateway the runner assigns to its kohaku-overlay bridge.
    pub runner_gateway_ip: String,
    /// Host-side endpoint inside the runner subnet.
    pub host_vxlan_ip: String,
    pub vxlan_vni: u32,
    /// Physical address the runner points its VXLAN remote at.
    pub host_physical_ip: String,
    /// Root overlay CIDR, routed back through the Host (hub).
    pub overlay_cidr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterResponse {
    pub hostname: String,
    #[serde(default)]
    pub overlay: Option<OverlayAssignment>,
}

// ---- heartbeat ----

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct MemoryStats {
    pub used: u64,
    pub total: u64,
    pub percent: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct TemperatureStats {
    pub avg: f64,
    pub max: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HeartbeatPayload {
    pub cpu_percent: f64,
    pub memory: MemoryStats,
    #[serde(default)]
    pub temperature: Option<TemperatureStats>,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
    /// Tasks the runner believes are currently executing.
    #[serde(default)]
    pub running_task_ids: Vec<i64>,
    /// Tasks the runner killed since the last heartbeat (e.g. OOM).
    #[serde(default)]
    pub killed_task_ids: Vec<i64>,
}

// ---- submission ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MountSpec {
    pub source: String,
    pub target: String,
    #[serde(default)]
    pub read_only: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SshKeyMode {
    Disabled,
    Generate,
    Upload,
    None,
}

impl SshKeyMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            SshKeyMode::Disabled => "disabled",
            SshKeyMode::Generate => "generate",
            SshKeyMode::Upload => "upload",
            SshKeyMode::None => "none",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "disabled" => Some(SshKeyMode::Disabled),
            "generate" => Some(SshKeyMode::Generate),
            "upload" => Some(SshKeyMode::Upload),
            "none" => Some(SshKeyMode::None),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitRequest {
    pub task_type: TaskType,
    #[serde(default)]
    pub vps_backend: Option<VpsBackend>,
    #[serde(default)]
    pub owner: Option<String>,
    /// Role of the submitter; `user` submissions are gated behind approval
    /// when auth is enabled.
    #[serde(default)]
    pub owner_role: Option<String>,

    #[serde(default)]
    pub required_cores: u32,
    #[serde(default)]
    pub required_memory_bytes: Option<u64>,
    /// GPU indices for container tasks, PCI addresses for QEMU VPS tasks.
    #[serde(default)]
    pub required_gpus: Vec<String>,
    #[serde(default)]
    pub target_numa_node_id: Option<u32>,

    #[serde(default)]
    pub target_hostname: Option<String>,
    #[serde(default)]
    pub reserved_ip: Option<String>,
    #[serde(default)]
    pub ip_reservation_token: Option<String>,

    #[serde(default)]
    pub command: Option<String>,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,

    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub registry_image: Option<String>,

    #[serde(default)]
    pub vm_image: Option<String>,
    #[serde(default)]
    pub vm_disk_size_gb: Option<u32>,
    #[serde(default)]
    pub memory_mb: Option<u64>,

    #[serde(default)]
    pub ssh_key_mode: Option<SshKeyMode>,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubmitResponse {
    pub task_id: i64,
    pub status: TaskStatus,
}

// ---- dispatch (Host -> Runner) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecuteRequest {
    pub task_id: i64,
    pub command: String,
    #[serde(default)]
    pub arguments: Vec<String>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    #[serde(default)]
    pub required_cores: u32,
    #[serde(default)]
    pub required_memory_bytes: Option<u64>,
    #[serde(default)]
    pub gpu_indices: Vec<u32>,
    #[serde(default)]
    pub target_numa_node_id: Option<u32>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub registry_image: Option<String>,
    #[serde(default)]
    pub privileged: bool,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    #[serde(default)]
    pub reserved_ip: Option<String>,
    #[serde(default)]
    pub ip_reservation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsCreateRequest {
    pub task_id: i64,
    pub backend: VpsBackend,
    #[serde(default)]
    pub required_cores: u32,
    #[serde(default)]
    pub required_memory_bytes: Option<u64>,
    #[serde(default)]
    pub memory_mb: Option<u64>,
    /// Indices (docker) or PCI addresses (qemu).
    #[serde(default)]
    pub gpus: Vec<String>,
    #[serde(default)]
    pub container_name: Option<String>,
    #[serde(default)]
    pub registry_image: Option<String>,
    #[serde(default)]
    pub vm_image: Option<String>,
    #[serde(default)]
    pub vm_disk_size_gb: Option<u32>,
    #[serde(default)]
    pub env_vars: HashMap<String, String>,
    #[serde(default)]
    pub mounts: Vec<MountSpec>,
    pub ssh_key_mode: SshKeyMode,
    #[serde(default)]
    pub ssh_public_key: Option<String>,
    #[serde(default)]
    pub reserved_ip: Option<String>,
    #[serde(default)]
    pub ip_reservation_token: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VpsCreateResponse {
    pub task_id: i64,
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub ssh_port: Option<u16>,
    /// Present exactly once, for `ssh_key_mode = generate`. Never stored.
    #[serde(default)]
    pub ssh_private_key: Option<String>,
}

// ---- status callbacks (Runner -> Host) ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusUpdate {
    pub task_id: i64,
    pub status: TaskStatus,
    #[serde(default)]
    pub exit_code: Option<i32>,
    #[serde(default)]
    pub error_message: Option<String>,
    #[serde(default)]
    pub stdout_path: Option<String>,
    #[serde(default)]
    pub stderr_path: Option<String>,
}

// ---- VM agent ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmPhoneHome {
    #[serde(default)]
    pub ip: Option<String>,
    #[serde(default)]
    pub hostname: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmHeartbeat {
    pub ip: String,
    #[serde(default)]
    pub uptime_secs: u64,
    #[serde(default)]
    pub gpus: Vec<GpuInfo>,
}

// ---- snapshots ----

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotInfo {
    pub task_id: i64,
    pub image_tag: String,
    pub created_at: String,
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SnapshotCreateRequest {
    #[serde(default)]
    pub message: Option<String>,
}
