pub mod placement;
pub mod registry;
pub mod state;

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tracing::{error, info, warn};

use crate::config::HostConfig;
use crate::db::models::TaskRecord;
use crate::db::tasks::{self, ResultFields, TaskStoreError};
use crate::db::{nodes as node_store, Database};
use crate::ids::TaskIdGenerator;
use crate::overlay::reservation::IpReservationService;
use crate::overlay::OverlayManager;
use crate::protocol::{
    ExecuteRequest, HeartbeatPayload, SubmitRequest, SubmitResponse, TaskStatusUpdate,
    VpsCreateRequest, VpsCreateResponse,
};
use placement::{find_suitable_node, NodeSnapshot, ResourceDemand};
use registry::{NodeRegistry, TaskAllocation};
use state::{TaskStatus, TaskType, VpsBackend};

/// How many consecutive heartbeat mismatches demote a task to lost.
const SUSPICION_LIMIT: i64 = 3;

/// Submission/command errors, mapped to HTTP statuses by the API layer.
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("{0}")]
    Validation(String),
    #[error("task {0} not found")]
    NotFound(i64),
    #[error("invalid state for this operation: task is {0}")]
    WrongState(TaskStatus),
    #[error("no suitable node: {0}")]
    NoSuitableNode(String),
    #[error("runner request failed: {0}")]
    RunnerUnreachable(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl From<TaskStoreError> for SchedulerError {
    fn from(e: TaskStoreError) -> Self {
        match e {
            TaskStoreError::NotFound(id) => SchedulerError::NotFound(id),
            TaskStoreError::InvalidTransition(t) => SchedulerError::WrongState(t.from),
            TaskStoreError::Db(e) => SchedulerError::Internal(e.into()),
        }
    }
}

impl From<sqlx::Error> for SchedulerError {
    fn from(e: sqlx::Error) -> Self {
        SchedulerError::Internal(e.into())
    }
}

/// The placement decision for one task, computed before any network I/O.
#[derive(Debug)]
pub struct DispatchPlan {
    pub hostname: String,
    pub runner_url: String,
    pub allocation: TaskAllocation,
}

/// Central orchestration service: owns task lifecycle, placement, and the
/// reconciliation driven by runner heartbeats.
///
/// Cloning is cheap — clones share the same underlying data via Arc.
#[derive(Clone)]
pub struct Scheduler {
    pub db: Database,
    pub registry: Arc<NodeRegistry>,
    pub overlay: Arc<OverlayManager>,
    pub reservations: Arc<IpReservationService>,
    ids: Arc<TaskIdGenerator>,
    http: reqwest::Client,
    config: Arc<HostConfig>,
}

impl Scheduler {
    pub async fn new(
        db: Database,
        registry: Arc<NodeRegistry>,
        overlay: Arc<OverlayManager>,
        reservations: Arc<IpReservationService>,
        config: HostConfig,
    ) -> anyhow::Result<Self> {
        let floor = tasks::last_task_id(&db.pool).await?;
        Ok(Self {
            db,
            registry,
            overlay,
            reservations,
            ids: Arc::new(TaskIdGenerator::new(floor)),
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(30))
                .build()?,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &HostConfig {
        &self.config
    }

    /// Docker container name (or VM id) a task's workload runs under. Also
    /// the key reservations are bound to.
    pub fn container_id_for(task: &TaskRecord) -> String {
        match (task.task_type(), task.vps_backend()) {
            (TaskType::Vps, Some(VpsBackend::Qemu)) => format!("vm-{}", task.task_id),
            (TaskType::Vps, _) => format!("kohakuriver-vps-{}", task.task_id),
            (TaskType::Command, _) => format!("kohakuriver-task-{}", task.task_id),
        }
    }

    // ---- submission ----

    /// Validate and persist a submission. Dispatch happens asynchronously
    /// (the dispatch loop) unless the caller drives it inline (VPS create).
    pub async fn submit(&self, mut req: SubmitRequest) -> Result<SubmitResponse, SchedulerError> {
        self.validate_submission(&mut req).await?;

        let status = if self.config.auth_enabled && req.owner_role.as_deref() == Some("user") {
            TaskStatus::PendingApproval
        } else {
            TaskStatus::Pending
        };

        let task_id = self.ids.next();
        tasks::store_last_task_id(&self.db.pool, task_id).await?;
        tasks::insert(&self.db.pool, task_id as i64, status, &req).await?;

        info!(task = task_id, status = %status, task_type = %req.task_type, "Task submitted");
        Ok(SubmitResponse {
            task_id: task_id as i64,
            status,
        })
    }

    async fn validate_submission(&self, req: &mut SubmitRequest) -> Result<(), SchedulerError> {
        match req.task_type {
            TaskType::Command => {
                if req.command.as_deref().unwrap_or("").is_empty() {
                    return Err(SchedulerError::Validation(
                        "command tasks require a command".into(),
                    ));
                }
            }
            TaskType::Vps => {
                let backend = req.vps_backend.ok_or_else(|| {
                    SchedulerError::Validation("vps tasks require a vps_backend".into())
                })?;
                match backend {
                    VpsBackend::Docker => {
                        if req.container_name.is_none() && req.registry_image.is_none() {
                            return Err(SchedulerError::Validation(
                                "docker vps requires container_name or registry_image".into(),
                            ));
                        }
                    }
                    VpsBackend::Qemu => {
                        if req.vm_image.is_none() {
                            return Err(SchedulerError::Validation(
                                "qemu vps requires vm_image".into(),
                            ));
                        }
                    }
                }
            }
        }

        // A reservation pins the task to the reservation's runner. A
        // conflicting explicit target is a validation error, not a silent
        // override.
        if let Some(token) = req.ip_reservation_token.clone() {
            let payload = self
                .reservations
                .validate(&token, None)
                .await
                .map_err(|e| SchedulerError::Validation(format!("ip reservation: {e}")))?;
            if let Some(target) = &req.target_hostname {
                if *target != payload.runner {
                    return Err(SchedulerError::Validation(format!(
                        "reservation is for runner {}, but target_hostname is {target}",
                        payload.runner
                    )));
                }
            }
            req.target_hostname = Some(payload.runner.clone());
            req.reserved_ip = Some(payload.ip.clone());
        }

        // GPU indices must parse, and must exist on a pinned node. Whether
        // they are currently free is a dispatch concern, not a 400.
        let container_gpus =
            req.task_type == TaskType::Command || req.vps_backend == Some(VpsBackend::Docker);
        if container_gpus {
            for gpu in &req.required_gpus {
                let idx: u32 = gpu.parse().map_err(|_| {
                    SchedulerError::Validation(format!("invalid GPU index {gpu:?}"))
                })?;
                if let Some(target) = &req.target_hostname {
                    if let Some(snap) = self.registry.snapshot_of(target).await {
                        if !snap.all_gpu_indices.contains(&idx) {
                            return Err(SchedulerError::Validation(format!(
                                "GPU index {idx} out of range on {target}"
                            )));
                        }
                    }
                }
            }
        }
        Ok(())
    }

    // ---- approval ----

    pub async fn approve(&self, task_id: i64) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::transition(&self.db.pool, task_id, TaskStatus::Pending, ResultFields::default())
            .await?;
        info!(task = task_id, "Task approved");

        // Command tasks are picked up by the dispatch loop; approved VPS
        // sessions dispatch here (nobody is waiting on the create response
        // anymore, so any generated key material is unreachable — approval
        // flows should use `upload` keys).
        if task.task_type() == TaskType::Vps {
            let scheduler = self.clone();
            let vps_task = task.clone();
            tokio::spawn(async move {
                if let Err(e) = scheduler.dispatch_vps(&vps_task).await {
                    warn!(task = vps_task.task_id, error = %e, "Approved VPS dispatch failed");
                }
            });
        }
        Ok(task)
    }

    pub async fn reject(&self, task_id: i64, reason: Option<String>) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::transition(
            &self.db.pool,
            task_id,
            TaskStatus::Rejected,
            ResultFields {
                error_message: reason.or_else(|| Some("rejected by operator".into())),
                ..Default::default()
            },
        )
        .await?;
        info!(task = task_id, "Task rejected");
        Ok(task)
    }

    // ---- dispatch ----

    fn demand_for(task: &TaskRecord) -> ResourceDemand {
        let is_qemu = task.vps_backend() == Some(VpsBackend::Qemu);
        ResourceDemand {
            cores: task.required_cores as u32,
            memory_bytes: task.required_memory_bytes.map(|b| b as u64),
            gpu_indices: if is_qemu { vec![] } else { task.gpu_indices() },
            vfio_pci_addrs: if is_qemu { task.gpus() } else { vec![] },
            numa_node_id: task.target_numa_node_id.map(|n| n as u32),
            needs_vm: is_qemu,
            target_hostname: task.target_hostname.clone(),
        }
    }

    /// Pick a node and reserve resources for a pending task. Pure planning
    /// plus registry accounting — no network I/O.
    pub async fn prepare_dispatch(&self, task: &TaskRecord) -> Result<DispatchPlan, SchedulerError> {
        let demand = Self::demand_for(task);
        let snapshots = self.registry.snapshots().await;
        let node = find_suitable_node(&snapshots, &demand).ok_or_else(|| {
            SchedulerError::NoSuitableNode(describe_unmet_demand(&demand, &snapshots))
        })?;

        let allocation = TaskAllocation {
            cores: demand.cores,
            memory_bytes: demand.memory_bytes.unwrap_or(0),
            gpu_indices: demand.gpu_indices.clone(),
        };
        self.registry
            .allocate(&node.hostname, task.task_id, allocation.clone())
            .await
            .map_err(|e| SchedulerError::NoSuitableNode(e.to_string()))?;

        let runner_url = self
            .registry
            .url_of(&node.hostname)
            .await
            .ok_or_else(|| SchedulerError::NoSuitableNode("node vanished".into()))?;

        Ok(DispatchPlan {
            hostname: node.hostname.clone(),
            runner_url,
            allocation,
        })
    }

    /// Dispatch one pending command task end to end.
    pub async fn dispatch_command(&self, task: &TaskRecord) -> Result<(), SchedulerError> {
        let plan = match self.prepare_dispatch(task).await {
            Ok(p) => p,
            Err(SchedulerError::NoSuitableNode(reason)) => {
                self.fail_task(task.task_id, &format!("no suitable node: {reason}")).await;
                return Err(SchedulerError::NoSuitableNode(reason));
            }
            Err(e) => return Err(e),
        };

        tasks::assign(&self.db.pool, task.task_id, &plan.hostname).await?;

        let payload = ExecuteRequest {
            task_id: task.task_id,
            command: task.command.clone().unwrap_or_default(),
            arguments: task.arguments(),
            env_vars: task.env_vars(),
            working_dir: task.working_dir.clone(),
            required_cores: task.required_cores as u32,
            required_memory_bytes: task.required_memory_bytes.map(|b| b as u64),
            gpu_indices: task.gpu_indices(),
            target_numa_node_id: task.target_numa_node_id.map(|n| n as u32),
            container_name: task.container_name.clone(),
            registry_image: task.registry_image.clone(),
            privileged: task.privileged,
            mounts: task.mounts(),
            reserved_ip: task.reserved_ip.clone(),
            ip_reservation_token: task.ip_reservation_token.clone(),
        };

        let url = format!("{}/api/execute", plan.runner_url.trim_end_matches('/'));
        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                info!(task = task.task_id, node = %plan.hostname, "Command task dispatched");
                Ok(())
            }
            Ok(resp) => {
                let body = resp.text().await.unwrap_or_default();
                self.abort_dispatch(task.task_id, &plan, &format!("runner refused: {body}"))
                    .await;
                Err(SchedulerError::RunnerUnreachable(body))
            }
            Err(e) => {
                self.abort_dispatch(task.task_id, &plan, &format!("runner unreachable: {e}"))
                    .await;
                Err(SchedulerError::RunnerUnreachable(e.to_string()))
            }
        }
    }

    /// Dispatch a VPS create synchronously and return the runner's response
    /// (it may carry a generated private key, surfaced exactly once).
    pub async fn dispatch_vps(
        &self,
        task: &TaskRecord,
    ) -> Result<VpsCreateResponse, SchedulerError> {
        let plan = match self.prepare_dispatch(task).await {
            Ok(p) => p,
            Err(SchedulerError::NoSuitableNode(reason)) => {
                self.fail_task(task.task_id, &format!("no suitable node: {reason}")).await;
                return Err(SchedulerError::NoSuitableNode(reason));
            }
            Err(e) => return Err(e),
        };

        tasks::assign(&self.db.pool, task.task_id, &plan.hostname).await?;

        let backend = task.vps_backend().unwrap_or(VpsBackend::Docker);

        // VMs on the overlay need an address before boot. When the
        // submission did not bring a reservation, take one now with the
        // long VM TTL and bind it to the VM's container id so terminal
        // cleanup releases it.
        let mut reserved_ip = task.reserved_ip.clone();
        let mut reservation_token = task.ip_reservation_token.clone();
        if backend == VpsBackend::Qemu && reserved_ip.is_none() {
            if let Some(range) = self.overlay.ip_range_for(&plan.hostname).await {
                match self
                    .reservations
                    .reserve(
                        &plan.hostname,
                        range,
                        None,
                        self.config.vm_reservation_ttl_secs,
                    )
                    .await
                {
                    Ok(r) => {
                        let ip = r.ip.to_string();
                        let _ = self
                            .reservations
                            .use_reservation(&r.token, &format!("vm-{}", task.task_id))
                            .await;
                        let _ = tasks::set_reserved_ip(&self.db.pool, task.task_id, &ip).await;
                        reserved_ip = Some(ip);
                        reservation_token = Some(r.token);
                    }
                    Err(e) => {
                        warn!(task = task.task_id, error = %e, "VM IP reservation failed; standard network will be used");
                    }
                }
            }
        }

        let payload = VpsCreateRequest {
            task_id: task.task_id,
            backend,
            required_cores: task.required_cores as u32,
            required_memory_bytes: task.required_memory_bytes.map(|b| b as u64),
            memory_mb: task.memory_mb.map(|m| m as u64),
            gpus: task.gpus(),
            container_name: task.container_name.clone(),
            registry_image: task.registry_image.clone(),
            vm_image: task.vm_image.clone(),
            vm_disk_size_gb: task.vm_disk_size_gb.map(|g| g as u32),
            env_vars: task.env_vars(),
            mounts: task.mounts(),
            ssh_key_mode: task
                .ssh_key_mode
                .as_deref()
                .and_then(crate::protocol::SshKeyMode::parse)
                .unwrap_or(crate::protocol::SshKeyMode::Disabled),
            ssh_public_key: task.ssh_public_key.clone(),
            reserved_ip,
            ip_reservation_token: reservation_token,
        };

        let url = format!("{}/api/vps/create", plan.runner_url.trim_end_matches('/'));
        match self.http.post(&url).json(&payload).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: VpsCreateResponse = resp
                    .json()
                    .await
                    .map_err(|e| SchedulerError::RunnerUnreachable(e.to_string()))?;
                if let Some(ip) = &body.ip {
                    let _ = tasks::set_reserved_ip(&self.db.pool, task.task_id, ip).await;
                }
                tasks::set_ssh_ports(&self.db.pool, task.task_id, body.ssh_port, None).await?;
                info!(task = task.task_id, node = %plan.hostname, "VPS dispatched");
                Ok(body)
            }
            Ok(resp) => {
                let body = resp.text().await.unwrap_or_default();
                self.abort_dispatch(task.task_id, &plan, &format!("runner refused: {body}"))
                    .await;
                Err(SchedulerError::RunnerUnreachable(body))
            }
            Err(e) => {
                self.abort_dispatch(task.task_id, &plan, &format!("runner unreachable: {e}"))
                    .await;
                Err(SchedulerError::RunnerUnreachable(e.to_string()))
            }
        }
    }

    async fn abort_dispatch(&self, task_id: i64, plan: &DispatchPlan, reason: &str) {
        warn!(task = task_id, node = %plan.hostname, reason = %reason, "Dispatch aborted");
        self.registry.free(&plan.hostname, task_id).await;
        self.fail_task(task_id, reason).await;
    }

    async fn fail_task(&self, task_id: i64, reason: &str) {
        let result = tasks::transition(
            &self.db.pool,
            task_id,
            TaskStatus::Failed,
            ResultFields {
                error_message: Some(reason.to_string()),
                ..Default::default()
            },
        )
        .await;
        if let Err(e) = result {
            error!(task = task_id, error = %e, "Failed to mark task failed");
        }
        self.release_task_resources(task_id).await;
    }

    /// Free node resources and the overlay reservation tied to a task.
    async fn release_task_resources(&self, task_id: i64) {
        let Ok(Some(task)) = tasks::get(&self.db.pool, task_id).await else {
            return;
        };
        if let Some(node) = &task.assigned_node {
            self.registry.free(node, task_id).await;
        }
        self.reservations
            .release_by_container(&Self::container_id_for(&task))
            .await;
        if let Some(token) = &task.ip_reservation_token {
            self.reservations.release_by_token(token).await;
        }
    }

    // ---- runner callbacks ----

    /// Apply a status update reported by a runner. Terminal states release
    /// the task's resources.
    pub async fn handle_update(&self, update: TaskStatusUpdate) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::transition(
            &self.db.pool,
            update.task_id,
            update.status,
            ResultFields {
                exit_code: update.exit_code,
                error_message: update.error_message.clone(),
                stdout_path: update.stdout_path.clone(),
                stderr_path: update.stderr_path.clone(),
            },
        )
        .await?;

        if update.status == TaskStatus::Running {
            let _ = tasks::clear_suspicion(&self.db.pool, update.task_id).await;
        }
        if update.status.is_terminal() {
            info!(
                task = update.task_id,
                status = %update.status,
                exit_code = ?update.exit_code,
                "Task reached terminal state"
            );
            self.release_task_resources(update.task_id).await;
        }
        Ok(task)
    }

    // ---- lifecycle commands ----

    async fn runner_url_for(&self, task: &TaskRecord) -> Result<String, SchedulerError> {
        let node = task
            .assigned_node
            .as_deref()
            .ok_or_else(|| SchedulerError::WrongState(task.status()))?;
        self.registry
            .url_of(node)
            .await
            .ok_or_else(|| SchedulerError::RunnerUnreachable(format!("node {node} not registered")))
    }

    async fn post_runner(&self, url: String) -> Result<(), SchedulerError> {
        match self.http.post(&url).send().await {
            Ok(resp) if resp.status().is_success() => Ok(()),
            Ok(resp) => Err(SchedulerError::RunnerUnreachable(format!(
                "{} from {url}",
                resp.status()
            ))),
            Err(e) => Err(SchedulerError::RunnerUnreachable(e.to_string())),
        }
    }

    /// Kill a task. Idempotent: killing an already-terminal task succeeds
    /// without touching the runner.
    pub async fn kill(&self, task_id: i64) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::get(&self.db.pool, task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))?;
        if task.status().is_terminal() {
            return Ok(task);
        }

        let url = self.runner_url_for(&task).await?;
        self.post_runner(format!(
            "{}/api/kill/{}",
            url.trim_end_matches('/'),
            task_id
        ))
        .await?;

        let task = tasks::transition(
            &self.db.pool,
            task_id,
            TaskStatus::Killed,
            ResultFields::default(),
        )
        .await?;
        self.release_task_resources(task_id).await;
        info!(task = task_id, "Task killed");
        Ok(task)
    }

    pub async fn pause(&self, task_id: i64) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::get(&self.db.pool, task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))?;
        let url = self.runner_url_for(&task).await?;
        self.post_runner(format!(
            "{}/api/pause/{}",
            url.trim_end_matches('/'),
            task_id
        ))
        .await?;
        Ok(tasks::transition(&self.db.pool, task_id, TaskStatus::Paused, ResultFields::default()).await?)
    }

    pub async fn resume(&self, task_id: i64) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::get(&self.db.pool, task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))?;
        let url = self.runner_url_for(&task).await?;
        self.post_runner(format!(
            "{}/api/resume/{}",
            url.trim_end_matches('/'),
            task_id
        ))
        .await?;
        Ok(tasks::transition(&self.db.pool, task_id, TaskStatus::Running, ResultFields::default()).await?)
    }

    /// Stop a VPS: forward to its runner, then record `stopped` and release
    /// its resources. The container/disk persists on the node. Idempotent.
    pub async fn vps_stop(
        &self,
        task_id: i64,
        snapshot: bool,
    ) -> Result<TaskRecord, SchedulerError> {
        let task = tasks::get(&self.db.pool, task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))?;
        if task.task_type() != TaskType::Vps {
            return Err(SchedulerError::Validation(format!(
                "task {task_id} is not a vps"
            )));
        }
        if task.status() == TaskStatus::Stopped {
            return Ok(task);
        }

        let url = self.runner_url_for(&task).await?;
        self.post_runner(format!(
            "{}/api/vps/stop/{}?snapshot={}",
            url.trim_end_matches('/'),
            task_id,
            snapshot
        ))
        .await?;

        let task = tasks::transition(
            &self.db.pool,
            task_id,
            TaskStatus::Stopped,
            ResultFields::default(),
        )
        .await?;
        self.release_task_resources(task_id).await;
        info!(task = task_id, "VPS stopped");
        Ok(task)
    }

    /// Restart a stopped VPS on its original node (the disk lives there).
    /// The task re-enters `assigning`; the runner's callback (or phone-home)
    /// completes the move to `running`.
    pub async fn vps_restart(
        &self,
        task_id: i64,
        from_snapshot: bool,
    ) -> Result<VpsCreateResponse, SchedulerError> {
        let task = tasks::get(&self.db.pool, task_id)
            .await?
            .ok_or(SchedulerError::NotFound(task_id))?;
        if task.status() != TaskStatus::Stopped {
            return Err(SchedulerError::WrongState(task.status()));
        }
        let node = task
            .assigned_node
            .clone()
            .ok_or_else(|| SchedulerError::WrongState(task.status()))?;

        self.registry
            .allocate(
                &node,
                task_id,
                TaskAllocation {
                    cores: task.required_cores as u32,
                    memory_bytes: task.required_memory_bytes.map(|b| b as u64).unwrap_or(0),
                    gpu_indices: task.gpu_indices(),
                },
            )
            .await
            .map_err(|e| SchedulerError::NoSuitableNode(e.to_string()))?;

        // A VM keeps its persisted address across stop/restart; claim the
        // reservation again so nothing else grabs it.
        if task.vps_backend() == Some(VpsBackend::Qemu) {
            if let (Some(ip), Some(range)) = (
                task.reserved_ip.as_ref().and_then(|s| s.parse().ok()),
                self.overlay.ip_range_for(&node).await,
            ) {
                match self
                    .reservations
                    .reserve(&node, range, Some(ip), self.config.vm_reservation_ttl_secs)
                    .await
                {
                    Ok(r) => {
                        let _ = self
                            .reservations
                            .use_reservation(&r.token, &Self::container_id_for(&task))
                            .await;
                    }
                    Err(e) => {
                        warn!(task = task_id, error = %e, "Could not re-reserve VM address")
                    }
                }
            }
        }

        let url = self
            .registry
            .url_of(&node)
            .await
            .ok_or_else(|| SchedulerError::RunnerUnreachable(format!("node {node} offline")))?;

        tasks::transition(
            &self.db.pool,
            task_id,
            TaskStatus::Assigning,
            ResultFields::default(),
        )
        .await?;

        let restart_url = format!(
            "{}/api/vps/restart/{}?from_snapshot={}",
            url.trim_end_matches('/'),
            task_id,
            from_snapshot
        );
        match self.http.post(&restart_url).send().await {
            Ok(resp) if resp.status().is_success() => {
                let body: VpsCreateResponse = resp
                    .json()
                    .await
                    .map_err(|e| SchedulerError::RunnerUnreachable(e.to_string()))?;
                info!(task = task_id, node = %node, "VPS restarting");
                Ok(body)
            }
            Ok(resp) => {
                let reason = format!("runner refused restart: {}", resp.status());
                self.registry.free(&node, task_id).await;
                let _ = tasks::transition(
                    &self.db.pool,
                    task_id,
                    TaskStatus::Failed,
                    ResultFields {
                        error_message: Some(reason.clone()),
                        ..Default::default()
                    },
                )
                .await;
                Err(SchedulerError::RunnerUnreachable(reason))
            }
            Err(e) => {
                self.registry.free(&node, task_id).await;
                let _ = tasks::transition(
                    &self.db.pool,
                    task_id,
                    TaskStatus::Failed,
                    ResultFields {
                        error_message: Some(format!("runner unreachable: {e}")),
                        ..Default::default()
                    },
                )
                .await;
                Err(SchedulerError::RunnerUnreachable(e.to_string()))
            }
        }
    }

    // ---- heartbeat processing ----

    /// Process one heartbeat: liveness, health, and task-set reconciliation.
    /// Returns an error for unknown nodes so the runner re-registers.
    pub async fn process_heartbeat(
        &self,
        hostname: &str,
        payload: HeartbeatPayload,
    ) -> Result<(), SchedulerError> {
        let gpu_json = serde_json::to_string(&payload.gpus).unwrap_or_else(|_| "[]".into());
        self.registry
            .heartbeat(hostname, payload.clone())
            .await
            .map_err(|e| SchedulerError::Validation(e.to_string()))?;
        node_store::touch_heartbeat(&self.db.pool, hostname, &gpu_json).await?;

        let reported: HashSet<i64> = payload.running_task_ids.iter().copied().collect();

        // Explicitly killed tasks (e.g. the runner's OOM watchdog).
        for task_id in &payload.killed_task_ids {
            if let Ok(Some(task)) = tasks::get(&self.db.pool, *task_id).await {
                if !task.status().is_terminal() {
                    let _ = self
                        .handle_update(TaskStatusUpdate {
                            task_id: *task_id,
                            status: TaskStatus::Killed,
                            exit_code: None,
                            error_message: Some("killed by runner".into()),
                            stdout_path: None,
                            stderr_path: None,
                        })
                        .await;
                }
            }
        }

        // Reconcile the running set with what the store believes.
        for task in tasks::active_on_node(&self.db.pool, hostname).await? {
            let status = task.status();
            if reported.contains(&task.task_id) {
                if status == TaskStatus::Assigning {
                    // Runner started the task but its status callback has
                    // not landed yet — the heartbeat is proof enough.
                    let _ = tasks::transition(
                        &self.db.pool,
                        task.task_id,
                        TaskStatus::Running,
                        ResultFields::default(),
                    )
                    .await;
                }
                if task.assignment_suspicion_count > 0 {
                    let _ = tasks::clear_suspicion(&self.db.pool, task.task_id).await;
                }
                continue;
            }

            // Paused tasks are legitimately absent from the running set;
            // assigning tasks may simply not have started yet.
            if status != TaskStatus::Running {
                continue;
            }

            let count = tasks::bump_suspicion(&self.db.pool, task.task_id).await?;
            warn!(
                task = task.task_id,
                node = %hostname,
                suspicion = count,
                "Runner does not report a task the store thinks is running"
            );
            if count >= SUSPICION_LIMIT {
                let _ = tasks::transition(
                    &self.db.pool,
                    task.task_id,
                    TaskStatus::Lost,
                    ResultFields {
                        error_message: Some("runner stopped reporting this task".into()),
                        ..Default::default()
                    },
                )
                .await;
                self.release_task_resources(task.task_id).await;
            }
        }

        // Lost VPS reclaim: the runner is back and still reports the task.
        for task in tasks::lost_vps_on_node(&self.db.pool, hostname).await? {
            if reported.contains(&task.task_id) {
                match tasks::transition(
                    &self.db.pool,
                    task.task_id,
                    TaskStatus::Running,
                    ResultFields::default(),
                )
                .await
                {
                    Ok(_) => {
                        info!(task = task.task_id, node = %hostname, "Lost VPS reclaimed");
                        let _ = self
                            .registry
                            .allocate(
                                hostname,
                                task.task_id,
                                TaskAllocation {
                                    cores: task.required_cores as u32,
                                    memory_bytes: task
                                        .required_memory_bytes
                                        .map(|b| b as u64)
                                        .unwrap_or(0),
                                    gpu_indices: task.gpu_indices(),
                                },
                            )
                            .await;
                        let _ = tasks::clear_suspicion(&self.db.pool, task.task_id).await;
                    }
                    Err(e) => warn!(task = task.task_id, error = %e, "VPS reclaim failed"),
                }
            }
        }

        Ok(())
    }

    /// Apply offline consequences to a node that missed its heartbeats:
    /// running work becomes lost and its resources are freed. VPS tasks stay
    /// reclaimable; command tasks need resubmission.
    pub async fn node_went_offline(&self, hostname: &str) {
        if let Err(e) = node_store::set_status(&self.db.pool, hostname, "offline").await {
            error!(node = %hostname, error = %e, "Failed to persist offline status");
        }
        let active = match tasks::active_on_node(&self.db.pool, hostname).await {
            Ok(t) => t,
            Err(e) => {
                error!(node = %hostname, error = %e, "Failed to load tasks for offline node");
                return;
            }
        };
        for task in active {
            warn!(task = task.task_id, node = %hostname, "Marking task lost (node offline)");
            let _ = tasks::transition(
                &self.db.pool,
                task.task_id,
                TaskStatus::Lost,
                ResultFields {
                    error_message: Some(format!("node {hostname} went offline")),
                    ..Default::default()
                },
            )
            .await;
            self.release_task_resources(task.task_id).await;
        }
    }

    // ---- background loops ----

    /// Spawn the dispatch loop and the liveness/assignment scanners.
    pub fn spawn_loops(&self) {
        let dispatcher = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(1));
            interval.tick().await; // first tick is immediate — skip it
            loop {
                interval.tick().await;
                dispatcher.dispatch_pending().await;
            }
        });

        let scanner = self.clone();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(2));
            interval.tick().await;
            loop {
                interval.tick().await;
                scanner.scan_liveness().await;
            }
        });
    }

    /// Dispatch every pending command task in submission order. VPS tasks
    /// are dispatched inline by their create endpoint and skipped here.
    pub async fn dispatch_pending(&self) {
        let pending = match tasks::list_by_status(&self.db.pool, TaskStatus::Pending).await {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Failed to list pending tasks");
                return;
            }
        };
        for task in pending {
            if task.task_type() != TaskType::Command {
                continue;
            }
            if let Err(e) = self.dispatch_command(&task).await {
                warn!(task = task.task_id, error = %e, "Dispatch failed");
            }
        }
    }

    /// One scanner pass: heartbeat timeouts and assignment confirmations.
    pub async fn scan_liveness(&self) {
        let timeout = Duration::from_secs(self.config.heartbeat_timeout_secs);
        for hostname in self.registry.check_timeouts(timeout).await {
            self.node_went_offline(&hostname).await;
        }

        // Assignment confirmation: 3 heartbeat intervals without the runner
        // acknowledging the task.
        let cutoff = Utc::now()
            - chrono::Duration::seconds(3 * self.config.heartbeat_interval_secs as i64);
        match tasks::stale_assigning(&self.db.pool, &cutoff.to_rfc3339()).await {
            Ok(stale) => {
                for task in stale {
                    warn!(task = task.task_id, "Assignment timeout");
                    self.fail_task(task.task_id, "assignment timeout").await;
                }
            }
            Err(e) => error!(error = %e, "Failed to scan for stale assignments"),
        }
    }

    /// Rebuild in-memory allocations from the store after a Host restart.
    pub async fn recover_allocations(&self) -> anyhow::Result<()> {
        let mut recovered = 0usize;
        for node in node_store::list(&self.db.pool).await? {
            for task in tasks::active_on_node(&self.db.pool, &node.hostname).await? {
                // Node may not have re-registered yet; allocation will be
                // re-applied on its heartbeat-driven reclaim in that case.
                if self
                    .registry
                    .allocate(
                        &node.hostname,
                        task.task_id,
                        TaskAllocation {
                            cores: task.required_cores as u32,
                            memory_bytes: task.required_memory_bytes.map(|b| b as u64).unwrap_or(0),
                            gpu_indices: task.gpu_indices(),
                        },
                    )
                    .await
                    .is_ok()
                {
                    recovered += 1;
                }
            }
        }
        if recovered > 0 {
            info!(count = recovered, "Recovered task allocations from store");
        }
        Ok(())
    }
}

fn describe_unmet_demand(demand: &ResourceDemand, nodes: &[NodeSnapshot]) -> String {
    if let Some(target) = &demand.target_hostname {
        if !nodes.iter().any(|n| &n.hostname == target) {
            return format!("target node {target} is not registered");
        }
        if !nodes.iter().any(|n| &n.hostname == target && n.online) {
            return format!("target node {target} is offline");
        }
        return format!("target node {target} cannot satisfy the resource demand");
    }
    let online = nodes.iter().filter(|n| n.online).count();
    if online == 0 {
        return "no online nodes".into();
    }
    format!(
        "{online} online node(s), none satisfying cores={} gpus={:?} vm={}",
        demand.cores, demand.gpu_indices, demand.needs_vm
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{HostConfig, HostFileConfig};
    use crate::protocol::{GpuInfo, NumaNodeInfo, RegisterRequest};

    async fn test_scheduler(auth: bool) -> Scheduler {
        let db = Database::test_db().await;
        let mut cfg = HostConfig::resolve(HostFileConfig::default(), &|_| None).unwrap();
        cfg.auth_enabled = auth;
        let overlay = Arc::new(OverlayManager::new(cfg.overlay_subnet, cfg.base_vxlan_id));
        let reservations = Arc::new(IpReservationService::new(Some("test".into())));
        Scheduler::new(db, Arc::new(NodeRegistry::new()), overlay, reservations, cfg)
            .await
            .unwrap()
    }

    fn register_req(hostname: &str, cores: u32, gpus: u32) -> RegisterRequest {
        RegisterRequest {
            hostname: hostname.into(),
            url: format!("http://{hostname}:8001"),
            physical_ip: "192.168.1.10".into(),
            total_cores: cores,
            memory_total_bytes: 64 << 30,
            numa_topology: vec![NumaNodeInfo {
                id: 0,
                cpus: (0..cores).collect(),
                memory_mb: 65536,
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
            vfio_gpus: vec![],
            runner_version: "0.1.0".into(),
        }
    }

    fn command_submit(cores: u32) -> SubmitRequest {
        SubmitRequest {
            task_type: TaskType::Command,
            vps_backend: None,
            owner: Some("tester".into()),
            owner_role: Some("operator".into()),
            required_cores: cores,
            required_memory_bytes: None,
            required_gpus: vec![],
            target_numa_node_id: None,
            target_hostname: None,
            reserved_ip: None,
            ip_reservation_token: None,
            command: Some("/bin/echo".into()),
            arguments: vec!["hi".into()],
            env_vars: Default::default(),
            working_dir: None,
            privileged: false,
            mounts: vec![],
            container_name: Some("base".into()),
            registry_image: None,
            vm_image: None,
            vm_disk_size_gb: None,
            memory_mb: None,
            ssh_key_mode: None,
            ssh_public_key: None,
        }
    }

    #[tokio::test]
    async fn submit_enters_pending_without_auth() {
        let s = test_scheduler(false).await;
        let resp = s.submit(command_submit(2)).await.unwrap();
        assert_eq!(resp.status, TaskStatus::Pending);

        let task = tasks::get(&s.db.pool, resp.task_id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn user_submissions_require_approval_when_auth_on() {
        let s = test_scheduler(true).await;
        let mut req = command_submit(1);
        req.owner_role = Some("user".into());
        let resp = s.submit(req).await.unwrap();
        assert_eq!(resp.status, TaskStatus::PendingApproval);

        let approved = s.approve(resp.task_id).await.unwrap();
        assert_eq!(approved.status(), TaskStatus::Pending);
    }

    #[tokio::test]
    async fn reject_records_reason() {
        let s = test_scheduler(true).await;
        let mut req = command_submit(1);
        req.owner_role = Some("user".into());
        let resp = s.submit(req).await.unwrap();

        let rejected = s.reject(resp.task_id, Some("nope".into())).await.unwrap();
        assert_eq!(rejected.status(), TaskStatus::Rejected);
        assert_eq!(rejected.error_message.as_deref(), Some("nope"));
    }

    #[tokio::test]
    async fn submit_without_command_is_rejected() {
        let s = test_scheduler(false).await;
        let mut req = command_submit(1);
        req.command = None;
        assert!(matches!(
            s.submit(req).await.unwrap_err(),
            SchedulerError::Validation(_)
        ));
    }

    #[tokio::test]
    async fn task_ids_are_monotonic() {
        let s = test_scheduler(false).await;
        let a = s.submit(command_submit(1)).await.unwrap().task_id;
        let b = s.submit(command_submit(1)).await.unwrap().task_id;
        assert!(b > a);
        assert_eq!(tasks::last_task_id(&s.db.pool).await.unwrap(), b as u64);
    }

    #[tokio::test]
    async fn prepare_dispatch_allocates_on_emptiest_node() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("busy", 8, 0)).await;
        s.registry.register(&register_req("idle", 8, 0)).await;
        s.registry
            .allocate("busy", 999, TaskAllocation { cores: 6, memory_bytes: 0, gpu_indices: vec![] })
            .await
            .unwrap();

        let id = s.submit(command_submit(2)).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        let plan = s.prepare_dispatch(&task).await.unwrap();
        assert_eq!(plan.hostname, "idle");

        let snap = s.registry.snapshot_of("idle").await.unwrap();
        assert_eq!(snap.allocated_cores, 2);
    }

    #[tokio::test]
    async fn prepare_dispatch_fails_with_no_nodes() {
        let s = test_scheduler(false).await;
        let id = s.submit(command_submit(2)).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert!(matches!(
            s.prepare_dispatch(&task).await.unwrap_err(),
            SchedulerError::NoSuitableNode(_)
        ));
    }

    #[tokio::test]
    async fn update_to_completed_frees_resources() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;

        let id = s.submit(command_submit(4)).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        s.prepare_dispatch(&task).await.unwrap();
        tasks::assign(&s.db.pool, id, "node1").await.unwrap();
        tasks::transition(&s.db.pool, id, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();

        let before = s.registry.snapshot_of("node1").await.unwrap().allocated_cores;
        assert_eq!(before, 4);

        s.handle_update(TaskStatusUpdate {
            task_id: id,
            status: TaskStatus::Completed,
            exit_code: Some(0),
            error_message: None,
            stdout_path: None,
            stderr_path: None,
        })
        .await
        .unwrap();

        // S1: resources return to their prior value.
        let after = s.registry.snapshot_of("node1").await.unwrap().allocated_cores;
        assert_eq!(after, 0);
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Completed);
        assert_eq!(task.exit_code, Some(0));
    }

    #[tokio::test]
    async fn oom_update_records_exit_137() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;
        let id = s.submit(command_submit(1)).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        s.prepare_dispatch(&task).await.unwrap();
        tasks::assign(&s.db.pool, id, "node1").await.unwrap();
        tasks::transition(&s.db.pool, id, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();

        s.handle_update(TaskStatusUpdate {
            task_id: id,
            status: TaskStatus::KilledOom,
            exit_code: Some(137),
            error_message: Some("container OOM-killed".into()),
            stdout_path: None,
            stderr_path: None,
        })
        .await
        .unwrap();

        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::KilledOom);
        assert_eq!(task.exit_code, Some(137));
        assert_eq!(s.registry.snapshot_of("node1").await.unwrap().allocated_cores, 0);
    }

    async fn running_task_on(s: &Scheduler, node: &str, cores: u32) -> i64 {
        let id = s.submit(command_submit(cores)).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        s.prepare_dispatch(&task).await.unwrap();
        tasks::assign(&s.db.pool, id, node).await.unwrap();
        tasks::transition(&s.db.pool, id, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        id
    }

    #[tokio::test]
    async fn suspicion_three_strikes_demotes_to_lost() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;
        let id = running_task_on(&s, "node1", 2).await;

        let empty = HeartbeatPayload::default();
        for _ in 0..2 {
            s.process_heartbeat("node1", empty.clone()).await.unwrap();
            let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
            assert_eq!(task.status(), TaskStatus::Running);
        }
        s.process_heartbeat("node1", empty).await.unwrap();

        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Lost);
        assert_eq!(s.registry.snapshot_of("node1").await.unwrap().allocated_cores, 0);
    }

    #[tokio::test]
    async fn reported_task_resets_suspicion() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;
        let id = running_task_on(&s, "node1", 2).await;

        s.process_heartbeat("node1", HeartbeatPayload::default()).await.unwrap();
        s.process_heartbeat("node1", HeartbeatPayload::default()).await.unwrap();

        // Task shows up again: counter resets, two more misses are not enough.
        let mut with_task = HeartbeatPayload::default();
        with_task.running_task_ids = vec![id];
        s.process_heartbeat("node1", with_task).await.unwrap();

        s.process_heartbeat("node1", HeartbeatPayload::default()).await.unwrap();
        s.process_heartbeat("node1", HeartbeatPayload::default()).await.unwrap();
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
    }

    #[tokio::test]
    async fn offline_node_loses_its_tasks() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;
        let id = running_task_on(&s, "node1", 2).await;

        s.node_went_offline("node1").await;

        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Lost);
        assert_eq!(s.registry.snapshot_of("node1").await.unwrap().allocated_cores, 0);
    }

    #[tokio::test]
    async fn lost_vps_reclaimed_from_heartbeat() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;

        let mut req = command_submit(2);
        req.task_type = TaskType::Vps;
        req.vps_backend = Some(VpsBackend::Docker);
        req.command = None;
        let id = s.submit(req).await.unwrap().task_id;
        tasks::assign(&s.db.pool, id, "node1").await.unwrap();
        tasks::transition(&s.db.pool, id, TaskStatus::Running, ResultFields::default())
            .await
            .unwrap();
        tasks::transition(&s.db.pool, id, TaskStatus::Lost, ResultFields::default())
            .await
            .unwrap();

        let mut hb = HeartbeatPayload::default();
        hb.running_task_ids = vec![id];
        s.process_heartbeat("node1", hb).await.unwrap();

        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.status(), TaskStatus::Running);
        assert_eq!(s.registry.snapshot_of("node1").await.unwrap().allocated_cores, 2);
    }

    #[tokio::test]
    async fn heartbeat_from_unregistered_node_errors() {
        let s = test_scheduler(false).await;
        assert!(s
            .process_heartbeat("ghost", HeartbeatPayload::default())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reservation_mismatch_rejected_at_submit() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;

        // Forge a submit carrying a token for node1 but targeting node2.
        let range = crate::overlay::reservation::IpRange {
            first: "10.128.64.2".parse().unwrap(),
            last: "10.128.64.10".parse().unwrap(),
            gateway: "10.128.64.1".parse().unwrap(),
            host_vxlan_ip: "10.128.127.254".parse().unwrap(),
        };
        let r = s
            .reservations
            .reserve("node1", range, None, 300)
            .await
            .unwrap();

        let mut req = command_submit(1);
        req.ip_reservation_token = Some(r.token.clone());
        req.target_hostname = Some("node2".into());
        assert!(matches!(
            s.submit(req).await.unwrap_err(),
            SchedulerError::Validation(_)
        ));

        // Without the conflicting target, the reservation pins the runner.
        let mut req = command_submit(1);
        req.ip_reservation_token = Some(r.token);
        let id = s.submit(req).await.unwrap().task_id;
        let task = tasks::get(&s.db.pool, id).await.unwrap().unwrap();
        assert_eq!(task.target_hostname.as_deref(), Some("node1"));
        assert_eq!(task.reserved_ip.as_deref(), Some(r.ip.to_string().as_str()));
    }

    #[tokio::test]
    async fn recover_allocations_rebuilds_registry() {
        let s = test_scheduler(false).await;
        s.registry.register(&register_req("node1", 8, 0)).await;
        node_store::upsert(&s.db.pool, &register_req("node1", 8, 0))
            .await
            .unwrap();
        let id = running_task_on(&s, "node1", 3).await;

        // Simulate a Host restart: fresh registry, same store.
        let fresh = NodeRegistry::new();
        fresh.register(&register_req("node1", 8, 0)).await;
        let restarted = Scheduler {
            registry: Arc::new(fresh),
            ..s.clone()
        };
        restarted.recover_allocations().await.unwrap();

        let snap = restarted.registry.snapshot_of("node1").await.unwrap();
        assert_eq!(snap.allocated_cores, 3);
        let _ = id;
    }
}
