use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::executor::{
    build_docker_run_args, run_docker, task_environment, image_reference, LaunchPlan,
};
use super::images::ImageSync;
use super::HostClient;
use crate::config::RunnerConfig;
use crate::protocol::{
    SnapshotInfo, SshKeyMode, TaskStatusUpdate, VpsCreateRequest, VpsCreateResponse,
};
use crate::scheduler::state::TaskStatus;

pub fn vps_container_name(task_id: i64) -> String {
    format!("kohakuriver-vps-{task_id}")
}

pub fn snapshot_repository(task_id: i64) -> String {
    format!("kohakuriver/snapshot-{task_id}")
}

pub fn snapshot_tag(task_id: i64, ts: i64) -> String {
    format!("{}:{ts}", snapshot_repository(task_id))
}

/// Parse `docker images --format '{{.Tag}}'` output for a snapshot
/// repository into sorted timestamps (oldest first).
pub fn parse_snapshot_tags(output: &str) -> Vec<i64> {
    let mut tags: Vec<i64> = output
        .lines()
        .filter_map(|l| l.trim().parse().ok())
        .collect();
    tags.sort_unstable();
    tags
}

/// Entrypoint shell line for a Docker VPS. The container must outlive its
/// initial command, so it ends in `sleep infinity` rather than `exec`ing a
/// workload.
pub fn build_vps_entrypoint(
    ssh_enabled: bool,
    ssh_port: Option<u16>,
    authorized_key: Option<&str>,
    permit_empty_password: bool,
) -> String {
    let mut parts: Vec<String> = Vec::new();
    if ssh_enabled {
        let port = ssh_port.unwrap_or(22);
        parts.push("mkdir -p /run/sshd /root/.ssh".into());
        parts.push("chmod 700 /root/.ssh".into());
        if let Some(key) = authorized_key {
            parts.push(format!(
                "echo '{}' >> /root/.ssh/authorized_keys",
                key.replace('\'', "")
            ));
            parts.push("chmod 600 /root/.ssh/authorized_keys".into());
        }
        let mut sshd = format!("/usr/sbin/sshd -p {port}");
        if permit_empty_password {
            sshd.push_str(" -o PermitEmptyPasswords=yes -o PermitRootLogin=yes");
        } else {
            sshd.push_str(" -o PermitRootLogin=prohibit-password");
        }
        parts.push(sshd);
    }
    parts.push("(nohup /usr/local/bin/kohaku-tunnel >/dev/null 2>&1 &)".into());
    parts.push("exec sleep infinity".into());
    parts.join(" && ")
}

struct VpsEntry {
    container_name: String,
    ssh_port: Option<u16>,
    /// Kept so a restart-from-snapshot can recreate the container with the
    /// same settings.
    request: VpsCreateRequest,
}

/// Long-lived Docker containers with SSH/terminal access, plus their
/// `docker commit` snapshot ledger.
pub struct VpsManager {
    config: Arc<RunnerConfig>,
    images: Arc<ImageSync>,
    host: Arc<HostClient>,
    vps: Mutex<HashMap<i64, VpsEntry>>,
    snapshots: Mutex<HashMap<i64, Vec<SnapshotInfo>>>,
}

impl VpsManager {
    pub fn new(config: Arc<RunnerConfig>, images: Arc<ImageSync>, host: Arc<HostClient>) -> Self {
        Self {
            config,
            images,
            host,
            vps: Mutex::new(HashMap::new()),
            snapshots: Mutex::new(HashMap::new()),
        }
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        self.vps.lock().await.keys().copied().collect()
    }

    pub async fn ssh_port_of(&self, task_id: i64) -> Option<u16> {
        self.vps.lock().await.get(&task_id).and_then(|e| e.ssh_port)
    }

    async fn next_ssh_port(&self) -> u16 {
        let used: std::collections::HashSet<u16> = self
            .vps
            .lock()
            .await
            .values()
            .filter_map(|e| e.ssh_port)
            .collect();
        let mut port = self.config.ssh_port_base;
        while used.contains(&port) {
            port += 1;
        }
        port
    }

    /// Create and start a Docker VPS. Returns connection details; a
    /// generated private key appears here once and is never stored.
    pub async fn create(&self, req: VpsCreateRequest) -> Result<VpsCreateResponse> {
        self.images
            .ensure_synced(req.container_name.as_deref(), req.registry_image.as_deref())
            .await?;

        let container_name = vps_container_name(req.task_id);
        let ssh_mode = req.ssh_key_mode;
        let ssh_enabled = ssh_mode != SshKeyMode::Disabled;
        let ssh_port = if ssh_enabled {
            Some(self.next_ssh_port().await)
        } else {
            None
        };

        let (authorized_key, private_key) = match ssh_mode {
            SshKeyMode::Disabled | SshKeyMode::None => (None, None),
            SshKeyMode::Upload => (
                Some(req.ssh_public_key.clone().context("upload mode requires ssh_public_key")?),
                None,
            ),
            SshKeyMode::Generate => {
                let (public, private) = generate_ed25519_keypair().await?;
                (Some(public), Some(private))
            }
        };

        let entrypoint = build_vps_entrypoint(
            ssh_enabled,
            ssh_port,
            authorized_key.as_deref(),
            ssh_mode == SshKeyMode::None,
        );

        let gpu_indices: Vec<u32> = req.gpus.iter().filter_map(|g| g.parse().ok()).collect();
        let plan = LaunchPlan {
            container_name: container_name.clone(),
            image: image_reference(req.container_name.as_deref(), req.registry_image.as_deref()),
            remove_on_exit: false,
            overlay_network: self.config.overlay_enabled,
            reserved_ip: req.reserved_ip.clone(),
            cpus: req.required_cores,
            memory_bytes: req.required_memory_bytes,
            gpu_indices,
            env: task_environment(
                req.task_id,
                &container_name,
                &req.env_vars,
                None,
                &self.config,
            ),
            mounts: req.mounts.clone(),
            privileged: false,
            working_dir: None,
            shell_command: Some(entrypoint),
        };
        let args = build_docker_run_args(&plan, &self.config);

        // A container from a previous life may linger; remove it first.
        let _ = run_docker(&["rm".into(), "-f".into(), container_name.clone()]).await;
        run_docker(&args).await.context("docker run (vps)")?;
        info!(task = req.task_id, container = %container_name, ssh_port = ?ssh_port, "VPS started");

        self.vps.lock().await.insert(
            req.task_id,
            VpsEntry {
                container_name,
                ssh_port,
                request: req.clone(),
            },
        );

        self.host
            .update(TaskStatusUpdate {
                task_id: req.task_id,
                status: TaskStatus::Running,
                exit_code: None,
                error_message: None,
                stdout_path: None,
                stderr_path: None,
            })
            .await;

        Ok(VpsCreateResponse {
            task_id: req.task_id,
            ip: req.reserved_ip.clone(),
            ssh_port,
            ssh_private_key: private_key,
        })
    }

    /// Stop a VPS, optionally committing a snapshot first. The container and
    /// its disk state persist; only explicit deletion removes them.
    pub async fn stop(&self, task_id: i64, snapshot: bool) -> Result<()> {
        let container = vps_container_name(task_id);
        if snapshot {
            if let Err(e) = self.snapshot(task_id, None).await {
                warn!(task = task_id, error = %e, "Pre-stop snapshot failed");
            }
        }
        // SIGTERM, then SIGKILL after the grace window. Idempotent:
        // stopping a stopped or missing container is fine.
        let grace = self.config.kill_grace_secs.to_string();
        if let Err(e) =
            run_docker(&["stop".into(), "-t".into(), grace, container.clone()]).await
        {
            warn!(task = task_id, error = %e, "docker stop (already stopped?)");
        }
        self.vps.lock().await.remove(&task_id);
        info!(task = task_id, container = %container, "VPS stopped");
        Ok(())
    }

    /// Restart a stopped VPS: `docker start`, or recreate from the latest
    /// snapshot when asked.
    pub async fn restart(&self, task_id: i64, from_snapshot: bool) -> Result<VpsCreateResponse> {
        let container = vps_container_name(task_id);

        if from_snapshot {
            let latest = self
                .list_snapshots(task_id)
                .await?
                .into_iter()
                .next_back()
                .with_context(|| format!("vps {task_id} has no snapshots"))?;
            let request = {
                let vps = self.vps.lock().await;
                vps.get(&task_id).map(|e| e.request.clone())
            }
            .with_context(|| format!("vps {task_id} settings unknown on this runner"))?;

            run_docker(&["rm".into(), "-f".into(), container.clone()])
                .await
                .ok();
            let mut req = request;
            req.registry_image = Some(latest.image_tag.clone());
            req.container_name = None;
            info!(task = task_id, snapshot = %latest.image_tag, "Recreating VPS from snapshot");
            return self.create(req).await;
        }

        run_docker(&["start".into(), container.clone()])
            .await
            .context("docker start")?;
        // The entry may be missing after a runner restart; rebuild what we can.
        let ssh_port = self.ssh_port_of(task_id).await;
        info!(task = task_id, container = %container, "VPS restarted");

        self.host
            .update(TaskStatusUpdate {
                task_id,
                status: TaskStatus::Running,
                exit_code: None,
                error_message: None,
                stdout_path: None,
                stderr_path: None,
            })
            .await;

        Ok(VpsCreateResponse {
            task_id,
            ip: None,
            ssh_port,
            ssh_private_key: None,
        })
    }

    pub async fn pause(&self, task_id: i64) -> Result<()> {
        run_docker(&["pause".into(), vps_container_name(task_id)]).await?;
        Ok(())
    }

    pub async fn resume(&self, task_id: i64) -> Result<()> {
        run_docker(&["unpause".into(), vps_container_name(task_id)]).await?;
        Ok(())
    }

    pub async fn kill(&self, task_id: i64) -> Result<()> {
        self.vps.lock().await.remove(&task_id);
        let _ = run_docker(&["kill".into(), vps_container_name(task_id)]).await;
        Ok(())
    }

    // ---- snapshots ----

    /// Commit the container into the snapshot ledger, rotating out the
    /// oldest image beyond the per-VPS cap.
    pub async fn snapshot(&self, task_id: i64, message: Option<String>) -> Result<SnapshotInfo> {
        let container = vps_container_name(task_id);
        let ts = Utc::now().timestamp();
        let tag = snapshot_tag(task_id, ts);

        run_docker(&["commit".into(), container, tag.clone()])
            .await
            .context("docker commit")?;

        let info = SnapshotInfo {
            task_id,
            image_tag: tag.clone(),
            created_at: Utc::now().to_rfc3339(),
            message,
            size_bytes: 0,
        };

        let evicted: Vec<SnapshotInfo> = {
            let mut ledger = self.snapshots.lock().await;
            let list = ledger.entry(task_id).or_default();
            list.push(info.clone());
            list.sort_by(|a, b| a.image_tag.cmp(&b.image_tag));
            let max = self.config.max_snapshots_per_vps.max(1);
            let excess = list.len().saturating_sub(max);
            list.drain(..excess).collect()
        };
        for old in evicted {
            info!(task = task_id, snapshot = %old.image_tag, "Rotating out old snapshot");
            let _ = run_docker(&["rmi".into(), old.image_tag]).await;
        }

        info!(task = task_id, snapshot = %tag, "Snapshot committed");
        Ok(info)
    }

    /// List snapshots, oldest first. When the in-memory ledger is empty
    /// (runner restart), it is rebuilt from `docker images`.
    pub async fn list_snapshots(&self, task_id: i64) -> Result<Vec<SnapshotInfo>> {
        {
            let ledger = self.snapshots.lock().await;
            if let Some(list) = ledger.get(&task_id) {
                if !list.is_empty() {
                    return Ok(list.clone());
                }
            }
        }

        let out = run_docker(&[
            "images".into(),
            "--format".into(),
            "{{.Tag}}".into(),
            snapshot_repository(task_id),
        ])
        .await
        .unwrap_or_default();
        let rebuilt: Vec<SnapshotInfo> = parse_snapshot_tags(&out)
            .into_iter()
            .map(|ts| SnapshotInfo {
                task_id,
                image_tag: snapshot_tag(task_id, ts),
                created_at: chrono::DateTime::from_timestamp(ts, 0)
                    .map(|dt| dt.to_rfc3339())
                    .unwrap_or_default(),
                message: None,
                size_bytes: 0,
            })
            .collect();
        if !rebuilt.is_empty() {
            self.snapshots.lock().await.insert(task_id, rebuilt.clone());
        }
        Ok(rebuilt)
    }

    /// Delete one snapshot image. Idempotent.
    pub async fn delete_snapshot(&self, task_id: i64, image_tag: &str) -> Result<()> {
        let _ = run_docker(&["rmi".into(), image_tag.to_string()]).await;
        let mut ledger = self.snapshots.lock().await;
        if let Some(list) = ledger.get_mut(&task_id) {
            list.retain(|s| s.image_tag != image_tag);
        }
        Ok(())
    }
}

/// Generate a disposable Ed25519 keypair via ssh-keygen. Returns
/// (public_key, private_key); nothing is left on disk.
async fn generate_ed25519_keypair() -> Result<(String, String)> {
    let dir = std::env::temp_dir().join(format!(
        "kohakuriver-keygen-{}-{}",
        std::process::id(),
        Utc::now().timestamp_nanos_opt().unwrap_or(0)
    ));
    tokio::fs::create_dir_all(&dir).await?;
    let key_path = dir.join("id_ed25519");

    let output = tokio::process::Command::new("ssh-keygen")
        .args([
            "-t",
            "ed25519",
            "-N",
            "",
            "-C",
            "kohakuriver",
            "-q",
            "-f",
        ])
        .arg(&key_path)
        .output()
        .await
        .context("spawn ssh-keygen")?;
    if !output.status.success() {
        let _ = tokio::fs::remove_dir_all(&dir).await;
        anyhow::bail!(
            "ssh-keygen failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let private = tokio::fs::read_to_string(&key_path).await?;
    let public = tokio::fs::read_to_string(key_path.with_extension("pub")).await?;
    let _ = tokio::fs::remove_dir_all(&dir).await;
    Ok((public.trim().to_string(), private))
}
