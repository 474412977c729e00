pub mod api;
pub mod executor;
pub mod fs;
pub mod heartbeat;
pub mod images;
pub mod overlay;
pub mod vm;
pub mod vps;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::Mutex;
use tracing::warn;

use crate::config::RunnerConfig;
use crate::protocol::{HeartbeatPayload, RegisterRequest, RegisterResponse, TaskStatusUpdate};
use crate::tunnel::server::TunnelServer;
use executor::TaskExecutor;
use images::ImageSync;
use overlay::RunnerOverlay;
use vm::VmManager;
use vps::VpsManager;

/// Thin client for the Host API: registration, heartbeats, and task status
/// callbacks.
pub struct HostClient {
    http: reqwest::Client,
    base: String,
    hostname: String,
}

impl HostClient {
    pub fn new(config: &RunnerConfig) -> Result<Self> {
        Ok(Self {
            http: reqwest::Client::builder()
                .timeout(Duration::from_secs(15))
                .build()?,
            base: config.host_url.trim_end_matches('/').to_string(),
            hostname: config.hostname.clone(),
        })
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse> {
        let resp = self
            .http
            .post(format!("{}/api/register", self.base))
            .json(req)
            .send()
            .await
            .context("register request")?;
        if !resp.status().is_success() {
            anyhow::bail!("host rejected registration: {}", resp.status());
        }
        Ok(resp.json().await.context("register response body")?)
    }

    /// Send one heartbeat. `Ok(false)` means the Host does not know this
    /// node (it restarted) and the runner should re-register.
    pub async fn heartbeat(&self, payload: &HeartbeatPayload) -> Result<bool> {
        let resp = self
            .http
            .put(format!("{}/api/heartbeat/{}", self.base, self.hostname))
            .json(payload)
            .send()
            .await
            .context("heartbeat request")?;
        if resp.status() == reqwest::StatusCode::NOT_FOUND {
            return Ok(false);
        }
        if !resp.status().is_success() {
            anyhow::bail!("heartbeat rejected: {}", resp.status());
        }
        Ok(true)
    }

    /// Report a task status change. Best-effort with a short retry: the
    /// heartbeat reconciliation covers anything that slips through.
    pub async fn update(&self, update: TaskStatusUpdate) {
        let url = format!("{}/api/update", self.base);
        for attempt in 0..3u32 {
            match self.http.post(&url).json(&update).send().await {
                Ok(resp) if resp.status().is_success() => return,
                Ok(resp) => {
                    warn!(
                        task = update.task_id,
                        status = resp.status().as_u16(),
                        attempt,
                        "Status update rejected"
                    );
                    // A 4xx means the transition is invalid (e.g. the task
                    // was already terminal on the Host) — do not retry.
                    if resp.status().is_client_error() {
                        return;
                    }
                }
                Err(e) => {
                    warn!(task = update.task_id, error = %e, attempt, "Status update failed");
                }
            }
            tokio::time::sleep(Duration::from_secs(1 << attempt)).await;
        }
    }
}

/// Shared state for the runner process.
pub struct RunnerState {
    pub config: Arc<RunnerConfig>,
    /// Source address toward the Host, sent as our VXLAN endpoint.
    pub physical_ip: String,
    pub host: Arc<HostClient>,
    pub images: Arc<ImageSync>,
    pub executor: Arc<TaskExecutor>,
    pub vps: Arc<VpsManager>,
    pub vm: Arc<VmManager>,
    pub tunnels: Arc<TunnelServer>,
    pub overlay: Arc<RunnerOverlay>,
    /// Tasks killed locally since the last heartbeat (reported once).
    killed: Mutex<Vec<i64>>,
}

impl RunnerState {
    pub fn new(config: RunnerConfig, physical_ip: String) -> Result<Arc<Self>> {
        let config = Arc::new(config);
        let host = Arc::new(HostClient::new(&config)?);
        let images = Arc::new(ImageSync::new(config.clone()));
        let executor = Arc::new(TaskExecutor::new(
            config.clone(),
            images.clone(),
            host.clone(),
        ));
        let vps = Arc::new(VpsManager::new(
            config.clone(),
            images.clone(),
            host.clone(),
        ));
        let vm = Arc::new(VmManager::new(config.clone(), host.clone()));
        let tunnels = Arc::new(TunnelServer::new(Duration::from_secs(
            config.tunnel_ping_interval_secs,
        )));

        Ok(Arc::new(Self {
            physical_ip,
            host,
            images,
            executor,
            vps,
            vm,
            tunnels,
            overlay: Arc::new(RunnerOverlay::new()),
            killed: Mutex::new(Vec::new()),
            config,
        }))
    }

    pub async fn note_killed(&self, task_id: i64) {
        self.killed.lock().await.push(task_id);
    }

    pub async fn take_killed_ids(&self) -> Vec<i64> {
        std::mem::take(&mut *self.killed.lock().await)
    }
}
