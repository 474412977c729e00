pub mod cloudinit;
pub mod network;
pub mod qmp;
pub mod vfio;

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{error, info, warn};

use super::HostClient;
use crate::config::RunnerConfig;
use crate::protocol::{
    SshKeyMode, TaskStatusUpdate, VmHeartbeat, VpsCreateRequest, VpsCreateResponse,
};
use crate::scheduler::state::TaskStatus;
use cloudinit::CloudInitSpec;
use network::{
    attach_tap, bridge_exists, create_tap, delete_tap, ensure_standard_bridge, tap_name, vm_mac,
    StandardIpPool, VmNetworkInfo, VmNetworkMode, OVERLAY_BRIDGE, STANDARD_BRIDGE,
    STANDARD_GATEWAY, STANDARD_PREFIX_LEN,
};
use vfio::VfioManager;

/// The fd number QEMU receives the TAP device on.
const QEMU_TAP_FD: i32 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmState {
    Booting,
    Running,
    Stopped,
}

/// Persisted per-VM settings (`vm.json` in the instance dir). Everything a
/// restart or a cleanup pass needs without the original create request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmSpec {
    pub task_id: i64,
    pub cores: u32,
    pub memory_mb: u64,
    pub gpu_addrs: Vec<String>,
    pub audio_companions: Vec<String>,
    pub original_drivers: HashMap<String, Option<String>>,
    pub network: VmNetworkInfo,
}

#[derive(Debug)]
struct VmInstance {
    spec: VmSpec,
    state: VmState,
    pid: Option<u32>,
}

pub fn vm_container_id(task_id: i64) -> String {
    format!("vm-{task_id}")
}

/// Parse a task id back out of an instance directory name.
pub fn instance_dir_task_id(dir_name: &str) -> Option<i64> {
    dir_name.parse().ok()
}

/// Assemble the QEMU command line. The TAP arrives on `QEMU_TAP_FD`.
pub fn build_qemu_args(
    task_id: i64,
    cores: u32,
    memory_mb: u64,
    disk: &Path,
    seed_iso: &Path,
    qmp_socket: &Path,
    pidfile: &Path,
    console_log: &Path,
    vfio_addrs: &[String],
) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "-name".into(),
        format!("kohaku-vm-{task_id}"),
        "-enable-kvm".into(),
        "-machine".into(),
        "q35,accel=kvm".into(),
        "-cpu".into(),
        "host".into(),
        "-smp".into(),
        cores.max(1).to_string(),
        "-m".into(),
        format!("{memory_mb}M"),
        "-drive".into(),
        format!("file={},if=virtio,format=qcow2", disk.display()),
        "-drive".into(),
        format!("file={},media=cdrom,readonly=on", seed_iso.display()),
        "-netdev".into(),
        format!("tap,id=net0,fd={QEMU_TAP_FD}"),
        "-device".into(),
        format!("virtio-net-pci,netdev=net0,mac={}", vm_mac(task_id)),
    ];
    for addr in vfio_addrs {
        args.push("-device".into());
        args.push(format!("vfio-pci,host={addr}"));
    }
    args.extend([
        "-qmp".into(),
        format!("unix:{},server=on,wait=off", qmp_socket.display()),
        "-pidfile".into(),
        pidfile.display().to_string(),
        "-serial".into(),
        format!("file:{}", console_log.display()),
        "-display".into(),
        "none".into(),
        "-daemonize".into(),
    ]);
    args
}

fn pid_alive(pid: u32) -> bool {
    // Signal 0 probes existence without delivering anything.
    unsafe { libc::kill(pid as i32, 0) == 0 }
}

/// QEMU/KVM VPS lifecycle: disk cloning, cloud-init seeding, VFIO
/// passthrough, TAP networking, ACPI-first shutdown, and orphan cleanup.
pub struct VmManager {
    config: Arc<RunnerConfig>,
    host: Arc<HostClient>,
    vfio: VfioManager,
    ip_pool: StandardIpPool,
    instances: RwLock<HashMap<i64, VmInstance>>,
}

impl VmManager {
    pub fn new(config: Arc<RunnerConfig>, host: Arc<HostClient>) -> Self {
        Self {
            config,
            host,
            vfio: VfioManager::new(),
            ip_pool: StandardIpPool::new(),
            instances: RwLock::new(HashMap::new()),
        }
    }

    fn instance_dir(&self, task_id: i64) -> PathBuf {
        self.config.vm_instances_dir.join(task_id.to_string())
    }

    pub async fn running_task_ids(&self) -> Vec<i64> {
        self.instances
            .read()
            .await
            .values()
            .filter(|i| matches!(i.state, VmState::Running | VmState::Booting))
            .map(|i| i.spec.task_id)
            .collect()
    }

    /// Current guest address, for the tunnel server's `vm-` bypass.
    pub async fn vm_ip_of(&self, task_id: i64) -> Option<Ipv4Addr> {
        self.instances
            .read()
            .await
            .get(&task_id)
            .map(|i| i.spec.network.vm_ip)
    }

    // ---- create ----

    pub async fn create(self: &Arc<Self>, req: VpsCreateRequest) -> Result<VpsCreateResponse> {
        let task_id = req.task_id;
        let dir = self.instance_dir(task_id);
        tokio::fs::create_dir_all(&dir).await?;

        // 1. Clone the base image into a COW overlay, optionally grown.
        let vm_image = req.vm_image.clone().context("qemu vps requires vm_image")?;
        let base = self.config.vm_images_dir.join(&vm_image);
        if !base.exists() {
            bail!("base VM image {} not found", base.display());
        }
        let disk = dir.join("disk.qcow2");
        if !disk.exists() {
            let mut args: Vec<String> = vec![
                "create".into(),
                "-f".into(),
                "qcow2".into(),
                "-F".into(),
                "qcow2".into(),
                "-b".into(),
                base.display().to_string(),
                disk.display().to_string(),
            ];
            if let Some(size) = req.vm_disk_size_gb {
                args.push(format!("{size}G"));
            }
            run_qemu_img(&args).await.context("clone base image")?;
        }

        // 2. Network: overlay when the bridge exists and an IP was reserved,
        //    the NAT bridge otherwise.
        let network = self.allocate_network(&req).await?;

        // 3. Cloud-init seed.
        let ssh_keys = match req.ssh_key_mode {
            SshKeyMode::Upload => req.ssh_public_key.clone().into_iter().collect(),
            _ => Vec::new(),
        };
        let seed_spec = CloudInitSpec {
            instance_id: format!("kohaku-vm-{task_id}"),
            hostname: format!("vps-{task_id}"),
            ssh_authorized_keys: ssh_keys,
            task_id,
            heartbeat_interval_secs: self.config.heartbeat_interval_secs,
            network: &network,
        };
        let seed_iso = cloudinit::build_seed_iso(&dir, &seed_spec).await?;

        // 4. VFIO: every requested GPU plus its IOMMU-group audio functions.
        let (gpu_addrs, companions, original_drivers) =
            self.bind_gpus(&req.gpus).await?;

        let spec = VmSpec {
            task_id,
            cores: req.required_cores,
            memory_mb: req.memory_mb.unwrap_or(2048),
            gpu_addrs,
            audio_companions: companions,
            original_drivers,
            network: network.clone(),
        };
        self.persist_spec(&dir, &spec).await?;

        // 5 & 6. TAP + QEMU.
        let pid = self.launch(&dir, &spec, &seed_iso).await?;
        self.instances.write().await.insert(
            task_id,
            VmInstance {
                spec,
                state: VmState::Booting,
                pid: Some(pid),
            },
        );
        info!(task = task_id, pid, ip = %network.vm_ip, "VM launched, waiting for phone-home");

        self.spawn_boot_watchdog(task_id);

        Ok(VpsCreateResponse {
            task_id,
            ip: Some(network.vm_ip.to_string()),
            ssh_port: Some(22),
            ssh_private_key: None,
        })
    }

    async fn allocate_network(&self, req: &VpsCreateRequest) -> Result<VmNetworkInfo> {
        let task_id = req.task_id;
        let overlay_up = bridge_exists(OVERLAY_BRIDGE).await;
        if overlay_up {
            if let Some(ip) = &req.reserved_ip {
                let vm_ip: Ipv4Addr = ip.parse().context("reserved_ip is not IPv4")?;
                let gateway = overlay_gateway().await?;
                return Ok(VmNetworkInfo {
                    tap_device: tap_name(task_id),
                    vm_ip,
                    gateway,
                    bridge_name: OVERLAY_BRIDGE.into(),
                    prefix_len: overlay_prefix_len().await.unwrap_or(24),
                    dns_servers: default_dns(),
                    mode: VmNetworkMode::Overlay,
                    runner_url: format!("http://{gateway}:{}", self.runner_port()),
                    reservation_token: req.ip_reservation_token.clone(),
                });
            }
            warn!(task = task_id, "Overlay bridge up but no reserved IP; using standard network");
        }

        ensure_standard_bridge().await?;
        let vm_ip = self.ip_pool.allocate().await?;
        Ok(VmNetworkInfo {
            tap_device: tap_name(task_id),
            vm_ip,
            gateway: STANDARD_GATEWAY,
            bridge_name: STANDARD_BRIDGE.into(),
            prefix_len: STANDARD_PREFIX_LEN,
            dns_servers: default_dns(),
            mode: VmNetworkMode::Standard,
            runner_url: format!("http://{STANDARD_GATEWAY}:{}", self.runner_port()),
            reservation_token: None,
        })
    }

    fn runner_port(&self) -> u16 {
        self.config
            .listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse().ok())
            .unwrap_or(8001)
    }

    async fn bind_gpus(
        &self,
        requested: &[String],
    ) -> Result<(Vec<String>, Vec<String>, HashMap<String, Option<String>>)> {
        let inventory =
            super::heartbeat::classify_vfio_gpus(&super::heartbeat::scan_pci_functions());
        let mut companions = Vec::new();
        let mut original = HashMap::new();

        for addr in requested {
            let entry = inventory.iter().find(|g| &g.pci_addr == addr);
            let driver = self.vfio.bind_to_vfio(addr).await?;
            original.insert(addr.clone(), driver);
            if let Some(gpu) = entry {
                for audio in &gpu.audio_companions {
                    let driver = self.vfio.bind_to_vfio(audio).await?;
                    original.insert(audio.clone(), driver);
                    companions.push(audio.clone());
                }
            }
        }
        Ok((requested.to_vec(), companions, original))
    }

    async fn persist_spec(&self, dir: &Path, spec: &VmSpec) -> Result<()> {
        let json = serde_json::to_vec_pretty(spec)?;
        tokio::fs::write(dir.join("vm.json"), json).await?;
        Ok(())
    }

    async fn load_spec(&self, dir: &Path) -> Result<VmSpec> {
        let raw = tokio::fs::read(dir.join("vm.json")).await?;
        Ok(serde_json::from_slice(&raw)?)
    }

    /// Create the TAP, attach it, and fork QEMU (daemonized). Returns the
    /// daemon pid from the pidfile.
    async fn launch(&self, dir: &Path, spec: &VmSpec, seed_iso: &Path) -> Result<u32> {
        let tap = spec.network.tap_device.clone();
        delete_tap(&tap).await; // reconcile leftovers
        let tap_fd = create_tap(&tap)?;
        attach_tap(&tap, &spec.network.bridge_name).await?;

        let qmp_socket = dir.join("qmp.sock");
        let _ = tokio::fs::remove_file(&qmp_socket).await;
        let pidfile = dir.join("qemu.pid");
        let console_log = dir.join("console.log");
        let mut passthrough = spec.gpu_addrs.clone();
        passthrough.extend(spec.audio_companions.iter().cloned());
        let args = build_qemu_args(
            spec.task_id,
            spec.cores,
            spec.memory_mb,
            &dir.join("disk.qcow2"),
            seed_iso,
            &qmp_socket,
            &pidfile,
            &console_log,
            &passthrough,
        );

        let raw_fd = tap_fd.as_raw_fd();
        let mut cmd = tokio::process::Command::new("qemu-system-x86_64");
        cmd.args(&args);
        unsafe {
            cmd.pre_exec(move || {
                // dup2 clears O_CLOEXEC on the target fd, handing the TAP
                // to QEMU at the agreed number.
                if libc::dup2(raw_fd, QEMU_TAP_FD) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let output = cmd.output().await.context("spawn qemu-system-x86_64")?;
        drop(tap_fd); // the daemonized QEMU holds its own copy now
        if !output.status.success() {
            delete_tap(&tap).await;
            bail!(
                "qemu failed to start: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }

        let pid_raw = tokio::fs::read_to_string(&pidfile)
            .await
            .context("read qemu pidfile")?;
        pid_raw
            .trim()
            .parse()
            .with_context(|| format!("bad pidfile contents {pid_raw:?}"))
    }

    fn spawn_boot_watchdog(self: &Arc<Self>, task_id: i64) {
        let this = self.clone();
        let timeout = std::time::Duration::from_secs(this.config.vm_boot_timeout_secs);
        tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let still_booting = matches!(
                this.instances.read().await.get(&task_id).map(|i| i.state),
                Some(VmState::Booting)
            );
            if still_booting {
                error!(task = task_id, "VM never phoned home, failing");
                if let Err(e) = this.stop(task_id).await {
                    warn!(task = task_id, error = %e, "Boot-timeout stop failed");
                }
                this.host
                    .update(TaskStatusUpdate {
                        task_id,
                        status: TaskStatus::Failed,
                        exit_code: None,
                        error_message: Some("VM boot timeout".into()),
                        stdout_path: None,
                        stderr_path: None,
                    })
                    .await;
            }
        });
    }

    // ---- agent contract ----

    /// Cloud-init phone-home (or the first agent heartbeat) flips the VM to
    /// running and tells the Host.
    pub async fn phone_home(&self, task_id: i64) -> bool {
        let mut instances = self.instances.write().await;
        let Some(instance) = instances.get_mut(&task_id) else {
            return false;
        };
        if instance.state == VmState::Booting {
            instance.state = VmState::Running;
            drop(instances);
            info!(task = task_id, "VM phoned home");
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
        }
        true
    }

    pub async fn vm_heartbeat(&self, task_id: i64, beat: VmHeartbeat) -> bool {
        let known = self.instances.read().await.contains_key(&task_id);
        if known {
            // The first heartbeat counts as a phone-home.
            self.phone_home(task_id).await;
            if let Ok(ip) = beat.ip.parse::<Ipv4Addr>() {
                let mut instances = self.instances.write().await;
                if let Some(instance) = instances.get_mut(&task_id) {
                    instance.spec.network.vm_ip = ip;
                }
            }
        }
        known
    }

    // ---- stop / restart / cleanup ----

    /// ACPI first, SIGTERM next, SIGKILL last. The disk image persists; TAP,
    /// VFIO bindings, and IP allocations are released. Idempotent.
    pub async fn stop(&self, task_id: i64) -> Result<()> {
        let (spec, pid) = {
            let mut instances = self.instances.write().await;
            match instances.remove(&task_id) {
                Some(i) => (i.spec, i.pid),
                None => {
                    // Maybe a leftover from a previous process life.
                    let dir = self.instance_dir(task_id);
                    match self.load_spec(&dir).await {
                        Ok(spec) => {
                            let pid = read_pidfile(&dir).await;
                            (spec, pid)
                        }
                        Err(_) => return Ok(()),
                    }
                }
            }
        };

        if let Some(pid) = pid.filter(|p| pid_alive(*p)) {
            let qmp_path = self.instance_dir(task_id).join("qmp.sock");
            match qmp::QmpClient::connect(&qmp_path).await {
                Ok(mut client) => {
                    if let Err(e) = client.system_powerdown().await {
                        warn!(task = task_id, error = %e, "QMP powerdown failed");
                    }
                }
                Err(e) => warn!(task = task_id, error = %e, "QMP connect failed"),
            }

            let grace = std::time::Duration::from_secs(self.config.vm_shutdown_grace_secs);
            if !wait_for_exit(pid, grace).await {
                warn!(task = task_id, pid, "ACPI shutdown timed out, sending SIGTERM");
                unsafe { libc::kill(pid as i32, libc::SIGTERM) };
                if !wait_for_exit(pid, std::time::Duration::from_secs(5)).await {
                    warn!(task = task_id, pid, "SIGTERM ignored, sending SIGKILL");
                    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                }
            }
        }

        self.teardown_network_and_gpus(&spec).await;
        info!(task = task_id, "VM stopped");
        Ok(())
    }

    async fn teardown_network_and_gpus(&self, spec: &VmSpec) {
        delete_tap(&spec.network.tap_device).await;
        if spec.network.mode == VmNetworkMode::Standard {
            self.ip_pool.release(spec.network.vm_ip).await;
        }
        for (addr, original) in &spec.original_drivers {
            if let Err(e) = self.vfio.restore_driver(addr, original.as_deref()).await {
                warn!(device = %addr, error = %e, "Driver restore failed");
            }
        }
    }

    /// Relaunch a stopped VM from its persisted spec and existing disk. The
    /// seed ISO stays attached; NoCloud seeds are idempotent across boots.
    pub async fn restart(self: &Arc<Self>, task_id: i64) -> Result<VpsCreateResponse> {
        if self.instances.read().await.contains_key(&task_id) {
            bail!("vm {task_id} is already running");
        }
        let dir = self.instance_dir(task_id);
        let spec = self
            .load_spec(&dir)
            .await
            .with_context(|| format!("no persisted spec for vm {task_id}"))?;

        // Rebind passthrough devices for this boot.
        for addr in spec.gpu_addrs.iter().chain(spec.audio_companions.iter()) {
            self.vfio.bind_to_vfio(addr).await?;
        }

        let seed_iso = dir.join("seed.iso");
        let pid = self.launch(&dir, &spec, &seed_iso).await?;
        let ip = spec.network.vm_ip;
        self.instances.write().await.insert(
            task_id,
            VmInstance {
                spec,
                state: VmState::Booting,
                pid: Some(pid),
            },
        );
        self.spawn_boot_watchdog(task_id);
        info!(task = task_id, pid, "VM restarted");

        Ok(VpsCreateResponse {
            task_id,
            ip: Some(ip.to_string()),
            ssh_port: Some(22),
            ssh_private_key: None,
        })
    }

    /// Sweep the instance directory for state left by previous process
    /// lives: live VMs are re-adopted, orphaned QEMUs are killed, stale
    /// bindings are released. Idempotent.
    pub async fn cleanup(&self) -> Result<()> {
        let mut entries = match tokio::fs::read_dir(&self.config.vm_instances_dir).await {
            Ok(e) => e,
            Err(_) => return Ok(()), // nothing ever created
        };

        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(task_id) = instance_dir_task_id(&name.to_string_lossy()) else {
                continue;
            };
            if self.instances.read().await.contains_key(&task_id) {
                continue; // live and tracked
            }
            let dir = entry.path();
            let Ok(spec) = self.load_spec(&dir).await else {
                continue;
            };
            let pid = read_pidfile(&dir).await;

            match pid.filter(|p| pid_alive(*p)) {
                Some(pid) => {
                    warn!(task = task_id, pid, "Killing orphaned QEMU");
                    unsafe { libc::kill(pid as i32, libc::SIGKILL) };
                }
                None => {
                    info!(task = task_id, "Releasing stale VM bindings");
                }
            }
            self.teardown_network_and_gpus(&spec).await;
        }
        Ok(())
    }
}

async fn wait_for_exit(pid: u32, timeout: std::time::Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    while tokio::time::Instant::now() < deadline {
        if !pid_alive(pid) {
            return true;
        }
        tokio::time::sleep(std::time::Duration::from_millis(500)).await;
    }
    !pid_alive(pid)
}

async fn read_pidfile(dir: &Path) -> Option<u32> {
    tokio::fs::read_to_string(dir.join("qemu.pid"))
        .await
        .ok()
        .and_then(|s| s.trim().parse().ok())
}

fn default_dns() -> Vec<Ipv4Addr> {
    vec![Ipv4Addr::new(1, 1, 1, 1), Ipv4Addr::new(8, 8, 8, 8)]
}

/// Gateway address on the overlay bridge, read from the kernel.
async fn overlay_gateway() -> Result<Ipv4Addr> {
    let out = crate::overlay::run_cmd("ip", &["-o", "-4", "addr", "show", "dev", OVERLAY_BRIDGE])
        .await
        .context("overlay bridge has no address")?;
    parse_first_inet(&out).context("no inet address on overlay bridge")
}

async fn overlay_prefix_len() -> Option<u8> {
    let out = crate::overlay::run_cmd("ip", &["-o", "-4", "addr", "show", "dev", OVERLAY_BRIDGE])
        .await
        .ok()?;
    parse_first_prefix_len(&out)
}

/// Parse the address out of `ip -o -4 addr show` output:
/// "12: kohaku-overlay    inet 10.128.64.1/18 brd ... scope global ..."
pub fn parse_first_inet(output: &str) -> Option<Ipv4Addr> {
    let token = output.split_whitespace().skip_while(|t| *t != "inet").nth(1)?;
    token.split('/').next()?.parse().ok()
}

pub fn parse_first_prefix_len(output: &str) -> Option<u8> {
    let token = output.split_whitespace().skip_while(|t| *t != "inet").nth(1)?;
    token.split('/').nth(1)?.parse().ok()
}

async fn run_qemu_img(args: &[String]) -> Result<String> {
    let output = tokio::process::Command::new("qemu-img")
        .args(args)
        .output()
        .await
        .context("spawn qemu-img")?;
    if !output.status.success() {
        bail!(
            "qemu-img failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}
