use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Deserialize;

use crate::overlay::subnet::OverlaySubnetConfig;

/// Configuration file schema. Unknown keys are an error — typos in a config
/// file should fail loudly at boot, not silently fall back to defaults.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct FileConfig {
    #[serde(default)]
    pub host: HostFileConfig,
    #[serde(default)]
    pub runner: RunnerFileConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostFileConfig {
    pub listen_addr: Option<String>,
    pub database_url: Option<String>,
    pub overlay_subnet: Option<String>,
    pub base_vxlan_id: Option<u32>,
    pub auth_enabled: Option<bool>,
    pub heartbeat_interval_secs: Option<u64>,
    pub heartbeat_timeout_secs: Option<u64>,
    pub ssh_proxy_port_base: Option<u16>,
    pub reservation_secret: Option<String>,
    pub reservation_ttl_secs: Option<u64>,
    pub vm_reservation_ttl_secs: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct RunnerFileConfig {
    pub listen_addr: Option<String>,
    pub hostname: Option<String>,
    pub host_url: Option<String>,
    pub advertise_url: Option<String>,
    pub shared_dir: Option<String>,
    pub local_temp_dir: Option<String>,
    pub overlay_enabled: Option<bool>,
    pub allow_privileged: Option<bool>,
    pub heartbeat_interval_secs: Option<u64>,
    pub max_snapshots_per_vps: Option<usize>,
    pub ssh_port_base: Option<u16>,
    pub tunnel_client_path: Option<String>,
    pub vm_images_dir: Option<String>,
    pub vm_instances_dir: Option<String>,
    pub vm_boot_timeout_secs: Option<u64>,
    pub vm_shutdown_grace_secs: Option<u64>,
    pub kill_grace_secs: Option<u64>,
    pub tunnel_ping_interval_secs: Option<u64>,
}

/// Host process configuration.
#[derive(Debug, Clone)]
pub struct HostConfig {
    /// Bind address for the REST/WS API (default "0.0.0.0:8000").
    pub listen_addr: String,

    /// SQLite database URL.
    pub database_url: String,

    /// Overlay plan string `BASE/PREFIX/NODE_BITS/SUBNET_BITS`.
    pub overlay_subnet: OverlaySubnetConfig,

    /// VNI of runner N is `base_vxlan_id + N`.
    pub base_vxlan_id: u32,

    /// When true, submissions from role `user` require operator approval.
    pub auth_enabled: bool,

    /// Expected runner heartbeat cadence.
    pub heartbeat_interval_secs: u64,

    /// Seconds without a heartbeat before a node is marked offline.
    pub heartbeat_timeout_secs: u64,

    /// First host-side port handed to SSH-proxied VPS sessions.
    pub ssh_proxy_port_base: u16,

    /// Signing key for IP reservation tokens. Generated at boot when unset;
    /// tokens then do not survive a restart.
    pub reservation_secret: Option<String>,

    /// Default reservation TTL for container tasks.
    pub reservation_ttl_secs: u64,

    /// Default reservation TTL for VMs (longer: VM boot is slow).
    pub vm_reservation_ttl_secs: u64,
}

/// Runner process configuration.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    /// Bind address for the runner API (default "0.0.0.0:8001").
    pub listen_addr: String,

    /// This node's name, the registry primary key.
    pub hostname: String,

    /// Base URL of the Host API.
    pub host_url: String,

    /// URL the Host should use to reach this runner.
    pub advertise_url: String,

    /// Shared storage root (image tarballs, task logs).
    pub shared_dir: PathBuf,

    /// Node-local scratch directory mounted into containers.
    pub local_temp_dir: PathBuf,

    /// Join the VXLAN overlay on registration.
    pub overlay_enabled: bool,

    /// Permit tasks to request `--privileged`.
    pub allow_privileged: bool,

    pub heartbeat_interval_secs: u64,

    /// Snapshot rotation depth per Docker VPS.
    pub max_snapshots_per_vps: usize,

    /// First container SSH port.
    pub ssh_port_base: u16,

    /// Path to the kohaku-tunnel binary mounted read-only into containers.
    pub tunnel_client_path: PathBuf,

    /// Base qcow2 images.
    pub vm_images_dir: PathBuf,

    /// Per-VM instance directories (disk, seed ISO, QMP socket, pidfile).
    pub vm_instances_dir: PathBuf,

    pub vm_boot_timeout_secs: u64,
    pub vm_shutdown_grace_secs: u64,

    /// SIGTERM-to-SIGKILL window for subprocess kills.
    pub kill_grace_secs: u64,

    pub tunnel_ping_interval_secs: u64,
}

impl HostConfig {
    pub fn from_env() -> Result<Self> {
        let file = load_file_config()?;
        Self::resolve(file.host, &|k| std::env::var(k).ok())
    }

    /// Merge precedence: environment > config file > default.
    pub fn resolve(file: HostFileConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let subnet_spec = pick(
            env("KOHAKU_OVERLAY_SUBNET"),
            file.overlay_subnet,
            "10.128.0.0/12/6/14",
        );
        Ok(Self {
            listen_addr: pick(
                env("KOHAKU_HOST_LISTEN_ADDR"),
                file.listen_addr,
                "0.0.0.0:8000",
            ),
            database_url: pick(
                env("KOHAKU_DATABASE_URL"),
                file.database_url,
                "sqlite://kohakuriver.db",
            ),
            overlay_subnet: OverlaySubnetConfig::parse(&subnet_spec)
                .with_context(|| format!("invalid overlay subnet {subnet_spec:?}"))?,
            base_vxlan_id: pick_parse(env("KOHAKU_BASE_VXLAN_ID"), file.base_vxlan_id, 7000)?,
            auth_enabled: pick_parse(env("KOHAKU_AUTH_ENABLED"), file.auth_enabled, false)?,
            heartbeat_interval_secs: pick_parse(
                env("KOHAKU_HEARTBEAT_INTERVAL"),
                file.heartbeat_interval_secs,
                5,
            )?,
            heartbeat_timeout_secs: pick_parse(
                env("KOHAKU_HEARTBEAT_TIMEOUT"),
                file.heartbeat_timeout_secs,
                30,
            )?,
            ssh_proxy_port_base: pick_parse(
                env("KOHAKU_SSH_PROXY_PORT"),
                file.ssh_proxy_port_base,
                8002,
            )?,
            reservation_secret: env("KOHAKU_RESERVATION_SECRET").or(file.reservation_secret),
            reservation_ttl_secs: pick_parse(
                env("KOHAKU_RESERVATION_TTL"),
                file.reservation_ttl_secs,
                300,
            )?,
            vm_reservation_ttl_secs: pick_parse(
                env("KOHAKU_VM_RESERVATION_TTL"),
                file.vm_reservation_ttl_secs,
                1800,
            )?,
        })
    }
}

impl RunnerConfig {
    pub fn from_env() -> Result<Self> {
        let file = load_file_config()?;
        Self::resolve(file.runner, &|k| std::env::var(k).ok())
    }

    pub fn resolve(file: RunnerFileConfig, env: &dyn Fn(&str) -> Option<String>) -> Result<Self> {
        let hostname = match env("KOHAKU_RUNNER_HOSTNAME").or(file.hostname) {
            Some(h) => h,
            None => detect_hostname()?,
        };
        let listen_addr = pick(
            env("KOHAKU_RUNNER_LISTEN_ADDR"),
            file.listen_addr,
            "0.0.0.0:8001",
        );
        let runner_port = listen_addr
            .rsplit(':')
            .next()
            .and_then(|p| p.parse::<u16>().ok())
            .context("runner listen_addr has no port")?;
        let advertise_url = pick(
            env("KOHAKU_RUNNER_URL"),
            file.advertise_url,
            &format!("http://{hostname}:{runner_port}"),
        );
        let shared_dir = PathBuf::from(pick(
            env("KOHAKU_SHARED_DIR"),
            file.shared_dir,
            "/mnt/kohakuriver",
        ));

        Ok(Self {
            listen_addr,
            hostname,
            host_url: pick(
                env("KOHAKU_HOST_URL"),
                file.host_url,
                "http://localhost:8000",
            ),
            advertise_url,
            local_temp_dir: PathBuf::from(pick(
                env("KOHAKU_LOCAL_TEMP_DIR"),
                file.local_temp_dir,
                "/tmp/kohakuriver",
            )),
            overlay_enabled: pick_parse(env("KOHAKU_OVERLAY_ENABLED"), file.overlay_enabled, true)?,
            allow_privileged: pick_parse(
                env("KOHAKU_ALLOW_PRIVILEGED"),
                file.allow_privileged,
                false,
            )?,
            heartbeat_interval_secs: pick_parse(
                env("KOHAKU_HEARTBEAT_INTERVAL"),
                file.heartbeat_interval_secs,
                5,
            )?,
            max_snapshots_per_vps: pick_parse(
                env("KOHAKU_MAX_SNAPSHOTS"),
                file.max_snapshots_per_vps,
                5,
            )?,
            ssh_port_base: pick_parse(env("KOHAKU_SSH_PORT_BASE"), file.ssh_port_base, 9000)?,
            tunnel_client_path: PathBuf::from(pick(
                env("KOHAKU_TUNNEL_CLIENT_PATH"),
                file.tunnel_client_path,
                "/usr/local/bin/kohaku-tunnel",
            )),
            vm_images_dir: PathBuf::from(pick(
                env("KOHAKU_VM_IMAGES_DIR"),
                file.vm_images_dir,
                "/var/lib/kohakuriver/vm-images",
            )),
            vm_instances_dir: PathBuf::from(pick(
                env("KOHAKU_VM_INSTANCES_DIR"),
                file.vm_instances_dir,
                "/var/lib/kohakuriver/vm-instances",
            )),
            vm_boot_timeout_secs: pick_parse(
                env("KOHAKU_VM_BOOT_TIMEOUT"),
                file.vm_boot_timeout_secs,
                120,
            )?,
            vm_shutdown_grace_secs: pick_parse(
                env("KOHAKU_VM_SHUTDOWN_GRACE"),
                file.vm_shutdown_grace_secs,
                30,
            )?,
            kill_grace_secs: pick_parse(env("KOHAKU_KILL_GRACE"), file.kill_grace_secs, 10)?,
            tunnel_ping_interval_secs: pick_parse(
                env("KOHAKU_TUNNEL_PING_INTERVAL"),
                file.tunnel_ping_interval_secs,
                30,
            )?,
            shared_dir,
        })
    }

    /// Tarball directory on shared storage.
    pub fn container_dir(&self) -> PathBuf {
        self.shared_dir.join("kohakuriver-containers")
    }

    /// Task stdout/stderr log directory on shared storage.
    pub fn log_dir(&self) -> PathBuf {
        self.shared_dir.join("kohakuriver-logs")
    }
}

/// Read the config file named by KOHAKU_CONFIG, or `kohakuriver.toml` in the
/// working directory when present. A missing file is fine; a malformed or
/// unknown-key file is not.
fn load_file_config() -> Result<FileConfig> {
    let path = match std::env::var("KOHAKU_CONFIG") {
        Ok(p) => PathBuf::from(p),
        Err(_) => {
            let default = Path::new("kohakuriver.toml");
            if !default.exists() {
                return Ok(FileConfig::default());
            }
            default.to_path_buf()
        }
    };
    let raw = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    parse_file_config(&raw).with_context(|| format!("invalid config file {}", path.display()))
}

pub fn parse_file_config(raw: &str) -> Result<FileConfig> {
    Ok(toml::from_str(raw)?)
}

fn pick(env_val: Option<String>, file_val: Option<String>, default: &str) -> String {
    env_val.or(file_val).unwrap_or_else(|| default.to_string())
}

fn pick_parse<T>(env_val: Option<String>, file_val: Option<T>, default: T) -> Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match env_val {
        Some(raw) => raw.parse().with_context(|| format!("invalid value {raw:?}")),
        None => Ok(file_val.unwrap_or(default)),
    }
}

/// Node hostname from the kernel, trimmed.
fn detect_hostname() -> Result<String> {
    let raw = std::fs::read_to_string("/proc/sys/kernel/hostname")
        .context("failed to read hostname")?;
    Ok(raw.trim().to_string())
}

/// Source address the kernel would use to reach `host`. Used as the runner's
/// physical IP in registration; no packet is actually sent.
pub fn detect_physical_ip(host: &str, port: u16) -> Result<Ipv4Addr> {
    let sock = std::net::UdpSocket::bind("0.0.0.0:0").context("bind probe socket")?;
    sock.connect((host, port)).context("route probe connect")?;
    match sock.local_addr().context("probe local_addr")? {
        std::net::SocketAddr::V4(v4) => Ok(*v4.ip()),
        std::net::SocketAddr::V6(_) => anyhow::bail!("IPv6 source address; overlay requires IPv4"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn no_env(_: &str) -> Option<String> {
        None
    }

    #[test]
    fn host_defaults() {
        let cfg = HostConfig::resolve(HostFileConfig::default(), &no_env).unwrap();
        assert_eq!(cfg.listen_addr, "0.0.0.0:8000");
        assert_eq!(cfg.heartbeat_interval_secs, 5);
        assert_eq!(cfg.heartbeat_timeout_secs, 30);
        assert_eq!(cfg.ssh_proxy_port_base, 8002);
        assert_eq!(cfg.reservation_ttl_secs, 300);
        assert_eq!(cfg.vm_reservation_ttl_secs, 1800);
        assert!(!cfg.auth_enabled);
        assert_eq!(cfg.overlay_subnet.network_prefix, 12);
    }

    #[test]
    fn env_overrides_file_overrides_default() {
        let file = HostFileConfig {
            listen_addr: Some("0.0.0.0:9999".into()),
            heartbeat_timeout_secs: Some(60),
            ..Default::default()
        };
        let env_map: HashMap<&str, &str> = [("KOHAKU_HOST_LISTEN_ADDR", "127.0.0.1:8080")].into();
        let env = move |k: &str| env_map.get(k).map(|v| v.to_string());

        let cfg = HostConfig::resolve(file, &env).unwrap();
        assert_eq!(cfg.listen_addr, "127.0.0.1:8080"); // env wins
        assert_eq!(cfg.heartbeat_timeout_secs, 60); // file wins over default
        assert_eq!(cfg.heartbeat_interval_secs, 5); // default
    }

    #[test]
    fn bad_env_value_is_an_error() {
        let env = |k: &str| (k == "KOHAKU_HEARTBEAT_TIMEOUT").then(|| "soon".to_string());
        assert!(HostConfig::resolve(HostFileConfig::default(), &env).is_err());
    }

    #[test]
    fn file_parse_round_trip() {
        let cfg = parse_file_config(
            r#"
            [host]
            listen_addr = "0.0.0.0:8888"
            auth_enabled = true

            [runner]
            hostname = "node1"
            ssh_port_base = 9100
            "#,
        )
        .unwrap();
        assert_eq!(cfg.host.listen_addr.as_deref(), Some("0.0.0.0:8888"));
        assert_eq!(cfg.host.auth_enabled, Some(true));
        assert_eq!(cfg.runner.hostname.as_deref(), Some("node1"));
        assert_eq!(cfg.runner.ssh_port_base, Some(9100));
    }

    #[test]
    fn unknown_keys_are_an_error() {
        let err = parse_file_config(
            r#"
            [host]
            listen_adress = "0.0.0.0:8888"
            "#,
        )
        .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("listen_adress") || rendered.contains("unknown"));
    }

    #[test]
    fn runner_defaults_and_derived_paths() {
        let file = RunnerFileConfig {
            hostname: Some("node1".into()),
            ..Default::default()
        };
        let cfg = RunnerConfig::resolve(file, &no_env).unwrap();
        assert_eq!(cfg.advertise_url, "http://node1:8001");
        assert_eq!(
            cfg.container_dir(),
            PathBuf::from("/mnt/kohakuriver/kohakuriver-containers")
        );
        assert_eq!(
            cfg.log_dir(),
            PathBuf::from("/mnt/kohakuriver/kohakuriver-logs")
        );
        assert_eq!(cfg.ssh_port_base, 9000);
        assert_eq!(cfg.max_snapshots_per_vps, 5);
        assert_eq!(cfg.kill_grace_secs, 10);
    }

    #[test]
    fn runner_advertise_url_follows_listen_port() {
        let file = RunnerFileConfig {
            hostname: Some("node2".into()),
            listen_addr: Some("0.0.0.0:9001".into()),
            ..Default::default()
        };
        let cfg = RunnerConfig::resolve(file, &no_env).unwrap();
        assert_eq!(cfg.advertise_url, "http://node2:9001");
    }
}
