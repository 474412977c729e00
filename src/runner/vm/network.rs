use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::os::fd::{FromRawFd, OwnedFd};

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::info;

use crate::overlay::run_cmd;

/// Runner-side overlay bridge (created during overlay setup).
pub const OVERLAY_BRIDGE: &str = "kohaku-overlay";

/// NAT bridge used when the overlay is not available.
pub const STANDARD_BRIDGE: &str = "kohaku-br0";
pub const STANDARD_GATEWAY: Ipv4Addr = Ipv4Addr::new(10, 200, 0, 1);
pub const STANDARD_PREFIX_LEN: u8 = 24;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VmNetworkMode {
    Overlay,
    Standard,
}

/// Network attachment of one VM, for cloud-init rendering and teardown.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmNetworkInfo {
    pub tap_device: String,
    pub vm_ip: Ipv4Addr,
    pub gateway: Ipv4Addr,
    pub bridge_name: String,
    pub prefix_len: u8,
    pub dns_servers: Vec<Ipv4Addr>,
    pub mode: VmNetworkMode,
    /// URL the in-guest agent phones home to.
    pub runner_url: String,
    pub reservation_token: Option<String>,
}

impl VmNetworkInfo {
    pub fn netmask(&self) -> Ipv4Addr {
        let bits = !0u32 << (32 - self.prefix_len as u32);
        Ipv4Addr::from(bits)
    }
}

/// TAP names must fit IFNAMSIZ (15 chars + NUL). `tap-` plus the low 40
/// bits of the task id in hex is 14 characters.
pub fn tap_name(task_id: i64) -> String {
    format!("tap-{:010x}", (task_id as u64) & 0xff_ffff_ffff)
}

/// Deterministic locally-administered MAC from the task id.
pub fn vm_mac(task_id: i64) -> String {
    let id = task_id as u64;
    format!(
        "52:54:{:02x}:{:02x}:{:02x}:{:02x}",
        (id >> 24) & 0xff,
        (id >> 16) & 0xff,
        (id >> 8) & 0xff,
        id & 0xff
    )
}

/// Create a TAP device via /dev/net/tun. Returns the open fd; QEMU inherits
/// it, and the device disappears when every fd is gone (no persist flag).
pub fn create_tap(name: &str) -> Result<OwnedFd> {
    if name.len() > 15 {
        bail!("TAP name {name:?} exceeds IFNAMSIZ");
    }

    // struct ifreq: 16 bytes name, then the union (flags in the first 2).
    const TUNSETIFF: libc::c_ulong = 0x4004_54ca;
    const IFF_TAP: libc::c_short = 0x0002;
    const IFF_NO_PI: libc::c_short = 0x1000;

    let fd = unsafe {
        libc::open(
            c"/dev/net/tun".as_ptr(),
            libc::O_RDWR | libc::O_CLOEXEC,
        )
    };
    if fd < 0 {
        return Err(std::io::Error::last_os_error()).context("open /dev/net/tun");
    }
    let owned = unsafe { OwnedFd::from_raw_fd(fd) };

    let mut ifr = [0u8; 40];
    ifr[..name.len()].copy_from_slice(name.as_bytes());
    let flags = (IFF_TAP | IFF_NO_PI).to_ne_bytes();
    ifr[16..18].copy_from_slice(&flags);

    let rc = unsafe { libc::ioctl(fd, TUNSETIFF, ifr.as_mut_ptr()) };
    if rc < 0 {
        return Err(std::io::Error::last_os_error())
            .with_context(|| format!("TUNSETIFF {name}"));
    }
    Ok(owned)
}

/// Attach a TAP to a bridge and bring it up.
pub async fn attach_tap(name: &str, bridge: &str) -> Result<()> {
    run_cmd("ip", &["link", "set", name, "master", bridge]).await?;
    run_cmd("ip", &["link", "set", name, "up"]).await?;
    Ok(())
}

/// Remove a TAP device. Idempotent ("Cannot find device" is fine).
pub async fn delete_tap(name: &str) {
    let _ = run_cmd("ip", &["link", "del", name]).await;
}

pub async fn bridge_exists(name: &str) -> bool {
    run_cmd("ip", &["link", "show", "dev", name]).await.is_ok()
}

/// Create the standard NAT bridge when missing: address 10.200.0.1/24,
/// forwarding on, MASQUERADE for the subnet. Every step is reconciling.
pub async fn ensure_standard_bridge() -> Result<()> {
    if !bridge_exists(STANDARD_BRIDGE).await {
        run_cmd("ip", &["link", "add", STANDARD_BRIDGE, "type", "bridge"])
            .await
            .context("create standard bridge")?;
    }
    let cidr = format!("{STANDARD_GATEWAY}/{STANDARD_PREFIX_LEN}");
    let _ = run_cmd("ip", &["addr", "add", &cidr, "dev", STANDARD_BRIDGE]).await;
    run_cmd("ip", &["link", "set", STANDARD_BRIDGE, "up"]).await?;
    tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .await
        .context("enable forwarding")?;

    let subnet = "10.200.0.0/24";
    let rule = ["POSTROUTING", "-s", subnet, "-j", "MASQUERADE"];
    let mut check = vec!["-t", "nat", "-C"];
    check.extend_from_slice(&rule);
    if run_cmd("iptables", &check).await.is_err() {
        let mut add = vec!["-t", "nat", "-A"];
        add.extend_from_slice(&rule);
        run_cmd("iptables", &add).await.context("masquerade rule")?;
    }
    info!(bridge = STANDARD_BRIDGE, "Standard VM bridge ready");
    Ok(())
}

/// Sequential allocator for the standard bridge's /24.
pub struct StandardIpPool {
    used: Mutex<HashSet<Ipv4Addr>>,
}

impl StandardIpPool {
    pub fn new() -> Self {
        Self {
            used: Mutex::new(HashSet::new()),
        }
    }

    pub async fn allocate(&self) -> Result<Ipv4Addr> {
        let mut used = self.used.lock().await;
        let base = u32::from(STANDARD_GATEWAY);
        // .2 through .254 (.1 is the gateway, .255 broadcast).
        for offset in 1..=253u32 {
            let ip = Ipv4Addr::from(base + offset);
            if used.insert(ip) {
                return Ok(ip);
            }
        }
        bail!("standard VM IP pool exhausted")
    }

    pub async fn release(&self, ip: Ipv4Addr) {
        self.used.lock().await.remove(&ip);
    }
}

impl Default for StandardIpPool {
    fn default() -> Self {
        Self::new()
    }
}
