use anyhow::{Context, Result};
use tokio::sync::RwLock;
use tracing::{info, warn};

use crate::overlay::{run_cmd, VXLAN_UDP_PORT};
use crate::protocol::OverlayAssignment;

/// Runner-side VXLAN endpoint device.
pub const RUNNER_VXLAN_DEVICE: &str = "vxlan0";

/// Bridge containers and VM TAPs attach to.
pub const RUNNER_BRIDGE: &str = "kohaku-overlay";

/// Docker network created on top of the bridge.
pub const DOCKER_NETWORK: &str = "kohakuriver-overlay";

/// Prefix length out of a CIDR string like "10.128.64.0/18".
pub fn cidr_prefix_len(cidr: &str) -> Option<u8> {
    cidr.split('/').nth(1)?.parse().ok()
}

/// Applies the Host's overlay assignment to this node: VXLAN point-to-point
/// back to the hub, the local bridge with the gateway address, a Docker
/// network on top, the hub route, and firewall rules. Every step reconciles
/// so re-registration is cheap.
pub struct RunnerOverlay {
    state: RwLock<Option<OverlayAssignment>>,
}

impl Default for RunnerOverlay {
    fn default() -> Self {
        Self::new()
    }
}

impl RunnerOverlay {
    pub fn new() -> Self {
        Self {
            state: RwLock::new(None),
        }
    }

    pub async fn assignment(&self) -> Option<OverlayAssignment> {
        self.state.read().await.clone()
    }

    pub async fn is_active(&self) -> bool {
        self.state.read().await.is_some()
    }

    pub async fn apply(&self, assignment: &OverlayAssignment) -> Result<()> {
        {
            // Unchanged assignment: the kernel state is already right.
            let current = self.state.read().await;
            if current
                .as_ref()
                .is_some_and(|c| {
                    c.vxlan_vni == assignment.vxlan_vni
                        && c.host_physical_ip == assignment.host_physical_ip
                        && c.runner_subnet == assignment.runner_subnet
                })
            {
                return Ok(());
            }
        }

        self.ensure_vxlan(assignment).await?;
        self.ensure_bridge(assignment).await?;
        self.ensure_docker_network(assignment).await?;
        self.ensure_routes(assignment).await?;
        self.ensure_firewall(assignment).await;

        *self.state.write().await = Some(assignment.clone());
        info!(
            subnet = %assignment.runner_subnet,
            gateway = %assignment.runner_gateway_ip,
            vni = assignment.vxlan_vni,
            "Overlay active"
        );
        Ok(())
    }

    async fn ensure_vxlan(&self, a: &OverlayAssignment) -> Result<()> {
        // Existing device with a different remote or VNI gets rebuilt.
        if run_cmd("ip", &["link", "show", "dev", RUNNER_VXLAN_DEVICE]).await.is_ok() {
            let detail = run_cmd("ip", &["-d", "-o", "link", "show", "dev", RUNNER_VXLAN_DEVICE])
                .await
                .unwrap_or_default();
            let matches = detail.contains(&format!("vxlan id {} ", a.vxlan_vni))
                && detail.contains(&format!("remote {} ", a.host_physical_ip));
            if !matches {
                warn!(device = RUNNER_VXLAN_DEVICE, "Rebuilding mismatched VXLAN device");
                run_cmd("ip", &["link", "del", RUNNER_VXLAN_DEVICE]).await?;
            } else {
                return Ok(());
            }
        }
        let vni = a.vxlan_vni.to_string();
        let port = VXLAN_UDP_PORT.to_string();
        run_cmd(
            "ip",
            &[
                "link", "add", RUNNER_VXLAN_DEVICE, "type", "vxlan", "id", &vni, "remote",
                &a.host_physical_ip, "dstport", &port, "nolearning",
            ],
        )
        .await
        .context("create runner VXLAN device")?;
        Ok(())
    }

    async fn ensure_bridge(&self, a: &OverlayAssignment) -> Result<()> {
        if run_cmd("ip", &["link", "show", "dev", RUNNER_BRIDGE]).await.is_err() {
            run_cmd("ip", &["link", "add", RUNNER_BRIDGE, "type", "bridge"])
                .await
                .context("create overlay bridge")?;
        }
        let prefix = cidr_prefix_len(&a.runner_subnet).unwrap_or(24);
        let addr = format!("{}/{}", a.runner_gateway_ip, prefix);
        let _ = run_cmd("ip", &["addr", "add", &addr, "dev", RUNNER_BRIDGE]).await;
        run_cmd("ip", &["link", "set", RUNNER_BRIDGE, "up"]).await?;
        run_cmd(
            "ip",
            &["link", "set", RUNNER_VXLAN_DEVICE, "master", RUNNER_BRIDGE],
        )
        .await?;
        run_cmd("ip", &["link", "set", RUNNER_VXLAN_DEVICE, "up"]).await?;
        Ok(())
    }

    async fn ensure_docker_network(&self, a: &OverlayAssignment) -> Result<()> {
        if run_cmd("docker", &["network", "inspect", DOCKER_NETWORK]).await.is_ok() {
            return Ok(());
        }
        let bridge_opt = format!("com.docker.network.bridge.name={RUNNER_BRIDGE}");
        run_cmd(
            "docker",
            &[
                "network", "create", "--driver", "bridge", "--subnet", &a.runner_subnet,
                "--gateway", &a.runner_gateway_ip, "--opt", &bridge_opt, DOCKER_NETWORK,
            ],
        )
        .await
        .context("create docker overlay network")?;
        Ok(())
    }

    async fn ensure_routes(&self, a: &OverlayAssignment) -> Result<()> {
        // Everything in the overlay that is not ours goes through the hub.
        run_cmd(
            "ip",
            &[
                "route", "replace", &a.overlay_cidr, "via", &a.host_vxlan_ip, "dev", RUNNER_BRIDGE,
            ],
        )
        .await
        .context("install hub route")?;
        Ok(())
    }

    async fn ensure_firewall(&self, a: &OverlayAssignment) {
        // FORWARD both ways for the overlay CIDR, deduplicated.
        for flag in ["-s", "-d"] {
            let rule = ["FORWARD", flag, a.overlay_cidr.as_str(), "-j", "ACCEPT"];
            let mut check = vec!["-C"];
            check.extend_from_slice(&rule);
            if run_cmd("iptables", &check).await.is_err() {
                let mut add = vec!["-A"];
                add.extend_from_slice(&rule);
                if let Err(e) = run_cmd("iptables", &add).await {
                    warn!(error = %e, "FORWARD rule install failed");
                }
            }
        }

        // NAT for container traffic leaving the overlay.
        let nat_rule = [
            "POSTROUTING",
            "-s",
            a.runner_subnet.as_str(),
            "!",
            "-d",
            a.overlay_cidr.as_str(),
            "-j",
            "MASQUERADE",
        ];
        let mut check = vec!["-t", "nat", "-C"];
        check.extend_from_slice(&nat_rule);
        if run_cmd("iptables", &check).await.is_err() {
            let mut add = vec!["-t", "nat", "-A"];
            add.extend_from_slice(&nat_rule);
            if let Err(e) = run_cmd("iptables", &add).await {
                warn!(error = %e, "MASQUERADE rule install failed");
            }
        }

        // firewalld, when present: trust the bridge. Best-effort.
        let _ = run_cmd(
            "firewall-cmd",
            &["--zone=trusted", &format!("--add-interface={RUNNER_BRIDGE}")],
        )
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn prefix_len_parses() {
        assert_eq!(cidr_prefix_len("10.128.64.0/18"), Some(18));
        assert_eq!(cidr_prefix_len("10.0.0.0/8"), Some(8));
        assert_eq!(cidr_prefix_len("10.0.0.0"), None);
        assert_eq!(cidr_prefix_len("10.0.0.0/x"), None);
    }
}
