use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use super::network::VmNetworkInfo;

/// Everything the NoCloud seed needs to render.
pub struct CloudInitSpec<'a> {
    pub instance_id: String,
    pub hostname: String,
    pub ssh_authorized_keys: Vec<String>,
    pub task_id: i64,
    pub heartbeat_interval_secs: u64,
    pub network: &'a VmNetworkInfo,
}

/// cloud-config user-data: hostname, SSH keys, and the agent systemd unit
/// with its environment. The agent binary ships in the base image.
pub fn render_user_data(spec: &CloudInitSpec<'_>) -> String {
    let mut out = String::from("#cloud-config\n");
    out.push_str(&format!("hostname: {}\n", spec.hostname));
    out.push_str("preserve_hostname: false\n");

    if !spec.ssh_authorized_keys.is_empty() {
        out.push_str("ssh_authorized_keys:\n");
        for key in &spec.ssh_authorized_keys {
            out.push_str(&format!("  - {key}\n"));
        }
    }
    out.push_str("disable_root: false\n");

    out.push_str("write_files:\n");
    out.push_str("  - path: /etc/kohaku-agent.env\n");
    out.push_str("    permissions: '0644'\n");
    out.push_str("    content: |\n");
    out.push_str(&format!(
        "      KOHAKU_RUNNER_URL={}\n",
        spec.network.runner_url
    ));
    out.push_str(&format!("      KOHAKU_TASK_ID={}\n", spec.task_id));
    out.push_str(&format!(
        "      KOHAKU_HEARTBEAT_INTERVAL={}\n",
        spec.heartbeat_interval_secs
    ));
    out.push_str("  - path: /etc/systemd/system/kohaku-agent.service\n");
    out.push_str("    permissions: '0644'\n");
    out.push_str("    content: |\n");
    out.push_str("      [Unit]\n");
    out.push_str("      Description=KohakuRiver guest agent\n");
    out.push_str("      After=network-online.target\n");
    out.push_str("      Wants=network-online.target\n");
    out.push_str("      [Service]\n");
    out.push_str("      EnvironmentFile=/etc/kohaku-agent.env\n");
    out.push_str("      ExecStart=/usr/local/bin/kohaku-agent\n");
    out.push_str("      Restart=always\n");
    out.push_str("      RestartSec=5\n");
    out.push_str("      [Install]\n");
    out.push_str("      WantedBy=multi-user.target\n");

    out.push_str("runcmd:\n");
    out.push_str("  - systemctl daemon-reload\n");
    out.push_str("  - systemctl enable --now kohaku-agent.service\n");
    out
}

pub fn render_meta_data(spec: &CloudInitSpec<'_>) -> String {
    format!(
        "instance-id: {}\nlocal-hostname: {}\n",
        spec.instance_id, spec.hostname
    )
}

/// Netplan v2 network-config with the statically allocated address.
pub fn render_network_config(spec: &CloudInitSpec<'_>) -> String {
    let net = spec.network;
    let mut out = String::from("version: 2\nethernets:\n  primary:\n");
    out.push_str("    match:\n      name: \"en*\"\n");
    out.push_str("    dhcp4: false\n");
    out.push_str(&format!(
        "    addresses:\n      - {}/{}\n",
        net.vm_ip, net.prefix_len
    ));
    out.push_str(&format!(
        "    routes:\n      - to: default\n        via: {}\n",
        net.gateway
    ));
    if !net.dns_servers.is_empty() {
        out.push_str("    nameservers:\n      addresses:\n");
        for dns in &net.dns_servers {
            out.push_str(&format!("        - {dns}\n"));
        }
    }
    out
}

/// Write the three seed files and build a NoCloud ISO (volume id `cidata`).
pub async fn build_seed_iso(dir: &Path, spec: &CloudInitSpec<'_>) -> Result<PathBuf> {
    let seed_dir = dir.join("seed");
    tokio::fs::create_dir_all(&seed_dir).await?;
    tokio::fs::write(seed_dir.join("user-data"), render_user_data(spec)).await?;
    tokio::fs::write(seed_dir.join("meta-data"), render_meta_data(spec)).await?;
    tokio::fs::write(
        seed_dir.join("network-config"),
        render_network_config(spec),
    )
    .await?;

    let iso_path = dir.join("seed.iso");
    let output = tokio::process::Command::new("genisoimage")
        .arg("-output")
        .arg(&iso_path)
        .args(["-volid", "cidata", "-joliet", "-rock"])
        .arg(seed_dir.join("user-data"))
        .arg(seed_dir.join("meta-data"))
        .arg(seed_dir.join("network-config"))
        .output()
        .await
        .context("spawn genisoimage")?;
    if !output.status.success() {
        anyhow::bail!(
            "genisoimage failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(iso_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::vm::network::{VmNetworkMode, STANDARD_BRIDGE, STANDARD_GATEWAY};

    fn network() -> VmNetworkInfo {
        VmNetworkInfo {
            tap_device: "tap-000000002a".into(),
            vm_ip: "10.200.0.2".parse().unwrap(),
            gateway: STANDARD_GATEWAY,
            bridge_name: STANDARD_BRIDGE.into(),
            prefix_len: 24,
            dns_servers: vec!["1.1.1.1".parse().unwrap(), "8.8.8.8".parse().unwrap()],
            mode: VmNetworkMode::Standard,
            runner_url: "http://10.200.0.1:8001".into(),
            reservation_token: None,
        }
    }

    fn spec(net: &VmNetworkInfo) -> CloudInitSpec<'_> {
        CloudInitSpec {
            instance_id: "kohaku-vm-42".into(),
            hostname: "vps-42".into(),
            ssh_authorized_keys: vec!["ssh-ed25519 AAAA test".into()],
            task_id: 42,
            heartbeat_interval_secs: 15,
            network: net,
        }
    }

    #[test]
    fn user_data_carries_agent_environment() {
        let net = network();
        let rendered = render_user_data(&spec(&net));
        assert!(rendered.starts_with("#cloud-config\n"));
        assert!(rendered.contains("hostname: vps-42"));
        assert!(rendered.contains("KOHAKU_RUNNER_URL=http://10.200.0.1:8001"));
        assert!(rendered.contains("KOHAKU_TASK_ID=42"));
        assert!(rendered.contains("KOHAKU_HEARTBEAT_INTERVAL=15"));
        assert!(rendered.contains("ssh-ed25519 AAAA test"));
        assert!(rendered.contains("kohaku-agent.service"));
        assert!(rendered.contains("systemctl enable --now kohaku-agent.service"));
    }

    #[test]
    fn user_data_without_keys_omits_ssh_section() {
        let net = network();
        let mut s = spec(&net);
        s.ssh_authorized_keys.clear();
        let rendered = render_user_data(&s);
        assert!(!rendered.contains("ssh_authorized_keys"));
    }

    #[test]
    fn meta_data_has_instance_identity() {
        let net = network();
        assert_eq!(
            render_meta_data(&spec(&net)),
            "instance-id: kohaku-vm-42\nlocal-hostname: vps-42\n"
        );
    }

    #[test]
    fn network_config_is_static_netplan() {
        let net = network();
        let rendered = render_network_config(&spec(&net));
        assert!(rendered.starts_with("version: 2\n"));
        assert!(rendered.contains("dhcp4: false"));
        assert!(rendered.contains("- 10.200.0.2/24"));
        assert!(rendered.contains("via: 10.200.0.1"));
        assert!(rendered.contains("- 1.1.1.1"));
        assert!(rendered.contains("- 8.8.8.8"));
    }
}
