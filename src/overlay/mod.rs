pub mod reservation;
pub mod subnet;

use std::collections::{HashMap, HashSet};
use std::net::Ipv4Addr;

use anyhow::{bail, Context, Result};
use chrono::Utc;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::protocol::OverlayAssignment;
use reservation::IpRange;
use subnet::{parse_vxlan_device_name, vxlan_device_name, OverlaySubnetConfig};

/// VXLAN encapsulation port (IANA).
pub const VXLAN_UDP_PORT: u16 = 4789;

/// Host-side dummy interface carrying the root overlay CIDR.
pub const HOST_DUMMY_DEVICE: &str = "kohaku-host";

/// One runner's slot in the overlay.
#[derive(Debug, Clone, Serialize)]
pub struct OverlayAllocation {
    pub runner_name: String,
    pub runner_id: u32,
    pub physical_ip: Ipv4Addr,
    pub last_used: i64,
    /// Recovered from a kernel interface after a Host restart, awaiting a
    /// matching re-registration.
    pub placeholder: bool,
}

/// Interface work the manager must perform after a table decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkAction {
    /// Device already correct — nothing to do beyond reconciliation.
    Reuse,
    /// Physical IP changed: tear down and recreate with the new remote.
    Recreate { old_ip: Ipv4Addr },
    /// A placeholder matched; the interface is already in place.
    ClaimPlaceholder,
    /// Fresh id: create the device.
    Create,
    /// Pool was full: an inactive allocation was evicted first.
    EvictAndCreate { evicted_device: String },
}

/// Pure allocation bookkeeping, separated from interface manipulation so the
/// id/eviction policy is testable without netlink.
#[derive(Debug, Default)]
pub struct AllocationTable {
    by_name: HashMap<String, OverlayAllocation>,
}

impl AllocationTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, runner_name: &str) -> Option<&OverlayAllocation> {
        self.by_name.get(runner_name)
    }

    pub fn list(&self) -> Vec<&OverlayAllocation> {
        let mut all: Vec<_> = self.by_name.values().collect();
        all.sort_by_key(|a| a.runner_id);
        all
    }

    pub fn remove(&mut self, runner_name: &str) -> Option<OverlayAllocation> {
        self.by_name.remove(runner_name)
    }

    fn used_ids(&self) -> HashSet<u32> {
        self.by_name.values().map(|a| a.runner_id).collect()
    }

    fn lowest_free_id(&self, max_id: u32) -> Option<u32> {
        let used = self.used_ids();
        (1..=max_id).find(|id| !used.contains(id))
    }

    /// Register a recovered kernel interface as a placeholder named
    /// `runner_<id>`. Ignored when the id is already taken.
    pub fn insert_placeholder(&mut self, runner_id: u32, remote: Ipv4Addr, now: i64) {
        if self.used_ids().contains(&runner_id) {
            return;
        }
        let name = format!("runner_{runner_id}");
        self.by_name.insert(
            name.clone(),
            OverlayAllocation {
                runner_name: name,
                runner_id,
                physical_ip: remote,
                last_used: now,
                placeholder: true,
            },
        );
    }

    /// Allocate (or re-validate) a slot for a registering runner.
    ///
    /// `online` names runners with a live heartbeat — only allocations
    /// outside this set are eviction candidates when the id pool is full.
    pub fn allocate(
        &mut self,
        runner_name: &str,
        physical_ip: Ipv4Addr,
        max_id: u32,
        online: &HashSet<String>,
        now: i64,
    ) -> Result<(OverlayAllocation, LinkAction)> {
        // Existing non-placeholder allocation for this runner.
        if let Some(existing) = self.by_name.get_mut(runner_name) {
            existing.last_used = now;
            if existing.physical_ip == physical_ip {
                return Ok((existing.clone(), LinkAction::Reuse));
            }
            let old_ip = existing.physical_ip;
            existing.physical_ip = physical_ip;
            return Ok((existing.clone(), LinkAction::Recreate { old_ip }));
        }

        // A placeholder whose recovered remote matches this runner's address
        // is claimed in place — no interface churn on Host restart.
        let claim = self
            .by_name
            .values()
            .find(|a| a.placeholder && a.physical_ip == physical_ip)
            .map(|a| a.runner_name.clone());
        if let Some(old_name) = claim {
            let mut alloc = self.by_name.remove(&old_name).expect("just found");
            alloc.runner_name = runner_name.to_string();
            alloc.placeholder = false;
            alloc.last_used = now;
            self.by_name.insert(runner_name.to_string(), alloc.clone());
            return Ok((alloc, LinkAction::ClaimPlaceholder));
        }

        // Fresh id, evicting the least-recently-used inactive slot if needed.
        let (id, action) = match self.lowest_free_id(max_id) {
            Some(id) => (id, LinkAction::Create),
            None => {
                let victim = self
                    .by_name
                    .values()
                    .filter(|a| !online.contains(&a.runner_name))
                    .min_by_key(|a| a.last_used)
                    .map(|a| a.runner_name.clone());
                let Some(victim_name) = victim else {
                    bail!("overlay runner id pool exhausted and every allocation is active");
                };
                let evicted = self.by_name.remove(&victim_name).expect("just found");
                info!(
                    evicted = %evicted.runner_name,
                    runner_id = evicted.runner_id,
                    "Evicted inactive overlay allocation"
                );
                (
                    evicted.runner_id,
                    LinkAction::EvictAndCreate {
                        evicted_device: vxlan_device_name(evicted.runner_id),
                    },
                )
            }
        };

        let alloc = OverlayAllocation {
            runner_name: runner_name.to_string(),
            runner_id: id,
            physical_ip,
            last_used: now,
            placeholder: false,
        };
        self.by_name.insert(runner_name.to_string(), alloc.clone());
        Ok((alloc, action))
    }
}

/// A VXLAN link recovered from `ip -d -o link show`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecoveredLink {
    pub device: String,
    pub runner_id: u32,
    pub vni: u32,
    pub remote: Option<Ipv4Addr>,
}

/// Parse `ip -d -o link show type vxlan` output into candidate links.
/// Devices that do not carry the `vxkr` prefix are ignored entirely;
/// malformed `vxkr*` entries are returned with what could be read so the
/// caller can destroy them.
pub fn parse_vxlan_links(output: &str) -> Vec<RecoveredLink> {
    let mut links = Vec::new();
    for line in output.lines() {
        // "14: vxkr1: <BROADCAST,...> ... vxlan id 7001 remote 192.168.1.10 ..."
        let mut parts = line.splitn(3, ':');
        let _index = parts.next();
        let Some(raw_name) = parts.next() else { continue };
        let device = raw_name.trim().split('@').next().unwrap_or("").to_string();

        let Some(runner_id) = parse_vxlan_device_name(&device) else {
            continue;
        };

        let rest = parts.next().unwrap_or("");
        let tokens: Vec<&str> = rest.split_whitespace().collect();
        let vni = tokens
            .windows(3)
            .find(|w| w[0] == "vxlan" && w[1] == "id")
            .and_then(|w| w[2].parse().ok());
        let remote = tokens
            .windows(2)
            .find(|w| w[0] == "remote")
            .and_then(|w| w[1].parse().ok());

        links.push(RecoveredLink {
            device,
            runner_id,
            vni: vni.unwrap_or(0),
            remote,
        });
    }
    links
}

/// Hub-side overlay manager: owns the allocation table and every `vxkr*`
/// interface on the Host. All operations serialize through one mutex.
pub struct OverlayManager {
    pub subnet: OverlaySubnetConfig,
    pub base_vxlan_id: u32,
    table: Mutex<AllocationTable>,
}

impl OverlayManager {
    pub fn new(subnet: OverlaySubnetConfig, base_vxlan_id: u32) -> Self {
        Self {
            subnet,
            base_vxlan_id,
            table: Mutex::new(AllocationTable::new()),
        }
    }

    /// Host boot sequence: forwarding, dummy interface, firewall rules, and
    /// the recovery pass over surviving `vxkr*` interfaces. Running this
    /// twice is a no-op (recovery is a fixpoint).
    pub async fn init(&self) -> Result<()> {
        enable_ip_forwarding().await?;
        self.ensure_host_dummy().await?;
        self.ensure_forward_rules().await?;
        self.recover_from_kernel().await?;
        Ok(())
    }

    async fn ensure_host_dummy(&self) -> Result<()> {
        if !link_exists(HOST_DUMMY_DEVICE).await {
            run_ip(&["link", "add", HOST_DUMMY_DEVICE, "type", "dummy"])
                .await
                .context("create kohaku-host dummy interface")?;
        }
        let addr = format!("{}/{}", self.subnet.host_dummy_ip(), self.subnet.network_prefix);
        // "already assigned" is fine.
        let _ = run_ip(&["addr", "add", &addr, "dev", HOST_DUMMY_DEVICE]).await;
        run_ip(&["link", "set", HOST_DUMMY_DEVICE, "up"]).await?;
        info!(device = HOST_DUMMY_DEVICE, addr = %addr, "Host overlay anchor interface up");
        Ok(())
    }

    async fn ensure_forward_rules(&self) -> Result<()> {
        let cidr = self.subnet.root_cidr();
        // One rule per direction, added only when `iptables -C` says it is
        // missing (keeps restarts from stacking duplicates).
        for flag in ["-s", "-d"] {
            let rule = ["FORWARD", flag, cidr.as_str(), "-j", "ACCEPT"];
            let mut check = vec!["-C"];
            check.extend_from_slice(&rule);
            if run_cmd("iptables", &check).await.is_err() {
                let mut add = vec!["-A"];
                add.extend_from_slice(&rule);
                run_cmd("iptables", &add)
                    .await
                    .context("install overlay FORWARD rule")?;
            }
        }
        Ok(())
    }

    /// Scan surviving `vxkr*` interfaces into placeholder allocations;
    /// destroy interfaces that fail validation.
    async fn recover_from_kernel(&self) -> Result<()> {
        let output = run_ip(&["-d", "-o", "link", "show", "type", "vxlan"])
            .await
            .unwrap_or_default();
        let links = parse_vxlan_links(&output);

        let mut table = self.table.lock().await;
        let now = Utc::now().timestamp();
        for link in links {
            let expected_vni = self.base_vxlan_id + link.runner_id;
            let valid = link.runner_id >= 1
                && link.runner_id <= self.subnet.max_runner_id()
                && link.vni == expected_vni;
            if !valid {
                warn!(
                    device = %link.device,
                    vni = link.vni,
                    expected_vni,
                    "Destroying invalid recovered VXLAN interface"
                );
                let _ = run_ip(&["link", "del", &link.device]).await;
                continue;
            }
            if table.get(&format!("runner_{}", link.runner_id)).is_some() {
                continue; // second recovery pass: already recovered
            }
            let remote = link.remote.unwrap_or(Ipv4Addr::UNSPECIFIED);
            info!(
                device = %link.device,
                runner_id = link.runner_id,
                remote = %remote,
                "Recovered overlay allocation from kernel interface"
            );
            table.insert_placeholder(link.runner_id, remote, now);
        }
        Ok(())
    }

    /// Allocate overlay parameters for a registering runner and make the
    /// kernel state match. `online` lists runners with live heartbeats
    /// (eviction protection).
    pub async fn register_runner(
        &self,
        runner_name: &str,
        physical_ip: Ipv4Addr,
        host_physical_ip: &str,
        online: &HashSet<String>,
    ) -> Result<OverlayAssignment> {
        let mut table = self.table.lock().await;
        let now = Utc::now().timestamp();
        let (alloc, action) = table.allocate(
            runner_name,
            physical_ip,
            self.subnet.max_runner_id(),
            online,
            now,
        )?;
        let device = vxlan_device_name(alloc.runner_id);
        let vni = self.base_vxlan_id + alloc.runner_id;

        match &action {
            LinkAction::Reuse | LinkAction::ClaimPlaceholder => {
                debug!(runner = %runner_name, device = %device, ?action, "Overlay allocation reused");
            }
            LinkAction::Recreate { old_ip } => {
                warn!(
                    runner = %runner_name,
                    device = %device,
                    old_ip = %old_ip,
                    new_ip = %physical_ip,
                    "Runner physical IP changed — rebuilding VXLAN; in-flight cross-node traffic will drop"
                );
                let _ = run_ip(&["link", "del", &device]).await;
            }
            LinkAction::Create => {}
            LinkAction::EvictAndCreate { evicted_device } => {
                let _ = run_ip(&["link", "del", evicted_device]).await;
            }
        }

        self.ensure_vxlan_device(&device, vni, physical_ip, alloc.runner_id)
            .await?;

        Ok(OverlayAssignment {
            runner_id: alloc.runner_id,
            runner_subnet: self.subnet.runner_cidr(alloc.runner_id)?,
            runner_gateway_ip: self.subnet.runner_gateway(alloc.runner_id)?.to_string(),
            host_vxlan_ip: self.subnet.host_vxlan_ip(alloc.runner_id)?.to_string(),
            vxlan_vni: vni,
            host_physical_ip: host_physical_ip.to_string(),
            overlay_cidr: self.subnet.root_cidr(),
        })
    }

    /// Create the per-runner VXLAN device, reconciling an existing one:
    /// right VNI and remote means reuse, anything else means recreate.
    async fn ensure_vxlan_device(
        &self,
        device: &str,
        vni: u32,
        remote: Ipv4Addr,
        runner_id: u32,
    ) -> Result<()> {
        if link_exists(device).await {
            let detail = run_ip(&["-d", "-o", "link", "show", "dev", device])
                .await
                .unwrap_or_default();
            let parsed = parse_vxlan_links(&detail);
            let matches = parsed
                .first()
                .is_some_and(|l| l.vni == vni && l.remote == Some(remote));
            if matches {
                debug!(device = %device, "Existing VXLAN device matches, reusing");
                run_ip(&["link", "set", device, "up"]).await?;
                return Ok(());
            }
            warn!(device = %device, "Existing VXLAN device mismatched, recreating");
            run_ip(&["link", "del", device]).await?;
        }

        let vni_s = vni.to_string();
        let remote_s = remote.to_string();
        let port_s = VXLAN_UDP_PORT.to_string();
        run_ip(&[
            "link", "add", device, "type", "vxlan", "id", &vni_s, "remote", &remote_s,
            "dstport", &port_s, "nolearning",
        ])
        .await
        .with_context(|| format!("create VXLAN device {device}"))?;

        let host_ip = self.subnet.host_vxlan_ip(runner_id)?;
        let addr = format!("{}/{}", host_ip, self.subnet.runner_prefix());
        let _ = run_ip(&["addr", "add", &addr, "dev", device]).await;
        run_ip(&["link", "set", device, "up"]).await?;
        info!(device = %device, vni, remote = %remote, addr = %addr, "VXLAN device up");
        Ok(())
    }

    /// Tear down a runner's overlay slot. Idempotent.
    pub async fn release_runner(&self, runner_name: &str) -> Result<()> {
        let mut table = self.table.lock().await;
        if let Some(alloc) = table.remove(runner_name) {
            let device = vxlan_device_name(alloc.runner_id);
            let _ = run_ip(&["link", "del", &device]).await;
            info!(runner = %runner_name, device = %device, "Released overlay allocation");
        }
        Ok(())
    }

    pub async fn status(&self) -> Vec<OverlayAllocation> {
        let table = self.table.lock().await;
        table.list().into_iter().cloned().collect()
    }

    /// Container-assignable range for a registered runner, for the IP
    /// reservation endpoints. None when the runner has no allocation.
    pub async fn ip_range_for(&self, runner_name: &str) -> Option<IpRange> {
        let table = self.table.lock().await;
        let alloc = table.get(runner_name)?;
        let (first, last) = self.subnet.container_range(alloc.runner_id).ok()?;
        Some(IpRange {
            first,
            last,
            gateway: self.subnet.runner_gateway(alloc.runner_id).ok()?,
            host_vxlan_ip: self.subnet.host_vxlan_ip(alloc.runner_id).ok()?,
        })
    }

}

async fn enable_ip_forwarding() -> Result<()> {
    tokio::fs::write("/proc/sys/net/ipv4/ip_forward", "1")
        .await
        .context("enable IPv4 forwarding")
}

async fn link_exists(device: &str) -> bool {
    run_ip(&["link", "show", "dev", device]).await.is_ok()
}

async fn run_ip(args: &[&str]) -> Result<String> {
    run_cmd("ip", args).await
}

/// Run an external tool, returning stdout; non-zero exit becomes an error
/// carrying stderr.
pub(crate) async fn run_cmd(program: &str, args: &[&str]) -> Result<String> {
    let output = tokio::process::Command::new(program)
        .args(args)
        .output()
        .await
        .with_context(|| format!("failed to spawn {program}"))?;
    if !output.status.success() {
        bail!(
            "{program} {} failed: {}",
            args.join(" "),
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(s: &str) -> Ipv4Addr {
        s.parse().unwrap()
    }

    fn no_online() -> HashSet<String> {
        HashSet::new()
    }

    // ── allocation table ──

    #[test]
    fn fresh_allocations_take_lowest_ids() {
        let mut t = AllocationTable::new();
        let (a, act) = t.allocate("node1", ip("192.168.1.10"), 63, &no_online(), 100).unwrap();
        assert_eq!(a.runner_id, 1);
        assert_eq!(act, LinkAction::Create);

        let (b, _) = t.allocate("node2", ip("192.168.1.11"), 63, &no_online(), 101).unwrap();
        assert_eq!(b.runner_id, 2);
    }

    #[test]
    fn same_ip_reuses_allocation() {
        let mut t = AllocationTable::new();
        t.allocate("node1", ip("192.168.1.10"), 63, &no_online(), 100).unwrap();
        let (a, act) = t.allocate("node1", ip("192.168.1.10"), 63, &no_online(), 200).unwrap();
        assert_eq!(a.runner_id, 1);
        assert_eq!(act, LinkAction::Reuse);
        assert_eq!(a.last_used, 200);
    }

    #[test]
    fn changed_ip_triggers_recreate() {
        let mut t = AllocationTable::new();
        t.allocate("node1", ip("192.168.1.10"), 63, &no_online(), 100).unwrap();
        let (a, act) = t.allocate("node1", ip("192.168.1.99"), 63, &no_online(), 200).unwrap();
        assert_eq!(a.runner_id, 1);
        assert_eq!(
            act,
            LinkAction::Recreate {
                old_ip: ip("192.168.1.10")
            }
        );
        assert_eq!(a.physical_ip, ip("192.168.1.99"));
    }

    #[test]
    fn placeholder_claim_by_matching_ip() {
        let mut t = AllocationTable::new();
        t.insert_placeholder(3, ip("192.168.1.30"), 50);

        let (a, act) = t.allocate("node3", ip("192.168.1.30"), 63, &no_online(), 100).unwrap();
        assert_eq!(a.runner_id, 3);
        assert_eq!(act, LinkAction::ClaimPlaceholder);
        assert!(!a.placeholder);
        assert!(t.get("runner_3").is_none());
        assert!(t.get("node3").is_some());
    }

    #[test]
    fn unmatched_placeholder_keeps_its_slot() {
        let mut t = AllocationTable::new();
        t.insert_placeholder(1, ip("192.168.1.30"), 50);

        // Different physical IP: gets a new id, placeholder survives.
        let (a, act) = t.allocate("node9", ip("192.168.1.99"), 63, &no_online(), 100).unwrap();
        assert_eq!(a.runner_id, 2);
        assert_eq!(act, LinkAction::Create);
        assert!(t.get("runner_1").is_some());
    }

    #[test]
    fn pool_exhaustion_evicts_lru_inactive() {
        let mut t = AllocationTable::new();
        // Fill a 2-slot pool; node1 is older.
        t.allocate("node1", ip("10.0.0.1"), 2, &no_online(), 100).unwrap();
        t.allocate("node2", ip("10.0.0.2"), 2, &no_online(), 200).unwrap();

        // node2 is online and protected; node1 is evicted despite age order.
        let online: HashSet<String> = ["node2".to_string()].into();
        let (a, act) = t.allocate("node3", ip("10.0.0.3"), 2, &online, 300).unwrap();
        assert_eq!(a.runner_id, 1);
        assert_eq!(
            act,
            LinkAction::EvictAndCreate {
                evicted_device: "vxkr1".into()
            }
        );
        assert!(t.get("node1").is_none());
    }

    #[test]
    fn pool_exhaustion_with_all_active_fails() {
        let mut t = AllocationTable::new();
        t.allocate("node1", ip("10.0.0.1"), 1, &no_online(), 100).unwrap();
        let online: HashSet<String> = ["node1".to_string()].into();
        assert!(t.allocate("node2", ip("10.0.0.2"), 1, &online, 200).is_err());
    }

    #[test]
    fn placeholder_insert_is_idempotent() {
        let mut t = AllocationTable::new();
        t.insert_placeholder(1, ip("10.0.0.1"), 100);
        t.insert_placeholder(1, ip("10.0.0.9"), 200);
        assert_eq!(t.list().len(), 1);
        assert_eq!(t.get("runner_1").unwrap().physical_ip, ip("10.0.0.1"));
    }

    // ── invariant 3: device/VNI/id are consistent and unique ──

    #[test]
    fn ids_devices_and_vnis_are_pairwise_unique() {
        let base_vni = 7000u32;
        let mut t = AllocationTable::new();
        for i in 0..10u32 {
            t.allocate(
                &format!("node{i}"),
                Ipv4Addr::from(0x0a00_0001u32 + i),
                63,
                &no_online(),
                i as i64,
            )
            .unwrap();
        }
        let allocs = t.list();
        let ids: HashSet<u32> = allocs.iter().map(|a| a.runner_id).collect();
        let devices: HashSet<String> =
            allocs.iter().map(|a| vxlan_device_name(a.runner_id)).collect();
        let vnis: HashSet<u32> = allocs.iter().map(|a| base_vni + a.runner_id).collect();
        assert_eq!(ids.len(), 10);
        assert_eq!(devices.len(), 10);
        assert_eq!(vnis.len(), 10);
        for a in allocs {
            assert!(a.runner_id >= 1 && a.runner_id <= 63);
        }
    }

    // ── recovery parser ──

    const IP_LINK_OUTPUT: &str = "\
14: vxkr1: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT group default \\    link/ether aa:bb:cc:dd:ee:01 brd ff:ff:ff:ff:ff:ff promiscuity 0 minmtu 68 maxmtu 65535 \\    vxlan id 7001 remote 192.168.1.10 dev eth0 srcport 0 0 dstport 4789 nolearning ttl auto ageing 300\n\
15: vxkr2: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT group default \\    vxlan id 7002 remote 192.168.1.11 dev eth0 srcport 0 0 dstport 4789 nolearning\n\
16: vxlan0: <BROADCAST,MULTICAST> mtu 1450 qdisc noqueue state DOWN mode DEFAULT group default \\    vxlan id 9999 remote 10.0.0.1 dstport 4789\n\
17: vxkr3: <BROADCAST,MULTICAST,UP,LOWER_UP> mtu 1450 qdisc noqueue state UNKNOWN mode DEFAULT group default \\    vxlan id 1234 remote 192.168.1.12 dstport 4789\n";

    #[test]
    fn parse_vxlan_links_extracts_vxkr_devices() {
        let links = parse_vxlan_links(IP_LINK_OUTPUT);
        assert_eq!(links.len(), 3); // vxlan0 skipped

        assert_eq!(links[0].device, "vxkr1");
        assert_eq!(links[0].runner_id, 1);
        assert_eq!(links[0].vni, 7001);
        assert_eq!(links[0].remote, Some(ip("192.168.1.10")));

        assert_eq!(links[1].device, "vxkr2");
        assert_eq!(links[1].vni, 7002);

        // vxkr3 parses but carries a wrong VNI — validation is the caller's.
        assert_eq!(links[2].runner_id, 3);
        assert_eq!(links[2].vni, 1234);
    }

    #[test]
    fn parse_vxlan_links_empty_input() {
        assert!(parse_vxlan_links("").is_empty());
    }

    #[test]
    fn parse_handles_at_suffixed_names() {
        let out = "18: vxkr5@eth0: <BROADCAST> mtu 1450 \\    vxlan id 7005 remote 192.168.1.15 dstport 4789\n";
        let links = parse_vxlan_links(out);
        assert_eq!(links.len(), 1);
        assert_eq!(links[0].device, "vxkr5");
        assert_eq!(links[0].runner_id, 5);
    }

    // ── recovery fixpoint on the table ──

    #[test]
    fn double_recovery_is_a_fixpoint() {
        let mut t = AllocationTable::new();
        for pass in 0..2i64 {
            for link in parse_vxlan_links(IP_LINK_OUTPUT) {
                if link.vni == 7000 + link.runner_id {
                    t.insert_placeholder(link.runner_id, link.remote.unwrap(), pass);
                }
            }
        }
        let allocs = t.list();
        assert_eq!(allocs.len(), 2);
        assert!(allocs.iter().all(|a| a.placeholder));
        // First-pass timestamps survive the second pass untouched.
        assert!(allocs.iter().all(|a| a.last_used == 0));
    }
}
