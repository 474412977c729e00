use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

use tracing::{debug, info, warn};

use super::RunnerState;
use crate::protocol::{
    GpuInfo, HeartbeatPayload, MemoryStats, NumaNodeInfo, RegisterRequest, TemperatureStats,
    VfioGpu,
};

// ---- CPU sampling (Linux /proc/stat) ----

struct CpuTimes {
    idle: u64,
    total: u64,
}

/// Delta-based CPU utilization over successive /proc/stat reads.
pub struct CpuSampler {
    prev: Option<CpuTimes>,
}

impl CpuSampler {
    pub fn new() -> Self {
        Self { prev: None }
    }

    /// Returns None on the first call (no delta yet) or when /proc/stat is
    /// unreadable.
    pub fn sample(&mut self) -> Option<f64> {
        let contents = std::fs::read_to_string("/proc/stat").ok()?;
        let current = parse_proc_stat(&contents)?;

        let result = self.prev.as_ref().and_then(|prev| {
            let d_total = current.total.saturating_sub(prev.total);
            let d_idle = current.idle.saturating_sub(prev.idle);
            if d_total == 0 {
                None
            } else {
                let pct = ((d_total - d_idle) as f64 / d_total as f64) * 100.0;
                Some((pct * 10.0).round() / 10.0)
            }
        });
        self.prev = Some(current);
        result
    }
}

fn parse_proc_stat(contents: &str) -> Option<CpuTimes> {
    let line = contents.lines().find(|l| l.starts_with("cpu "))?;
    // cpu  user nice system idle iowait irq softirq steal ...
    let fields: Vec<u64> = line
        .split_whitespace()
        .skip(1)
        .take(8)
        .filter_map(|s| s.parse().ok())
        .collect();
    if fields.len() < 4 {
        return None;
    }
    let idle = fields[3] + fields.get(4).copied().unwrap_or(0); // idle + iowait
    Some(CpuTimes {
        idle,
        total: fields.iter().sum(),
    })
}

// ---- memory (Linux /proc/meminfo) ----

/// Parse MemTotal/MemAvailable out of /proc/meminfo (values are in KiB).
pub fn parse_meminfo(contents: &str) -> Option<MemoryStats> {
    let mut total_kib = None;
    let mut available_kib = None;
    for line in contents.lines() {
        if let Some(rest) = line.strip_prefix("MemTotal:") {
            total_kib = rest.split_whitespace().next()?.parse::<u64>().ok();
        } else if let Some(rest) = line.strip_prefix("MemAvailable:") {
            available_kib = rest.split_whitespace().next()?.parse::<u64>().ok();
        }
    }
    let total = total_kib? * 1024;
    let available = available_kib? * 1024;
    let used = total.saturating_sub(available);
    Some(MemoryStats {
        used,
        total,
        percent: if total > 0 {
            (used as f64 / total as f64 * 1000.0).round() / 10.0
        } else {
            0.0
        },
    })
}

pub fn read_memory_stats() -> Option<MemoryStats> {
    parse_meminfo(&std::fs::read_to_string("/proc/meminfo").ok()?)
}

// ---- GPUs (nvidia-smi CSV) ----

/// Parse `nvidia-smi --query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu --format=csv,noheader,nounits`.
pub fn parse_nvidia_smi(output: &str) -> Vec<GpuInfo> {
    output
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(str::trim).collect();
            if parts.len() < 6 {
                return None;
            }
            Some(GpuInfo {
                gpu_id: parts[0].parse().ok()?,
                name: parts[1].to_string(),
                memory_total_mib: parts[2].parse().ok()?,
                memory_used_mib: parts[3].parse().unwrap_or(0),
                utilization_percent: parts[4].parse().unwrap_or(0.0),
                temperature_c: parts[5].parse().unwrap_or(0.0),
                vm_task_id: None,
                vfio_bound: false,
            })
        })
        .collect()
}

async fn sample_gpus() -> Vec<GpuInfo> {
    let output = match tokio::process::Command::new("nvidia-smi")
        .args([
            "--query-gpu=index,name,memory.total,memory.used,utilization.gpu,temperature.gpu",
            "--format=csv,noheader,nounits",
        ])
        .output()
        .await
    {
        Ok(o) if o.status.success() => o,
        _ => return vec![],
    };
    parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
}

// ---- NUMA topology (sysfs) ----

/// Parse a kernel cpulist like "0-3,8-11,15".
pub fn parse_cpulist(list: &str) -> Vec<u32> {
    let mut cpus = Vec::new();
    for part in list.trim().split(',') {
        if part.is_empty() {
            continue;
        }
        match part.split_once('-') {
            Some((lo, hi)) => {
                if let (Ok(lo), Ok(hi)) = (lo.parse::<u32>(), hi.parse::<u32>()) {
                    cpus.extend(lo..=hi);
                }
            }
            None => {
                if let Ok(cpu) = part.parse() {
                    cpus.push(cpu);
                }
            }
        }
    }
    cpus
}

pub fn read_numa_topology() -> Vec<NumaNodeInfo> {
    let mut nodes = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/devices/system/node") else {
        return nodes;
    };
    for entry in entries.flatten() {
        let name = entry.file_name();
        let name = name.to_string_lossy();
        let Some(id) = name.strip_prefix("node").and_then(|n| n.parse::<u32>().ok()) else {
            continue;
        };
        let cpulist = std::fs::read_to_string(entry.path().join("cpulist")).unwrap_or_default();
        let memory_mb = std::fs::read_to_string(entry.path().join("meminfo"))
            .ok()
            .and_then(|m| parse_numa_meminfo(&m))
            .unwrap_or(0);
        nodes.push(NumaNodeInfo {
            id,
            cpus: parse_cpulist(&cpulist),
            memory_mb,
        });
    }
    nodes.sort_by_key(|n| n.id);
    nodes
}

/// "Node 0 MemTotal:  131072000 kB" -> MiB.
pub fn parse_numa_meminfo(contents: &str) -> Option<u64> {
    let line = contents.lines().find(|l| l.contains("MemTotal:"))?;
    let kb: u64 = line
        .split_whitespace()
        .rev()
        .nth(1)?
        .parse()
        .ok()?;
    Some(kb / 1024)
}

// ---- VFIO-capable GPU inventory (sysfs PCI scan) ----

/// Minimal view of one PCI function for VFIO classification.
#[derive(Debug, Clone, PartialEq)]
pub struct PciFunction {
    pub addr: String,
    /// 6-hex-digit class code, e.g. "030000" (VGA) or "040300" (HDA).
    pub class: String,
    pub iommu_group: String,
    pub model: String,
}

/// Pair every display-class function with the audio functions sharing its
/// IOMMU group — those must move to vfio-pci together.
pub fn classify_vfio_gpus(functions: &[PciFunction]) -> Vec<VfioGpu> {
    let mut audio_by_group: HashMap<&str, Vec<&str>> = HashMap::new();
    for f in functions {
        if f.class.starts_with("0403") {
            audio_by_group
                .entry(f.iommu_group.as_str())
                .or_default()
                .push(f.addr.as_str());
        }
    }

    let mut gpus: Vec<VfioGpu> = functions
        .iter()
        .filter(|f| f.class.starts_with("03"))
        .map(|f| VfioGpu {
            pci_addr: f.addr.clone(),
            iommu_group: f.iommu_group.clone(),
            model: f.model.clone(),
            audio_companions: audio_by_group
                .get(f.iommu_group.as_str())
                .map(|v| v.iter().map(|s| s.to_string()).collect())
                .unwrap_or_default(),
        })
        .collect();
    gpus.sort_by(|a, b| a.pci_addr.cmp(&b.pci_addr));
    gpus
}

/// Scan /sys/bus/pci/devices. Only meaningful when an IOMMU is active
/// (devices without an iommu_group are skipped — they cannot be passed
/// through anyway).
pub fn scan_pci_functions() -> Vec<PciFunction> {
    let mut out = Vec::new();
    let Ok(entries) = std::fs::read_dir("/sys/bus/pci/devices") else {
        return out;
    };
    for entry in entries.flatten() {
        let addr = entry.file_name().to_string_lossy().into_owned();
        let class_raw =
            std::fs::read_to_string(entry.path().join("class")).unwrap_or_default();
        let class = class_raw.trim().trim_start_matches("0x").to_string();
        let Ok(group_link) = std::fs::read_link(entry.path().join("iommu_group")) else {
            continue;
        };
        let iommu_group = group_link
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let vendor = std::fs::read_to_string(entry.path().join("vendor"))
            .unwrap_or_default()
            .trim()
            .to_string();
        let device = std::fs::read_to_string(entry.path().join("device"))
            .unwrap_or_default()
            .trim()
            .to_string();
        out.push(PciFunction {
            addr,
            class,
            iommu_group,
            model: format!("{vendor}:{device}"),
        });
    }
    out
}

// ---- registration + heartbeat loop ----

fn temperature_stats(gpus: &[GpuInfo]) -> Option<TemperatureStats> {
    if gpus.is_empty() {
        return None;
    }
    let temps: Vec<f64> = gpus.iter().map(|g| g.temperature_c).collect();
    let max = temps.iter().cloned().fold(f64::MIN, f64::max);
    let avg = temps.iter().sum::<f64>() / temps.len() as f64;
    Some(TemperatureStats {
        avg: (avg * 10.0).round() / 10.0,
        max,
    })
}

/// Build the registration document from local inventory.
pub async fn build_register_request(state: &RunnerState) -> RegisterRequest {
    let gpus = sample_gpus().await;
    let memory = read_memory_stats().unwrap_or_default();
    RegisterRequest {
        hostname: state.config.hostname.clone(),
        url: state.config.advertise_url.clone(),
        physical_ip: state.physical_ip.clone(),
        total_cores: std::thread::available_parallelism()
            .map(|n| n.get() as u32)
            .unwrap_or(1),
        memory_total_bytes: memory.total,
        numa_topology: read_numa_topology(),
        vm_capable: Path::new("/dev/kvm").exists(),
        vfio_gpus: classify_vfio_gpus(&scan_pci_functions()),
        gpu_info: gpus,
        runner_version: env!("CARGO_PKG_VERSION").to_string(),
    }
}

/// Register with the Host (retrying until it answers), apply the overlay
/// assignment, then heartbeat forever. A 404 on heartbeat re-registers.
pub async fn run(state: Arc<RunnerState>) {
    let mut sampler = CpuSampler::new();

    loop {
        let req = build_register_request(&state).await;
        match state.host.register(&req).await {
            Ok(resp) => {
                info!(hostname = %req.hostname, "Registered with host");
                if let Some(assignment) = resp.overlay {
                    if state.config.overlay_enabled {
                        if let Err(e) = state.overlay.apply(&assignment).await {
                            warn!(error = %e, "Overlay setup failed; continuing without overlay");
                        }
                    }
                }
                break;
            }
            Err(e) => {
                warn!(error = %e, "Registration failed, retrying");
                tokio::time::sleep(std::time::Duration::from_secs(5)).await;
            }
        }
    }

    let mut interval = tokio::time::interval(std::time::Duration::from_secs(
        state.config.heartbeat_interval_secs,
    ));
    loop {
        interval.tick().await;

        let gpus = sample_gpus().await;
        let mut running = state.executor.running_task_ids().await;
        running.extend(state.vps.running_task_ids().await);
        running.extend(state.vm.running_task_ids().await);
        running.sort_unstable();
        running.dedup();

        let payload = HeartbeatPayload {
            cpu_percent: sampler.sample().unwrap_or(0.0),
            memory: read_memory_stats().unwrap_or_default(),
            temperature: temperature_stats(&gpus),
            gpus,
            running_task_ids: running,
            killed_task_ids: state.take_killed_ids().await,
        };

        match state.host.heartbeat(&payload).await {
            Ok(true) => debug!("Heartbeat sent"),
            Ok(false) => {
                // Host does not know us (restart?) — go back to registration.
                warn!("Host rejected heartbeat, re-registering");
                let req = build_register_request(&state).await;
                if let Ok(resp) = state.host.register(&req).await {
                    if let Some(assignment) = resp.overlay {
                        if state.config.overlay_enabled {
                            let _ = state.overlay.apply(&assignment).await;
                        }
                    }
                }
            }
            Err(e) => warn!(error = %e, "Heartbeat failed"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn proc_stat_parses_aggregate_line() {
        let contents = "cpu  100 0 50 800 50 0 0 0 0 0\ncpu0 50 0 25 400 25 0 0 0 0 0\n";
        let times = parse_proc_stat(contents).unwrap();
        assert_eq!(times.idle, 850); // idle + iowait
        assert_eq!(times.total, 1000);
    }

    #[test]
    fn proc_stat_garbage_is_none() {
        assert!(parse_proc_stat("intr 1 2 3").is_none());
        assert!(parse_proc_stat("cpu  1 2").is_none());
    }

    #[test]
    fn meminfo_parses_and_computes_percent() {
        let contents = "MemTotal:       16384000 kB\nMemFree:         1000000 kB\nMemAvailable:    8192000 kB\n";
        let stats = parse_meminfo(contents).unwrap();
        assert_eq!(stats.total, 16384000 * 1024);
        assert_eq!(stats.used, 8192000 * 1024);
        assert!((stats.percent - 50.0).abs() < 0.1);
    }

    #[test]
    fn meminfo_missing_fields_is_none() {
        assert!(parse_meminfo("MemTotal: 1 kB\n").is_none());
        assert!(parse_meminfo("").is_none());
    }

    #[test]
    fn nvidia_smi_csv_parses() {
        let out = "0, NVIDIA GeForce RTX 4090, 24564, 1024, 35, 62\n\
                   1, NVIDIA GeForce RTX 4090, 24564, 0, 0, 41\n";
        let gpus = parse_nvidia_smi(out);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].gpu_id, 0);
        assert_eq!(gpus[0].name, "NVIDIA GeForce RTX 4090");
        assert_eq!(gpus[0].memory_total_mib, 24564);
        assert_eq!(gpus[0].memory_used_mib, 1024);
        assert_eq!(gpus[0].utilization_percent, 35.0);
        assert_eq!(gpus[0].temperature_c, 62.0);
    }

    #[test]
    fn nvidia_smi_malformed_lines_skipped() {
        assert!(parse_nvidia_smi("No devices were found\n").is_empty());
        assert!(parse_nvidia_smi("").is_empty());
    }

    #[test]
    fn cpulist_ranges_and_singles() {
        assert_eq!(parse_cpulist("0-3"), vec![0, 1, 2, 3]);
        assert_eq!(parse_cpulist("0-1,4,8-9"), vec![0, 1, 4, 8, 9]);
        assert_eq!(parse_cpulist("7\n"), vec![7]);
        assert!(parse_cpulist("").is_empty());
    }

    #[test]
    fn numa_meminfo_line_parses() {
        let contents = "Node 0 MemTotal:       131072000 kB\nNode 0 MemFree: 1 kB\n";
        assert_eq!(parse_numa_meminfo(contents), Some(128000));
    }

    #[test]
    fn vfio_classification_pairs_audio_by_iommu_group() {
        let functions = vec![
            PciFunction {
                addr: "0000:01:00.0".into(),
                class: "030000".into(),
                iommu_group: "14".into(),
                model: "0x10de:0x2684".into(),
            },
            PciFunction {
                addr: "0000:01:00.1".into(),
                class: "040300".into(),
                iommu_group: "14".into(),
                model: "0x10de:0x22ba".into(),
            },
            PciFunction {
                addr: "0000:02:00.0".into(),
                class: "030200".into(), // 3D controller, still display class
                iommu_group: "15".into(),
                model: "0x10de:0x1234".into(),
            },
            PciFunction {
                addr: "0000:00:1f.3".into(),
                class: "040300".into(), // onboard audio, different group
                iommu_group: "9".into(),
                model: "0x8086:0x7a50".into(),
            },
        ];
        let gpus = classify_vfio_gpus(&functions);
        assert_eq!(gpus.len(), 2);
        assert_eq!(gpus[0].pci_addr, "0000:01:00.0");
        assert_eq!(gpus[0].audio_companions, vec!["0000:01:00.1"]);
        assert_eq!(gpus[1].pci_addr, "0000:02:00.0");
        assert!(gpus[1].audio_companions.is_empty());
    }

    #[test]
    fn temperature_stats_avg_and_max() {
        let gpus = parse_nvidia_smi("0, A, 1, 0, 0, 60\n1, B, 1, 0, 0, 70\n");
        let t = temperature_stats(&gpus).unwrap();
        assert_eq!(t.avg, 65.0);
        assert_eq!(t.max, 70.0);
        assert!(temperature_stats(&[]).is_none());
    }
}
