use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tokio::sync::Mutex;
use tracing::{info, warn};

/// PCI addresses look like `0000:01:00.0` (domain:bus:device.function).
pub fn is_valid_pci_addr(addr: &str) -> bool {
    let bytes = addr.as_bytes();
    if bytes.len() != 12 {
        return false;
    }
    let hex = |range: std::ops::Range<usize>| addr[range].bytes().all(|b| b.is_ascii_hexdigit());
    hex(0..4)
        && bytes[4] == b':'
        && hex(5..7)
        && bytes[7] == b':'
        && hex(8..10)
        && bytes[10] == b'.'
        && bytes[11].is_ascii_hexdigit()
}

/// Moves PCI functions between their native driver and vfio-pci through
/// sysfs. One lock per address: concurrent VM launches must not interleave
/// unbind/probe sequences on the same device.
pub struct VfioManager {
    sysfs_root: PathBuf,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl VfioManager {
    pub fn new() -> Self {
        Self::with_sysfs_root(PathBuf::from("/sys"))
    }

    /// Root override for tests.
    pub fn with_sysfs_root(sysfs_root: PathBuf) -> Self {
        Self {
            sysfs_root,
            locks: Mutex::new(HashMap::new()),
        }
    }

    async fn lock_for(&self, addr: &str) -> Arc<Mutex<()>> {
        self.locks
            .lock()
            .await
            .entry(addr.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    fn device_dir(&self, addr: &str) -> PathBuf {
        self.sysfs_root.join("bus/pci/devices").join(addr)
    }

    /// The driver currently bound to a device, if any.
    pub fn current_driver(&self, addr: &str) -> Option<String> {
        let link = std::fs::read_link(self.device_dir(addr).join("driver")).ok()?;
        link.file_name().map(|n| n.to_string_lossy().into_owned())
    }

    /// Bind a device to vfio-pci. Returns the previously bound driver so
    /// stop can restore it. Already-bound devices are a no-op.
    pub async fn bind_to_vfio(&self, addr: &str) -> Result<Option<String>> {
        if !is_valid_pci_addr(addr) {
            bail!("invalid PCI address {addr:?}");
        }
        let lock = self.lock_for(addr).await;
        let _guard = lock.lock().await;

        let device = self.device_dir(addr);
        if !device.exists() {
            bail!("PCI device {addr} not found");
        }

        let original = self.current_driver(addr);
        if original.as_deref() == Some("vfio-pci") {
            return Ok(None);
        }

        if original.is_some() {
            std::fs::write(device.join("driver/unbind"), addr)
                .with_context(|| format!("unbind {addr}"))?;
        }
        std::fs::write(device.join("driver_override"), "vfio-pci")
            .with_context(|| format!("driver_override {addr}"))?;
        std::fs::write(self.sysfs_root.join("bus/pci/drivers_probe"), addr)
            .with_context(|| format!("drivers_probe {addr}"))?;

        info!(device = %addr, from = ?original, "Bound to vfio-pci");
        Ok(original)
    }

    /// Return a device to its original driver. Idempotent: a device that is
    /// not on vfio-pci is left alone.
    pub async fn restore_driver(&self, addr: &str, original: Option<&str>) -> Result<()> {
        if !is_valid_pci_addr(addr) {
            bail!("invalid PCI address {addr:?}");
        }
        let lock = self.lock_for(addr).await;
        let _guard = lock.lock().await;

        let device = self.device_dir(addr);
        if self.current_driver(addr).as_deref() != Some("vfio-pci") {
            return Ok(());
        }

        std::fs::write(device.join("driver/unbind"), addr)
            .with_context(|| format!("unbind {addr} from vfio-pci"))?;
        // Clear the override so the probe picks the native driver again.
        std::fs::write(device.join("driver_override"), "\n")
            .with_context(|| format!("clear driver_override {addr}"))?;
        std::fs::write(self.sysfs_root.join("bus/pci/drivers_probe"), addr)
            .with_context(|| format!("drivers_probe {addr}"))?;

        match original {
            Some(driver) => info!(device = %addr, driver = %driver, "Restored native driver"),
            None => warn!(device = %addr, "Restored device with unknown original driver"),
        }
        Ok(())
    }
}

impl Default for VfioManager {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::symlink;

    #[test]
    fn pci_addr_validation() {
        assert!(is_valid_pci_addr("0000:01:00.0"));
        assert!(is_valid_pci_addr("0000:ff:1f.7"));
        assert!(!is_valid_pci_addr("01:00.0"));
        assert!(!is_valid_pci_addr("0000:01:00"));
        assert!(!is_valid_pci_addr("0000:01:00.0.1"));
        assert!(!is_valid_pci_addr("zzzz:01:00.0"));
        assert!(!is_valid_pci_addr(""));
    }

    /// Build a fake sysfs with one device bound to `nvidia`.
    fn fake_sysfs(addr: &str) -> PathBuf {
        let root = std::env::temp_dir().join(format!(
            "kohaku-vfio-{}-{addr}",
            std::process::id()
        ));
        let _ = std::fs::remove_dir_all(&root);
        let device = root.join("bus/pci/devices").join(addr);
        std::fs::create_dir_all(device.join("driver")).unwrap();
        // driver is a symlink to the driver directory in real sysfs; we
        // create a directory and a symlink pointing at it.
        let drivers = root.join("bus/pci/drivers/nvidia");
        std::fs::create_dir_all(&drivers).unwrap();
        std::fs::remove_dir_all(device.join("driver")).unwrap();
        symlink(&drivers, device.join("driver")).unwrap();
        std::fs::write(root.join("bus/pci").join("drivers_probe"), "").unwrap();
        // unbind endpoint lives under the driver dir
        std::fs::write(drivers.join("unbind"), "").unwrap();
        std::fs::write(device.join("driver_override"), "").unwrap();
        root
    }

    #[tokio::test]
    async fn bind_records_original_driver() {
        let addr = "0000:01:00.0";
        let root = fake_sysfs(addr);
        let mgr = VfioManager::with_sysfs_root(root.clone());

        assert_eq!(mgr.current_driver(addr).as_deref(), Some("nvidia"));
        let original = mgr.bind_to_vfio(addr).await.unwrap();
        assert_eq!(original.as_deref(), Some("nvidia"));

        // The override file carries the target driver.
        let override_val = std::fs::read_to_string(
            root.join("bus/pci/devices").join(addr).join("driver_override"),
        )
        .unwrap();
        assert_eq!(override_val, "vfio-pci");

        std::fs::remove_dir_all(&root).unwrap();
    }

    #[tokio::test]
    async fn bind_rejects_bad_addr_and_missing_device() {
        let mgr = VfioManager::with_sysfs_root(std::env::temp_dir().join("kohaku-vfio-none"));
        assert!(mgr.bind_to_vfio("garbage").await.is_err());
        assert!(mgr.bind_to_vfio("0000:99:00.0").await.is_err());
    }

    #[tokio::test]
    async fn restore_is_noop_when_not_on_vfio() {
        let addr = "0000:02:00.0";
        let root = fake_sysfs(addr);
        let mgr = VfioManager::with_sysfs_root(root.clone());

        // Still on nvidia: restore must not touch anything.
        mgr.restore_driver(addr, Some("nvidia")).await.unwrap();
        assert_eq!(mgr.current_driver(addr).as_deref(), Some("nvidia"));

        std::fs::remove_dir_all(&root).unwrap();
    }
}
