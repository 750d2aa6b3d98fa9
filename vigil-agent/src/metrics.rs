//! Telemetry snapshot collection for Vigil agents
//!
//! Builds the per-category snapshots the kernel consolidates:
//! - hardware: CPU model and status
//! - storage: one item per mounted filesystem, keyed by mount point
//! - network: one item per interface, keyed by interface name
//!
//! Item shapes match the kernel's wire schema exactly.

use anyhow::Result;
use serde::Serialize;
use std::collections::HashMap;
use sysinfo::{Disks, Networks, System};
use tracing::debug;

/// A category snapshot in the wire shape the kernel expects.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "category", content = "items", rename_all = "lowercase")]
pub enum Snapshot {
    Hardware(Vec<HardwareItem>),
    Storage(Vec<DriveItem>),
    Network(Vec<InterfaceItem>),
}

#[derive(Debug, Clone, Serialize)]
pub struct HardwareItem {
    pub component: String,
    pub model: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct DriveItem {
    pub mount: String,
    pub filesystem: String,
    pub total_gb: f64,
    pub free_gb: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct InterfaceItem {
    pub name: String,
    pub mac: String,
    pub ip: String,
    pub up: bool,
}

/// Collect every category snapshot in one pass.
pub fn collect_all() -> Result<Vec<Snapshot>> {
    debug!("collecting telemetry snapshots");
    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    Ok(vec![
        Snapshot::Hardware(collect_hardware(&sys)),
        Snapshot::Storage(collect_storage()),
        Snapshot::Network(collect_network()),
    ])
}

fn collect_hardware(sys: &System) -> Vec<HardwareItem> {
    let mut items = Vec::new();
    if let Some(cpu) = sys.cpus().first() {
        items.push(HardwareItem {
            component: "cpu0".to_string(),
            model: cpu.brand().to_string(),
            status: "ok".to_string(),
        });
    }
    items.push(HardwareItem {
        component: "mem0".to_string(),
        model: format!("{} MB", sys.total_memory() / (1024 * 1024)),
        status: "ok".to_string(),
    });
    items
}

fn collect_storage() -> Vec<DriveItem> {
    let disks = Disks::new_with_refreshed_list();
    let mut items: Vec<DriveItem> = disks
        .iter()
        .map(|disk| DriveItem {
            mount: disk.mount_point().to_string_lossy().to_string(),
            filesystem: disk.file_system().to_string_lossy().to_string(),
            total_gb: disk.total_space() as f64 / 1e9,
            free_gb: disk.available_space() as f64 / 1e9,
        })
        .collect();
    // Two disks can share a virtual mount point; keep the first one,
    // the key must stay unique kernel-side.
    items.sort_by(|a, b| a.mount.cmp(&b.mount));
    items.dedup_by(|a, b| a.mount == b.mount);
    items
}

fn collect_network() -> Vec<InterfaceItem> {
    // sysinfo has MACs and counters, if-addrs has the addresses.
    let mut ips: HashMap<String, String> = HashMap::new();
    if let Ok(addrs) = if_addrs::get_if_addrs() {
        for addr in addrs {
            ips.entry(addr.name.clone()).or_insert_with(|| addr.ip().to_string());
        }
    }

    let networks = Networks::new_with_refreshed_list();
    let mut items: Vec<InterfaceItem> = networks
        .iter()
        .map(|(name, data)| InterfaceItem {
            name: name.clone(),
            mac: data.mac_address().to_string(),
            ip: ips.get(name).cloned().unwrap_or_default(),
            up: data.total_received() > 0 || data.total_transmitted() > 0,
        })
        .collect();
    items.sort_by(|a, b| a.name.cmp(&b.name));
    items
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_mounts_are_unique() {
        let drives = collect_storage();
        let mut mounts: Vec<&str> = drives.iter().map(|d| d.mount.as_str()).collect();
        let before = mounts.len();
        mounts.dedup();
        assert_eq!(mounts.len(), before);
    }

    #[test]
    fn test_snapshots_serialize_with_category_tag() {
        let snapshot = Snapshot::Storage(vec![DriveItem {
            mount: "/".into(),
            filesystem: "ext4".into(),
            total_gb: 100.0,
            free_gb: 40.0,
        }]);
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["category"], "storage");
        assert_eq!(value["items"][0]["mount"], "/");
    }

    #[test]
    fn test_hardware_has_cpu_entry() {
        let mut sys = System::new();
        sys.refresh_cpu_usage();
        sys.refresh_memory();
        let items = collect_hardware(&sys);
        assert!(items.iter().any(|i| i.component == "mem0"));
    }
}
