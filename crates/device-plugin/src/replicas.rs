//! Expansion of physical devices into the replica identities advertised to
//! the kubelet.

use std::collections::HashSet;

use crate::resource::Device;

/// Separator between a physical device id and its replica index.
pub const REPLICA_SEPARATOR: &str = "::";

/// Memory (MiB) per replica when replicas are derived from device capacity.
/// Keeps the advertised device count well below the kubelet's limits.
const AUTO_REPLICA_MEMORY_MIB: u64 = 1000;

/// How many replicas each physical device is split into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Replication {
    Fixed(u32),
    /// One replica per `AUTO_REPLICA_MEMORY_MIB` of device memory, rounded
    /// down. A device with less memory than that gets no replicas.
    Auto,
}

impl Replication {
    pub fn new(replicas: u32, auto_replicas: bool) -> Self {
        if auto_replicas {
            Self::Auto
        } else {
            Self::Fixed(replicas)
        }
    }

    /// Whether devices are shared, i.e. more than one identity per device.
    pub fn is_replicated(&self) -> bool {
        match self {
            Self::Fixed(count) => *count > 1,
            Self::Auto => true,
        }
    }

    pub fn count_for(&self, device: &Device) -> u64 {
        match self {
            Self::Fixed(count) => u64::from(*count),
            Self::Auto => device.total_memory / AUTO_REPLICA_MEMORY_MIB,
        }
    }
}

/// Build the replica list for `devices`, in device order and replica index
/// order within each device.
pub fn replicate(devices: &[Device], replication: Replication) -> Vec<Device> {
    let mut replicas = Vec::new();
    for device in devices {
        let count = replication.count_for(device);
        tracing::info!(device = %device.id, count, "replicating device");
        replicas.extend((0..count).map(|i| Device {
            id: replica_id(&device.id, i),
            ..device.clone()
        }));
    }
    replicas
}

/// Devices cached for one plugin session: the physical devices and the
/// replicas derived from them. Rebuilt from scratch on every start.
#[derive(Debug, Default)]
pub struct Inventory {
    devices: Vec<Device>,
    replicas: Vec<Device>,
    replica_ids: HashSet<String>,
}

impl Inventory {
    pub fn build(devices: Vec<Device>, replication: Replication) -> Self {
        let replicas = replicate(&devices, replication);
        let replica_ids = replicas.iter().map(|r| r.id.clone()).collect();
        Self {
            devices,
            replicas,
            replica_ids,
        }
    }

    pub fn devices(&self) -> &[Device] {
        &self.devices
    }

    pub fn replicas(&self) -> &[Device] {
        &self.replicas
    }

    pub fn device(&self, id: &str) -> Option<&Device> {
        self.devices.iter().find(|d| d.id == id)
    }

    pub fn has_replica(&self, id: &str) -> bool {
        self.replica_ids.contains(id)
    }
}

pub fn replica_id(physical_id: &str, index: u64) -> String {
    format!("{physical_id}{REPLICA_SEPARATOR}{index}")
}

/// Physical id behind a replica id. Ids without a replica suffix are
/// returned unchanged.
pub fn strip_replica(id: &str) -> &str {
    match id.rsplit_once(REPLICA_SEPARATOR) {
        Some((physical, _)) => physical,
        None => id,
    }
}

/// Strip every id, dropping duplicates while keeping first-seen order.
pub fn strip_replicas<S: AsRef<str>>(ids: &[S]) -> Vec<String> {
    let mut physical: Vec<String> = Vec::with_capacity(ids.len());
    for id in ids {
        let stripped = strip_replica(id.as_ref());
        if !physical.iter().any(|p| p == stripped) {
            physical.push(stripped.to_string());
        }
    }
    physical
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn devices() -> Vec<Device> {
        vec![
            Device::new("GPU-aaaa", "0", 16_384),
            Device::new("GPU-bbbb", "1", 2_500),
        ]
    }

    #[test]
    fn fixed_replication_keeps_device_and_index_order() {
        let replicas = replicate(&devices(), Replication::Fixed(2));
        let ids: Vec<_> = replicas.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(
            ids,
            vec!["GPU-aaaa::0", "GPU-aaaa::1", "GPU-bbbb::0", "GPU-bbbb::1"]
        );
        assert_eq!(replicas[2].index, "1");
    }

    #[test]
    fn auto_replication_floors_memory_per_thousand() {
        let devices = devices();
        let replicas = replicate(&devices, Replication::Auto);

        for device in &devices {
            let expected = device.total_memory / 1000;
            let indices: Vec<String> = replicas
                .iter()
                .filter(|r| strip_replica(&r.id) == device.id)
                .map(|r| r.id.rsplit_once(REPLICA_SEPARATOR).unwrap().1.to_string())
                .collect();
            let wanted: Vec<String> = (0..expected).map(|i| i.to_string()).collect();
            assert_eq!(indices, wanted);
        }
        assert_eq!(replicas.len(), 16 + 2);
    }

    #[test]
    fn auto_replication_skips_small_devices() {
        let small = vec![Device::new("GPU-small", "0", 999)];
        assert!(replicate(&small, Replication::Auto).is_empty());
    }

    #[test]
    fn stripping_a_generated_replica_yields_its_device() {
        let devices = devices();
        for replica in replicate(&devices, Replication::Fixed(3)) {
            let physical = strip_replica(&replica.id);
            assert!(devices.iter().any(|d| d.id == physical));
            assert!(replica.id.starts_with(physical));
        }
    }

    #[test]
    fn strip_replicas_dedups_in_order() {
        let ids = ["GPU-b::1", "GPU-a::0", "GPU-b::0", "GPU-c"];
        assert_eq!(strip_replicas(&ids), vec!["GPU-b", "GPU-a", "GPU-c"]);
    }

    #[test]
    fn inventory_indexes_devices_and_replicas() {
        let inventory = Inventory::build(devices(), Replication::Fixed(2));
        assert_eq!(inventory.devices().len(), 2);
        assert_eq!(inventory.replicas().len(), 4);
        assert!(inventory.has_replica("GPU-bbbb::1"));
        assert!(!inventory.has_replica("GPU-bbbb::2"));
        assert!(!inventory.has_replica("GPU-bbbb"));
        assert_eq!(inventory.device("GPU-aaaa").map(|d| d.index.as_str()), Some("0"));
        assert!(inventory.device("GPU-aaaa::0").is_none());
    }

    #[test]
    fn is_replicated() {
        assert!(!Replication::Fixed(1).is_replicated());
        assert!(Replication::Fixed(2).is_replicated());
        assert!(Replication::new(1, true).is_replicated());
    }
}
