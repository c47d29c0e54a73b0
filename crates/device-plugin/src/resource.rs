//! Physical device model and the capabilities the plugin consumes: device
//! discovery with health checking ([`ResourceManager`]) and topology-aware
//! selection ([`AllocationPolicy`]).

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::api;

/// Health of a device as reported to the kubelet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum Health {
    #[default]
    #[display("Healthy")]
    Healthy,
    #[display("Unhealthy")]
    Unhealthy,
}

/// One accelerator, either physical or one of its replicas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Device {
    /// stable identity, e.g. `GPU-fef8089b-4820-abfc-e83e-94318197576e`
    pub id: String,
    /// presentation index, e.g. `0`
    pub index: String,
    /// total memory in MiB
    pub total_memory: u64,
    /// device nodes exposing the device to user space
    pub paths: Vec<String>,
    pub health: Health,
}

impl Device {
    pub fn new(id: impl Into<String>, index: impl Into<String>, total_memory: u64) -> Self {
        Self {
            id: id.into(),
            index: index.into(),
            total_memory,
            paths: Vec::new(),
            health: Health::Healthy,
        }
    }

    pub fn with_paths<I, S>(mut self, paths: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.paths = paths.into_iter().map(Into::into).collect();
        self
    }

    pub fn to_api(&self) -> api::Device {
        api::Device {
            id: self.id.clone(),
            health: self.health.to_string(),
            topology: None,
        }
    }
}

/// Source of physical devices.
pub trait ResourceManager: Send + Sync + 'static {
    /// Enumerate the physical devices on this node.
    fn devices(&self) -> anyhow::Result<Vec<Device>>;

    /// Watch `devices` and send the id of every device that turns unhealthy
    /// on `unhealthy`. Blocks until `stop` is cancelled; it is run on a
    /// blocking thread.
    fn check_health(
        &self,
        stop: CancellationToken,
        devices: Vec<Device>,
        unhealthy: mpsc::Sender<String>,
    ) -> anyhow::Result<()>;
}

/// Topology-aware device selection used for preferred allocations when
/// devices are not replicated.
pub trait AllocationPolicy: Send + Sync + std::fmt::Debug {
    /// Pick `size` devices out of `available`, always including `required`.
    fn allocate(&self, available: &[Device], required: &[Device], size: usize) -> Vec<Device>;
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    #[test]
    fn health_renders_kubelet_constants() {
        assert_eq!(Health::Healthy.to_string(), "Healthy");
        assert_eq!(Health::Unhealthy.to_string(), "Unhealthy");
    }

    #[test]
    fn to_api_carries_id_and_health() {
        let mut device = Device::new("GPU-1", "0", 16384).with_paths(["/dev/nvidia0"]);
        device.health = Health::Unhealthy;

        let api_device = device.to_api();
        assert_eq!(api_device.id, "GPU-1");
        assert_eq!(api_device.health, "Unhealthy");
        assert!(api_device.topology.is_none());
    }
}
