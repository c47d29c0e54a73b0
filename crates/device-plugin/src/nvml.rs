//! NVML backed [`ResourceManager`].

use std::collections::BTreeSet;
use std::time::Duration;

use anyhow::Context;
use nvml_wrapper::bitmasks::event::EventTypes;
use nvml_wrapper::enums::event::XidError;
use nvml_wrapper::error::NvmlError;
use nvml_wrapper::Nvml;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;

use crate::resource::Device;
use crate::resource::ResourceManager;

/// Comma separated list of extra XIDs to ignore, or `all` / `xids` to turn
/// health checking off.
pub const DISABLE_HEALTHCHECKS_ENV: &str = "DP_DISABLE_HEALTHCHECKS";

/// XIDs caused by applications rather than the device:
/// 13 graphics engine exception, 31 GPU memory page fault, 43 GPU stopped
/// processing, 45 preemptive cleanup, 68 video processor exception.
const APPLICATION_XIDS: [u64; 5] = [13, 31, 43, 45, 68];

/// Upper bound on how long a stop request goes unnoticed.
const EVENT_WAIT_TIMEOUT_MS: u32 = 1000;
const EVENT_ERROR_BACKOFF: Duration = Duration::from_millis(500);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthCheckSettings {
    pub disabled: bool,
    pub skipped_xids: BTreeSet<u64>,
}

impl Default for HealthCheckSettings {
    fn default() -> Self {
        Self::parse(None)
    }
}

impl HealthCheckSettings {
    pub fn from_env() -> Self {
        Self::parse(std::env::var(DISABLE_HEALTHCHECKS_ENV).ok().as_deref())
    }

    pub fn parse(value: Option<&str>) -> Self {
        let mut settings = Self {
            disabled: false,
            skipped_xids: APPLICATION_XIDS.into_iter().collect(),
        };
        for entry in value.unwrap_or_default().split(',').map(str::trim) {
            match entry.to_ascii_lowercase().as_str() {
                "" => {}
                "all" | "xids" => settings.disabled = true,
                other => match other.parse::<u64>() {
                    Ok(xid) => {
                        settings.skipped_xids.insert(xid);
                    }
                    Err(_) => warn!("ignoring invalid {DISABLE_HEALTHCHECKS_ENV} entry '{other}'"),
                },
            }
        }
        settings
    }

    pub fn skips(&self, xid: u64) -> bool {
        self.skipped_xids.contains(&xid)
    }

    /// Whether an XID event makes the device unhealthy. Unknown XIDs always
    /// do.
    pub fn is_critical(&self, xid: &XidError) -> bool {
        match xid {
            XidError::Value(xid) => !self.skips(*xid),
            XidError::Unknown => true,
        }
    }
}

pub struct NvmlResourceManager {
    nvml: Nvml,
    health: HealthCheckSettings,
}

impl NvmlResourceManager {
    pub fn init() -> anyhow::Result<Self> {
        let nvml = Nvml::init().context("failed to initialize NVML")?;
        info!(
            "NVML initialized, driver version {}",
            nvml.sys_driver_version().unwrap_or_else(|_| "unknown".to_string())
        );
        Ok(Self {
            nvml,
            health: HealthCheckSettings::from_env(),
        })
    }
}

impl ResourceManager for NvmlResourceManager {
    fn devices(&self) -> anyhow::Result<Vec<Device>> {
        let count = self.nvml.device_count().context("failed to count devices")?;
        let mut devices = Vec::with_capacity(count as usize);
        for index in 0..count {
            let device = self
                .nvml
                .device_by_index(index)
                .with_context(|| format!("failed to get device {index}"))?;
            let uuid = device.uuid()?;
            let total_memory = device.memory_info()?.total / (1024 * 1024);
            let minor = device.minor_number()?;

            debug!(%uuid, index, total_memory, minor, "found device");
            devices.push(
                Device::new(uuid, index.to_string(), total_memory)
                    .with_paths([format!("/dev/nvidia{minor}")]),
            );
        }
        Ok(devices)
    }

    fn check_health(
        &self,
        stop: CancellationToken,
        devices: Vec<Device>,
        unhealthy: mpsc::Sender<String>,
    ) -> anyhow::Result<()> {
        if self.health.disabled {
            info!("health checks disabled through {DISABLE_HEALTHCHECKS_ENV}");
            return Ok(());
        }

        let report = |id: &str| {
            if unhealthy.blocking_send(id.to_string()).is_err() {
                debug!("health channel closed, dropping event for {id}");
            }
        };

        let mut events = self.nvml.create_event_set()?;
        for device in &devices {
            let nvml_device = self.nvml.device_by_uuid(device.id.as_str())?;
            // A failed registration releases the whole set, so only register
            // devices known to support XID events.
            let supported = match nvml_device.supported_event_types() {
                Ok(types) => types.contains(EventTypes::CRITICAL_XID_ERROR),
                Err(NvmlError::NotSupported) => false,
                Err(e) => {
                    return Err(e)
                        .with_context(|| format!("failed to query events of {}", device.id));
                }
            };
            if !supported {
                warn!(
                    "{} is too old to support health checking, marking it unhealthy",
                    device.id
                );
                report(&device.id);
                continue;
            }
            events = nvml_device
                .register_events(EventTypes::CRITICAL_XID_ERROR, events)
                .with_context(|| format!("failed to watch {}", device.id))?;
        }

        while !stop.is_cancelled() {
            let event = match events.wait(EVENT_WAIT_TIMEOUT_MS) {
                Ok(event) => event,
                Err(NvmlError::Timeout) => continue,
                Err(e) => {
                    warn!("waiting for device events failed: {e}");
                    std::thread::sleep(EVENT_ERROR_BACKOFF);
                    continue;
                }
            };
            if !event.event_type.contains(EventTypes::CRITICAL_XID_ERROR) {
                continue;
            }

            let xid = event.event_data.unwrap_or(XidError::Unknown);
            if !self.health.is_critical(&xid) {
                info!("skipping application XID {xid:?}");
                continue;
            }

            match event.device.uuid() {
                Ok(uuid) => {
                    warn!("XID {xid:?} on device {uuid}");
                    report(&uuid);
                }
                Err(e) => {
                    // The event cannot be tied to a device, so none can be trusted.
                    warn!("XID {xid:?} on unknown device ({e}), marking all devices unhealthy");
                    for device in &devices {
                        report(&device.id);
                    }
                }
            }
        }
        Ok(())
    }
}
