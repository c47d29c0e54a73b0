//! Resolution of kubelet allocation requests against the cached inventory.

use std::cmp::Reverse;
use std::collections::HashMap;
use std::path::Path;

use tonic::Status;
use tracing::info;
use tracing::warn;

use crate::api;
use crate::config::Config;
use crate::config::DeviceIdStrategy;
use crate::config::DeviceListStrategy;
use crate::container;
use crate::replicas::strip_replica;
use crate::replicas::strip_replicas;
use crate::replicas::Inventory;
use crate::resource::AllocationPolicy;
use crate::resource::Device;

/// Errors rejecting an allocation RPC.
#[derive(Debug, derive_more::Display)]
pub enum AllocationError {
    #[display("invalid allocation request for '{resource_name}': unknown device: {id}")]
    UnknownDevice { resource_name: String, id: String },
    #[display("unable to retrieve list of {kind} devices: unknown device: {id}")]
    UnknownPreferredDevice { kind: &'static str, id: String },
    #[display("GetPreferredAllocation() not implemented in this case")]
    PreferredAllocationUnavailable,
}

impl core::error::Error for AllocationError {}

impl From<AllocationError> for Status {
    fn from(err: AllocationError) -> Self {
        match err {
            AllocationError::PreferredAllocationUnavailable => {
                Status::unimplemented(err.to_string())
            }
            _ => Status::invalid_argument(err.to_string()),
        }
    }
}

/// The selection could not avoid handing two replicas of one physical
/// device to the same container. The selection is still usable.
#[derive(Debug, derive_more::Display)]
#[display("non-unique replica assignment: {devices:?} repeated in {selection:?}")]
pub struct NonUniqueError {
    pub devices: Vec<String>,
    pub selection: Vec<String>,
}

impl core::error::Error for NonUniqueError {}

/// Rank `available` replica ids and pick `size` of them, always keeping
/// `required`.
///
/// Replicas of physical devices not yet in the selection come first. Among
/// those, devices with more free replicas (less shared with other
/// containers) win, then earlier positions in `available`.
pub fn prioritize_devices<S: AsRef<str>>(
    available: &[S],
    required: &[S],
    size: usize,
) -> Result<Vec<String>, NonUniqueError> {
    let mut selection: Vec<String> = Vec::with_capacity(size.max(required.len()));
    let mut used: HashMap<&str, usize> = HashMap::new();

    for id in required {
        let id: &str = id.as_ref();
        if !selection.iter().any(|s| s == id) {
            selection.push(id.to_string());
            *used.entry(strip_replica(id)).or_default() += 1;
        }
    }

    let mut candidates: Vec<&str> = Vec::new();
    for id in available {
        let id: &str = id.as_ref();
        if !selection.iter().any(|s| s == id) && !candidates.contains(&id) {
            candidates.push(id);
        }
    }
    let mut free: HashMap<&str, usize> = HashMap::new();
    for id in &candidates {
        *free.entry(strip_replica(id)).or_default() += 1;
    }

    while selection.len() < size {
        let Some(best) = candidates
            .iter()
            .enumerate()
            .min_by_key(|(position, id)| {
                let physical = strip_replica(id);
                (
                    used.get(physical).copied().unwrap_or(0),
                    Reverse(free.get(physical).copied().unwrap_or(0)),
                    *position,
                )
            })
            .map(|(position, _)| position)
        else {
            break;
        };

        let id = candidates.remove(best);
        let physical = strip_replica(id);
        *used.entry(physical).or_default() += 1;
        if let Some(count) = free.get_mut(physical) {
            *count = count.saturating_sub(1);
        }
        selection.push(id.to_string());
    }

    let mut shared: Vec<String> = used
        .into_iter()
        .filter(|(_, count)| *count > 1)
        .map(|(physical, _)| physical.to_string())
        .collect();
    if shared.is_empty() {
        return Ok(selection);
    }
    shared.sort();
    Err(NonUniqueError {
        devices: shared,
        selection,
    })
}

/// Required devices first, then available devices in order.
#[derive(Debug, Default, Clone, Copy)]
pub struct SimplePolicy;

impl AllocationPolicy for SimplePolicy {
    fn allocate(&self, available: &[Device], required: &[Device], size: usize) -> Vec<Device> {
        let mut chosen: Vec<Device> = Vec::with_capacity(size);
        for device in required.iter().chain(available) {
            if chosen.len() >= size.max(required.len()) {
                break;
            }
            if !chosen.iter().any(|c| c.id == device.id) {
                chosen.push(device.clone());
            }
        }
        chosen
    }
}

/// Resolves allocation requests for one serving session.
pub struct Allocator<'a> {
    config: &'a Config,
    inventory: &'a Inventory,
    policy: Option<&'a dyn AllocationPolicy>,
}

impl<'a> Allocator<'a> {
    pub fn new(
        config: &'a Config,
        inventory: &'a Inventory,
        policy: Option<&'a dyn AllocationPolicy>,
    ) -> Self {
        Self {
            config,
            inventory,
            policy,
        }
    }

    pub fn preferred_allocation(
        &self,
        request: &api::PreferredAllocationRequest,
    ) -> Result<api::PreferredAllocationResponse, AllocationError> {
        let mut response = api::PreferredAllocationResponse::default();
        for container in &request.container_requests {
            let available = self.physical_devices(&container.available_device_ids, "available")?;
            let required = self.physical_devices(&container.must_include_device_ids, "required")?;
            let size = usize::try_from(container.allocation_size).unwrap_or(0);

            let device_ids = if self.config.replication.is_replicated() {
                match prioritize_devices(
                    &container.available_device_ids,
                    &container.must_include_device_ids,
                    size,
                ) {
                    Ok(ids) => ids,
                    Err(err) => {
                        warn!("Ignoring: {err}");
                        err.selection
                    }
                }
            } else if let Some(policy) = self.policy {
                policy
                    .allocate(&available, &required, size)
                    .into_iter()
                    .map(|d| d.id)
                    .collect()
            } else {
                return Err(AllocationError::PreferredAllocationUnavailable);
            };

            response
                .container_responses
                .push(api::ContainerPreferredAllocationResponse { device_ids });
        }
        Ok(response)
    }

    pub fn allocate(
        &self,
        request: &api::AllocateRequest,
    ) -> Result<api::AllocateResponse, AllocationError> {
        self.allocate_with(request, Path::exists)
    }

    /// [`Allocator::allocate`] with the host device-node check supplied by
    /// the caller.
    pub fn allocate_with<F>(
        &self,
        request: &api::AllocateRequest,
        exists: F,
    ) -> Result<api::AllocateResponse, AllocationError>
    where
        F: Fn(&Path) -> bool,
    {
        let mut response = api::AllocateResponse::default();
        for container in &request.container_requests {
            if let Some(id) = container
                .devices_ids
                .iter()
                .find(|id| !self.inventory.has_replica(id))
            {
                return Err(self.unknown_device(id));
            }

            let uuids = strip_replicas(&container.devices_ids);
            info!(
                "kubelet is requesting devices {:?}, but using raw devices {:?}",
                container.devices_ids, uuids
            );

            let devices = uuids
                .iter()
                .map(|id| self.inventory.device(id).ok_or_else(|| self.unknown_device(id)))
                .collect::<Result<Vec<_>, _>>()?;

            let device_ids: Vec<String> = match self.config.device_id_strategy {
                DeviceIdStrategy::Uuid => uuids.clone(),
                DeviceIdStrategy::Index => devices.iter().map(|d| d.index.clone()).collect(),
            };

            let envvar = &self.config.device_list_envvar;
            let mut container_response = api::ContainerAllocateResponse::default();
            match self.config.device_list_strategy {
                DeviceListStrategy::Envvar => {
                    container_response.envs = container::envs(envvar, &device_ids);
                }
                DeviceListStrategy::VolumeMounts => {
                    container_response.envs =
                        container::envs(envvar, &[container::VOLUME_MOUNTS_CONTAINER_PATH_ROOT]);
                    container_response.mounts = container::volume_mounts(&device_ids);
                }
            }
            if self.config.pass_device_specs {
                container_response.devices =
                    container::device_specs(&self.config.driver_root, &devices, &exists);
            }

            response.container_responses.push(container_response);
        }
        Ok(response)
    }

    fn physical_devices(
        &self,
        ids: &[String],
        kind: &'static str,
    ) -> Result<Vec<Device>, AllocationError> {
        strip_replicas(ids)
            .into_iter()
            .map(|id| match self.inventory.device(&id) {
                Some(device) => Ok(device.clone()),
                None => Err(AllocationError::UnknownPreferredDevice { kind, id }),
            })
            .collect()
    }

    fn unknown_device(&self, id: &str) -> AllocationError {
        AllocationError::UnknownDevice {
            resource_name: self.config.resource_name.clone(),
            id: id.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;
    use crate::replicas::Replication;

    fn devices() -> Vec<Device> {
        vec![
            Device::new("GPU-a", "0", 4000).with_paths(["/dev/nvidia0"]),
            Device::new("GPU-b", "1", 4000).with_paths(["/dev/nvidia1"]),
            Device::new("GPU-c", "2", 4000).with_paths(["/dev/nvidia2"]),
        ]
    }

    fn config(replicas: u32) -> Config {
        Config {
            replication: Replication::Fixed(replicas),
            ..Config::default()
        }
    }

    fn ids(values: &[&str]) -> Vec<String> {
        values.iter().map(|v| v.to_string()).collect()
    }

    fn allocate_request(devices: &[&str]) -> api::AllocateRequest {
        api::AllocateRequest {
            container_requests: vec![api::ContainerAllocateRequest {
                devices_ids: ids(devices),
            }],
        }
    }

    fn preferred_request(
        available: &[&str],
        required: &[&str],
        size: i32,
    ) -> api::PreferredAllocationRequest {
        api::PreferredAllocationRequest {
            container_requests: vec![api::ContainerPreferredAllocationRequest {
                available_device_ids: ids(available),
                must_include_device_ids: ids(required),
                allocation_size: size,
            }],
        }
    }

    #[test]
    fn prioritize_spreads_across_physical_devices() {
        let available = ids(&["GPU-a::0", "GPU-a::1", "GPU-b::0", "GPU-b::1", "GPU-c::0"]);
        let selection = prioritize_devices(&available, &[], 3).unwrap();
        assert_eq!(selection, ids(&["GPU-a::0", "GPU-b::0", "GPU-c::0"]));
    }

    #[test]
    fn prioritize_prefers_devices_with_more_free_replicas() {
        // GPU-a already has a replica taken by another container.
        let available = ids(&["GPU-a::1", "GPU-b::0", "GPU-b::1"]);
        let selection = prioritize_devices(&available, &[], 1).unwrap();
        assert_eq!(selection, ids(&["GPU-b::0"]));
    }

    #[test]
    fn prioritize_keeps_required_ids() {
        let available = ids(&["GPU-a::0", "GPU-b::0", "GPU-c::0"]);
        let required = ids(&["GPU-c::0"]);
        let selection = prioritize_devices(&available, &required, 2).unwrap();
        assert_eq!(selection, ids(&["GPU-c::0", "GPU-a::0"]));

        let selection = prioritize_devices(&available, &ids(&["GPU-b::0", "GPU-c::0"]), 1).unwrap();
        assert_eq!(selection, ids(&["GPU-b::0", "GPU-c::0"]));
    }

    #[test]
    fn prioritize_reports_non_unique_with_best_effort_selection() {
        let available = ids(&["GPU-a::0", "GPU-a::1", "GPU-b::0"]);
        let err = prioritize_devices(&available, &[], 3).unwrap_err();
        assert_eq!(err.devices, ids(&["GPU-a"]));
        assert_eq!(err.selection, ids(&["GPU-a::0", "GPU-b::0", "GPU-a::1"]));
    }

    #[test]
    fn prioritize_is_deterministic() {
        let available = ids(&["GPU-c::0", "GPU-b::0", "GPU-a::0"]);
        let first = prioritize_devices(&available, &[], 2).unwrap();
        let second = prioritize_devices(&available, &[], 2).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, ids(&["GPU-c::0", "GPU-b::0"]));
    }

    #[test]
    fn simple_policy_takes_required_then_available() {
        let devices = devices();
        let chosen = SimplePolicy.allocate(&devices, &devices[2..], 2);
        let chosen: Vec<_> = chosen.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(chosen, vec!["GPU-c", "GPU-a"]);
    }

    #[test]
    fn allocate_rejects_unknown_replica() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let err = allocator
            .allocate(&allocate_request(&["GPU-a::0", "GPU-z::0"]))
            .unwrap_err();
        assert!(err.to_string().contains("unknown device: GPU-z::0"), "{err}");
        assert!(err.to_string().contains("nvidia.com/gpu"), "{err}");
    }

    #[test]
    fn allocate_rejects_out_of_range_replica_index() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let err = allocator.allocate(&allocate_request(&["GPU-a::2"])).unwrap_err();
        assert!(err.to_string().contains("GPU-a::2"), "{err}");
    }

    #[test]
    fn allocate_envvar_with_uuid_strategy() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let response = allocator
            .allocate_with(&allocate_request(&["GPU-b::1", "GPU-a::0", "GPU-b::0"]), |_| false)
            .unwrap();
        let container = &response.container_responses[0];
        assert_eq!(
            container.envs.get("NVIDIA_VISIBLE_DEVICES").map(String::as_str),
            Some("GPU-b,GPU-a")
        );
        assert!(container.mounts.is_empty());
        assert!(container.devices.is_empty());
    }

    #[test]
    fn allocate_volume_mounts_with_index_strategy_and_device_specs() {
        let config = Config {
            device_list_strategy: DeviceListStrategy::VolumeMounts,
            device_id_strategy: DeviceIdStrategy::Index,
            pass_device_specs: true,
            ..config(1)
        };
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let response = allocator
            .allocate_with(&allocate_request(&["GPU-b::0"]), |p| {
                p == Path::new("/dev/nvidiactl")
            })
            .unwrap();
        let container = &response.container_responses[0];
        assert_eq!(
            container.envs.get("NVIDIA_VISIBLE_DEVICES").map(String::as_str),
            Some("/var/run/nvidia-container-devices")
        );
        assert_eq!(container.mounts.len(), 1);
        assert_eq!(container.mounts[0].host_path, "/dev/null");
        assert_eq!(
            container.mounts[0].container_path,
            "/var/run/nvidia-container-devices/1"
        );
        let paths: Vec<_> = container
            .devices
            .iter()
            .map(|d| d.container_path.as_str())
            .collect();
        assert_eq!(paths, vec!["/dev/nvidiactl", "/dev/nvidia1"]);
    }

    #[test]
    fn preferred_allocation_with_replicas_uses_replica_ids() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let response = allocator
            .preferred_allocation(&preferred_request(
                &["GPU-a::0", "GPU-a::1", "GPU-b::0", "GPU-b::1"],
                &["GPU-b::1"],
                2,
            ))
            .unwrap();
        assert_eq!(
            response.container_responses[0].device_ids,
            ids(&["GPU-b::1", "GPU-a::0"])
        );
    }

    #[test]
    fn preferred_allocation_tolerates_non_unique_selection() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let response = allocator
            .preferred_allocation(&preferred_request(&["GPU-a::0", "GPU-a::1"], &[], 2))
            .unwrap();
        assert_eq!(
            response.container_responses[0].device_ids,
            ids(&["GPU-a::0", "GPU-a::1"])
        );
    }

    #[test]
    fn preferred_allocation_delegates_to_policy_without_replicas() {
        let config = config(1);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, Some(&SimplePolicy));

        let response = allocator
            .preferred_allocation(&preferred_request(
                &["GPU-a::0", "GPU-b::0", "GPU-c::0"],
                &["GPU-c::0"],
                2,
            ))
            .unwrap();
        assert_eq!(
            response.container_responses[0].device_ids,
            ids(&["GPU-c", "GPU-a"])
        );
    }

    #[test]
    fn preferred_allocation_without_replicas_or_policy_is_unimplemented() {
        let config = config(1);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let err = allocator
            .preferred_allocation(&preferred_request(&["GPU-a::0"], &[], 1))
            .unwrap_err();
        assert!(matches!(err, AllocationError::PreferredAllocationUnavailable));
        assert_eq!(Status::from(err).code(), tonic::Code::Unimplemented);
    }

    #[test]
    fn preferred_allocation_rejects_unknown_physical_device() {
        let config = config(2);
        let inventory = Inventory::build(devices(), config.replication);
        let allocator = Allocator::new(&config, &inventory, None);

        let err = allocator
            .preferred_allocation(&preferred_request(&["GPU-a::0", "GPU-x::0"], &[], 1))
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "unable to retrieve list of available devices: unknown device: GPU-x"
        );
    }
}
