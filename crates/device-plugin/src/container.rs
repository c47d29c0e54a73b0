//! Translation of allocated devices into what the container runtime needs:
//! environment variables, bind mounts and device nodes.

use std::collections::HashMap;
use std::path::Path;

use crate::api;
use crate::resource::Device;

/// Host side of every device-list volume mount.
pub const VOLUME_MOUNTS_HOST_PATH: &str = "/dev/null";
/// Container directory holding one entry per allocated device.
pub const VOLUME_MOUNTS_CONTAINER_PATH_ROOT: &str = "/var/run/nvidia-container-devices";

/// Driver control nodes handed to every container that exist on the host.
pub const CONTROL_DEVICE_PATHS: [&str; 4] = [
    "/dev/nvidiactl",
    "/dev/nvidia-uvm",
    "/dev/nvidia-uvm-tools",
    "/dev/nvidia-modeset",
];

const DEVICE_PERMISSIONS: &str = "rw";

pub fn envs<S: AsRef<str>>(envvar: &str, device_ids: &[S]) -> HashMap<String, String> {
    let value = device_ids
        .iter()
        .map(|id| id.as_ref())
        .collect::<Vec<&str>>()
        .join(",");
    HashMap::from([(envvar.to_string(), value)])
}

pub fn volume_mounts<S: AsRef<str>>(device_ids: &[S]) -> Vec<api::Mount> {
    device_ids
        .iter()
        .map(|id| api::Mount {
            container_path: join(VOLUME_MOUNTS_CONTAINER_PATH_ROOT, id.as_ref()),
            host_path: VOLUME_MOUNTS_HOST_PATH.to_string(),
            read_only: false,
        })
        .collect()
}

/// Device nodes for `devices`: the control nodes for which `exists` holds,
/// followed by each device's own paths. Host paths are resolved under
/// `driver_root`.
pub fn device_specs<F>(driver_root: &str, devices: &[&Device], exists: F) -> Vec<api::DeviceSpec>
where
    F: Fn(&Path) -> bool,
{
    let control = CONTROL_DEVICE_PATHS
        .iter()
        .copied()
        .filter(|p| exists(Path::new(p)));
    let per_device = devices
        .iter()
        .flat_map(|d| d.paths.iter().map(String::as_str));

    control
        .chain(per_device)
        .map(|path| api::DeviceSpec {
            container_path: path.to_string(),
            host_path: join(driver_root, path),
            permissions: DEVICE_PERMISSIONS.to_string(),
        })
        .collect()
}

/// Join `path` under `root` even when `path` is absolute.
fn join(root: &str, path: &str) -> String {
    Path::new(root)
        .join(path.trim_start_matches('/'))
        .to_string_lossy()
        .into_owned()
}
