use std::path::Path;
use std::path::PathBuf;

use anyhow::bail;
use anyhow::Context;
use clap::Parser;
use serde::Deserialize;
use utils::version;

use crate::replicas::Replication;

pub const DEFAULT_RESOURCE_NAME: &str = "nvidia.com/gpu";
pub const DEFAULT_DEVICE_LIST_ENVVAR: &str = "NVIDIA_VISIBLE_DEVICES";
pub const DEFAULT_DRIVER_ROOT: &str = "/";
/// Directory the kubelet watches for device plugin sockets.
pub const DEVICE_PLUGIN_PATH: &str = "/var/lib/kubelet/device-plugins";
pub const KUBELET_SOCKET_NAME: &str = "kubelet.sock";
pub const DEFAULT_SOCKET_NAME: &str = "nvidia-gpu.sock";

/// How allocated devices are announced to the container runtime.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceListStrategy {
    #[default]
    #[display("envvar")]
    Envvar,
    #[display("volume-mounts")]
    VolumeMounts,
}

/// Which identifier of a device is handed to the container.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum, derive_more::Display,
)]
#[serde(rename_all = "kebab-case")]
pub enum DeviceIdStrategy {
    #[default]
    #[display("uuid")]
    Uuid,
    #[display("index")]
    Index,
}

/// Topology policy used for preferred allocations of unreplicated devices.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum, derive_more::Display,
)]
pub enum AllocationPolicyKind {
    #[default]
    #[value(name = "none")]
    #[serde(rename = "none")]
    #[display("none")]
    Disabled,
    #[value(name = "simple")]
    #[serde(rename = "simple")]
    #[display("simple")]
    Simple,
}

#[derive(Parser, Debug, Clone)]
#[command(about, long_about = None, version = &**version::VERSION)]
pub struct Cli {
    #[arg(
        long,
        env = "CONFIG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "YAML config file; command line flags take precedence over its values"
    )]
    pub config_file: Option<PathBuf>,

    #[arg(
        long,
        env = "RESOURCE_NAME",
        help = "Resource name advertised to the kubelet, e.g. nvidia.com/gpu"
    )]
    pub resource_name: Option<String>,

    #[arg(long, env = "DEVICE_LIST_STRATEGY", value_enum)]
    pub device_list_strategy: Option<DeviceListStrategy>,

    #[arg(long, env = "DEVICE_ID_STRATEGY", value_enum)]
    pub device_id_strategy: Option<DeviceIdStrategy>,

    #[arg(
        long,
        env = "PASS_DEVICE_SPECS",
        help = "Pass device nodes to the kubelet on Allocate",
        action = clap::ArgAction::Set
    )]
    pub pass_device_specs: Option<bool>,

    #[arg(
        long,
        env = "NVIDIA_DRIVER_ROOT",
        value_hint = clap::ValueHint::DirPath,
        help = "Root path of the NVIDIA driver installation on the host"
    )]
    pub nvidia_driver_root: Option<String>,

    #[arg(
        long,
        env = "DEVICE_LIST_ENVVAR",
        help = "Environment variable carrying the device list into containers"
    )]
    pub device_list_envvar: Option<String>,

    #[arg(
        long,
        env = "REPLICAS",
        help = "Number of replicas advertised for every physical GPU"
    )]
    pub replicas: Option<u32>,

    #[arg(
        long,
        env = "AUTO_REPLICAS",
        help = "Derive the replica count of each GPU from its memory (one per 1000 MiB)",
        action = clap::ArgAction::Set
    )]
    pub auto_replicas: Option<bool>,

    #[arg(long, env = "ALLOCATION_POLICY", value_enum)]
    pub allocation_policy: Option<AllocationPolicyKind>,

    #[arg(
        long,
        env = "FAIL_ON_INIT_ERROR",
        help = "Exit when NVML cannot be initialized instead of idling",
        action = clap::ArgAction::Set
    )]
    pub fail_on_init_error: Option<bool>,

    #[arg(
        long,
        env = "DEVICE_PLUGIN_PATH",
        default_value = DEVICE_PLUGIN_PATH,
        value_hint = clap::ValueHint::DirPath,
    )]
    pub device_plugin_path: PathBuf,

    #[arg(long, env = "SOCKET_NAME", default_value = DEFAULT_SOCKET_NAME)]
    pub socket_name: String,

    #[arg(long, env = "KUBELET_SOCKET_NAME", default_value = KUBELET_SOCKET_NAME)]
    pub kubelet_socket_name: String,

    #[arg(
        long,
        env = "LOG_FILE",
        value_hint = clap::ValueHint::FilePath,
        help = "Also write logs to a daily rolling file, e.g. /var/log/gpu-device-plugin.log"
    )]
    pub log_file: Option<PathBuf>,
}

/// On-disk configuration, e.g.
///
/// ```yaml
/// version: v1
/// flags:
///   failOnInitError: true
///   nvidiaDriverRoot: /run/nvidia/driver
///   plugin:
///     passDeviceSpecs: true
///     deviceListStrategy: volume-mounts
///     deviceIDStrategy: index
/// ```
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub flags: Flags,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Flags {
    pub resource_name: Option<String>,
    pub fail_on_init_error: Option<bool>,
    pub nvidia_driver_root: Option<String>,
    pub replicas: Option<u32>,
    pub auto_replicas: Option<bool>,
    pub allocation_policy: Option<AllocationPolicyKind>,
    pub plugin: PluginFlags,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PluginFlags {
    pub pass_device_specs: Option<bool>,
    pub device_list_strategy: Option<DeviceListStrategy>,
    #[serde(alias = "deviceIDStrategy")]
    pub device_id_strategy: Option<DeviceIdStrategy>,
    pub device_list_envvar: Option<String>,
}

impl ConfigFile {
    pub fn read(path: &Path) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&content).with_context(|| format!("invalid config file {}", path.display()))
    }

    pub fn parse(content: &str) -> anyhow::Result<Self> {
        let file: Self = serde_yaml::from_str(content)?;
        match file.version.as_deref() {
            None | Some("v1") => Ok(file),
            Some(other) => bail!("unsupported config version '{other}'"),
        }
    }
}

/// Settings of one plugin instance. Fixed for the lifetime of the process;
/// changing them requires a restart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub resource_name: String,
    pub device_list_strategy: DeviceListStrategy,
    pub device_id_strategy: DeviceIdStrategy,
    pub pass_device_specs: bool,
    pub driver_root: String,
    pub device_list_envvar: String,
    pub replication: Replication,
    pub allocation_policy: AllocationPolicyKind,
    pub fail_on_init_error: bool,
    pub socket_path: PathBuf,
    pub kubelet_socket_path: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        let plugin_dir = Path::new(DEVICE_PLUGIN_PATH);
        Self {
            resource_name: DEFAULT_RESOURCE_NAME.to_string(),
            device_list_strategy: DeviceListStrategy::default(),
            device_id_strategy: DeviceIdStrategy::default(),
            pass_device_specs: false,
            driver_root: DEFAULT_DRIVER_ROOT.to_string(),
            device_list_envvar: DEFAULT_DEVICE_LIST_ENVVAR.to_string(),
            replication: Replication::Fixed(1),
            allocation_policy: AllocationPolicyKind::default(),
            fail_on_init_error: true,
            socket_path: plugin_dir.join(DEFAULT_SOCKET_NAME),
            kubelet_socket_path: plugin_dir.join(KUBELET_SOCKET_NAME),
        }
    }
}

impl Config {
    /// Merge command line values over the config file (if any) over defaults.
    pub fn load(cli: &Cli) -> anyhow::Result<Self> {
        let file = match &cli.config_file {
            Some(path) => ConfigFile::read(path)?,
            None => ConfigFile::default(),
        };
        Self::merge(cli, file)
    }

    pub fn merge(cli: &Cli, file: ConfigFile) -> anyhow::Result<Self> {
        let defaults = Self::default();
        let flags = file.flags;
        let plugin = flags.plugin;

        let replicas = cli.replicas.or(flags.replicas).unwrap_or(1);
        let auto_replicas = cli.auto_replicas.or(flags.auto_replicas).unwrap_or(false);
        if replicas == 0 {
            bail!("replicas must be at least 1");
        }
        if auto_replicas && replicas > 1 {
            bail!("replicas ({replicas}) and auto-replicas are mutually exclusive");
        }

        let config = Self {
            resource_name: cli
                .resource_name
                .clone()
                .or(flags.resource_name)
                .unwrap_or(defaults.resource_name),
            device_list_strategy: cli
                .device_list_strategy
                .or(plugin.device_list_strategy)
                .unwrap_or_default(),
            device_id_strategy: cli
                .device_id_strategy
                .or(plugin.device_id_strategy)
                .unwrap_or_default(),
            pass_device_specs: cli
                .pass_device_specs
                .or(plugin.pass_device_specs)
                .unwrap_or(defaults.pass_device_specs),
            driver_root: cli
                .nvidia_driver_root
                .clone()
                .or(flags.nvidia_driver_root)
                .unwrap_or(defaults.driver_root),
            device_list_envvar: cli
                .device_list_envvar
                .clone()
                .or(plugin.device_list_envvar)
                .unwrap_or(defaults.device_list_envvar),
            replication: Replication::new(replicas, auto_replicas),
            allocation_policy: cli
                .allocation_policy
                .or(flags.allocation_policy)
                .unwrap_or_default(),
            fail_on_init_error: cli
                .fail_on_init_error
                .or(flags.fail_on_init_error)
                .unwrap_or(defaults.fail_on_init_error),
            socket_path: cli.device_plugin_path.join(&cli.socket_name),
            kubelet_socket_path: cli.device_plugin_path.join(&cli.kubelet_socket_name),
        };
        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use similar_asserts::assert_eq;

    use super::*;

    fn cli(args: &[&str]) -> Cli {
        let mut argv = vec!["gpu-device-plugin"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).expect("should parse command line")
    }

    #[test]
    fn defaults_without_flags_or_file() {
        let config = Config::merge(&cli(&[]), ConfigFile::default()).unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(
            config.socket_path,
            PathBuf::from("/var/lib/kubelet/device-plugins/nvidia-gpu.sock")
        );
        assert_eq!(
            config.kubelet_socket_path,
            PathBuf::from("/var/lib/kubelet/device-plugins/kubelet.sock")
        );
    }

    #[test]
    fn parse_config_file_with_upstream_keys() {
        let file = ConfigFile::parse(
            r#"
version: v1
flags:
  failOnInitError: false
  nvidiaDriverRoot: /run/nvidia/driver
  replicas: 4
  plugin:
    passDeviceSpecs: true
    deviceListStrategy: volume-mounts
    deviceIDStrategy: index
"#,
        )
        .expect("should parse config file");

        let config = Config::merge(&cli(&[]), file).unwrap();
        assert_eq!(config.device_list_strategy, DeviceListStrategy::VolumeMounts);
        assert_eq!(config.device_id_strategy, DeviceIdStrategy::Index);
        assert!(config.pass_device_specs);
        assert!(!config.fail_on_init_error);
        assert_eq!(config.driver_root, "/run/nvidia/driver");
        assert_eq!(config.replication, Replication::Fixed(4));
    }

    #[test]
    fn command_line_overrides_config_file() {
        let file = ConfigFile::parse(
            r#"
flags:
  plugin:
    deviceListStrategy: volume-mounts
    passDeviceSpecs: true
"#,
        )
        .unwrap();
        let cli = cli(&[
            "--device-list-strategy",
            "envvar",
            "--pass-device-specs",
            "false",
            "--auto-replicas",
            "true",
            "--allocation-policy",
            "simple",
            "--socket-name",
            "test.sock",
        ]);

        let config = Config::merge(&cli, file).unwrap();
        assert_eq!(config.device_list_strategy, DeviceListStrategy::Envvar);
        assert!(!config.pass_device_specs);
        assert_eq!(config.replication, Replication::Auto);
        assert_eq!(config.allocation_policy, AllocationPolicyKind::Simple);
        assert_eq!(
            config.socket_path,
            PathBuf::from("/var/lib/kubelet/device-plugins/test.sock")
        );
    }

    #[test]
    fn rejects_zero_replicas() {
        let err = Config::merge(&cli(&["--replicas", "0"]), ConfigFile::default()).unwrap_err();
        assert!(err.to_string().contains("at least 1"), "{err}");
    }

    #[test]
    fn rejects_replicas_with_auto_replicas() {
        let result = Config::merge(
            &cli(&["--replicas", "2", "--auto-replicas", "true"]),
            ConfigFile::default(),
        );
        assert!(result.is_err());
    }

    #[test]
    fn rejects_unknown_config_version() {
        assert!(ConfigFile::parse("version: v2\n").is_err());
    }

    #[test]
    fn strategies_render_as_flag_values() {
        assert_eq!(DeviceListStrategy::VolumeMounts.to_string(), "volume-mounts");
        assert_eq!(DeviceIdStrategy::Index.to_string(), "index");
        assert_eq!(AllocationPolicyKind::Disabled.to_string(), "none");
    }
}
