#![allow(clippy::doc_markdown)]
pub mod api {
    #![allow(clippy::doc_overindented_list_items)]
    tonic::include_proto!("v1beta1");
}

pub mod allocation;
pub mod app;
pub mod config;
pub mod container;
pub mod device_plugin;
pub mod nvml;
pub mod replicas;
pub mod resource;
mod service;

pub use device_plugin::GpuDevicePlugin;
pub use device_plugin::PluginError;
pub use resource::AllocationPolicy;
pub use resource::Device;
pub use resource::Health;
pub use resource::ResourceManager;
