//! Typed `GET /system_stats` response.
//!
//! Every field is defaulted: servers and forks differ in what they report
//! and the stats are advisory only.

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemStats {
    pub system: SystemInfo,
    pub devices: Vec<DeviceInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SystemInfo {
    pub os: String,
    pub comfyui_version: String,
    pub python_version: String,
    pub pytorch_version: String,
    pub ram_total: u64,
    pub ram_free: u64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceInfo {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub index: Option<u32>,
    pub vram_total: u64,
    pub vram_free: u64,
    pub torch_vram_total: u64,
    pub torch_vram_free: u64,
}

impl SystemStats {
    /// Name of the first reported device, e.g.
    /// `"cuda:0 NVIDIA GeForce RTX 4090 : cudaMallocAsync"`.
    pub fn primary_device_name(&self) -> Option<&str> {
        self.devices
            .first()
            .map(|d| d.name.as_str())
            .filter(|n| !n.is_empty())
    }
}
