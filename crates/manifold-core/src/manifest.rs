use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::tenant::TenantId;

/// On-disk / wire format of a model artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ModelFormat {
    Gguf,
    Litert,
    Onnx,
    Tensorrt,
    Torchscript,
    TfSavedModel,
    Pytorch,
    Safetensors,
}

impl fmt::Display for ModelFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ModelFormat::Gguf => "gguf",
            ModelFormat::Litert => "litert",
            ModelFormat::Onnx => "onnx",
            ModelFormat::Tensorrt => "tensorrt",
            ModelFormat::Torchscript => "torchscript",
            ModelFormat::TfSavedModel => "tf_saved_model",
            ModelFormat::Pytorch => "pytorch",
            ModelFormat::Safetensors => "safetensors",
        };
        f.write_str(s)
    }
}

/// Compute device class a model can execute on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DeviceType {
    Cpu,
    Cuda,
    Metal,
    Rocm,
    Npu,
    Tpu,
}

/// A device the model supports, with the minimum memory it needs there.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRequirement {
    pub device: DeviceType,
    pub min_memory_bytes: u64,
}

/// Host resources a model needs before it can be scheduled at all.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceRequirements {
    pub min_ram_bytes: u64,
    pub min_vram_bytes: u64,
    pub min_disk_bytes: u64,
}

/// Immutable descriptor of a logical model owned by a tenant.
///
/// Artifacts map each available format to its location (path or URL);
/// artifact acquisition itself is outside the dispatch plane.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelManifest {
    pub model_id: String,
    pub name: String,
    pub version: String,
    pub tenant_id: TenantId,
    pub artifacts: BTreeMap<ModelFormat, String>,
    pub supported_devices: Vec<DeviceRequirement>,
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl ModelManifest {
    pub fn new(
        model_id: impl Into<String>,
        name: impl Into<String>,
        version: impl Into<String>,
        tenant_id: TenantId,
    ) -> Self {
        Self {
            model_id: model_id.into(),
            name: name.into(),
            version: version.into(),
            tenant_id,
            artifacts: BTreeMap::new(),
            supported_devices: vec![],
            resources: ResourceRequirements::default(),
            metadata: Default::default(),
        }
    }

    pub fn with_artifact(mut self, format: ModelFormat, location: impl Into<String>) -> Self {
        self.artifacts.insert(format, location.into());
        self
    }

    pub fn with_device(mut self, device: DeviceType, min_memory_bytes: u64) -> Self {
        self.supported_devices.push(DeviceRequirement {
            device,
            min_memory_bytes,
        });
        self
    }

    pub fn with_resources(mut self, resources: ResourceRequirements) -> Self {
        self.resources = resources;
        self
    }

    /// The manifest's primary format — the first artifact entry in the
    /// deterministic format ordering.
    pub fn primary_format(&self) -> Option<ModelFormat> {
        self.artifacts.keys().next().copied()
    }

    pub fn has_format(&self, format: ModelFormat) -> bool {
        self.artifacts.contains_key(&format)
    }

    pub fn supports_device(&self, device: DeviceType) -> bool {
        self.supported_devices.iter().any(|d| d.device == device)
    }
}
