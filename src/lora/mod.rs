//! LoRA adapters: reading adapter files and fusing them into base weights

use candle_core::{Device, Tensor};
use std::collections::BTreeMap;
use std::path::Path;
use tracing::info;

use crate::error::{Error, Result};

pub mod fusion;
pub mod key;
pub mod resolver;
pub mod store;

pub use fusion::{fuse, FusionOptions, FusionPlan, FusionReport, FusionUpdate};
pub use key::{AdapterKey, ElementKind, LayerKey};
pub use resolver::{LayerResolver, ResolvedTarget};
pub use store::TensorStore;

/// Adapter tensors keyed by `<layer>.<element>`
pub type AdapterTensorSet = BTreeMap<String, Tensor>;

/// Read an adapter file
pub fn read_adapter(path: impl AsRef<Path>, device: &Device) -> Result<AdapterTensorSet> {
    let path = path.as_ref();
    let tensors = store::read_tensors(path, device)?;
    if tensors.is_empty() {
        return Err(Error::model_loading(format!(
            "Adapter file {} contains no tensors",
            path.display()
        )));
    }
    info!("Read {} adapter tensors from {}", tensors.len(), path.display());
    Ok(tensors)
}
