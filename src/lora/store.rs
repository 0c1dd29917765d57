//! Safetensors tensor store
//!
//! Reads a flat name → tensor mapping out of a `.safetensors` file. The same
//! reader backs adapter files and the component weights of a base model.

use candle_core::{DType, Device, Tensor};
use memmap2::Mmap;
use safetensors::{Dtype, SafeTensors};
use std::collections::{BTreeMap, HashMap};
use std::fs::File;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::{Error, Result};

/// A memory-mapped safetensors file
pub struct TensorStore {
    path: PathBuf,
    mmap: Mmap,
}

impl TensorStore {
    /// Map a safetensors file into memory
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path).map_err(|e| {
            Error::model_loading(format!("Failed to open {}: {}", path.display(), e))
        })?;
        // SAFETY: the file is opened read-only and the mapping never outlives `self`.
        let mmap = unsafe { Mmap::map(&file)? };
        Ok(Self { path, mmap })
    }

    /// File backing this store
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Free-form `__metadata__` header, if the writer recorded one
    pub fn metadata(&self) -> Result<Option<HashMap<String, String>>> {
        let (_, metadata) = SafeTensors::read_metadata(&self.mmap)?;
        Ok(metadata.metadata().clone())
    }

    /// Tensor names in the file, sorted
    pub fn names(&self) -> Result<Vec<String>> {
        let tensors = SafeTensors::deserialize(&self.mmap)?;
        let mut names: Vec<String> = tensors.names().into_iter().cloned().collect();
        names.sort();
        Ok(names)
    }

    /// Load every tensor onto `device`, keeping its stored dtype
    pub fn load(&self, device: &Device) -> Result<BTreeMap<String, Tensor>> {
        let tensors = SafeTensors::deserialize(&self.mmap)?;
        let mut out = BTreeMap::new();

        for (name, view) in tensors.tensors() {
            let dtype = candle_dtype(view.dtype()).ok_or_else(|| {
                Error::model_loading(format!(
                    "Unsupported dtype {:?} for tensor `{}` in {}",
                    view.dtype(),
                    name,
                    self.path.display()
                ))
            })?;
            let tensor = Tensor::from_raw_buffer(view.data(), dtype, view.shape(), device)?;
            out.insert(name, tensor);
        }

        debug!(path = %self.path.display(), tensors = out.len(), "Loaded tensor store");
        Ok(out)
    }
}

/// Read every tensor of a safetensors file
pub fn read_tensors(path: impl AsRef<Path>, device: &Device) -> Result<BTreeMap<String, Tensor>> {
    TensorStore::open(path)?.load(device)
}

/// Write tensors to a safetensors file
pub fn write_tensors(path: impl AsRef<Path>, tensors: &BTreeMap<String, Tensor>) -> Result<()> {
    let tensors: HashMap<String, Tensor> = tensors
        .iter()
        .map(|(name, tensor)| (name.clone(), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path.as_ref())?;
    Ok(())
}

fn candle_dtype(dtype: Dtype) -> Option<DType> {
    match dtype {
        Dtype::F16 => Some(DType::F16),
        Dtype::BF16 => Some(DType::BF16),
        Dtype::F32 => Some(DType::F32),
        Dtype::F64 => Some(DType::F64),
        Dtype::U8 => Some(DType::U8),
        Dtype::U32 => Some(DType::U32),
        Dtype::I64 => Some(DType::I64),
        _ => None,
    }
}
