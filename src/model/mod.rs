//! Loaded model weights
//!
//! A [`ModelWeights`] value owns the three weight-bearing sub-models of a
//! diffusion pipeline. It is the only mutable form of the weights: adapters
//! are fused into it, and it is then frozen into the `Arc`-shared components
//! of a [`crate::pipeline::ModelPipeline`].

pub mod graph;
pub mod loader;

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::error::{Error, Result};
use graph::{LayerIndex, ModuleTree, ResolvedModule, WeightHandle};

pub use loader::{
    load_model, load_scheduler_config, load_weights, save_scheduler_config, save_weights,
    LoadOptions,
};

/// Weight-bearing sub-models of a pipeline
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentKind {
    /// Prompt encoder
    TextEncoder,
    /// Denoising network
    Unet,
    /// Image encoder/decoder
    Vae,
}

impl ComponentKind {
    /// All components in load order
    pub const ALL: [ComponentKind; 3] = [
        ComponentKind::TextEncoder,
        ComponentKind::Unet,
        ComponentKind::Vae,
    ];

    /// Directory name in a diffusers model layout
    pub fn dir_name(&self) -> &'static str {
        match self {
            ComponentKind::TextEncoder => "text_encoder",
            ComponentKind::Unet => "unet",
            ComponentKind::Vae => "vae",
        }
    }
}

impl fmt::Display for ComponentKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// One sub-model: named parameters plus the module tree derived from them
pub struct SubModel {
    kind: ComponentKind,
    names: Vec<String>,
    tensors: Vec<Tensor>,
    by_name: HashMap<String, usize>,
    tree: ModuleTree,
    index: LayerIndex,
}

impl SubModel {
    /// Build a sub-model and its layer index from named parameters
    pub fn new(kind: ComponentKind, params: BTreeMap<String, Tensor>) -> Self {
        let (names, tensors): (Vec<String>, Vec<Tensor>) = params.into_iter().unzip();
        let by_name = names
            .iter()
            .enumerate()
            .map(|(i, name)| (name.clone(), i))
            .collect();
        let tree = ModuleTree::from_parameters(names.iter().map(String::as_str).zip(0..));
        let index = LayerIndex::build(&tree);

        Self {
            kind,
            names,
            tensors,
            by_name,
            tree,
            index,
        }
    }

    /// Which sub-model this is
    pub fn kind(&self) -> ComponentKind {
        self.kind
    }

    /// Number of parameter tensors
    pub fn len(&self) -> usize {
        self.tensors.len()
    }

    /// Whether the sub-model has no parameters
    pub fn is_empty(&self) -> bool {
        self.tensors.is_empty()
    }

    /// Total number of scalar parameters
    pub fn num_parameters(&self) -> usize {
        self.tensors.iter().map(Tensor::elem_count).sum()
    }

    /// Parameter by its full name
    pub fn tensor(&self, name: &str) -> Option<&Tensor> {
        self.by_name.get(name).map(|&i| &self.tensors[i])
    }

    /// Parameters in name order
    pub fn tensors(&self) -> impl Iterator<Item = (&str, &Tensor)> {
        self.names.iter().map(String::as_str).zip(self.tensors.iter())
    }

    /// Weight behind a handle
    pub fn weight(&self, handle: WeightHandle) -> &Tensor {
        &self.tensors[handle.index()]
    }

    /// Parameter name behind a handle
    pub fn weight_name(&self, handle: WeightHandle) -> &str {
        &self.names[handle.index()]
    }

    /// Replace the weight behind a handle. Only fusion writes weights.
    pub(crate) fn replace_weight(&mut self, handle: WeightHandle, tensor: Tensor) -> Result<()> {
        let current = &self.tensors[handle.index()];
        if current.dims() != tensor.dims() || current.dtype() != tensor.dtype() {
            return Err(Error::generation(format!(
                "refusing to replace `{}` {:?}/{:?} with {:?}/{:?}",
                self.names[handle.index()],
                current.dims(),
                current.dtype(),
                tensor.dims(),
                tensor.dtype()
            )));
        }
        self.tensors[handle.index()] = tensor;
        Ok(())
    }

    /// Module tree of this sub-model
    pub fn tree(&self) -> &ModuleTree {
        &self.tree
    }

    /// Look up a flattened module path in the precomputed index
    pub fn resolve(&self, flattened: &str) -> Option<&ResolvedModule> {
        self.index.get(flattened)
    }

    /// Number of modules adapters can target
    pub fn addressable_modules(&self) -> usize {
        self.index.len()
    }

    /// Dtype of the first floating point parameter, F32 when there is none
    pub fn dtype(&self) -> DType {
        self.tensors
            .iter()
            .map(Tensor::dtype)
            .find(|dtype| dtype.is_float())
            .unwrap_or(DType::F32)
    }

    /// Consume the sub-model, returning its named parameters
    pub fn into_parameters(self) -> BTreeMap<String, Tensor> {
        self.names.into_iter().zip(self.tensors).collect()
    }
}

impl fmt::Debug for SubModel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubModel")
            .field("kind", &self.kind)
            .field("tensors", &self.tensors.len())
            .field("addressable_modules", &self.index.len())
            .finish()
    }
}

/// Owned, mutable weights of a whole pipeline
#[derive(Debug)]
pub struct ModelWeights {
    /// Prompt encoder
    pub text_encoder: SubModel,
    /// Denoising network
    pub unet: SubModel,
    /// Image encoder/decoder
    pub vae: SubModel,
}

impl ModelWeights {
    /// Assemble weights from the three sub-models
    pub fn new(text_encoder: SubModel, unet: SubModel, vae: SubModel) -> Self {
        Self {
            text_encoder,
            unet,
            vae,
        }
    }

    /// Sub-model by kind
    pub fn component(&self, kind: ComponentKind) -> &SubModel {
        match kind {
            ComponentKind::TextEncoder => &self.text_encoder,
            ComponentKind::Unet => &self.unet,
            ComponentKind::Vae => &self.vae,
        }
    }

    /// Mutable sub-model by kind
    pub fn component_mut(&mut self, kind: ComponentKind) -> &mut SubModel {
        match kind {
            ComponentKind::TextEncoder => &mut self.text_encoder,
            ComponentKind::Unet => &mut self.unet,
            ComponentKind::Vae => &mut self.vae,
        }
    }

    /// Total number of scalar parameters across sub-models
    pub fn num_parameters(&self) -> usize {
        ComponentKind::ALL
            .iter()
            .map(|kind| self.component(*kind).num_parameters())
            .sum()
    }
}
