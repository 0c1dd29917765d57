//! Adapter layer → model weight resolution

use crate::error::{Error, Result};
use crate::lora::key::LayerKey;
use crate::model::graph::WeightHandle;
use crate::model::{ComponentKind, ModelWeights, SubModel};

/// Weight an adapter layer targets
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    /// Sub-model holding the weight
    pub component: ComponentKind,
    /// Weight handle inside that sub-model
    pub handle: WeightHandle,
    /// Dotted module path, for reporting
    pub module_path: String,
}

/// Resolves adapter layer keys against loaded weights
pub struct LayerResolver<'a> {
    weights: &'a ModelWeights,
}

impl<'a> LayerResolver<'a> {
    /// Resolver over `weights`
    pub fn new(weights: &'a ModelWeights) -> Self {
        Self { weights }
    }

    /// Resolve an adapter layer key (`lora_unet_...`, without element suffix)
    pub fn resolve(&self, layer: &str) -> Result<ResolvedTarget> {
        let key = LayerKey::parse(layer)?;
        let sub_model = self.weights.component(key.component);
        resolve_in(sub_model, layer, key.path)
    }
}

fn resolve_in(sub_model: &SubModel, layer: &str, path: &str) -> Result<ResolvedTarget> {
    if let Some(resolved) = sub_model.resolve(path) {
        return Ok(ResolvedTarget {
            component: sub_model.kind(),
            handle: resolved.handle,
            module_path: resolved.module_path.clone(),
        });
    }

    // The index holds canonical spellings only; the walk also accepts
    // variants such as doubled separators.
    let tokens: Vec<&str> = path.split('_').collect();
    let reason = match sub_model.tree().walk(&tokens) {
        Some(walk) => {
            if let Some(handle) = walk.node.weight() {
                return Ok(ResolvedTarget {
                    component: sub_model.kind(),
                    handle,
                    module_path: walk.module_path(),
                });
            }
            format!(
                "`{}` in {} has no weight parameter",
                walk.module_path(),
                sub_model.kind()
            )
        }
        None => format!("no module of {} matches the path", sub_model.kind()),
    };
    Err(Error::resolution(layer, reason))
}
