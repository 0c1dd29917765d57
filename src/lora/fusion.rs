//! LoRA fusion into base weights
//!
//! Adapter tensors are grouped by layer into [`FusionUpdate`]s, each layer is
//! resolved to a weight of the base model, and the dense delta
//! `multiplier * scale * (up @ down)` is added into that weight.
//!
//! Fusion is all-or-nothing: every group is resolved, validated and turned
//! into a delta before the first weight is written, so a bad adapter leaves
//! the weights exactly as they were. Fusion is additive, not idempotent:
//! fusing the same adapter twice with multiplier `m` equals fusing once with
//! `2m`.

use candle_core::{DType, Tensor};
use serde::Serialize;
use std::collections::{BTreeMap, HashMap};
use tracing::{debug, info, instrument, warn};

use crate::error::{Error, Result};
use crate::lora::key::{AdapterKey, ElementKind};
use crate::lora::resolver::{LayerResolver, ResolvedTarget};
use crate::lora::AdapterTensorSet;
use crate::model::graph::WeightHandle;
use crate::model::{ComponentKind, ModelWeights};

/// Default blend strength
pub const DEFAULT_MULTIPLIER: f64 = 0.5;

/// Options controlling how deltas are computed
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct FusionOptions {
    /// Blend strength applied to every delta
    pub multiplier: f64,
    /// Precision the low-rank product is computed in
    pub compute_dtype: DType,
}

impl Default for FusionOptions {
    fn default() -> Self {
        Self {
            multiplier: DEFAULT_MULTIPLIER,
            compute_dtype: DType::F32,
        }
    }
}

impl FusionOptions {
    /// Default options with a custom multiplier
    pub fn with_multiplier(multiplier: f64) -> Self {
        Self {
            multiplier,
            ..Default::default()
        }
    }
}

/// All tensors of one adapter layer, bound to the weight it targets
#[derive(Debug, Clone)]
pub struct FusionUpdate {
    /// Adapter layer key
    pub layer: String,
    /// Resolved target weight
    pub target: ResolvedTarget,
    /// Up factor, `(out, rank)` or `(out, rank, 1, 1)`
    pub up: Tensor,
    /// Down factor, `(rank, in)` or `(rank, in, 1, 1)`
    pub down: Tensor,
    /// Optional scaling numerator
    pub alpha: Option<f64>,
    /// Blend strength
    pub multiplier: f64,
}

impl FusionUpdate {
    /// Bottleneck width shared by both factors
    pub fn rank(&self) -> usize {
        self.up.dims().get(1).copied().unwrap_or(0)
    }

    /// `alpha / rank`, or 1 when alpha is absent or zero
    pub fn scale(&self) -> f64 {
        match self.alpha {
            Some(alpha) if alpha != 0.0 && self.rank() > 0 => alpha / self.rank() as f64,
            _ => 1.0,
        }
    }

    /// Dense delta `multiplier * scale * (up @ down)` in `dtype`
    pub fn delta(&self, dtype: DType) -> Result<Tensor> {
        let up = self.up.to_dtype(dtype)?;
        let down = self.down.to_dtype(dtype)?;

        let product = match (up.rank(), down.rank()) {
            (2, 2) => {
                self.check_inner_dims(&up, &down)?;
                up.matmul(&down)?
            }
            (4, 4) => {
                self.check_pointwise(&up, "lora_up.weight")?;
                self.check_pointwise(&down, "lora_down.weight")?;
                let up = up.squeeze(3)?.squeeze(2)?;
                let down = down.squeeze(3)?.squeeze(2)?;
                self.check_inner_dims(&up, &down)?;
                up.matmul(&down)?.unsqueeze(2)?.unsqueeze(3)?
            }
            (u, d) => {
                return Err(Error::shape_mismatch(
                    &self.layer,
                    format!("unsupported factor ranks: up is {}-D, down is {}-D", u, d),
                ))
            }
        };

        Ok(product.affine(self.multiplier * self.scale(), 0.0)?)
    }

    fn check_inner_dims(&self, up: &Tensor, down: &Tensor) -> Result<()> {
        let (up_rank, down_rank) = (up.dims()[1], down.dims()[0]);
        if up_rank != down_rank {
            return Err(Error::shape_mismatch(
                &self.layer,
                format!(
                    "up {:?} and down {:?} disagree on rank ({} vs {})",
                    self.up.dims(),
                    self.down.dims(),
                    up_rank,
                    down_rank
                ),
            ));
        }
        Ok(())
    }

    fn check_pointwise(&self, factor: &Tensor, element: &str) -> Result<()> {
        if factor.dims()[2..] != [1, 1] {
            return Err(Error::shape_mismatch(
                &self.layer,
                format!(
                    "{} {:?} has non-singleton kernel dimensions",
                    element,
                    factor.dims()
                ),
            ));
        }
        Ok(())
    }
}

/// Validated set of updates ready to be applied
#[derive(Debug, Default)]
pub struct FusionPlan {
    updates: Vec<FusionUpdate>,
    ignored: Vec<String>,
}

impl FusionPlan {
    /// Group adapter tensors by layer and resolve every layer
    pub fn build(
        weights: &ModelWeights,
        adapter: &AdapterTensorSet,
        multiplier: f64,
    ) -> Result<Self> {
        let resolver = LayerResolver::new(weights);
        let mut groups: BTreeMap<&str, LayerTensors<'_>> = BTreeMap::new();
        let mut ignored = Vec::new();

        for (raw_key, tensor) in adapter {
            let key = AdapterKey::parse(raw_key)?;
            let layer = &raw_key[..key.layer.len()];
            let group = groups.entry(layer).or_default();
            match key.element {
                ElementKind::Up => group.up = Some(tensor),
                ElementKind::Down => group.down = Some(tensor),
                ElementKind::Alpha => group.alpha = Some(tensor),
                ElementKind::Other(ref element) => {
                    warn!("Ignoring adapter tensor {} (unknown element {})", raw_key, element);
                    ignored.push(raw_key.clone());
                }
            }
        }

        let mut updates = Vec::with_capacity(groups.len());
        for (layer, group) in groups {
            if group.up.is_none() && group.down.is_none() && group.alpha.is_none() {
                continue;
            }

            let target = resolver.resolve(layer)?;
            let up = group.up.ok_or_else(|| Error::MissingFactor {
                layer: layer.to_string(),
                element: "lora_up.weight",
            })?;
            let down = group.down.ok_or_else(|| Error::MissingFactor {
                layer: layer.to_string(),
                element: "lora_down.weight",
            })?;
            let alpha = group.alpha.map(|t| scalar(layer, t)).transpose()?;

            debug!(
                "Planned {} -> {}:{} (rank {}, alpha {:?})",
                layer,
                target.component,
                target.module_path,
                up.dims().get(1).copied().unwrap_or(0),
                alpha
            );

            updates.push(FusionUpdate {
                layer: layer.to_string(),
                target,
                up: up.clone(),
                down: down.clone(),
                alpha,
                multiplier,
            });
        }

        Ok(Self { updates, ignored })
    }

    /// Planned updates, ordered by layer key
    pub fn updates(&self) -> &[FusionUpdate] {
        &self.updates
    }

    /// Adapter keys that carry no fusion data
    pub fn ignored(&self) -> &[String] {
        &self.ignored
    }

    /// Compute every delta and apply them. Nothing is written unless all
    /// deltas are valid.
    pub fn apply(self, weights: &mut ModelWeights, compute_dtype: DType) -> Result<FusionReport> {
        let mut pending: HashMap<(ComponentKind, WeightHandle), Tensor> = HashMap::new();
        let mut report = FusionReport {
            ignored_keys: self.ignored,
            ..Default::default()
        };

        for update in &self.updates {
            let key = (update.target.component, update.target.handle);
            let current = match pending.get(&key) {
                Some(tensor) => tensor.clone(),
                None => weights
                    .component(update.target.component)
                    .weight(update.target.handle)
                    .clone(),
            };

            let delta = update.delta(compute_dtype)?;
            if delta.dims() != current.dims() {
                return Err(Error::shape_mismatch(
                    &update.layer,
                    format!(
                        "delta {:?} does not match `{}` {:?}",
                        delta.dims(),
                        update.target.module_path,
                        current.dims()
                    ),
                ));
            }

            let fused = current.add(&delta.to_dtype(current.dtype())?)?;
            pending.insert(key, fused);

            report.groups += 1;
            *report.per_component.entry(update.target.component).or_insert(0) += 1;
        }

        for ((component, handle), tensor) in pending {
            report.parameters_touched += tensor.elem_count();
            weights.component_mut(component).replace_weight(handle, tensor)?;
        }

        Ok(report)
    }
}

#[derive(Default)]
struct LayerTensors<'a> {
    up: Option<&'a Tensor>,
    down: Option<&'a Tensor>,
    alpha: Option<&'a Tensor>,
}

fn scalar(layer: &str, tensor: &Tensor) -> Result<f64> {
    if tensor.elem_count() != 1 {
        return Err(Error::shape_mismatch(
            layer,
            format!("alpha must be a scalar, got shape {:?}", tensor.dims()),
        ));
    }
    let values = tensor.to_dtype(DType::F64)?.flatten_all()?.to_vec1::<f64>()?;
    Ok(values[0])
}

/// Summary of a completed fusion
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct FusionReport {
    /// Adapter layers fused
    pub groups: usize,
    /// Layers fused per sub-model
    pub per_component: BTreeMap<ComponentKind, usize>,
    /// Scalar weights rewritten
    pub parameters_touched: usize,
    /// Adapter keys skipped because they carry no fusion data
    pub ignored_keys: Vec<String>,
}

/// Fuse an adapter into `weights`, all or nothing
#[instrument(skip_all, fields(tensors = adapter.len(), multiplier = options.multiplier))]
pub fn fuse(
    weights: &mut ModelWeights,
    adapter: &AdapterTensorSet,
    options: &FusionOptions,
) -> Result<FusionReport> {
    let plan = FusionPlan::build(weights, adapter, options.multiplier)?;
    let report = plan.apply(weights, options.compute_dtype)?;

    info!(
        "Fused {} adapter layers ({} text encoder, {} unet), {} weights updated",
        report.groups,
        report.per_component.get(&ComponentKind::TextEncoder).unwrap_or(&0),
        report.per_component.get(&ComponentKind::Unet).unwrap_or(&0),
        report.parameters_touched
    );
    Ok(report)
}
