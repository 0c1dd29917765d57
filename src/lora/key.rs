//! Adapter tensor keys
//!
//! Adapter files produced by the kohya-style trainers name every tensor
//! `<layer>.<element>`, for example
//! `lora_te_text_model_encoder_layers_0_self_attn_k_proj.lora_down.weight`.
//! The layer part starts with a namespace selecting the sub-model and
//! continues with the module path flattened with underscores.

use std::fmt;

use crate::error::{Error, Result};
use crate::model::ComponentKind;

/// Namespace prefix of text encoder layers
pub const TEXT_ENCODER_PREFIX: &str = "lora_te_";
/// Namespace prefix of denoising network layers
pub const UNET_PREFIX: &str = "lora_unet_";

/// The part of an adapter key after the layer path
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ElementKind {
    /// `lora_up.weight`
    Up,
    /// `lora_down.weight`
    Down,
    /// `alpha`
    Alpha,
    /// Anything else; carried along but never fused
    Other(String),
}

impl ElementKind {
    /// Parse the element suffix of an adapter key
    pub fn parse(suffix: &str) -> Self {
        match suffix {
            "lora_up.weight" => ElementKind::Up,
            "lora_down.weight" => ElementKind::Down,
            "alpha" => ElementKind::Alpha,
            other => ElementKind::Other(other.to_string()),
        }
    }

    /// Suffix as written in adapter files
    pub fn as_str(&self) -> &str {
        match self {
            ElementKind::Up => "lora_up.weight",
            ElementKind::Down => "lora_down.weight",
            ElementKind::Alpha => "alpha",
            ElementKind::Other(s) => s,
        }
    }
}

impl fmt::Display for ElementKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A parsed adapter tensor key
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AdapterKey {
    /// Layer part, namespace included (`lora_unet_mid_block_...`)
    pub layer: String,
    /// Element part
    pub element: ElementKind,
}

impl AdapterKey {
    /// Split a raw key at its first dot
    pub fn parse(raw: &str) -> Result<Self> {
        let (layer, element) = raw.split_once('.').ok_or_else(|| {
            Error::resolution(raw, "adapter key has no `.<element>` suffix")
        })?;

        if layer.is_empty() || element.is_empty() {
            return Err(Error::resolution(raw, "adapter key has an empty component"));
        }

        Ok(Self {
            layer: layer.to_string(),
            element: ElementKind::parse(element),
        })
    }
}

/// Layer part of an adapter key, split into namespace and path tokens
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LayerKey<'a> {
    /// Sub-model the layer lives in
    pub component: ComponentKind,
    /// Flattened module path without the namespace
    pub path: &'a str,
}

impl<'a> LayerKey<'a> {
    /// Strip the namespace prefix from an adapter layer key
    pub fn parse(layer: &'a str) -> Result<Self> {
        let (component, path) = if let Some(path) = layer.strip_prefix(TEXT_ENCODER_PREFIX) {
            (ComponentKind::TextEncoder, path)
        } else if let Some(path) = layer.strip_prefix(UNET_PREFIX) {
            (ComponentKind::Unet, path)
        } else {
            return Err(Error::resolution(
                layer,
                format!(
                    "unknown namespace, expected `{}` or `{}`",
                    TEXT_ENCODER_PREFIX, UNET_PREFIX
                ),
            ));
        };

        if path.is_empty() {
            return Err(Error::resolution(layer, "empty layer path"));
        }

        Ok(Self { component, path })
    }

    /// Underscore-delimited path tokens
    pub fn tokens(&self) -> Vec<&'a str> {
        self.path.split('_').collect()
    }
}
