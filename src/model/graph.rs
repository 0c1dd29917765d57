//! Module graph of a sub-model
//!
//! The graph is rebuilt from parameter names (`a.b.c.weight`) when a
//! component is loaded. Every module owning a `weight` parameter gets a
//! [`WeightHandle`]; a [`LayerIndex`] then maps flattened, underscore-joined
//! module paths to those handles so adapter layers resolve with one lookup.

use std::collections::{BTreeMap, HashMap};

/// Typed reference to the weight tensor of a module
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct WeightHandle(pub(crate) usize);

impl WeightHandle {
    /// Position of the weight among the sub-model's parameters
    pub fn index(&self) -> usize {
        self.0
    }
}

/// A node of the module tree
#[derive(Debug, Default)]
pub struct ModuleNode {
    children: BTreeMap<String, ModuleNode>,
    weight: Option<WeightHandle>,
}

impl ModuleNode {
    /// Child module by attribute name
    pub fn child(&self, name: &str) -> Option<&ModuleNode> {
        self.children.get(name)
    }

    /// Attribute names of the direct children
    pub fn child_names(&self) -> impl Iterator<Item = &str> {
        self.children.keys().map(String::as_str)
    }

    /// Handle of this module's weight, if it has one
    pub fn weight(&self) -> Option<WeightHandle> {
        self.weight
    }
}

/// Outcome of walking the tree with adapter path tokens
#[derive(Debug)]
pub struct Walk<'a> {
    /// Module the walk stopped at
    pub node: &'a ModuleNode,
    /// Attribute names descended through, root first
    pub segments: Vec<String>,
}

impl Walk<'_> {
    /// Dotted module path (`down_blocks.0.attentions.1.proj_in`)
    pub fn module_path(&self) -> String {
        self.segments.join(".")
    }
}

/// Attribute tree of a sub-model
#[derive(Debug, Default)]
pub struct ModuleTree {
    root: ModuleNode,
}

impl ModuleTree {
    /// Build the tree from `(parameter name, parameter position)` pairs
    pub fn from_parameters<'a>(params: impl IntoIterator<Item = (&'a str, usize)>) -> Self {
        let mut root = ModuleNode::default();

        for (name, position) in params {
            let mut segments: Vec<&str> = name.split('.').collect();
            let leaf = match segments.pop() {
                Some(leaf) if !segments.is_empty() => leaf,
                _ => continue,
            };

            let mut node = &mut root;
            for segment in segments {
                node = node.children.entry(segment.to_string()).or_default();
            }
            if leaf == "weight" {
                node.weight = Some(WeightHandle(position));
            }
        }

        Self { root }
    }

    /// Root module
    pub fn root(&self) -> &ModuleNode {
        &self.root
    }

    /// Greedy walk over underscore-split path tokens.
    ///
    /// The candidate attribute name starts as the first token. When a child
    /// with that name exists the walk descends and the candidate restarts at
    /// the next token; otherwise the next token is appended with `_`. Module
    /// names such as `self_attn` or `proj_in` therefore resolve even though the
    /// flattened path splits them. Returns `None` when tokens run out before
    /// the candidate matches.
    pub fn walk(&self, tokens: &[&str]) -> Option<Walk<'_>> {
        let mut tokens = tokens.iter();
        let mut candidate = tokens.next()?.to_string();
        let mut node = &self.root;
        let mut segments = Vec::new();

        loop {
            if let Some(child) = node.child(&candidate) {
                node = child;
                segments.push(std::mem::take(&mut candidate));
                match tokens.next() {
                    Some(next) => candidate = next.to_string(),
                    None => return Some(Walk { node, segments }),
                }
            } else {
                let next = tokens.next()?;
                if candidate.is_empty() {
                    candidate = next.to_string();
                } else {
                    candidate.push('_');
                    candidate.push_str(next);
                }
            }
        }
    }

    /// Every weight-bearing module as `(segments, handle)`, depth first
    pub fn weight_modules(&self) -> Vec<(Vec<String>, WeightHandle)> {
        let mut out = Vec::new();
        let mut stack: Vec<(Vec<String>, &ModuleNode)> = vec![(Vec::new(), &self.root)];

        while let Some((path, node)) = stack.pop() {
            if let Some(handle) = node.weight {
                out.push((path.clone(), handle));
            }
            for (name, child) in node.children.iter().rev() {
                let mut child_path = path.clone();
                child_path.push(name.clone());
                stack.push((child_path, child));
            }
        }

        out
    }
}

/// A module an adapter layer resolved to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedModule {
    /// Weight of the module
    pub handle: WeightHandle,
    /// Dotted module path
    pub module_path: String,
}

/// Flattened module path → weight lookup table
#[derive(Debug, Default)]
pub struct LayerIndex {
    entries: HashMap<String, ResolvedModule>,
}

impl LayerIndex {
    /// Precompute the table so that it agrees with [`ModuleTree::walk`]
    pub fn build(tree: &ModuleTree) -> Self {
        let mut entries = HashMap::new();

        for (segments, _) in tree.weight_modules() {
            let flattened = segments.join("_");
            if entries.contains_key(&flattened) {
                continue;
            }

            let tokens: Vec<&str> = flattened.split('_').collect();
            let resolved = tree.walk(&tokens).and_then(|walk| {
                walk.node.weight().map(|handle| ResolvedModule {
                    handle,
                    module_path: walk.module_path(),
                })
            });

            if let Some(resolved) = resolved {
                entries.insert(flattened, resolved);
            }
        }

        Self { entries }
    }

    /// Look up a flattened module path
    pub fn get(&self, flattened: &str) -> Option<&ResolvedModule> {
        self.entries.get(flattened)
    }

    /// Number of addressable modules
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no module is addressable
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Flattened keys, unordered
    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }
}
