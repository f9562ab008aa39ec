//! Node blueprints: static metadata describing each node kind.
//!
//! A blueprint declares a node kind's sockets, parameter schema, and the
//! painter strategy that renders it. The built-in catalog is bundled as
//! JSON; the authoring side may also carry blueprints over the wire with
//! full node snapshots, so the whole struct is (de)serializable.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use anyhow::{Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::value::{ParamKind, ParamValue, value_matches_kind};

const DEFAULT_BLUEPRINTS_JSON: &str = include_str!("../assets/blueprints.json");

/// Painter kind names understood by the built-in painter registry.
pub const PAINTER_SINGLE_PASS: &str = "single-pass";
pub const PAINTER_TWO_PASS: &str = "two-pass";
pub const PAINTER_PATTERN: &str = "pattern";
pub const PAINTER_OUTPUT: &str = "output";

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Blueprint {
    pub name: String,
    /// Painter kind as an open string: unknown kinds are a per-node render
    /// error, not a deserialization failure.
    pub painter: String,
    /// Fragment body key for the shader painters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shader: Option<String>,
    /// Placement layout for the pattern painter ("tile" | "scatter").
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
    #[serde(default)]
    pub inputs: Vec<String>,
    #[serde(default)]
    pub outputs: Vec<String>,
    #[serde(default)]
    pub params: Vec<ParamSpec>,
    /// Sink/passthrough nodes do not render; they alias their primary input.
    #[serde(default)]
    pub sink: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamSpec {
    pub name: String,
    pub kind: ParamKind,
    pub default: ParamValue,
}

impl Blueprint {
    /// The input socket a sink node forwards, by convention the first one.
    pub fn primary_input(&self) -> Option<&str> {
        self.inputs.first().map(String::as_str)
    }
}

#[derive(Debug, Clone, Default)]
pub struct BlueprintCatalog {
    blueprints: HashMap<String, Arc<Blueprint>>,
}

impl BlueprintCatalog {
    pub fn get(&self, name: &str) -> Option<&Arc<Blueprint>> {
        self.blueprints.get(name)
    }

    pub fn require(&self, name: &str) -> Result<Arc<Blueprint>> {
        self.blueprints
            .get(name)
            .cloned()
            .ok_or_else(|| anyhow!("unknown blueprint: {name}"))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.blueprints.keys().map(String::as_str)
    }
}

pub fn load_default_catalog() -> Result<BlueprintCatalog> {
    let list: Vec<Blueprint> = serde_json::from_str(DEFAULT_BLUEPRINTS_JSON)
        .map_err(|e| anyhow!("failed to parse assets/blueprints.json: {e}"))?;
    let mut blueprints = HashMap::new();
    for bp in list {
        blueprints.insert(bp.name.clone(), Arc::new(bp));
    }
    Ok(BlueprintCatalog { blueprints })
}

/// Merge a node's parameter bag over the blueprint defaults.
///
/// Values whose kind disagrees with the schema are dropped with a warning
/// and the default kept; parameters the schema does not declare are ignored
/// (forward compatibility with newer editors).
pub fn resolve_params(
    blueprint: &Blueprint,
    params: &BTreeMap<String, ParamValue>,
) -> BTreeMap<String, ParamValue> {
    let mut resolved = BTreeMap::new();
    for spec in &blueprint.params {
        let value = match params.get(&spec.name) {
            Some(v) if value_matches_kind(v, spec.kind) => v.clone(),
            Some(v) => {
                log::warn!(
                    "blueprint '{}': param '{}' expects {:?}, got {:?}; using default",
                    blueprint.name,
                    spec.name,
                    spec.kind,
                    v.kind()
                );
                spec.default.clone()
            }
            None => spec.default.clone(),
        };
        resolved.insert(spec.name.clone(), value);
    }
    resolved
}
