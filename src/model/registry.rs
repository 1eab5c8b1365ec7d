//! Named-layer registry used when rebuilding layers from saved configs.
//!
//! A saved layer is described by a [`LayerRecord`]: the class name it was
//! registered under plus its JSON config. The registry maps class names to
//! factories that rebuild the layer shape and restore its parameters.

use std::any::Any;
use std::collections::BTreeMap;

use candle_core::{Result, Tensor};
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::config::PatchEncoderConfig;
use super::patch_encoder::PatchEncoder;

/// Class name the patch encoder is saved under.
pub const PATCH_ENCODER_CLASS: &str = "PatchEncoder";

/// A layer that can be saved as a [`LayerRecord`] and rebuilt by a registry.
pub trait Layer: Send + Sync {
    /// Registered class name.
    fn class_name(&self) -> &'static str;

    /// Configuration needed to rebuild this layer's shape.
    ///
    /// # Errors
    /// Returns an error if the config cannot be represented as JSON.
    fn get_config(&self) -> serde_json::Result<Value>;

    /// Run the layer.
    ///
    /// # Errors
    /// Returns an error if tensor operations fail or the input shape is wrong.
    fn forward(&self, xs: &Tensor) -> Result<Tensor>;

    fn as_any(&self) -> &dyn Any;
}

impl Layer for PatchEncoder {
    fn class_name(&self) -> &'static str {
        PATCH_ENCODER_CLASS
    }

    fn get_config(&self) -> serde_json::Result<Value> {
        serde_json::to_value(self.config())
    }

    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.encode(xs)
    }

    fn as_any(&self) -> &dyn Any {
        self
    }
}

/// Serialized description of one layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LayerRecord {
    pub class_name: String,
    pub config: Value,
}

impl LayerRecord {
    /// Record describing `layer`.
    ///
    /// # Errors
    /// Returns an error if the layer's config cannot be serialized.
    pub fn of(layer: &dyn Layer) -> serde_json::Result<Self> {
        Ok(Self {
            class_name: layer.class_name().to_string(),
            config: layer.get_config()?,
        })
    }
}

/// Rebuilds a layer from its config, input width and parameter source.
pub type LayerFactory =
    Box<dyn Fn(&Value, usize, VarBuilder<'_>) -> Result<Box<dyn Layer>> + Send + Sync>;

/// Class-name to factory lookup.
#[derive(Default)]
pub struct LayerRegistry {
    factories: BTreeMap<String, LayerFactory>,
}

impl LayerRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the crate's own layers registered.
    #[must_use]
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.register(PATCH_ENCODER_CLASS, Box::new(build_patch_encoder));
        registry
    }

    /// Register `factory` under `class_name`, replacing any previous entry.
    pub fn register(&mut self, class_name: impl Into<String>, factory: LayerFactory) {
        let class_name = class_name.into();
        tracing::debug!(class_name = %class_name, "registering layer factory");
        self.factories.insert(class_name, factory);
    }

    #[must_use]
    pub fn contains(&self, class_name: &str) -> bool {
        self.factories.contains_key(class_name)
    }

    /// Registered class names, sorted.
    #[must_use]
    pub fn class_names(&self) -> Vec<&str> {
        self.factories.keys().map(String::as_str).collect()
    }

    /// Rebuild the layer described by `record`.
    ///
    /// # Errors
    /// Returns an error if the class is not registered or its factory fails.
    /// No layer is returned unless the factory fully succeeds.
    #[allow(clippy::needless_pass_by_value)]
    pub fn build(
        &self,
        record: &LayerRecord,
        in_dim: usize,
        vb: VarBuilder<'_>,
    ) -> Result<Box<dyn Layer>> {
        let Some(factory) = self.factories.get(&record.class_name) else {
            candle_core::bail!(
                "unknown layer class {:?}; registered classes: {}",
                record.class_name,
                self.class_names().join(", ")
            );
        };
        tracing::debug!(class_name = %record.class_name, in_dim, "rebuilding layer");
        factory(&record.config, in_dim, vb)
    }
}

/// Parse a patch encoder config out of a layer record's config object.
///
/// # Errors
/// Returns an error if a required key is missing or has the wrong type.
pub fn patch_encoder_config(config: &Value) -> Result<PatchEncoderConfig> {
    PatchEncoderConfig::deserialize(config)
        .map_err(|e| candle_core::Error::Msg(format!("invalid {PATCH_ENCODER_CLASS} config: {e}")))
}

#[allow(clippy::needless_pass_by_value)]
fn build_patch_encoder(
    config: &Value,
    in_dim: usize,
    vb: VarBuilder<'_>,
) -> Result<Box<dyn Layer>> {
    let config = patch_encoder_config(config)?;
    let encoder = PatchEncoder::new(config, in_dim, vb)?;
    Ok(Box::new(encoder))
}
