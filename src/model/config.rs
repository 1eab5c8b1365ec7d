use candle_core::DType;
use serde::{Deserialize, Serialize};

/// Persisted configuration of a [`PatchEncoder`](super::PatchEncoder).
///
/// Mirrors the layer record written next to the weights: the generic layer
/// fields (`name`, `trainable`, `dtype`) plus the two shape scalars that must be
/// known before any parameter can be restored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PatchEncoderConfig {
    /// Layer name
    #[serde(default = "default_name")]
    pub name: String,
    /// Whether the layer was trainable when saved (informational at inference time)
    #[serde(default = "default_trainable")]
    pub trainable: bool,
    /// Parameter dtype name as recorded by the exporter
    #[serde(default = "default_dtype")]
    pub dtype: String,
    /// Number of non-overlapping patches per image (rows in the position table)
    pub num_patches: usize,
    /// Output embedding width
    pub projection_dim: usize,
}

fn default_name() -> String {
    "patch_encoder".to_string()
}

fn default_trainable() -> bool {
    true
}

fn default_dtype() -> String {
    dtype_name(DType::F32).to_string()
}

/// Name a parameter dtype the way layer records spell it (`"float32"`, `"bfloat16"`, ...).
#[must_use]
pub fn dtype_name(dtype: DType) -> &'static str {
    match dtype {
        DType::F32 => "float32",
        DType::F16 => "float16",
        DType::BF16 => "bfloat16",
        DType::F64 => "float64",
        other => other.as_str(),
    }
}

/// Parse a recorded dtype name. Accepts the long names and candle's short ones.
///
/// # Errors
/// Returns an error if the name is not a floating point dtype.
pub fn dtype_from_name(name: &str) -> Result<DType, &'static str> {
    match name {
        "float32" | "f32" => Ok(DType::F32),
        "float16" | "f16" => Ok(DType::F16),
        "bfloat16" | "bf16" => Ok(DType::BF16),
        "float64" | "f64" => Ok(DType::F64),
        _ => Err("dtype must be one of float32, float16, bfloat16, float64"),
    }
}

impl PatchEncoderConfig {
    /// Config with default layer fields for the given shape.
    #[must_use]
    pub fn new(num_patches: usize, projection_dim: usize) -> Self {
        Self {
            name: default_name(),
            trainable: default_trainable(),
            dtype: default_dtype(),
            num_patches,
            projection_dim,
        }
    }

    /// Validate the shape scalars.
    ///
    /// # Errors
    /// Returns an error if either size is zero.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_patches == 0 {
            return Err("num_patches must be positive");
        }
        if self.projection_dim == 0 {
            return Err("projection_dim must be positive");
        }
        Ok(())
    }

    /// Parameter dtype recorded in [`dtype`](Self::dtype).
    ///
    /// # Errors
    /// Returns an error if the recorded name is not a floating point dtype.
    pub fn param_dtype(&self) -> Result<DType, &'static str> {
        dtype_from_name(&self.dtype)
    }
}

/// Architecture constants of the coral ViT-lite classifier.
///
/// Only the patching geometry and projection width feed into the patch encoder;
/// the remaining fields describe the trained network and are carried so a saved
/// config round-trips without loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VitLiteConfig {
    /// Square input image side in pixels
    pub img_size: usize,
    /// Square patch side in pixels
    pub patch_size: usize,
    /// Image channels (RGB)
    pub in_channels: usize,
    /// Patch embedding width
    pub projection_dim: usize,
    /// Attention heads per transformer layer
    pub num_heads: usize,
    /// Number of transformer layers
    pub transformer_layers: usize,
    /// Output classes (bleached, healthy)
    pub num_classes: usize,
}

impl VitLiteConfig {
    /// The trained `coral_vit_lite` geometry: 224px RGB input, 16px patches, 256-wide embedding.
    #[must_use]
    pub fn coral_vit_lite() -> Self {
        Self {
            img_size: 224,
            patch_size: 16,
            in_channels: 3,
            projection_dim: 256,
            num_heads: 4,
            transformer_layers: 4,
            num_classes: 2,
        }
    }

    /// Patches per image: `(img_size / patch_size)^2`.
    #[must_use]
    pub fn num_patches(&self) -> usize {
        let per_side = self.img_size / self.patch_size;
        per_side * per_side
    }

    /// Flattened patch width: `patch_size * patch_size * in_channels`.
    #[must_use]
    pub fn patch_dim(&self) -> usize {
        self.patch_size * self.patch_size * self.in_channels
    }

    /// Config for the patch encoder layer of this architecture.
    #[must_use]
    pub fn patch_encoder_config(&self) -> PatchEncoderConfig {
        PatchEncoderConfig::new(self.num_patches(), self.projection_dim)
    }

    /// Validate that configuration is consistent.
    ///
    /// # Errors
    /// Returns an error if the configuration is internally inconsistent.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.img_size == 0 || self.patch_size == 0 || self.in_channels == 0 {
            return Err("img_size, patch_size and in_channels must be positive");
        }
        if !self.img_size.is_multiple_of(self.patch_size) {
            return Err("img_size must be divisible by patch_size");
        }
        if self.projection_dim == 0 {
            return Err("projection_dim must be positive");
        }
        if self.num_heads == 0 || !self.projection_dim.is_multiple_of(self.num_heads) {
            return Err("projection_dim must be divisible by num_heads");
        }
        if self.num_classes == 0 {
            return Err("num_classes must be positive");
        }
        Ok(())
    }
}

impl Default for VitLiteConfig {
    fn default() -> Self {
        Self::coral_vit_lite()
    }
}
