//! Patch-position encoder.
//!
//! Projects flattened image patches into the embedding space and adds a learned
//! embedding for each patch index.

use candle_core::{DType, Result, Tensor};
use candle_nn::{Embedding, Linear, Module, VarBuilder};

use super::config::{PatchEncoderConfig, dtype_name};

/// Patch projection plus learned absolute position embedding.
///
/// `encode(x)[b][i] = projection(x[b][i]) + position[i]`
pub struct PatchEncoder {
    /// Shared patch projection (patch_dim -> projection_dim), with bias
    projection: Linear,
    /// Position table (num_patches, projection_dim)
    position: Embedding,
    /// Expected innermost input width
    in_dim: usize,
    config: PatchEncoderConfig,
}

impl PatchEncoder {
    /// Create a patch encoder, restoring or initializing parameters through `vb`.
    ///
    /// # Arguments
    /// * `config` - Layer configuration (`num_patches`, `projection_dim`)
    /// * `in_dim` - Width of each flattened patch
    /// * `vb` - Variable builder for loading weights
    ///
    /// The config's `dtype` is set to the dtype the parameters were built with.
    ///
    /// # Errors
    /// Returns an error if a size is zero (checked before any parameter is
    /// touched) or if weight loading fails.
    #[allow(clippy::needless_pass_by_value)]
    pub fn new(mut config: PatchEncoderConfig, in_dim: usize, vb: VarBuilder) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;
        if in_dim == 0 {
            candle_core::bail!("patch input width must be positive");
        }

        let projection = candle_nn::linear(in_dim, config.projection_dim, vb.pp("projection"))?;
        let position =
            candle_nn::embedding(config.num_patches, config.projection_dim, vb.pp("position"))?;
        config.dtype = dtype_name(position.embeddings().dtype()).to_string();

        Ok(Self {
            projection,
            position,
            in_dim,
            config,
        })
    }

    /// Build from already restored parameter tensors.
    ///
    /// Expected shapes: `weight` (projection_dim, in_dim), `bias` (projection_dim),
    /// `table` (num_patches, projection_dim).
    ///
    /// # Errors
    /// Returns an error if the config is invalid, any tensor shape disagrees with
    /// it, or the tensors do not share one dtype.
    pub fn from_tensors(
        mut config: PatchEncoderConfig,
        weight: Tensor,
        bias: Tensor,
        table: Tensor,
    ) -> Result<Self> {
        config
            .validate()
            .map_err(|e| candle_core::Error::Msg(e.to_string()))?;

        let (out_dim, in_dim) = weight.dims2()?;
        if out_dim != config.projection_dim || in_dim == 0 {
            candle_core::bail!(
                "projection weight shape ({out_dim}, {in_dim}) does not match projection_dim {}",
                config.projection_dim
            );
        }
        if bias.dims() != [config.projection_dim] {
            candle_core::bail!(
                "projection bias shape {:?} does not match projection_dim {}",
                bias.dims(),
                config.projection_dim
            );
        }
        if table.dims() != [config.num_patches, config.projection_dim] {
            candle_core::bail!(
                "position table shape {:?} does not match ({}, {})",
                table.dims(),
                config.num_patches,
                config.projection_dim
            );
        }

        let dtype = table.dtype();
        if weight.dtype() != dtype || bias.dtype() != dtype {
            candle_core::bail!(
                "parameter dtypes differ: weight {:?}, bias {:?}, table {dtype:?}",
                weight.dtype(),
                bias.dtype()
            );
        }
        config.dtype = dtype_name(dtype).to_string();

        Ok(Self {
            projection: Linear::new(weight, Some(bias)),
            position: Embedding::new(table, config.projection_dim),
            in_dim,
            config,
        })
    }

    /// Encode a patch batch.
    ///
    /// # Arguments
    /// * `patches` - Flattened patches of shape (batch, num_patches, in_dim)
    ///
    /// # Returns
    /// Embeddings of shape (batch, num_patches, projection_dim)
    ///
    /// # Errors
    /// Returns an error if the input is not rank 3 or its patch count or patch
    /// width differs from the configured one.
    pub fn encode(&self, patches: &Tensor) -> Result<Tensor> {
        let (_, n, width) = patches.dims3()?;
        if width != self.in_dim {
            candle_core::bail!(
                "patch width mismatch: expected {}, got {width} (input shape {:?})",
                self.in_dim,
                patches.dims()
            );
        }
        if n != self.config.num_patches {
            candle_core::bail!(
                "patch count mismatch: expected {}, got {n} (input shape {:?})",
                self.config.num_patches,
                patches.dims()
            );
        }

        let pos_emb = self.position.forward(&self.positions()?)?;
        let projected = self.projection.forward(patches)?;
        projected.broadcast_add(&pos_emb)
    }

    /// Position ids `0..num_patches`, in order.
    fn positions(&self) -> Result<Tensor> {
        let n = u32::try_from(self.config.num_patches)
            .map_err(|_| candle_core::Error::Msg("num_patches exceeds u32".to_string()))?;
        Tensor::arange(0u32, n, self.position.embeddings().device())
    }

    /// Layer configuration, for persistence next to the weights.
    #[must_use]
    pub fn config(&self) -> &PatchEncoderConfig {
        &self.config
    }

    /// Expected innermost input width.
    #[must_use]
    pub fn in_dim(&self) -> usize {
        self.in_dim
    }

    #[must_use]
    pub fn num_patches(&self) -> usize {
        self.config.num_patches
    }

    #[must_use]
    pub fn projection_dim(&self) -> usize {
        self.config.projection_dim
    }

    /// Projection layer (weight shape (projection_dim, in_dim)).
    #[must_use]
    pub fn projection(&self) -> &Linear {
        &self.projection
    }

    /// Position table of shape (num_patches, projection_dim).
    #[must_use]
    pub fn position_table(&self) -> &Tensor {
        self.position.embeddings()
    }

    /// Parameter dtype.
    #[must_use]
    pub fn dtype(&self) -> DType {
        self.position.embeddings().dtype()
    }
}

impl Module for PatchEncoder {
    fn forward(&self, xs: &Tensor) -> Result<Tensor> {
        self.encode(xs)
    }
}
