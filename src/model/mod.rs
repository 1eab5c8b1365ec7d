pub mod config;
pub mod patch_encoder;
pub mod patches;
pub mod registry;

// Re-exports for convenience
pub use config::{PatchEncoderConfig, VitLiteConfig, dtype_from_name, dtype_name};
pub use patch_encoder::PatchEncoder;
pub use patches::extract_patches;
pub use registry::{Layer, LayerFactory, LayerRecord, LayerRegistry, PATCH_ENCODER_CLASS};
