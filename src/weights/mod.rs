//! Saving and restoring layer configs and parameters.

pub mod loader;

pub use loader::{CONFIG_FILE, WEIGHTS_FILE, load_layer, load_patch_encoder, save_patch_encoder};
