#![forbid(unsafe_code)]
#![warn(clippy::all, clippy::pedantic)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::module_name_repetitions)]

pub mod model;
pub mod weights;

pub use model::{PatchEncoder, PatchEncoderConfig, VitLiteConfig};
