use std::collections::HashMap;
use std::path::Path;

use anyhow::{Context, Result};
use candle_core::{Device, Tensor};
use candle_nn::VarBuilder;
use safetensors::SafeTensors;

use crate::model::registry::{self, Layer, LayerRecord, LayerRegistry, PATCH_ENCODER_CLASS};
use crate::model::{PatchEncoder, dtype_from_name};

/// Layer record file inside a saved layer directory.
pub const CONFIG_FILE: &str = "config.json";
/// Parameter file inside a saved layer directory.
pub const WEIGHTS_FILE: &str = "model.safetensors";

/// Tensor whose second dimension gives the layer's input width.
const PROJECTION_WEIGHT: &str = "projection.weight";

/// Save a patch encoder as `config.json` + `model.safetensors` under `dir`.
///
/// # Errors
/// Returns an error if the directory or either file cannot be written.
pub fn save_patch_encoder(encoder: &PatchEncoder, dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;

    let record = LayerRecord::of(encoder).context("serialize layer record")?;
    let config_path = dir.join(CONFIG_FILE);
    let raw = serde_json::to_string_pretty(&record).context("serialize layer record")?;
    std::fs::write(&config_path, raw)
        .with_context(|| format!("write {}", config_path.display()))?;

    let mut tensors: HashMap<String, Tensor> = HashMap::new();
    tensors.insert(
        PROJECTION_WEIGHT.to_string(),
        encoder.projection().weight().clone(),
    );
    if let Some(bias) = encoder.projection().bias() {
        tensors.insert("projection.bias".to_string(), bias.clone());
    }
    tensors.insert(
        "position.weight".to_string(),
        encoder.position_table().clone(),
    );

    let weights_path = dir.join(WEIGHTS_FILE);
    candle_core::safetensors::save(&tensors, &weights_path)
        .with_context(|| format!("write {}", weights_path.display()))?;

    tracing::info!(
        dir = %dir.display(),
        num_patches = encoder.num_patches(),
        projection_dim = encoder.projection_dim(),
        in_dim = encoder.in_dim(),
        "saved patch encoder"
    );
    Ok(())
}

/// Read the layer record from `dir/config.json`.
///
/// # Errors
/// Returns an error if the file is missing or is not a valid layer record.
pub fn read_layer_record(dir: &Path) -> Result<LayerRecord> {
    let config_path = dir.join(CONFIG_FILE);
    let raw = std::fs::read_to_string(&config_path)
        .with_context(|| format!("read config {}", config_path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("parse {}", config_path.display()))
}

/// Load a patch encoder saved by [`save_patch_encoder`].
///
/// Parameters are loaded on `device` in the dtype recorded in the config. The
/// projection input width is taken from the stored `projection.weight` shape.
///
/// # Errors
/// Returns an error if the config is missing, names another class, lacks a
/// required key, records an unknown dtype, or if any parameter tensor is missing
/// or has the wrong shape.
pub fn load_patch_encoder(dir: &Path, device: &Device) -> Result<PatchEncoder> {
    let record = read_layer_record(dir)?;
    anyhow::ensure!(
        record.class_name == PATCH_ENCODER_CLASS,
        "{} describes a {:?} layer, expected {PATCH_ENCODER_CLASS:?}",
        dir.join(CONFIG_FILE).display(),
        record.class_name
    );
    let config = registry::patch_encoder_config(&record.config)?;
    config
        .validate()
        .map_err(anyhow::Error::msg)
        .context("invalid PatchEncoderConfig")?;
    let dtype = config
        .param_dtype()
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid dtype {:?}", config.dtype))?;

    let (data, in_dim) = read_weights(dir)?;
    let vb = VarBuilder::from_buffered_safetensors(data, dtype, device)?;
    let encoder = PatchEncoder::new(config, in_dim, vb).context("build PatchEncoder")?;

    tracing::info!(
        dir = %dir.display(),
        num_patches = encoder.num_patches(),
        projection_dim = encoder.projection_dim(),
        in_dim,
        dtype = ?dtype,
        "loaded patch encoder"
    );
    Ok(encoder)
}

/// Load any layer whose class is registered in `registry`.
///
/// The factory's input width is read from the stored `projection.weight`
/// tensor, so only layers saved with that tensor can be loaded this way.
/// Parameters use the record's `dtype` field (`float32` when absent).
///
/// # Errors
/// Returns an error if the files cannot be read, `projection.weight` is
/// missing, the dtype is unknown, the class is unknown, or the factory rejects
/// the config or parameters.
pub fn load_layer(
    dir: &Path,
    registry: &LayerRegistry,
    device: &Device,
) -> Result<Box<dyn Layer>> {
    let record = read_layer_record(dir)?;
    let dtype_name = record
        .config
        .get("dtype")
        .and_then(serde_json::Value::as_str)
        .unwrap_or("float32");
    let dtype = dtype_from_name(dtype_name)
        .map_err(anyhow::Error::msg)
        .with_context(|| format!("invalid dtype {dtype_name:?} in {}", dir.display()))?;

    let (data, in_dim) = read_weights(dir)?;
    let vb = VarBuilder::from_buffered_safetensors(data, dtype, device)?;
    let layer = registry
        .build(&record, in_dim, vb)
        .with_context(|| format!("rebuild {:?} from {}", record.class_name, dir.display()))?;
    tracing::info!(dir = %dir.display(), class_name = %record.class_name, "loaded layer");
    Ok(layer)
}

/// Read `dir/model.safetensors` and the projection input width it implies.
fn read_weights(dir: &Path) -> Result<(Vec<u8>, usize)> {
    let weights_path = dir.join(WEIGHTS_FILE);
    let data = std::fs::read(&weights_path)
        .with_context(|| format!("read weights {}", weights_path.display()))?;

    let in_dim = {
        let st = SafeTensors::deserialize(&data)
            .with_context(|| format!("parse safetensors {}", weights_path.display()))?;
        let view = st.tensor(PROJECTION_WEIGHT).with_context(|| {
            format!("read tensor {PROJECTION_WEIGHT:?} from {}", weights_path.display())
        })?;
        match view.shape() {
            [_, in_dim] => *in_dim,
            other => anyhow::bail!(
                "expected {PROJECTION_WEIGHT:?} to have 2 dims (out, in), got {other:?}"
            ),
        }
    };
    tracing::debug!(path = %weights_path.display(), in_dim, "read weights");
    Ok((data, in_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use std::time::{SystemTime, UNIX_EPOCH};

    use candle_core::DType;
    use candle_nn::VarMap;

    use crate::model::PatchEncoderConfig;

    fn temp_dir(tag: &str) -> PathBuf {
        let uniq = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("timestamp")
            .as_nanos();
        std::env::temp_dir().join(format!("coral_vit_{tag}_{uniq}"))
    }

    fn random_encoder(num_patches: usize, projection_dim: usize, in_dim: usize) -> PatchEncoder {
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &Device::Cpu);
        PatchEncoder::new(PatchEncoderConfig::new(num_patches, projection_dim), in_dim, vb)
            .unwrap()
    }

    #[test]
    fn save_writes_record_and_weights() {
        let dir = temp_dir("save");
        let enc = random_encoder(4, 3, 5);
        save_patch_encoder(&enc, &dir).unwrap();

        let record = read_layer_record(&dir).unwrap();
        assert_eq!(record.class_name, PATCH_ENCODER_CLASS);
        assert_eq!(record.config["num_patches"], 4);
        assert_eq!(record.config["projection_dim"], 3);

        let data = std::fs::read(dir.join(WEIGHTS_FILE)).unwrap();
        let st = SafeTensors::deserialize(&data).unwrap();
        assert_eq!(st.tensor("projection.weight").unwrap().shape(), &[3, 5]);
        assert_eq!(st.tensor("projection.bias").unwrap().shape(), &[3]);
        assert_eq!(st.tensor("position.weight").unwrap().shape(), &[4, 3]);

        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn missing_config_names_the_file() {
        let dir = temp_dir("missing");
        let err = load_patch_encoder(&dir, &Device::Cpu).err().unwrap();
        assert!(
            err.chain().any(|e| e.to_string().contains(CONFIG_FILE)),
            "unexpected error chain: {err:?}"
        );
    }

    #[test]
    fn load_layer_requires_projection_weight() {
        let dir = temp_dir("no_projection");
        let enc = random_encoder(4, 3, 5);
        save_patch_encoder(&enc, &dir).unwrap();

        let mut tensors = HashMap::new();
        tensors.insert("position.weight".to_string(), enc.position_table().clone());
        candle_core::safetensors::save(&tensors, dir.join(WEIGHTS_FILE)).unwrap();

        let err = load_layer(&dir, &LayerRegistry::with_defaults(), &Device::Cpu)
            .err()
            .unwrap();
        assert!(
            err.chain().any(|e| e.to_string().contains(PROJECTION_WEIGHT)),
            "unexpected error chain: {err:?}"
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn unknown_recorded_dtype_is_rejected() {
        let dir = temp_dir("dtype");
        let enc = random_encoder(4, 3, 5);
        save_patch_encoder(&enc, &dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"{"class_name": "PatchEncoder", "config": {"dtype": "int8", "num_patches": 4, "projection_dim": 3}}"#,
        )
        .unwrap();

        let err = load_patch_encoder(&dir, &Device::Cpu).err().unwrap();
        assert!(
            err.chain().any(|e| e.to_string().contains("int8")),
            "unexpected error chain: {err:?}"
        );
        let err = load_layer(&dir, &LayerRegistry::with_defaults(), &Device::Cpu)
            .err()
            .unwrap();
        assert!(
            err.chain().any(|e| e.to_string().contains("int8")),
            "unexpected error chain: {err:?}"
        );
        std::fs::remove_dir_all(&dir).ok();
    }

    #[test]
    fn wrong_class_is_rejected() {
        let dir = temp_dir("class");
        let enc = random_encoder(4, 3, 5);
        save_patch_encoder(&enc, &dir).unwrap();
        std::fs::write(
            dir.join(CONFIG_FILE),
            r#"{"class_name": "Patches", "config": {"patch_size": 16}}"#,
        )
        .unwrap();

        let err = load_patch_encoder(&dir, &Device::Cpu).err().unwrap();
        assert!(err.to_string().contains("Patches"), "{err:?}");
        std::fs::remove_dir_all(&dir).ok();
    }
}
