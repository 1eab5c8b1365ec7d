//! Image-to-patch flattening that produces the patch encoder's input.

use candle_core::{Result, Tensor};

/// Split channels-last images into flattened non-overlapping patches.
///
/// `[B, H, W, C]` -> `[B, (H/ps)*(W/ps), ps*ps*C]`. Patches are ordered row by
/// row; inside a patch values are ordered (row, col, channel), the same layout a
/// `VALID`-padded `extract_patches` produces on NHWC input.
///
/// # Errors
/// Returns an error if the input is not rank 4, `patch_size` is zero, or the
/// image sides are not divisible by `patch_size`.
pub fn extract_patches(images: &Tensor, patch_size: usize) -> Result<Tensor> {
    let (b, h, w, c) = images.dims4()?;
    if patch_size == 0 {
        candle_core::bail!("patch_size must be positive");
    }
    if !h.is_multiple_of(patch_size) || !w.is_multiple_of(patch_size) {
        candle_core::bail!("image size {h}x{w} is not divisible by patch_size {patch_size}");
    }
    let py = h / patch_size;
    let px = w / patch_size;
    let ps = patch_size;

    // [B, py*ps, px*ps, C] -> [B, py, ps, px, ps, C]
    let x = images.reshape((b, py, ps, px, ps, c))?;
    // -> [B, py, px, ps, ps, C]
    let x = x.permute((0, 1, 3, 2, 4, 5))?;
    x.reshape((b, py * px, ps * ps * c))
}
