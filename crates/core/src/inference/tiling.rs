//! Tensor layout conversion and tile-by-tile execution.
//!
//! Large inputs are cut into `tile_size` squares. Each tile is fed to the
//! network with `tile_pad` pixels of context on every side, and only the
//! central region of the result is stitched into the output.

use anyhow::{bail, Context, Result};
use half::f16;
use half::slice::HalfFloatSliceExt;
use image::RgbImage;
use ndarray::{s, Array4, ArrayD, IxDyn};
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TilePlan {
    /// 0 disables tiling.
    pub tile_size: usize,
    pub tile_pad: usize,
    pub pad_align: usize,
    pub scale: usize,
}

/// Interleaved RGB u8 → NCHW `[1,3,H,W]` mapped into `range`.
pub fn rgb_to_nchw(image: &RgbImage, range: (f32, f32)) -> Array4<f32> {
    let (w, h) = (image.width() as usize, image.height() as usize);
    let (lo, hi) = range;
    let factor = (hi - lo) / 255.0;
    let mut arr = Array4::<f32>::zeros((1, 3, h, w));
    for (x, y, pixel) in image.enumerate_pixels() {
        for c in 0..3 {
            arr[[0, c, y as usize, x as usize]] = lo + pixel[c] as f32 * factor;
        }
    }
    arr
}

/// NCHW `[1,3,H,W]` in `range` → RGB u8, rounding and clamping to 0–255.
pub fn nchw_to_rgb(arr: &Array4<f32>, range: (f32, f32)) -> Result<RgbImage> {
    let (channels, h, w) = (arr.shape()[1], arr.shape()[2], arr.shape()[3]);
    if channels != 3 {
        bail!("expected 3 output channels, got {channels}");
    }
    let (lo, hi) = range;
    let factor = 255.0 / (hi - lo);
    let hw = h * w;

    let contiguous = arr.as_standard_layout();
    let slice = contiguous
        .as_slice()
        .context("output tensor is not contiguous")?;

    let mut rgb = vec![0u8; hw * 3];
    for i in 0..hw {
        for c in 0..3 {
            rgb[i * 3 + c] = ((slice[c * hw + i] - lo) * factor).round().clamp(0.0, 255.0) as u8;
        }
    }
    RgbImage::from_raw(w as u32, h as u32, rgb).context("output buffer does not match dimensions")
}

pub fn pad_amount(dim: usize, align: usize) -> usize {
    if align <= 1 {
        return 0;
    }
    (align - (dim % align)) % align
}

/// Reflection-pad so H and W are multiples of `align`.
pub fn pad_nchw(arr: &Array4<f32>, align: usize) -> Array4<f32> {
    let (h, w) = (arr.shape()[2], arr.shape()[3]);
    let pad_h = pad_amount(h, align);
    let pad_w = pad_amount(w, align);

    if pad_h == 0 && pad_w == 0 {
        return arr.clone();
    }

    let new_h = h + pad_h;
    let new_w = w + pad_w;
    let mut padded = Array4::<f32>::zeros((1, 3, new_h, new_w));
    padded.slice_mut(s![.., .., ..h, ..w]).assign(arr);

    // Rows past the edge mirror back inward; images narrower than the pad
    // repeat their first row/column.
    let mirror = |i: usize, len: usize| (len - 1).saturating_sub(i - len);

    for y in h..new_h {
        let src_y = mirror(y, h);
        for c in 0..3 {
            for x in 0..w {
                padded[[0, c, y, x]] = arr[[0, c, src_y, x]];
            }
        }
    }
    for x in w..new_w {
        let src_x = mirror(x, w);
        for c in 0..3 {
            for y in 0..new_h {
                padded[[0, c, y, x]] = padded[[0, c, y, src_x]];
            }
        }
    }

    padded
}

/// Run `run_tile` over `input` tile by tile and stitch a `scale`× output.
///
/// `run_tile` receives an aligned tile and must return at least `scale`× its
/// unpadded extent; the alignment padding is cropped away here.
pub fn run_tiled<F>(input: &Array4<f32>, plan: TilePlan, mut run_tile: F) -> Result<Array4<f32>>
where
    F: FnMut(Array4<f32>) -> Result<ArrayD<f32>>,
{
    let (h, w) = (input.shape()[2], input.shape()[3]);
    let scale = plan.scale;
    let mut output = Array4::<f32>::zeros((1, 3, h * scale, w * scale));

    let tile = if plan.tile_size == 0 {
        h.max(w).max(1)
    } else {
        plan.tile_size
    };
    let pad = plan.tile_pad;

    debug!(
        tile_size = tile,
        tile_pad = pad,
        height = h,
        width = w,
        tiles = h.div_ceil(tile) * w.div_ceil(tile),
        "Starting tiled inference"
    );

    let mut y = 0usize;
    while y < h {
        let y1 = (y + tile).min(h);
        let mut x = 0usize;
        while x < w {
            let x1 = (x + tile).min(w);

            let in_y0 = y.saturating_sub(pad);
            let in_x0 = x.saturating_sub(pad);
            let in_y1 = (y1 + pad).min(h);
            let in_x1 = (x1 + pad).min(w);
            let tile_h = in_y1 - in_y0;
            let tile_w = in_x1 - in_x0;

            let raw = input
                .slice(s![.., .., in_y0..in_y1, in_x0..in_x1])
                .to_owned();
            let result = run_tile(pad_nchw(&raw, plan.pad_align))
                .with_context(|| format!("tile at x={x} y={y} ({tile_w}x{tile_h})"))?;

            let shape = result.shape();
            if shape.len() != 4
                || shape[1] != 3
                || shape[2] < tile_h * scale
                || shape[3] < tile_w * scale
            {
                bail!(
                    "model output shape {:?} does not cover a {}x{} tile at x{}",
                    shape,
                    tile_w,
                    tile_h,
                    scale
                );
            }

            let crop_y0 = (y - in_y0) * scale;
            let crop_x0 = (x - in_x0) * scale;
            let out_h = (y1 - y) * scale;
            let out_w = (x1 - x) * scale;

            output
                .slice_mut(s![.., .., y * scale..y1 * scale, x * scale..x1 * scale])
                .assign(&result.slice(s![
                    ..,
                    ..,
                    crop_y0..crop_y0 + out_h,
                    crop_x0..crop_x0 + out_w
                ]));

            x = x1;
        }
        y = y1;
    }

    Ok(output)
}

pub fn f32_to_f16(input: &Array4<f32>) -> Result<ArrayD<f16>> {
    let contiguous = input.as_standard_layout();
    let f32_slice = contiguous
        .as_slice()
        .context("input tensor is not contiguous")?;
    let mut fp16_data = vec![f16::ZERO; f32_slice.len()];
    fp16_data.convert_from_f32_slice(f32_slice);
    Ok(ArrayD::from_shape_vec(IxDyn(input.shape()), fp16_data)?)
}

pub fn f16_to_f32(input: &ArrayD<f16>) -> Result<ArrayD<f32>> {
    let contiguous = input.as_standard_layout();
    let fp16_slice = contiguous
        .as_slice()
        .context("fp16 output tensor is not contiguous")?;
    let mut f32_data = vec![0.0f32; fp16_slice.len()];
    fp16_slice.convert_to_f32_slice(&mut f32_data);
    Ok(ArrayD::from_shape_vec(IxDyn(input.shape()), f32_data)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    /// Nearest-neighbour upscale standing in for the network.
    fn nearest(tile: Array4<f32>, scale: usize) -> Result<ArrayD<f32>> {
        let (h, w) = (tile.shape()[2], tile.shape()[3]);
        let mut out = Array4::<f32>::zeros((1, 3, h * scale, w * scale));
        for c in 0..3 {
            for y in 0..h * scale {
                for x in 0..w * scale {
                    out[[0, c, y, x]] = tile[[0, c, y / scale, x / scale]];
                }
            }
        }
        Ok(out.into_dyn())
    }

    fn gradient(w: u32, h: u32) -> RgbImage {
        RgbImage::from_fn(w, h, |x, y| {
            Rgb([(x * 7 % 256) as u8, (y * 11 % 256) as u8, ((x + y) % 256) as u8])
        })
    }

    #[test]
    fn test_rgb_to_nchw_maps_into_range() {
        let image = RgbImage::from_pixel(2, 1, Rgb([255, 0, 51]));
        let full = rgb_to_nchw(&image, (0.0, 255.0));
        assert_eq!(full.shape(), &[1, 3, 1, 2]);
        assert_eq!(full[[0, 0, 0, 0]], 255.0);
        assert_eq!(full[[0, 2, 0, 1]], 51.0);

        let unit = rgb_to_nchw(&image, (0.0, 1.0));
        assert!((unit[[0, 0, 0, 0]] - 1.0).abs() < 1e-6);
        assert!((unit[[0, 2, 0, 1]] - 0.2).abs() < 1e-6);
    }

    #[test]
    fn test_nchw_to_rgb_rounds_and_clamps() {
        let mut arr = Array4::<f32>::zeros((1, 3, 1, 1));
        arr[[0, 0, 0, 0]] = 300.0;
        arr[[0, 1, 0, 0]] = -10.0;
        arr[[0, 2, 0, 0]] = 128.6;

        let image = nchw_to_rgb(&arr, (0.0, 255.0)).unwrap();
        assert_eq!(image.get_pixel(0, 0), &Rgb([255, 0, 129]));
    }

    #[test]
    fn test_conversion_is_lossless_for_both_ranges() {
        let image = gradient(5, 3);
        for range in [(0.0, 255.0), (0.0, 1.0)] {
            let restored = nchw_to_rgb(&rgb_to_nchw(&image, range), range).unwrap();
            assert_eq!(restored, image);
        }
    }

    #[test]
    fn test_pad_amount() {
        assert_eq!(pad_amount(4, 4), 0);
        assert_eq!(pad_amount(5, 4), 3);
        assert_eq!(pad_amount(7, 4), 1);
        assert_eq!(pad_amount(7, 1), 0);
        assert_eq!(pad_amount(7, 0), 0);
    }

    #[test]
    fn test_pad_nchw_reflects_edges() {
        let mut arr = Array4::<f32>::zeros((1, 3, 5, 6));
        for y in 0..5 {
            for x in 0..6 {
                arr[[0, 0, y, x]] = (y * 10 + x) as f32;
            }
        }
        let padded = pad_nchw(&arr, 4);
        assert_eq!(padded.shape(), &[1, 3, 8, 8]);
        assert_eq!(padded[[0, 0, 5, 0]], arr[[0, 0, 4, 0]]);
        assert_eq!(padded[[0, 0, 6, 0]], arr[[0, 0, 3, 0]]);
        assert_eq!(padded[[0, 0, 7, 0]], arr[[0, 0, 2, 0]]);
        assert_eq!(padded[[0, 0, 0, 6]], arr[[0, 0, 0, 5]]);
        assert_eq!(padded[[0, 0, 0, 7]], arr[[0, 0, 0, 4]]);
    }

    #[test]
    fn test_pad_nchw_single_pixel() {
        let arr = Array4::<f32>::from_elem((1, 3, 1, 1), 7.0);
        let padded = pad_nchw(&arr, 4);
        assert_eq!(padded.shape(), &[1, 3, 4, 4]);
        assert!(padded.iter().all(|&v| v == 7.0));
    }

    #[test]
    fn test_tiled_matches_single_pass() {
        let input = rgb_to_nchw(&gradient(37, 23), (0.0, 255.0));
        let whole = run_tiled(
            &input,
            TilePlan { tile_size: 0, tile_pad: 0, pad_align: 4, scale: 4 },
            |t| nearest(t, 4),
        )
        .unwrap();

        let mut calls = 0;
        let tiled = run_tiled(
            &input,
            TilePlan { tile_size: 16, tile_pad: 3, pad_align: 4, scale: 4 },
            |t| {
                calls += 1;
                nearest(t, 4)
            },
        )
        .unwrap();

        assert_eq!(calls, 3 * 2);
        assert_eq!(tiled.shape(), &[1, 3, 23 * 4, 37 * 4]);
        assert_eq!(tiled, whole);
    }

    #[test]
    fn test_tiled_rejects_short_output() {
        let input = Array4::<f32>::zeros((1, 3, 8, 8));
        let err = run_tiled(
            &input,
            TilePlan { tile_size: 0, tile_pad: 0, pad_align: 1, scale: 4 },
            |t| nearest(t, 2),
        )
        .unwrap_err();
        assert!(err.to_string().contains("does not cover"), "got: {err}");
    }

    #[test]
    fn test_f16_roundtrip_preserves_pixel_values() {
        let input = rgb_to_nchw(&gradient(4, 4), (0.0, 1.0));
        let back = f16_to_f32(&f32_to_f16(&input).unwrap()).unwrap();
        let back = back.into_dimensionality::<ndarray::Ix4>().unwrap();
        assert_eq!(
            nchw_to_rgb(&back, (0.0, 1.0)).unwrap(),
            nchw_to_rgb(&input, (0.0, 1.0)).unwrap()
        );
    }
}
