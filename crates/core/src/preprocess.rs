//! Admission checks and normalization applied before inference.

use image::imageops::FilterType;
use image::{DynamicImage, RgbImage};
use tracing::debug;

use crate::config::LimitsConfig;
use crate::error::UpscaleError;

/// Image handed to the network, plus what it looked like on arrival.
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub image: RgbImage,
    pub original_dimensions: (u32, u32),
    /// `true` when the input was shrunk to fit `inference_max_dimension`.
    pub downscaled: bool,
}

/// Reject inputs with either side above `max_input_dimension`.
pub fn check_input_size(
    (width, height): (u32, u32),
    limits: &LimitsConfig,
) -> Result<(), UpscaleError> {
    let max = limits.max_input_dimension;
    if width > max || height > max {
        return Err(UpscaleError::Validation(format!(
            "Image too large. Maximum size is {max}x{max}, got {width}x{height}"
        )));
    }
    Ok(())
}

/// Dimensions after shrinking so the longer side equals `target`, keeping
/// aspect ratio. Inputs already within `target` are returned unchanged.
pub fn fit_within((width, height): (u32, u32), target: u32) -> (u32, u32) {
    let longest = width.max(height);
    if longest <= target {
        return (width, height);
    }
    let shrink = |side: u32| {
        let scaled = (u64::from(side) * u64::from(target) + u64::from(longest) / 2)
            / u64::from(longest);
        (scaled as u32).max(1)
    };
    if width >= height {
        (target, shrink(height))
    } else {
        (shrink(width), target)
    }
}

/// Validate `image` against `limits` and convert it to 8-bit RGB, shrinking it
/// with Lanczos3 when it exceeds the inference bound. Alpha is dropped.
pub fn prepare(image: DynamicImage, limits: &LimitsConfig) -> Result<PreparedImage, UpscaleError> {
    let original_dimensions = (image.width(), image.height());
    check_input_size(original_dimensions, limits)?;

    let target = fit_within(original_dimensions, limits.inference_max_dimension);
    let downscaled = target != original_dimensions;
    let image = if downscaled {
        debug!(
            from = ?original_dimensions,
            to = ?target,
            "Downscaling input before inference"
        );
        image.resize_exact(target.0, target.1, FilterType::Lanczos3)
    } else {
        image
    };

    Ok(PreparedImage {
        image: image.to_rgb8(),
        original_dimensions,
        downscaled,
    })
}
