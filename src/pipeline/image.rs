//! Image loading and pixel preprocessing.
//!
//! Images are opened from disk, converted to 8-bit RGB, resized to the
//! processor's fixed input size, rescaled and normalised, and laid out
//! channel-first (`[3, H, W]`) as `f32`.

use crate::error::{SampleError, TuneError};
use image::{imageops::FilterType, Rgb, RgbImage};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Side length of the placeholder image used when a whole batch fails.
pub const PLACEHOLDER_SIZE: u32 = 224;

/// Pixel preprocessing parameters, read from `preprocessor_config.json`.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageProcessorConfig {
    pub width: u32,
    pub height: u32,
    pub do_resize: bool,
    pub do_rescale: bool,
    pub rescale_factor: f32,
    pub do_normalize: bool,
    pub image_mean: [f32; 3],
    pub image_std: [f32; 3],
}

impl Default for ImageProcessorConfig {
    /// SigLIP defaults as shipped with Gemma 3 vision checkpoints.
    fn default() -> Self {
        Self {
            width: 896,
            height: 896,
            do_resize: true,
            do_rescale: true,
            rescale_factor: 1.0 / 255.0,
            do_normalize: true,
            image_mean: [0.5, 0.5, 0.5],
            image_std: [0.5, 0.5, 0.5],
        }
    }
}

#[derive(Deserialize)]
struct RawSize {
    height: Option<u32>,
    width: Option<u32>,
    shortest_edge: Option<u32>,
}

#[derive(Deserialize)]
struct RawPreprocessorConfig {
    size: Option<RawSize>,
    do_resize: Option<bool>,
    do_rescale: Option<bool>,
    rescale_factor: Option<f32>,
    do_normalize: Option<bool>,
    image_mean: Option<Vec<f32>>,
    image_std: Option<Vec<f32>>,
}

fn triple(values: Option<Vec<f32>>, fallback: [f32; 3]) -> [f32; 3] {
    match values.as_deref() {
        Some([a, b, c]) => [*a, *b, *c],
        Some([v]) => [*v, *v, *v],
        _ => fallback,
    }
}

impl ImageProcessorConfig {
    /// Parse a `preprocessor_config.json` body. Absent keys keep defaults.
    pub fn from_json_str(text: &str) -> Result<Self, serde_json::Error> {
        let raw: RawPreprocessorConfig = serde_json::from_str(text)?;
        let d = Self::default();
        let (width, height) = match raw.size {
            Some(RawSize {
                height: Some(h),
                width: Some(w),
                ..
            }) => (w, h),
            Some(RawSize {
                shortest_edge: Some(e),
                ..
            }) => (e, e),
            _ => (d.width, d.height),
        };
        Ok(Self {
            width,
            height,
            do_resize: raw.do_resize.unwrap_or(d.do_resize),
            do_rescale: raw.do_rescale.unwrap_or(d.do_rescale),
            rescale_factor: raw.rescale_factor.unwrap_or(d.rescale_factor),
            do_normalize: raw.do_normalize.unwrap_or(d.do_normalize),
            image_mean: triple(raw.image_mean, d.image_mean),
            image_std: triple(raw.image_std, d.image_std),
        })
    }

    /// Whether `img` comes out of [`Self::preprocess`] at [`Self::output_shape`].
    pub fn accepts(&self, img: &RgbImage) -> bool {
        self.do_resize || img.dimensions() == (self.width, self.height)
    }

    /// Convert an RGB image to a channel-first `f32` tensor of
    /// `3 * height * width` values.
    ///
    /// With resizing disabled the image must already be the input size.
    pub fn preprocess(&self, img: &RgbImage) -> Result<Vec<f32>, TuneError> {
        if !self.accepts(img) {
            let (w, h) = img.dimensions();
            return Err(TuneError::ImageProcessing(format!(
                "{w}x{h} image with resizing disabled, expected {}x{}",
                self.width, self.height
            )));
        }
        let resized;
        let img = if img.dimensions() != (self.width, self.height) {
            resized = image::imageops::resize(img, self.width, self.height, FilterType::Triangle);
            &resized
        } else {
            img
        };

        let (w, h) = img.dimensions();
        let plane = (w * h) as usize;
        let mut out = vec![0f32; 3 * plane];
        for (x, y, Rgb(px)) in img.enumerate_pixels() {
            let offset = (y * w + x) as usize;
            for c in 0..3 {
                let mut v = px[c] as f32;
                if self.do_rescale {
                    v *= self.rescale_factor;
                }
                if self.do_normalize {
                    v = (v - self.image_mean[c]) / self.image_std[c];
                }
                out[c * plane + offset] = v;
            }
        }
        Ok(out)
    }

    /// Shape of one preprocessed image, `[3, H, W]`.
    pub fn output_shape(&self) -> [usize; 3] {
        [3, self.height as usize, self.width as usize]
    }
}

/// Resolve a dataset image reference against the image folder.
///
/// Absolute paths are returned unchanged.
pub fn resolve_image_path(image: &str, image_folder: &Path) -> PathBuf {
    let path = Path::new(image);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        image_folder.join(path)
    }
}

/// Open an image and convert it to 8-bit RGB.
///
/// `index` is the sample's position in its batch, carried into the error.
pub fn load_rgb(path: &Path, index: usize) -> Result<RgbImage, SampleError> {
    if !path.exists() {
        return Err(SampleError::ImageNotFound {
            index,
            path: path.to_path_buf(),
        });
    }
    let img = image::open(path).map_err(|e| SampleError::ImageUnreadable {
        index,
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;
    debug!(
        "Loaded {} ({}x{})",
        path.display(),
        img.width(),
        img.height()
    );
    Ok(img.to_rgb8())
}

/// The black square substituted when every image in a batch failed.
pub fn placeholder_image() -> RgbImage {
    RgbImage::new(PLACEHOLDER_SIZE, PLACEHOLDER_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relative_paths_join_image_folder() {
        let folder = Path::new("/data/ecg_images");
        assert_eq!(
            resolve_image_path("ptb-xl/1.png", folder),
            PathBuf::from("/data/ecg_images/ptb-xl/1.png")
        );
        assert_eq!(
            resolve_image_path("/abs/2.png", folder),
            PathBuf::from("/abs/2.png")
        );
    }

    #[test]
    fn missing_file_is_not_found() {
        let err = load_rgb(Path::new("/nonexistent/ecg.png"), 4).unwrap_err();
        assert!(matches!(err, SampleError::ImageNotFound { index: 4, .. }));
    }

    #[test]
    fn garbage_file_is_unreadable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bad.png");
        std::fs::write(&path, b"not an image").unwrap();
        let err = load_rgb(&path, 0).unwrap_err();
        assert!(matches!(err, SampleError::ImageUnreadable { .. }));
    }

    #[test]
    fn grayscale_png_loads_as_rgb() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("g.png");
        image::GrayImage::from_pixel(4, 3, image::Luma([200])).save(&path).unwrap();
        let img = load_rgb(&path, 0).unwrap();
        assert_eq!(img.dimensions(), (4, 3));
        assert_eq!(img.get_pixel(0, 0), &Rgb([200, 200, 200]));
    }

    #[test]
    fn preprocess_normalises_channel_first() {
        let cfg = ImageProcessorConfig {
            width: 2,
            height: 2,
            ..Default::default()
        };
        let img = RgbImage::from_pixel(2, 2, Rgb([255, 0, 255]));
        let out = cfg.preprocess(&img).unwrap();
        assert_eq!(out.len(), 12);
        // R plane → (1.0 - 0.5) / 0.5
        assert!(out[..4].iter().all(|v| (*v - 1.0).abs() < 1e-6));
        // G plane → (0.0 - 0.5) / 0.5
        assert!(out[4..8].iter().all(|v| (*v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn preprocess_resizes() {
        let cfg = ImageProcessorConfig {
            width: 8,
            height: 4,
            ..Default::default()
        };
        let out = cfg.preprocess(&placeholder_image()).unwrap();
        assert_eq!(out.len(), 3 * 8 * 4);
        assert!(out.iter().all(|v| (*v + 1.0).abs() < 1e-6));
    }

    #[test]
    fn resize_disabled_rejects_other_sizes() {
        let cfg = ImageProcessorConfig {
            width: 4,
            height: 4,
            do_resize: false,
            ..Default::default()
        };
        let odd = RgbImage::new(2, 3);
        assert!(!cfg.accepts(&odd));
        assert!(matches!(cfg.preprocess(&odd), Err(TuneError::ImageProcessing(_))));

        let exact = RgbImage::new(4, 4);
        assert!(cfg.accepts(&exact));
        assert_eq!(cfg.preprocess(&exact).unwrap().len(), 3 * 4 * 4);
    }

    #[test]
    fn preprocessor_json_parses_size_and_stats() {
        let cfg = ImageProcessorConfig::from_json_str(
            r#"{"size": {"height": 448, "width": 448}, "image_mean": [0.48, 0.45, 0.4],
                "image_std": [0.26], "rescale_factor": 0.00392156862745098}"#,
        )
        .unwrap();
        assert_eq!((cfg.width, cfg.height), (448, 448));
        assert_eq!(cfg.image_mean, [0.48, 0.45, 0.4]);
        assert_eq!(cfg.image_std, [0.26, 0.26, 0.26]);
    }

    #[test]
    fn placeholder_is_black_224() {
        let img = placeholder_image();
        assert_eq!(img.dimensions(), (224, 224));
        assert!(img.pixels().all(|p| p.0 == [0, 0, 0]));
    }
}
