//! Image decoding and the train/eval transforms.
//!
//! Geometry (resize, crop, flip) runs on the decoded `RgbImage`; colour jitter
//! and normalisation run on CHW float planes.

use std::path::Path;

use image::imageops::{self, FilterType};
use image::RgbImage;
use rand::Rng;
use rand::seq::SliceRandom;

use crate::config::{IMAGE_MEAN, IMAGE_STD, VitConfig};
use crate::error::{Error, Result};

/// A preprocessed CHW image, `3 * size * size` normalised values.
#[derive(Debug, Clone, PartialEq)]
pub struct ImageTensor {
    data: Vec<f32>,
    size: usize,
}

impl ImageTensor {
    /// Side length in pixels.
    pub fn size(&self) -> usize {
        self.size
    }

    pub fn data(&self) -> &[f32] {
        &self.data
    }

    pub fn into_inner(self) -> Vec<f32> {
        self.data
    }
}

impl AsRef<[f32]> for ImageTensor {
    fn as_ref(&self) -> &[f32] {
        &self.data
    }
}

/// Decode any supported file into 8-bit RGB.
pub fn load_rgb(path: &Path) -> Result<RgbImage> {
    if !path.is_file() {
        return Err(Error::ImageNotFound(path.to_path_buf()));
    }
    let decoded = image::open(path).map_err(|source| Error::Image {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(decoded.to_rgb8())
}

/// Resize so the shorter edge becomes `target`, keeping the aspect ratio.
fn resize_shorter_side(img: &RgbImage, target: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let (new_w, new_h) = if w <= h {
        (target, ((target as u64 * h as u64) / w as u64) as u32)
    } else {
        (((target as u64 * w as u64) / h as u64) as u32, target)
    };
    imageops::resize(img, new_w.max(1), new_h.max(1), FilterType::Triangle)
}

fn center_crop(img: &RgbImage, size: u32) -> RgbImage {
    let (w, h) = img.dimensions();
    let crop_w = size.min(w);
    let crop_h = size.min(h);
    let left = ((w - crop_w) as f32 / 2.0).round() as u32;
    let top = ((h - crop_h) as f32 / 2.0).round() as u32;
    let cropped = imageops::crop_imm(img, left, top, crop_w, crop_h).to_image();
    if cropped.dimensions() == (size, size) {
        cropped
    } else {
        imageops::resize(&cropped, size, size, FilterType::Triangle)
    }
}

/// Split interleaved RGB bytes into CHW planes scaled to `[0, 1]`.
fn to_planes(img: &RgbImage) -> Vec<f32> {
    let plane = (img.width() * img.height()) as usize;
    let mut out = vec![0.0; 3 * plane];
    for (idx, pixel) in img.pixels().enumerate() {
        for c in 0..3 {
            out[c * plane + idx] = f32::from(pixel[c]) / 255.0;
        }
    }
    out
}

fn normalize(planes: &mut [f32]) {
    let plane = planes.len() / 3;
    for c in 0..3 {
        for v in &mut planes[c * plane..(c + 1) * plane] {
            *v = (*v - IMAGE_MEAN[c]) / IMAGE_STD[c];
        }
    }
}

/// Deterministic eval transform: resize the shorter side, center crop,
/// normalise.
#[derive(Debug, Clone)]
pub struct Preprocessor {
    image_size: u32,
    resize_size: u32,
}

impl Preprocessor {
    pub fn new(config: &VitConfig) -> Self {
        Preprocessor {
            image_size: config.image_size as u32,
            resize_size: config.resize_size(),
        }
    }

    pub fn image_size(&self) -> usize {
        self.image_size as usize
    }

    pub fn load(&self, path: &Path) -> Result<ImageTensor> {
        Ok(self.apply(&load_rgb(path)?))
    }

    pub fn apply(&self, img: &RgbImage) -> ImageTensor {
        let resized = resize_shorter_side(img, self.resize_size);
        let cropped = center_crop(&resized, self.image_size);
        let mut data = to_planes(&cropped);
        normalize(&mut data);
        ImageTensor {
            data,
            size: self.image_size as usize,
        }
    }
}

/// Random training transform: random resized crop, horizontal flip, colour
/// jitter, normalise.
#[derive(Debug, Clone)]
pub struct TrainAugment {
    image_size: u32,
    scale: (f32, f32),
    ratio: (f32, f32),
    flip_p: f64,
    brightness: f32,
    contrast: f32,
    saturation: f32,
}

impl TrainAugment {
    pub fn new(config: &VitConfig) -> Self {
        TrainAugment {
            image_size: config.image_size as u32,
            scale: (0.08, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
            flip_p: 0.5,
            brightness: 0.4,
            contrast: 0.4,
            saturation: 0.4,
        }
    }

    pub fn load<R: Rng + ?Sized>(&self, path: &Path, rng: &mut R) -> Result<ImageTensor> {
        Ok(self.apply(&load_rgb(path)?, rng))
    }

    pub fn apply<R: Rng + ?Sized>(&self, img: &RgbImage, rng: &mut R) -> ImageTensor {
        let (left, top, w, h) = self.crop_box(img.width(), img.height(), rng);
        let region = imageops::crop_imm(img, left, top, w, h).to_image();
        let mut resized =
            imageops::resize(&region, self.image_size, self.image_size, FilterType::Triangle);
        if rng.gen_bool(self.flip_p) {
            imageops::flip_horizontal_in_place(&mut resized);
        }
        let mut data = to_planes(&resized);
        self.jitter(&mut data, rng);
        normalize(&mut data);
        ImageTensor {
            data,
            size: self.image_size as usize,
        }
    }

    /// `(left, top, width, height)` of the region to crop. Up to ten random
    /// boxes are tried before falling back to a ratio-clamped center crop.
    fn crop_box<R: Rng + ?Sized>(&self, width: u32, height: u32, rng: &mut R) -> (u32, u32, u32, u32) {
        let area = (width * height) as f32;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());
        for _ in 0..10 {
            let target = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let w = (target * aspect).sqrt().round() as u32;
            let h = (target / aspect).sqrt().round() as u32;
            if w > 0 && h > 0 && w <= width && h <= height {
                let top = rng.gen_range(0..=height - h);
                let left = rng.gen_range(0..=width - w);
                return (left, top, w, h);
            }
        }
        let in_ratio = width as f32 / height as f32;
        let (w, h) = if in_ratio < self.ratio.0 {
            (width, ((width as f32 / self.ratio.0).round() as u32).min(height))
        } else if in_ratio > self.ratio.1 {
            (((height as f32 * self.ratio.1).round() as u32).min(width), height)
        } else {
            (width, height)
        };
        ((width - w) / 2, (height - h) / 2, w.max(1), h.max(1))
    }

    /// Brightness, contrast and saturation in random order, each with a
    /// factor drawn from `[1 - s, 1 + s]`.
    fn jitter<R: Rng + ?Sized>(&self, planes: &mut [f32], rng: &mut R) {
        let mut order = [0usize, 1, 2];
        order.shuffle(rng);
        for op in order {
            match op {
                0 => {
                    let f = jitter_factor(self.brightness, rng);
                    planes.iter_mut().for_each(|v| *v = (*v * f).clamp(0.0, 1.0));
                }
                1 => {
                    let f = jitter_factor(self.contrast, rng);
                    let plane = planes.len() / 3;
                    let mean = (0..plane)
                        .map(|i| grayscale(planes[i], planes[plane + i], planes[2 * plane + i]))
                        .sum::<f32>()
                        / plane as f32;
                    planes
                        .iter_mut()
                        .for_each(|v| *v = ((*v - mean) * f + mean).clamp(0.0, 1.0));
                }
                _ => {
                    let f = jitter_factor(self.saturation, rng);
                    let plane = planes.len() / 3;
                    for i in 0..plane {
                        let gray = grayscale(planes[i], planes[plane + i], planes[2 * plane + i]);
                        for c in 0..3 {
                            let v = &mut planes[c * plane + i];
                            *v = ((*v - gray) * f + gray).clamp(0.0, 1.0);
                        }
                    }
                }
            }
        }
    }
}

fn jitter_factor<R: Rng + ?Sized>(strength: f32, rng: &mut R) -> f32 {
    if strength <= 0.0 {
        return 1.0;
    }
    rng.gen_range((1.0 - strength).max(0.0)..=1.0 + strength)
}

fn grayscale(r: f32, g: f32, b: f32) -> f32 {
    0.299 * r + 0.587 * g + 0.114 * b
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn small_config() -> VitConfig {
        VitConfig {
            image_size: 32,
            patch_size: 8,
            ..VitConfig::default()
        }
    }

    #[test]
    fn eval_transform_outputs_chw_of_configured_size() {
        let pre = Preprocessor::new(&small_config());
        let img = RgbImage::from_pixel(50, 40, Rgb([10, 200, 30]));
        let tensor = pre.apply(&img);
        assert_eq!(tensor.size(), 32);
        assert_eq!(tensor.data().len(), 3 * 32 * 32);
    }

    #[test]
    fn uniform_colour_normalises_per_channel() {
        let pre = Preprocessor::new(&small_config());
        let img = RgbImage::from_pixel(64, 64, Rgb([255, 0, 128]));
        let tensor = pre.apply(&img);
        let plane = 32 * 32;
        let expected = [
            (1.0 - IMAGE_MEAN[0]) / IMAGE_STD[0],
            (0.0 - IMAGE_MEAN[1]) / IMAGE_STD[1],
            (128.0 / 255.0 - IMAGE_MEAN[2]) / IMAGE_STD[2],
        ];
        for c in 0..3 {
            let values = &tensor.data()[c * plane..(c + 1) * plane];
            assert!(values.iter().all(|v| (v - expected[c]).abs() < 1e-4), "channel {c}");
        }
    }

    #[test]
    fn eval_transform_is_deterministic() {
        let pre = Preprocessor::new(&small_config());
        let img = RgbImage::from_fn(45, 70, |x, y| Rgb([(x * 5) as u8, (y * 3) as u8, 77]));
        assert_eq!(pre.apply(&img), pre.apply(&img));
    }

    #[test]
    fn missing_file_is_reported_as_not_found() {
        let pre = Preprocessor::new(&small_config());
        let err = pre.load(Path::new("/definitely/not/here.jpg"));
        assert!(matches!(err, Err(Error::ImageNotFound(_))));
    }

    #[test]
    fn augmented_images_keep_shape_and_stay_in_range() {
        let aug = TrainAugment::new(&small_config());
        let mut rng = StdRng::seed_from_u64(4);
        let img = RgbImage::from_fn(90, 40, |x, y| Rgb([(x * 2) as u8, (y * 6) as u8, 200]));
        let lo = (0.0 - IMAGE_MEAN[0]) / IMAGE_STD[0] - 1e-4;
        let hi = (1.0 - IMAGE_MEAN[2]) / IMAGE_STD[2] + 1e-4;
        for _ in 0..8 {
            let tensor = aug.apply(&img, &mut rng);
            assert_eq!(tensor.data().len(), 3 * 32 * 32);
            assert!(tensor.data().iter().all(|v| v.is_finite() && *v >= lo && *v <= hi));
        }
    }

    #[test]
    fn crop_box_stays_inside_the_image() {
        let aug = TrainAugment::new(&small_config());
        let mut rng = StdRng::seed_from_u64(9);
        for (w, h) in [(100, 100), (300, 20), (7, 500)] {
            for _ in 0..50 {
                let (left, top, cw, ch) = aug.crop_box(w, h, &mut rng);
                assert!(cw > 0 && ch > 0);
                assert!(left + cw <= w && top + ch <= h, "{w}x{h}: {left},{top} {cw}x{ch}");
            }
        }
    }

    #[test]
    fn same_seed_gives_same_augmentation() {
        let aug = TrainAugment::new(&small_config());
        let img = RgbImage::from_fn(60, 60, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 0]));
        let a = aug.apply(&img, &mut StdRng::seed_from_u64(11));
        let b = aug.apply(&img, &mut StdRng::seed_from_u64(11));
        assert_eq!(a, b);
    }
}
