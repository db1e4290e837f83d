//! Foreground (leaf) masking.
//!
//! The mask capability separates the sample from the tray background. The
//! analyzer only needs the [`Masker`] trait; [`FocusMasker`] is the native
//! implementation based on local contrast: leaf tissue is textured, the
//! background is flat.

use crate::error::AnalysisError;
use image::imageops::{self, FilterType};
use image::{GrayImage, Luma, RgbImage};
use imageproc::distance_transform::Norm;
use imageproc::morphology::erode;
use imageproc::region_labelling::{connected_components, Connectivity};

/// Relative threshold handed to the masker by the analyzer.
pub const MASK_RELATIVE_THRESHOLD: f32 = 0.2;

const FOREGROUND: u8 = 255;
const BACKGROUND: u8 = 0;

/// Produces a binary mask (0 / 255, same size as the image) or `None` when
/// no sample is present.
pub trait Masker {
    fn mask(
        &self,
        image: &RgbImage,
        relative_threshold: f32,
    ) -> Result<Option<GrayImage>, AnalysisError>;
}

impl<M: Masker + ?Sized> Masker for &M {
    fn mask(
        &self,
        image: &RgbImage,
        relative_threshold: f32,
    ) -> Result<Option<GrayImage>, AnalysisError> {
        (**self).mask(image, relative_threshold)
    }
}

/// Local-contrast leaf masker.
#[derive(Debug, Clone)]
pub struct FocusMasker {
    /// Side of the contrast window in pixels.
    pub window: u32,
    /// Stride between contrast windows in pixels. Must not exceed `window`.
    pub step: u32,
    /// Smallest accepted leaf area as a fraction of the contrast map.
    pub min_area_fraction: f64,
}

impl Default for FocusMasker {
    fn default() -> Self {
        Self {
            window: 50,
            step: 6,
            min_area_fraction: 0.15,
        }
    }
}

/// Per-channel summed-area tables of values and squared values.
struct IntegralImages {
    width: usize,
    sum: Vec<[u64; 3]>,
    sum_sq: Vec<[u64; 3]>,
}

impl IntegralImages {
    fn new(image: &RgbImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![[0u64; 3]; stride * (h + 1)];
        let mut sum_sq = vec![[0u64; 3]; stride * (h + 1)];

        for y in 0..h {
            let mut row_sum = [0u64; 3];
            let mut row_sq = [0u64; 3];
            for x in 0..w {
                let pixel = image.get_pixel(x as u32, y as u32);
                for c in 0..3 {
                    let v = pixel[c] as u64;
                    row_sum[c] += v;
                    row_sq[c] += v * v;
                }
                let above = y * stride + x + 1;
                let here = (y + 1) * stride + x + 1;
                for c in 0..3 {
                    sum[here][c] = sum[above][c] + row_sum[c];
                    sum_sq[here][c] = sum_sq[above][c] + row_sq[c];
                }
            }
        }

        Self {
            width: stride,
            sum,
            sum_sq,
        }
    }

    fn rect(table: &[[u64; 3]], stride: usize, x: usize, y: usize, size: usize, c: usize) -> u64 {
        let a = table[y * stride + x][c];
        let b = table[y * stride + x + size][c];
        let d = table[(y + size) * stride + x][c];
        let e = table[(y + size) * stride + x + size][c];
        e + a - b - d
    }

    /// Largest per-channel standard deviation over a `size × size` window.
    fn max_channel_std(&self, x: usize, y: usize, size: usize) -> f64 {
        let n = (size * size) as f64;
        (0..3)
            .map(|c| {
                let s = Self::rect(&self.sum, self.width, x, y, size, c) as f64;
                let sq = Self::rect(&self.sum_sq, self.width, x, y, size, c) as f64;
                let mean = s / n;
                (sq / n - mean * mean).max(0.0).sqrt()
            })
            .fold(0.0, f64::max)
    }
}

impl FocusMasker {
    /// Local contrast map, `None` when the image is too small for one window row.
    fn contrast_map(&self, image: &RgbImage) -> Option<(usize, usize, Vec<f64>)> {
        let step = self.step as usize;
        let window = self.window as usize;
        let margin = window / step;
        let map_w = (image.width() as usize / step).checked_sub(margin)?;
        let map_h = (image.height() as usize / step).checked_sub(margin)?;
        if map_w == 0 || map_h == 0 {
            return None;
        }

        let integral = IntegralImages::new(image);
        let mut map = Vec::with_capacity(map_w * map_h);
        for i in 0..map_h {
            for j in 0..map_w {
                map.push(integral.max_channel_std(j * step, i * step, window));
            }
        }
        Some((map_w, map_h, map))
    }
}

/// Fill background holes that are not 4-connected to the image border.
fn fill_holes(mask: &GrayImage) -> GrayImage {
    let (w, h) = mask.dimensions();
    let inverted = GrayImage::from_fn(w, h, |x, y| {
        if mask.get_pixel(x, y)[0] == BACKGROUND {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    });
    let labels = connected_components(&inverted, Connectivity::Four, Luma([BACKGROUND]));

    let mut touches_border = std::collections::HashSet::new();
    for x in 0..w {
        touches_border.insert(labels.get_pixel(x, 0)[0]);
        touches_border.insert(labels.get_pixel(x, h - 1)[0]);
    }
    for y in 0..h {
        touches_border.insert(labels.get_pixel(0, y)[0]);
        touches_border.insert(labels.get_pixel(w - 1, y)[0]);
    }

    GrayImage::from_fn(w, h, |x, y| {
        let label = labels.get_pixel(x, y)[0];
        if label == 0 || !touches_border.contains(&label) {
            Luma([FOREGROUND])
        } else {
            Luma([BACKGROUND])
        }
    })
}

fn clear_border(mask: &mut GrayImage) {
    let (w, h) = mask.dimensions();
    for x in 0..w {
        mask.put_pixel(x, 0, Luma([BACKGROUND]));
        mask.put_pixel(x, h - 1, Luma([BACKGROUND]));
    }
    for y in 0..h {
        mask.put_pixel(0, y, Luma([BACKGROUND]));
        mask.put_pixel(w - 1, y, Luma([BACKGROUND]));
    }
}

impl Masker for FocusMasker {
    fn mask(
        &self,
        image: &RgbImage,
        relative_threshold: f32,
    ) -> Result<Option<GrayImage>, AnalysisError> {
        if self.step == 0 || self.step > self.window {
            return Err(AnalysisError::Mask(format!(
                "invalid contrast window {} / step {}",
                self.window, self.step
            )));
        }

        let Some((map_w, map_h, contrast)) = self.contrast_map(image) else {
            log::debug!(
                "Image {}x{} too small for contrast masking",
                image.width(),
                image.height()
            );
            return Ok(None);
        };

        // Background estimate: mean contrast of cells below the relative cut.
        let max_val = contrast.iter().copied().fold(0.0, f64::max);
        let cut = max_val * relative_threshold as f64;
        let (bg_sum, bg_count) = contrast
            .iter()
            .filter(|&&v| v <= cut)
            .fold((0.0, 0usize), |(s, n), &v| (s + v, n + 1));
        let threshold = if bg_count > 0 {
            bg_sum / bg_count as f64
        } else {
            0.0
        };

        let binary = GrayImage::from_fn(map_w as u32, map_h as u32, |x, y| {
            if contrast[y as usize * map_w + x as usize] > threshold {
                Luma([FOREGROUND])
            } else {
                Luma([BACKGROUND])
            }
        });

        let mut binary = erode(&fill_holes(&binary), Norm::LInf, 10);
        clear_border(&mut binary);
        let binary = fill_holes(&erode(&binary, Norm::LInf, 4));

        // Keep the largest 8-connected component.
        let labels = connected_components(&binary, Connectivity::Eight, Luma([BACKGROUND]));
        let n_labels = labels.pixels().map(|p| p[0]).max().unwrap_or(0) as usize;
        if n_labels == 0 {
            log::debug!("No leaf pixels found");
            return Ok(None);
        }
        let mut areas = vec![0usize; n_labels + 1];
        for p in labels.pixels() {
            areas[p[0] as usize] += 1;
        }
        let (largest, largest_area) = areas
            .iter()
            .enumerate()
            .skip(1)
            .fold((0, 0), |best, (label, &area)| {
                if area > best.1 {
                    (label, area)
                } else {
                    best
                }
            });

        let min_area = (map_w * map_h) as f64 * self.min_area_fraction;
        if (largest_area as f64) < min_area {
            log::debug!("Leaf area too small ({largest_area} < {min_area:.0} cells)");
            return Ok(None);
        }

        let leaf = GrayImage::from_fn(map_w as u32, map_h as u32, |x, y| {
            if labels.get_pixel(x, y)[0] as usize == largest {
                Luma([FOREGROUND])
            } else {
                Luma([BACKGROUND])
            }
        });
        let leaf = erode(&leaf, Norm::LInf, 10);

        Ok(Some(imageops::resize(
            &leaf,
            image.width(),
            image.height(),
            FilterType::Nearest,
        )))
    }
}
