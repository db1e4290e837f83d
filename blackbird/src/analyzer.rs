//! Per-sample analysis: mask, tile, focus-gate and classify one image.

use crate::classifier::{tile_to_tensor, ClassIndex, Classifier, TILE_SIZE};
use crate::error::AnalysisError;
use crate::masking::{Masker, MASK_RELATIVE_THRESHOLD};
use crate::score_map::ScoreMap;
use image::{imageops, GrayImage, ImageError, ImageReader, RgbImage};
use std::path::Path;

/// Minimum mask coverage a tile must exceed to be classified.
pub const FOCUS_THRESHOLD: f64 = 0.7;

/// Placement of non-overlapping tiles on an image. Leftover pixels on each
/// axis are split evenly, the extra pixel (if any) going to the trailing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TileGrid {
    pub rows: usize,
    pub cols: usize,
    pub offset_x: u32,
    pub offset_y: u32,
}

impl TileGrid {
    pub fn from_dimensions(width: u32, height: u32) -> Self {
        let cols = (width / TILE_SIZE) as usize;
        let rows = (height / TILE_SIZE) as usize;

        // An image narrower or shorter than one tile yields no tiles at all.
        if rows == 0 || cols == 0 {
            return Self {
                rows: 0,
                cols: 0,
                offset_x: 0,
                offset_y: 0,
            };
        }

        Self {
            rows,
            cols,
            offset_x: (width % TILE_SIZE) / 2,
            offset_y: (height % TILE_SIZE) / 2,
        }
    }

    /// Top-left pixel of tile `(row, col)`.
    pub fn tile_origin(&self, row: usize, col: usize) -> (u32, u32) {
        (
            self.offset_x + col as u32 * TILE_SIZE,
            self.offset_y + row as u32 * TILE_SIZE,
        )
    }

    pub fn tile_count(&self) -> usize {
        self.rows * self.cols
    }
}

/// Mean mask value over a `size × size` square, as a fraction of 255.
pub fn focus_ratio(mask: &GrayImage, x: u32, y: u32, size: u32) -> f64 {
    let mut sum: u64 = 0;
    for ty in y..y + size {
        for tx in x..x + size {
            sum += mask.get_pixel(tx, ty)[0] as u64;
        }
    }
    let count = size as u64 * size as u64;
    if count == 0 {
        return 0.0;
    }
    sum as f64 / (count * 255) as f64
}

/// Strictly above [`FOCUS_THRESHOLD`]; exactly 70 % coverage is out of focus.
pub fn is_on_focus(ratio: f64) -> bool {
    ratio > FOCUS_THRESHOLD
}

/// Decode an image by its content, falling back to the extension when the
/// bytes are not recognised.
fn decode_rgb(path: &Path) -> Result<RgbImage, ImageError> {
    let image = ImageReader::open(path)
        .and_then(ImageReader::with_guessed_format)
        .map_err(ImageError::IoError)?
        .decode()?;
    Ok(image.to_rgb8())
}

/// Turns sample images into score maps using an injected masker.
pub struct SampleAnalyzer<M: Masker> {
    masker: M,
}

impl<M: Masker> SampleAnalyzer<M> {
    pub fn new(masker: M) -> Self {
        Self { masker }
    }

    /// Decode and analyze one sample file.
    ///
    /// Returns `Ok(None)` when the masker finds no sample in the image.
    pub fn analyze<C: Classifier + ?Sized>(
        &self,
        image_path: &Path,
        classifier: &mut C,
        infected: ClassIndex,
    ) -> Result<Option<ScoreMap>, AnalysisError> {
        let image = decode_rgb(image_path).map_err(|source| AnalysisError::ImageDecode {
            path: image_path.to_path_buf(),
            source,
        })?;

        let score_map = self.analyze_image(&image, classifier, infected)?;
        if score_map.is_none() {
            log::warn!("No sample detected in {}", image_path.display());
        }
        Ok(score_map)
    }

    /// Analyze an already decoded RGB image.
    pub fn analyze_image<C: Classifier + ?Sized>(
        &self,
        image: &RgbImage,
        classifier: &mut C,
        infected: ClassIndex,
    ) -> Result<Option<ScoreMap>, AnalysisError> {
        let Some(mask) = self.masker.mask(image, MASK_RELATIVE_THRESHOLD)? else {
            return Ok(None);
        };
        if mask.dimensions() != image.dimensions() {
            return Err(AnalysisError::Mask(format!(
                "mask is {}x{} but image is {}x{}",
                mask.width(),
                mask.height(),
                image.width(),
                image.height()
            )));
        }

        let grid = TileGrid::from_dimensions(image.width(), image.height());
        let mut score_map = ScoreMap::new(grid.rows, grid.cols);

        for row in 0..grid.rows {
            for col in 0..grid.cols {
                let (x, y) = grid.tile_origin(row, col);
                if !is_on_focus(focus_ratio(&mask, x, y, TILE_SIZE)) {
                    continue;
                }

                let tile = imageops::crop_imm(image, x, y, TILE_SIZE, TILE_SIZE).to_image();
                let probabilities = classifier.predict(&tile_to_tensor(&tile))?;
                let probability = probabilities.get(infected.0).copied().ok_or_else(|| {
                    AnalysisError::Inference(format!(
                        "classifier returned {} value(s), expected at least {}",
                        probabilities.len(),
                        infected.0 + 1
                    ))
                })?;
                score_map.set(row, col, probability);
            }
        }

        log::debug!(
            "Scored {}/{} tile(s) of a {}x{} image",
            score_map.evaluated_count(),
            grid.tile_count(),
            image.width(),
            image.height()
        );

        Ok(Some(score_map))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{Luma, Rgb};
    use ndarray::Array4;
    use std::fs;
    use tempfile::tempdir;

    /// Marks the left `fraction` of every image as foreground.
    struct LeftPartMasker {
        fraction: f32,
    }

    impl Masker for LeftPartMasker {
        fn mask(&self, image: &RgbImage, _rel: f32) -> Result<Option<GrayImage>, AnalysisError> {
            let limit = (image.width() as f32 * self.fraction) as u32;
            Ok(Some(GrayImage::from_fn(image.width(), image.height(), |x, _| {
                Luma([if x < limit { 255 } else { 0 }])
            })))
        }
    }

    struct NoSample;

    impl Masker for NoSample {
        fn mask(&self, _image: &RgbImage, _rel: f32) -> Result<Option<GrayImage>, AnalysisError> {
            Ok(None)
        }
    }

    struct CountingClassifier {
        output: Vec<f32>,
        calls: usize,
    }

    impl Classifier for CountingClassifier {
        fn predict(&mut self, tile: &Array4<f32>) -> Result<Vec<f32>, AnalysisError> {
            assert_eq!(tile.shape(), &[1, 3, 224, 224]);
            self.calls += 1;
            Ok(self.output.clone())
        }
    }

    fn classifier(output: Vec<f32>) -> CountingClassifier {
        CountingClassifier { output, calls: 0 }
    }

    #[test]
    fn test_tile_grid_exact_fit() {
        let grid = TileGrid::from_dimensions(672, 672);
        assert_eq!((grid.rows, grid.cols), (3, 3));
        assert_eq!((grid.offset_x, grid.offset_y), (0, 0));
    }

    #[test]
    fn test_tile_grid_centers_leftover() {
        let grid = TileGrid::from_dimensions(700, 700);
        assert_eq!((grid.rows, grid.cols), (3, 3));
        assert_eq!((grid.offset_x, grid.offset_y), (14, 14));

        let grid = TileGrid::from_dimensions(680, 680);
        assert_eq!((grid.rows, grid.cols), (3, 3));
        assert_eq!((grid.offset_x, grid.offset_y), (4, 4));
        // Last tile ends 4 px before the far edge.
        assert_eq!(grid.tile_origin(2, 2), (452, 452));
    }

    #[test]
    fn test_tile_grid_non_square() {
        let grid = TileGrid::from_dimensions(1000, 500);
        assert_eq!((grid.rows, grid.cols), (2, 4));
        assert_eq!((grid.offset_x, grid.offset_y), (52, 26));
        assert_eq!(grid.tile_origin(1, 3), (52 + 3 * 224, 26 + 224));
    }

    #[test]
    fn test_tile_grid_smaller_than_tile() {
        let grid = TileGrid::from_dimensions(200, 900);
        assert_eq!(grid.tile_count(), 0);
        assert_eq!((grid.rows, grid.cols), (0, 0));
    }

    #[test]
    fn test_focus_gate_boundary() {
        // 70 of 100 pixels set: exactly 0.7, not focused.
        let mask = GrayImage::from_fn(10, 10, |x, y| Luma([if y * 10 + x < 70 { 255 } else { 0 }]));
        let ratio = focus_ratio(&mask, 0, 0, 10);
        assert_eq!(ratio, 0.7);
        assert!(!is_on_focus(ratio));

        let mask = GrayImage::from_fn(10, 10, |x, y| Luma([if y * 10 + x < 71 { 255 } else { 0 }]));
        assert!(is_on_focus(focus_ratio(&mask, 0, 0, 10)));
    }

    #[test]
    fn test_focus_ratio_full_tile_at_threshold() {
        // 35123 full pixels plus one at 51 sum to exactly 70 % of 224*224*255.
        let mut n = 0u32;
        let mask = GrayImage::from_fn(224, 224, |_, _| {
            n += 1;
            Luma([match n {
                n if n <= 35123 => 255,
                35124 => 51,
                _ => 0,
            }])
        });
        assert!(!is_on_focus(focus_ratio(&mask, 0, 0, 224)));
    }

    #[test]
    fn test_unfocused_tiles_are_not_classified() {
        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 0.5 });
        let image = RgbImage::from_pixel(448, 448, Rgb([10, 120, 10]));
        let mut model = classifier(vec![0.3, 0.7]);

        let map = analyzer
            .analyze_image(&image, &mut model, ClassIndex(1))
            .unwrap()
            .unwrap();

        assert_eq!((map.rows(), map.cols()), (2, 2));
        assert_eq!(model.calls, 2);
        assert_eq!(map.get(0, 0), Some(0.7));
        assert_eq!(map.get(1, 0), Some(0.7));
        assert!(!map.is_evaluated(0, 1));
        assert!(!map.is_evaluated(1, 1));
    }

    #[test]
    fn test_infected_index_selects_output() {
        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let image = RgbImage::new(224, 224);
        let mut model = classifier(vec![0.25, 0.75]);

        let map = analyzer
            .analyze_image(&image, &mut model, ClassIndex(0))
            .unwrap()
            .unwrap();
        assert_eq!(map.get(0, 0), Some(0.25));
    }

    #[test]
    fn test_short_probability_vector_is_inference_error() {
        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let image = RgbImage::new(224, 224);
        let mut model = classifier(vec![0.9]);

        let result = analyzer.analyze_image(&image, &mut model, ClassIndex(1));
        assert!(matches!(result, Err(AnalysisError::Inference(_))));
    }

    #[test]
    fn test_no_sample_returns_none() {
        let analyzer = SampleAnalyzer::new(NoSample);
        let image = RgbImage::new(448, 448);
        let mut model = classifier(vec![0.5, 0.5]);

        assert!(analyzer
            .analyze_image(&image, &mut model, ClassIndex(1))
            .unwrap()
            .is_none());
        assert_eq!(model.calls, 0);
    }

    #[test]
    fn test_small_image_gives_empty_map() {
        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let image = RgbImage::new(100, 300);
        let mut model = classifier(vec![0.5, 0.5]);

        let map = analyzer
            .analyze_image(&image, &mut model, ClassIndex(1))
            .unwrap()
            .unwrap();
        assert!(map.is_empty());
    }

    #[test]
    fn test_analyze_decodes_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("1-plant.png");
        RgbImage::from_pixel(500, 260, Rgb([50, 150, 50]))
            .save(&path)
            .unwrap();

        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let mut model = classifier(vec![0.6, 0.4]);
        let map = analyzer
            .analyze(&path, &mut model, ClassIndex(1))
            .unwrap()
            .unwrap();
        assert_eq!((map.rows(), map.cols()), (1, 2));
        assert_eq!(map.evaluated_count(), 2);
    }

    #[test]
    fn test_analyze_sniffs_mislabelled_file() {
        let temp_dir = tempdir().unwrap();
        let png = temp_dir.path().join("source.png");
        RgbImage::from_pixel(500, 260, Rgb([50, 150, 50]))
            .save(&png)
            .unwrap();
        let path = temp_dir.path().join("3-plant.jpg");
        fs::rename(&png, &path).unwrap();

        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let mut model = classifier(vec![0.6, 0.4]);
        let map = analyzer
            .analyze(&path, &mut model, ClassIndex(1))
            .unwrap()
            .unwrap();
        assert_eq!((map.rows(), map.cols()), (1, 2));
    }

    #[test]
    fn test_analyze_undecodable_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("2-broken.png");
        fs::write(&path, b"definitely not a png").unwrap();

        let analyzer = SampleAnalyzer::new(LeftPartMasker { fraction: 1.0 });
        let mut model = classifier(vec![0.6, 0.4]);
        let result = analyzer.analyze(&path, &mut model, ClassIndex(1));
        assert!(matches!(result, Err(AnalysisError::ImageDecode { .. })));
    }
}
