//! Classifier capability and infected-class calibration.

use crate::error::AnalysisError;
use image::RgbImage;
use ndarray::Array4;

/// Side length of a classification tile in pixels.
pub const TILE_SIZE: u32 = 224;

/// Anything that turns a `[1, 3, 224, 224]` NCHW tile into a probability vector.
///
/// Implementations are driven by a single worker and never called concurrently.
pub trait Classifier {
    fn predict(&mut self, tile: &Array4<f32>) -> Result<Vec<f32>, AnalysisError>;
}

impl<C: Classifier + ?Sized> Classifier for Box<C> {
    fn predict(&mut self, tile: &Array4<f32>) -> Result<Vec<f32>, AnalysisError> {
        (**self).predict(tile)
    }
}

/// Output index that holds the "infected" probability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(transparent)]
pub struct ClassIndex(pub usize);

/// Pick the infected class index for a run.
///
/// The classifier is fed an all-black tile and the output with the *lowest*
/// probability is taken as the infected class. This only holds for models
/// that score a blank tile as clear; it is kept as the run-wide convention and
/// evaluated once, before any sample.
pub fn calibrate_infected_index<C: Classifier + ?Sized>(
    classifier: &mut C,
) -> Result<ClassIndex, AnalysisError> {
    let blank = Array4::<f32>::zeros((1, 3, TILE_SIZE as usize, TILE_SIZE as usize));
    let probabilities = classifier.predict(&blank)?;

    let mut best: Option<(usize, f32)> = None;
    for (i, &p) in probabilities.iter().enumerate() {
        match best {
            Some((_, min)) if p >= min => {}
            _ => best = Some((i, p)),
        }
    }

    best.map(|(i, _)| ClassIndex(i))
        .ok_or_else(|| AnalysisError::Inference("classifier returned an empty output".into()))
}

/// Convert an RGB tile to a `[1, 3, H, W]` tensor of raw 0-255 values.
/// The models embed their own normalization layer, so no scaling is applied.
pub fn tile_to_tensor(tile: &RgbImage) -> Array4<f32> {
    let (width, height) = tile.dimensions();
    let mut array = Array4::<f32>::zeros((1, 3, height as usize, width as usize));

    for (x, y, pixel) in tile.enumerate_pixels() {
        array[[0, 0, y as usize, x as usize]] = pixel[0] as f32;
        array[[0, 1, y as usize, x as usize]] = pixel[1] as f32;
        array[[0, 2, y as usize, x as usize]] = pixel[2] as f32;
    }

    array
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    struct Fixed(Vec<f32>);

    impl Classifier for Fixed {
        fn predict(&mut self, _tile: &Array4<f32>) -> Result<Vec<f32>, AnalysisError> {
            Ok(self.0.clone())
        }
    }

    #[test]
    fn test_calibration_picks_minimum() {
        assert_eq!(calibrate_infected_index(&mut Fixed(vec![0.9, 0.1])).unwrap(), ClassIndex(1));
        assert_eq!(calibrate_infected_index(&mut Fixed(vec![0.2, 0.7, 0.1])).unwrap(), ClassIndex(2));
        assert_eq!(calibrate_infected_index(&mut Fixed(vec![0.05, 0.95])).unwrap(), ClassIndex(0));
    }

    #[test]
    fn test_calibration_first_minimum_on_ties() {
        assert_eq!(calibrate_infected_index(&mut Fixed(vec![0.5, 0.5])).unwrap(), ClassIndex(0));
    }

    #[test]
    fn test_calibration_empty_output_fails() {
        assert!(calibrate_infected_index(&mut Fixed(vec![])).is_err());
    }

    #[test]
    fn test_tile_to_tensor_layout() {
        let mut tile = RgbImage::new(4, 2);
        tile.put_pixel(3, 1, Rgb([10, 20, 30]));

        let tensor = tile_to_tensor(&tile);
        assert_eq!(tensor.shape(), &[1, 3, 2, 4]);
        assert_eq!(tensor[[0, 0, 1, 3]], 10.0);
        assert_eq!(tensor[[0, 1, 1, 3]], 20.0);
        assert_eq!(tensor[[0, 2, 1, 3]], 30.0);
        assert_eq!(tensor[[0, 0, 0, 0]], 0.0);
    }
}
