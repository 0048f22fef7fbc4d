use crate::types::{MaskError, MaskResult, RasterGrid};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Spectral thresholds on reflectance scaled by 10000.
///
/// Band roles: band1 green, band2 red, band4 NIR.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SpectralThresholds {
    /// Cloud if NDGR > ndgr_min and band1 > cloud_band1_min
    pub ndgr_min: f64,
    pub cloud_band1_min: i32,
    /// Cloud regardless of NDGR if band1 > cloud_band1_bright
    pub cloud_band1_bright: i32,
    /// Water if NDVI < water_ndvi_max and slope < water_slope_max_deg
    pub water_ndvi_max: f64,
    pub water_slope_max_deg: f64,
    /// Pass 1: round(gain · mean(non-cloud) + offset)
    pub shadow_pass1_gain: f64,
    pub shadow_pass1_offset: f64,
    /// Pass 2: round(gain · mean(provisional clear) + offset)
    pub shadow_pass2_gain: f64,
    pub shadow_pass2_offset: f64,
    /// 0-based index of the band used for topographic correction and shadows
    pub shadow_band: usize,
}

impl Default for SpectralThresholds {
    fn default() -> Self {
        Self {
            ndgr_min: 0.0,
            cloud_band1_min: 1750,
            cloud_band1_bright: 3900,
            water_ndvi_max: 0.0850,
            water_slope_max_deg: 0.5,
            shadow_pass1_gain: 0.40,
            shadow_pass1_offset: 247.97,
            shadow_pass2_gain: 0.47,
            shadow_pass2_offset: 73.23,
            shadow_band: 3,
        }
    }
}

/// Thresholds the scene-adaptive shadow test settled on
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ShadowThresholds {
    pub pass1: i32,
    pub pass2: i32,
}

/// Raw, uncleaned classification masks
#[derive(Debug, Clone)]
pub struct RawMasks {
    pub cloud: Array2<bool>,
    pub water: Array2<bool>,
    pub shadow_candidate: Array2<bool>,
    /// None when a threshold population was empty
    pub shadow_thresholds: Option<ShadowThresholds>,
}

/// (a − b) / (a + b); None when the denominator is zero
fn normalized_difference(a: i32, b: i32) -> Option<f64> {
    let sum = a as f64 + b as f64;
    if sum == 0.0 {
        None
    } else {
        Some((a as f64 - b as f64) / sum)
    }
}

/// Threshold-based cloud, water and shadow-candidate detection
pub struct SpectralClassifier {
    thresholds: SpectralThresholds,
}

impl SpectralClassifier {
    pub fn new(thresholds: SpectralThresholds) -> Self {
        Self { thresholds }
    }

    pub fn standard() -> Self {
        Self::new(SpectralThresholds::default())
    }

    pub fn thresholds(&self) -> &SpectralThresholds {
        &self.thresholds
    }

    /// (NDGR > 0 AND band1 > 1750) OR band1 > 3900
    pub fn is_cloud(&self, band1: i32, band2: i32) -> bool {
        let t = &self.thresholds;
        let ndgr_bright = normalized_difference(band1, band2)
            .map_or(false, |ndgr| ndgr > t.ndgr_min && band1 > t.cloud_band1_min);
        ndgr_bright || band1 > t.cloud_band1_bright
    }

    /// NDVI < 0.085 AND slope < 0.5°
    pub fn is_water(&self, band2: i32, band4: i32, slope_deg: f64) -> bool {
        let t = &self.thresholds;
        normalized_difference(band4, band2)
            .map_or(false, |ndvi| ndvi < t.water_ndvi_max && slope_deg < t.water_slope_max_deg)
    }

    pub fn cloud_mask(&self, bands: &[RasterGrid<i32>], valid: &Array2<bool>) -> Array2<bool> {
        let mut cloud = Array2::from_elem(valid.dim(), false);
        Zip::from(&mut cloud)
            .and(valid)
            .and(&bands[0].data)
            .and(&bands[1].data)
            .for_each(|c, &ok, &b1, &b2| *c = ok && self.is_cloud(b1, b2));
        cloud
    }

    pub fn water_mask(
        &self,
        bands: &[RasterGrid<i32>],
        valid: &Array2<bool>,
        slope_deg: &Array2<f64>,
    ) -> Array2<bool> {
        let mut water = Array2::from_elem(valid.dim(), false);
        Zip::from(&mut water)
            .and(valid)
            .and(&bands[1].data)
            .and(&bands[3].data)
            .and(slope_deg)
            .for_each(|w, &ok, &b2, &b4, &slope| *w = ok && self.is_water(b2, b4, slope));
        water
    }

    /// Two-pass scene-adaptive dark-pixel threshold on the corrected band.
    ///
    /// Pass 1 averages valid non-cloud pixels; pixels brighter than its
    /// threshold form a provisional clear set whose mean drives pass 2.
    /// Candidates are valid pixels at or below the pass-2 threshold.
    pub fn shadow_candidates(
        &self,
        corrected: &Array2<i32>,
        corrected_valid: &Array2<bool>,
        cloud: &Array2<bool>,
    ) -> (Array2<bool>, Option<ShadowThresholds>) {
        let t = &self.thresholds;
        let empty = Array2::from_elem(corrected.dim(), false);

        let clear = |i: usize, j: usize| corrected_valid[[i, j]] && !cloud[[i, j]];

        let Some(mean1) = masked_mean(corrected, &clear) else {
            log::warn!("No valid cloud-free pixels, skipping shadow detection");
            return (empty, None);
        };
        let pass1 = (t.shadow_pass1_gain * mean1 + t.shadow_pass1_offset).round() as i32;

        let Some(mean2) = masked_mean(corrected, |i, j| clear(i, j) && corrected[[i, j]] > pass1)
        else {
            log::warn!("No pixels above pass-1 threshold {}, skipping shadow detection", pass1);
            return (empty, None);
        };
        let pass2 = (t.shadow_pass2_gain * mean2 + t.shadow_pass2_offset).round() as i32;

        log::debug!(
            "Shadow thresholds: mean1 = {:.2} -> {}, mean2 = {:.2} -> {}",
            mean1,
            pass1,
            mean2,
            pass2
        );

        let mut candidates = empty;
        Zip::from(&mut candidates)
            .and(corrected)
            .and(corrected_valid)
            .for_each(|c, &value, &ok| *c = ok && value <= pass2);

        (candidates, Some(ShadowThresholds { pass1, pass2 }))
    }

    /// Run all three spectral tests
    pub fn classify(
        &self,
        bands: &[RasterGrid<i32>],
        valid: &Array2<bool>,
        corrected: &Array2<i32>,
        corrected_valid: &Array2<bool>,
        slope_deg: &Array2<f64>,
    ) -> MaskResult<RawMasks> {
        if bands.len() != 4 {
            return Err(MaskError::InvalidInput(format!(
                "Classifier needs 4 bands, got {}",
                bands.len()
            )));
        }
        let dim = valid.dim();
        if bands.iter().any(|b| b.dim() != dim)
            || corrected.dim() != dim
            || corrected_valid.dim() != dim
            || slope_deg.dim() != dim
        {
            return Err(MaskError::InvalidInput(
                "Classifier inputs are not the same size".to_string(),
            ));
        }

        log::info!("🔎 Running spectral classification");
        let cloud = self.cloud_mask(bands, valid);
        let water = self.water_mask(bands, valid, slope_deg);
        let (shadow_candidate, shadow_thresholds) =
            self.shadow_candidates(corrected, corrected_valid, &cloud);

        log::debug!(
            "Raw masks: cloud = {}, water = {}, shadow candidates = {}",
            count(&cloud),
            count(&water),
            count(&shadow_candidate)
        );

        Ok(RawMasks {
            cloud,
            water,
            shadow_candidate,
            shadow_thresholds,
        })
    }
}

fn masked_mean<F>(values: &Array2<i32>, include: F) -> Option<f64>
where
    F: Fn(usize, usize) -> bool,
{
    let (sum, n) = values
        .indexed_iter()
        .filter(|&((i, j), _)| include(i, j))
        .fold((0.0f64, 0usize), |(sum, n), (_, &v)| (sum + v as f64, n + 1));
    if n == 0 {
        None
    } else {
        Some(sum / n as f64)
    }
}

pub(crate) fn count(mask: &Array2<bool>) -> usize {
    mask.iter().filter(|&&v| v).count()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;

    fn bands(values: [i32; 4], dim: (usize, usize)) -> Vec<RasterGrid<i32>> {
        values
            .iter()
            .map(|&v| {
                RasterGrid::new(
                    Array2::from_elem(dim, v),
                    GeoTransform::north_up(0.0, 0.0, 10.0),
                    "EPSG:32633",
                )
            })
            .collect()
    }

    #[test]
    fn test_cloud_rule() {
        let c = SpectralClassifier::standard();
        // NDGR > 0 and band1 > 1750
        assert!(c.is_cloud(1800, 1700));
        // band1 exactly at the limit is not enough
        assert!(!c.is_cloud(1750, 1000));
        // NDGR not positive
        assert!(!c.is_cloud(2000, 2000));
        assert!(!c.is_cloud(2000, 2500));
        // very bright overrides NDGR
        assert!(c.is_cloud(3901, 5000));
        assert!(!c.is_cloud(3900, 5000));
        // undefined NDGR
        assert!(!c.is_cloud(0, 0));
    }

    #[test]
    fn test_water_rule() {
        let c = SpectralClassifier::standard();
        // NDVI = (1080 - 1000) / 2080 = 0.0385
        assert!(c.is_water(1000, 1080, 0.0));
        assert!(!c.is_water(1000, 1080, 0.5));
        assert!(c.is_water(1000, 1080, 0.49));
        // NDVI = 0.5
        assert!(!c.is_water(500, 1500, 0.0));
        assert!(!c.is_water(0, 0, 0.0));
    }

    #[test]
    fn test_classify_rejects_wrong_band_count() {
        let c = SpectralClassifier::standard();
        let b = bands([1, 1, 1, 1], (2, 2));
        let valid = Array2::from_elem((2, 2), true);
        let result = c.classify(
            &b[..3],
            &valid,
            &b[3].data,
            &valid,
            &Array2::zeros((2, 2)),
        );
        assert!(matches!(result, Err(MaskError::InvalidInput(_))));
    }

    #[test]
    fn test_shadow_two_pass_thresholds() {
        let c = SpectralClassifier::standard();
        let mut corrected = Array2::from_elem((10, 10), 2000);
        let mut cloud = Array2::from_elem((10, 10), false);
        for j in 0..10 {
            corrected[[0, j]] = 300;
            corrected[[9, j]] = 6000;
            cloud[[9, j]] = true;
        }
        let valid = Array2::from_elem((10, 10), true);

        let (candidates, thresholds) = c.shadow_candidates(&corrected, &valid, &cloud);
        let thresholds = thresholds.unwrap();

        // mean over 90 non-cloud pixels: (80 * 2000 + 10 * 300) / 90 = 1811.11
        assert_eq!(thresholds.pass1, (0.40f64 * (163_000.0 / 90.0) + 247.97).round() as i32);
        // provisional set is the 80 background pixels
        assert_eq!(thresholds.pass2, (0.47f64 * 2000.0 + 73.23).round() as i32);
        assert_eq!(thresholds.pass2, 1013);
        assert_eq!(count(&candidates), 10);
        assert!(candidates[[0, 5]]);
        assert!(!candidates[[9, 5]]);
    }

    #[test]
    fn test_shadow_threshold_is_inclusive() {
        let c = SpectralClassifier::standard();
        let mut corrected = Array2::from_elem((10, 10), 2000);
        corrected[[0, 0]] = 1013;
        corrected[[0, 1]] = 1014;
        let valid = Array2::from_elem((10, 10), true);
        let cloud = Array2::from_elem((10, 10), false);
        let (candidates, thresholds) = c.shadow_candidates(&corrected, &valid, &cloud);
        assert_eq!(thresholds.unwrap().pass2, 1013);
        assert!(candidates[[0, 0]]);
        assert!(!candidates[[0, 1]]);
    }

    #[test]
    fn test_shadow_empty_population() {
        let c = SpectralClassifier::standard();
        let corrected = Array2::from_elem((3, 3), 100);
        let valid = Array2::from_elem((3, 3), true);
        let cloud = Array2::from_elem((3, 3), true);
        let (candidates, thresholds) = c.shadow_candidates(&corrected, &valid, &cloud);
        assert!(thresholds.is_none());
        assert_eq!(count(&candidates), 0);

        // uniform dark scene: nothing exceeds pass 1
        let cloud = Array2::from_elem((3, 3), false);
        let (candidates, thresholds) = c.shadow_candidates(&corrected, &valid, &cloud);
        assert!(thresholds.is_none());
        assert_eq!(count(&candidates), 0);
    }

    #[test]
    fn test_invalid_pixels_never_classified() {
        let c = SpectralClassifier::standard();
        let b = bands([5000, 100, 100, 110], (3, 3));
        let mut valid = Array2::from_elem((3, 3), true);
        valid[[1, 1]] = false;
        let cloud = c.cloud_mask(&b, &valid);
        let water = c.water_mask(&b, &valid, &Array2::zeros((3, 3)));
        assert!(!cloud[[1, 1]] && cloud[[0, 0]]);
        assert!(!water[[1, 1]] && water[[0, 0]]);
    }
}
