use crate::core::morphology::MorphologyProcessor;
use crate::types::{MaskError, MaskResult, OutputMode};
use ndarray::{Array2, Zip};

/// Output codes in classified mode; combined by maximum so cloud wins
pub const CLASS_CLEAR: u8 = 0;
pub const CLASS_SHADOW: u8 = 1;
pub const CLASS_CLOUD: u8 = 2;

/// Output codes in binary mode
pub const BINARY_OBSCURED: u8 = 0;
pub const BINARY_CLEAR: u8 = 1;

/// Builds the final shadow mask and encodes the output raster
pub struct MaskCompositor {
    output_nodata: u8,
}

impl MaskCompositor {
    pub fn new(output_nodata: u8) -> MaskResult<Self> {
        if output_nodata <= CLASS_CLOUD {
            return Err(MaskError::InvalidInput(format!(
                "Output nodata {} collides with a class value",
                output_nodata
            )));
        }
        Ok(Self { output_nodata })
    }

    pub fn output_nodata(&self) -> u8 {
        self.output_nodata
    }

    /// (candidate ∩ projected) without water, sieved and dilated again
    pub fn shadow_mask(
        &self,
        morphology: &MorphologyProcessor,
        shadow_candidate: &Array2<bool>,
        projected: &Array2<bool>,
        water: &Array2<bool>,
        min_size: usize,
        dilation_size: usize,
    ) -> Array2<bool> {
        let mut shadow = Array2::from_elem(shadow_candidate.dim(), false);
        Zip::from(&mut shadow)
            .and(shadow_candidate)
            .and(projected)
            .and(water)
            .for_each(|s, &candidate, &reachable, &is_water| {
                *s = candidate && reachable && !is_water;
            });
        morphology.clean(&shadow, min_size, dilation_size)
    }

    /// Encode cloud and shadow masks; invalid pixels get the nodata value
    pub fn encode(
        &self,
        cloud: &Array2<bool>,
        shadow: &Array2<bool>,
        valid: &Array2<bool>,
        mode: OutputMode,
    ) -> Array2<u8> {
        let mut output = Array2::from_elem(valid.dim(), self.output_nodata);
        let nodata = self.output_nodata;

        Zip::from(&mut output)
            .and(cloud)
            .and(shadow)
            .and(valid)
            .for_each(|out, &is_cloud, &is_shadow, &ok| {
                *out = if !ok {
                    nodata
                } else {
                    match mode {
                        OutputMode::Binary => {
                            if is_cloud || is_shadow {
                                BINARY_OBSCURED
                            } else {
                                BINARY_CLEAR
                            }
                        }
                        OutputMode::Classified => {
                            let shadow_code = if is_shadow { CLASS_SHADOW } else { CLASS_CLEAR };
                            let cloud_code = if is_cloud { CLASS_CLOUD } else { CLASS_CLEAR };
                            shadow_code.max(cloud_code)
                        }
                    }
                };
            });

        output
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn masks() -> (Array2<bool>, Array2<bool>, Array2<bool>) {
        let cloud = Array2::from_shape_vec((1, 4), vec![true, true, false, false]).unwrap();
        let shadow = Array2::from_shape_vec((1, 4), vec![false, true, true, false]).unwrap();
        let valid = Array2::from_elem((1, 4), true);
        (cloud, shadow, valid)
    }

    #[test]
    fn test_binary_encoding() {
        let (cloud, shadow, valid) = masks();
        let out = MaskCompositor::new(255).unwrap().encode(&cloud, &shadow, &valid, OutputMode::Binary);
        assert_eq!(out.as_slice().unwrap(), &[0, 0, 0, 1]);
    }

    #[test]
    fn test_classified_cloud_overrides_shadow() {
        let (cloud, shadow, valid) = masks();
        let out = MaskCompositor::new(255)
            .unwrap()
            .encode(&cloud, &shadow, &valid, OutputMode::Classified);
        assert_eq!(out.as_slice().unwrap(), &[2, 2, 1, 0]);
    }

    #[test]
    fn test_nodata_forced() {
        let (cloud, shadow, mut valid) = masks();
        valid[[0, 1]] = false;
        valid[[0, 3]] = false;
        for mode in [OutputMode::Binary, OutputMode::Classified] {
            let out = MaskCompositor::new(200).unwrap().encode(&cloud, &shadow, &valid, mode);
            assert_eq!(out[[0, 1]], 200);
            assert_eq!(out[[0, 3]], 200);
        }
    }

    #[test]
    fn test_nodata_must_not_collide() {
        assert!(MaskCompositor::new(0).is_err());
        assert!(MaskCompositor::new(2).is_err());
        assert!(MaskCompositor::new(3).is_ok());
    }

    #[test]
    fn test_shadow_excludes_water_and_unreachable() {
        let morphology = MorphologyProcessor::new(false, 64);
        let compositor = MaskCompositor::new(255).unwrap();

        let candidate = Array2::from_shape_fn((20, 20), |(i, j)| i < 10 && j < 10);
        let projected = Array2::from_shape_fn((20, 20), |(_, j)| j < 5);
        let water = Array2::from_shape_fn((20, 20), |(i, _)| i < 2);

        let shadow = compositor.shadow_mask(&morphology, &candidate, &projected, &water, 10, 5);
        // core block rows 2..10, cols 0..5, then dilated by 2
        assert!(shadow[[5, 2]]);
        assert!(shadow[[0, 2]]);
        assert!(shadow[[11, 6]]);
        assert!(!shadow[[12, 2]]);
        assert!(!shadow[[5, 7]]);
    }

    #[test]
    fn test_small_intersection_is_sieved() {
        let morphology = MorphologyProcessor::new(false, 64);
        let compositor = MaskCompositor::new(255).unwrap();
        let candidate = Array2::from_shape_fn((10, 10), |(i, j)| i < 3 && j < 3);
        let projected = Array2::from_elem((10, 10), true);
        let water = Array2::from_elem((10, 10), false);
        let shadow = compositor.shadow_mask(&morphology, &candidate, &projected, &water, 10, 5);
        assert!(shadow.iter().all(|&v| !v));
    }
}
