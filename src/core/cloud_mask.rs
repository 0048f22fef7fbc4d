use crate::core::composite::{MaskCompositor, CLASS_CLOUD, CLASS_SHADOW};
use crate::core::morphology::{MorphologyProcessor, SieveSizes};
use crate::core::radiometry::RadiometricNormalizer;
use crate::core::shadow_projection::{ProjectionParams, ShadowProjector};
use crate::core::spectral::{count, ShadowThresholds, SpectralClassifier, SpectralThresholds};
use crate::core::terrain::{
    validate_elevation, TopographicCorrector, TopographicParams, RESOLUTION_TOLERANCE,
};
use crate::types::{
    MaskError, MaskResult, MultibandImage, OutputMode, RasterGrid, SceneMetadata,
};
use ndarray::{Array2, Zip};
use serde::{Deserialize, Serialize};

/// Complete configuration of a masking run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CloudMaskConfig {
    pub spectral: SpectralThresholds,
    pub sieve: SieveSizes,
    pub projection: ProjectionParams,
    pub topographic: TopographicParams,
    /// Value written where the reference image has no data
    pub output_nodata: u8,
    /// Enable parallel processing
    pub enable_parallel: bool,
    /// Rows above which per-pixel stages run in parallel
    pub chunk_size: usize,
}

impl Default for CloudMaskConfig {
    fn default() -> Self {
        Self {
            spectral: SpectralThresholds::default(),
            sieve: SieveSizes::default(),
            projection: ProjectionParams::default(),
            topographic: TopographicParams::default(),
            output_nodata: 255,
            enable_parallel: cfg!(feature = "parallel"),
            chunk_size: 64,
        }
    }
}

/// Cleaned per-class masks of a run
#[derive(Debug, Clone)]
pub struct ComponentMasks {
    pub cloud: Array2<bool>,
    pub shadow: Array2<bool>,
    pub water: Array2<bool>,
    pub valid: Array2<bool>,
}

/// Pixel counts of the final classification
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MaskStatistics {
    pub total_pixels: usize,
    pub nodata_pixels: usize,
    pub cloud_pixels: usize,
    /// shadow pixels not already counted as cloud
    pub shadow_pixels: usize,
    pub water_pixels: usize,
    pub clear_pixels: usize,
    /// clear share of valid pixels
    pub clear_percentage: f64,
    /// pixels the topographic correction could not handle
    pub non_positive_illumination_pixels: usize,
    pub shadow_thresholds: Option<ShadowThresholds>,
}

/// Output of a masking run
#[derive(Debug, Clone)]
pub struct CloudMaskResult {
    pub mask: RasterGrid<u8>,
    pub mode: OutputMode,
    pub components: ComponentMasks,
    pub statistics: MaskStatistics,
}

/// Cloud and cloud-shadow masking of one scene
#[derive(Debug)]
pub struct CloudMaskProcessor {
    config: CloudMaskConfig,
}

impl CloudMaskProcessor {
    pub fn new(config: CloudMaskConfig) -> Self {
        Self { config }
    }

    /// Processor with the default thresholds
    pub fn standard() -> Self {
        Self::new(CloudMaskConfig::default())
    }

    pub fn config(&self) -> &CloudMaskConfig {
        &self.config
    }

    /// Classify one scene.
    ///
    /// All inputs are validated before any pixel is touched; on error no
    /// partial output is produced.
    pub fn process(
        &self,
        image: &MultibandImage,
        elevation: &RasterGrid<f32>,
        metadata: &SceneMetadata,
        mode: OutputMode,
    ) -> MaskResult<CloudMaskResult> {
        let cfg = &self.config;
        log::info!("🛰️  Starting cloud masking ({} scene, {:?} output)", metadata.sensor, mode);

        // Step 1: input checks
        image.validate()?;
        metadata.validate()?;
        if cfg.spectral.shadow_band >= MultibandImage::BAND_COUNT {
            return Err(MaskError::InvalidInput(format!(
                "Shadow band index {} out of range",
                cfg.spectral.shadow_band
            )));
        }
        let compositor = MaskCompositor::new(cfg.output_nodata)?;
        let reference = image.reference();
        check_metadata_resolution(metadata, reference)?;
        // fail on elevation mismatch before any pixel math
        validate_elevation(elevation, reference)?;

        let (rows, cols) = reference.dim();
        log::info!("   Scene size: {}x{} pixels", cols, rows);

        // Step 2: reflectance
        let normalizer = RadiometricNormalizer::new(cfg.enable_parallel, cfg.chunk_size);
        let bands = normalizer.to_reflectance(image, metadata)?;
        let valid = image.validity_mask();

        // Step 3: topographic correction of the shadow band
        let corrector =
            TopographicCorrector::new(cfg.topographic.clone(), cfg.enable_parallel, cfg.chunk_size);
        let (corrected, terrain) =
            corrector.correct(&bands[cfg.spectral.shadow_band], &valid, elevation, metadata)?;
        let slope_deg = terrain.slope_degrees();
        drop(terrain);

        // Step 4: spectral tests
        let classifier = SpectralClassifier::new(cfg.spectral.clone());
        let raw = classifier.classify(&bands, &valid, &corrected.values, &corrected.valid, &slope_deg)?;
        drop(slope_deg);
        drop(bands);

        // Step 5: sieve and buffer each mask
        let morphology = MorphologyProcessor::new(cfg.enable_parallel, cfg.chunk_size);
        let sieve = &cfg.sieve;
        log::debug!("Cleaning masks (water {}, cloud {}, shadow {})", sieve.water, sieve.cloud, sieve.shadow);
        let water = morphology.clean(&raw.water, sieve.water, sieve.dilation_size);
        let cloud = morphology.clean(&raw.cloud, sieve.cloud, sieve.dilation_size);
        let candidates = morphology.clean(&raw.shadow_candidate, sieve.shadow, sieve.dilation_size);

        // Step 6: where could cloud shadows fall
        let projector = ShadowProjector::new(cfg.projection.clone(), cfg.enable_parallel);
        let projected = projector.project(
            &cloud,
            metadata.sun_elevation,
            metadata.sun_azimuth,
            metadata.pixel_resolution,
        )?;

        // Step 7: final shadow and output encoding
        let shadow = compositor.shadow_mask(
            &morphology,
            &candidates,
            &projected,
            &water,
            sieve.shadow,
            sieve.dilation_size,
        );
        drop(projected);
        drop(candidates);

        let encoded = compositor.encode(&cloud, &shadow, &valid, mode);
        let mask = reference.with_data(encoded, Some(compositor.output_nodata()));

        let components = ComponentMasks {
            cloud,
            shadow,
            water,
            valid,
        };
        let statistics = compute_statistics(
            &components,
            corrected.non_positive_illumination,
            raw.shadow_thresholds,
        );

        log::info!("✅ Cloud masking completed");
        log::info!(
            "   Cloud: {} px, shadow: {} px, clear: {:.1}%",
            statistics.cloud_pixels,
            statistics.shadow_pixels,
            statistics.clear_percentage
        );

        Ok(CloudMaskResult {
            mask,
            mode,
            components,
            statistics,
        })
    }
}

/// Shadow shifts are scaled by the metadata resolution, terrain by the grid's
fn check_metadata_resolution(metadata: &SceneMetadata, reference: &RasterGrid<i32>) -> MaskResult<()> {
    let (rx, ry) = reference.geo_transform.resolution();
    let res = metadata.pixel_resolution;
    if (res - rx).abs() > RESOLUTION_TOLERANCE * rx || (res - ry).abs() > RESOLUTION_TOLERANCE * ry {
        return Err(MaskError::InvalidInput(format!(
            "Metadata pixel resolution {} m differs from image pixel size {}x{}",
            res, rx, ry
        )));
    }
    Ok(())
}

fn compute_statistics(
    components: &ComponentMasks,
    non_positive_illumination_pixels: usize,
    shadow_thresholds: Option<ShadowThresholds>,
) -> MaskStatistics {
    let mut stats = MaskStatistics {
        total_pixels: components.valid.len(),
        nodata_pixels: components.valid.iter().filter(|&&v| !v).count(),
        non_positive_illumination_pixels,
        shadow_thresholds,
        ..MaskStatistics::default()
    };

    Zip::from(&components.cloud)
        .and(&components.shadow)
        .and(&components.water)
        .and(&components.valid)
        .for_each(|&cloud, &shadow, &water, &ok| {
            if !ok {
                return;
            }
            if cloud {
                stats.cloud_pixels += 1;
            } else if shadow {
                stats.shadow_pixels += 1;
            } else {
                stats.clear_pixels += 1;
            }
            if water {
                stats.water_pixels += 1;
            }
        });

    let valid_pixels = stats.total_pixels - stats.nodata_pixels;
    stats.clear_percentage = if valid_pixels > 0 {
        100.0 * stats.clear_pixels as f64 / valid_pixels as f64
    } else {
        0.0
    };
    stats
}

impl CloudMaskResult {
    /// Count of output pixels with the given code
    pub fn count_value(&self, value: u8) -> usize {
        self.mask.data.iter().filter(|&&v| v == value).count()
    }

    pub fn cloud_pixels(&self) -> usize {
        count(&self.components.cloud)
    }

    /// true if the encoded mask only holds codes allowed for its mode
    pub fn has_valid_codes(&self) -> bool {
        let nodata = self.mask.nodata;
        self.mask.data.iter().all(|&v| {
            Some(v) == nodata
                || match self.mode {
                    OutputMode::Binary => v <= 1,
                    OutputMode::Classified => v == 0 || v == CLASS_SHADOW || v == CLASS_CLOUD,
                }
        })
    }
}

/// Convenience entry point with default thresholds.
///
/// `classify = false` gives obscured = 0 / clear = 1, `true` gives
/// clear = 0 / shadow = 1 / cloud = 2.
pub fn generate_cloud_mask(
    image: &MultibandImage,
    elevation: &RasterGrid<f32>,
    metadata: &SceneMetadata,
    classify: bool,
) -> MaskResult<RasterGrid<u8>> {
    let processor = CloudMaskProcessor::standard();
    processor
        .process(image, elevation, metadata, OutputMode::from_classify_flag(classify))
        .map(|result| result.mask)
}
