//! Core masking stages

pub mod radiometry;
pub mod terrain;
pub mod spectral;
pub mod morphology;
pub mod shadow_projection;
pub mod composite;
pub mod cloud_mask;

// Re-export main types
pub use radiometry::{RadiometricNormalizer, MAX_DIGITAL_NUMBER, REFLECTANCE_SCALE};
pub use terrain::{
    validate_elevation, window_elevation, window_elevation_with_margin, CorrectedBand,
    IlluminationPolicy, TerrainDerivatives, TopographicCorrector, TopographicParams,
};
pub use spectral::{RawMasks, ShadowThresholds, SpectralClassifier, SpectralThresholds};
pub use morphology::{dilate, sieve, ComponentLabels, MorphologyProcessor, SieveSizes};
pub use shadow_projection::{
    combine_all, combine_max, shift_mask, PixelShift, ProjectionParams, ShadowProjector,
};
pub use composite::{
    MaskCompositor, BINARY_CLEAR, BINARY_OBSCURED, CLASS_CLEAR, CLASS_CLOUD, CLASS_SHADOW,
};
pub use cloud_mask::{
    generate_cloud_mask, CloudMaskConfig, CloudMaskProcessor, CloudMaskResult, ComponentMasks,
    MaskStatistics,
};
