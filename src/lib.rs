//! cloudmask: cloud, cloud-shadow and water masking for optical satellite scenes
//!
//! Takes a 4-band image (raw counts or TOA reflectance), a co-registered
//! elevation grid and the scene's solar geometry, and produces a single
//! mask raster that flags pixels to leave out of mosaics and composites.

pub mod types;
pub mod core;

// Re-export main types and functions for easier access
pub use types::{
    Extent, GeoTransform, MaskError, MaskResult, MultibandImage, OutputMode, PreconditionCheck,
    RadiometricUnits, RasterGrid, SceneMetadata, Sensor,
};

pub use crate::core::{generate_cloud_mask, CloudMaskConfig, CloudMaskProcessor, CloudMaskResult};
