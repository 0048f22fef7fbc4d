use chrono::{Datelike, NaiveDate};
use ndarray::Array2;
use num_traits::NumCast;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Tolerance used when comparing geotransform coefficients
const GEO_EPSILON: f64 = 1e-9;

/// Geospatial transformation parameters (GDAL ordering)
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoTransform {
    pub top_left_x: f64,
    pub pixel_width: f64,
    pub rotation_x: f64,
    pub top_left_y: f64,
    pub rotation_y: f64,
    pub pixel_height: f64, // negative for north-up grids
}

impl GeoTransform {
    /// North-up transform with square pixels
    pub fn north_up(top_left_x: f64, top_left_y: f64, resolution: f64) -> Self {
        Self {
            top_left_x,
            pixel_width: resolution,
            rotation_x: 0.0,
            top_left_y,
            rotation_y: 0.0,
            pixel_height: -resolution,
        }
    }

    /// Pixel size as (x, y) in map units, always positive
    pub fn resolution(&self) -> (f64, f64) {
        (self.pixel_width.abs(), self.pixel_height.abs())
    }

    pub fn approx_eq(&self, other: &GeoTransform) -> bool {
        (self.top_left_x - other.top_left_x).abs() < GEO_EPSILON
            && (self.top_left_y - other.top_left_y).abs() < GEO_EPSILON
            && (self.pixel_width - other.pixel_width).abs() < GEO_EPSILON
            && (self.pixel_height - other.pixel_height).abs() < GEO_EPSILON
            && (self.rotation_x - other.rotation_x).abs() < GEO_EPSILON
            && (self.rotation_y - other.rotation_y).abs() < GEO_EPSILON
    }
}

/// Map-space extent of a grid
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Extent {
    pub min_x: f64,
    pub max_x: f64,
    pub min_y: f64,
    pub max_y: f64,
}

impl Extent {
    /// True if `other` lies completely inside this extent
    pub fn covers(&self, other: &Extent, tolerance: f64) -> bool {
        self.min_x <= other.min_x + tolerance
            && self.max_x >= other.max_x - tolerance
            && self.min_y <= other.min_y + tolerance
            && self.max_y >= other.max_y - tolerance
    }
}

/// A 2D raster with its georeferencing and an optional nodata value.
///
/// Data is stored row-major as (rows, cols) = (height, width).
#[derive(Debug, Clone)]
pub struct RasterGrid<T> {
    pub data: Array2<T>,
    pub nodata: Option<T>,
    pub geo_transform: GeoTransform,
    /// Projection identifier (WKT or authority code); compared verbatim
    pub crs: String,
}

impl<T: Copy + PartialEq> RasterGrid<T> {
    pub fn new(data: Array2<T>, geo_transform: GeoTransform, crs: impl Into<String>) -> Self {
        Self {
            data,
            nodata: None,
            geo_transform,
            crs: crs.into(),
        }
    }

    pub fn with_nodata(mut self, nodata: T) -> Self {
        self.nodata = Some(nodata);
        self
    }

    pub fn width(&self) -> usize {
        self.data.ncols()
    }

    pub fn height(&self) -> usize {
        self.data.nrows()
    }

    /// (rows, cols)
    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    /// A value is nodata if it equals the nodata value or is unequal to itself (NaN)
    #[allow(clippy::eq_op)]
    pub fn is_nodata(&self, value: T) -> bool {
        value != value || self.nodata.map_or(false, |nd| value == nd)
    }

    /// true where the pixel carries a measurement
    pub fn validity_mask(&self) -> Array2<bool> {
        self.data.map(|&v| !self.is_nodata(v))
    }

    pub fn extent(&self) -> Extent {
        let gt = &self.geo_transform;
        let x0 = gt.top_left_x;
        let x1 = gt.top_left_x + self.width() as f64 * gt.pixel_width;
        let y0 = gt.top_left_y;
        let y1 = gt.top_left_y + self.height() as f64 * gt.pixel_height;
        Extent {
            min_x: x0.min(x1),
            max_x: x0.max(x1),
            min_y: y0.min(y1),
            max_y: y0.max(y1),
        }
    }

    /// Same shape, same geotransform, same projection
    pub fn is_aligned_with<U>(&self, other: &RasterGrid<U>) -> bool {
        self.data.dim() == other.data.dim()
            && self.geo_transform.approx_eq(&other.geo_transform)
            && self.crs == other.crs
    }

    /// New grid on the same footprint with different contents
    pub fn with_data<U: Copy + PartialEq>(&self, data: Array2<U>, nodata: Option<U>) -> RasterGrid<U> {
        RasterGrid {
            data,
            nodata,
            geo_transform: self.geo_transform,
            crs: self.crs.clone(),
        }
    }
}

impl<T: Copy + PartialEq + NumCast> RasterGrid<T> {
    /// Copy a window to f64, mapping nodata to NaN
    pub fn window_f64(&self, row0: usize, col0: usize, rows: usize, cols: usize) -> Array2<f64> {
        self.data
            .slice(ndarray::s![row0..row0 + rows, col0..col0 + cols])
            .map(|&v| {
                if self.is_nodata(v) {
                    f64::NAN
                } else {
                    <f64 as NumCast>::from(v).unwrap_or(f64::NAN)
                }
            })
    }
}

/// Supported platforms: the Multispectral Scanner on Landsat 1-5
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Sensor {
    Mss1,
    Mss2,
    Mss3,
    Mss4,
    Mss5,
}

impl Sensor {
    pub const ALL: [Sensor; 5] = [
        Sensor::Mss1,
        Sensor::Mss2,
        Sensor::Mss3,
        Sensor::Mss4,
        Sensor::Mss5,
    ];

    /// Landsat mission number carrying this scanner
    pub fn mission(&self) -> u8 {
        match self {
            Sensor::Mss1 => 1,
            Sensor::Mss2 => 2,
            Sensor::Mss3 => 3,
            Sensor::Mss4 => 4,
            Sensor::Mss5 => 5,
        }
    }
}

impl std::fmt::Display for Sensor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Sensor::Mss1 => write!(f, "MSS1"),
            Sensor::Mss2 => write!(f, "MSS2"),
            Sensor::Mss3 => write!(f, "MSS3"),
            Sensor::Mss4 => write!(f, "MSS4"),
            Sensor::Mss5 => write!(f, "MSS5"),
        }
    }
}

impl FromStr for Sensor {
    type Err = MaskError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let key: String = s
            .chars()
            .filter(|c| c.is_ascii_alphanumeric())
            .collect::<String>()
            .to_uppercase();
        match key.as_str() {
            // MSS1, LANDSAT1, LM1, LM01 ...
            "MSS1" | "LANDSAT1" | "LM1" | "LM01" => Ok(Sensor::Mss1),
            "MSS2" | "LANDSAT2" | "LM2" | "LM02" => Ok(Sensor::Mss2),
            "MSS3" | "LANDSAT3" | "LM3" | "LM03" => Ok(Sensor::Mss3),
            "MSS4" | "LANDSAT4" | "LM4" | "LM04" => Ok(Sensor::Mss4),
            "MSS5" | "LANDSAT5" | "LM5" | "LM05" => Ok(Sensor::Mss5),
            _ => Err(MaskError::InvalidMetadata(format!("Unknown sensor: {}", s))),
        }
    }
}

/// Per-scene acquisition metadata
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SceneMetadata {
    pub sensor: Sensor,
    pub acquisition_date: NaiveDate,
    /// Degrees above the horizon
    pub sun_elevation: f64,
    /// Degrees clockwise from north, -180..180
    pub sun_azimuth: f64,
    pub sun_zenith: f64,
    /// Astronomical units
    pub earth_sun_distance: f64,
    pub gains: [f64; 4],
    pub biases: [f64; 4],
    /// Ground sampling distance in meters
    pub pixel_resolution: f64,
}

impl SceneMetadata {
    /// Build metadata, deriving the zenith angle and the earth-sun distance
    pub fn new(
        sensor: Sensor,
        acquisition_date: NaiveDate,
        sun_elevation: f64,
        sun_azimuth: f64,
        gains: [f64; 4],
        biases: [f64; 4],
        pixel_resolution: f64,
    ) -> Self {
        Self {
            sensor,
            acquisition_date,
            sun_elevation,
            sun_azimuth,
            sun_zenith: 90.0 - sun_elevation,
            earth_sun_distance: earth_sun_distance(acquisition_date.ordinal()),
            gains,
            biases,
            pixel_resolution,
        }
    }

    pub fn validate(&self) -> MaskResult<()> {
        if !(self.sun_elevation > 0.0 && self.sun_elevation <= 90.0) {
            return Err(MaskError::InvalidMetadata(format!(
                "Sun elevation {:.3}° outside (0, 90]",
                self.sun_elevation
            )));
        }
        if !(-180.0..=180.0).contains(&self.sun_azimuth) {
            return Err(MaskError::InvalidMetadata(format!(
                "Sun azimuth {:.3}° outside [-180, 180]",
                self.sun_azimuth
            )));
        }
        if !(0.0..90.0).contains(&self.sun_zenith) {
            return Err(MaskError::InvalidMetadata(format!(
                "Sun zenith {:.3}° outside [0, 90)",
                self.sun_zenith
            )));
        }
        if !(self.earth_sun_distance > 0.0 && self.earth_sun_distance.is_finite()) {
            return Err(MaskError::InvalidMetadata(format!(
                "Earth-sun distance must be positive, got {}",
                self.earth_sun_distance
            )));
        }
        if !(self.pixel_resolution > 0.0 && self.pixel_resolution.is_finite()) {
            return Err(MaskError::InvalidMetadata(format!(
                "Pixel resolution must be positive, got {}",
                self.pixel_resolution
            )));
        }
        if self.gains.iter().chain(self.biases.iter()).any(|v| !v.is_finite()) {
            return Err(MaskError::InvalidMetadata(
                "Band gains and biases must be finite".to_string(),
            ));
        }
        Ok(())
    }
}

/// Earth-sun distance in AU for a day of year (1..=366)
pub fn earth_sun_distance(day_of_year: u32) -> f64 {
    1.0 - 0.01672 * (0.9856 * (day_of_year as f64 - 4.0)).to_radians().cos()
}

/// Units of the input bands; the two modes are mutually exclusive
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum RadiometricUnits {
    /// Raw sensor counts
    DigitalNumber,
    /// TOA reflectance scaled by 10000
    Reflectance,
}

/// Four co-registered MSS bands (green, red, NIR-1, NIR-2)
#[derive(Debug, Clone)]
pub struct MultibandImage {
    pub bands: Vec<RasterGrid<i32>>,
    pub units: RadiometricUnits,
}

impl MultibandImage {
    pub const BAND_COUNT: usize = 4;

    pub fn new(bands: Vec<RasterGrid<i32>>, units: RadiometricUnits) -> Self {
        Self { bands, units }
    }

    /// Reject images that don't expose four aligned bands
    pub fn validate(&self) -> MaskResult<()> {
        if self.bands.len() != Self::BAND_COUNT {
            return Err(MaskError::InvalidInput(format!(
                "Expected {} bands, got {}",
                Self::BAND_COUNT,
                self.bands.len()
            )));
        }
        let reference = &self.bands[0];
        let (rows, cols) = reference.dim();
        if rows == 0 || cols == 0 {
            return Err(MaskError::InvalidInput("Reference image is empty".to_string()));
        }
        for (idx, band) in self.bands.iter().enumerate().skip(1) {
            if !band.is_aligned_with(reference) {
                return Err(MaskError::InvalidInput(format!(
                    "Band {} ({}x{}, {}) is not co-registered with band 1 ({}x{}, {})",
                    idx + 1,
                    band.width(),
                    band.height(),
                    band.crs,
                    cols,
                    rows,
                    reference.crs
                )));
            }
        }
        Ok(())
    }

    /// Band 1 defines the output footprint
    pub fn reference(&self) -> &RasterGrid<i32> {
        &self.bands[0]
    }

    /// A pixel is valid only if every band has data there
    pub fn validity_mask(&self) -> Array2<bool> {
        let mut valid = Array2::from_elem(self.reference().dim(), true);
        for band in &self.bands {
            ndarray::Zip::from(&mut valid)
                .and(&band.data)
                .for_each(|v, &value| *v = *v && !band.is_nodata(value));
        }
        valid
    }
}

/// Encoding of the final mask
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OutputMode {
    /// obscured = 0, clear = 1
    Binary,
    /// clear = 0, shadow = 1, cloud = 2
    Classified,
}

impl OutputMode {
    pub fn from_classify_flag(classify: bool) -> Self {
        if classify {
            OutputMode::Classified
        } else {
            OutputMode::Binary
        }
    }
}

/// Which elevation precondition failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreconditionCheck {
    Resolution,
    Projection,
    Extent,
    PixelAlignment,
}

impl std::fmt::Display for PreconditionCheck {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PreconditionCheck::Resolution => write!(f, "resolution"),
            PreconditionCheck::Projection => write!(f, "projection"),
            PreconditionCheck::Extent => write!(f, "extent coverage"),
            PreconditionCheck::PixelAlignment => write!(f, "pixel alignment"),
        }
    }
}

/// Error types for cloud masking
#[derive(Debug, thiserror::Error)]
pub enum MaskError {
    #[error("Elevation {check} check failed: {detail}")]
    Precondition {
        check: PreconditionCheck,
        detail: String,
    },

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Invalid metadata: {0}")]
    InvalidMetadata(String),

    #[error("Processing error: {0}")]
    Processing(String),
}

/// Result type for masking operations
pub type MaskResult<T> = Result<T, MaskError>;
