use crate::types::{
    MaskError, MaskResult, PreconditionCheck, RasterGrid, SceneMetadata,
};
use ndarray::{s, Array2, Zip};
use serde::{Deserialize, Serialize};
use std::f64::consts::PI;

/// Relative tolerance for resolution comparison
pub(crate) const RESOLUTION_TOLERANCE: f64 = 1e-6;
/// Allowed sub-pixel offset of the elevation window origin
const PIXEL_ALIGNMENT_TOLERANCE: f64 = 1e-6;

/// What to do where the sun-to-surface incidence cosine is not positive.
///
/// Self-shadowed slopes (facing away from the sun steeper than the sun
/// elevation) make the Minnaert factor undefined.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum IlluminationPolicy {
    /// Flag the pixel invalid: excluded from statistics, never a shadow candidate
    Exclude,
    /// Raise the illumination to `floor` before applying the power law
    Clamp { floor: f64 },
    /// Keep the band value as is (factor 1)
    Uncorrected,
}

/// Topographic correction parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TopographicParams {
    /// Minnaert constant k in (cos θz / cos i)^k
    pub minnaert_exponent: f64,
    pub illumination_policy: IlluminationPolicy,
}

impl Default for TopographicParams {
    fn default() -> Self {
        Self {
            minnaert_exponent: 0.55,
            illumination_policy: IlluminationPolicy::Exclude,
        }
    }
}

/// Slope and aspect grids derived from elevation
#[derive(Debug, Clone)]
pub struct TerrainDerivatives {
    /// Radians from horizontal
    pub slope: Array2<f64>,
    /// Radians clockwise from north, direction the slope faces
    pub aspect: Array2<f64>,
}

impl TerrainDerivatives {
    pub fn slope_degrees(&self) -> Array2<f64> {
        self.slope.map(|s| s.to_degrees())
    }
}

/// One band after Minnaert correction
#[derive(Debug, Clone)]
pub struct CorrectedBand {
    pub values: Array2<i32>,
    /// false where the band had no data or the correction was undefined
    pub valid: Array2<bool>,
    /// pixels whose illumination was not positive
    pub non_positive_illumination: usize,
}

/// Check that the elevation grid matches the reference grid in
/// resolution, projection and extent, and that the reference origin falls
/// on an elevation pixel corner.
///
/// Returns the (row, col) of the reference origin in the elevation grid.
pub fn validate_elevation<T>(
    elevation: &RasterGrid<f32>,
    reference: &RasterGrid<T>,
) -> MaskResult<(usize, usize)>
where
    T: Copy + PartialEq,
{
    let dem_gt = &elevation.geo_transform;
    let ref_gt = &reference.geo_transform;

    let (dem_rx, dem_ry) = dem_gt.resolution();
    let (ref_rx, ref_ry) = ref_gt.resolution();
    if (dem_rx - ref_rx).abs() > RESOLUTION_TOLERANCE * ref_rx
        || (dem_ry - ref_ry).abs() > RESOLUTION_TOLERANCE * ref_ry
    {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::Resolution,
            detail: format!(
                "elevation pixel size {}x{} differs from image pixel size {}x{}",
                dem_rx, dem_ry, ref_rx, ref_ry
            ),
        });
    }

    if elevation.crs.trim() != reference.crs.trim() {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::Projection,
            detail: format!(
                "elevation projection '{}' differs from image projection '{}'",
                elevation.crs, reference.crs
            ),
        });
    }

    let dem_extent = elevation.extent();
    let ref_extent = reference.extent();
    let tolerance = PIXEL_ALIGNMENT_TOLERANCE * ref_rx.min(ref_ry);
    if !dem_extent.covers(&ref_extent, tolerance) {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::Extent,
            detail: format!(
                "elevation extent {:?} does not cover image extent {:?}",
                dem_extent, ref_extent
            ),
        });
    }

    if dem_gt.rotation_x != 0.0
        || dem_gt.rotation_y != 0.0
        || ref_gt.rotation_x != 0.0
        || ref_gt.rotation_y != 0.0
        || dem_gt.pixel_width.signum() != ref_gt.pixel_width.signum()
        || dem_gt.pixel_height.signum() != ref_gt.pixel_height.signum()
    {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::PixelAlignment,
            detail: "rotated or flipped grids cannot be windowed".to_string(),
        });
    }

    let col_offset = (ref_gt.top_left_x - dem_gt.top_left_x) / dem_gt.pixel_width;
    let row_offset = (ref_gt.top_left_y - dem_gt.top_left_y) / dem_gt.pixel_height;
    let col0 = col_offset.round();
    let row0 = row_offset.round();
    if (col_offset - col0).abs() > PIXEL_ALIGNMENT_TOLERANCE
        || (row_offset - row0).abs() > PIXEL_ALIGNMENT_TOLERANCE
    {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::PixelAlignment,
            detail: format!(
                "image origin falls at elevation pixel ({:.4}, {:.4}), not on a pixel corner",
                col_offset, row_offset
            ),
        });
    }

    let (rows, cols) = reference.dim();
    let (row0, col0) = (row0.max(0.0) as usize, col0.max(0.0) as usize);
    if row0 + rows > elevation.height() || col0 + cols > elevation.width() {
        return Err(MaskError::Precondition {
            check: PreconditionCheck::Extent,
            detail: format!(
                "window {}x{} at ({}, {}) exceeds elevation grid {}x{}",
                cols,
                rows,
                col0,
                row0,
                elevation.width(),
                elevation.height()
            ),
        });
    }

    Ok((row0, col0))
}

/// Cut the co-registered elevation window out of a validated grid.
///
/// Elevations are returned as f64 with nodata mapped to NaN.
pub fn window_elevation<T>(
    elevation: &RasterGrid<f32>,
    reference: &RasterGrid<T>,
) -> MaskResult<Array2<f64>>
where
    T: Copy + PartialEq,
{
    window_elevation_with_margin(elevation, reference, 0).map(|(window, _)| window)
}

/// Like [`window_elevation`], but grown by up to `margin` pixels on each side
/// where the elevation grid extends past the reference.
///
/// Returns the window and the (row, col) of the reference origin inside it.
pub fn window_elevation_with_margin<T>(
    elevation: &RasterGrid<f32>,
    reference: &RasterGrid<T>,
    margin: usize,
) -> MaskResult<(Array2<f64>, (usize, usize))>
where
    T: Copy + PartialEq,
{
    let (row0, col0) = validate_elevation(elevation, reference)?;
    let (rows, cols) = reference.dim();

    let top = row0.min(margin);
    let left = col0.min(margin);
    let bottom = (elevation.height() - row0 - rows).min(margin);
    let right = (elevation.width() - col0 - cols).min(margin);

    log::debug!(
        "Elevation window: rows {}..{}, cols {}..{}",
        row0 - top,
        row0 + rows + bottom,
        col0 - left,
        col0 + cols + right
    );

    let window = elevation.window_f64(
        row0 - top,
        col0 - left,
        rows + top + bottom,
        cols + left + right,
    );
    Ok((window, (top, left)))
}

/// Minnaert topographic normalisation of a single band
pub struct TopographicCorrector {
    params: TopographicParams,
    enable_parallel: bool,
    chunk_size: usize,
}

impl TopographicCorrector {
    pub fn new(params: TopographicParams, enable_parallel: bool, chunk_size: usize) -> Self {
        Self {
            params,
            enable_parallel,
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn standard() -> Self {
        Self::new(TopographicParams::default(), true, 64)
    }

    /// Slope and aspect with Horn's 3x3 kernel.
    ///
    /// `pixel_spacing` is (x, y) in the elevation's vertical units.
    pub fn compute_slope_aspect(
        &self,
        dem: &Array2<f64>,
        pixel_spacing: (f64, f64),
    ) -> MaskResult<TerrainDerivatives> {
        let (rows, cols) = dem.dim();
        if rows < 3 || cols < 3 {
            return Err(MaskError::Processing(format!(
                "Elevation window {}x{} too small for slope computation",
                cols, rows
            )));
        }

        let mut slope = Array2::<f64>::zeros((rows, cols));
        let mut aspect = Array2::<f64>::zeros((rows, cols));
        let (dx, dy) = pixel_spacing;

        let kernel = |(i, j): (usize, usize), s: &mut f64, a: &mut f64| {
            if i == 0 || j == 0 || i == rows - 1 || j == cols - 1 {
                return;
            }
            let z = |di: usize, dj: usize| dem[[i + di - 1, j + dj - 1]];

            let dz_dx = ((z(0, 2) + 2.0 * z(1, 2) + z(2, 2)) - (z(0, 0) + 2.0 * z(1, 0) + z(2, 0)))
                / (8.0 * dx);
            // rows run southwards, so the north gradient is top minus bottom
            let dz_dy = ((z(0, 0) + 2.0 * z(0, 1) + z(0, 2)) - (z(2, 0) + 2.0 * z(2, 1) + z(2, 2)))
                / (8.0 * dy);

            *s = (dz_dx * dz_dx + dz_dy * dz_dy).sqrt().atan();
            *a = ((-dz_dx).atan2(-dz_dy) + 2.0 * PI) % (2.0 * PI);
        };

        if self.enable_parallel && rows > self.chunk_size {
            Zip::indexed(&mut slope).and(&mut aspect).par_for_each(kernel);
        } else {
            Zip::indexed(&mut slope).and(&mut aspect).for_each(kernel);
        }

        fill_edge_values(&mut slope);
        fill_edge_values(&mut aspect);

        let nan_count = slope.iter().filter(|v| v.is_nan()).count();
        if nan_count > 0 {
            log::debug!("Slope undefined at {} pixels (elevation nodata)", nan_count);
        }

        Ok(TerrainDerivatives { slope, aspect })
    }

    /// cos of the sun-to-surface incidence angle (un-normalised hillshade)
    pub fn compute_illumination(
        &self,
        terrain: &TerrainDerivatives,
        sun_zenith_deg: f64,
        sun_azimuth_deg: f64,
    ) -> Array2<f64> {
        let zenith = sun_zenith_deg.to_radians();
        let azimuth = sun_azimuth_deg.to_radians();
        let (cos_z, sin_z) = (zenith.cos(), zenith.sin());

        let mut illumination = Array2::<f64>::zeros(terrain.slope.dim());
        let hillshade = |out: &mut f64, &slope: &f64, &aspect: &f64| {
            *out = cos_z * slope.cos() + sin_z * slope.sin() * (azimuth - aspect).cos();
        };

        if self.enable_parallel && terrain.slope.nrows() > self.chunk_size {
            Zip::from(&mut illumination)
                .and(&terrain.slope)
                .and(&terrain.aspect)
                .par_for_each(hillshade);
        } else {
            Zip::from(&mut illumination)
                .and(&terrain.slope)
                .and(&terrain.aspect)
                .for_each(hillshade);
        }

        illumination
    }

    /// corrected = round(band · (cos θz / illumination)^k)
    pub fn apply_minnaert(
        &self,
        band: &RasterGrid<i32>,
        valid: &Array2<bool>,
        illumination: &Array2<f64>,
        sun_zenith_deg: f64,
    ) -> MaskResult<CorrectedBand> {
        if band.dim() != illumination.dim() || band.dim() != valid.dim() {
            return Err(MaskError::Processing(format!(
                "Band {:?} and illumination {:?} dimensions differ",
                band.dim(),
                illumination.dim()
            )));
        }

        let cos_z = sun_zenith_deg.to_radians().cos();
        let k = self.params.minnaert_exponent;
        let policy = self.params.illumination_policy;

        let mut values = band.data.clone();
        let mut corrected_valid = valid.clone();

        let correct = |out: &mut i32, ok: &mut bool, &illum: &f64| {
            if !*ok {
                return;
            }
            if !illum.is_finite() {
                *ok = false;
                return;
            }
            let factor = if illum > 0.0 {
                (cos_z / illum).powf(k)
            } else {
                match policy {
                    IlluminationPolicy::Exclude => {
                        *ok = false;
                        return;
                    }
                    IlluminationPolicy::Clamp { floor } => (cos_z / floor.max(f64::MIN_POSITIVE)).powf(k),
                    IlluminationPolicy::Uncorrected => 1.0,
                }
            };
            *out = (*out as f64 * factor).round() as i32;
        };

        if self.enable_parallel && band.height() > self.chunk_size {
            Zip::from(&mut values)
                .and(&mut corrected_valid)
                .and(illumination)
                .par_for_each(correct);
        } else {
            Zip::from(&mut values)
                .and(&mut corrected_valid)
                .and(illumination)
                .for_each(correct);
        }

        let non_positive_illumination = illumination
            .iter()
            .zip(valid.iter())
            .filter(|&(&illum, &ok)| ok && illum <= 0.0)
            .count();
        if non_positive_illumination > 0 {
            log::warn!(
                "{} pixels have non-positive illumination, policy {:?}",
                non_positive_illumination,
                policy
            );
        }

        Ok(CorrectedBand {
            values,
            valid: corrected_valid,
            non_positive_illumination,
        })
    }

    /// Full topographic normalisation of `band` against the elevation grid
    pub fn correct(
        &self,
        band: &RasterGrid<i32>,
        valid: &Array2<bool>,
        elevation: &RasterGrid<f32>,
        metadata: &SceneMetadata,
    ) -> MaskResult<(CorrectedBand, TerrainDerivatives)> {
        // one extra pixel per side gives the 3x3 kernel real neighbours at the edges
        let (dem, (top, left)) = window_elevation_with_margin(elevation, band, 1)?;
        log::info!("⛰️  Applying Minnaert correction (k = {})", self.params.minnaert_exponent);

        let padded = self.compute_slope_aspect(&dem, band.geo_transform.resolution())?;
        drop(dem);
        let (rows, cols) = band.dim();
        let terrain = TerrainDerivatives {
            slope: padded.slope.slice(s![top..top + rows, left..left + cols]).to_owned(),
            aspect: padded.aspect.slice(s![top..top + rows, left..left + cols]).to_owned(),
        };
        drop(padded);

        let illumination =
            self.compute_illumination(&terrain, metadata.sun_zenith, metadata.sun_azimuth);
        let corrected = self.apply_minnaert(band, valid, &illumination, metadata.sun_zenith)?;

        Ok((corrected, terrain))
    }
}

/// Fill the outer ring by copying from the nearest interior pixels
fn fill_edge_values(array: &mut Array2<f64>) {
    let (height, width) = array.dim();

    for j in 0..width {
        array[[0, j]] = array[[1, j]];
        array[[height - 1, j]] = array[[height - 2, j]];
    }

    for i in 0..height {
        array[[i, 0]] = array[[i, 1]];
        array[[i, width - 1]] = array[[i, width - 2]];
    }
}
