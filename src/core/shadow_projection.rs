use crate::types::{MaskError, MaskResult};
use ndarray::{s, Array2};
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use std::ops::Range;

/// Relative slack so the top of the height range survives float error
const SAMPLE_EPSILON: f64 = 1e-9;

/// Cloud-base height range used to bound the shadow search
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProjectionParams {
    /// Lowest assumed cloud base (m)
    pub min_cloud_height: f64,
    /// Highest assumed cloud base (m)
    pub max_cloud_height: f64,
    /// Ground-distance spacing between samples (m)
    pub sample_interval: f64,
}

impl Default for ProjectionParams {
    fn default() -> Self {
        Self {
            min_cloud_height: 1000.0,
            max_cloud_height: 7000.0,
            sample_interval: 900.0,
        }
    }
}

/// Whole-pixel displacement; dx towards east (columns), dy towards south (rows)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PixelShift {
    pub dx: isize,
    pub dy: isize,
}

impl PixelShift {
    /// false if the shift moves every pixel of a `dim` grid off the grid
    pub fn lands_on_grid(&self, dim: (usize, usize)) -> bool {
        let (rows, cols) = dim;
        self.dx.unsigned_abs() < cols && self.dy.unsigned_abs() < rows
    }
}

/// Projects a cloud mask along the anti-solar direction
pub struct ShadowProjector {
    params: ProjectionParams,
    enable_parallel: bool,
}

impl ShadowProjector {
    pub fn new(params: ProjectionParams, enable_parallel: bool) -> Self {
        Self {
            params,
            enable_parallel,
        }
    }

    pub fn standard() -> Self {
        Self::new(ProjectionParams::default(), true)
    }

    /// Ground distances between cloud and shadow for the sampled heights.
    ///
    /// d_k = start + k·interval while d_k ≤ end, start = h_min / tan(elev),
    /// end = h_max / tan(elev). At least one sample is returned.
    pub fn shift_distances(&self, sun_elevation_deg: f64) -> MaskResult<Vec<f64>> {
        if !(sun_elevation_deg > 0.0 && sun_elevation_deg <= 90.0) {
            return Err(MaskError::InvalidMetadata(format!(
                "Sun elevation {:.3}° cannot cast a shadow",
                sun_elevation_deg
            )));
        }
        let p = &self.params;
        if !(p.sample_interval > 0.0) || p.max_cloud_height < p.min_cloud_height {
            return Err(MaskError::Processing(format!(
                "Invalid cloud height sampling {:?}",
                p
            )));
        }

        let tan_elev = sun_elevation_deg.to_radians().tan();
        let start = p.min_cloud_height / tan_elev;
        let end = p.max_cloud_height / tan_elev;

        let mut distances: Vec<f64> = (0..)
            .map(|k| start + k as f64 * p.sample_interval)
            .take_while(|&d| d <= end + SAMPLE_EPSILON * end.max(1.0))
            .collect();
        if distances.is_empty() {
            distances.push(start);
        }

        log::debug!(
            "Shadow search {:.1}..{:.1} m, {} samples",
            start,
            end,
            distances.len()
        );
        Ok(distances)
    }

    /// Resolve a ground distance into a pixel displacement away from the sun.
    ///
    /// The azimuth (degrees clockwise from north) is folded into one of four
    /// 90° quadrants and the offset θ from the quadrant's lower boundary sets
    /// the x/y split.
    pub fn pixel_shift(distance: f64, sun_azimuth_deg: f64, resolution: f64) -> PixelShift {
        let azimuth = sun_azimuth_deg.rem_euclid(360.0);

        let (x, y) = if azimuth < 90.0 {
            // sun in the NE, shadow towards SW
            let theta = azimuth.to_radians();
            (-distance * theta.sin(), distance * theta.cos())
        } else if azimuth < 180.0 {
            // sun in the SE, shadow towards NW
            let theta = (azimuth - 90.0).to_radians();
            (-distance * theta.cos(), -distance * theta.sin())
        } else if azimuth < 270.0 {
            // sun in the SW, shadow towards NE
            let theta = (azimuth - 180.0).to_radians();
            (distance * theta.sin(), -distance * theta.cos())
        } else {
            // sun in the NW, shadow towards SE
            let theta = (azimuth - 270.0).to_radians();
            (distance * theta.cos(), distance * theta.sin())
        };

        PixelShift {
            dx: (x / resolution).round() as isize,
            dy: (y / resolution).round() as isize,
        }
    }

    /// Distinct pixel shifts for all sampled heights
    pub fn pixel_shifts(
        &self,
        sun_elevation_deg: f64,
        sun_azimuth_deg: f64,
        resolution: f64,
    ) -> MaskResult<Vec<PixelShift>> {
        if !(resolution > 0.0) {
            return Err(MaskError::InvalidMetadata(format!(
                "Pixel resolution must be positive, got {}",
                resolution
            )));
        }
        let mut shifts: Vec<PixelShift> = self
            .shift_distances(sun_elevation_deg)?
            .into_iter()
            .map(|d| Self::pixel_shift(d, sun_azimuth_deg, resolution))
            .collect();
        shifts.sort();
        shifts.dedup();
        Ok(shifts)
    }

    /// Union of the cloud mask shifted by every sampled displacement
    pub fn project(
        &self,
        cloud: &Array2<bool>,
        sun_elevation_deg: f64,
        sun_azimuth_deg: f64,
        resolution: f64,
    ) -> MaskResult<Array2<bool>> {
        let mut shifts = self.pixel_shifts(sun_elevation_deg, sun_azimuth_deg, resolution)?;
        let sampled = shifts.len();
        shifts.retain(|shift| shift.lands_on_grid(cloud.dim()));
        log::info!(
            "☁️  Projecting cloud mask along azimuth {:.1}° ({} displacements, {} off grid)",
            sun_azimuth_deg,
            shifts.len(),
            sampled - shifts.len()
        );
        for shift in &shifts {
            log::debug!("  shift dx = {}, dy = {}", shift.dx, shift.dy);
        }
        Ok(self.project_shifts(cloud, &shifts))
    }

    /// Shift and max-combine; the result does not depend on the order of `shifts`.
    ///
    /// Shifts that leave the grid contribute nothing and are skipped.
    pub fn project_shifts(&self, cloud: &Array2<bool>, shifts: &[PixelShift]) -> Array2<bool> {
        let dim = cloud.dim();
        if self.enable_parallel {
            shifts
                .par_iter()
                .filter(|shift| shift.lands_on_grid(dim))
                .map(|&shift| shift_mask(cloud, shift))
                .reduce(|| Array2::from_elem(dim, false), combine_max)
        } else {
            combine_all(
                shifts
                    .iter()
                    .filter(|shift| shift.lands_on_grid(dim))
                    .map(|&shift| shift_mask(cloud, shift)),
                dim,
            )
        }
    }
}

/// Destination and source index ranges for a 1D offset
fn overlap(len: usize, offset: isize) -> Option<(Range<usize>, Range<usize>)> {
    let magnitude = offset.unsigned_abs();
    if magnitude >= len {
        return None;
    }
    if offset >= 0 {
        Some((magnitude..len, 0..len - magnitude))
    } else {
        Some((0..len - magnitude, magnitude..len))
    }
}

/// Move the mask by `shift`; pixels shifted in from outside are background
pub fn shift_mask(mask: &Array2<bool>, shift: PixelShift) -> Array2<bool> {
    let (rows, cols) = mask.dim();
    let mut shifted = Array2::from_elem((rows, cols), false);
    if let (Some((dst_r, src_r)), Some((dst_c, src_c))) =
        (overlap(rows, shift.dy), overlap(cols, shift.dx))
    {
        shifted
            .slice_mut(s![dst_r, dst_c])
            .assign(&mask.slice(s![src_r, src_c]));
    }
    shifted
}

/// Pixelwise maximum (logical OR) of two masks
pub fn combine_max(mut acc: Array2<bool>, other: Array2<bool>) -> Array2<bool> {
    acc.zip_mut_with(&other, |a, &b| *a = *a || b);
    acc
}

/// Fold any number of masks with `combine_max`
pub fn combine_all<I>(masks: I, dim: (usize, usize)) -> Array2<bool>
where
    I: IntoIterator<Item = Array2<bool>>,
{
    masks
        .into_iter()
        .fold(Array2::from_elem(dim, false), combine_max)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_shift_distances_sampling() {
        let projector = ShadowProjector::standard();
        let distances = projector.shift_distances(45.0).unwrap();
        // 1000..7000 m at 45°: samples 1000, 1900, ..., 6400
        assert_eq!(distances.len(), 7);
        assert_relative_eq!(distances[0], 1000.0, epsilon = 1e-6);
        assert_relative_eq!(distances[6], 6400.0, epsilon = 1e-6);
    }

    #[test]
    fn test_shift_distances_include_range_top() {
        // 1000..7300 m at 45° is exactly 7 intervals
        let params = ProjectionParams {
            min_cloud_height: 1000.0,
            max_cloud_height: 7300.0,
            sample_interval: 900.0,
        };
        let distances = ShadowProjector::new(params, false).shift_distances(45.0).unwrap();
        assert_eq!(distances.len(), 8);
        assert_relative_eq!(distances[7], 7300.0, epsilon = 1e-6);

        let projector = ShadowProjector::standard();
        let tan_elev = 30.0f64.to_radians().tan();
        let distances = projector.shift_distances(30.0).unwrap();
        let last = distances[distances.len() - 1];
        assert!(last <= 7000.0 / tan_elev + 1e-6);
        assert!(last + 900.0 > 7000.0 / tan_elev);
    }

    #[test]
    fn test_off_grid_shifts_skipped() {
        assert!(PixelShift { dx: 9, dy: -4 }.lands_on_grid((5, 10)));
        assert!(!PixelShift { dx: 10, dy: 0 }.lands_on_grid((5, 10)));
        assert!(!PixelShift { dx: 0, dy: -5 }.lands_on_grid((5, 10)));

        let cloud = Array2::from_shape_fn((12, 12), |(i, j)| i < 4 && j < 4);
        let on_grid = vec![PixelShift { dx: 2, dy: 3 }, PixelShift { dx: 5, dy: 1 }];
        let mut with_far = on_grid.clone();
        with_far.extend((12..2000).map(|k| PixelShift { dx: k, dy: k }));

        for parallel in [false, true] {
            let projector = ShadowProjector::new(ProjectionParams::default(), parallel);
            assert_eq!(
                projector.project_shifts(&cloud, &on_grid),
                projector.project_shifts(&cloud, &with_far)
            );
        }
    }

    #[test]
    fn test_low_sun_projection_stays_bounded() {
        // thousands of height samples at 0.05°, every one of them far off a 30x30 grid
        let mut cloud = Array2::from_elem((30, 30), false);
        cloud[[15, 15]] = true;
        let projected = ShadowProjector::new(ProjectionParams::default(), false)
            .project(&cloud, 0.05, 90.0, 30.0)
            .unwrap();
        assert_eq!(projected.dim(), (30, 30));
        assert!(projected.iter().all(|&v| !v));
    }

    #[test]
    fn test_shift_distances_single_sample() {
        let params = ProjectionParams {
            min_cloud_height: 2000.0,
            max_cloud_height: 2000.0,
            sample_interval: 900.0,
        };
        let distances = ShadowProjector::new(params, false).shift_distances(90.0).unwrap();
        assert_eq!(distances.len(), 1);
    }

    #[test]
    fn test_shift_distances_rejects_sun_below_horizon() {
        assert!(ShadowProjector::standard().shift_distances(0.0).is_err());
        assert!(ShadowProjector::standard().shift_distances(-5.0).is_err());
    }

    #[test]
    fn test_pixel_shift_quadrants() {
        let d = 1000.0;
        // due north sun: shadow straight south (down)
        assert_eq!(ShadowProjector::pixel_shift(d, 0.0, 10.0), PixelShift { dx: 0, dy: 100 });
        // due east sun: shadow west
        assert_eq!(ShadowProjector::pixel_shift(d, 90.0, 10.0), PixelShift { dx: -100, dy: 0 });
        // due south sun: shadow north (up)
        assert_eq!(ShadowProjector::pixel_shift(d, 180.0, 10.0), PixelShift { dx: 0, dy: -100 });
        assert_eq!(ShadowProjector::pixel_shift(d, -180.0, 10.0), PixelShift { dx: 0, dy: -100 });
        // due west sun: shadow east
        assert_eq!(ShadowProjector::pixel_shift(d, -90.0, 10.0), PixelShift { dx: 100, dy: 0 });
        // SE sun: shadow NW
        assert_eq!(ShadowProjector::pixel_shift(d, 135.0, 10.0), PixelShift { dx: -71, dy: -71 });
        // 30° east of north: sin 30 = 0.5
        assert_eq!(ShadowProjector::pixel_shift(d, 30.0, 10.0), PixelShift { dx: -50, dy: 87 });
        // 30° past west (300°)
        assert_eq!(ShadowProjector::pixel_shift(d, -60.0, 10.0), PixelShift { dx: 87, dy: 50 });
        // 30° past south (210°)
        assert_eq!(ShadowProjector::pixel_shift(d, -150.0, 10.0), PixelShift { dx: 50, dy: -87 });
    }

    #[test]
    fn test_shift_mask_drops_outside() {
        let mut mask = Array2::from_elem((5, 5), false);
        mask[[0, 0]] = true;
        mask[[4, 4]] = true;
        let shifted = shift_mask(&mask, PixelShift { dx: 1, dy: 2 });
        assert!(shifted[[2, 1]]);
        assert_eq!(shifted.iter().filter(|&&v| v).count(), 1);

        let gone = shift_mask(&mask, PixelShift { dx: -5, dy: 0 });
        assert!(gone.iter().all(|&v| !v));
    }

    #[test]
    fn test_projection_order_independent() {
        let cloud = Array2::from_shape_fn((30, 30), |(i, j)| (10..14).contains(&i) && (12..15).contains(&j));
        let shifts = vec![
            PixelShift { dx: -3, dy: -3 },
            PixelShift { dx: 4, dy: -1 },
            PixelShift { dx: -8, dy: 6 },
            PixelShift { dx: 0, dy: 9 },
        ];
        let projector = ShadowProjector::new(ProjectionParams::default(), false);
        let forward = projector.project_shifts(&cloud, &shifts);

        let mut reversed = shifts.clone();
        reversed.reverse();
        assert_eq!(forward, projector.project_shifts(&cloud, &reversed));

        let mut rotated = shifts.clone();
        rotated.rotate_left(1);
        assert_eq!(forward, projector.project_shifts(&cloud, &rotated));

        let parallel = ShadowProjector::new(ProjectionParams::default(), true);
        assert_eq!(forward, parallel.project_shifts(&cloud, &rotated));
    }

    #[test]
    fn test_project_stays_on_grid() {
        let cloud = Array2::from_elem((20, 25), true);
        let projected = ShadowProjector::standard().project(&cloud, 40.0, 135.0, 100.0).unwrap();
        assert_eq!(projected.dim(), (20, 25));
        // shadow moves up-left, so the bottom-right corner is never reached
        assert!(!projected[[19, 24]]);
        assert!(projected[[0, 0]]);
    }
}
