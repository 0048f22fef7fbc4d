use crate::types::{MaskError, MaskResult, MultibandImage, RadiometricUnits, RasterGrid, SceneMetadata, Sensor};
use ndarray::{Array2, Axis, Zip};
use rayon::prelude::*;
use std::f64::consts::PI;

/// Reflectance scale factor of the integer output bands
pub const REFLECTANCE_SCALE: f64 = 10000.0;

/// Quantisation range of raw MSS counts
pub const MAX_DIGITAL_NUMBER: i32 = 255;

impl Sensor {
    /// Exo-atmospheric solar irradiance (W/m²/µm) per stacked band
    /// (green, red, NIR-1, NIR-2)
    pub fn esun(&self) -> [f64; 4] {
        match self {
            Sensor::Mss1 => [1823.0, 1559.0, 1276.0, 880.1],
            Sensor::Mss2 => [1829.0, 1539.0, 1268.0, 886.6],
            Sensor::Mss3 => [1839.0, 1555.0, 1291.0, 887.9],
            Sensor::Mss4 => [1827.0, 1569.0, 1260.0, 866.4],
            Sensor::Mss5 => [1824.0, 1570.0, 1249.0, 853.4],
        }
    }
}

/// Converts raw counts to TOA reflectance
pub struct RadiometricNormalizer {
    enable_parallel: bool,
    chunk_size: usize,
}

impl RadiometricNormalizer {
    pub fn new(enable_parallel: bool, chunk_size: usize) -> Self {
        Self {
            enable_parallel,
            chunk_size: chunk_size.max(1),
        }
    }

    /// Return the four bands as scaled reflectance.
    ///
    /// Reflectance input passes through untouched; nodata pixels keep
    /// their nodata value in both modes.
    pub fn to_reflectance(
        &self,
        image: &MultibandImage,
        metadata: &SceneMetadata,
    ) -> MaskResult<Vec<RasterGrid<i32>>> {
        image.validate()?;

        match image.units {
            RadiometricUnits::Reflectance => {
                log::debug!("Input already in reflectance, passing bands through");
                Ok(image.bands.clone())
            }
            RadiometricUnits::DigitalNumber => {
                metadata.validate()?;
                for (idx, band) in image.bands.iter().enumerate() {
                    check_dn_range(idx, band)?;
                }
                log::info!(
                    "Converting DN to TOA reflectance ({}, d = {:.5} AU, zenith = {:.2}°)",
                    metadata.sensor,
                    metadata.earth_sun_distance,
                    metadata.sun_zenith
                );

                let esun = metadata.sensor.esun();
                let cos_zenith = metadata.sun_zenith.to_radians().cos();

                let bands = image
                    .bands
                    .iter()
                    .enumerate()
                    .map(|(idx, band)| {
                        let coeffs = BandCoefficients {
                            gain: metadata.gains[idx],
                            bias: metadata.biases[idx],
                            esun: esun[idx],
                            earth_sun_distance: metadata.earth_sun_distance,
                            cos_zenith,
                        };
                        log::debug!("Band {}: {:?}", idx + 1, coeffs);
                        let data = self.convert_band(band, &coeffs);
                        band.with_data(data, band.nodata)
                    })
                    .collect();

                Ok(bands)
            }
        }
    }

    fn convert_band(&self, band: &RasterGrid<i32>, coeffs: &BandCoefficients) -> Array2<i32> {
        let mut output = band.data.clone();
        let convert = |out: &mut i32, &dn: &i32| {
            if !band.is_nodata(dn) {
                *out = coeffs.reflectance(dn);
            }
        };

        if self.enable_parallel && band.height() > self.chunk_size {
            output
                .axis_iter_mut(Axis(0))
                .into_par_iter()
                .zip(band.data.axis_iter(Axis(0)).into_par_iter())
                .for_each(|(mut out_row, in_row)| {
                    Zip::from(&mut out_row).and(&in_row).for_each(&convert);
                });
        } else {
            Zip::from(&mut output).and(&band.data).for_each(&convert);
        }

        output
    }
}

/// Reject counts a byte-quantised scanner cannot produce
fn check_dn_range(idx: usize, band: &RasterGrid<i32>) -> MaskResult<()> {
    let mut out_of_range = band
        .data
        .iter()
        .filter(|&&dn| !band.is_nodata(dn) && !(0..=MAX_DIGITAL_NUMBER).contains(&dn));
    if let Some(&first) = out_of_range.next() {
        let count = 1 + out_of_range.count();
        return Err(MaskError::InvalidInput(format!(
            "Band {} has {} digital numbers outside 0..={} (e.g. {})",
            idx + 1,
            count,
            MAX_DIGITAL_NUMBER,
            first
        )));
    }
    Ok(())
}

#[derive(Debug, Clone, Copy)]
struct BandCoefficients {
    gain: f64,
    bias: f64,
    esun: f64,
    earth_sun_distance: f64,
    cos_zenith: f64,
}

impl BandCoefficients {
    /// round(10000 · π · d² · max(gain·DN + bias, 0) / (esun · cos θz))
    fn reflectance(&self, dn: i32) -> i32 {
        let radiance = (self.gain * dn as f64 + self.bias).max(0.0);
        let d2 = self.earth_sun_distance * self.earth_sun_distance;
        (REFLECTANCE_SCALE * PI * d2 * radiance / (self.esun * self.cos_zenith)).round() as i32
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::GeoTransform;
    use chrono::NaiveDate;

    fn metadata() -> SceneMetadata {
        let mut meta = SceneMetadata::new(
            Sensor::Mss5,
            NaiveDate::from_ymd_opt(1986, 3, 21).unwrap(),
            30.0,
            150.0,
            [0.5, 0.6, 2.0, 0.8],
            [0.0, 0.0, 0.0, -5.0],
            10.0,
        );
        meta.earth_sun_distance = 1.0;
        meta
    }

    fn image(values: [i32; 4], units: RadiometricUnits) -> MultibandImage {
        let bands = values
            .iter()
            .map(|&v| {
                RasterGrid::new(
                    Array2::from_elem((3, 3), v),
                    GeoTransform::north_up(0.0, 0.0, 10.0),
                    "EPSG:32631",
                )
                .with_nodata(-1)
            })
            .collect();
        MultibandImage::new(bands, units)
    }

    #[test]
    fn test_dn_to_reflectance() {
        let meta = metadata();
        let normalizer = RadiometricNormalizer::new(false, 64);
        let bands = normalizer
            .to_reflectance(&image([100, 100, 10, 2], RadiometricUnits::DigitalNumber), &meta)
            .unwrap();

        // 10000 * pi * 50 / (1824 * 0.5) = 1722.36
        assert_eq!(bands[0].data[[1, 1]], 1722);
        // 10000 * pi * 60 / (1570 * 0.5) = 2401.22
        assert_eq!(bands[1].data[[0, 2]], 2401);
        // negative radiance is clipped to zero
        assert_eq!(bands[3].data[[2, 2]], 0);
    }

    #[test]
    fn test_nodata_preserved() {
        let meta = metadata();
        let mut img = image([100, 100, 10, 20], RadiometricUnits::DigitalNumber);
        img.bands[0].data[[0, 0]] = -1;
        let bands = RadiometricNormalizer::new(false, 64).to_reflectance(&img, &meta).unwrap();
        assert_eq!(bands[0].data[[0, 0]], -1);
        assert_eq!(bands[0].nodata, Some(-1));
    }

    #[test]
    fn test_dn_outside_byte_range_rejected() {
        let meta = metadata();
        let normalizer = RadiometricNormalizer::new(false, 64);

        let img = image([40000, -500, 70000, 90000], RadiometricUnits::DigitalNumber);
        let err = normalizer.to_reflectance(&img, &meta).unwrap_err();
        assert!(matches!(err, MaskError::InvalidInput(_)));
        assert!(err.to_string().contains("Band 1"));

        let mut img = image([0, 255, 128, 17], RadiometricUnits::DigitalNumber);
        assert!(normalizer.to_reflectance(&img, &meta).is_ok());
        img.bands[3].data[[2, 1]] = 256;
        let err = normalizer.to_reflectance(&img, &meta).unwrap_err();
        assert!(err.to_string().contains("Band 4"));
    }

    #[test]
    fn test_reflectance_passthrough() {
        let meta = metadata();
        let img = image([1234, 2345, 345, 4567], RadiometricUnits::Reflectance);
        let bands = RadiometricNormalizer::new(true, 1).to_reflectance(&img, &meta).unwrap();
        assert_eq!(bands[0].data[[1, 1]], 1234);
        assert_eq!(bands[3].data[[1, 1]], 4567);
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let meta = metadata();
        let img = image([37, 81, 12, 200], RadiometricUnits::DigitalNumber);
        let seq = RadiometricNormalizer::new(false, 64).to_reflectance(&img, &meta).unwrap();
        let par = RadiometricNormalizer::new(true, 1).to_reflectance(&img, &meta).unwrap();
        for (a, b) in seq.iter().zip(par.iter()) {
            assert_eq!(a.data, b.data);
        }
    }

    #[test]
    fn test_esun_table_complete() {
        for sensor in Sensor::ALL {
            assert!(sensor.esun().iter().all(|&e| e > 0.0));
        }
    }
}
