use std::path::Path;

use nalgebra::{DMatrix, DVector};
use ndarray::Array1;

use crate::domain::axis::{SpectralAxis, SpectralUnit};
use crate::error::{Error, Result};
use crate::fit::FitResult;
use crate::io;
use crate::model::FitsHeader;

/// Number of values returned by [`Spectrum::moments`].
pub const N_MOMENTS: usize = 3;

/// One 1-D spectrum: data, optional per-channel errors, its own axis copy,
/// and the record of the last fit applied to it.
#[derive(Debug, Clone)]
pub struct Spectrum {
    pub xarr: SpectralAxis,
    pub data: Array1<f32>,
    pub error: Option<Array1<f32>>,
    pub fit: Option<FitResult>,
}

impl Spectrum {
    pub fn new(xarr: SpectralAxis, data: Array1<f32>) -> Result<Self> {
        if xarr.len() != data.len() {
            return Err(Error::shape(format!(
                "axis has {} channels, data has {}",
                xarr.len(),
                data.len()
            )));
        }
        Ok(Spectrum {
            xarr,
            data,
            error: None,
            fit: None,
        })
    }

    pub fn with_error(mut self, error: Array1<f32>) -> Result<Self> {
        if error.len() != self.data.len() {
            return Err(Error::shape(format!(
                "error has {} channels, data has {}",
                error.len(),
                self.data.len()
            )));
        }
        self.error = Some(error);
        Ok(self)
    }

    /// Load a 1-D FITS spectrum; the axis comes from the header.
    pub fn from_fits(path: &Path) -> Result<Self> {
        let (data, header) = io::read_spectrum(path)?;
        let xarr = axis_for_spectrum(&header, data.len())?;
        Spectrum::new(xarr, data)
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Fill the error array with one uniform value.
    pub fn set_uniform_error(&mut self, sigma: f32) {
        self.error = Some(Array1::from_elem(self.data.len(), sigma));
    }

    /// Max signal-to-noise over channels with a positive finite error.
    /// `None` when no error array is set.
    pub fn max_snr(&self) -> Option<f32> {
        let error = self.error.as_ref()?;
        let mut best = f32::NEG_INFINITY;
        for (&d, &e) in self.data.iter().zip(error.iter()) {
            if e > 0.0 && d.is_finite() {
                best = best.max(d / e);
            }
        }
        best.is_finite().then_some(best)
    }

    /// Subtract a polynomial baseline of the given order, fit to channels
    /// outside the optional `exclude` axis window.
    pub fn baseline(&mut self, order: usize, exclude: Option<(f64, f64)>) -> Result<()> {
        let excluded = exclude.and_then(|(lo, hi)| self.xarr.window(lo, hi));
        let inside =
            |i: usize| excluded.is_some_and(|(start, end)| i >= start && i <= end);

        // Normalize the abscissa to [-1, 1] to keep the Vandermonde matrix
        // well conditioned.
        let x = self.xarr.values();
        let (xmin, xmax) = x.iter().fold((f64::MAX, f64::MIN), |(lo, hi), &v| {
            (lo.min(v), hi.max(v))
        });
        let span = (xmax - xmin).max(f64::MIN_POSITIVE);
        let norm = |v: f64| 2.0 * (v - xmin) / span - 1.0;

        let mut rows = Vec::new();
        let mut ys = Vec::new();
        for (i, (&xv, &dv)) in x.iter().zip(self.data.iter()).enumerate() {
            if inside(i) || !dv.is_finite() {
                continue;
            }
            let t = norm(xv);
            let mut row = Vec::with_capacity(order + 1);
            let mut p = 1.0;
            for _ in 0..=order {
                row.push(p);
                p *= t;
            }
            rows.push(row);
            ys.push(dv as f64);
        }

        if rows.len() < order + 1 {
            return Err(Error::shape(format!(
                "baseline of order {} needs at least {} channels, {} available",
                order,
                order + 1,
                rows.len()
            )));
        }

        let design = DMatrix::from_fn(rows.len(), order + 1, |r, c| rows[r][c]);
        let y = DVector::from_vec(ys);
        let coeffs = solve_least_squares(&design, &y)
            .ok_or_else(|| Error::shape("baseline fit is singular"))?;

        for (i, &xv) in x.iter().enumerate() {
            let t = norm(xv);
            let mut value = 0.0;
            let mut p = 1.0;
            for c in coeffs.iter() {
                value += c * p;
                p *= t;
            }
            self.data[i] -= value as f32;
        }
        Ok(())
    }

    /// Restrict the spectrum to the axis-value window `[lo, hi]`.
    pub fn crop(&mut self, lo: f64, hi: f64) -> Result<()> {
        let (start, end) = self.xarr.window(lo, hi).ok_or_else(|| {
            Error::shape(format!("crop window [{lo}, {hi}] contains no channels"))
        })?;
        self.data = self.data.slice(ndarray::s![start..=end]).to_owned();
        if let Some(err) = &self.error {
            self.error = Some(err.slice(ndarray::s![start..=end]).to_owned());
        }
        self.xarr = self.xarr.slice(start, end);
        self.fit = None;
        Ok(())
    }

    /// Boxcar-average by an integer factor; data, error, and axis all
    /// shrink together.
    pub fn smooth(&mut self, factor: usize) -> Result<()> {
        if factor <= 1 {
            return Ok(());
        }
        let n = self.data.len() / factor;
        if n == 0 {
            return Err(Error::shape(format!(
                "smoothing by {} leaves no channels",
                factor
            )));
        }
        self.data = boxcar(&self.data, factor, n);
        if let Some(err) = &self.error {
            // Averaging uncorrelated noise over `factor` channels.
            let scaled = boxcar(err, factor, n).mapv(|v| v / (factor as f32).sqrt());
            self.error = Some(scaled);
        }
        self.xarr = self.xarr.downsample(factor);
        self.fit = None;
        Ok(())
    }

    /// Fixed-length `[amplitude, centroid, width]` moment estimate, used as
    /// a Gaussian fit guess. Negative data is clamped out of the weights;
    /// degenerate spectra fall back to the axis midpoint and one channel
    /// width.
    pub fn moments(&self) -> Vec<f64> {
        let x = self.xarr.values();
        let mut amplitude = 0.0f64;
        let mut wsum = 0.0f64;
        let mut wx = 0.0f64;
        for (&xv, &dv) in x.iter().zip(self.data.iter()) {
            if !dv.is_finite() {
                continue;
            }
            let d = dv as f64;
            amplitude = amplitude.max(d);
            let w = d.max(0.0);
            wsum += w;
            wx += w * xv;
        }

        let midpoint = if x.is_empty() {
            0.0
        } else {
            (x[0] + x[x.len() - 1]) / 2.0
        };
        let fallback_width = self.xarr.channel_width().max(f64::MIN_POSITIVE);

        if wsum <= 0.0 {
            return vec![amplitude, midpoint, fallback_width];
        }

        let centroid = wx / wsum;
        let mut wvar = 0.0f64;
        for (&xv, &dv) in x.iter().zip(self.data.iter()) {
            if !dv.is_finite() {
                continue;
            }
            let w = (dv as f64).max(0.0);
            wvar += w * (xv - centroid) * (xv - centroid);
        }
        let width = (wvar / wsum).sqrt().max(fallback_width);
        vec![amplitude, centroid, width]
    }
}

fn boxcar(data: &Array1<f32>, factor: usize, n: usize) -> Array1<f32> {
    Array1::from_shape_fn(n, |i| {
        let start = i * factor;
        data.slice(ndarray::s![start..start + factor])
            .mean()
            .unwrap_or(0.0)
    })
}

/// SVD least-squares solve with progressively looser tolerances.
fn solve_least_squares(design: &DMatrix<f64>, y: &DVector<f64>) -> Option<DVector<f64>> {
    let svd = design.clone().svd(true, true);
    for &tol in &[1e-12, 1e-9, 1e-6] {
        if let Ok(beta) = svd.solve(y, tol) {
            if beta.iter().all(|v| v.is_finite()) {
                return Some(beta);
            }
        }
    }
    None
}

fn axis_for_spectrum(header: &FitsHeader, len: usize) -> Result<SpectralAxis> {
    // 1-D files carry the axis on NAXIS1 keywords; reuse the axis builder
    // by looking at axis 1 when axis 3 is absent.
    if header.axis_len(3) > 0 {
        return SpectralAxis::from_header(header);
    }
    let crval = header
        .get_f64("CRVAL1")
        .ok_or_else(|| Error::shape("missing CRVAL1"))?;
    let cdelt = header
        .get_f64("CDELT1")
        .ok_or_else(|| Error::shape("missing CDELT1"))?;
    let crpix = header.get_f64("CRPIX1").unwrap_or(1.0);
    let values = Array1::from_shape_fn(len, |i| crval + (i as f64 + 1.0 - crpix) * cdelt);
    let unit = header
        .get("CUNIT1")
        .and_then(SpectralUnit::parse)
        .unwrap_or(SpectralUnit::Hz);
    let mut axis = SpectralAxis::new(values, unit);
    if let Some(f0) = header.rest_frequency() {
        axis = axis.with_rest_frequency(f0);
    }
    Ok(axis)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fit::gaussian::gaussian;

    fn vel_axis(n: usize) -> SpectralAxis {
        SpectralAxis::new(Array1::linspace(-20.0, 20.0, n), SpectralUnit::KmPerS)
    }

    #[test]
    fn test_new_rejects_length_mismatch() {
        let axis = vel_axis(10);
        assert!(Spectrum::new(axis, Array1::zeros(9)).is_err());
    }

    #[test]
    fn test_baseline_removes_linear_slope() {
        let axis = vel_axis(101);
        let line = gaussian(axis.values(), 5.0, 0.0, 1.5);
        let data = Array1::from_shape_fn(101, |i| {
            line[i] + 2.0 + 0.1 * axis.values()[i] as f32
        });
        let mut sp = Spectrum::new(axis, data).unwrap();
        sp.baseline(1, Some((-5.0, 5.0))).unwrap();

        // Far from the line the baseline-subtracted data sits near zero.
        assert!(sp.data[2].abs() < 1e-3);
        assert!(sp.data[98].abs() < 1e-3);
        // The line itself survives.
        assert!(sp.data[50] > 4.5);
    }

    #[test]
    fn test_crop_window() {
        let axis = vel_axis(41);
        let data = Array1::from_shape_fn(41, |i| i as f32);
        let mut sp = Spectrum::new(axis, data).unwrap();
        sp.set_uniform_error(1.0);
        sp.crop(-5.0, 5.0).unwrap();
        assert_eq!(sp.len(), 11);
        assert_eq!(sp.error.as_ref().unwrap().len(), 11);
        assert!((sp.xarr.values()[0] + 5.0).abs() < 1e-9);
        assert!(sp.crop(100.0, 200.0).is_err());
    }

    #[test]
    fn test_smooth_downsamples_and_scales_error() {
        let axis = vel_axis(40);
        let data = Array1::from_elem(40, 2.0f32);
        let mut sp = Spectrum::new(axis, data).unwrap();
        sp.set_uniform_error(1.0);
        sp.smooth(4).unwrap();
        assert_eq!(sp.len(), 10);
        assert_eq!(sp.xarr.len(), 10);
        assert!((sp.data[0] - 2.0).abs() < 1e-6);
        assert!((sp.error.as_ref().unwrap()[0] - 0.5).abs() < 1e-6);
    }

    #[test]
    fn test_moments_recover_gaussian_shape() {
        let axis = vel_axis(201);
        let data = gaussian(axis.values(), 4.0, 3.0, 2.0);
        let sp = Spectrum::new(axis, data).unwrap();
        let m = sp.moments();
        assert_eq!(m.len(), N_MOMENTS);
        assert!((m[0] - 4.0).abs() < 0.05);
        assert!((m[1] - 3.0).abs() < 0.1);
        assert!((m[2] - 2.0).abs() < 0.2);
    }

    #[test]
    fn test_moments_tolerate_noise() {
        use rand::{rngs::StdRng, Rng, SeedableRng};
        let mut rng = StdRng::seed_from_u64(7);
        let axis = vel_axis(201);
        let data = Array1::from_shape_fn(201, |i| {
            let v = axis.values()[i];
            (5.0 * (-v * v / 8.0).exp() + rng.gen_range(-0.02..0.02)) as f32
        });
        let sp = Spectrum::new(axis, data).unwrap();
        let m = sp.moments();
        assert!((m[0] - 5.0).abs() < 0.1);
        assert!(m[1].abs() < 0.2);
        // Clamped-positive noise in the wings inflates the width a little.
        assert!((m[2] - 2.0).abs() < 0.4);
    }

    #[test]
    fn test_moments_on_flat_zero_spectrum() {
        let axis = vel_axis(11);
        let sp = Spectrum::new(axis, Array1::zeros(11)).unwrap();
        let m = sp.moments();
        assert_eq!(m.len(), N_MOMENTS);
        assert_eq!(m[0], 0.0);
        assert!(m[1].abs() < 1e-9);
        assert!(m[2] > 0.0);
    }

    #[test]
    fn test_max_snr() {
        let axis = vel_axis(5);
        let mut sp =
            Spectrum::new(axis, Array1::from_vec(vec![0.0, 1.0, 6.0, 1.0, 0.0])).unwrap();
        assert!(sp.max_snr().is_none());
        sp.set_uniform_error(2.0);
        assert!((sp.max_snr().unwrap() - 3.0).abs() < 1e-6);
    }
}
