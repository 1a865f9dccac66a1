use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::FitsHeader;

pub const SPEED_OF_LIGHT: f64 = 299_792_458.0; // m/s

/// Units a spectral axis can carry. Frequency <-> velocity conversion uses
/// the radio convention against the axis rest frequency.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SpectralUnit {
    Hz,
    MHz,
    GHz,
    MPerS,
    KmPerS,
}

impl SpectralUnit {
    pub fn parse(s: &str) -> Option<Self> {
        match s.trim() {
            "Hz" | "HZ" | "hz" => Some(SpectralUnit::Hz),
            "MHz" | "MHZ" => Some(SpectralUnit::MHz),
            "GHz" | "GHZ" => Some(SpectralUnit::GHz),
            "m/s" | "m s-1" | "M/S" => Some(SpectralUnit::MPerS),
            "km/s" | "km s-1" | "KM/S" => Some(SpectralUnit::KmPerS),
            _ => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            SpectralUnit::Hz => "Hz",
            SpectralUnit::MHz => "MHz",
            SpectralUnit::GHz => "GHz",
            SpectralUnit::MPerS => "m/s",
            SpectralUnit::KmPerS => "km/s",
        }
    }

    pub fn is_velocity(self) -> bool {
        matches!(self, SpectralUnit::MPerS | SpectralUnit::KmPerS)
    }

    pub fn is_frequency(self) -> bool {
        !self.is_velocity()
    }

    /// Factor to the base unit of the family (Hz for frequency, m/s for
    /// velocity).
    fn scale(self) -> f64 {
        match self {
            SpectralUnit::Hz => 1.0,
            SpectralUnit::MHz => 1e6,
            SpectralUnit::GHz => 1e9,
            SpectralUnit::MPerS => 1.0,
            SpectralUnit::KmPerS => 1e3,
        }
    }
}

impl std::fmt::Display for SpectralUnit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Coordinate values along the spectral axis of a cube or spectrum.
#[derive(Debug, Clone)]
pub struct SpectralAxis {
    values: Array1<f64>,
    unit: SpectralUnit,
    rest_freq_hz: Option<f64>,
}

impl SpectralAxis {
    pub fn new(values: Array1<f64>, unit: SpectralUnit) -> Self {
        SpectralAxis {
            values,
            unit,
            rest_freq_hz: None,
        }
    }

    pub fn with_rest_frequency(mut self, hz: f64) -> Self {
        self.rest_freq_hz = Some(hz);
        self
    }

    /// Build a linear axis from CRVAL3/CDELT3/CRPIX3/NAXIS3. The unit falls
    /// back to Hz when the header carries no recognizable CUNIT3/CTYPE3.
    pub fn from_header(header: &FitsHeader) -> Result<Self> {
        let n = header.axis_len(3);
        if n == 0 {
            return Err(Error::shape("header has no spectral axis (NAXIS3)"));
        }
        let crval = header
            .get_f64("CRVAL3")
            .ok_or_else(|| Error::shape("missing CRVAL3"))?;
        let cdelt = header
            .get_f64("CDELT3")
            .ok_or_else(|| Error::shape("missing CDELT3"))?;
        let crpix = header.get_f64("CRPIX3").unwrap_or(1.0);

        let values =
            Array1::from_shape_fn(n, |i| crval + (i as f64 + 1.0 - crpix) * cdelt);
        let unit = header
            .spectral_unit()
            .and_then(SpectralUnit::parse)
            .unwrap_or(SpectralUnit::Hz);

        let mut axis = SpectralAxis::new(values, unit);
        axis.rest_freq_hz = header.rest_frequency();
        Ok(axis)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &Array1<f64> {
        &self.values
    }

    pub fn unit(&self) -> SpectralUnit {
        self.unit
    }

    pub fn rest_frequency(&self) -> Option<f64> {
        self.rest_freq_hz
    }

    /// Mean absolute channel spacing in the current unit.
    pub fn channel_width(&self) -> f64 {
        if self.values.len() < 2 {
            return 0.0;
        }
        let span = (self.values[self.values.len() - 1] - self.values[0]).abs();
        span / (self.values.len() - 1) as f64
    }

    /// Convert the axis in place. Frequency <-> velocity requires a rest
    /// frequency and applies the radio convention:
    /// `v = c (f0 - f) / f0`.
    pub fn convert_to(&mut self, target: SpectralUnit) -> Result<()> {
        if self.unit == target {
            return Ok(());
        }

        if self.unit.is_frequency() == target.is_frequency() {
            let factor = self.unit.scale() / target.scale();
            self.values.mapv_inplace(|v| v * factor);
            self.unit = target;
            return Ok(());
        }

        let f0 = self.rest_freq_hz.ok_or(Error::UnitConversion {
            from: self.unit.name(),
            to: target.name(),
            reason: "no rest frequency on the axis",
        })?;

        if self.unit.is_frequency() {
            let scale = self.unit.scale();
            let out = target.scale();
            self.values
                .mapv_inplace(|f| SPEED_OF_LIGHT * (f0 - f * scale) / f0 / out);
        } else {
            let scale = self.unit.scale();
            let out = target.scale();
            self.values
                .mapv_inplace(|v| f0 * (1.0 - v * scale / SPEED_OF_LIGHT) / out);
        }
        self.unit = target;
        Ok(())
    }

    /// Clone-and-convert.
    pub fn converted(&self, target: SpectralUnit) -> Result<SpectralAxis> {
        let mut axis = self.clone();
        axis.convert_to(target)?;
        Ok(axis)
    }

    /// Inclusive channel range whose axis values fall inside `[lo, hi]`
    /// (order-insensitive, works on descending axes). `None` when no channel
    /// qualifies.
    pub fn window(&self, lo: f64, hi: f64) -> Option<(usize, usize)> {
        let (lo, hi) = if lo <= hi { (lo, hi) } else { (hi, lo) };
        let mut first = None;
        let mut last = None;
        for (i, &v) in self.values.iter().enumerate() {
            if v >= lo && v <= hi {
                if first.is_none() {
                    first = Some(i);
                }
                last = Some(i);
            }
        }
        Some((first?, last?))
    }

    /// Keep only channels `[start, end]` (inclusive).
    pub fn slice(&self, start: usize, end: usize) -> SpectralAxis {
        SpectralAxis {
            values: self
                .values
                .slice(ndarray::s![start..=end])
                .to_owned(),
            unit: self.unit,
            rest_freq_hz: self.rest_freq_hz,
        }
    }

    /// Boxcar-average the axis by an integer factor (pairs with spectrum
    /// smoothing).
    pub fn downsample(&self, factor: usize) -> SpectralAxis {
        let factor = factor.max(1);
        let n = self.values.len() / factor;
        let values = Array1::from_shape_fn(n, |i| {
            let start = i * factor;
            self.values
                .slice(ndarray::s![start..start + factor])
                .mean()
                .unwrap_or(0.0)
        });
        SpectralAxis {
            values,
            unit: self.unit,
            rest_freq_hz: self.rest_freq_hz,
        }
    }
}
