//! Model kinds and the external fit-engine contract.
//!
//! The nonlinear optimizer is a collaborator behind [`FitEngine`]; this
//! crate orchestrates it over pixels and lines but never implements it.

pub mod ammonia;
pub mod gaussian;

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::domain::axis::SpectralAxis;
use crate::error::{Error, Result};
use ammonia::Nh3Line;

/// Closed set of spectral models. Selecting a model is a tagged variant,
/// not a string, so an unsupported kind cannot reach an engine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ModelKind {
    /// Sum of Gaussian components; parameters come in
    /// `(amplitude, center, width)` triples.
    Gaussian,
    /// One ammonia inversion line; parameters are
    /// `[tkin, tex, log10(column), width, vcenter, fortho]`.
    Ammonia(Nh3Line),
    /// Several ammonia lines on a concatenated velocity axis, sharing the
    /// physical parameters. Each entry is `(line, segment length)`.
    AmmoniaBands(Vec<(Nh3Line, usize)>),
}

impl ModelKind {
    /// Number of peaks a parameter vector of this kind describes.
    pub fn npeaks(&self, params: &[f64]) -> usize {
        match self {
            ModelKind::Gaussian => params.len() / 3,
            ModelKind::Ammonia(_) | ModelKind::AmmoniaBands(_) => 1,
        }
    }

    /// Evaluate the model over the axis values. Ammonia kinds expect the
    /// axis in km/s.
    pub fn evaluate(
        &self,
        xarr: &SpectralAxis,
        params: &[f64],
        thin: bool,
    ) -> Result<Array1<f32>> {
        match self {
            ModelKind::Gaussian => {
                if params.is_empty() || params.len() % 3 != 0 {
                    return Err(Error::shape(format!(
                        "gaussian parameters come in triples, got {}",
                        params.len()
                    )));
                }
                Ok(gaussian::multi_gaussian(xarr.values(), params))
            }
            ModelKind::Ammonia(line) => {
                ammonia::check_params(params)?;
                Ok(ammonia::ammonia_line(xarr.values(), *line, params, thin))
            }
            ModelKind::AmmoniaBands(bands) => {
                ammonia::check_params(params)?;
                let total: usize = bands.iter().map(|&(_, n)| n).sum();
                if total != xarr.len() {
                    return Err(Error::shape(format!(
                        "band segments cover {} channels, axis has {}",
                        total,
                        xarr.len()
                    )));
                }
                Ok(ammonia::ammonia_bands(xarr.values(), bands, params, thin))
            }
        }
    }
}

/// Options forwarded verbatim to the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FitOptions {
    /// Fit multiple components at once.
    pub multifit: bool,
    /// `Some(false)` constrains amplitudes to be non-negative.
    pub negamp: Option<bool>,
    /// Optically-thin approximation for ammonia kinds.
    pub thin: bool,
    /// Suppress engine-side chatter.
    pub quiet: bool,
}

impl Default for FitOptions {
    fn default() -> Self {
        FitOptions {
            multifit: false,
            negamp: None,
            thin: false,
            quiet: true,
        }
    }
}

/// Everything an engine reports back for one spectrum.
#[derive(Debug, Clone, Serialize)]
pub struct FitResult {
    pub kind: ModelKind,
    pub params: Vec<f64>,
    pub errors: Vec<f64>,
    /// Best-fit model sampled on the input axis.
    pub model: Array1<f32>,
    /// Data minus model.
    pub residuals: Array1<f32>,
    /// Per-channel error estimate produced by the engine.
    pub errspec: Array1<f32>,
    pub npeaks: usize,
}

impl FitResult {
    /// Integral of the fitted model. `direct` integrates the sampled model
    /// numerically; otherwise an analytic form is used where the kind has
    /// one (Gaussian), falling back to the numeric value.
    pub fn integral(&self, channel_width: f64, direct: bool) -> f64 {
        if !direct {
            if let ModelKind::Gaussian = self.kind {
                return gaussian::analytic_integral(&self.params);
            }
        }
        let sum: f64 = self.model.iter().map(|&v| v as f64).sum();
        sum * channel_width.abs()
    }
}

/// External nonlinear fit engine.
///
/// `Sync` so a single engine can serve the parallel pixel sweep.
pub trait FitEngine: Sync {
    fn fit(
        &self,
        xarr: &SpectralAxis,
        data: &Array1<f32>,
        error: Option<&Array1<f32>>,
        kind: &ModelKind,
        guesses: &[f64],
        options: &FitOptions,
    ) -> anyhow::Result<FitResult>;
}
