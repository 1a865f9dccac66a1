//! Joint kinetic-temperature fitting of several ammonia inversion lines.
//!
//! One designated line supplies a single-component Gaussian guess for the
//! shared line shape and the noise level; all lines are then fit together
//! through a composite hyperfine model sharing the physical parameters.

use std::collections::BTreeMap;
use std::path::PathBuf;

use ndarray::Array1;

use crate::domain::axis::{SpectralAxis, SpectralUnit};
use crate::domain::spectrum::Spectrum;
use crate::error::{Error, Result};
use crate::fit::ammonia::Nh3Line;
use crate::fit::{FitEngine, FitOptions, FitResult, ModelKind};
use crate::plot::{render_lines, LayoutPolicy, PanelRenderer};

/// A line either already loaded or named by a FITS path.
#[derive(Debug, Clone)]
pub enum LineSource {
    Spectrum(Spectrum),
    Path(PathBuf),
}

/// How per-line noise is assigned before the joint fit.
#[derive(Debug, Clone)]
pub enum NoisePolicy {
    /// Uniform noise taken from the guess line's fit, applied to every
    /// line. An approximation: per-line noise is not measured
    /// independently.
    FromGuessLine,
    /// Caller-supplied noise per line.
    PerLine(BTreeMap<Nh3Line, f32>),
}

#[derive(Debug, Clone)]
pub struct TkinFitOptions {
    /// Line used for the single-component shape guess.
    pub guess_line: Nh3Line,
    pub tkin: f64,
    pub tex: f64,
    /// log10 of the total column density.
    pub column: f64,
    /// Ortho fraction of the total column.
    pub fortho: f64,
    pub do_baseline: bool,
    pub baseline_order: usize,
    /// Axis window excluded from the baseline fit (the line region).
    pub baseline_exclude: Option<(f64, f64)>,
    /// Velocity window [km/s] every line is cropped to.
    pub crop: Option<(f64, f64)>,
    /// Integer boxcar smoothing applied to every line.
    pub smooth: Option<usize>,
    /// Optically-thin approximation.
    pub thin: bool,
    pub noise: NoisePolicy,
    pub quiet: bool,
}

impl Default for TkinFitOptions {
    fn default() -> Self {
        TkinFitOptions {
            guess_line: Nh3Line::TwoTwo,
            tkin: 15.0,
            tex: 20.0,
            column: 15.0,
            fortho: 0.66,
            do_baseline: true,
            baseline_order: 1,
            baseline_exclude: None,
            crop: None,
            smooth: None,
            thin: false,
            noise: NoisePolicy::FromGuessLine,
            quiet: false,
        }
    }
}

/// Result of a joint fit: the per-line spectra (each carrying its own fit
/// record) plus the composite result.
#[derive(Debug, Clone)]
pub struct JointFit {
    pub lines: BTreeMap<Nh3Line, Spectrum>,
    pub result: FitResult,
}

impl JointFit {
    /// Draw every line into its panel through the external renderer.
    pub fn render(
        &self,
        renderer: &mut dyn PanelRenderer,
        policy: LayoutPolicy,
    ) -> Result<()> {
        render_lines(&self.lines, renderer, policy)
    }
}

/// Fit all provided lines jointly.
///
/// Steps: resolve inputs, convert every axis to km/s, optionally
/// baseline-subtract/crop/smooth uniformly, Gaussian-fit the guess line
/// (non-negative amplitude) for the shared width/center and the noise
/// level, then run the composite fit with the guess vector
/// `[tkin, tex, column, width, vcenter, fortho]` and propagate the result
/// onto every line.
pub fn fit_tkin(
    engine: &dyn FitEngine,
    inputs: BTreeMap<Nh3Line, LineSource>,
    opts: &TkinFitOptions,
) -> Result<JointFit> {
    let mut lines: BTreeMap<Nh3Line, Spectrum> = BTreeMap::new();
    for (line, source) in inputs {
        let sp = match source {
            LineSource::Spectrum(sp) => sp,
            LineSource::Path(path) => Spectrum::from_fits(&path)?,
        };
        lines.insert(line, sp);
    }
    if lines.is_empty() {
        return Err(Error::MissingLine(opts.guess_line));
    }

    for sp in lines.values_mut() {
        sp.xarr.convert_to(SpectralUnit::KmPerS)?;
        if opts.do_baseline {
            sp.baseline(opts.baseline_order, opts.baseline_exclude)?;
        }
        if let Some((lo, hi)) = opts.crop {
            sp.crop(lo, hi)?;
        }
        if let Some(factor) = opts.smooth {
            sp.smooth(factor)?;
        }
    }

    let (width_guess, v_guess, noise) = shape_guess(engine, &mut lines, opts)?;

    match &opts.noise {
        NoisePolicy::FromGuessLine => {
            for sp in lines.values_mut() {
                sp.set_uniform_error(noise);
            }
        }
        NoisePolicy::PerLine(map) => {
            for (line, sp) in lines.iter_mut() {
                let sigma = map.get(line).ok_or(Error::MissingLine(*line))?;
                sp.set_uniform_error(*sigma);
            }
        }
    }

    // Concatenate all lines in canonical order for the composite fit.
    let bands: Vec<(Nh3Line, usize)> = lines.iter().map(|(l, sp)| (*l, sp.len())).collect();
    let total: usize = bands.iter().map(|&(_, n)| n).sum();
    let mut joint_x = Vec::with_capacity(total);
    let mut joint_data = Vec::with_capacity(total);
    let mut joint_error = Vec::with_capacity(total);
    for sp in lines.values() {
        joint_x.extend(sp.xarr.values().iter().copied());
        joint_data.extend(sp.data.iter().copied());
        match &sp.error {
            Some(err) => joint_error.extend(err.iter().copied()),
            None => joint_error.extend(std::iter::repeat_n(noise, sp.len())),
        }
    }
    let joint_axis = SpectralAxis::new(Array1::from_vec(joint_x), SpectralUnit::KmPerS);
    let joint_data = Array1::from_vec(joint_data);
    let joint_error = Array1::from_vec(joint_error);

    let kind = ModelKind::AmmoniaBands(bands);
    let guesses = [
        opts.tkin,
        opts.tex,
        opts.column,
        width_guess,
        v_guess,
        opts.fortho,
    ];
    let fit_opts = FitOptions {
        multifit: true,
        thin: opts.thin,
        quiet: opts.quiet,
        ..Default::default()
    };
    let joint = engine
        .fit(
            &joint_axis,
            &joint_data,
            Some(&joint_error),
            &kind,
            &guesses,
            &fit_opts,
        )
        .map_err(|source| Error::LineFitFailed {
            line: opts.guess_line,
            source,
        })?;

    // Each line gets the shared parameters plus its own evaluated model so
    // it can be inspected or plotted independently.
    for (line, sp) in lines.iter_mut() {
        let kind = ModelKind::Ammonia(*line);
        let model = kind.evaluate(&sp.xarr, &joint.params, opts.thin)?;
        let residuals = &sp.data - &model;
        let errspec = match &sp.error {
            Some(err) => err.clone(),
            None => Array1::from_elem(sp.len(), noise),
        };
        sp.fit = Some(FitResult {
            kind,
            params: joint.params.clone(),
            errors: joint.errors.clone(),
            model,
            residuals,
            errspec,
            npeaks: joint.npeaks,
        });
    }

    Ok(JointFit {
        lines,
        result: joint,
    })
}

/// Single-component Gaussian fit on the guess line. Returns
/// `(width, center, noise)`; the noise is the mean of the engine's error
/// spectrum for that line.
fn shape_guess(
    engine: &dyn FitEngine,
    lines: &mut BTreeMap<Nh3Line, Spectrum>,
    opts: &TkinFitOptions,
) -> Result<(f64, f64, f32)> {
    let guess_sp = lines
        .get_mut(&opts.guess_line)
        .ok_or(Error::MissingLine(opts.guess_line))?;

    let seed = guess_sp.moments();
    let gauss_opts = FitOptions {
        negamp: Some(false),
        quiet: opts.quiet,
        ..Default::default()
    };
    let gauss = engine
        .fit(
            &guess_sp.xarr,
            &guess_sp.data,
            guess_sp.error.as_ref(),
            &ModelKind::Gaussian,
            &seed,
            &gauss_opts,
        )
        .map_err(|source| Error::LineFitFailed {
            line: opts.guess_line,
            source,
        })?;

    if gauss.params.len() < 3 {
        return Err(Error::shape(format!(
            "shape guess needs an (amplitude, center, width) triple, got {} parameters",
            gauss.params.len()
        )));
    }

    let noise = if gauss.errspec.is_empty() {
        0.0
    } else {
        gauss.errspec.sum() / gauss.errspec.len() as f32
    };
    if !opts.quiet {
        log::info!(
            "shape guess on {}: center {:.3} km/s, width {:.3} km/s, rms {:.4}",
            opts.guess_line,
            gauss.params[1],
            gauss.params[2],
            noise
        );
    }
    guess_sp.fit = Some(gauss.clone());
    Ok((gauss.params[2], gauss.params[1], noise))
}

/// Convenience wrapper for a single spectrum of one known line: crop to a
/// velocity window, Gaussian-guess the shape, then fit that line alone.
pub fn fit_line(
    engine: &dyn FitEngine,
    mut spectrum: Spectrum,
    line: Nh3Line,
    opts: &TkinFitOptions,
) -> Result<Spectrum> {
    spectrum.xarr.convert_to(SpectralUnit::KmPerS)?;
    if let Some((lo, hi)) = opts.crop {
        spectrum.crop(lo, hi)?;
    }

    let seed = spectrum.moments();
    let gauss_opts = FitOptions {
        negamp: Some(false),
        quiet: opts.quiet,
        ..Default::default()
    };
    let gauss = engine
        .fit(
            &spectrum.xarr,
            &spectrum.data,
            spectrum.error.as_ref(),
            &ModelKind::Gaussian,
            &seed,
            &gauss_opts,
        )
        .map_err(|source| Error::LineFitFailed { line, source })?;
    if gauss.params.len() < 3 {
        return Err(Error::shape(
            "shape guess needs an (amplitude, center, width) triple",
        ));
    }

    let kind = ModelKind::Ammonia(line);
    let guesses = [
        opts.tkin,
        opts.tex,
        opts.column,
        gauss.params[2],
        gauss.params[1],
        opts.fortho,
    ];
    let fit_opts = FitOptions {
        multifit: true,
        thin: opts.thin,
        quiet: opts.quiet,
        ..Default::default()
    };
    let result = engine
        .fit(
            &spectrum.xarr,
            &spectrum.data,
            spectrum.error.as_ref(),
            &kind,
            &guesses,
            &fit_opts,
        )
        .map_err(|source| Error::LineFitFailed { line, source })?;
    spectrum.fit = Some(result);
    Ok(spectrum)
}
