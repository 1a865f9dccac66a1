use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ndarray::{s, Array1, Array2, Array3};
use rayon::prelude::*;
use serde::Serialize;

use crate::domain::aperture::{extract_aperture, Aperture, Reduce};
use crate::domain::axis::SpectralAxis;
use crate::domain::plane::{collapse, Collapse, Plane};
use crate::domain::spectrum::Spectrum;
use crate::domain::wcs::CelestialWcs;
use crate::error::{Error, Result};
use crate::fit::{FitEngine, FitOptions, ModelKind};
use crate::io;
use crate::model::FitsHeader;

/// What to do when the engine fails on a single pixel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum FailurePolicy {
    /// Stop the sweep at the first failure (observed-design behavior).
    Abort,
    /// Record the failure in the report and keep sweeping.
    Continue,
}

/// How the blank-value rule is applied when `blank_value != 0`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum BlankingMode {
    /// Reapply the rule to the entire parameter cube after every pixel.
    /// This re-blanks not-yet-fit pixels each iteration; kept as the
    /// default because downstream behavior depends on it.
    SweepWide,
    /// Blank only the just-written pixel column.
    PerPixel,
}

/// Options for one [`SpectralCube::fiteach`] sweep.
#[derive(Debug, Clone)]
pub struct FitEachOptions {
    pub kind: ModelKind,
    /// Initial guess reused unmodified for every pixel unless
    /// `use_moment_cube` supplies a per-pixel guess.
    pub guesses: Vec<f64>,
    /// One error spectrum shared by every pixel.
    pub errspec: Option<Array1<f32>>,
    /// Per-pixel noise map, broadcast across the spectral axis.
    pub errmap: Option<Array2<f32>>,
    /// Pixels whose max S/N falls below this are skipped (left zero).
    /// Zero disables the cut.
    pub signal_cut: f32,
    /// Take each pixel's guess from the moment cube.
    pub use_moment_cube: bool,
    pub blank_value: f32,
    pub blanking: BlankingMode,
    /// Also fill the integral map.
    pub integral: bool,
    /// Numeric model integration instead of the analytic form.
    pub direct_integral: bool,
    pub on_error: FailurePolicy,
    /// Fan the sweep out over rayon workers. Output is identical to the
    /// sequential sweep.
    pub parallel: bool,
    /// Checked between pixels; setting it stops the sweep with
    /// [`Error::Cancelled`]. Already-written pixels stay valid.
    pub cancel: Option<Arc<AtomicBool>>,
    /// 0 silences progress; higher levels report more often.
    pub verbose_level: u8,
    /// Forwarded verbatim to the engine.
    pub fit: FitOptions,
}

impl Default for FitEachOptions {
    fn default() -> Self {
        FitEachOptions {
            kind: ModelKind::Gaussian,
            guesses: Vec::new(),
            errspec: None,
            errmap: None,
            signal_cut: 3.0,
            use_moment_cube: false,
            blank_value: 0.0,
            blanking: BlankingMode::SweepWide,
            integral: true,
            direct_integral: false,
            on_error: FailurePolicy::Abort,
            parallel: false,
            cancel: None,
            verbose_level: 1,
            fit: FitOptions::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct FitFailure {
    pub x: usize,
    pub y: usize,
    pub message: String,
}

/// Outcome counts of one sweep.
#[derive(Debug, Clone, Default, Serialize)]
pub struct FitSweepReport {
    pub fitted: usize,
    pub skipped: usize,
    pub failures: Vec<FitFailure>,
    pub elapsed_ms: u64,
}

/// A 3-D spectral cube `(nchan, ny, nx)` plus the products derived from it.
///
/// The cube owns its parameter/error/integral/moment outputs; per-pixel
/// spectra are transient values built on demand.
#[derive(Debug, Clone)]
pub struct SpectralCube {
    pub cube: Array3<f32>,
    pub xarr: SpectralAxis,
    pub header: FitsHeader,
    pub wcs: Option<CelestialWcs>,
    pub plane: Option<Plane>,
    pub parcube: Option<Array3<f32>>,
    pub errcube: Option<Array3<f32>>,
    pub integralmap: Option<Array2<f32>>,
    pub momentcube: Option<Array3<f32>>,
}

impl SpectralCube {
    pub fn new(cube: Array3<f32>, xarr: SpectralAxis) -> Result<Self> {
        if cube.dim().0 != xarr.len() {
            return Err(Error::shape(format!(
                "cube has {} channels, axis has {}",
                cube.dim().0,
                xarr.len()
            )));
        }
        Ok(SpectralCube {
            cube,
            xarr,
            header: FitsHeader::default(),
            wcs: None,
            plane: None,
            parcube: None,
            errcube: None,
            integralmap: None,
            momentcube: None,
        })
    }

    /// Load a cube from FITS. The spectral axis comes from the header; a
    /// celestial WCS is attached when the spatial cards allow it.
    pub fn from_fits(path: &Path) -> Result<Self> {
        let (cube, header) = io::read_cube(path)?;
        let xarr = SpectralAxis::from_header(&header)?;
        let wcs = CelestialWcs::from_header(&header).ok();
        let mut out = SpectralCube::new(cube, xarr)?;
        out.header = header;
        out.wcs = wcs;
        Ok(out)
    }

    pub fn spatial_dim(&self) -> (usize, usize) {
        let (_, ny, nx) = self.cube.dim();
        (ny, nx)
    }

    pub fn n_chan(&self) -> usize {
        self.cube.dim().0
    }

    /// The spectrum at spatial pixel (x, y), with an axis copy.
    pub fn get_spectrum(&self, x: usize, y: usize) -> Result<Spectrum> {
        let (ny, nx) = self.spatial_dim();
        if x >= nx || y >= ny {
            return Err(Error::shape(format!(
                "pixel ({}, {}) outside the {}x{} spatial grid",
                x, y, nx, ny
            )));
        }
        Ok(pixel_spectrum(&self.cube, &self.xarr, x, y))
    }

    /// Reduce an aperture to a spectrum carrying an axis copy.
    pub fn get_apspec(&self, aperture: &Aperture, reduce: Reduce) -> Result<Spectrum> {
        let data = extract_aperture(&self.cube, aperture, reduce, self.wcs.as_ref())?;
        Spectrum::new(self.xarr.clone(), data)
    }

    /// Collapse the spectral axis into the gating plane.
    pub fn collapse_plane(
        &mut self,
        mode: Collapse,
        channels: Option<(usize, usize)>,
    ) -> Result<()> {
        self.plane = Some(collapse(&self.cube, mode, channels)?);
        Ok(())
    }

    /// Install an externally built plane; its shape must match the cube.
    pub fn set_plane(&mut self, plane: Plane) -> Result<()> {
        if plane.dim() != self.spatial_dim() {
            return Err(Error::shape(format!(
                "plane {:?} does not match cube spatial {:?}",
                plane.dim(),
                self.spatial_dim()
            )));
        }
        self.plane = Some(plane);
        Ok(())
    }

    /// Fit a model to every valid pixel, filling the parameter, error, and
    /// (optionally) integral products.
    ///
    /// Products are allocated fresh and attached to the cube before the
    /// sweep starts, so a sweep stopped by a failure or cancellation leaves
    /// every already-written pixel in place.
    pub fn fiteach(
        &mut self,
        engine: &dyn FitEngine,
        opts: &FitEachOptions,
    ) -> Result<FitSweepReport> {
        let plane = self.plane.as_ref().ok_or(Error::MissingPlane)?;
        let (nchan, ny, nx) = self.cube.dim();
        if plane.dim() != (ny, nx) {
            return Err(Error::shape(format!(
                "plane {:?} does not match cube spatial ({}, {})",
                plane.dim(),
                ny,
                nx
            )));
        }
        if let Some(errspec) = &opts.errspec {
            if errspec.len() != nchan {
                return Err(Error::shape(format!(
                    "error spectrum has {} channels, cube has {}",
                    errspec.len(),
                    nchan
                )));
            }
        }
        if let Some(errmap) = &opts.errmap {
            if errmap.dim() != (ny, nx) {
                return Err(Error::shape(format!(
                    "error map {:?} does not match cube spatial ({}, {})",
                    errmap.dim(),
                    ny,
                    nx
                )));
            }
        }
        if opts.use_moment_cube && self.momentcube.is_none() {
            return Err(Error::MissingMomentCube);
        }

        let valid = plane.valid_pixels();
        let npars = if opts.use_moment_cube {
            self.momentcube.as_ref().map(|m| m.dim().0).unwrap_or(0)
        } else {
            opts.guesses.len()
        };

        let mut parcube = Array3::<f32>::zeros((npars, ny, nx));
        let mut errcube = Array3::<f32>::zeros((npars, ny, nx));
        let mut integralmap = opts.integral.then(|| Array2::<f32>::zeros((ny, nx)));

        let cube = &self.cube;
        let xarr = &self.xarr;
        let momentcube = self.momentcube.as_ref();
        let channel_width = xarr.channel_width();

        let result = if opts.parallel {
            sweep_parallel(
                cube,
                xarr,
                momentcube,
                channel_width,
                &valid,
                npars,
                engine,
                opts,
                &mut parcube,
                &mut errcube,
                integralmap.as_mut(),
            )
        } else {
            sweep_sequential(
                cube,
                xarr,
                momentcube,
                channel_width,
                &valid,
                npars,
                engine,
                opts,
                &mut parcube,
                &mut errcube,
                integralmap.as_mut(),
            )
        };

        // Keep partial products observable even when the sweep errored.
        self.parcube = Some(parcube);
        self.errcube = Some(errcube);
        self.integralmap = integralmap;
        result
    }

    /// Compute moments for every valid pixel into the moment cube. The
    /// moment count is probed on the first valid pixel; any later pixel
    /// disagreeing is a hard error rather than silent corruption.
    pub fn momenteach(&mut self, verbose_level: u8) -> Result<()> {
        let plane = self.plane.as_ref().ok_or(Error::MissingPlane)?;
        let (_, ny, nx) = self.cube.dim();
        if plane.dim() != (ny, nx) {
            return Err(Error::shape(format!(
                "plane {:?} does not match cube spatial ({}, {})",
                plane.dim(),
                ny,
                nx
            )));
        }

        let valid = plane.valid_pixels();
        let nmom = match valid.first() {
            Some(&(x0, y0)) => pixel_spectrum(&self.cube, &self.xarr, x0, y0)
                .moments()
                .len(),
            None => crate::domain::spectrum::N_MOMENTS,
        };

        let mut momentcube = Array3::<f32>::zeros((nmom, ny, nx));
        let t0 = Instant::now();
        let modulus = progress_modulus(verbose_level);

        for (ii, &(x, y)) in valid.iter().enumerate() {
            let m = pixel_spectrum(&self.cube, &self.xarr, x, y).moments();
            if m.len() != nmom {
                return Err(Error::MomentShape {
                    x,
                    y,
                    got: m.len(),
                    expected: nmom,
                });
            }
            for (k, &v) in m.iter().enumerate() {
                momentcube[[k, y, x]] = v as f32;
            }
            if verbose_level > 0 && ii % modulus == 0 {
                log::info!(
                    "finished moment {} of {} ({:.1} s elapsed)",
                    ii,
                    valid.len(),
                    t0.elapsed().as_secs_f64()
                );
            }
        }
        if verbose_level > 0 {
            log::info!(
                "finished final moment {} ({:.1} s elapsed)",
                valid.len(),
                t0.elapsed().as_secs_f64()
            );
        }
        self.momentcube = Some(momentcube);
        Ok(())
    }
}

fn pixel_spectrum(cube: &Array3<f32>, xarr: &SpectralAxis, x: usize, y: usize) -> Spectrum {
    Spectrum {
        xarr: xarr.clone(),
        data: cube.slice(s![.., y, x]).to_owned(),
        error: None,
        fit: None,
    }
}

fn progress_modulus(verbose_level: u8) -> usize {
    10usize.pow(3u32.saturating_sub(verbose_level as u32))
}

fn pixel_guesses(
    momentcube: Option<&Array3<f32>>,
    opts: &FitEachOptions,
    x: usize,
    y: usize,
) -> Vec<f64> {
    match (opts.use_moment_cube, momentcube) {
        (true, Some(m)) => m.slice(s![.., y, x]).iter().map(|&v| v as f64).collect(),
        _ => opts.guesses.clone(),
    }
}

fn assign_error(sp: &mut Spectrum, opts: &FitEachOptions, x: usize, y: usize) {
    if let Some(errspec) = &opts.errspec {
        sp.error = Some(errspec.clone());
    } else if let Some(errmap) = &opts.errmap {
        sp.error = Some(Array1::from_elem(sp.len(), errmap[[y, x]]));
    }
}

/// Below-threshold (or indeterminate) S/N means the pixel is skipped.
fn below_signal_cut(sp: &Spectrum, signal_cut: f32) -> bool {
    if sp.error.is_none() || signal_cut <= 0.0 {
        return false;
    }
    match sp.max_snr() {
        Some(snr) => snr < signal_cut,
        None => true,
    }
}

fn write_pixel(
    parcube: &mut Array3<f32>,
    errcube: &mut Array3<f32>,
    integralmap: Option<&mut Array2<f32>>,
    x: usize,
    y: usize,
    params: &[f64],
    errors: &[f64],
    integral: Option<f64>,
) {
    for (k, &v) in params.iter().enumerate() {
        parcube[[k, y, x]] = v as f32;
    }
    for (k, &v) in errors.iter().enumerate() {
        errcube[[k, y, x]] = v as f32;
    }
    if let (Some(map), Some(value)) = (integralmap, integral) {
        map[[y, x]] = value as f32;
    }
}

fn blank_cube_wide(parcube: &mut Array3<f32>, errcube: &mut Array3<f32>, blank: f32) {
    ndarray::Zip::from(parcube).and(errcube).for_each(|p, e| {
        if *p == 0.0 {
            *e = blank;
            *p = blank;
        }
    });
}

fn blank_pixel(
    parcube: &mut Array3<f32>,
    errcube: &mut Array3<f32>,
    blank: f32,
    x: usize,
    y: usize,
) {
    let mut pars = parcube.slice_mut(s![.., y, x]);
    let mut errs = errcube.slice_mut(s![.., y, x]);
    for (p, e) in pars.iter_mut().zip(errs.iter_mut()) {
        if *p == 0.0 {
            *e = blank;
            *p = blank;
        }
    }
}

#[allow(clippy::too_many_arguments)]
fn sweep_sequential(
    cube: &Array3<f32>,
    xarr: &SpectralAxis,
    momentcube: Option<&Array3<f32>>,
    channel_width: f64,
    valid: &[(usize, usize)],
    npars: usize,
    engine: &dyn FitEngine,
    opts: &FitEachOptions,
    parcube: &mut Array3<f32>,
    errcube: &mut Array3<f32>,
    mut integralmap: Option<&mut Array2<f32>>,
) -> Result<FitSweepReport> {
    let t0 = Instant::now();
    let modulus = progress_modulus(opts.verbose_level);
    let mut report = FitSweepReport::default();

    for (ii, &(x, y)) in valid.iter().enumerate() {
        if let Some(cancel) = &opts.cancel {
            if cancel.load(Ordering::Relaxed) {
                report.elapsed_ms = t0.elapsed().as_millis() as u64;
                return Err(Error::Cancelled { completed: ii });
            }
        }

        let mut sp = pixel_spectrum(cube, xarr, x, y);
        assign_error(&mut sp, opts, x, y);
        if below_signal_cut(&sp, opts.signal_cut) {
            report.skipped += 1;
            if opts.verbose_level > 1 {
                log::debug!("skipped ({}, {}): below signal cut", x, y);
            }
            continue;
        }

        if npars > 0 {
            let guesses = pixel_guesses(momentcube, opts, x, y);
            match engine.fit(
                &sp.xarr,
                &sp.data,
                sp.error.as_ref(),
                &opts.kind,
                &guesses,
                &opts.fit,
            ) {
                Ok(res) => {
                    if res.params.len() != npars || res.errors.len() != npars {
                        return Err(Error::shape(format!(
                            "engine returned {} parameters at ({}, {}), expected {}",
                            res.params.len(),
                            x,
                            y,
                            npars
                        )));
                    }
                    let integral = opts
                        .integral
                        .then(|| res.integral(channel_width, opts.direct_integral));
                    write_pixel(
                        parcube,
                        errcube,
                        integralmap.as_deref_mut(),
                        x,
                        y,
                        &res.params,
                        &res.errors,
                        integral,
                    );
                    report.fitted += 1;
                }
                Err(source) => match opts.on_error {
                    FailurePolicy::Abort => {
                        report.elapsed_ms = t0.elapsed().as_millis() as u64;
                        return Err(Error::FitFailed { x, y, source });
                    }
                    FailurePolicy::Continue => {
                        log::warn!("fit failed at ({}, {}): {:#}", x, y, source);
                        report.failures.push(FitFailure {
                            x,
                            y,
                            message: format!("{:#}", source),
                        });
                    }
                },
            }
        }

        if opts.blank_value != 0.0 {
            match opts.blanking {
                BlankingMode::SweepWide => {
                    blank_cube_wide(parcube, errcube, opts.blank_value)
                }
                BlankingMode::PerPixel => {
                    blank_pixel(parcube, errcube, opts.blank_value, x, y)
                }
            }
        }

        if opts.verbose_level > 0 && ii % modulus == 0 {
            log::info!(
                "finished fit {} of {} ({:.1} s elapsed)",
                ii,
                valid.len(),
                t0.elapsed().as_secs_f64()
            );
        }
    }

    if opts.verbose_level > 0 {
        log::info!(
            "finished final fit {} ({:.1} s elapsed)",
            valid.len(),
            t0.elapsed().as_secs_f64()
        );
    }
    report.elapsed_ms = t0.elapsed().as_millis() as u64;
    Ok(report)
}

enum PixelOutcome {
    Fitted {
        params: Vec<f64>,
        errors: Vec<f64>,
        integral: Option<f64>,
    },
    NoFit,
    Skipped,
    Failed(anyhow::Error),
    Cancelled,
}

/// Parallel sweep. Fits run on rayon workers; writeback happens in pixel
/// order afterwards, so the products match the sequential sweep exactly.
#[allow(clippy::too_many_arguments)]
fn sweep_parallel(
    cube: &Array3<f32>,
    xarr: &SpectralAxis,
    momentcube: Option<&Array3<f32>>,
    channel_width: f64,
    valid: &[(usize, usize)],
    npars: usize,
    engine: &dyn FitEngine,
    opts: &FitEachOptions,
    parcube: &mut Array3<f32>,
    errcube: &mut Array3<f32>,
    mut integralmap: Option<&mut Array2<f32>>,
) -> Result<FitSweepReport> {
    let t0 = Instant::now();
    let modulus = progress_modulus(opts.verbose_level);
    let counter = AtomicUsize::new(0);

    let outcomes: Vec<PixelOutcome> = valid
        .par_iter()
        .map(|&(x, y)| {
            if let Some(cancel) = &opts.cancel {
                if cancel.load(Ordering::Relaxed) {
                    return PixelOutcome::Cancelled;
                }
            }

            let mut sp = pixel_spectrum(cube, xarr, x, y);
            assign_error(&mut sp, opts, x, y);
            if below_signal_cut(&sp, opts.signal_cut) {
                return PixelOutcome::Skipped;
            }
            if npars == 0 {
                return PixelOutcome::NoFit;
            }

            let guesses = pixel_guesses(momentcube, opts, x, y);
            let outcome = match engine.fit(
                &sp.xarr,
                &sp.data,
                sp.error.as_ref(),
                &opts.kind,
                &guesses,
                &opts.fit,
            ) {
                Ok(res) => PixelOutcome::Fitted {
                    integral: opts
                        .integral
                        .then(|| res.integral(channel_width, opts.direct_integral)),
                    params: res.params,
                    errors: res.errors,
                },
                Err(source) => PixelOutcome::Failed(source),
            };

            let done = counter.fetch_add(1, Ordering::Relaxed);
            if opts.verbose_level > 0 && done % modulus == 0 {
                log::info!(
                    "finished fit {} of {} ({:.1} s elapsed)",
                    done,
                    valid.len(),
                    t0.elapsed().as_secs_f64()
                );
            }
            outcome
        })
        .collect();

    let mut report = FitSweepReport::default();
    for (&(x, y), outcome) in valid.iter().zip(outcomes) {
        match outcome {
            PixelOutcome::Fitted {
                params,
                errors,
                integral,
            } => {
                if params.len() != npars || errors.len() != npars {
                    return Err(Error::shape(format!(
                        "engine returned {} parameters at ({}, {}), expected {}",
                        params.len(),
                        x,
                        y,
                        npars
                    )));
                }
                write_pixel(
                    parcube,
                    errcube,
                    integralmap.as_deref_mut(),
                    x,
                    y,
                    &params,
                    &errors,
                    integral,
                );
                report.fitted += 1;
                if opts.blank_value != 0.0 && opts.blanking == BlankingMode::PerPixel {
                    blank_pixel(parcube, errcube, opts.blank_value, x, y);
                }
            }
            PixelOutcome::NoFit => {}
            PixelOutcome::Skipped => report.skipped += 1,
            PixelOutcome::Failed(source) => match opts.on_error {
                FailurePolicy::Abort => {
                    // Pixels after the failing one stay zero, matching the
                    // sequential abort.
                    finish_blanking(parcube, errcube, opts, report.fitted);
                    report.elapsed_ms = t0.elapsed().as_millis() as u64;
                    return Err(Error::FitFailed { x, y, source });
                }
                FailurePolicy::Continue => {
                    log::warn!("fit failed at ({}, {}): {:#}", x, y, source);
                    report.failures.push(FitFailure {
                        x,
                        y,
                        message: format!("{:#}", source),
                    });
                }
            },
            PixelOutcome::Cancelled => {
                finish_blanking(parcube, errcube, opts, report.fitted);
                report.elapsed_ms = t0.elapsed().as_millis() as u64;
                return Err(Error::Cancelled {
                    completed: report.fitted + report.skipped,
                });
            }
        }
    }

    finish_blanking(parcube, errcube, opts, report.fitted);
    if opts.verbose_level > 0 {
        log::info!(
            "finished final fit {} ({:.1} s elapsed)",
            valid.len(),
            t0.elapsed().as_secs_f64()
        );
    }
    report.elapsed_ms = t0.elapsed().as_millis() as u64;
    Ok(report)
}

/// The sweep-wide rule converges to a single cube-wide pass once all
/// writes have happened; it only ever fires after at least one fit, which
/// the sequential sweep also guarantees.
fn finish_blanking(
    parcube: &mut Array3<f32>,
    errcube: &mut Array3<f32>,
    opts: &FitEachOptions,
    fitted: usize,
) {
    if opts.blank_value != 0.0 && opts.blanking == BlankingMode::SweepWide && fitted > 0 {
        blank_cube_wide(parcube, errcube, opts.blank_value);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::axis::SpectralUnit;
    use crate::fit::FitResult;
    use std::sync::atomic::AtomicUsize;

    /// Deterministic engine: echoes the guesses as fit parameters with a
    /// tenth of each as its error, and counts invocations.
    struct EchoEngine {
        calls: AtomicUsize,
    }

    impl EchoEngine {
        fn new() -> Self {
            EchoEngine {
                calls: AtomicUsize::new(0),
            }
        }
    }

    impl FitEngine for EchoEngine {
        fn fit(
            &self,
            xarr: &SpectralAxis,
            data: &Array1<f32>,
            _error: Option<&Array1<f32>>,
            kind: &ModelKind,
            guesses: &[f64],
            options: &FitOptions,
        ) -> anyhow::Result<FitResult> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            let model = kind.evaluate(xarr, guesses, options.thin)?;
            let residuals = data - &model;
            Ok(FitResult {
                kind: kind.clone(),
                params: guesses.to_vec(),
                errors: guesses.iter().map(|g| g * 0.1).collect(),
                errspec: Array1::from_elem(data.len(), 1.0),
                npeaks: kind.npeaks(guesses),
                model,
                residuals,
            })
        }
    }

    /// Engine that fails for the spectrum whose peak matches a chosen value.
    struct FailingEngine {
        fail_when_peak_is: f32,
    }

    impl FitEngine for FailingEngine {
        fn fit(
            &self,
            xarr: &SpectralAxis,
            data: &Array1<f32>,
            _error: Option<&Array1<f32>>,
            kind: &ModelKind,
            guesses: &[f64],
            _options: &FitOptions,
        ) -> anyhow::Result<FitResult> {
            let peak = data.iter().cloned().fold(f32::MIN, f32::max);
            if (peak - self.fail_when_peak_is).abs() < 1e-6 {
                anyhow::bail!("singular curvature matrix");
            }
            let model = Array1::zeros(xarr.len());
            Ok(FitResult {
                kind: kind.clone(),
                params: guesses.to_vec(),
                errors: vec![0.0; guesses.len()],
                residuals: data.clone(),
                errspec: Array1::from_elem(data.len(), 1.0),
                npeaks: 1,
                model,
            })
        }
    }

    fn test_cube() -> SpectralCube {
        // 3x3 spatial grid, 32 channels, a Gaussian line everywhere with
        // pixel-dependent amplitude so spectra differ.
        let axis = SpectralAxis::new(
            Array1::linspace(-15.0, 15.0, 32),
            SpectralUnit::KmPerS,
        );
        let cube = Array3::from_shape_fn((32, 3, 3), |(z, y, x)| {
            let amp = 1.0 + (y * 3 + x) as f64;
            let v = axis.values()[z];
            (amp * (-v * v / 8.0).exp()) as f32
        });
        let mut sc = SpectralCube::new(cube, axis).unwrap();
        sc.collapse_plane(Collapse::Mean, None).unwrap();
        sc
    }

    fn base_opts(guesses: Vec<f64>) -> FitEachOptions {
        FitEachOptions {
            guesses,
            signal_cut: 0.0,
            verbose_level: 0,
            ..Default::default()
        }
    }

    #[test]
    fn test_fiteach_requires_plane() {
        let axis = SpectralAxis::new(Array1::linspace(0.0, 1.0, 4), SpectralUnit::KmPerS);
        let mut sc = SpectralCube::new(Array3::zeros((4, 2, 2)), axis).unwrap();
        let engine = EchoEngine::new();
        assert!(matches!(
            sc.fiteach(&engine, &base_opts(vec![1.0])),
            Err(Error::MissingPlane)
        ));
    }

    #[test]
    fn test_fiteach_fills_all_valid_pixels() {
        let mut sc = test_cube();
        let engine = EchoEngine::new();
        let report = sc
            .fiteach(&engine, &base_opts(vec![2.0, 0.0, 1.5]))
            .unwrap();
        assert_eq!(report.fitted, 9);
        assert_eq!(report.skipped, 0);

        let parcube = sc.parcube.as_ref().unwrap();
        assert_eq!(parcube.dim(), (3, 3, 3));
        for y in 0..3 {
            for x in 0..3 {
                assert!((parcube[[0, y, x]] - 2.0).abs() < 1e-6);
                assert!((parcube[[2, y, x]] - 1.5).abs() < 1e-6);
            }
        }
        let errcube = sc.errcube.as_ref().unwrap();
        assert!((errcube[[0, 0, 0]] - 0.2).abs() < 1e-6);
        // Analytic Gaussian integral: amp * width * sqrt(2 pi).
        let im = sc.integralmap.as_ref().unwrap();
        let expected = 2.0 * 1.5 * (2.0 * std::f64::consts::PI).sqrt();
        assert!((im[[1, 1]] as f64 - expected).abs() < 1e-4);
    }

    #[test]
    fn test_fiteach_is_idempotent() {
        let mut sc = test_cube();
        let engine = EchoEngine::new();
        let opts = base_opts(vec![1.0, 0.0, 2.0]);
        sc.fiteach(&engine, &opts).unwrap();
        let first = sc.parcube.clone().unwrap();
        sc.fiteach(&engine, &opts).unwrap();
        assert_eq!(sc.parcube.as_ref().unwrap(), &first);
    }

    #[test]
    fn test_signal_cut_skips_and_leaves_zero() {
        let mut sc = test_cube();
        // Noise high enough that only bright pixels pass: amplitude at
        // (x, y) is 1 + 3y + x, S/N threshold of 5 with sigma 1.
        let errmap = Array2::from_elem((3, 3), 1.0f32);
        let engine = EchoEngine::new();
        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.errmap = Some(errmap);
        opts.signal_cut = 5.0;
        let report = sc.fiteach(&engine, &opts).unwrap();

        assert!(report.skipped > 0);
        assert_eq!(report.fitted + report.skipped, 9);
        let parcube = sc.parcube.as_ref().unwrap();
        let errcube = sc.errcube.as_ref().unwrap();
        // Pixel (0, 0) has amplitude 1, below the cut; all entries zero.
        for k in 0..3 {
            assert_eq!(parcube[[k, 0, 0]], 0.0);
            assert_eq!(errcube[[k, 0, 0]], 0.0);
        }
        // Pixel (2, 2) has amplitude 9, above the cut.
        assert!(parcube[[0, 2, 2]] != 0.0);
    }

    #[test]
    fn test_zero_length_guesses_never_invoke_engine() {
        let axis = SpectralAxis::new(Array1::from_vec(vec![0.0]), SpectralUnit::KmPerS);
        let cube = Array3::from_elem((1, 3, 3), 1.0f32);
        let mut sc = SpectralCube::new(cube, axis).unwrap();
        sc.collapse_plane(Collapse::Mean, None).unwrap();

        let engine = EchoEngine::new();
        let report = sc.fiteach(&engine, &base_opts(vec![])).unwrap();
        assert_eq!(engine.calls.load(Ordering::Relaxed), 0);
        assert_eq!(report.fitted, 0);
        assert_eq!(sc.parcube.as_ref().unwrap().dim(), (0, 3, 3));
        assert_eq!(sc.errcube.as_ref().unwrap().dim(), (0, 3, 3));
    }

    #[test]
    fn test_moment_cube_supplies_guesses() {
        let mut sc = test_cube();
        sc.momenteach(0).unwrap();
        let momentcube = sc.momentcube.clone().unwrap();

        let engine = EchoEngine::new();
        let mut opts = base_opts(vec![]);
        opts.use_moment_cube = true;
        sc.fiteach(&engine, &opts).unwrap();

        let parcube = sc.parcube.as_ref().unwrap();
        assert_eq!(parcube.dim().0, momentcube.dim().0);
        // Echo engine returns the guesses, so parcube == momentcube.
        for ((k, y, x), &v) in momentcube.indexed_iter() {
            assert!((parcube[[k, y, x]] - v).abs() < 1e-5);
        }
    }

    #[test]
    fn test_fiteach_without_moment_cube_errors() {
        let mut sc = test_cube();
        let engine = EchoEngine::new();
        let mut opts = base_opts(vec![]);
        opts.use_moment_cube = true;
        assert!(matches!(
            sc.fiteach(&engine, &opts),
            Err(Error::MissingMomentCube)
        ));
    }

    #[test]
    fn test_blanking_sweep_wide_covers_invalid_pixels() {
        let mut sc = test_cube();
        // Mask out one pixel; its column stays zero and is then blanked.
        let plane = sc.plane.clone().unwrap();
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[1, 1]] = true;
        sc.set_plane(Plane::with_mask(plane.data, mask).unwrap())
            .unwrap();

        let engine = EchoEngine::new();
        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.blank_value = -999.0;
        sc.fiteach(&engine, &opts).unwrap();

        let parcube = sc.parcube.as_ref().unwrap();
        for k in 0..3 {
            assert_eq!(parcube[[k, 1, 1]], -999.0);
        }
        assert!((parcube[[0, 0, 0]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_blanking_per_pixel_leaves_unfit_pixels_alone() {
        let mut sc = test_cube();
        let plane = sc.plane.clone().unwrap();
        let mut mask = Array2::from_elem((3, 3), false);
        mask[[1, 1]] = true;
        sc.set_plane(Plane::with_mask(plane.data, mask).unwrap())
            .unwrap();

        let engine = EchoEngine::new();
        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.blank_value = -999.0;
        opts.blanking = BlankingMode::PerPixel;
        sc.fiteach(&engine, &opts).unwrap();

        let parcube = sc.parcube.as_ref().unwrap();
        for k in 0..3 {
            assert_eq!(parcube[[k, 1, 1]], 0.0);
        }
    }

    #[test]
    fn test_abort_policy_keeps_partial_results() {
        let mut sc = test_cube();
        // The spectrum at (x=1, y=1) is the only one peaking at amplitude 5.
        let target = sc
            .cube
            .slice(s![.., 1, 1])
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        let engine = FailingEngine {
            fail_when_peak_is: target,
        };
        let err = sc
            .fiteach(&engine, &base_opts(vec![1.0, 0.0, 2.0]))
            .unwrap_err();
        assert!(matches!(err, Error::FitFailed { x: 1, y: 1, .. }));

        // Pixels before (1, 1) in row-major order were written.
        let parcube = sc.parcube.as_ref().unwrap();
        assert!((parcube[[0, 0, 2]] - 1.0).abs() < 1e-6);
        // Pixels after it were not.
        assert_eq!(parcube[[0, 2, 2]], 0.0);
    }

    #[test]
    fn test_continue_policy_records_failures() {
        let mut sc = test_cube();
        let target = sc
            .cube
            .slice(s![.., 1, 1])
            .iter()
            .cloned()
            .fold(f32::MIN, f32::max);
        let engine = FailingEngine {
            fail_when_peak_is: target,
        };
        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.on_error = FailurePolicy::Continue;
        let report = sc.fiteach(&engine, &opts).unwrap();

        assert_eq!(report.fitted, 8);
        assert_eq!(report.failures.len(), 1);
        assert_eq!((report.failures[0].x, report.failures[0].y), (1, 1));
        assert!(report.failures[0].message.contains("singular"));
        // The sweep reached the last pixel.
        assert!((sc.parcube.as_ref().unwrap()[[0, 2, 2]] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cancellation_before_first_pixel() {
        let mut sc = test_cube();
        let engine = EchoEngine::new();
        let cancel = Arc::new(AtomicBool::new(true));
        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.cancel = Some(cancel);
        assert!(matches!(
            sc.fiteach(&engine, &opts),
            Err(Error::Cancelled { completed: 0 })
        ));
        // Products were still allocated.
        assert_eq!(sc.parcube.as_ref().unwrap().dim(), (3, 3, 3));
    }

    #[test]
    fn test_parallel_matches_sequential() {
        let mut seq = test_cube();
        let mut par = test_cube();
        let engine = EchoEngine::new();

        let mut opts = base_opts(vec![1.0, 0.0, 2.0]);
        opts.blank_value = -1.0;
        seq.fiteach(&engine, &opts).unwrap();
        opts.parallel = true;
        par.fiteach(&engine, &opts).unwrap();

        assert_eq!(seq.parcube, par.parcube);
        assert_eq!(seq.errcube, par.errcube);
        assert_eq!(seq.integralmap, par.integralmap);
    }

    #[test]
    fn test_momenteach_populates_cube() {
        let mut sc = test_cube();
        sc.momenteach(0).unwrap();
        let momentcube = sc.momentcube.as_ref().unwrap();
        assert_eq!(momentcube.dim(), (3, 3, 3));

        let sp = sc.get_spectrum(2, 1).unwrap();
        let m = sp.moments();
        for k in 0..3 {
            assert!((momentcube[[k, 1, 2]] as f64 - m[k]).abs() < 1e-5);
        }
        // Centroid of the synthetic line sits at 0 km/s.
        assert!(momentcube[[1, 1, 1]].abs() < 0.5);
    }

    #[test]
    fn test_get_spectrum_bounds() {
        let sc = test_cube();
        assert!(sc.get_spectrum(3, 0).is_err());
        let sp = sc.get_spectrum(0, 0).unwrap();
        assert_eq!(sp.len(), 32);
    }

    #[test]
    fn test_from_fits_roundtrip() {
        let cube = Array3::from_shape_fn((8, 2, 2), |(z, y, x)| (z + y + x) as f32);
        let tmp = tempfile::NamedTempFile::new().unwrap();
        let opts = io::WriteOptions {
            extra_cards: vec![
                ("CRVAL3".into(), "-10.0".into()),
                ("CDELT3".into(), "2.5".into()),
                ("CUNIT3".into(), "km/s".into()),
            ],
            ..Default::default()
        };
        io::write_cube(&cube, tmp.path(), None, &opts).unwrap();

        let sc = SpectralCube::from_fits(tmp.path()).unwrap();
        assert_eq!(sc.cube.dim(), (8, 2, 2));
        assert_eq!(sc.xarr.len(), 8);
        assert_eq!(sc.xarr.unit(), SpectralUnit::KmPerS);
        assert!((sc.xarr.values()[0] + 10.0).abs() < 1e-9);
        assert!((sc.xarr.channel_width() - 2.5).abs() < 1e-9);
        assert!((sc.cube[[3, 1, 0]] - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_get_apspec_mean() {
        let axis = SpectralAxis::new(Array1::linspace(0.0, 3.0, 4), SpectralUnit::KmPerS);
        let cube = Array3::from_elem((4, 5, 5), 2.5f32);
        let sc = SpectralCube::new(cube, axis).unwrap();
        let sp = sc
            .get_apspec(&Aperture::circle(2.0, 2.0, 1.5), Reduce::Mean)
            .unwrap();
        assert_eq!(sp.len(), 4);
        for &v in sp.data.iter() {
            assert_eq!(v, 2.5);
        }
    }
}
