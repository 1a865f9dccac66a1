//! speckit -- spectral-cube analysis toolkit.
//!
//! Loads 3-D FITS data cubes, extracts spectra and apertures, and drives an
//! external nonlinear fit engine over every valid pixel (or jointly over
//! several ammonia lines) to build parameter maps.

pub mod domain;
pub mod error;
pub mod fit;
pub mod io;
pub mod model;
pub mod nh3;
pub mod plot;

pub use domain::aperture::{extract_aperture, Aperture, ApertureShape, CoordFrame, Reduce};
pub use domain::axis::{SpectralAxis, SpectralUnit};
pub use domain::cube::{
    BlankingMode, FailurePolicy, FitEachOptions, FitFailure, FitSweepReport, SpectralCube,
};
pub use domain::plane::{collapse, Collapse, Plane};
pub use domain::spectrum::Spectrum;
pub use domain::wcs::CelestialWcs;
pub use error::{Error, Result};
pub use fit::ammonia::Nh3Line;
pub use fit::{FitEngine, FitOptions, FitResult, ModelKind};
pub use model::FitsHeader;
pub use nh3::{fit_line, fit_tkin, JointFit, LineSource, NoisePolicy, TkinFitOptions};
pub use plot::{panel_layout, render_lines, LayoutPolicy, PanelRenderer, PanelSlot};
