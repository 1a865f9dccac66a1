use thiserror::Error;

use crate::fit::ammonia::Nh3Line;

/// Errors surfaced by the toolkit's public API.
///
/// Per-pixel skip conditions (signal cut) are not errors; they are counted
/// in the sweep report instead.
#[derive(Debug, Error)]
pub enum Error {
    #[error("I/O error")]
    Io(#[from] std::io::Error),

    #[error("failed to read or write FITS data")]
    Fits(#[source] anyhow::Error),

    #[error("no image plane set; collapse the cube before sweeping")]
    MissingPlane,

    #[error("no moment cube available; run momenteach first")]
    MissingMomentCube,

    #[error("cannot convert spectral axis from {from} to {to}: {reason}")]
    UnitConversion {
        from: &'static str,
        to: &'static str,
        reason: &'static str,
    },

    #[error("aperture at ({x:.2}, {y:.2}) covers no pixel of the {nx}x{ny} spatial grid")]
    EmptyAperture { x: f64, y: f64, nx: usize, ny: usize },

    #[error("world-coordinate aperture requires a celestial WCS")]
    MissingWcs,

    #[error("shape mismatch: {0}")]
    Shape(String),

    #[error("moment vector has length {got} at pixel ({x}, {y}), expected {expected}")]
    MomentShape {
        x: usize,
        y: usize,
        got: usize,
        expected: usize,
    },

    #[error("fit failed at pixel ({x}, {y})")]
    FitFailed {
        x: usize,
        y: usize,
        #[source]
        source: anyhow::Error,
    },

    #[error("sweep cancelled after {completed} pixels")]
    Cancelled { completed: usize },

    #[error("line {0} not present in the input set")]
    MissingLine(Nh3Line),

    #[error("fit of line {line} failed")]
    LineFitFailed {
        line: Nh3Line,
        #[source]
        source: anyhow::Error,
    },

    #[error("panel layout is defined for 2 to 4 lines, got {0}")]
    PanelLayout(usize),

    #[error("the fixed panel table has no slot for line {line} in a {count}-line figure")]
    PanelSlotUnassigned { line: Nh3Line, count: usize },

    #[error("rendering failed")]
    Render(#[source] anyhow::Error),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

impl Error {
    /// Shorthand for shape-mismatch errors built from format arguments.
    pub(crate) fn shape(msg: impl Into<String>) -> Self {
        Error::Shape(msg.into())
    }
}
