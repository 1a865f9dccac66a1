use ndarray::{Array2, Array3, Axis};
use rayon::prelude::*;

use crate::error::{Error, Result};

/// The 2-D reference image gating the per-pixel sweeps. A pixel is valid
/// iff it is unmasked and its plane value is finite.
#[derive(Debug, Clone)]
pub struct Plane {
    pub data: Array2<f32>,
    /// `true` marks a pixel as excluded.
    pub mask: Option<Array2<bool>>,
}

impl Plane {
    pub fn new(data: Array2<f32>) -> Self {
        Plane { data, mask: None }
    }

    pub fn with_mask(data: Array2<f32>, mask: Array2<bool>) -> Result<Self> {
        if data.dim() != mask.dim() {
            return Err(Error::shape(format!(
                "mask {:?} does not match plane {:?}",
                mask.dim(),
                data.dim()
            )));
        }
        Ok(Plane {
            data,
            mask: Some(mask),
        })
    }

    pub fn dim(&self) -> (usize, usize) {
        self.data.dim()
    }

    pub fn is_valid(&self, x: usize, y: usize) -> bool {
        let masked = self
            .mask
            .as_ref()
            .is_some_and(|m| m[[y, x]]);
        !masked && self.data[[y, x]].is_finite()
    }

    /// Valid pixels as `(x, y)` pairs in deterministic row-major order
    /// (y outer, x inner).
    pub fn valid_pixels(&self) -> Vec<(usize, usize)> {
        let (ny, nx) = self.data.dim();
        let mut pixels = Vec::new();
        for y in 0..ny {
            for x in 0..nx {
                if self.is_valid(x, y) {
                    pixels.push((x, y));
                }
            }
        }
        pixels
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Collapse {
    Mean,
    Median,
    Sum,
}

/// Collapse the cube's spectral axis into a plane, optionally over an
/// inclusive channel range.
pub fn collapse(
    cube: &Array3<f32>,
    mode: Collapse,
    channels: Option<(usize, usize)>,
) -> Result<Plane> {
    let (nchan, ny, nx) = cube.dim();
    let (start, end) = match channels {
        Some((start, end)) => {
            if start > end || end >= nchan {
                return Err(Error::shape(format!(
                    "channel range {}..={} outside 0..{}",
                    start, end, nchan
                )));
            }
            (start, end)
        }
        None => (0, nchan.saturating_sub(1)),
    };
    if nchan == 0 {
        return Err(Error::shape("cannot collapse an empty spectral axis"));
    }
    let view = cube.slice(ndarray::s![start..=end, .., ..]);
    let depth = end - start + 1;

    let data = match mode {
        Collapse::Mean => view
            .mean_axis(Axis(0))
            .ok_or_else(|| Error::shape("cannot collapse an empty spectral axis"))?,
        Collapse::Sum => view.sum_axis(Axis(0)),
        Collapse::Median => {
            let values: Vec<f32> = (0..ny * nx)
                .into_par_iter()
                .map(|i| {
                    let y = i / nx;
                    let x = i % nx;
                    let mut column: Vec<f32> = (0..depth)
                        .map(|z| view[[z, y, x]])
                        .filter(|v| v.is_finite())
                        .collect();
                    if column.is_empty() {
                        return f32::NAN;
                    }
                    let mid = column.len() / 2;
                    column.select_nth_unstable_by(mid, |a, b| {
                        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                    });
                    column[mid]
                })
                .collect();
            Array2::from_shape_vec((ny, nx), values)
                .map_err(|e| Error::shape(e.to_string()))?
        }
    };

    Ok(Plane::new(data))
}
