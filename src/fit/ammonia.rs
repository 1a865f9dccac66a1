//! Ammonia (NH3) inversion-line model.
//!
//! Hyperfine structure is carried as a compact five-group approximation of
//! the full 18-component pattern: velocity offsets of the main group and the
//! inner/outer satellite pairs, with their summed relative intensities. The
//! brightness follows the usual slab form
//! `Tb = (J(Tex) - J(Tbg)) * (1 - exp(-tau))`, linearized when the
//! optically-thin flag is set.

use ndarray::Array1;
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Cosmic microwave background temperature [K].
const T_BACKGROUND: f64 = 2.7315;
/// h/k [K s].
const H_OVER_K: f64 = 4.799_243_073e-11;
/// Column density [cm^-2] per km/s of line width that produces unit total
/// optical depth at Tex = 1 K. Compact scaling constant for the slab model.
const TAU_COLUMN_SCALE: f64 = 1.0e14;

/// The metastable inversion transitions this toolkit recognizes. A closed
/// enum: line names outside this set cannot be constructed.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum Nh3Line {
    OneOne,
    TwoTwo,
    ThreeThree,
    FourFour,
}

impl Nh3Line {
    pub const ALL: [Nh3Line; 4] = [
        Nh3Line::OneOne,
        Nh3Line::TwoTwo,
        Nh3Line::ThreeThree,
        Nh3Line::FourFour,
    ];

    /// Rest frequency [Hz].
    pub fn rest_frequency(self) -> f64 {
        match self {
            Nh3Line::OneOne => 23.694_495_5e9,
            Nh3Line::TwoTwo => 23.722_633_6e9,
            Nh3Line::ThreeThree => 23.870_129_2e9,
            Nh3Line::FourFour => 24.139_416_9e9,
        }
    }

    /// Energy of the (J, J) level above the para ground state [K].
    fn energy_k(self) -> f64 {
        match self {
            Nh3Line::OneOne => 23.4,
            Nh3Line::TwoTwo => 64.9,
            Nh3Line::ThreeThree => 124.5,
            Nh3Line::FourFour => 201.1,
        }
    }

    /// Rotational degeneracy 2J + 1.
    fn degeneracy(self) -> f64 {
        match self {
            Nh3Line::OneOne => 3.0,
            Nh3Line::TwoTwo => 5.0,
            Nh3Line::ThreeThree => 7.0,
            Nh3Line::FourFour => 9.0,
        }
    }

    /// K divisible by 3 is ortho-NH3.
    pub fn is_ortho(self) -> bool {
        matches!(self, Nh3Line::ThreeThree)
    }

    /// `(velocity offset [km/s], relative intensity)` of the hyperfine
    /// groups; intensities sum to one per line.
    fn hyperfine_groups(self) -> &'static [(f64, f64)] {
        match self {
            Nh3Line::OneOne => &[
                (-19.55, 0.111),
                (-7.47, 0.139),
                (0.0, 0.500),
                (7.56, 0.139),
                (19.45, 0.111),
            ],
            Nh3Line::TwoTwo => &[
                (-25.9, 0.0369),
                (-16.4, 0.0651),
                (0.0, 0.796),
                (16.4, 0.0651),
                (25.9, 0.0369),
            ],
            Nh3Line::ThreeThree => &[
                (-29.1, 0.0178),
                (-21.3, 0.0357),
                (0.0, 0.893),
                (21.3, 0.0357),
                (29.1, 0.0178),
            ],
            Nh3Line::FourFour => &[
                (-30.5, 0.0143),
                (-24.2, 0.0186),
                (0.0, 0.934),
                (24.2, 0.0186),
                (30.5, 0.0143),
            ],
        }
    }
}

impl std::fmt::Display for Nh3Line {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Nh3Line::OneOne => "oneone",
            Nh3Line::TwoTwo => "twotwo",
            Nh3Line::ThreeThree => "threethree",
            Nh3Line::FourFour => "fourfour",
        };
        f.write_str(name)
    }
}

/// Ammonia parameter vectors are
/// `[tkin, tex, log10(column), width, vcenter, fortho]`.
pub const NH3_NPARS: usize = 6;

pub(crate) fn check_params(params: &[f64]) -> Result<()> {
    if params.len() != NH3_NPARS {
        return Err(Error::shape(format!(
            "ammonia model takes {} parameters, got {}",
            NH3_NPARS,
            params.len()
        )));
    }
    Ok(())
}

/// Rayleigh-Jeans-corrected radiation temperature of a blackbody.
fn radiation_temperature(t: f64, nu: f64) -> f64 {
    let x = H_OVER_K * nu;
    x / ((x / t).exp_m1())
}

/// Fraction of the total column sitting in this line's upper level:
/// species fraction times the Boltzmann population within the species.
fn level_weight(line: Nh3Line, tkin: f64, fortho: f64) -> f64 {
    let species = |l: Nh3Line| l.is_ortho() == line.is_ortho();
    let partition: f64 = Nh3Line::ALL
        .iter()
        .filter(|&&l| species(l))
        .map(|&l| l.degeneracy() * (-l.energy_k() / tkin).exp())
        .sum();
    if partition <= 0.0 {
        return 0.0;
    }
    let fraction = if line.is_ortho() { fortho } else { 1.0 - fortho };
    fraction * line.degeneracy() * (-line.energy_k() / tkin).exp() / partition
}

/// Brightness temperature of one line over a velocity axis [km/s].
pub fn ammonia_line(
    x_kms: &Array1<f64>,
    line: Nh3Line,
    params: &[f64],
    thin: bool,
) -> Array1<f32> {
    let (tkin, tex, log_column, width, vcenter, fortho) = (
        params[0], params[1], params[2], params[3], params[4], params[5],
    );
    if width <= 0.0 || tex <= 0.0 || tkin <= 0.0 {
        return Array1::zeros(x_kms.len());
    }

    let column = 10f64.powf(log_column);
    let tau_total =
        column * level_weight(line, tkin, fortho) / (width * tex * TAU_COLUMN_SCALE);

    let nu = line.rest_frequency();
    let contrast = radiation_temperature(tex, nu) - radiation_temperature(T_BACKGROUND, nu);
    let groups = line.hyperfine_groups();
    let w2 = 2.0 * width * width;

    x_kms.mapv(|v| {
        let mut tau = 0.0;
        for &(voff, weight) in groups {
            let d = v - vcenter - voff;
            tau += weight * (-d * d / w2).exp();
        }
        tau *= tau_total;
        let tb = if thin {
            contrast * tau
        } else {
            contrast * (1.0 - (-tau).exp())
        };
        tb as f32
    })
}

/// Evaluate several lines on a concatenated velocity axis. Segment lengths
/// must sum to the axis length (checked by the caller).
pub fn ammonia_bands(
    x_kms: &Array1<f64>,
    bands: &[(Nh3Line, usize)],
    params: &[f64],
    thin: bool,
) -> Array1<f32> {
    let mut out = Array1::<f32>::zeros(x_kms.len());
    let mut start = 0usize;
    for &(line, n) in bands {
        let segment = x_kms.slice(ndarray::s![start..start + n]).to_owned();
        let model = ammonia_line(&segment, line, params, thin);
        out.slice_mut(ndarray::s![start..start + n]).assign(&model);
        start += n;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    const PARAMS: [f64; 6] = [15.0, 6.0, 14.8, 0.8, 0.0, 0.5];

    fn axis() -> Array1<f64> {
        Array1::linspace(-30.0, 30.0, 601)
    }

    #[test]
    fn test_main_group_is_brightest() {
        let x = axis();
        let model = ammonia_line(&x, Nh3Line::OneOne, &PARAMS, false);
        let peak_idx = model
            .iter()
            .enumerate()
            .max_by(|a, b| a.1.partial_cmp(b.1).unwrap())
            .unwrap()
            .0;
        assert!((x[peak_idx]).abs() < 0.2);
    }

    #[test]
    fn test_satellites_present_for_oneone() {
        let x = axis();
        let model = ammonia_line(&x, Nh3Line::OneOne, &PARAMS, false);
        // Channel nearest the inner satellite at +7.56 km/s.
        let idx = x
            .iter()
            .enumerate()
            .min_by(|a, b| {
                (a.1 - 7.56).abs().partial_cmp(&(b.1 - 7.56).abs()).unwrap()
            })
            .unwrap()
            .0;
        assert!(model[idx] > 0.0);
        assert!(model[idx] < model[300]);
    }

    #[test]
    fn test_thin_scales_linearly_with_column() {
        let x = axis();
        let mut lo = PARAMS;
        lo[2] = 13.0;
        let mut hi = PARAMS;
        hi[2] = 14.0;
        let model_lo = ammonia_line(&x, Nh3Line::OneOne, &lo, true);
        let model_hi = ammonia_line(&x, Nh3Line::OneOne, &hi, true);
        let ratio = model_hi[300] / model_lo[300];
        assert!((ratio - 10.0).abs() < 1e-3, "ratio {}", ratio);
    }

    #[test]
    fn test_thick_saturates_below_contrast() {
        let x = axis();
        let mut hot = PARAMS;
        hot[2] = 17.0; // very optically thick
        let model = ammonia_line(&x, Nh3Line::OneOne, &hot, false);
        let nu = Nh3Line::OneOne.rest_frequency();
        let contrast =
            radiation_temperature(PARAMS[1], nu) - radiation_temperature(T_BACKGROUND, nu);
        assert!(model[300] as f64 <= contrast + 1e-6);
        assert!(model[300] as f64 > 0.9 * contrast);
    }

    #[test]
    fn test_level_weights_partition() {
        // Para weights sum to the para fraction.
        let total: f64 = [Nh3Line::OneOne, Nh3Line::TwoTwo, Nh3Line::FourFour]
            .iter()
            .map(|&l| level_weight(l, 20.0, 0.3))
            .sum();
        assert!((total - 0.7).abs() < 1e-9);
        assert!((level_weight(Nh3Line::ThreeThree, 20.0, 0.3) - 0.3).abs() < 1e-9);
    }

    #[test]
    fn test_bands_concatenate_segments() {
        let x1 = Array1::linspace(-30.0, 30.0, 61);
        let x = ndarray::concatenate![ndarray::Axis(0), x1.view(), x1.view()];
        let bands = [(Nh3Line::OneOne, 61), (Nh3Line::TwoTwo, 61)];
        let model = ammonia_bands(&x, &bands, &PARAMS, false);
        let one = ammonia_line(&x1, Nh3Line::OneOne, &PARAMS, false);
        let two = ammonia_line(&x1, Nh3Line::TwoTwo, &PARAMS, false);
        for i in 0..61 {
            assert!((model[i] - one[i]).abs() < 1e-6);
            assert!((model[61 + i] - two[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_invalid_width_yields_zeros() {
        let x = axis();
        let mut bad = PARAMS;
        bad[3] = 0.0;
        let model = ammonia_line(&x, Nh3Line::OneOne, &bad, false);
        assert!(model.iter().all(|&v| v == 0.0));
    }
}
