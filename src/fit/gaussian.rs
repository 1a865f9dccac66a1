use ndarray::Array1;

const SQRT_TAU: f64 = 2.506_628_274_631_000_5; // sqrt(2 pi)

/// Single Gaussian profile over axis values.
pub fn gaussian(x: &Array1<f64>, amplitude: f64, center: f64, width: f64) -> Array1<f32> {
    let w2 = 2.0 * width * width;
    x.mapv(|v| {
        let d = v - center;
        (amplitude * (-d * d / w2).exp()) as f32
    })
}

/// Sum of Gaussian components, parameters in (amplitude, center, width)
/// triples.
pub fn multi_gaussian(x: &Array1<f64>, params: &[f64]) -> Array1<f32> {
    let mut out = Array1::<f32>::zeros(x.len());
    for triple in params.chunks_exact(3) {
        let w2 = 2.0 * triple[2] * triple[2];
        if w2 == 0.0 {
            continue;
        }
        for (o, &v) in out.iter_mut().zip(x.iter()) {
            let d = v - triple[1];
            *o += (triple[0] * (-d * d / w2).exp()) as f32;
        }
    }
    out
}

/// Closed-form integral of a sum of Gaussians.
pub fn analytic_integral(params: &[f64]) -> f64 {
    params
        .chunks_exact(3)
        .map(|t| t[0] * t[2].abs() * SQRT_TAU)
        .sum()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_peak_value_and_symmetry() {
        let x = Array1::linspace(-10.0, 10.0, 21);
        let g = gaussian(&x, 3.0, 0.0, 2.0);
        assert!((g[10] - 3.0).abs() < 1e-6);
        assert!((g[8] - g[12]).abs() < 1e-6);
    }

    #[test]
    fn test_multi_gaussian_sums_components() {
        let x = Array1::linspace(-10.0, 10.0, 21);
        let params = [1.0, -5.0, 1.0, 2.0, 5.0, 1.0];
        let g = multi_gaussian(&x, &params);
        let single_a = gaussian(&x, 1.0, -5.0, 1.0);
        let single_b = gaussian(&x, 2.0, 5.0, 1.0);
        for i in 0..x.len() {
            assert!((g[i] - single_a[i] - single_b[i]).abs() < 1e-6);
        }
    }

    #[test]
    fn test_analytic_integral() {
        let params = [2.0, 0.0, 3.0];
        assert!((analytic_integral(&params) - 2.0 * 3.0 * SQRT_TAU).abs() < 1e-12);
        // Negative width still yields a positive area.
        let params = [2.0, 0.0, -3.0];
        assert!(analytic_integral(&params) > 0.0);
    }
}
